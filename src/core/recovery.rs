//! 错误恢复引擎
//!
//! 根据 HandlerError 类型返回 RecoveryAction，供 Handler Runtime 决定是纠正重试、把错误当作观察，还是结束 handler。

use crate::core::{HandlerError, RecoveryAction};
use crate::handlers::CapabilityError;

/// 将 handler 内部错误映射为可执行动作（纠正提示 / 观察 / 结束）
#[derive(Debug, Default, Clone, Copy)]
pub struct RecoveryEngine;

impl RecoveryEngine {
    pub fn new() -> Self {
        Self
    }

    /// handler_name 仅用于生成面向用户的失败说明
    pub fn handle(&self, err: &HandlerError, handler_name: &str) -> RecoveryAction {
        match err {
            HandlerError::MalformedAction(raw) => RecoveryAction::RetryWithPrompt(format!(
                "Your last output could not be parsed ({raw}). \
                 Reply with either\n\
                 Action: <action name>\nAction Input: <JSON object>\n\
                 or\n\
                 Final Answer: <answer for the user>"
            )),
            HandlerError::UnknownAction { action, allowed } => {
                RecoveryAction::RetryWithPrompt(format!(
                    "'{action}' is not an available action. Choose one of: {}.",
                    allowed.join(", ")
                ))
            }
            HandlerError::Capability(CapabilityError::Rejected(reason)) => {
                RecoveryAction::Observe(format!("Error: {reason}"))
            }
            HandlerError::Capability(CapabilityError::Timeout(_)) => RecoveryAction::Conclude(
                format!("Sorry, {handler_name} did not get a response in time. Please try again later."),
            ),
            HandlerError::Capability(CapabilityError::Unavailable(_)) => RecoveryAction::Conclude(
                format!("Sorry, {handler_name} cannot reach its service right now. Please try again later."),
            ),
            HandlerError::Model(_) => RecoveryAction::Conclude(format!(
                "Sorry, {handler_name} could not finish reasoning about your request."
            )),
            HandlerError::BudgetExhausted { budget } => RecoveryAction::Conclude(format!(
                "Sorry, {handler_name} could not complete the request within {budget} steps."
            )),
        }
    }
}

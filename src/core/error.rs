//! 编排错误类型与恢复动作
//!
//! OrchestrationError 是对调用方可见的请求级错误；HandlerError 只在 Handler Runtime 内部出现，
//! 由 RecoveryEngine 映射为 RecoveryAction 在本地消化，不会中止编排。

use thiserror::Error;

use crate::handlers::CapabilityError;
use crate::llm::LlmError;
use crate::memory::ThreadId;

/// 编排过程中可能出现的错误
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum OrchestrationError {
    /// 输入缺失或格式错误（如空消息、快照中没有用户消息）
    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Thread not found: {0}")]
    NotFound(ThreadId),

    /// 同一会话已有进行中的轮次
    #[error("Thread {0} is busy with another turn")]
    Conflict(ThreadId),

    #[error("Capability failure in {handler}: {reason}")]
    CapabilityFailure { handler: String, reason: String },

    #[error("Routing ambiguous: {0}")]
    RoutingAmbiguous(String),

    #[error("Budget exceeded: {0}")]
    BudgetExceeded(String),

    /// 存储后端不可用（可重试）
    #[error("Thread store unavailable: {0}")]
    StoreUnavailable(String),

    /// 路由阶段模型调用失败（可重试）
    #[error("Model unavailable: {0}")]
    ModelUnavailable(String),

    #[error("Timed out: {0}")]
    Timeout(String),

    #[error("Cancelled")]
    Cancelled,
}

impl OrchestrationError {
    /// 调用方稍后重试是否可能成功
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            OrchestrationError::StoreUnavailable(_)
                | OrchestrationError::ModelUnavailable(_)
                | OrchestrationError::Timeout(_)
                | OrchestrationError::Conflict(_)
        )
    }

    /// 稳定的错误类别名，用于日志与 HTTP 响应
    pub fn kind(&self) -> &'static str {
        match self {
            OrchestrationError::InvalidState(_) => "invalid_state",
            OrchestrationError::NotFound(_) => "not_found",
            OrchestrationError::Conflict(_) => "conflict",
            OrchestrationError::CapabilityFailure { .. } => "capability_failure",
            OrchestrationError::RoutingAmbiguous(_) => "routing_ambiguous",
            OrchestrationError::BudgetExceeded(_) => "budget_exceeded",
            OrchestrationError::StoreUnavailable(_) => "store_unavailable",
            OrchestrationError::ModelUnavailable(_) => "model_unavailable",
            OrchestrationError::Timeout(_) => "timeout",
            OrchestrationError::Cancelled => "cancelled",
        }
    }
}

impl From<LlmError> for OrchestrationError {
    fn from(e: LlmError) -> Self {
        match e {
            LlmError::Timeout => OrchestrationError::Timeout("model call".to_string()),
            other => OrchestrationError::ModelUnavailable(other.to_string()),
        }
    }
}

/// Handler Runtime 内部错误，全部在本地恢复
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum HandlerError {
    /// 推理输出无法解析为动作请求或最终回答
    #[error("Malformed action request: {0}")]
    MalformedAction(String),

    /// 请求了 action_schema 之外的动作
    #[error("Unknown action: {action}")]
    UnknownAction { action: String, allowed: Vec<String> },

    #[error(transparent)]
    Capability(#[from] CapabilityError),

    #[error("Reasoning step failed: {0}")]
    Model(#[from] LlmError),

    #[error("Step budget of {budget} exhausted")]
    BudgetExhausted { budget: usize },
}

/// 恢复引擎根据错误类型给出的建议动作
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecoveryAction {
    /// 将纠正提示作为 Observation 注入下一轮推理
    RetryWithPrompt(String),
    /// 把能力返回的错误原样作为 Observation，由模型决定下一步
    Observe(String),
    /// 结束 handler，以给定文本作为面向用户的失败说明
    Conclude(String),
}

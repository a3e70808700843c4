//! Handler Runtime：有界 ReAct 循环
//!
//! Reasoning -> Acting -> Observing -> (Reasoning | Done | Failed)。
//! 每次 Reasoning→Acting 消耗一个 step（解析失败、未知动作同样计数），超过 step_budget 即 Failed。
//! Runtime 不接触 ThreadStore：输入快照，输出恰好一个 HandlerResult，由编排器负责追加。

use std::sync::Arc;
use std::time::Duration;

use tokio::time::timeout;

use crate::core::{HandlerError, OrchestrationError, RecoveryAction, RecoveryEngine};
use crate::handlers::{CapabilityExecutor, HandlerDescriptor};
use crate::llm::{ChatMessage, LlmClient, LlmError};
use crate::memory::{MessageDraft, ThreadSnapshot};
use crate::react::events::{send_event, EventSender, TurnEvent};
use crate::react::planner::{parse_reasoning, Planner, ReasoningStep};

/// 默认单次推理超时
pub const DEFAULT_REASONING_TIMEOUT: Duration = Duration::from_secs(60);
/// Observation 预览最大字符数
const OBSERVATION_PREVIEW_CHARS: usize = 200;

/// handler 结束方式
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandlerOutcome {
    Done,
    Failed,
}

/// 一次 handler 调用的结果，对应会话中的一条 handler_result 消息
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandlerResult {
    pub origin: String,
    pub content: String,
    pub outcome: HandlerOutcome,
    /// 实际消耗的 Reasoning→Acting 次数
    pub cycles: usize,
}

impl HandlerResult {
    pub fn succeeded(&self) -> bool {
        self.outcome == HandlerOutcome::Done
    }

    pub fn to_draft(&self) -> MessageDraft {
        MessageDraft::handler_result(self.origin.clone(), self.content.clone())
    }
}

/// Handler 运行时（与具体会话无关，可在多个会话间共享）
pub struct HandlerRuntime {
    planner: Planner,
    executor: CapabilityExecutor,
    recovery: RecoveryEngine,
    reasoning_timeout: Duration,
}

impl HandlerRuntime {
    pub fn new(llm: Arc<dyn LlmClient>, executor: CapabilityExecutor) -> Self {
        Self {
            planner: Planner::new(llm),
            executor,
            recovery: RecoveryEngine::new(),
            reasoning_timeout: DEFAULT_REASONING_TIMEOUT,
        }
    }

    pub fn with_reasoning_timeout(mut self, timeout: Duration) -> Self {
        self.reasoning_timeout = timeout;
        self
    }

    pub async fn run(&self, handler: &HandlerDescriptor, snapshot: &ThreadSnapshot) -> HandlerResult {
        self.run_with_events(handler, snapshot, None).await
    }

    pub(crate) async fn run_with_events(
        &self,
        handler: &HandlerDescriptor,
        snapshot: &ThreadSnapshot,
        events: Option<&EventSender>,
    ) -> HandlerResult {
        let transcript = snapshot.transcript();
        let mut scratchpad: Vec<ChatMessage> = Vec::new();
        let mut cycles = 0usize;

        let result = loop {
            let output = match timeout(
                self.reasoning_timeout,
                self.planner.reason(handler, &transcript, &scratchpad),
            )
            .await
            {
                Ok(Ok(o)) => o,
                Ok(Err(e)) => break self.fail(handler, HandlerError::Model(e), cycles),
                Err(_) => break self.fail(handler, HandlerError::Model(LlmError::Timeout), cycles),
            };

            let step = match parse_reasoning(&output) {
                Ok(ReasoningStep::FinalAnswer(answer)) if answer.trim().is_empty() => Err(
                    HandlerError::MalformedAction("final answer is empty".to_string()),
                ),
                Ok(ReasoningStep::FinalAnswer(answer)) => {
                    break HandlerResult {
                        origin: handler.name.clone(),
                        content: answer,
                        outcome: HandlerOutcome::Done,
                        cycles,
                    };
                }
                Ok(ReasoningStep::Act(req)) => Ok(req),
                Err(e) => Err(e),
            };

            if cycles >= handler.step_budget {
                break self.fail(
                    handler,
                    HandlerError::BudgetExhausted {
                        budget: handler.step_budget,
                    },
                    cycles,
                );
            }
            cycles += 1;

            let request = match step {
                Ok(req) if handler.action(&req.action).is_some() => req,
                Ok(req) => {
                    let err = HandlerError::UnknownAction {
                        action: req.action,
                        allowed: handler.action_names(),
                    };
                    self.observe_error(handler, &err, output, &mut scratchpad);
                    continue;
                }
                Err(err) => {
                    self.observe_error(handler, &err, output, &mut scratchpad);
                    continue;
                }
            };

            send_event(
                events,
                TurnEvent::ActionRequested {
                    handler: handler.name.clone(),
                    action: request.action.clone(),
                    arguments: request.arguments.clone(),
                },
            );
            match self
                .executor
                .execute(handler, &request.action, request.arguments)
                .await
            {
                Ok(observation) => {
                    send_event(
                        events,
                        TurnEvent::Observation {
                            handler: handler.name.clone(),
                            action: request.action.clone(),
                            preview: preview(&observation),
                        },
                    );
                    scratchpad.push(ChatMessage::assistant(output));
                    scratchpad.push(ChatMessage::user(format!("Observation: {}", observation)));
                }
                Err(e) => {
                    let err = HandlerError::Capability(e);
                    match self.recovery.handle(&err, &handler.name) {
                        RecoveryAction::Observe(text) | RecoveryAction::RetryWithPrompt(text) => {
                            tracing::warn!(handler = %handler.name, action = %request.action, error = %err, "capability rejected, observing");
                            scratchpad.push(ChatMessage::assistant(output));
                            scratchpad.push(ChatMessage::user(format!("Observation: {}", text)));
                        }
                        RecoveryAction::Conclude(message) => {
                            let failure = OrchestrationError::CapabilityFailure {
                                handler: handler.name.clone(),
                                reason: err.to_string(),
                            };
                            tracing::warn!(action = %request.action, error = %failure, kind = failure.kind(), "capability failed");
                            break HandlerResult {
                                origin: handler.name.clone(),
                                content: message,
                                outcome: HandlerOutcome::Failed,
                                cycles,
                            };
                        }
                    }
                }
            }
        };

        tracing::info!(
            handler = %result.origin,
            outcome = ?result.outcome,
            cycles = result.cycles,
            total_tokens = self.planner.token_usage().2,
            "handler finished"
        );
        send_event(
            events,
            TurnEvent::HandlerFinished {
                handler: result.origin.clone(),
                succeeded: result.succeeded(),
                cycles: result.cycles,
            },
        );
        result
    }

    /// 解析失败 / 未知动作：把纠正提示作为 Observation 交还给模型
    fn observe_error(
        &self,
        handler: &HandlerDescriptor,
        err: &HandlerError,
        output: String,
        scratchpad: &mut Vec<ChatMessage>,
    ) {
        tracing::debug!(handler = %handler.name, error = %err, "reasoning output not actionable");
        let note = match self.recovery.handle(err, &handler.name) {
            RecoveryAction::RetryWithPrompt(n) | RecoveryAction::Observe(n) | RecoveryAction::Conclude(n) => n,
        };
        scratchpad.push(ChatMessage::assistant(output));
        scratchpad.push(ChatMessage::user(format!("Observation: {}", note)));
    }

    fn fail(&self, handler: &HandlerDescriptor, err: HandlerError, cycles: usize) -> HandlerResult {
        tracing::warn!(handler = %handler.name, error = %err, "handler failed");
        let content = match self.recovery.handle(&err, &handler.name) {
            RecoveryAction::Conclude(m) | RecoveryAction::RetryWithPrompt(m) | RecoveryAction::Observe(m) => m,
        };
        HandlerResult {
            origin: handler.name.clone(),
            content,
            outcome: HandlerOutcome::Failed,
            cycles,
        }
    }
}

fn preview(s: &str) -> String {
    if s.chars().count() > OBSERVATION_PREVIEW_CHARS {
        format!("{}...", s.chars().take(OBSERVATION_PREVIEW_CHARS).collect::<String>())
    } else {
        s.to_string()
    }
}

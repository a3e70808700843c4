//! 编排器：单个用户轮次的主控循环
//!
//! AwaitingUser -> Routing -> (Executing -> Routing)* -> Terminated。
//! 每一步都先成功追加到 ThreadStore 再进入下一步；会话写租约在整轮内持有，轮次结束或被取消时释放。

use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::core::{
    OrchestrationError, Router, RouterDecision, TurnMachine, TurnPhase,
};
use crate::handlers::{HandlerDescriptor, HandlerRegistry};
use crate::memory::{MessageDraft, Role, Thread, ThreadId, ThreadSnapshot, ThreadStore, TurnLease};
use crate::react::events::{send_event, EventSender, TurnEvent};
use crate::react::HandlerRuntime;

/// 每轮默认最多 Routing→Executing 往返次数
pub const DEFAULT_MAX_ROUND_TRIPS: usize = 5;
/// FINISH 时既无直接回复、本轮也没有 handler 结果
pub const NO_RESPONSE: &str = "No response generated";
/// 达到往返上限时的兜底回复
pub const CEILING_FALLBACK: &str =
    "I couldn't finish this request within the allowed number of steps.";

/// 一轮的结果
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TurnOutcome {
    pub response: String,
    pub thread_id: ThreadId,
    /// 本轮实际执行的 handler 次数
    pub round_trips: usize,
    /// 是否因往返上限被强制终止
    pub forced: bool,
}

/// 一次轮次调用的参数（消息、会话 ID、取消令牌、事件通道）
pub struct TurnSession<'a> {
    pub message: &'a str,
    pub thread_id: Option<&'a str>,
    pub cancel_token: CancellationToken,
    pub event_tx: Option<&'a EventSender>,
}

impl<'a> TurnSession<'a> {
    pub fn new(message: &'a str) -> Self {
        Self {
            message,
            thread_id: None,
            cancel_token: CancellationToken::new(),
            event_tx: None,
        }
    }

    pub fn with_thread_id(mut self, thread_id: Option<&'a str>) -> Self {
        self.thread_id = thread_id;
        self
    }

    pub fn with_cancel_token(mut self, token: CancellationToken) -> Self {
        self.cancel_token = token;
        self
    }

    pub fn with_event_tx(mut self, tx: &'a EventSender) -> Self {
        self.event_tx = Some(tx);
        self
    }
}

/// 编排状态机
pub struct Orchestrator {
    store: Arc<dyn ThreadStore>,
    registry: Arc<HandlerRegistry>,
    router: Router,
    runtime: HandlerRuntime,
    max_round_trips: usize,
}

impl Orchestrator {
    pub fn new(
        store: Arc<dyn ThreadStore>,
        registry: Arc<HandlerRegistry>,
        router: Router,
        runtime: HandlerRuntime,
    ) -> Self {
        Self {
            store,
            registry,
            router,
            runtime,
            max_round_trips: DEFAULT_MAX_ROUND_TRIPS,
        }
    }

    pub fn with_max_round_trips(mut self, max_round_trips: usize) -> Self {
        self.max_round_trips = max_round_trips;
        self
    }

    pub fn store(&self) -> &Arc<dyn ThreadStore> {
        &self.store
    }

    pub fn registry(&self) -> &HandlerRegistry {
        &self.registry
    }

    /// 读取会话（API 层的历史查询）
    pub async fn thread(&self, thread_id: &str) -> Result<Thread, OrchestrationError> {
        self.store.get(thread_id).await
    }

    /// 处理一条用户消息；thread_id 为 None 时新建会话
    pub async fn handle_turn(
        &self,
        message: &str,
        thread_id: Option<&str>,
    ) -> Result<TurnOutcome, OrchestrationError> {
        self.handle_turn_with(TurnSession::new(message).with_thread_id(thread_id))
            .await
    }

    /// 同 handle_turn，支持取消与事件推送；取消时丢弃进行中的步骤并释放租约
    pub async fn handle_turn_with(
        &self,
        session: TurnSession<'_>,
    ) -> Result<TurnOutcome, OrchestrationError> {
        let cancel = session.cancel_token.clone();
        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                tracing::warn!(thread_id = ?session.thread_id, "turn cancelled");
                Err(OrchestrationError::Cancelled)
            }
            r = self.run_turn(&session) => r,
        }
    }

    async fn run_turn(&self, session: &TurnSession<'_>) -> Result<TurnOutcome, OrchestrationError> {
        let events = session.event_tx;
        let message = session.message.trim();
        if message.is_empty() {
            return Err(OrchestrationError::InvalidState(
                "message must not be empty".to_string(),
            ));
        }

        // AwaitingUser：加载或创建会话
        let thread_id = match session.thread_id {
            Some(id) => self.store.get(id).await?.id,
            None => self.store.create().await?.id,
        };
        let lease = self.store.lease(&thread_id).await?;
        send_event(events, TurnEvent::TurnStarted { thread_id: thread_id.clone() });

        // 同一条消息的上一次轮次中途失败：从检查点续跑，不重复追加用户消息
        let checkpoint = self.store.checkpoint(&thread_id).await?;
        let resuming = is_unfinished_turn(&checkpoint, message);
        let mut machine = if resuming {
            let completed = checkpoint
                .current_turn()
                .iter()
                .filter(|m| m.role == Role::HandlerResult)
                .count();
            tracing::info!(
                thread_id = %thread_id,
                completed_round_trips = completed,
                "resuming unfinished turn from checkpoint"
            );
            TurnMachine::resume(self.max_round_trips, completed)
        } else {
            TurnMachine::new(self.max_round_trips)
        };
        self.store.set_active(&lease, true).await?;
        if !resuming {
            self.store.append(&lease, MessageDraft::user(message)).await?;
        }
        machine.advance(TurnPhase::Routing)?;

        loop {
            let snapshot = self.store.checkpoint(&thread_id).await?;
            let last_result = snapshot.last_turn_result().map(|m| m.content.clone());

            if machine.ceiling_reached() {
                tracing::warn!(
                    thread_id = %thread_id,
                    round_trips = machine.round_trips(),
                    "round-trip ceiling reached, forcing termination"
                );
                send_event(events, TurnEvent::CeilingReached { round_trips: machine.round_trips() });
                let response = match last_result {
                    Some(r) => format!("{}\n\n{}", CEILING_FALLBACK, r),
                    None => CEILING_FALLBACK.to_string(),
                };
                self.store.append(&lease, MessageDraft::assistant(response.clone())).await?;
                return self
                    .terminate(&lease, &mut machine, thread_id, response, true, events)
                    .await;
            }

            // 路由标记已落盘但结果缺失：直接重跑该 handler，不再重新路由
            if let Some(handler) = snapshot.pending_route().and_then(|name| self.registry.get(name)) {
                tracing::info!(thread_id = %thread_id, handler = %handler.name, "re-running interrupted handler");
                machine.advance(TurnPhase::Executing { handler: handler.name.clone() })?;
                self.run_handler(&lease, &thread_id, handler, events).await?;
                machine.advance(TurnPhase::Routing)?;
                continue;
            }

            let decision = self.router.decide_with_events(&snapshot, events).await?;
            tracing::info!(
                thread_id = %thread_id,
                next = %decision.next(),
                round_trip = machine.round_trips(),
                "routed"
            );
            send_event(
                events,
                TurnEvent::Routed {
                    next: decision.next().to_string(),
                    round_trip: machine.round_trips(),
                },
            );

            match decision {
                RouterDecision::Finish { direct_reply } => {
                    let response = match direct_reply {
                        Some(reply) => {
                            self.store.append(&lease, MessageDraft::assistant(reply.clone())).await?;
                            reply
                        }
                        None => last_result.unwrap_or_else(|| NO_RESPONSE.to_string()),
                    };
                    return self
                        .terminate(&lease, &mut machine, thread_id, response, false, events)
                        .await;
                }
                RouterDecision::Route(name) => {
                    let handler = self.registry.get(&name).ok_or_else(|| {
                        OrchestrationError::InvalidState(format!("handler '{}' is not registered", name))
                    })?;
                    machine.advance(TurnPhase::Executing { handler: name.clone() })?;
                    self.store.append(&lease, MessageDraft::route_marker(&name)).await?;
                    self.run_handler(&lease, &thread_id, handler, events).await?;
                    machine.advance(TurnPhase::Routing)?;
                }
            }
        }
    }

    /// Executing：在最新检查点上运行 handler，并追加恰好一条结果消息
    async fn run_handler(
        &self,
        lease: &TurnLease,
        thread_id: &str,
        handler: &HandlerDescriptor,
        events: Option<&EventSender>,
    ) -> Result<(), OrchestrationError> {
        let snapshot = self.store.checkpoint(thread_id).await?;
        let result = self.runtime.run_with_events(handler, &snapshot, events).await;
        self.store.append(lease, result.to_draft()).await?;
        Ok(())
    }

    async fn terminate(
        &self,
        lease: &TurnLease,
        machine: &mut TurnMachine,
        thread_id: ThreadId,
        response: String,
        forced: bool,
        events: Option<&EventSender>,
    ) -> Result<TurnOutcome, OrchestrationError> {
        machine.advance(TurnPhase::Terminated)?;
        self.store.set_active(lease, false).await?;
        tracing::info!(
            thread_id = %thread_id,
            round_trips = machine.round_trips(),
            forced,
            "turn finished"
        );
        send_event(
            events,
            TurnEvent::TurnFinished {
                thread_id: thread_id.clone(),
                round_trips: machine.round_trips(),
            },
        );
        Ok(TurnOutcome {
            response,
            thread_id,
            round_trips: machine.round_trips(),
            forced,
        })
    }
}

/// 会话仍处于活动状态、最后一条用户消息与本次相同且本轮尚未给出回复
fn is_unfinished_turn(snapshot: &ThreadSnapshot, message: &str) -> bool {
    snapshot.active
        && snapshot
            .last_user_message()
            .is_some_and(|m| m.content == message)
        && !snapshot
            .current_turn()
            .iter()
            .any(|m| m.role == Role::Assistant)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::TaskScheduler;
    use crate::handlers::{ActionSpec, Capability, CapabilityError, CapabilityExecutor, HandlerDescriptor};
    use crate::llm::{ChatMessage, LlmClient, LlmError, ScriptedLlmClient};
    use crate::memory::{InMemoryThreadStore, Role};
    use async_trait::async_trait;
    use serde_json::Value;
    use std::time::Duration;

    struct Plot;

    #[async_trait]
    impl Capability for Plot {
        fn name(&self) -> &str {
            "plot"
        }

        async fn invoke(&self, _action: &str, _arguments: Value) -> Result<String, CapabilityError> {
            Ok("a dream heist".to_string())
        }
    }

    /// 永不返回的模型，用于取消测试
    struct Hanging;

    #[async_trait]
    impl LlmClient for Hanging {
        async fn complete(&self, _messages: &[ChatMessage]) -> Result<String, LlmError> {
            tokio::time::sleep(Duration::from_secs(30)).await;
            Err(LlmError::Timeout)
        }
    }

    fn build(router_llm: Arc<dyn LlmClient>, handler_llm: Arc<dyn LlmClient>) -> (Orchestrator, Arc<InMemoryThreadStore>) {
        let mut reg = HandlerRegistry::new();
        reg.register(
            HandlerDescriptor::new("knowledge_handler", "movie facts", Arc::new(Plot))
                .with_action(ActionSpec::new("search_knowledge", "")),
        )
        .unwrap();
        let registry = Arc::new(reg);
        let store = Arc::new(InMemoryThreadStore::new());
        let router = Router::new(router_llm, registry.clone());
        let runtime = HandlerRuntime::new(
            handler_llm,
            CapabilityExecutor::new(Arc::new(TaskScheduler::default())),
        );
        (Orchestrator::new(store.clone(), registry, router, runtime), store)
    }

    #[tokio::test]
    async fn test_empty_message_is_invalid_and_creates_nothing() {
        let llm = Arc::new(ScriptedLlmClient::default());
        let (orch, store) = build(llm.clone(), llm);
        let err = orch.handle_turn("   ", None).await.unwrap_err();
        assert!(matches!(err, OrchestrationError::InvalidState(_)));
        assert!(store.is_empty().await);
    }

    #[tokio::test]
    async fn test_unknown_thread_is_not_found() {
        let llm = Arc::new(ScriptedLlmClient::default());
        let (orch, _store) = build(llm.clone(), llm);
        let err = orch.handle_turn("hi", Some("20240101_000000_deadbeef")).await.unwrap_err();
        assert_eq!(err, OrchestrationError::NotFound("20240101_000000_deadbeef".into()));
    }

    #[tokio::test]
    async fn test_direct_reply_is_appended() {
        let router = Arc::new(ScriptedLlmClient::new([r#"{"next": "FINISH", "reply": "Hello!"}"#]));
        let handlers = Arc::new(ScriptedLlmClient::default());
        let (orch, store) = build(router, handlers);
        let out = orch.handle_turn("hi", None).await.unwrap();
        assert_eq!(out.response, "Hello!");
        assert_eq!(out.round_trips, 0);
        let thread = store.get(&out.thread_id).await.unwrap();
        assert!(!thread.active);
        let roles: Vec<Role> = thread.messages.iter().map(|m| m.role).collect();
        assert_eq!(roles, vec![Role::User, Role::Assistant]);
    }

    #[tokio::test]
    async fn test_finish_without_anything_says_no_response() {
        let router = Arc::new(ScriptedLlmClient::new([r#"{"next": "FINISH"}"#]));
        let (orch, store) = build(router, Arc::new(ScriptedLlmClient::default()));
        let out = orch.handle_turn("hi", None).await.unwrap();
        assert_eq!(out.response, NO_RESPONSE);
        assert_eq!(store.get(&out.thread_id).await.unwrap().messages.len(), 1);
    }

    #[tokio::test]
    async fn test_routing_model_failure_propagates_and_releases_lease() {
        let router = Arc::new(ScriptedLlmClient::default());
        router.push_error(LlmError::ApiError("down".into()));
        let (orch, store) = build(router, Arc::new(ScriptedLlmClient::default()));
        let thread = store.create().await.unwrap();
        let err = orch.handle_turn("hi", Some(&thread.id)).await.unwrap_err();
        assert!(err.is_retryable());
        assert!(store.lease(&thread.id).await.is_ok());
        let thread = store.get(&thread.id).await.unwrap();
        assert_eq!(thread.messages.len(), 1);
        assert_eq!(thread.messages[0].role, Role::User);
    }

    #[tokio::test]
    async fn test_retry_resumes_interrupted_handler_without_duplicates() {
        let router = Arc::new(ScriptedLlmClient::new([r#"{"next": "FINISH"}"#]));
        let handlers = Arc::new(ScriptedLlmClient::new(["Final Answer: a dream heist"]));
        let (orch, store) = build(router.clone(), handlers);
        let thread = store.create().await.unwrap();
        {
            // 上一次轮次在 handler 结果落盘前中断
            let lease = store.lease(&thread.id).await.unwrap();
            store.append(&lease, MessageDraft::user("Q")).await.unwrap();
            store
                .append(&lease, MessageDraft::route_marker("knowledge_handler"))
                .await
                .unwrap();
        }

        let out = orch.handle_turn("Q", Some(&thread.id)).await.unwrap();
        assert_eq!(out.response, "a dream heist");
        assert_eq!(out.round_trips, 1);
        assert_eq!(router.call_count(), 1);
        let after = store.get(&thread.id).await.unwrap();
        let roles: Vec<Role> = after.messages.iter().map(|m| m.role).collect();
        assert_eq!(roles, vec![Role::User, Role::System, Role::HandlerResult]);
        assert!(!after.active);
    }

    #[tokio::test]
    async fn test_new_message_on_unfinished_thread_starts_fresh_turn() {
        let router = Arc::new(ScriptedLlmClient::new([r#"{"next": "FINISH", "reply": "Hi again"}"#]));
        let (orch, store) = build(router, Arc::new(ScriptedLlmClient::default()));
        let thread = store.create().await.unwrap();
        {
            let lease = store.lease(&thread.id).await.unwrap();
            store.append(&lease, MessageDraft::user("Q")).await.unwrap();
        }
        orch.handle_turn("something else", Some(&thread.id)).await.unwrap();
        let after = store.get(&thread.id).await.unwrap();
        let users: Vec<&str> = after
            .messages
            .iter()
            .filter(|m| m.role == Role::User)
            .map(|m| m.content.as_str())
            .collect();
        assert_eq!(users, vec!["Q", "something else"]);
    }

    #[tokio::test]
    async fn test_repeated_message_after_finished_turn_is_a_new_turn() {
        let router = Arc::new(ScriptedLlmClient::new([
            r#"{"next": "FINISH", "reply": "one"}"#,
            r#"{"next": "FINISH", "reply": "two"}"#,
        ]));
        let (orch, store) = build(router, Arc::new(ScriptedLlmClient::default()));
        let first = orch.handle_turn("again", None).await.unwrap();
        orch.handle_turn("again", Some(&first.thread_id)).await.unwrap();
        let after = store.get(&first.thread_id).await.unwrap();
        assert_eq!(after.messages.len(), 4);
    }

    #[tokio::test]
    async fn test_cancel_releases_lease() {
        let (orch, store) = build(Arc::new(Hanging), Arc::new(Hanging));
        let thread = store.create().await.unwrap();
        let token = CancellationToken::new();
        let canceller = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            canceller.cancel();
        });
        let err = orch
            .handle_turn_with(
                TurnSession::new("What is Inception about?")
                    .with_thread_id(Some(&thread.id))
                    .with_cancel_token(token),
            )
            .await
            .unwrap_err();
        assert_eq!(err, OrchestrationError::Cancelled);
        assert!(store.lease(&thread.id).await.is_ok());
        let after = store.get(&thread.id).await.unwrap();
        assert_eq!(after.messages.len(), 1);
    }
}

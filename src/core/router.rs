//! Router：根据会话快照选择下一个 handler 或 FINISH
//!
//! Router 只读快照、不修改会话。模型输出按 `{"next": .., "reply": ..}` 解码；无法解析时带纠正提示重试一次，
//! 仍失败则回退为 FINISH + 致歉回复，保证编排不会因路由失败而卡死。

use std::sync::Arc;
use std::time::Duration;

use tokio::time::timeout;

use crate::core::OrchestrationError;
use crate::handlers::HandlerRegistry;
use crate::llm::{ChatMessage, LlmClient};
use crate::memory::ThreadSnapshot;
use crate::react::events::{send_event, EventSender, TurnEvent};
use crate::react::schema::{route_schema_json, RouteFormat};

/// 结束本轮的保留决策名
pub const FINISH: &str = "FINISH";

/// 路由两次都无法解析时返回给用户的回复
pub const ROUTING_APOLOGY: &str =
    "Sorry, I wasn't sure how to handle that request. Could you rephrase it?";

/// 默认路由调用超时
pub const DEFAULT_ROUTING_TIMEOUT: Duration = Duration::from_secs(60);

/// 路由决策：要么交给某个 handler，要么结束本轮（可附带直接回复）
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RouterDecision {
    Route(String),
    Finish { direct_reply: Option<String> },
}

impl RouterDecision {
    /// 决策目标名（handler 名或 FINISH）
    pub fn next(&self) -> &str {
        match self {
            RouterDecision::Route(h) => h,
            RouterDecision::Finish { .. } => FINISH,
        }
    }
}

/// 路由器
pub struct Router {
    llm: Arc<dyn LlmClient>,
    registry: Arc<HandlerRegistry>,
    timeout: Duration,
}

impl Router {
    pub fn new(llm: Arc<dyn LlmClient>, registry: Arc<HandlerRegistry>) -> Self {
        Self {
            llm,
            registry,
            timeout: DEFAULT_ROUTING_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub async fn decide(&self, snapshot: &ThreadSnapshot) -> Result<RouterDecision, OrchestrationError> {
        self.decide_with_events(snapshot, None).await
    }

    /// 同 decide，额外推送 RoutingRetry / RoutingFallback 事件
    pub(crate) async fn decide_with_events(
        &self,
        snapshot: &ThreadSnapshot,
        events: Option<&EventSender>,
    ) -> Result<RouterDecision, OrchestrationError> {
        if !snapshot.has_user_message() {
            return Err(OrchestrationError::InvalidState(format!(
                "thread {} has no user message to route",
                snapshot.thread_id
            )));
        }

        let mut messages = Vec::with_capacity(snapshot.len() + 3);
        messages.push(ChatMessage::system(self.system_prompt()));
        messages.extend(snapshot.transcript());

        let first = self.call(&messages).await?;
        let reason = match self.parse(&first) {
            Ok(decision) => return Ok(decision),
            Err(reason) => reason,
        };

        tracing::warn!(thread_id = %snapshot.thread_id, %reason, "router output invalid, retrying once");
        send_event(events, TurnEvent::RoutingRetry { reason: reason.clone() });
        messages.push(ChatMessage::assistant(first));
        messages.push(ChatMessage::user(self.corrective_note(&reason)));

        let second = self.call(&messages).await?;
        match self.parse(&second) {
            Ok(decision) => Ok(decision),
            Err(reason) => {
                let err = OrchestrationError::RoutingAmbiguous(reason.clone());
                tracing::warn!(thread_id = %snapshot.thread_id, error = %err, "router fell back to FINISH");
                send_event(events, TurnEvent::RoutingFallback { reason });
                Ok(RouterDecision::Finish {
                    direct_reply: Some(ROUTING_APOLOGY.to_string()),
                })
            }
        }
    }

    async fn call(&self, messages: &[ChatMessage]) -> Result<String, OrchestrationError> {
        match timeout(self.timeout, self.llm.complete(messages)).await {
            Ok(r) => r.map_err(OrchestrationError::from),
            Err(_) => Err(OrchestrationError::Timeout(format!(
                "routing call exceeded {} ms",
                self.timeout.as_millis()
            ))),
        }
    }

    /// 解码模型输出；Err 为无效原因
    fn parse(&self, output: &str) -> Result<RouterDecision, String> {
        let trimmed = output.trim();
        if trimmed.is_empty() {
            return Err("empty router output".to_string());
        }
        let route = match extract_json(trimmed) {
            Some(json) => serde_json::from_str::<RouteFormat>(json)
                .map_err(|e| format!("malformed router output: {}", e))?,
            None => RouteFormat {
                next: trimmed.to_string(),
                reply: None,
            },
        };
        let reply = route
            .reply
            .map(|r| r.trim().to_string())
            .filter(|r| !r.is_empty());
        let next = route.next.trim().trim_matches(|c| c == '"' || c == '\'' || c == '`');

        match self.resolve(next) {
            Some(name) if name == FINISH => Ok(RouterDecision::Finish { direct_reply: reply }),
            Some(name) => Ok(RouterDecision::Route(name)),
            None => Err(format!(
                "'{}' is not one of [{}, {}]",
                next,
                self.registry.names().join(", "),
                FINISH
            )),
        }
    }

    /// 精确 FINISH > 精确 handler 名 > 子串匹配
    ///
    /// 子串匹配时 FINISH 与各 handler 名一起比较：出现位置最靠前者胜，同位置取较长的名字，再按注册顺序。
    fn resolve(&self, next: &str) -> Option<String> {
        if next.eq_ignore_ascii_case(FINISH) {
            return Some(FINISH.to_string());
        }
        if let Some(h) = self.registry.get(next) {
            return Some(h.name.clone());
        }
        let upper = next.to_ascii_uppercase();
        let finish = upper.find(FINISH).map(|pos| (pos, FINISH));
        self.registry
            .iter()
            .filter_map(|h| next.find(h.name.as_str()).map(|pos| (pos, h.name.as_str())))
            .chain(finish)
            .min_by_key(|(pos, name)| (*pos, std::cmp::Reverse(name.len())))
            .map(|(_, name)| name.to_string())
    }

    fn system_prompt(&self) -> String {
        let mut team = String::new();
        for h in self.registry.iter() {
            team.push_str(&format!("- {}: {}\n", h.name, h.purpose));
        }
        format!(
            "You are the supervisor of a home theater management system with these specialist agents:\n\
             {team}\n\
             Routing rules:\n\
             1. Route to the agent whose expertise matches the user's latest request.\n\
             2. Route to {FINISH} when the task is complete, the user says goodbye or thanks, \
             or the latest agent result already answers the request. Do not route back to the \
             same agent when its last result is complete.\n\
             3. When you route to {FINISH} without any agent having answered, put your reply to the \
             user in \"reply\".\n\n\
             Respond with only a JSON object matching this schema:\n{schema}\n\
             \"next\" must be one of: {names}, {FINISH}.",
            names = self.registry.names().join(", "),
            schema = route_schema_json(),
        )
    }

    fn corrective_note(&self, reason: &str) -> String {
        format!(
            "Your previous answer was invalid ({reason}). Reply with only a JSON object like \
             {{\"next\": \"<name>\", \"reply\": null}} where <name> is one of: {}, {FINISH}.",
            self.registry.names().join(", ")
        )
    }
}

fn extract_json(trimmed: &str) -> Option<&str> {
    if let Some(start) = trimmed.find("```json") {
        let rest = &trimmed[start + 7..];
        return Some(rest.find("```").map(|end| rest[..end].trim()).unwrap_or(rest.trim()));
    }
    let start = trimmed.find('{')?;
    let end = trimmed.rfind('}')?;
    (end > start).then(|| &trimmed[start..=end])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handlers::{ActionSpec, Capability, CapabilityError, HandlerDescriptor};
    use crate::llm::{LlmError, ScriptedLlmClient};
    use crate::memory::{Message, MessageDraft, Thread};
    use async_trait::async_trait;
    use serde_json::Value;

    struct Noop;

    #[async_trait]
    impl Capability for Noop {
        fn name(&self) -> &str {
            "noop"
        }

        async fn invoke(&self, _action: &str, _arguments: Value) -> Result<String, CapabilityError> {
            Ok(String::new())
        }
    }

    fn registry(names: &[&str]) -> Arc<HandlerRegistry> {
        let mut reg = HandlerRegistry::new();
        for n in names {
            reg.register(
                HandlerDescriptor::new(*n, format!("{n} purpose"), Arc::new(Noop))
                    .with_action(ActionSpec::new("run", "")),
            )
            .unwrap();
        }
        Arc::new(reg)
    }

    fn snapshot_with_user() -> ThreadSnapshot {
        let mut t = Thread::new("t".into());
        t.push(MessageDraft::user("What is Inception about?"));
        t.snapshot()
    }

    fn router(llm: Arc<ScriptedLlmClient>, names: &[&str]) -> Router {
        Router::new(llm, registry(names))
    }

    #[tokio::test]
    async fn test_exact_route_and_finish() {
        let llm = Arc::new(ScriptedLlmClient::new([
            r#"{"next": "knowledge_handler"}"#,
            r#"{"next": "finish", "reply": "Hi there!"}"#,
            r#"{"next": "FINISH", "reply": "  "}"#,
        ]));
        let r = router(llm.clone(), &["knowledge_handler", "download_handler"]);
        let snap = snapshot_with_user();
        assert_eq!(
            r.decide(&snap).await.unwrap(),
            RouterDecision::Route("knowledge_handler".into())
        );
        assert_eq!(
            r.decide(&snap).await.unwrap(),
            RouterDecision::Finish {
                direct_reply: Some("Hi there!".into())
            }
        );
        assert_eq!(
            r.decide(&snap).await.unwrap(),
            RouterDecision::Finish { direct_reply: None }
        );
    }

    #[tokio::test]
    async fn test_prompt_lists_handlers_in_order() {
        let llm = Arc::new(ScriptedLlmClient::new([r#"{"next": "FINISH"}"#]));
        let r = router(llm.clone(), &["library_handler", "knowledge_handler"]);
        r.decide(&snapshot_with_user()).await.unwrap();
        let sent = llm.call(0).unwrap();
        let system = &sent[0].content;
        let lib = system.find("- library_handler:").unwrap();
        let know = system.find("- knowledge_handler:").unwrap();
        assert!(lib < know);
        assert_eq!(sent.last().unwrap().content, "What is Inception about?");
    }

    #[tokio::test]
    async fn test_tie_break_exact_then_registration_order() {
        let llm = Arc::new(ScriptedLlmClient::new([
            r#"{"next": "search_handler"}"#,
            r#"{"next": "route to search_handler_v2 or search_handler"}"#,
        ]));
        let r = router(llm, &["search_handler_v2", "search_handler"]);
        let snap = snapshot_with_user();
        assert_eq!(
            r.decide(&snap).await.unwrap(),
            RouterDecision::Route("search_handler".into())
        );
        assert_eq!(
            r.decide(&snap).await.unwrap(),
            RouterDecision::Route("search_handler_v2".into())
        );
    }

    #[tokio::test]
    async fn test_earliest_mention_wins_between_finish_and_handler() {
        let llm = Arc::new(ScriptedLlmClient::new([
            "FINISH, knowledge_handler already answered",
            "knowledge_handler, then finish",
            "done: finish",
        ]));
        let r = router(llm, &["knowledge_handler"]);
        let snap = snapshot_with_user();
        assert_eq!(
            r.decide(&snap).await.unwrap(),
            RouterDecision::Finish { direct_reply: None }
        );
        assert_eq!(
            r.decide(&snap).await.unwrap(),
            RouterDecision::Route("knowledge_handler".into())
        );
        assert_eq!(r.decide(&snap).await.unwrap().next(), FINISH);
    }

    #[tokio::test]
    async fn test_plain_name_and_fenced_json() {
        let llm = Arc::new(ScriptedLlmClient::new([
            "download_handler",
            "```json\n{\"next\": \"knowledge_handler\"}\n```",
        ]));
        let r = router(llm, &["knowledge_handler", "download_handler"]);
        let snap = snapshot_with_user();
        assert_eq!(r.decide(&snap).await.unwrap().next(), "download_handler");
        assert_eq!(r.decide(&snap).await.unwrap().next(), "knowledge_handler");
    }

    #[tokio::test]
    async fn test_retry_once_with_corrective_note() {
        let llm = Arc::new(ScriptedLlmClient::new([
            r#"{"next": "weather_handler"}"#,
            r#"{"next": "knowledge_handler"}"#,
        ]));
        let r = router(llm.clone(), &["knowledge_handler"]);
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let decision = r
            .decide_with_events(&snapshot_with_user(), Some(&tx))
            .await
            .unwrap();
        assert_eq!(decision, RouterDecision::Route("knowledge_handler".into()));
        assert_eq!(llm.call_count(), 2);
        let retry = llm.call(1).unwrap();
        assert!(retry.last().unwrap().content.contains("invalid"));
        assert!(matches!(rx.try_recv().unwrap(), TurnEvent::RoutingRetry { .. }));
    }

    #[tokio::test]
    async fn test_double_failure_falls_back_to_apology() {
        let llm = Arc::new(ScriptedLlmClient::new(["{broken", "still nothing useful"]));
        let r = router(llm.clone(), &["knowledge_handler"]);
        let decision = r.decide(&snapshot_with_user()).await.unwrap();
        assert_eq!(
            decision,
            RouterDecision::Finish {
                direct_reply: Some(ROUTING_APOLOGY.to_string())
            }
        );
        assert_eq!(llm.call_count(), 2);
    }

    #[tokio::test]
    async fn test_no_user_message_is_invalid_state() {
        let llm = Arc::new(ScriptedLlmClient::new([r#"{"next": "FINISH"}"#]));
        let r = router(llm.clone(), &["knowledge_handler"]);
        let snap = ThreadSnapshot::new(
            "t".into(),
            true,
            vec![Message {
                role: crate::memory::Role::System,
                content: "route:x".into(),
                origin: None,
                sequence: 0,
            }],
        );
        assert!(matches!(
            r.decide(&snap).await,
            Err(OrchestrationError::InvalidState(_))
        ));
        assert_eq!(llm.call_count(), 0);
    }

    #[tokio::test]
    async fn test_model_failure_is_retryable() {
        let llm = Arc::new(ScriptedLlmClient::default());
        llm.push_error(LlmError::ApiError("503".into()));
        let r = router(llm, &["knowledge_handler"]);
        let err = r.decide(&snapshot_with_user()).await.unwrap_err();
        assert!(matches!(err, OrchestrationError::ModelUnavailable(_)));
        assert!(err.is_retryable());
    }
}

//! 会话数据模型：Message / Thread / ThreadSnapshot
//!
//! Thread 是一段可恢复的对话，消息只追加不修改；sequence 由存储层在追加时分配（0 起、连续无空洞）。
//! ThreadSnapshot 是某一时刻的只读视图，Router 与 Handler Runtime 只读取快照，不接触存储。

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::llm::ChatMessage;

/// 会话 ID（对调用方不透明）
pub type ThreadId = String;

/// 生成新的会话 ID：`YYYYMMDD_HHMMSS_<uuid 前 8 位>`
pub fn new_thread_id() -> ThreadId {
    let timestamp = chrono::Local::now().format("%Y%m%d_%H%M%S");
    let uuid = uuid::Uuid::new_v4().simple().to_string();
    format!("{}_{}", timestamp, &uuid[..8])
}

/// 消息角色
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    User,
    Assistant,
    HandlerResult,
    System,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Assistant => "assistant",
            Role::HandlerResult => "handler_result",
            Role::System => "system",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "user" => Some(Role::User),
            "assistant" => Some(Role::Assistant),
            "handler_result" => Some(Role::HandlerResult),
            "system" => Some(Role::System),
            _ => None,
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 已追加到会话中的一条消息（不可变）
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: String,
    /// 产生该消息的 handler 名；handler_result 必填，其余为 None
    pub origin: Option<String>,
    /// 在会话内的位置，等于追加前的消息条数
    pub sequence: u64,
}

/// 待追加的消息：sequence 由存储层分配
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MessageDraft {
    pub role: Role,
    pub content: String,
    pub origin: Option<String>,
}

impl MessageDraft {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
            origin: None,
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
            origin: None,
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
            origin: None,
        }
    }

    pub fn handler_result(origin: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            role: Role::HandlerResult,
            content: content.into(),
            origin: Some(origin.into()),
        }
    }

    /// handler 被选中时追加的路由标记
    pub fn route_marker(handler: &str) -> Self {
        Self::system(format!("{}{}", ROUTE_MARKER_PREFIX, handler))
    }

    /// 追加前校验：内容非空；handler_result 必须带非空 origin
    pub fn validate(&self) -> Result<(), String> {
        if self.content.trim().is_empty() {
            return Err(format!("{} message has empty content", self.role));
        }
        if self.role == Role::HandlerResult
            && self.origin.as_deref().map_or(true, |o| o.trim().is_empty())
        {
            return Err("handler_result message requires a non-empty origin".to_string());
        }
        Ok(())
    }

    pub(crate) fn into_message(self, sequence: u64) -> Message {
        Message {
            role: self.role,
            content: self.content,
            origin: self.origin,
            sequence,
        }
    }
}

/// 路由标记前缀（system 消息，如 `route:knowledge_handler`）
pub const ROUTE_MARKER_PREFIX: &str = "route:";

/// 一段会话
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Thread {
    pub id: ThreadId,
    pub messages: Vec<Message>,
    /// Router 结束本轮后为 false；下一条用户消息到来时重新激活
    pub active: bool,
}

impl Thread {
    pub fn new(id: ThreadId) -> Self {
        Self {
            id,
            messages: Vec::new(),
            active: true,
        }
    }

    /// 追加一条消息并分配 sequence
    pub(crate) fn push(&mut self, draft: MessageDraft) -> Message {
        let msg = draft.into_message(self.messages.len() as u64);
        self.messages.push(msg.clone());
        msg
    }

    pub fn snapshot(&self) -> ThreadSnapshot {
        ThreadSnapshot {
            thread_id: self.id.clone(),
            active: self.active,
            messages: Arc::from(self.messages.clone()),
        }
    }
}

/// 会话在某一时刻的只读快照（checkpoint）
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ThreadSnapshot {
    pub thread_id: ThreadId,
    pub active: bool,
    messages: Arc<[Message]>,
}

impl ThreadSnapshot {
    pub fn new(thread_id: ThreadId, active: bool, messages: Vec<Message>) -> Self {
        Self {
            thread_id,
            active,
            messages: Arc::from(messages),
        }
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn has_user_message(&self) -> bool {
        self.messages.iter().any(|m| m.role == Role::User)
    }

    pub fn last_user_message(&self) -> Option<&Message> {
        self.messages.iter().rev().find(|m| m.role == Role::User)
    }

    /// 当前轮次（最后一条用户消息及其后）的消息
    pub fn current_turn(&self) -> &[Message] {
        let start = self
            .messages
            .iter()
            .rposition(|m| m.role == Role::User)
            .unwrap_or(0);
        &self.messages[start..]
    }

    /// 当前轮次中最近一条 handler 结果
    pub fn last_turn_result(&self) -> Option<&Message> {
        self.current_turn()
            .iter()
            .rev()
            .find(|m| m.role == Role::HandlerResult)
    }

    /// 当前轮次以路由标记结尾（handler 已选定但结果未追加）时返回该 handler 名
    pub fn pending_route(&self) -> Option<&str> {
        match self.current_turn().last() {
            Some(m) if m.role == Role::System => m.content.strip_prefix(ROUTE_MARKER_PREFIX),
            _ => None,
        }
    }

    /// 转成模型可读的对话：handler 结果以 `[origin]` 前缀作为 assistant 消息，路由标记不发送
    pub fn transcript(&self) -> Vec<ChatMessage> {
        self.messages
            .iter()
            .filter_map(|m| match m.role {
                Role::User => Some(ChatMessage::user(m.content.clone())),
                Role::Assistant => Some(ChatMessage::assistant(m.content.clone())),
                Role::HandlerResult => Some(ChatMessage::assistant(format!(
                    "[{}] {}",
                    m.origin.as_deref().unwrap_or("handler"),
                    m.content
                ))),
                Role::System => None,
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::ChatRole;

    fn sample_thread() -> Thread {
        let mut t = Thread::new("t1".to_string());
        t.push(MessageDraft::user("What is Inception about?"));
        t.push(MessageDraft::route_marker("knowledge_handler"));
        t.push(MessageDraft::handler_result("knowledge_handler", "A thief who steals secrets."));
        t
    }

    #[test]
    fn test_thread_id_format() {
        let id = new_thread_id();
        let parts: Vec<&str> = id.split('_').collect();
        assert_eq!(parts.len(), 3);
        assert_eq!(parts[0].len(), 8);
        assert_eq!(parts[1].len(), 6);
        assert_eq!(parts[2].len(), 8);
        assert_ne!(new_thread_id(), id);
    }

    #[test]
    fn test_push_assigns_contiguous_sequence() {
        let t = sample_thread();
        for (i, m) in t.messages.iter().enumerate() {
            assert_eq!(m.sequence, i as u64);
        }
    }

    #[test]
    fn test_validate_rejects_empty_origin_and_content() {
        let mut bad = MessageDraft::handler_result("x", "result");
        bad.origin = Some("  ".to_string());
        assert!(bad.validate().is_err());
        assert!(MessageDraft::user("   ").validate().is_err());
        assert!(MessageDraft::user("hi").validate().is_ok());
    }

    #[test]
    fn test_snapshot_transcript_skips_markers() {
        let snap = sample_thread().snapshot();
        let chat = snap.transcript();
        assert_eq!(chat.len(), 2);
        assert_eq!(chat[0].role, ChatRole::User);
        assert_eq!(chat[1].content, "[knowledge_handler] A thief who steals secrets.");
    }

    #[test]
    fn test_current_turn_and_last_result() {
        let mut t = sample_thread();
        t.push(MessageDraft::user("What year did it release?"));
        let snap = t.snapshot();
        assert_eq!(snap.current_turn().len(), 1);
        assert!(snap.last_turn_result().is_none());
        assert_eq!(snap.last_user_message().unwrap().sequence, 3);
        assert!(snap.pending_route().is_none());

        t.push(MessageDraft::route_marker("download_handler"));
        let snap = t.snapshot();
        assert_eq!(snap.pending_route(), Some("download_handler"));

        t.push(MessageDraft::handler_result("download_handler", "Queued."));
        let snap = t.snapshot();
        assert!(snap.pending_route().is_none());
        assert_eq!(snap.last_turn_result().unwrap().content, "Queued.");
        assert_eq!(snap.current_turn().len(), 3);
    }

    #[test]
    fn test_role_round_trips_through_str() {
        for role in [Role::User, Role::Assistant, Role::HandlerResult, Role::System] {
            assert_eq!(Role::parse(role.as_str()), Some(role));
        }
        assert_eq!(Role::parse("tool"), None);
    }
}

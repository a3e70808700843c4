//! Planner：handler 推理步骤的提示词拼装与输出解析
//!
//! 模型输出被解码为 ReasoningStep：最终回答或一个动作请求。接受两种格式：
//! JSON（`{"action": .., "arguments": ..}` / `{"final_answer": ..}`）与文本格式
//! （`Action:` / `Action Input:` / `Final Answer:`）。无法解码时返回 MalformedAction，由 RecoveryEngine 处理。

use std::sync::{Arc, OnceLock};

use regex::Regex;
use serde_json::Value;

use crate::core::HandlerError;
use crate::handlers::HandlerDescriptor;
use crate::llm::{ChatMessage, LlmClient, LlmError};
use crate::react::schema::{action_schema_json, ActionFormat};

const FINAL_ANSWER_TAG: &str = "Final Answer:";

/// 一个具名动作请求
#[derive(Debug, Clone, PartialEq)]
pub struct ActionRequest {
    pub action: String,
    pub arguments: Value,
}

/// 单次推理的结果
#[derive(Debug, Clone, PartialEq)]
pub enum ReasoningStep {
    FinalAnswer(String),
    Act(ActionRequest),
}

fn action_regex() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?s)Action\s*:\s*(?P<action>[^\n]+?)\s*(?:\n\s*Action\s*Input\s*:\s*(?P<input>.*))?$").ok()
    })
    .as_ref()
}

/// 解析模型输出
///
/// 优先级：Final Answer 标记 > JSON 对象 > Action/Action Input 文本 > 纯文本视为最终回答。
pub fn parse_reasoning(output: &str) -> Result<ReasoningStep, HandlerError> {
    let trimmed = output.trim();
    if trimmed.is_empty() {
        return Err(HandlerError::MalformedAction("empty output".to_string()));
    }

    if let Some(idx) = trimmed.find(FINAL_ANSWER_TAG) {
        let answer = trimmed[idx + FINAL_ANSWER_TAG.len()..].trim();
        if answer.is_empty() {
            return Err(HandlerError::MalformedAction(
                "Final Answer is empty".to_string(),
            ));
        }
        return Ok(ReasoningStep::FinalAnswer(answer.to_string()));
    }

    if let Some(json_str) = extract_json(trimmed) {
        return parse_json_step(json_str);
    }

    if let Some(caps) = action_regex().and_then(|re| re.captures(trimmed)) {
        let action = caps
            .name("action")
            .map(|m| m.as_str().trim().trim_matches('`').to_string())
            .unwrap_or_default();
        if action.is_empty() {
            return Err(HandlerError::MalformedAction("Action name is empty".to_string()));
        }
        let arguments = caps
            .name("input")
            .map(|m| action_input(m.as_str()))
            .unwrap_or_else(|| Value::Object(Default::default()));
        return Ok(ReasoningStep::Act(ActionRequest { action, arguments }));
    }

    Ok(ReasoningStep::FinalAnswer(trimmed.to_string()))
}

/// ```json 代码块或以 `{` 开头的整段输出
fn extract_json(trimmed: &str) -> Option<&str> {
    if let Some(start) = trimmed.find("```json") {
        let rest = &trimmed[start + 7..];
        return Some(rest.find("```").map(|end| rest[..end].trim()).unwrap_or(rest.trim()));
    }
    if trimmed.starts_with('{') {
        let end = trimmed.rfind('}')?;
        return Some(&trimmed[..=end]);
    }
    None
}

fn parse_json_step(json_str: &str) -> Result<ReasoningStep, HandlerError> {
    let value: Value = serde_json::from_str(json_str)
        .map_err(|e| HandlerError::MalformedAction(format!("{}: {}", e, json_str)))?;
    if let Some(answer) = value.get("final_answer").and_then(Value::as_str) {
        let answer = answer.trim();
        if answer.is_empty() {
            return Err(HandlerError::MalformedAction(
                "final_answer is empty".to_string(),
            ));
        }
        return Ok(ReasoningStep::FinalAnswer(answer.to_string()));
    }
    let parsed: ActionFormat = serde_json::from_value(value)
        .map_err(|e| HandlerError::MalformedAction(format!("{}: {}", e, json_str)))?;
    if parsed.action.trim().is_empty() {
        return Err(HandlerError::MalformedAction("action is empty".to_string()));
    }
    let arguments = match parsed.arguments {
        Value::Null => Value::Object(Default::default()),
        other => other,
    };
    Ok(ReasoningStep::Act(ActionRequest {
        action: parsed.action.trim().to_string(),
        arguments,
    }))
}

/// Action Input 是 JSON 时原样使用；否则包装为 `{"input": "<text>"}`
fn action_input(raw: &str) -> Value {
    // 模型有时会自己续写 Observation，截掉
    let raw = raw.split("\nObservation").next().unwrap_or(raw).trim();
    if raw.is_empty() {
        return Value::Object(Default::default());
    }
    match serde_json::from_str::<Value>(raw) {
        Ok(v @ Value::Object(_)) => v,
        _ => serde_json::json!({ "input": raw.trim_matches('"') }),
    }
}

/// Planner：持有 handler 使用的 LLM，负责拼 system prompt 并调用
pub struct Planner {
    llm: Arc<dyn LlmClient>,
}

impl Planner {
    pub fn new(llm: Arc<dyn LlmClient>) -> Self {
        Self { llm }
    }

    /// 获取 LLM 累计 token 使用统计
    pub fn token_usage(&self) -> (u64, u64, u64) {
        self.llm.token_usage()
    }

    /// 会话 transcript + 本地 scratchpad 作为上下文，返回模型原始输出
    pub async fn reason(
        &self,
        handler: &HandlerDescriptor,
        transcript: &[ChatMessage],
        scratchpad: &[ChatMessage],
    ) -> Result<String, LlmError> {
        let mut messages = Vec::with_capacity(transcript.len() + scratchpad.len() + 1);
        messages.push(ChatMessage::system(handler_system_prompt(handler)));
        messages.extend_from_slice(transcript);
        messages.extend_from_slice(scratchpad);
        self.llm.complete(&messages).await
    }
}

/// handler 的 system prompt：专用提示词 + 动作清单 + 输出格式
pub fn handler_system_prompt(handler: &HandlerDescriptor) -> String {
    let mut actions = String::new();
    for a in &handler.action_schema {
        actions.push_str(&format!("- {}: {}\n  parameters: {}\n", a.name, a.description, a.parameters));
    }
    let intro = handler.prompt.clone().unwrap_or_else(|| {
        format!(
            "You are {}, a specialized agent in a multi-agent home theater system. {}",
            handler.name, handler.purpose
        )
    });
    format!(
        "{intro}\n\n\
         Available actions:\n{actions}\n\
         Use this format:\n\
         Thought: what do I need to do?\n\
         Action: one of [{names}]\n\
         Action Input: a JSON object with the action's parameters\n\
         Observation: the result of the action (provided to you)\n\
         ... (repeat Thought/Action/Observation as needed)\n\
         Final Answer: the complete response for the user\n\n\
         You may instead answer with a single JSON object matching this schema:\n{schema}\n\
         or {{\"final_answer\": \"...\"}} when you are done.",
        names = handler.action_names().join(", "),
        schema = action_schema_json(),
    )
}

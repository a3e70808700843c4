//! HTTP 能力适配器
//!
//! 将 `invoke(action, arguments)` 转成一次 POST：请求体 `{"action": .., "arguments": ..}`，
//! 响应体为 `{"result": ..}` / `{"error": ..}` 或纯文本。4xx 视为可恢复的拒绝，5xx 与网络错误视为不可用。

use async_trait::async_trait;
use reqwest::StatusCode;
use serde_json::Value;

use crate::handlers::{Capability, CapabilityError};

/// 响应体最多保留的字符数
const MAX_RESULT_CHARS: usize = 8000;

/// 基于 reqwest 的能力实现，一个 endpoint 对应一个外部服务
pub struct HttpCapability {
    name: String,
    endpoint: String,
    client: reqwest::Client,
}

impl HttpCapability {
    pub fn new(name: impl Into<String>, endpoint: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            endpoint: endpoint.into(),
            client: reqwest::Client::new(),
        }
    }
}

#[async_trait]
impl Capability for HttpCapability {
    fn name(&self) -> &str {
        &self.name
    }

    async fn invoke(&self, action: &str, arguments: Value) -> Result<String, CapabilityError> {
        let body = serde_json::json!({
            "action": action,
            "arguments": arguments,
        });
        let response = self
            .client
            .post(&self.endpoint)
            .json(&body)
            .send()
            .await
            .map_err(|e| CapabilityError::Unavailable(e.to_string()))?;
        let status = response.status();
        let text = response
            .text()
            .await
            .map_err(|e| CapabilityError::Unavailable(e.to_string()))?;
        read_result(status, &text)
    }
}

/// 将 HTTP 状态码与响应体映射为能力结果
fn read_result(status: StatusCode, body: &str) -> Result<String, CapabilityError> {
    let parsed: Option<Value> = serde_json::from_str(body).ok();
    let error_text = parsed
        .as_ref()
        .and_then(|v| v.get("error"))
        .map(value_text);

    if status.is_server_error() {
        return Err(CapabilityError::Unavailable(format!(
            "{}: {}",
            status,
            error_text.unwrap_or_else(|| truncate(body))
        )));
    }
    if status.is_client_error() {
        return Err(CapabilityError::Rejected(
            error_text.unwrap_or_else(|| format!("{}: {}", status, truncate(body))),
        ));
    }
    if let Some(err) = error_text {
        return Err(CapabilityError::Rejected(err));
    }

    let result = match parsed.as_ref().and_then(|v| v.get("result")) {
        Some(v) => value_text(v),
        None => body.trim().to_string(),
    };
    Ok(truncate(&result))
}

fn value_text(v: &Value) -> String {
    match v {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn truncate(s: &str) -> String {
    if s.chars().count() > MAX_RESULT_CHARS {
        format!("{}...", s.chars().take(MAX_RESULT_CHARS).collect::<String>())
    } else {
        s.to_string()
    }
}

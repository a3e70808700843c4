//! 能力（Capability）契约与执行器
//!
//! 每个 handler 包装一个外部能力（知识检索、下载管理、文件库扫描……），核心只关心黑盒契约：
//! `invoke(action, arguments)` 成功返回文本，失败返回 CapabilityError。
//! CapabilityExecutor 对每次调用施加超时与并发许可，并输出结构化审计日志（JSON）。

use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;
use tokio::time::timeout;

use crate::core::TaskScheduler;
use crate::handlers::HandlerDescriptor;

/// 能力调用错误
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CapabilityError {
    /// 请求被拒绝（参数错误、找不到资源等），模型换个动作或参数即可继续
    #[error("Capability rejected the request: {0}")]
    Rejected(String),

    /// 外部服务不可用，本次 handler 无法完成
    #[error("Capability unavailable: {0}")]
    Unavailable(String),

    #[error("Capability timed out after {0} ms")]
    Timeout(u64),
}

impl CapabilityError {
    /// 是否可以作为 Observation 交还给模型继续推理
    pub fn is_recoverable(&self) -> bool {
        matches!(self, CapabilityError::Rejected(_))
    }
}

/// 外部能力 trait
#[async_trait]
pub trait Capability: Send + Sync {
    /// 能力名（日志用，如 vector_search、download_client）
    fn name(&self) -> &str;

    /// 执行一个命名动作；arguments 为 JSON 对象
    async fn invoke(&self, action: &str, arguments: Value) -> Result<String, CapabilityError>;
}

/// 能力执行器：超时 + 并发许可 + 审计日志
#[derive(Debug, Clone)]
pub struct CapabilityExecutor {
    scheduler: Arc<TaskScheduler>,
}

impl CapabilityExecutor {
    pub fn new(scheduler: Arc<TaskScheduler>) -> Self {
        Self { scheduler }
    }

    /// 在 handler 的超时内执行动作；超时返回 CapabilityError::Timeout
    pub async fn execute(
        &self,
        handler: &HandlerDescriptor,
        action: &str,
        arguments: Value,
    ) -> Result<String, CapabilityError> {
        let _permit = self
            .scheduler
            .acquire_capability()
            .await
            .ok_or_else(|| CapabilityError::Unavailable("capability pool closed".to_string()))?;

        let start = Instant::now();
        let args_preview = args_preview(&arguments);
        let result = timeout(handler.timeout, handler.capability.invoke(action, arguments)).await;

        let outcome = match &result {
            Ok(Ok(_)) => "ok",
            Ok(Err(e)) if e.is_recoverable() => "rejected",
            Ok(Err(_)) => "error",
            Err(_) => "timeout",
        };
        let audit = serde_json::json!({
            "event": "capability_audit",
            "handler": handler.name,
            "capability": handler.capability.name(),
            "action": action,
            "outcome": outcome,
            "duration_ms": start.elapsed().as_millis() as u64,
            "args_preview": args_preview,
        });
        tracing::info!(audit = %audit.to_string(), "capability");

        match result {
            Ok(r) => r,
            Err(_) => Err(CapabilityError::Timeout(handler.timeout.as_millis() as u64)),
        }
    }
}

fn args_preview(args: &Value) -> String {
    let s = args.to_string();
    if s.chars().count() > 200 {
        format!("{}...", s.chars().take(200).collect::<String>())
    } else {
        s
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    struct Slow;

    #[async_trait]
    impl Capability for Slow {
        fn name(&self) -> &str {
            "slow"
        }

        async fn invoke(&self, _action: &str, _arguments: Value) -> Result<String, CapabilityError> {
            tokio::time::sleep(Duration::from_secs(2)).await;
            Ok("late".to_string())
        }
    }

    struct Echo;

    #[async_trait]
    impl Capability for Echo {
        fn name(&self) -> &str {
            "echo"
        }

        async fn invoke(&self, action: &str, arguments: Value) -> Result<String, CapabilityError> {
            Ok(format!("{} {}", action, arguments))
        }
    }

    #[tokio::test]
    async fn test_execute_passes_through_result() {
        let exec = CapabilityExecutor::new(Arc::new(TaskScheduler::default()));
        let handler = HandlerDescriptor::new("echo_handler", "echo", Arc::new(Echo));
        let out = exec
            .execute(&handler, "say", serde_json::json!({"text": "hi"}))
            .await
            .unwrap();
        assert_eq!(out, r#"say {"text":"hi"}"#);
    }

    #[tokio::test]
    async fn test_execute_times_out() {
        let exec = CapabilityExecutor::new(Arc::new(TaskScheduler::default()));
        let handler = HandlerDescriptor::new("slow_handler", "slow", Arc::new(Slow))
            .with_timeout(Duration::from_millis(50));
        let err = exec
            .execute(&handler, "wait", Value::Null)
            .await
            .unwrap_err();
        assert_eq!(err, CapabilityError::Timeout(50));
        assert!(!err.is_recoverable());
    }

    #[test]
    fn test_args_preview_truncates() {
        let long = Value::String("x".repeat(500));
        assert!(args_preview(&long).ends_with("..."));
        assert_eq!(args_preview(&Value::Null), "null");
    }
}

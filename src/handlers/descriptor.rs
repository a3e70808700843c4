//! Handler 注册
//!
//! HandlerDescriptor 是启动时构造的静态注册记录；HandlerRegistry 按注册顺序保存，
//! 注册顺序即 Router 在名称歧义时的优先顺序。

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::core::router::FINISH;
use crate::core::OrchestrationError;
use crate::handlers::Capability;

/// 默认推理/动作循环上限
pub const DEFAULT_STEP_BUDGET: usize = 3;
/// 默认单次能力调用超时
pub const DEFAULT_CAPABILITY_TIMEOUT: Duration = Duration::from_secs(30);

/// handler 可调用的一个动作（名称、说明、参数形状）
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ActionSpec {
    pub name: String,
    #[serde(default)]
    pub description: String,
    /// 参数 JSON Schema（object）
    #[serde(default = "empty_parameters")]
    pub parameters: Value,
}

fn empty_parameters() -> Value {
    serde_json::json!({
        "type": "object",
        "properties": {},
        "required": []
    })
}

impl ActionSpec {
    pub fn new(name: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            parameters: empty_parameters(),
        }
    }

    pub fn with_parameters(mut self, parameters: Value) -> Self {
        self.parameters = parameters;
        self
    }
}

/// 静态注册记录
#[derive(Clone)]
pub struct HandlerDescriptor {
    /// 唯一名称：Router 决策与路由标记都使用它
    pub name: String,
    /// 一行用途说明，提供给 Router
    pub purpose: String,
    pub capability: Arc<dyn Capability>,
    pub step_budget: usize,
    pub action_schema: Vec<ActionSpec>,
    /// 单次能力调用超时
    pub timeout: Duration,
    /// 可选的专用系统提示词
    pub prompt: Option<String>,
}

impl fmt::Debug for HandlerDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandlerDescriptor")
            .field("name", &self.name)
            .field("capability", &self.capability.name())
            .field("step_budget", &self.step_budget)
            .field("actions", &self.action_names())
            .field("timeout", &self.timeout)
            .finish()
    }
}

impl HandlerDescriptor {
    pub fn new(
        name: impl Into<String>,
        purpose: impl Into<String>,
        capability: Arc<dyn Capability>,
    ) -> Self {
        Self {
            name: name.into(),
            purpose: purpose.into(),
            capability,
            step_budget: DEFAULT_STEP_BUDGET,
            action_schema: Vec::new(),
            timeout: DEFAULT_CAPABILITY_TIMEOUT,
            prompt: None,
        }
    }

    pub fn with_step_budget(mut self, step_budget: usize) -> Self {
        self.step_budget = step_budget;
        self
    }

    pub fn with_action(mut self, action: ActionSpec) -> Self {
        self.action_schema.push(action);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.prompt = Some(prompt.into());
        self
    }

    pub fn action(&self, name: &str) -> Option<&ActionSpec> {
        self.action_schema.iter().find(|a| a.name == name)
    }

    pub fn action_names(&self) -> Vec<String> {
        self.action_schema.iter().map(|a| a.name.clone()).collect()
    }

    fn validate(&self) -> Result<(), String> {
        if self.name.trim().is_empty() {
            return Err("handler name must not be empty".to_string());
        }
        if self.name.eq_ignore_ascii_case(FINISH) {
            return Err(format!("'{}' is reserved", FINISH));
        }
        if self.step_budget == 0 {
            return Err(format!("handler '{}' needs a step_budget of at least 1", self.name));
        }
        if self.action_schema.is_empty() {
            return Err(format!("handler '{}' declares no actions", self.name));
        }
        for (i, a) in self.action_schema.iter().enumerate() {
            if a.name.trim().is_empty() {
                return Err(format!("handler '{}' has an unnamed action", self.name));
            }
            if self.action_schema[..i].iter().any(|b| b.name == a.name) {
                return Err(format!(
                    "handler '{}' declares action '{}' twice",
                    self.name, a.name
                ));
            }
        }
        Ok(())
    }
}

/// 按注册顺序保存的 handler 列表（启动时构造一次，之后只读共享）
#[derive(Clone, Debug, Default)]
pub struct HandlerRegistry {
    handlers: Vec<HandlerDescriptor>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// 注册 handler；名称重复、保留名、空动作表等返回 InvalidState
    pub fn register(&mut self, handler: HandlerDescriptor) -> Result<(), OrchestrationError> {
        handler.validate().map_err(OrchestrationError::InvalidState)?;
        if self.get(&handler.name).is_some() {
            return Err(OrchestrationError::InvalidState(format!(
                "handler '{}' is already registered",
                handler.name
            )));
        }
        self.handlers.push(handler);
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<&HandlerDescriptor> {
        self.handlers.iter().find(|h| h.name == name)
    }

    /// 名称列表（注册顺序）
    pub fn names(&self) -> Vec<String> {
        self.handlers.iter().map(|h| h.name.clone()).collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &HandlerDescriptor> {
        self.handlers.iter()
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handlers::CapabilityError;
    use async_trait::async_trait;

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

    fn handler(name: &str) -> HandlerDescriptor {
        HandlerDescriptor::new(name, "does things", Arc::new(Noop))
            .with_action(ActionSpec::new("run", "run it"))
    }

    #[test]
    fn test_register_keeps_order() {
        let mut reg = HandlerRegistry::new();
        reg.register(handler("b")).unwrap();
        reg.register(handler("a")).unwrap();
        assert_eq!(reg.names(), vec!["b", "a"]);
        assert!(reg.get("a").is_some());
    }

    #[test]
    fn test_register_rejects_duplicates_and_reserved() {
        let mut reg = HandlerRegistry::new();
        reg.register(handler("a")).unwrap();
        assert!(reg.register(handler("a")).is_err());
        assert!(reg.register(handler("finish")).is_err());
        assert!(reg.register(handler("")).is_err());
        assert_eq!(reg.len(), 1);
    }

    #[test]
    fn test_register_rejects_bad_schema() {
        let mut reg = HandlerRegistry::new();
        let no_actions = HandlerDescriptor::new("x", "p", Arc::new(Noop));
        assert!(reg.register(no_actions).is_err());
        let zero_budget = handler("y").with_step_budget(0);
        assert!(reg.register(zero_budget).is_err());
        let dup_action = handler("z").with_action(ActionSpec::new("run", "again"));
        assert!(reg.register(dup_action).is_err());
    }

    #[test]
    fn test_action_spec_defaults_parameters() {
        let spec: ActionSpec = serde_json::from_str(r#"{"name": "scan_library"}"#).unwrap();
        assert_eq!(spec.parameters["type"], "object");
        assert!(spec.description.is_empty());
    }
}

//! 结构化输出 JSON Schema 生成（schemars）
//!
//! 路由决策与动作请求的 JSON 结构拼入提示词，减少模型输出格式错误；同一组结构体也用于解码。

use schemars::{schema_for, JsonSchema};
use serde::Deserialize;
use serde_json::Value;

/// Router 的结构化输出：`{"next": "<handler 或 FINISH>", "reply": "..."}`
#[derive(Debug, Clone, Deserialize, JsonSchema)]
pub struct RouteFormat {
    /// 下一个要执行的 handler 名称，或 FINISH
    pub next: String,
    /// 仅在 next 为 FINISH 时使用：直接回复用户的文本
    #[serde(default)]
    pub reply: Option<String>,
}

/// Handler 的动作请求：`{"action": "...", "arguments": {...}}`
#[derive(Debug, Clone, Deserialize, JsonSchema)]
pub struct ActionFormat {
    /// 动作名，必须来自 handler 的 action_schema
    pub action: String,
    /// 动作参数（JSON 对象）
    #[serde(default)]
    pub arguments: Value,
}

fn pretty<T: JsonSchema>() -> String {
    let schema = schema_for!(T);
    serde_json::to_string_pretty(&schema).unwrap_or_default()
}

/// 路由决策的 JSON Schema 字符串
pub fn route_schema_json() -> String {
    pretty::<RouteFormat>()
}

/// 动作请求的 JSON Schema 字符串
pub fn action_schema_json() -> String {
    pretty::<ActionFormat>()
}

//! 认知层：Planner（输出解码）、Handler Runtime（有界 ReAct 循环）、过程事件与结构化输出 Schema

pub mod events;
pub mod loop_;
pub mod planner;
pub mod schema;

pub use events::TurnEvent;
pub use loop_::{HandlerOutcome, HandlerResult, HandlerRuntime, DEFAULT_REASONING_TIMEOUT};
pub use planner::{parse_reasoning, ActionRequest, Planner, ReasoningStep};

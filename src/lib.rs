//! Turtle - Rust 多智能体编排引擎
//!
//! 模块划分：
//! - **config**: 应用配置加载（TOML + 环境变量）
//! - **core**: 路由器、轮次状态机、编排器、错误与恢复、任务调度
//! - **handlers**: Handler 注册表、能力契约与执行器、HTTP 能力适配器
//! - **llm**: LLM 客户端抽象与实现（OpenAI 兼容 / Mock / Scripted）
//! - **memory**: 会话数据模型与会话存储（内存 / SQLite）
//! - **observability**: tracing 初始化
//! - **react**: Handler Runtime（有界 ReAct 循环）、输出解析、过程事件

pub mod config;
pub mod core;
pub mod handlers;
pub mod llm;
pub mod memory;
pub mod observability;
pub mod react;

pub use crate::core::{Orchestrator, OrchestratorBuilder, TurnOutcome, TurnSession};

//! 应用配置：从 config/default.toml 与环境变量加载
//!
//! 加载顺序：先读 TOML 文件，再用环境变量 `TURTLE__*` 覆盖（双下划线表示嵌套，如 `TURTLE__LLM__PROVIDER=mock`）。

use std::path::PathBuf;

use serde::Deserialize;

use crate::handlers::ActionSpec;

/// 应用配置根（对应 config/default.toml 的顶层）
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    pub app: AppSection,
    pub llm: LlmSection,
    pub orchestrator: OrchestratorSection,
    pub store: StoreSection,
    pub server: ServerSection,
    /// 为空时注册内置的三个 handler
    pub handlers: Vec<HandlerConfig>,
}

/// [app] 段
#[derive(Debug, Clone, Deserialize)]
pub struct AppSection {
    #[serde(default = "default_app_name")]
    pub name: String,
}

fn default_app_name() -> String {
    "turtle".to_string()
}

impl Default for AppSection {
    fn default() -> Self {
        Self {
            name: default_app_name(),
        }
    }
}

/// [llm] 段：后端选择、路由/handler 各自的模型与超时
#[derive(Debug, Clone, Deserialize)]
pub struct LlmSection {
    /// openai / mock；openai 且无 OPENAI_API_KEY 时回退到 mock
    #[serde(default = "default_provider")]
    pub provider: String,
    pub base_url: Option<String>,
    /// Router 使用的模型
    #[serde(default = "default_model")]
    pub supervisor_model: String,
    /// Handler 推理使用的模型
    #[serde(default = "default_model")]
    pub agent_model: String,
    #[serde(default)]
    pub timeouts: LlmTimeoutsSection,
}

fn default_provider() -> String {
    "openai".to_string()
}

fn default_model() -> String {
    "gpt-4o-mini".to_string()
}

impl Default for LlmSection {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            base_url: None,
            supervisor_model: default_model(),
            agent_model: default_model(),
            timeouts: LlmTimeoutsSection::default(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct LlmTimeoutsSection {
    /// 单次 HTTP 请求超时（秒）
    #[serde(default = "default_request_timeout")]
    pub request: u64,
}

fn default_request_timeout() -> u64 {
    60
}

impl Default for LlmTimeoutsSection {
    fn default() -> Self {
        Self {
            request: default_request_timeout(),
        }
    }
}

/// [orchestrator] 段：往返上限、各阶段超时、能力并发
#[derive(Debug, Clone, Deserialize)]
pub struct OrchestratorSection {
    #[serde(default = "default_max_round_trips")]
    pub max_round_trips: usize,
    #[serde(default = "default_stage_timeout_secs")]
    pub routing_timeout_secs: u64,
    #[serde(default = "default_stage_timeout_secs")]
    pub reasoning_timeout_secs: u64,
    #[serde(default = "default_max_concurrent_capabilities")]
    pub max_concurrent_capabilities: usize,
}

fn default_max_round_trips() -> usize {
    crate::core::DEFAULT_MAX_ROUND_TRIPS
}

fn default_stage_timeout_secs() -> u64 {
    60
}

fn default_max_concurrent_capabilities() -> usize {
    crate::core::task_scheduler::DEFAULT_MAX_CONCURRENT_CAPABILITIES
}

impl Default for OrchestratorSection {
    fn default() -> Self {
        Self {
            max_round_trips: default_max_round_trips(),
            routing_timeout_secs: default_stage_timeout_secs(),
            reasoning_timeout_secs: default_stage_timeout_secs(),
            max_concurrent_capabilities: default_max_concurrent_capabilities(),
        }
    }
}

/// [store] 段：会话存储后端
#[derive(Debug, Clone, Deserialize)]
pub struct StoreSection {
    /// memory / sqlite（sqlite 需要 async-sqlite feature）
    #[serde(default = "default_store_backend")]
    pub backend: String,
    #[serde(default = "default_sqlite_path")]
    pub sqlite_path: PathBuf,
}

fn default_store_backend() -> String {
    "memory".to_string()
}

fn default_sqlite_path() -> PathBuf {
    PathBuf::from("data/threads.db")
}

impl Default for StoreSection {
    fn default() -> Self {
        Self {
            backend: default_store_backend(),
            sqlite_path: default_sqlite_path(),
        }
    }
}

/// [server] 段：turtle-web 监听地址
#[derive(Debug, Clone, Deserialize)]
pub struct ServerSection {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    8000
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

/// [[handlers]]：一个通过 HTTP 能力适配器接入的 handler
#[derive(Debug, Clone, Deserialize)]
pub struct HandlerConfig {
    pub name: String,
    pub purpose: String,
    /// 能力服务地址（POST {"action", "arguments"}）
    pub endpoint: String,
    #[serde(default = "default_step_budget")]
    pub step_budget: usize,
    #[serde(default = "default_handler_timeout_secs")]
    pub timeout_secs: u64,
    pub prompt: Option<String>,
    #[serde(default)]
    pub actions: Vec<ActionSpec>,
}

fn default_step_budget() -> usize {
    crate::handlers::DEFAULT_STEP_BUDGET
}

fn default_handler_timeout_secs() -> u64 {
    crate::handlers::DEFAULT_CAPABILITY_TIMEOUT.as_secs()
}

/// 从 config 目录加载配置，环境变量 TURTLE__* 可覆盖
///
/// 1. 按顺序查找 config/default.toml、../config/default.toml、default.toml，找到则作为第一源
/// 2. 若传入 config_path 且文件存在，则追加该文件（可覆盖前面的键）
/// 3. 最后叠加环境变量 TURTLE__*（双下划线表示嵌套键）
pub fn load_config(config_path: Option<PathBuf>) -> Result<AppConfig, config::ConfigError> {
    let mut builder = config::Config::builder();

    for name in ["config/default", "../config/default", "default"] {
        if std::path::Path::new(&format!("{}.toml", name)).exists() {
            builder = builder.add_source(config::File::with_name(name).required(false));
            break;
        }
    }

    if let Some(ref path) = config_path {
        if path.exists() {
            builder = builder.add_source(config::File::from(path.clone()).required(false));
        }
    }

    builder = builder.add_source(
        config::Environment::with_prefix("TURTLE")
            .separator("__")
            .try_parsing(true),
    );

    builder.build()?.try_deserialize()
}

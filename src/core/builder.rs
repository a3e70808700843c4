//! 编排器构建：从 AppConfig 统一初始化 LLM、handler 注册表、会话存储与编排器
//!
//! 终端 REPL 与 turtle-web 共用同一套构建逻辑；测试可通过 with_* 注入桩实现。

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;

use crate::config::{AppConfig, HandlerConfig};
use crate::core::{OrchestrationError, Orchestrator, Router, TaskScheduler};
use crate::handlers::{
    ActionSpec, CapabilityExecutor, HandlerDescriptor, HandlerRegistry, HttpCapability,
};
use crate::llm::{LlmClient, MockLlmClient, OpenAiClient};
use crate::memory::{InMemoryThreadStore, ThreadStore};
use crate::react::HandlerRuntime;

/// 根据配置与环境变量选择 LLM 后端（OpenAI 兼容 / Mock）
pub fn create_llm_from_config(cfg: &AppConfig, model: &str) -> Arc<dyn LlmClient> {
    let provider = cfg.llm.provider.to_lowercase();
    let api_key = std::env::var("OPENAI_API_KEY").ok();

    match (provider.as_str(), api_key) {
        ("openai", Some(key)) => {
            tracing::info!("Using OpenAI LLM ({})", model);
            Arc::new(
                OpenAiClient::new(cfg.llm.base_url.as_deref(), model, Some(&key))
                    .with_request_timeout(cfg.llm.timeouts.request),
            )
        }
        ("mock", _) => {
            tracing::info!("Using Mock LLM");
            Arc::new(MockLlmClient)
        }
        _ => {
            tracing::warn!("No API key set or provider unknown, using Mock LLM");
            Arc::new(MockLlmClient)
        }
    }
}

/// 按配置创建会话存储
pub async fn create_store(cfg: &AppConfig) -> Result<Arc<dyn ThreadStore>, OrchestrationError> {
    match cfg.store.backend.to_lowercase().as_str() {
        "memory" => Ok(Arc::new(InMemoryThreadStore::new())),
        #[cfg(feature = "async-sqlite")]
        "sqlite" => {
            let path = &cfg.store.sqlite_path;
            if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
                std::fs::create_dir_all(parent)
                    .map_err(|e| OrchestrationError::StoreUnavailable(e.to_string()))?;
            }
            let store = crate::memory::SqliteThreadStore::new(path)
                .await
                .map_err(|e| OrchestrationError::StoreUnavailable(e.to_string()))?;
            Ok(Arc::new(store))
        }
        #[cfg(not(feature = "async-sqlite"))]
        "sqlite" => Err(OrchestrationError::InvalidState(
            "sqlite store requires the async-sqlite feature".to_string(),
        )),
        other => Err(OrchestrationError::InvalidState(format!(
            "unknown store backend '{}'",
            other
        ))),
    }
}

fn handler_from_config(h: &HandlerConfig) -> HandlerDescriptor {
    let capability = Arc::new(HttpCapability::new(h.name.clone(), h.endpoint.clone()));
    let mut handler = HandlerDescriptor::new(h.name.clone(), h.purpose.clone(), capability)
        .with_step_budget(h.step_budget)
        .with_timeout(Duration::from_secs(h.timeout_secs.max(1)));
    if let Some(prompt) = &h.prompt {
        handler = handler.with_prompt(prompt.clone());
    }
    for action in &h.actions {
        handler = handler.with_action(action.clone());
    }
    handler
}

fn service_url(var: &str, default: &str) -> String {
    std::env::var(var).unwrap_or_else(|_| default.to_string())
}

/// 内置的三个 handler：电影知识检索、下载管理、本地片库扫描
pub fn default_handlers() -> Vec<HandlerDescriptor> {
    let knowledge = HandlerDescriptor::new(
        "knowledge_handler",
        "Expert in the movie database: plots, summaries, cast, directors, genres and recommendations",
        Arc::new(HttpCapability::new(
            "vector_search",
            service_url("TURTLE_KNOWLEDGE_URL", "http://127.0.0.1:9001/knowledge"),
        )),
    )
    .with_action(
        ActionSpec::new("search_knowledge", "Semantic search over movie summaries").with_parameters(json!({
            "type": "object",
            "properties": {
                "query": {"type": "string"},
                "max_results": {"type": "integer", "default": 5}
            },
            "required": ["query"]
        })),
    );

    let download = HandlerDescriptor::new(
        "download_handler",
        "Expert in finding movie files and managing downloads: search, add, check status, pause or resume",
        Arc::new(HttpCapability::new(
            "download_client",
            service_url("TURTLE_DOWNLOADS_URL", "http://127.0.0.1:9002/downloads"),
        )),
    )
    .with_action(
        ActionSpec::new("search_downloads", "Search download sources for a title").with_parameters(json!({
            "type": "object",
            "properties": {
                "query": {"type": "string"},
                "limit": {"type": "integer", "default": 20}
            },
            "required": ["query"]
        })),
    )
    .with_action(
        ActionSpec::new("list_downloads", "List current downloads and their progress").with_parameters(json!({
            "type": "object",
            "properties": {
                "filter": {"type": "string", "enum": ["all", "downloading", "completed", "paused"]}
            },
            "required": []
        })),
    )
    .with_action(
        ActionSpec::new("add_download", "Start downloading from a magnet link or URL").with_parameters(json!({
            "type": "object",
            "properties": {"url": {"type": "string"}},
            "required": ["url"]
        })),
    )
    .with_action(
        ActionSpec::new("control_download", "Pause, resume or delete a download").with_parameters(json!({
            "type": "object",
            "properties": {
                "hash": {"type": "string"},
                "action": {"type": "string", "enum": ["pause", "resume", "delete"]}
            },
            "required": ["hash", "action"]
        })),
    );

    let library = HandlerDescriptor::new(
        "library_handler",
        "Expert in the local movie library: which movies the user already owns",
        Arc::new(HttpCapability::new(
            "library_scanner",
            service_url("TURTLE_LIBRARY_URL", "http://127.0.0.1:9003/library"),
        )),
    )
    .with_action(ActionSpec::new("scan_library", "Scan the network share for movie files"));

    vec![knowledge, download, library]
}

/// 由配置构造注册表；未配置 handler 时使用内置三个
pub fn build_registry(cfg: &AppConfig) -> Result<HandlerRegistry, OrchestrationError> {
    let handlers = if cfg.handlers.is_empty() {
        default_handlers()
    } else {
        cfg.handlers.iter().map(handler_from_config).collect()
    };
    let mut registry = HandlerRegistry::new();
    for h in handlers {
        registry.register(h)?;
    }
    Ok(registry)
}

/// 编排器构建器
pub struct OrchestratorBuilder {
    config: AppConfig,
    router_llm: Option<Arc<dyn LlmClient>>,
    handler_llm: Option<Arc<dyn LlmClient>>,
    store: Option<Arc<dyn ThreadStore>>,
    registry: Option<HandlerRegistry>,
}

impl OrchestratorBuilder {
    pub fn new(config: AppConfig) -> Self {
        Self {
            config,
            router_llm: None,
            handler_llm: None,
            store: None,
            registry: None,
        }
    }

    /// 指定 Router 与 Handler 使用的 LLM（默认按配置创建）
    pub fn with_llms(mut self, router: Arc<dyn LlmClient>, handler: Arc<dyn LlmClient>) -> Self {
        self.router_llm = Some(router);
        self.handler_llm = Some(handler);
        self
    }

    pub fn with_store(mut self, store: Arc<dyn ThreadStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn with_registry(mut self, registry: HandlerRegistry) -> Self {
        self.registry = Some(registry);
        self
    }

    pub async fn build(self) -> Result<Orchestrator, OrchestrationError> {
        let cfg = &self.config;
        let registry = match self.registry {
            Some(r) => r,
            None => build_registry(cfg)?,
        };
        if registry.is_empty() {
            return Err(OrchestrationError::InvalidState(
                "at least one handler must be registered".to_string(),
            ));
        }
        let registry = Arc::new(registry);

        let store = match self.store {
            Some(s) => s,
            None => create_store(cfg).await?,
        };
        let router_llm = self
            .router_llm
            .unwrap_or_else(|| create_llm_from_config(cfg, &cfg.llm.supervisor_model));
        let handler_llm = self
            .handler_llm
            .unwrap_or_else(|| create_llm_from_config(cfg, &cfg.llm.agent_model));

        let orch = &cfg.orchestrator;
        let router = Router::new(router_llm, registry.clone())
            .with_timeout(Duration::from_secs(orch.routing_timeout_secs.max(1)));
        let scheduler = Arc::new(TaskScheduler::new(orch.max_concurrent_capabilities));
        let runtime = HandlerRuntime::new(handler_llm, CapabilityExecutor::new(scheduler))
            .with_reasoning_timeout(Duration::from_secs(orch.reasoning_timeout_secs.max(1)));

        tracing::info!(
            handlers = ?registry.names(),
            max_round_trips = orch.max_round_trips,
            store = %cfg.store.backend,
            "orchestrator ready"
        );
        Ok(Orchestrator::new(store, registry, router, runtime).with_max_round_trips(orch.max_round_trips))
    }
}

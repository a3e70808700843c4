//! 核心编排层：错误与恢复、轮次状态机、路由、任务调度、主控循环与构建

pub mod builder;
pub mod error;
pub mod orchestrator;
pub mod recovery;
pub mod router;
pub mod state;
pub mod task_scheduler;

pub use builder::{build_registry, create_llm_from_config, create_store, default_handlers, OrchestratorBuilder};
pub use error::{HandlerError, OrchestrationError, RecoveryAction};
pub use orchestrator::{
    Orchestrator, TurnOutcome, TurnSession, CEILING_FALLBACK, DEFAULT_MAX_ROUND_TRIPS, NO_RESPONSE,
};
pub use recovery::RecoveryEngine;
pub use router::{Router, RouterDecision, FINISH, ROUTING_APOLOGY};
pub use state::{TurnMachine, TurnPhase};
pub use task_scheduler::TaskScheduler;

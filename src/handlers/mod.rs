//! Handler 层：能力契约、执行器、注册表与 HTTP 适配器

pub mod capability;
pub mod descriptor;
pub mod http;

pub use capability::{Capability, CapabilityError, CapabilityExecutor};
pub use descriptor::{
    ActionSpec, HandlerDescriptor, HandlerRegistry, DEFAULT_CAPABILITY_TIMEOUT, DEFAULT_STEP_BUDGET,
};
pub use http::HttpCapability;

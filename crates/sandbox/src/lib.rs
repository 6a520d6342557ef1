mod config;
mod error;
mod factory;
mod policy;
mod sandbox;
mod types;

pub use config::SandboxConfig;
pub use error::{Result, SandboxError};
pub use factory::SandboxFactory;
pub use policy::{CapabilityPolicy, DEFAULT_ALLOWED_MODULES, PolicyViolation, root_module};
pub use sandbox::Sandbox;
pub use types::{ExecResult, FaultKind, GuestFault, Termination};

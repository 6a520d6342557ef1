use async_trait::async_trait;

use crate::config::SandboxConfig;
use crate::error::Result;
use crate::sandbox::Sandbox;

#[async_trait]
pub trait SandboxFactory: Send + Sync {
    /// Human-readable name for this factory implementation (e.g. "python").
    fn name(&self) -> &str;
    /// Load the interpreter and install the capability policy.
    ///
    /// The returned sandbox is ready to run guest code. Boot happens once per
    /// worker lifetime; callers never boot a second instance to recover from
    /// a guest fault.
    async fn boot(&self, config: SandboxConfig) -> Result<Box<dyn Sandbox>>;
}

use async_trait::async_trait;
use sandbox::{Result, Sandbox, SandboxConfig, SandboxError, SandboxFactory};
use tracing::info;

use crate::sandbox::PythonSandbox;

/// Boots [`PythonSandbox`] instances off the async runtime.
#[derive(Debug, Default, Clone, Copy)]
pub struct PythonFactory;

impl PythonFactory {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl SandboxFactory for PythonFactory {
    fn name(&self) -> &str {
        "python"
    }

    async fn boot(&self, config: SandboxConfig) -> Result<Box<dyn Sandbox>> {
        info!(sandbox_id = %config.id, "booting python sandbox");
        let sandbox = tokio::task::spawn_blocking(move || PythonSandbox::boot(&config))
            .await
            .map_err(|e| SandboxError::BootFailed(format!("boot task failed: {e}")))??;
        Ok(Box::new(sandbox))
    }
}

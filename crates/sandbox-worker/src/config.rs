use std::path::Path;

use sandbox::CapabilityPolicy;
use serde::{Deserialize, Serialize};

use crate::error::{WorkerError, WorkerResult};
use crate::worker::DEFAULT_QUEUE_CAPACITY;

#[derive(Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    /// Requests that may wait behind the one currently running.
    pub queue_capacity: usize,
    pub policy: CapabilityPolicy,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            policy: CapabilityPolicy::default(),
        }
    }
}

impl WorkerConfig {
    pub fn validate(&self) -> WorkerResult<()> {
        if self.queue_capacity == 0 {
            return Err(WorkerError::Config("queue_capacity must be at least 1".into()));
        }
        self.policy
            .validate()
            .map_err(|e| WorkerError::Config(e.to_string()))
    }
}

/// Load and validate a worker config from a YAML file.
pub async fn load(path: &Path) -> WorkerResult<WorkerConfig> {
    let content = tokio::fs::read_to_string(path)
        .await
        .map_err(|e| WorkerError::Config(format!("read {}: {e}", path.display())))?;
    let config: WorkerConfig = serde_yaml_ng::from_str(&content)
        .map_err(|e| WorkerError::Config(format!("parse {}: {e}", path.display())))?;
    config
        .validate()
        .map_err(|e| WorkerError::Config(format!("{}: {e}", path.display())))?;
    Ok(config)
}

/// Load `path` if given, otherwise use defaults.
pub async fn load_or_default(path: Option<&Path>) -> WorkerResult<WorkerConfig> {
    match path {
        Some(path) => load(path).await,
        None => Ok(WorkerConfig::default()),
    }
}

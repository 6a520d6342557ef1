#[derive(Debug, thiserror::Error)]
pub enum SandboxError {
    #[error("backend not available: {0}")]
    BackendNotAvailable(String),

    #[error("sandbox boot failed: {0}")]
    BootFailed(String),

    #[error("execution failed: {0}")]
    ExecFailed(String),

    #[error("sandbox unreachable: {0}")]
    Unreachable(String),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, SandboxError>;

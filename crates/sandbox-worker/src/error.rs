use std::time::Duration;

#[derive(Debug, thiserror::Error)]
pub enum WorkerError {
    #[error("worker closed")]
    Closed,

    #[error("timed out after {}ms", .0.as_millis())]
    Timeout(Duration),

    #[error("infrastructure error: {0}")]
    Infrastructure(String),

    #[error("config error: {0}")]
    Config(String),

    #[error("protocol error: {0}")]
    Protocol(#[from] sandbox_proto::ProtocolError),

    #[error("sandbox error: {0}")]
    Sandbox(#[from] sandbox::SandboxError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

pub type WorkerResult<T> = Result<T, WorkerError>;

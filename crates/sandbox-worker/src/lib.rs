//! Sandbox worker: owns one sandbox, serializes execution requests and
//! speaks the line protocol from `sandbox-proto`.

mod client;
pub mod config;
mod connection;
mod error;
mod state;
mod worker;

pub use client::{Client, RunReply};
pub use config::WorkerConfig;
pub use connection::serve;
pub use error::{WorkerError, WorkerResult};
pub use state::LifecycleState;
pub use worker::{DEFAULT_QUEUE_CAPACITY, Events, WorkerHandle, spawn};

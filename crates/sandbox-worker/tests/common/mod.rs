#![allow(dead_code)]

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use sandbox::{
    CapabilityPolicy, ExecResult, Result, Sandbox, SandboxConfig, SandboxError, SandboxFactory,
    Termination,
};
use sandbox_proto::Response;
use sandbox_worker::{Events, LifecycleState, WorkerHandle};

/// Sandbox whose behaviour is driven by the submitted text:
/// `sleep <ms>` blocks, `infra` fails on the host side, `crash` panics,
/// anything else is echoed to stdout.
pub struct ScriptedSandbox {
    id: String,
    policy: CapabilityPolicy,
}

impl Sandbox for ScriptedSandbox {
    fn id(&self) -> &str {
        &self.id
    }

    fn policy(&self) -> &CapabilityPolicy {
        &self.policy
    }

    fn run(&mut self, code: &str) -> Result<ExecResult> {
        let started = Instant::now();
        if code == "infra" {
            return Err(SandboxError::ExecFailed("stream redirect failed".into()));
        }
        if code == "crash" {
            panic!("scripted crash");
        }
        if let Some(ms) = code.strip_prefix("sleep ") {
            std::thread::sleep(Duration::from_millis(ms.parse().unwrap()));
        }
        Ok(ExecResult {
            termination: Termination::Completed,
            stdout: format!("{code}\n"),
            stderr: String::new(),
            value: None,
            elapsed: started.elapsed(),
        })
    }
}

pub struct ScriptedFactory {
    pub boot_delay: Duration,
    pub fail_boot: bool,
}

impl ScriptedFactory {
    pub fn ok(boot_delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            boot_delay,
            fail_boot: false,
        })
    }

    pub fn failing() -> Arc<Self> {
        Arc::new(Self {
            boot_delay: Duration::ZERO,
            fail_boot: true,
        })
    }
}

#[async_trait]
impl SandboxFactory for ScriptedFactory {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn boot(&self, config: SandboxConfig) -> Result<Box<dyn Sandbox>> {
        tokio::time::sleep(self.boot_delay).await;
        if self.fail_boot {
            return Err(SandboxError::BootFailed("interpreter missing".into()));
        }
        Ok(Box::new(ScriptedSandbox {
            id: config.id.to_string(),
            policy: config.policy,
        }))
    }
}

pub async fn next_event(events: &mut Events) -> Response {
    tokio::time::timeout(Duration::from_secs(10), events.next())
        .await
        .expect("timed out waiting for worker event")
        .expect("worker exited")
}

pub async fn wait_for_state(handle: &WorkerHandle, state: LifecycleState) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while handle.state() != state {
        assert!(
            Instant::now() < deadline,
            "state stayed {} while waiting for {state}",
            handle.state()
        );
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

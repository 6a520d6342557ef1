//! Lifecycle supervisor.
//!
//! A worker owns exactly one sandbox. It boots the sandbox as soon as it is
//! spawned, then services run requests strictly one at a time in the order
//! they were submitted. Requests submitted before boot completes wait in the
//! queue and run once the worker is ready.

use std::sync::Arc;

use sandbox::{ExecResult, Sandbox, SandboxConfig, SandboxError, SandboxFactory};
use sandbox_proto::{Done, Request, RequestId, Response};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::error::{WorkerError, WorkerResult};
use crate::state::{LifecycleState, StateCell};

pub const DEFAULT_QUEUE_CAPACITY: usize = 64;

/// Caller side of a worker: submits requests and observes the lifecycle.
///
/// Clones share the same queue. The worker stops once every handle is
/// dropped and the queue has drained.
#[derive(Debug, Clone)]
pub struct WorkerHandle {
    requests: mpsc::Sender<Request>,
    state: Arc<StateCell>,
}

impl WorkerHandle {
    /// Queue a request. Waits while the queue is full.
    pub async fn submit(&self, request: Request) -> WorkerResult<()> {
        self.requests
            .send(request)
            .await
            .map_err(|_| WorkerError::Closed)
    }

    pub fn state(&self) -> LifecycleState {
        self.state.current()
    }
}

/// Stream of responses emitted by a worker, in emission order.
#[derive(Debug)]
pub struct Events {
    rx: mpsc::UnboundedReceiver<Response>,
}

impl Events {
    /// Receive the next response. Returns `None` once the worker has exited.
    pub async fn next(&mut self) -> Option<Response> {
        self.rx.recv().await
    }
}

/// Spawn a worker on the current tokio runtime and start booting its sandbox.
pub fn spawn(
    factory: Arc<dyn SandboxFactory>,
    config: SandboxConfig,
    queue_capacity: usize,
) -> (WorkerHandle, Events) {
    let (request_tx, request_rx) = mpsc::channel(queue_capacity.max(1));
    let (event_tx, event_rx) = mpsc::unbounded_channel();
    let state = Arc::new(StateCell::new());

    tokio::spawn(supervise(Supervisor {
        factory,
        config,
        state: state.clone(),
        requests: request_rx,
        events: event_tx,
        sandbox: None,
        unavailable: String::new(),
    }));

    (
        WorkerHandle {
            requests: request_tx,
            state,
        },
        Events { rx: event_rx },
    )
}

struct Supervisor {
    factory: Arc<dyn SandboxFactory>,
    config: SandboxConfig,
    state: Arc<StateCell>,
    requests: mpsc::Receiver<Request>,
    events: mpsc::UnboundedSender<Response>,
    sandbox: Option<Box<dyn Sandbox>>,
    /// Why `sandbox` is `None` after boot; sent with every refused request.
    unavailable: String,
}

impl Supervisor {
    fn transition(&self, from: LifecycleState, to: LifecycleState) {
        if !self.state.transition(from, to) {
            warn!(from = %from, to = %to, current = %self.state.current(), "rejected lifecycle transition");
        }
    }

    /// Returns `false` once nobody is listening.
    fn emit(&self, response: Response) -> bool {
        self.events.send(response).is_ok()
    }

    async fn boot(&mut self) {
        self.transition(LifecycleState::Uninitialized, LifecycleState::Booting);
        let config = self.config.clone();
        info!(sandbox_id = %config.id, backend = self.factory.name(), "booting sandbox");

        match self.factory.boot(config).await {
            Ok(sandbox) => {
                self.sandbox = Some(sandbox);
                self.transition(LifecycleState::Booting, LifecycleState::Ready);
                info!(sandbox_id = %self.config.id, "sandbox ready");
                self.emit(Response::Ready);
            }
            Err(e) => {
                self.transition(LifecycleState::Booting, LifecycleState::Failed);
                error!(sandbox_id = %self.config.id, error = %e, "sandbox boot failed");
                self.unavailable = "boot never completed".into();
                self.emit(Response::error(None, e.to_string()));
            }
        }
    }

    /// Handle one request. Returns `false` once nobody is listening.
    async fn handle(&mut self, request: Request) -> bool {
        let Request::Run { id, code } = request;
        let label = id_label(id.as_ref());

        let Some(mut sandbox) = self.sandbox.take() else {
            warn!(id = %label, reason = %self.unavailable, "refusing request");
            return self.emit(Response::error(id, self.unavailable.clone()));
        };

        self.transition(LifecycleState::Ready, LifecycleState::Busy);
        debug!(id = %label, bytes = code.len(), "execution started");

        let joined = tokio::task::spawn_blocking(move || {
            let result = sandbox.run(&code);
            (sandbox, result)
        })
        .await;

        match joined {
            Ok((sandbox, Ok(result))) => {
                self.sandbox = Some(sandbox);
                self.transition(LifecycleState::Busy, LifecycleState::Ready);
                info!(
                    id = %label,
                    success = result.success(),
                    elapsed_ms = result.elapsed_ms(),
                    "execution finished"
                );
                for response in responses(id, result) {
                    if !self.emit(response) {
                        return false;
                    }
                }
                true
            }
            Ok((sandbox, Err(e))) => {
                self.sandbox = Some(sandbox);
                self.transition(LifecycleState::Busy, LifecycleState::Ready);
                warn!(id = %label, error = %e, "execution infrastructure failure");
                self.emit(Response::error(id, e.to_string()))
            }
            Err(e) => {
                self.transition(LifecycleState::Busy, LifecycleState::Failed);
                error!(id = %label, error = %e, "sandbox thread died");
                self.unavailable = SandboxError::Unreachable(e.to_string()).to_string();
                self.emit(Response::error(id, self.unavailable.clone()))
            }
        }
    }
}

async fn supervise(mut supervisor: Supervisor) {
    supervisor.boot().await;

    while let Some(request) = supervisor.requests.recv().await {
        if !supervisor.handle(request).await {
            debug!("response stream closed, stopping worker");
            return;
        }
    }
    debug!(state = %supervisor.state.current(), "request queue closed, stopping worker");
}

/// Per-request messages: streamed output first, then the terminal `done`.
pub(crate) fn responses(id: Option<RequestId>, result: ExecResult) -> Vec<Response> {
    let mut out = Vec::with_capacity(3);
    if !result.stdout.is_empty() {
        out.push(Response::Stdout {
            id: id.clone(),
            data: result.stdout.clone(),
        });
    }
    if !result.stderr.is_empty() {
        out.push(Response::Stderr {
            id: id.clone(),
            data: result.stderr.clone(),
        });
    }
    out.push(Response::Done(Done {
        id,
        success: result.success(),
        error: result.error().map(str::to_owned),
        elapsed_ms: result.elapsed_ms(),
        stdout: result.stdout,
        stderr: result.stderr,
        result: result.value,
    }));
    out
}

pub(crate) fn id_label(id: Option<&RequestId>) -> String {
    id.map_or_else(|| "-".to_string(), ToString::to_string)
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use sandbox::{FaultKind, GuestFault, Termination};

    use super::*;

    fn result(termination: Termination, stdout: &str, stderr: &str) -> ExecResult {
        ExecResult {
            termination,
            stdout: stdout.into(),
            stderr: stderr.into(),
            value: None,
            elapsed: Duration::from_millis(3),
        }
    }

    #[test]
    fn responses_stream_output_before_done() {
        let out = responses(
            Some(RequestId::Number(1)),
            result(Termination::Completed, "2\n", ""),
        );
        assert_eq!(out.len(), 2);
        assert!(matches!(&out[0], Response::Stdout { data, .. } if data == "2\n"));
        let Response::Done(done) = &out[1] else {
            panic!("expected done, got {:?}", out[1]);
        };
        assert!(done.success);
        assert_eq!(done.stdout, "2\n");
        assert_eq!(done.elapsed_ms, 3);
        assert!(done.error.is_none());
    }

    #[test]
    fn responses_for_fault_carry_error() {
        let out = responses(
            Some(RequestId::from("a")),
            result(
                Termination::Fault(GuestFault {
                    kind: FaultKind::ImportRejected,
                    message: "ImportError: Import of 'os' is not allowed".into(),
                }),
                "",
                "Traceback ...\nImportError: Import of 'os' is not allowed\n",
            ),
        );
        assert_eq!(out.len(), 2);
        assert!(matches!(&out[0], Response::Stderr { .. }));
        let Response::Done(done) = &out[1] else {
            panic!("expected done");
        };
        assert!(!done.success);
        assert_eq!(
            done.error.as_deref(),
            Some("ImportError: Import of 'os' is not allowed")
        );
        assert!(out.iter().all(|r| r.id() == Some(&RequestId::from("a"))));
    }

    #[test]
    fn silent_run_emits_only_done() {
        let out = responses(None, result(Termination::CleanExit, "", ""));
        assert_eq!(out.len(), 1);
        assert!(matches!(&out[0], Response::Done(d) if d.success && d.id.is_none()));
    }

    #[test]
    fn id_labels() {
        assert_eq!(id_label(None), "-");
        assert_eq!(id_label(Some(&RequestId::Number(9))), "9");
    }
}

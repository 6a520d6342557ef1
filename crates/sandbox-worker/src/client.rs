//! Correlating caller for a worker.
//!
//! Assigns numeric request ids, waits for the terminal response of a given
//! id, and keeps responses for its other ids until they are asked for.
//! Replies to ids this client did not assign are dropped; a reply is held
//! until `wait_for` collects it, so every submitted id should be waited on.

use std::collections::{HashMap, HashSet};
use std::time::Duration;

use sandbox_proto::{Done, Request, RequestId, Response};
use tokio::time::{self, Instant};
use tracing::debug;

use crate::error::{WorkerError, WorkerResult};
use crate::worker::{Events, WorkerHandle};

/// Terminal outcome of one request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunReply {
    Done(Done),
    /// Infrastructure failure reported by the worker.
    Error(String),
}

impl RunReply {
    pub fn done(&self) -> Option<&Done> {
        match self {
            Self::Done(done) => Some(done),
            Self::Error(_) => None,
        }
    }
}

pub struct Client {
    handle: WorkerHandle,
    events: Events,
    next_id: u64,
    ready: bool,
    /// Id-less error emitted when boot failed.
    boot_error: Option<String>,
    /// Ids submitted by this client and not yet returned by `wait_for`.
    outstanding: HashSet<RequestId>,
    /// Terminal replies that arrived while waiting for a different id.
    finished: HashMap<RequestId, RunReply>,
}

impl Client {
    pub fn new(handle: WorkerHandle, events: Events) -> Self {
        Self {
            handle,
            events,
            next_id: 1,
            ready: false,
            boot_error: None,
            outstanding: HashSet::new(),
            finished: HashMap::new(),
        }
    }

    /// Wait until the worker reports `ready`, or fail with the boot error.
    pub async fn wait_ready(&mut self, timeout: Option<Duration>) -> WorkerResult<()> {
        let deadline = deadline(timeout);
        loop {
            if self.ready {
                return Ok(());
            }
            if let Some(reason) = &self.boot_error {
                return Err(WorkerError::Infrastructure(reason.clone()));
            }
            let response = self.recv(deadline, timeout).await?;
            self.dispatch(response);
        }
    }

    /// Queue `code` and return the id assigned to it.
    pub async fn submit(&mut self, code: impl Into<String>) -> WorkerResult<RequestId> {
        let id = RequestId::Number(self.next_id);
        self.next_id += 1;
        self.handle
            .submit(Request::Run {
                id: Some(id.clone()),
                code: code.into(),
            })
            .await?;
        self.outstanding.insert(id.clone());
        Ok(id)
    }

    /// Wait for the terminal response of `id`.
    pub async fn wait_for(
        &mut self,
        id: &RequestId,
        timeout: Option<Duration>,
    ) -> WorkerResult<RunReply> {
        let deadline = deadline(timeout);
        loop {
            if let Some(reply) = self.finished.remove(id) {
                self.outstanding.remove(id);
                return Ok(reply);
            }
            let response = self.recv(deadline, timeout).await?;
            self.dispatch(response);
        }
    }

    /// Submit and wait in one step.
    pub async fn run(
        &mut self,
        code: impl Into<String>,
        timeout: Option<Duration>,
    ) -> WorkerResult<RunReply> {
        let id = self.submit(code).await?;
        self.wait_for(&id, timeout).await
    }

    async fn recv(
        &mut self,
        deadline: Option<Instant>,
        timeout: Option<Duration>,
    ) -> WorkerResult<Response> {
        let next = match deadline {
            Some(deadline) => time::timeout_at(deadline, self.events.next())
                .await
                .map_err(|_| WorkerError::Timeout(timeout.unwrap_or_default()))?,
            None => self.events.next().await,
        };
        next.ok_or(WorkerError::Closed)
    }

    fn dispatch(&mut self, response: Response) {
        match response {
            Response::Ready => self.ready = true,
            Response::Done(done) => {
                if let Some(id) = done.id.clone() {
                    self.keep(id, RunReply::Done(done));
                }
            }
            Response::Error { id: Some(id), data } => {
                self.keep(id, RunReply::Error(data));
            }
            Response::Error { id: None, data } => {
                if !self.ready {
                    self.boot_error = Some(data);
                }
            }
            // Output is repeated in `done`.
            Response::Stdout { .. } | Response::Stderr { .. } => {}
        }
    }

    fn keep(&mut self, id: RequestId, reply: RunReply) {
        if self.outstanding.contains(&id) {
            self.finished.insert(id, reply);
        } else {
            debug!(id = %id, "dropping reply for a request this client did not submit");
        }
    }
}

fn deadline(timeout: Option<Duration>) -> Option<Instant> {
    timeout.map(|t| Instant::now() + t)
}

//! Line-delimited JSON protocol between a caller and a sandbox worker.
//!
//! ## Wire Format
//!
//! One JSON object per line, UTF-8, terminated by `\n` (a preceding `\r` is
//! tolerated). Every object carries a `kind` discriminator.
//!
//! ## Message Kinds
//!
//! | kind   | Direction | Fields |
//! |--------|-----------|--------|
//! | run    | C→W       | `id?`, `code` |
//! | ready  | W→C       | (none) |
//! | stdout | W→C       | `id?`, `data` |
//! | stderr | W→C       | `id?`, `data` |
//! | done   | W→C       | `id?`, `success`, `stdout`, `stderr`, `result`, `elapsed_ms`, `error?` |
//! | error  | W→C       | `id?`, `data` |
//!
//! `id` is chosen by the caller (number or string) and echoed on every
//! message that belongs to the request. Inbound objects with an unknown
//! `kind` are ignored rather than rejected.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Maximum line length, excluding the terminator (16 MB).
pub const MAX_MESSAGE_SIZE: usize = 16 * 1024 * 1024;

pub const KIND_RUN: &str = "run";

/// Protocol error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    MessageTooLarge(usize),
    Malformed(String),
    Serialize(String),
}

impl fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::MessageTooLarge(size) => write!(f, "message too large: {size}"),
            Self::Malformed(msg) => write!(f, "malformed message: {msg}"),
            Self::Serialize(msg) => write!(f, "cannot serialize message: {msg}"),
        }
    }
}

impl std::error::Error for ProtocolError {}

/// Caller-assigned request identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RequestId {
    Number(u64),
    Text(String),
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Number(n) => write!(f, "{n}"),
            Self::Text(s) => f.write_str(s),
        }
    }
}

impl From<u64> for RequestId {
    fn from(n: u64) -> Self {
        Self::Number(n)
    }
}

impl From<&str> for RequestId {
    fn from(s: &str) -> Self {
        Self::Text(s.to_string())
    }
}

// ---------------------------------------------------------------------------
// Messages
// ---------------------------------------------------------------------------

/// Caller → worker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Request {
    Run {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        id: Option<RequestId>,
        code: String,
    },
}

impl Request {
    pub fn run(id: impl Into<RequestId>, code: impl Into<String>) -> Self {
        Self::Run {
            id: Some(id.into()),
            code: code.into(),
        }
    }

    pub fn id(&self) -> Option<&RequestId> {
        match self {
            Self::Run { id, .. } => id.as_ref(),
        }
    }
}

/// Terminal message for one request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Done {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<RequestId>,
    pub success: bool,
    pub stdout: String,
    pub stderr: String,
    /// Display value of the trailing expression, `null` when there is none.
    pub result: Option<String>,
    pub elapsed_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Worker → caller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Response {
    Ready,
    Stdout {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        id: Option<RequestId>,
        data: String,
    },
    Stderr {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        id: Option<RequestId>,
        data: String,
    },
    Done(Done),
    /// Infrastructure failure; never used for errors raised by guest code.
    Error {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        id: Option<RequestId>,
        data: String,
    },
}

impl Response {
    pub fn error(id: Option<RequestId>, data: impl Into<String>) -> Self {
        Self::Error {
            id,
            data: data.into(),
        }
    }

    pub fn id(&self) -> Option<&RequestId> {
        match self {
            Self::Ready => None,
            Self::Stdout { id, .. } | Self::Stderr { id, .. } | Self::Error { id, .. } => {
                id.as_ref()
            }
            Self::Done(done) => done.id.as_ref(),
        }
    }
}

/// Result of parsing one inbound line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Inbound {
    Request(Request),
    /// Well-formed object with a `kind` this worker does not handle.
    Ignored(String),
}

// ---------------------------------------------------------------------------
// Encode / Decode
// ---------------------------------------------------------------------------

/// Serialize a message as one newline-terminated line.
pub fn encode<T: Serialize>(msg: &T) -> Result<Vec<u8>, ProtocolError> {
    let mut buf = serde_json::to_vec(msg).map_err(|e| ProtocolError::Serialize(e.to_string()))?;
    if buf.len() > MAX_MESSAGE_SIZE {
        return Err(ProtocolError::MessageTooLarge(buf.len()));
    }
    buf.push(b'\n');
    Ok(buf)
}

/// Parse a caller line. Unknown kinds are reported as [`Inbound::Ignored`].
pub fn parse_request(line: &[u8]) -> Result<Inbound, ProtocolError> {
    let value: serde_json::Value =
        serde_json::from_slice(line).map_err(|e| ProtocolError::Malformed(e.to_string()))?;
    let kind = value
        .get("kind")
        .and_then(serde_json::Value::as_str)
        .ok_or_else(|| ProtocolError::Malformed("missing string field `kind`".into()))?;
    if kind != KIND_RUN {
        return Ok(Inbound::Ignored(kind.to_string()));
    }
    serde_json::from_value(value)
        .map(Inbound::Request)
        .map_err(|e| ProtocolError::Malformed(e.to_string()))
}

/// Best-effort `id` of a line that failed to parse as a request, so the
/// error reply can still be correlated.
pub fn request_id_hint(line: &[u8]) -> Option<RequestId> {
    let value: serde_json::Value = serde_json::from_slice(line).ok()?;
    serde_json::from_value(value.get("id")?.clone()).ok()
}

// ---------------------------------------------------------------------------
// Decoder
// ---------------------------------------------------------------------------

/// Splits a byte stream into lines, tolerating partial reads.
pub struct Decoder {
    buf: Vec<u8>,
    /// Prefix of `buf` already searched for a newline.
    scanned: usize,
    /// Set after an oversized line; bytes are dropped up to the next newline.
    discarding: bool,
}

impl Decoder {
    pub fn new() -> Self {
        Self {
            buf: Vec::with_capacity(64 * 1024),
            scanned: 0,
            discarding: false,
        }
    }

    /// Feed data and extract complete, non-blank lines in arrival order.
    ///
    /// An oversized line yields [`ProtocolError::MessageTooLarge`] in its
    /// place; lines after it are still returned.
    pub fn decode(&mut self, data: &[u8]) -> Vec<Result<Vec<u8>, ProtocolError>> {
        self.buf.extend_from_slice(data);
        let mut frames = Vec::new();
        let mut start = 0;

        while let Some(end) = self.next_newline() {
            let line = self.buf.get(start..end).unwrap_or_default();
            start = end + 1;
            if self.discarding {
                self.discarding = false;
                continue;
            }
            let line = line.strip_suffix(b"\r").unwrap_or(line);
            if line.len() > MAX_MESSAGE_SIZE {
                frames.push(Err(ProtocolError::MessageTooLarge(line.len())));
            } else if !line.iter().all(u8::is_ascii_whitespace) {
                frames.push(Ok(line.to_vec()));
            }
        }
        self.buf.drain(..start);
        self.scanned = self.buf.len();

        if self.buf.len() > MAX_MESSAGE_SIZE {
            frames.push(Err(ProtocolError::MessageTooLarge(self.buf.len())));
            self.discarding = true;
        }
        if self.discarding {
            self.buf.clear();
            self.scanned = 0;
        }
        frames
    }

    fn next_newline(&mut self) -> Option<usize> {
        let offset = self
            .buf
            .get(self.scanned..)?
            .iter()
            .position(|b| *b == b'\n')?;
        let end = self.scanned + offset;
        self.scanned = end + 1;
        Some(end)
    }

/// Take a final unterminated line at end of stream.
    pub fn finish(&mut self) -> Option<Vec<u8>> {
        let rest = std::mem::take(&mut self.buf);
        self.scanned = 0;
        if self.discarding || rest.iter().all(u8::is_ascii_whitespace) {
            self.discarding = false;
            return None;
        }
        Some(rest)
    }
}

impl Default for Decoder {
    fn default() -> Self {
        Self::new()
    }
}

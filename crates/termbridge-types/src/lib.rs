//! Core types for termbridge
//!
//! Wire protocol messages exchanged between the browser terminal and the
//! server, plus the small vocabulary (session states, signal kinds, error
//! codes) shared by every termbridge crate.

use serde::{Deserialize, Serialize};
use thiserror::Error;

// ============================================================================
// Constants
// ============================================================================

/// Detached sessions older than this are force-terminated
pub const DEFAULT_IDLE_TIMEOUT_SECS: u64 = 300; // 5 minutes

/// Capacity of the per-session output replay buffer
pub const DEFAULT_RING_BUFFER_BYTES: usize = 64 * 1024;

/// Number of PTY writes allowed to run on blocking threads at once
pub const DEFAULT_WORKER_POOL_SIZE: usize = 4;

/// Delay between SIGTERM and the follow-up SIGKILL
pub const DEFAULT_TERMINATE_GRACE_MS: u64 = 3_000;

/// Longest a single input write waits on a terminal that reads nothing
pub const DEFAULT_WRITE_DEADLINE_SECS: u64 = 30;

pub const DEFAULT_ROWS: u16 = 24;
pub const DEFAULT_COLS: u16 = 80;

/// End-of-transmission (Ctrl+D), written to the PTY for `signal{eof}`
pub const EOT_BYTE: u8 = 0x04;

// ============================================================================
// Session vocabulary
// ============================================================================

/// Lifecycle state of a terminal session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    Starting,
    Active,
    Detached,
    Terminated,
}

impl SessionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionState::Starting => "starting",
            SessionState::Active => "active",
            SessionState::Detached => "detached",
            SessionState::Terminated => "terminated",
        }
    }

    pub fn is_terminated(&self) -> bool {
        matches!(self, SessionState::Terminated)
    }
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Control signals a client may request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SignalKind {
    /// SIGINT to the foreground process group
    Interrupt,
    /// SIGTERM, escalating to SIGKILL after the grace period
    Terminate,
    /// End-of-transmission byte written to the terminal input
    Eof,
}

impl std::fmt::Display for SignalKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SignalKind::Interrupt => write!(f, "interrupt"),
            SignalKind::Terminate => write!(f, "terminate"),
            SignalKind::Eof => write!(f, "eof"),
        }
    }
}

/// Machine-readable code attached to every `error` message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    SpawnFailed,
    SessionNotFound,
    SessionTerminated,
    NotAttached,
    InvalidInput,
    ProtocolError,
    IoError,
    SignalFailed,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::SpawnFailed => "spawn_failed",
            ErrorCode::SessionNotFound => "session_not_found",
            ErrorCode::SessionTerminated => "session_terminated",
            ErrorCode::NotAttached => "not_attached",
            ErrorCode::InvalidInput => "invalid_input",
            ErrorCode::ProtocolError => "protocol_error",
            ErrorCode::IoError => "io_error",
            ErrorCode::SignalFailed => "signal_failed",
        }
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Session information for listing
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionInfo {
    pub session_key: String,
    pub state: SessionState,
    pub pid: Option<u32>,
    pub command: String,
    pub working_dir: String,
    pub created_at: String,
    pub idle_secs: u64,
    pub buffered_bytes: usize,
    pub rows: u16,
    pub cols: u16,
    pub exit_code: Option<i32>,
}

// ============================================================================
// Wire protocol
// ============================================================================

/// Messages sent from client to server
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    Input { data: String },
    Resize { rows: u16, cols: u16 },
    Signal { kind: SignalKind },
}

impl ClientMessage {
    const TYPES: [&'static str; 3] = ["input", "resize", "signal"];
}

/// Messages sent from server to client
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    Output {
        data: String,
    },
    Status {
        connected: bool,
        #[serde(rename = "sessionKey")]
        session_key: Option<String>,
    },
    Error {
        message: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        code: Option<ErrorCode>,
    },
    Closed {
        #[serde(rename = "exitCode")]
        exit_code: Option<i32>,
    },
}

impl ServerMessage {
    pub fn error(code: ErrorCode, message: impl Into<String>) -> Self {
        ServerMessage::Error {
            message: message.into(),
            code: Some(code),
        }
    }

    pub fn encode(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

/// Failure to turn a client frame into a [`ClientMessage`]
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("malformed message: {0}")]
    Malformed(#[source] serde_json::Error),
    #[error("message has no \"type\" field")]
    MissingType,
    #[error("unknown message type \"{0}\"")]
    UnknownType(String),
    #[error("invalid \"{kind}\" message: {source}")]
    InvalidPayload {
        kind: String,
        #[source]
        source: serde_json::Error,
    },
}

impl ClientMessage {
    /// Decode one text frame.
    ///
    /// Unknown `type` values are rejected rather than ignored.
    pub fn decode(frame: &str) -> Result<Self, ProtocolError> {
        let value: serde_json::Value =
            serde_json::from_str(frame).map_err(ProtocolError::Malformed)?;

        let kind = match value.get("type") {
            Some(serde_json::Value::String(kind)) => kind.clone(),
            Some(other) => return Err(ProtocolError::UnknownType(other.to_string())),
            None => return Err(ProtocolError::MissingType),
        };

        if !Self::TYPES.contains(&kind.as_str()) {
            return Err(ProtocolError::UnknownType(kind));
        }

        serde_json::from_value(value)
            .map_err(|source| ProtocolError::InvalidPayload { kind, source })
    }
}

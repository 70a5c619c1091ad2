use bytes::Bytes;
use chrono::{DateTime, Utc};
use termbridge_types::ErrorCode;
use tokio::sync::mpsc;
use uuid::Uuid;

pub type ConnectionId = Uuid;

/// Events a session pushes to its attached connection
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    Output(Bytes),
    Status {
        connected: bool,
        session_key: String,
    },
    Error {
        code: ErrorCode,
        message: String,
    },
    Closed {
        exit_code: Option<i32>,
    },
    /// Another connection took over the session; nothing follows
    Superseded,
}

/// A client connection as seen by the session manager.
///
/// Sending never waits: a slow network peer cannot stall the terminal
/// read loop.
#[derive(Debug, Clone)]
pub struct ClientConnection {
    pub id: ConnectionId,
    pub connected_at: DateTime<Utc>,
    sender: mpsc::UnboundedSender<SessionEvent>,
}

impl ClientConnection {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<SessionEvent>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        let connection = Self {
            id: Uuid::new_v4(),
            connected_at: Utc::now(),
            sender,
        };
        (connection, receiver)
    }

    /// Returns false once the receiving side is gone
    pub fn send(&self, event: SessionEvent) -> bool {
        self.sender.send(event).is_ok()
    }

    pub fn send_error(&self, code: ErrorCode, message: impl Into<String>) -> bool {
        self.send(SessionEvent::Error {
            code,
            message: message.into(),
        })
    }

    pub fn is_closed(&self) -> bool {
        self.sender.is_closed()
    }
}

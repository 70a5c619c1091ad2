use termbridge_types::ErrorCode;
use thiserror::Error;

use crate::io_engine::IoError;
use crate::launcher::SpawnError;
use crate::translator::SignalError;

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("no session for key \"{0}\"")]
    NotFound(String),
    #[error("session \"{0}\" has terminated")]
    Terminated(String),
    #[error("connection is not attached to session \"{0}\"")]
    NotAttached(String),
    #[error(transparent)]
    Spawn(#[from] SpawnError),
    #[error(transparent)]
    Io(#[from] IoError),
    #[error(transparent)]
    Signal(#[from] SignalError),
    #[error("terminal worker failed: {0}")]
    Worker(String),
}

impl SessionError {
    /// Wire error code reported to the client
    pub fn code(&self) -> ErrorCode {
        match self {
            SessionError::NotFound(_) => ErrorCode::SessionNotFound,
            SessionError::Terminated(_) => ErrorCode::SessionTerminated,
            SessionError::NotAttached(_) => ErrorCode::NotAttached,
            SessionError::Spawn(_) => ErrorCode::SpawnFailed,
            SessionError::Io(_) | SessionError::Worker(_) => ErrorCode::IoError,
            SessionError::Signal(SignalError::InvalidSize { .. }) => ErrorCode::InvalidInput,
            SessionError::Signal(_) => ErrorCode::SignalFailed,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_codes() {
        assert_eq!(SessionError::NotFound("k".into()).code(), ErrorCode::SessionNotFound);
        assert_eq!(SessionError::Terminated("k".into()).code(), ErrorCode::SessionTerminated);
        assert_eq!(SessionError::NotAttached("k".into()).code(), ErrorCode::NotAttached);
        assert_eq!(
            SessionError::from(SpawnError::EmptyCommand).code(),
            ErrorCode::SpawnFailed
        );
        assert_eq!(SessionError::from(IoError::Closed).code(), ErrorCode::IoError);
        assert_eq!(
            SessionError::from(SignalError::InvalidSize { rows: 0, cols: 0 }).code(),
            ErrorCode::InvalidInput
        );
        assert_eq!(
            SessionError::Terminated("task-1".into()).to_string(),
            "session \"task-1\" has terminated"
        );
    }
}

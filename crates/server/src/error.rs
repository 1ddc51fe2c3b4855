//! Errors surfaced by the session registry.

use switchyard_connector_core::ConnectorError;
use thiserror::Error;

/// Session-management failures.
///
/// `Clone` because a single reconnect outcome is handed to every caller
/// that was waiting on the same attempt.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SessionError {
    #[error("Unknown session {0}; start a new session")]
    UnknownSession(String),

    #[error("Session {0} has ended and cannot be resumed")]
    SessionEnded(String),

    #[error("Executor error: {0}")]
    Executor(String),

    #[error("Execution cancelled")]
    Cancelled,

    #[error("Failed to create session: {0}")]
    CreateFailed(String),

    #[error("Invalid session ID format")]
    InvalidSessionId,

    #[error("Invalid working directory")]
    InvalidWorkingDir,
}

impl SessionError {
    /// Retrying will never help
    pub fn is_permanent(&self) -> bool {
        matches!(
            self,
            SessionError::SessionEnded(_)
                | SessionError::InvalidSessionId
                | SessionError::InvalidWorkingDir
        )
    }
}

impl From<ConnectorError> for SessionError {
    fn from(err: ConnectorError) -> Self {
        match err {
            ConnectorError::Cancelled => SessionError::Cancelled,
            ConnectorError::SessionNotFound(id) => SessionError::UnknownSession(id),
            other => SessionError::Executor(other.to_string()),
        }
    }
}

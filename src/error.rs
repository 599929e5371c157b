//! Error types for langport

use std::time::Duration;

use thiserror::Error;

use crate::process::ProcessExit;
use crate::session::SessionState;

pub type LspResult<T> = std::result::Result<T, LspError>;

#[derive(Debug, Error)]
pub enum LspError {
    /// The server subprocess could not be started.
    #[error("failed to spawn language server: {0}")]
    Spawn(String),

    /// The stream to the server closed or broke; fatal to the session.
    #[error("connection to language server lost")]
    ConnectionLost,

    /// The subprocess exited while the session was live.
    #[error("language server '{name}' exited unexpectedly ({exit})")]
    ProcessExited { name: String, exit: ProcessExit },

    /// The crash circuit breaker tripped: too many exits inside one
    /// cooldown window.
    #[error("language server '{name}' crashed {crashes} times within {window:?}, not restarting")]
    RestartLimitExceeded {
        name: String,
        crashes: u32,
        window: Duration,
    },

    /// A call that is not legal in the session's current lifecycle state.
    #[error("'{method}' not allowed while session is {state}")]
    InvalidState {
        method: String,
        state: SessionState,
    },

    /// Feature gate failed locally; nothing was sent to the server.
    #[error("server '{server}' does not support '{feature}'")]
    CapabilityNotSupported { server: String, feature: String },

    #[error("'{method}' timed out after {timeout:?}")]
    Timeout { method: String, timeout: Duration },

    #[error("request cancelled")]
    Cancelled,

    /// Structured error response from the server.
    #[error("server error [{code}]: {message}")]
    Server { code: i32, message: String },

    /// Malformed or out-of-sequence JSON-RPC traffic.
    #[error("protocol error: {0}")]
    Protocol(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

impl LspError {
    /// JSON-RPC-style code for surfacing this error across a boundary.
    pub fn error_code(&self) -> i32 {
        match self {
            Self::Server { code, .. } => *code,
            Self::Cancelled => crate::proto::error_codes::REQUEST_CANCELLED,
            Self::InvalidState { .. } => crate::proto::error_codes::SERVER_NOT_INITIALIZED,
            Self::Timeout { .. } => -32001,
            Self::ConnectionLost | Self::ProcessExited { .. } => -32003,
            _ => -32000,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
            || matches!(self, Self::Server { code, .. }
                if *code == crate::proto::error_codes::REQUEST_CANCELLED)
    }

    /// Errors a caller may sensibly retry against a fresh or existing
    /// session. Capability and lifecycle errors are caller bugs and are
    /// excluded on purpose.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::ConnectionLost
                | Self::ProcessExited { .. }
                | Self::Timeout { .. }
                | Self::Cancelled
        ) || self.is_cancelled()
    }

    /// Errors that indicate the backing server is gone and the client
    /// should be recreated rather than reused.
    pub fn needs_restart(&self) -> bool {
        matches!(self, Self::ConnectionLost | Self::ProcessExited { .. })
    }

    /// Local errors never tear down the session; only transport- and
    /// process-level failures do.
    pub fn is_fatal_to_session(&self) -> bool {
        matches!(
            self,
            Self::ConnectionLost | Self::ProcessExited { .. } | Self::Io(_)
        )
    }
}

impl From<crate::proto::ResponseError> for LspError {
    fn from(err: crate::proto::ResponseError) -> Self {
        LspError::Server {
            code: err.code,
            message: err.message,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proto::error_codes;

    #[test]
    fn test_connection_lost_needs_restart() {
        let err = LspError::ConnectionLost;
        assert!(err.is_recoverable());
        assert!(err.needs_restart());
        assert!(err.is_fatal_to_session());
    }

    #[test]
    fn test_timeout_keeps_session() {
        let err = LspError::Timeout {
            method: "textDocument/hover".to_string(),
            timeout: Duration::from_secs(2),
        };
        assert!(err.is_recoverable());
        assert!(!err.needs_restart());
        assert!(!err.is_fatal_to_session());
    }

    #[test]
    fn test_capability_error_is_not_recoverable() {
        let err = LspError::CapabilityNotSupported {
            server: "pyright".to_string(),
            feature: "callHierarchy".to_string(),
        };
        assert!(!err.is_recoverable());
        assert!(!err.needs_restart());
    }

    #[test]
    fn test_cancelled_error() {
        assert!(LspError::Cancelled.is_cancelled());

        let server_cancelled = LspError::Server {
            code: error_codes::REQUEST_CANCELLED,
            message: "cancelled".to_string(),
        };
        assert!(server_cancelled.is_cancelled());
        assert!(server_cancelled.is_recoverable());
    }

    #[test]
    fn test_error_codes() {
        let err = LspError::Server {
            code: error_codes::METHOD_NOT_FOUND,
            message: "nope".to_string(),
        };
        assert_eq!(err.error_code(), error_codes::METHOD_NOT_FOUND);
        assert_eq!(
            LspError::Cancelled.error_code(),
            error_codes::REQUEST_CANCELLED
        );
    }

    #[test]
    fn test_response_error_conversion() {
        let err: LspError = crate::proto::ResponseError {
            code: -32602,
            message: "bad params".to_string(),
            data: None,
        }
        .into();
        assert!(matches!(err, LspError::Server { code: -32602, .. }));
    }
}

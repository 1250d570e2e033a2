/// The step of session establishment that failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionOp {
    Connect,
    Initialize,
    SendInitialized,
    VersionNegotiation,
}

impl std::fmt::Display for SessionOp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Connect => "connect",
            Self::Initialize => "initialize",
            Self::SendInitialized => "send_initialized",
            Self::VersionNegotiation => "version_negotiation",
        };
        f.write_str(s)
    }
}

/// Shared error type used across all MCPDrill crates.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("IO: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON: {0}")]
    Json(#[from] serde_json::Error),

    /// Network-level failure. Retried per the reconnect policy.
    #[error("transport: {0}")]
    Transport(String),

    /// Protocol violation. Fails the operation, counted but not retried.
    #[error("protocol: {0}")]
    Protocol(String),

    /// Session establishment failure. Forces session invalidation.
    #[error("session {op}: {message}")]
    Session { op: SessionOp, message: String },

    /// Cancelled or deadline exceeded while waiting for a pool slot.
    #[error("timed out waiting for a pool session")]
    PoolTimeout,

    #[error("session manager is closed")]
    ManagerClosed,

    #[error("engine is closed")]
    EngineClosed,

    #[error("drain deadline exceeded: {0}")]
    DrainTimeout(String),

    #[error("config: {0}")]
    Config(String),

    #[error("{0}")]
    Other(String),
}

impl Error {
    pub fn session(op: SessionOp, err: impl std::fmt::Display) -> Self {
        Self::Session {
            op,
            message: err.to_string(),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_error_display() {
        let err = Error::session(SessionOp::Initialize, "connection reset");
        assert_eq!(format!("{err}"), "session initialize: connection reset");
    }

    #[test]
    fn session_op_display_covers_all_steps() {
        assert_eq!(SessionOp::Connect.to_string(), "connect");
        assert_eq!(SessionOp::SendInitialized.to_string(), "send_initialized");
        assert_eq!(
            SessionOp::VersionNegotiation.to_string(),
            "version_negotiation"
        );
    }
}

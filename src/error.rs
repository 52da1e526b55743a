//! Bridge error taxonomy
//!
//! Every failure that can reach the scripting side is a [`BridgeError`]. Its
//! `Display` output is exactly the string the script receives as the error
//! half of a `(value, error)` reply.

use thiserror::Error;

/// Error type for all script-visible bridge operations.
///
/// The type is `Clone` because connection and task errors are sticky: the
/// same error is reported on every subsequent query.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BridgeError {
    /// The handle is unknown, foreign, or already released
    #[error("invalid handle")]
    InvalidHandle,

    /// The handle is live but refers to a different kind of object
    #[error("handle is not a {expected}")]
    WrongKind { expected: &'static str },

    /// A script argument is missing or malformed
    #[error("{0}")]
    MalformedInput(String),

    /// The transport (or the task body using it) reported a failure
    #[error("{0}")]
    Transport(String),

    /// The task was cancelled before it produced an outcome
    #[error("context canceled")]
    Cancelled,

    /// The connection was closed locally
    #[error("connection closed")]
    Closed,

    /// A task body panicked; the payload message is preserved
    #[error("{0}")]
    Panicked(String),
}

impl BridgeError {
    /// Build a malformed-input error
    pub fn malformed(msg: impl Into<String>) -> Self {
        BridgeError::MalformedInput(msg.into())
    }

    /// Build a transport error from anything displayable
    pub fn transport(err: impl std::fmt::Display) -> Self {
        BridgeError::Transport(err.to_string())
    }

    /// Whether this error is the cancellation condition
    pub fn is_cancelled(&self) -> bool {
        matches!(self, BridgeError::Cancelled)
    }
}

/// Result type for bridge operations.
pub type BridgeResult<T> = Result<T, BridgeError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_is_script_string() {
        assert_eq!(BridgeError::Cancelled.to_string(), "context canceled");
        assert_eq!(BridgeError::Closed.to_string(), "connection closed");
        assert_eq!(
            BridgeError::WrongKind { expected: "task" }.to_string(),
            "handle is not a task"
        );
        assert_eq!(
            BridgeError::malformed("missing url argument").to_string(),
            "missing url argument"
        );
    }

    #[test]
    fn test_transport_from_display() {
        let io = std::io::Error::new(std::io::ErrorKind::ConnectionReset, "reset by peer");
        assert_eq!(BridgeError::transport(io).to_string(), "reset by peer");
        assert!(!BridgeError::transport("x").is_cancelled());
        assert!(BridgeError::Cancelled.is_cancelled());
    }
}

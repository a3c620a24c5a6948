//! Error types for the dataplane agent.

use std::error::Error as StdError;
use thiserror::Error;

/// Boxed error type used for error chaining across module boundaries.
pub type BoxError = Box<dyn StdError + Send + Sync + 'static>;

/// Context wrapper that preserves an optional underlying source error.
#[derive(Debug, Error)]
#[error("{message}")]
pub struct ErrorContext {
    message: String,
    #[source]
    source: Option<BoxError>,
}

impl ErrorContext {
    /// Create context-only error (no underlying source).
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            source: None,
        }
    }

    /// Create context error with an underlying source.
    pub fn with_source<E>(message: impl Into<String>, source: E) -> Self
    where
        E: StdError + Send + Sync + 'static,
    {
        Self {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }
}

/// Agent-specific errors.
///
/// The policy per kind:
/// - `Config` and `Protocol` are answered as a failed control response and
///   the agent continues.
/// - `System` on an endpoint closes and deregisters that endpoint; the
///   agent continues.
/// - `Transport` surfaces as a link-down notification to the controller.
/// - `State` is logged at warning level and answered with `Success=false`.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum AgentError {
    /// Bad arguments, malformed descriptors, name too long.
    #[error("configuration error: {0}")]
    Config(#[source] ErrorContext),

    /// Syscall failure: socket/ioctl/open/read/write.
    #[error("system error: {0}")]
    System(#[from] std::io::Error),

    /// Malformed control message, unknown command, unknown transaction id.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Operation invalid in the current state.
    #[error("state error: {0}")]
    State(String),

    /// ICE or secure-transport failure surfaced by the transport stack.
    #[error("transport error: {0}")]
    Transport(#[source] ErrorContext),
}

impl AgentError {
    /// Create a configuration error with context only.
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config(ErrorContext::new(message))
    }

    /// Create a configuration error with preserved source.
    pub fn config_with_source<E>(message: impl Into<String>, source: E) -> Self
    where
        E: StdError + Send + Sync + 'static,
    {
        Self::Config(ErrorContext::with_source(message, source))
    }

    /// Create a protocol error.
    pub fn protocol(message: impl Into<String>) -> Self {
        Self::Protocol(message.into())
    }

    /// Create a state error.
    pub fn state(message: impl Into<String>) -> Self {
        Self::State(message.into())
    }

    /// Create a transport error with context only.
    pub fn transport(message: impl Into<String>) -> Self {
        Self::Transport(ErrorContext::new(message))
    }

    /// Create a transport error with preserved source.
    pub fn transport_with_source<E>(message: impl Into<String>, source: E) -> Self
    where
        E: StdError + Send + Sync + 'static,
    {
        Self::Transport(ErrorContext::with_source(message, source))
    }

    /// Create a system error from the calling thread's errno.
    pub fn last_os_error(context: &str) -> Self {
        Self::System(std::io::Error::new(
            std::io::Error::last_os_error().kind(),
            format!("{}: {}", context, std::io::Error::last_os_error()),
        ))
    }
}

/// Result type alias for agent operations.
pub type AgentResult<T> = Result<T, AgentError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display_includes_context() {
        let err = AgentError::config("tap name too long");
        assert!(err.to_string().contains("tap name too long"));
    }

    #[test]
    fn test_error_source_preserved() {
        let io = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied");
        let err = AgentError::transport_with_source("handshake failed", io);
        let source = StdError::source(&err).expect("context source");
        assert!(source.to_string().contains("handshake failed"));
    }
}

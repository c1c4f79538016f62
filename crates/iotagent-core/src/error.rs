//! Unified error handling for the IoT agent.
//!
//! Routing and cache operations never fail; errors only surface at the
//! edges: configuration, the platform bus and the transport.

/// Unified error type for the IoT agent.
#[derive(Debug, Clone, thiserror::Error)]
pub enum Error {
    /// Configuration-related errors.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Platform event bus errors (initialization, closed channels).
    #[error("Event bus error: {0}")]
    Bus(String),

    /// Transport errors (publish rejected, broker unreachable).
    #[error("Transport error: {0}")]
    Transport(String),

    /// Serialization/deserialization errors.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Generic internal errors.
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Result type alias for convenience.
pub type Result<T> = std::result::Result<T, Error>;

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}

// Convenience constructors for common errors
impl Error {
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    pub fn bus(msg: impl Into<String>) -> Self {
        Self::Bus(msg.into())
    }

    pub fn transport(msg: impl Into<String>) -> Self {
        Self::Transport(msg.into())
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }
}

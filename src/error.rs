//! Error types for configuration, selection, and forwarding.

use std::fmt;

/// Every failure the selector and its forwarding loop can produce.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SelectorError {
    /// The configuration file could not be loaded, parsed, or validated.
    Config(String),
    /// A `host:port` entry in the backend specification is malformed.
    InvalidBackend(String),
    /// Every backend is suspended, or the pool is empty.
    NoBackendAvailable,
    /// A socket operation failed in the forwarding loop.
    Io(String),
}

impl fmt::Display for SelectorError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Config(msg) => write!(f, "configuration error: {msg}"),
            Self::InvalidBackend(msg) => write!(f, "invalid backend: {msg}"),
            Self::NoBackendAvailable => write!(f, "no backend available"),
            Self::Io(msg) => write!(f, "i/o error: {msg}"),
        }
    }
}

impl std::error::Error for SelectorError {}

impl SelectorError {
    /// Returns `true` for conditions a caller can retry or degrade around,
    /// as opposed to startup configuration errors.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Self::NoBackendAvailable | Self::Io(_))
    }
}

impl From<std::io::Error> for SelectorError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err.to_string())
    }
}

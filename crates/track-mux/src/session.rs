use std::fmt;

use thiserror::Error;

/// Opaque identifier of a connected client session.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionId(String);

impl SessionId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for SessionId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl From<&str> for SessionId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("session transport closed")]
    Closed,
    #[error("session transport buffer full")]
    Full,
}

impl TransportError {
    pub fn metric_label(&self) -> &'static str {
        match self {
            TransportError::Closed => "closed",
            TransportError::Full => "full",
        }
    }
}

/// Outbound half of a client connection. Implementations must not block: the stream worker
/// calls `send` from its own thread and expects a hand-off, not a socket write.
pub trait SessionTransport: Send + Sync {
    fn send(&self, payload: &str) -> Result<(), TransportError>;
}

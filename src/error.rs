use serde::{Serialize, Serializer};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum TunnelError {
    /// Missing or invalid credential or address, caught before any I/O.
    #[error("{0}")]
    Config(String),

    /// Port bind, SSH connect/auth or remote listen request failed.
    #[error("{0}")]
    Resource(String),

    /// A single relayed connection failed. Never changes rule status.
    #[error("{0}")]
    Connection(String),

    /// The listener or session died after a successful start.
    #[error("{0}")]
    Runtime(String),

    #[error("Rule {0} not found")]
    NotFound(String),

    #[error("Rule id {0} is already used by another rule")]
    IdCollision(String),

    #[error("Rule store error: {0:#}")]
    Store(anyhow::Error),
}

// Observers only ever see the message.
impl Serialize for TunnelError {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&self.to_string())
    }
}

pub type TunnelResult<T> = Result<T, TunnelError>;

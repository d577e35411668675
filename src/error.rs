//! Error types for ringflow.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, RingError>;

#[derive(Error, Debug)]
pub enum RingError {
    /// Worker thread could not be spawned
    #[error("Thread spawn failed: {0}")]
    Spawn(#[from] std::io::Error),

    #[error("Invalid configuration: {message}")]
    InvalidConfig { message: String },

    /// Queue or executor no longer accepts work
    #[error("Queue is closed")]
    Closed,

    /// Non-blocking submit found no room
    #[error("Queue is full")]
    Full,

    #[error("Unsupported operation: {operation}")]
    Unsupported { operation: &'static str },
}

impl RingError {
    pub fn config(message: impl Into<String>) -> Self {
        Self::InvalidConfig { message: message.into() }
    }

    pub fn unsupported(operation: &'static str) -> Self {
        Self::Unsupported { operation }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = RingError::config("capacity must be a power of two");
        assert_eq!(err.to_string(), "Invalid configuration: capacity must be a power of two");
        assert_eq!(RingError::unsupported("deliver_stage").to_string(), "Unsupported operation: deliver_stage");
        assert_eq!(RingError::Closed.to_string(), "Queue is closed");
    }
}

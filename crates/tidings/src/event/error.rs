//! Event broker error types.

use thiserror::Error;

/// Result type for broker operations.
pub type EventResult<T> = Result<T, EventError>;

/// Errors that can occur while publishing or receiving events.
#[derive(Debug, Error)]
pub enum EventError {
    /// The subscriber was closed or the caller's cancellation fired.
    #[error("end of stream")]
    EndOfStream,

    /// Payload could not be encoded or decoded as JSON.
    #[error("payload codec error: {0}")]
    Codec(#[from] serde_json::Error),

    /// The networked transport failed.
    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),

    /// A request/reply peer answered with an error.
    #[error("remote error: {0}")]
    Remote(String),
}

impl EventError {
    /// Whether this error only signals the end of a subscription.
    pub fn is_end_of_stream(&self) -> bool {
        matches!(self, Self::EndOfStream)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_end_of_stream_display() {
        let err = EventError::EndOfStream;
        assert_eq!(err.to_string(), "end of stream");
        assert!(err.is_end_of_stream());
        assert!(!EventError::Remote("boom".to_string()).is_end_of_stream());
    }
}

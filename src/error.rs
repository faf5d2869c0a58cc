use thiserror::Error;

/// Custom error types for the room session coordinator
#[derive(Debug, Error)]
pub enum CoordinatorError {
    /// Malformed or invalid client frame. The offending connection is closed
    /// with code 4000 and never retried.
    #[error("Protocol violation: {0}")]
    Protocol(String),

    /// Valid frame referencing state that does not exist or cannot change
    /// (out-of-range indices, conflicting choice resolution).
    #[error("Validation failed: {0}")]
    Validation(String),

    #[error("Room {0} not found")]
    RoomNotFound(String),

    #[error("Email {0} is already in the admission queue")]
    DuplicateQueueEntry(String),

    /// A durable write failed. The affected room is disconnected rather than
    /// allowed to diverge from storage.
    #[error("Persistence failure: {0}")]
    Persistence(String),

    /// External meeting or workspace API failure during admission.
    #[error("Provisioning failed: {0}")]
    Provisioning(String),

    #[error("Resource slot for host {0} is already bound")]
    SlotOccupied(String),

    #[error("Failed to serialize message: {0}")]
    SerializationFailed(#[from] serde_json::Error),

    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Internal server error: {0}")]
    Internal(String),
}

/// Convenience type alias for Results using CoordinatorError
pub type Result<T> = std::result::Result<T, CoordinatorError>;

impl CoordinatorError {
    /// Helper to create Protocol errors with context
    pub fn protocol(msg: impl Into<String>) -> Self {
        CoordinatorError::Protocol(msg.into())
    }

    /// Helper to create Validation errors with context
    pub fn validation(msg: impl Into<String>) -> Self {
        CoordinatorError::Validation(msg.into())
    }

    /// Helper to create Persistence errors with context
    pub fn persistence(msg: impl Into<String>) -> Self {
        CoordinatorError::Persistence(msg.into())
    }

    /// Helper to create Provisioning errors with context
    pub fn provisioning(msg: impl Into<String>) -> Self {
        CoordinatorError::Provisioning(msg.into())
    }

    /// Helper to create Internal errors with context
    pub fn internal(msg: impl Into<String>) -> Self {
        CoordinatorError::Internal(msg.into())
    }

    /// Websocket close code the gateway should use when this error
    /// terminates a connection.
    pub fn close_code(&self) -> u16 {
        match self {
            CoordinatorError::RoomNotFound(_) => 4004,
            CoordinatorError::Protocol(_)
            | CoordinatorError::Validation(_)
            | CoordinatorError::DuplicateQueueEntry(_)
            | CoordinatorError::Persistence(_) => 4000,
            _ => 1011,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = CoordinatorError::RoomNotFound("test-room".to_string());
        assert_eq!(err.to_string(), "Room test-room not found");
    }

    #[test]
    fn test_error_helpers() {
        let err = CoordinatorError::internal("Something went wrong");
        assert!(matches!(err, CoordinatorError::Internal(_)));
    }

    #[test]
    fn test_close_codes() {
        assert_eq!(CoordinatorError::protocol("bad frame").close_code(), 4000);
        assert_eq!(
            CoordinatorError::RoomNotFound("x".to_string()).close_code(),
            4004
        );
        assert_eq!(CoordinatorError::internal("boom").close_code(), 1011);
    }
}

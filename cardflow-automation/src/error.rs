//! Error types for card automation.

use crate::store::StoreError;
use crate::worker::WorkerError;
use thiserror::Error;

/// Result type alias using the automation error type.
pub type Result<T> = std::result::Result<T, AutomationError>;

/// Unified error type for the engine and the board service.
#[derive(Error, Debug)]
pub enum AutomationError {
    /// Storage read/write failed
    #[error("Storage error: {0}")]
    Store(#[from] StoreError),

    /// Worker service call failed
    #[error("Worker error: {0}")]
    Worker(#[from] WorkerError),

    /// Board, card, state or swimlane does not exist
    #[error("{kind} not found: {id}")]
    NotFound { kind: &'static str, id: String },

    /// A second run was recorded for a card that already has one
    #[error("Card {card_id} already has an active automation run")]
    RunAlreadyActive { card_id: String },

    /// Invalid input or request
    #[error("Invalid input: {0}")]
    InvalidInput(String),
}

impl AutomationError {
    /// Create a not-found error.
    pub fn not_found(kind: &'static str, id: impl Into<String>) -> Self {
        Self::NotFound {
            kind,
            id: id.into(),
        }
    }

    /// Check if this is a not-found error.
    pub const fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_messages() {
        let err = AutomationError::not_found("Card", "card-1");
        assert_eq!(err.to_string(), "Card not found: card-1");
        assert!(err.is_not_found());

        let err = AutomationError::RunAlreadyActive {
            card_id: "card-2".into(),
        };
        assert!(err.to_string().contains("card-2"));
        assert!(!err.is_not_found());
    }

    #[test]
    fn test_from_store_error() {
        let err: AutomationError = StoreError::Backend("disk full".into()).into();
        assert!(matches!(err, AutomationError::Store(_)));
        assert!(err.to_string().contains("disk full"));
    }
}

//! Error types for the broker
//!
//! All errors implement the `std::error::Error` trait via `thiserror::Error`.
//!
//! # Error Handling
//!
//! The [`BrokerError`] enum falls into four families:
//! - Validation errors (empty tag set, malformed selection, bad configuration)
//! - Not-found errors (queue, tag group or item ID missing)
//! - Capacity errors (the admission counter refused a new item)
//! - Internal errors (an index operation failed)
//!
//! Capacity failures are kept distinct from not-found failures so a serving
//! layer can ask a producer to retry instead of treating the queue as gone.
//!
//! # Example
//!
//! ```rust,ignore
//! use a3s_broker::{BrokerError, TagSet};
//!
//! match manager.enqueue("orders", tags, payload, false).await {
//!     Ok(_) => {}
//!     Err(e) if e.is_capacity() => { /* back off and retry */ }
//!     Err(BrokerError::QueueNotFound(name)) => {
//!         eprintln!("Queue '{}' does not exist", name);
//!     }
//!     Err(e) => eprintln!("Unexpected error: {}", e),
//! }
//! ```

use thiserror::Error;

/// Broker error type
///
/// # Variants
///
/// * `InvalidTags` - Tag set is empty or exceeds the queue's tag limit
/// * `InvalidSelection` - A subscription selection entry is malformed
/// * `ConfigError` - Invalid queue configuration (e.g. zero capacity)
/// * `QueueNotFound` - No queue registered under the given name
/// * `TagGroupNotFound` - ACK for an exact tag set with no tag group
/// * `ItemNotFound` - ACK for an ID the tag group does not hold
/// * `QueueFull` - Admission refused, the queue is at its maximum size
/// * `ShutdownInProgress` - Queue is shutting down
/// * `Internal` - Index operation failed
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BrokerError {
    /// Tag set rejected before touching any state
    #[error("Invalid tags: {0}")]
    InvalidTags(String),

    /// Subscription selection rejected before touching any state
    #[error("Invalid selection: {0}")]
    InvalidSelection(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// Queue not found
    #[error("Queue not found: {0}")]
    QueueNotFound(String),

    /// No tag group for the exact tag set
    #[error("Tag group not found: {0}")]
    TagGroupNotFound(String),

    /// Item ID not held by the tag group
    #[error("ID {id} does not exist for tag group {tags}")]
    ItemNotFound { id: u64, tags: String },

    /// Admission counter refused the item
    #[error("Queue '{name}' is full (max {max})")]
    QueueFull { name: String, max: usize },

    /// Shutdown in progress
    #[error("Queue is shutting down, not accepting new operations")]
    ShutdownInProgress,

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl BrokerError {
    /// True when the failure is a capacity refusal the producer may retry
    pub fn is_capacity(&self) -> bool {
        matches!(self, BrokerError::QueueFull { .. })
    }

    /// True for queue, tag group and item lookups that came back empty
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            BrokerError::QueueNotFound(_)
                | BrokerError::TagGroupNotFound(_)
                | BrokerError::ItemNotFound { .. }
        )
    }

    /// True for requests rejected before any state was touched
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            BrokerError::InvalidTags(_)
                | BrokerError::InvalidSelection(_)
                | BrokerError::ConfigError(_)
        )
    }
}

/// Result type alias using BrokerError
pub type Result<T> = std::result::Result<T, BrokerError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_queue_not_found_error() {
        let error = BrokerError::QueueNotFound("orders".to_string());
        assert_eq!(error.to_string(), "Queue not found: orders");
        assert!(error.is_not_found());
        assert!(!error.is_capacity());
    }

    #[test]
    fn test_item_not_found_error() {
        let error = BrokerError::ItemNotFound {
            id: 7,
            tags: "region=eu".to_string(),
        };
        assert_eq!(
            error.to_string(),
            "ID 7 does not exist for tag group region=eu"
        );
        assert!(error.is_not_found());
    }

    #[test]
    fn test_queue_full_error() {
        let error = BrokerError::QueueFull {
            name: "q".to_string(),
            max: 1,
        };
        assert_eq!(error.to_string(), "Queue 'q' is full (max 1)");
        assert!(error.is_capacity());
        assert!(!error.is_not_found());
    }

    #[test]
    fn test_validation_errors() {
        assert!(BrokerError::InvalidTags("empty".into()).is_validation());
        assert!(BrokerError::InvalidSelection("empty".into()).is_validation());
        assert!(BrokerError::ConfigError("zero".into()).is_validation());
        assert!(!BrokerError::Internal("boom".into()).is_validation());
    }

    #[test]
    fn test_shutdown_in_progress_error() {
        let error = BrokerError::ShutdownInProgress;
        assert_eq!(
            error.to_string(),
            "Queue is shutting down, not accepting new operations"
        );
    }

    #[test]
    fn test_error_debug() {
        let error = BrokerError::TagGroupNotFound("a=1".to_string());
        let debug_str = format!("{:?}", error);
        assert!(debug_str.contains("TagGroupNotFound"));
    }
}

//! Error types for projections and read models.

use eventstore_core::error::EventStoreError;
use eventstore_core::position::GlobalPosition;
use thiserror::Error;

/// Errors that can occur while reducing events or maintaining read models.
#[derive(Error, Debug, Clone)]
pub enum ProjectionError {
    /// The event store returned an error.
    #[error(transparent)]
    Store(#[from] EventStoreError),

    /// A handler could not decode or apply an event.
    ///
    /// The projection's watermark stays before `position`.
    #[error("Failed to apply {event_type} at {position}: {reason}")]
    Decode {
        /// Event type of the failing event.
        event_type: String,
        /// Position of the failing event.
        position: GlobalPosition,
        /// Cause reported by the handler.
        reason: String,
    },

    /// Cache backend error.
    #[error("Cache error: {0}")]
    Cache(String),

    /// The subscription loop could not be started or stopped cleanly.
    #[error("Subscription error: {0}")]
    Subscription(String),
}

impl ProjectionError {
    /// Returns `true` if the error is a `NotFound` from the store.
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::Store(e) if e.is_not_found())
    }
}

/// Result type for projection operations.
pub type Result<T> = std::result::Result<T, ProjectionError>;

#[cfg(test)]
mod tests {
    use super::*;
    use eventstore_core::error::codes;

    #[test]
    fn not_found_passes_through() {
        let err: ProjectionError =
            EventStoreError::not_found(codes::EVENTS_NOT_FOUND, "org-1").into();
        assert!(err.is_not_found());
        assert!(!ProjectionError::Cache("down".into()).is_not_found());
    }

    #[test]
    fn decode_error_display() {
        let err = ProjectionError::Decode {
            event_type: "org.added".into(),
            position: GlobalPosition::new(12.0, 4),
            reason: "missing field `name`".into(),
        };
        assert_eq!(
            err.to_string(),
            "Failed to apply org.added at 12:4: missing field `name`"
        );
    }
}

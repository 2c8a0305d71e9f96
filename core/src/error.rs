//! Error types shared by the push pipeline and the filter/query layer.
//!
//! Every error carries a stable, translatable code (for example
//! `"Errors.UniqueConstraint.AlreadyExists"`) so the API layer can map it to a
//! user-facing message without parsing the human readable text.
//!
//! # Taxonomy
//!
//! [`EventStoreError::kind`] collapses the variants into four classes:
//!
//! - [`ErrorKind::InvalidArgument`]: malformed filter, type/payload mismatch, missing field
//! - [`ErrorKind::PreconditionFailed`]: concurrency mismatch, unique constraint collision,
//!   failed referential precondition
//! - [`ErrorKind::NotFound`]: a lookup expected at least one event and found none
//! - [`ErrorKind::Internal`]: storage or decode failure not caused by the caller

use crate::sequence::CurrentSequence;
use std::fmt;
use thiserror::Error;

/// Stable error codes used across the crate family.
pub mod codes {
    /// The aggregate id of a push or filter was empty.
    pub const AGGREGATE_ID_MISSING: &str = "Errors.Aggregate.IDMissing";
    /// The aggregate type of a push or filter was empty.
    pub const AGGREGATE_TYPE_MISSING: &str = "Errors.Aggregate.TypeMissing";
    /// The instance of a push was empty.
    pub const INSTANCE_MISSING: &str = "Errors.Instance.Missing";
    /// A push contained an aggregate without commands.
    pub const COMMANDS_MISSING: &str = "Errors.Push.CommandsMissing";
    /// A push contained no aggregates.
    pub const AGGREGATES_MISSING: &str = "Errors.Push.AggregatesMissing";
    /// A command's type is not prefixed by its aggregate type.
    pub const EVENT_TYPE_INVALID: &str = "Errors.Event.TypeInvalid";
    /// A payload was decoded into a type registered for another event type.
    pub const EVENT_TYPE_MISMATCH: &str = "Errors.Event.TypeMismatch";
    /// The payload bytes could not be decoded into the requested type.
    pub const PAYLOAD_INVALID: &str = "Errors.Event.PayloadInvalid";
    /// A filter tree was malformed.
    pub const FILTER_INVALID: &str = "Errors.Filter.Invalid";
    /// Merging already built filters was requested.
    pub const FILTER_MERGE_UNSUPPORTED: &str = "Errors.Filter.MergeUnsupported";
    /// The aggregate's current sequence did not satisfy the push check.
    pub const CONCURRENCY_CONFLICT: &str = "Errors.Aggregate.ConcurrencyConflict";
    /// A unique constraint key is already reserved.
    pub const UNIQUE_ALREADY_EXISTS: &str = "Errors.UniqueConstraint.AlreadyExists";
    /// A unique constraint key that was never reserved was released.
    pub const UNIQUE_NOT_FOUND: &str = "Errors.UniqueConstraint.NotFound";
    /// A unique constraint was malformed.
    pub const UNIQUE_INVALID: &str = "Errors.UniqueConstraint.Invalid";
    /// A caller supplied precondition rejected the push.
    pub const PRECONDITION_FAILED: &str = "Errors.Precondition.Failed";
    /// A query expected events but found none.
    pub const EVENTS_NOT_FOUND: &str = "Errors.Events.NotFound";
    /// A position string could not be parsed.
    pub const POSITION_INVALID: &str = "Errors.Position.Invalid";
    /// The storage backend failed.
    pub const STORAGE: &str = "Errors.Internal.Storage";
}

/// The four error classes callers branch on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Caller supplied malformed input.
    InvalidArgument,
    /// The state of the log does not allow the operation; retry after re-reading.
    PreconditionFailed,
    /// Nothing matched a lookup that required a result.
    NotFound,
    /// Backend or decode failure not attributable to the caller.
    Internal,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::InvalidArgument => "invalid argument",
            Self::PreconditionFailed => "precondition failed",
            Self::NotFound => "not found",
            Self::Internal => "internal",
        };
        f.write_str(name)
    }
}

/// Errors that can occur during event store operations.
#[derive(Error, Debug, Clone)]
pub enum EventStoreError {
    /// Malformed input detected at construction or validation time.
    #[error("Invalid argument ({code}): {message}")]
    InvalidArgument {
        /// Stable error code.
        code: &'static str,
        /// Human readable detail.
        message: String,
    },

    /// Optimistic concurrency conflict: the aggregate's current sequence does not
    /// satisfy the requested check.
    ///
    /// This typically means another writer appended to the aggregate concurrently.
    #[error("Concurrency conflict on {aggregate}: expected {expected}, found sequence {actual}")]
    ConcurrencyConflict {
        /// `"<instance>/<type>/<id>"` of the conflicting aggregate.
        aggregate: String,
        /// The check the push requested.
        expected: CurrentSequence,
        /// The sequence found in storage.
        actual: u32,
    },

    /// A unique constraint reservation collided or a release found nothing to release.
    #[error("Unique constraint violated ({code}): {message}")]
    UniqueConstraint {
        /// [`codes::UNIQUE_ALREADY_EXISTS`] or [`codes::UNIQUE_NOT_FOUND`].
        code: &'static str,
        /// The constraint's caller supplied error message.
        message: String,
    },

    /// A referential precondition rejected the push.
    #[error("Precondition failed ({code}): {message}")]
    PreconditionFailed {
        /// Stable error code supplied by the validator.
        code: &'static str,
        /// Human readable detail.
        message: String,
    },

    /// A lookup required at least one event and found none.
    #[error("Not found ({code}): {message}")]
    NotFound {
        /// Stable error code.
        code: &'static str,
        /// Human readable detail.
        message: String,
    },

    /// Database connection or query error.
    #[error("Database error: {0}")]
    DatabaseError(String),

    /// Serialization/deserialization error not attributable to the caller.
    #[error("Serialization error: {0}")]
    SerializationError(String),
}

impl EventStoreError {
    /// Build an [`EventStoreError::InvalidArgument`].
    #[must_use]
    pub fn invalid_argument(code: &'static str, message: impl Into<String>) -> Self {
        Self::InvalidArgument {
            code,
            message: message.into(),
        }
    }

    /// Build an [`EventStoreError::PreconditionFailed`].
    #[must_use]
    pub fn precondition_failed(code: &'static str, message: impl Into<String>) -> Self {
        Self::PreconditionFailed {
            code,
            message: message.into(),
        }
    }

    /// Build an [`EventStoreError::NotFound`].
    #[must_use]
    pub fn not_found(code: &'static str, message: impl Into<String>) -> Self {
        Self::NotFound {
            code,
            message: message.into(),
        }
    }

    /// Classify the error.
    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        match self {
            Self::InvalidArgument { .. } => ErrorKind::InvalidArgument,
            Self::ConcurrencyConflict { .. }
            | Self::UniqueConstraint { .. }
            | Self::PreconditionFailed { .. } => ErrorKind::PreconditionFailed,
            Self::NotFound { .. } => ErrorKind::NotFound,
            Self::DatabaseError(_) | Self::SerializationError(_) => ErrorKind::Internal,
        }
    }

    /// The stable code of this error.
    #[must_use]
    pub const fn code(&self) -> &'static str {
        match self {
            Self::InvalidArgument { code, .. }
            | Self::UniqueConstraint { code, .. }
            | Self::PreconditionFailed { code, .. }
            | Self::NotFound { code, .. } => code,
            Self::ConcurrencyConflict { .. } => codes::CONCURRENCY_CONFLICT,
            Self::DatabaseError(_) => codes::STORAGE,
            Self::SerializationError(_) => codes::PAYLOAD_INVALID,
        }
    }

    /// Shorthand for `kind() == ErrorKind::PreconditionFailed`.
    #[must_use]
    pub fn is_precondition_failed(&self) -> bool {
        self.kind() == ErrorKind::PreconditionFailed
    }

    /// Shorthand for `kind() == ErrorKind::NotFound`.
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        self.kind() == ErrorKind::NotFound
    }
}

/// Result alias for event store operations.
pub type Result<T> = std::result::Result<T, EventStoreError>;

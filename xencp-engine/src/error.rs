//! Error types for the reconciliation engine.

use thiserror::Error;

use crate::api::{ApiError, ErrorCategory};
use crate::model::{Action, EntityKind};

/// Errors surfaced by the engine.
#[derive(Debug, Error)]
pub enum Error {
    /// Credentials were rejected (after the bounded number of login attempts).
    #[error("authentication failed: {0}")]
    Auth(String),

    /// Network-level failure that persisted through the retry budget.
    #[error("transient network error after {attempts} attempts: {message}")]
    TransientNetwork { attempts: u32, message: String },

    /// Remote state precludes the operation (resource busy, in use, wrong power state).
    #[error("conflict: {0}")]
    Conflict(ApiError),

    /// Referenced entity does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// Remote side failed for a reason we cannot classify.
    #[error("remote internal error: {0}")]
    RemoteInternal(String),

    /// No valid execution order could be produced.
    #[error("plan error: {0}")]
    Plan(String),

    /// A task or lock wait exceeded its allotted time.
    #[error("timed out after {elapsed_secs}s waiting for {what}")]
    Timeout { what: String, elapsed_secs: u64 },

    /// Pool topology changed out of band; the plan must be recomputed.
    #[error("drift detected: {0}")]
    DriftDetected(String),

    /// Internal lock invariant violated.
    #[error("pool lock misuse: {0}")]
    LockMisuse(String),

    /// Caller cancelled the cycle.
    #[error("cancelled")]
    Cancelled,

    /// Engine configuration is unusable.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// Desired state rejected before any remote call.
    #[error("invalid {kind} '{key}': {message}")]
    Validation {
        kind: EntityKind,
        key: String,
        message: String,
    },

    /// Attempt to change an attribute that can only be set at creation.
    #[error("{kind} '{key}': attribute '{attribute}' cannot be changed after creation")]
    Immutable {
        kind: EntityKind,
        key: String,
        attribute: String,
    },

    /// Re-reading the entity after an operation did not show the expected state.
    #[error("{kind} '{key}': post-condition not met: {message}")]
    Verification {
        kind: EntityKind,
        key: String,
        message: String,
    },

    /// A failure annotated with the operation it happened in.
    #[error("{action} {kind} '{key}': {source}")]
    Operation {
        action: Action,
        kind: EntityKind,
        key: String,
        #[source]
        source: Box<Error>,
    },
}

impl Error {
    pub fn validation(kind: EntityKind, key: &str, message: impl Into<String>) -> Self {
        Error::Validation {
            kind,
            key: key.to_string(),
            message: message.into(),
        }
    }

    pub fn verification(kind: EntityKind, key: &str, message: impl Into<String>) -> Self {
        Error::Verification {
            kind,
            key: key.to_string(),
            message: message.into(),
        }
    }

    /// Wrap with operation context, unless already wrapped.
    pub fn in_operation(self, action: Action, kind: EntityKind, key: &str) -> Self {
        match self {
            Error::Operation { .. } => self,
            other => Error::Operation {
                action,
                kind,
                key: key.to_string(),
                source: Box::new(other),
            },
        }
    }

    /// The error with operation context stripped.
    pub fn root(&self) -> &Error {
        match self {
            Error::Operation { source, .. } => source.root(),
            other => other,
        }
    }

    /// Whether the failure may succeed on a later cycle without operator action.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self.root(),
            Error::TransientNetwork { .. } | Error::DriftDetected(_) | Error::Timeout { .. }
        )
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self.root(), Error::Conflict(_))
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self.root(), Error::NotFound(_))
    }
}

impl From<ApiError> for Error {
    fn from(err: ApiError) -> Self {
        match err.category() {
            ErrorCategory::Auth => Error::Auth(err.to_string()),
            ErrorCategory::NotFound => Error::NotFound(err.to_string()),
            ErrorCategory::Conflict => Error::Conflict(err),
            ErrorCategory::TransientNetwork => Error::TransientNetwork {
                attempts: 1,
                message: err.to_string(),
            },
            ErrorCategory::RemoteInternal => Error::RemoteInternal(err.to_string()),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

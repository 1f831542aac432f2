//! Rotation error types
//!
//! Every failure surfaced by the engine is a [`RotationError`]. Callers decide
//! between retrying and giving up through [`RotationError::kind`] and
//! [`RotationError::is_retryable`], never by inspecting message text (which
//! has already been redacted by the time it leaves the engine).

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors that can occur while issuing, rotating or revoking credentials
#[derive(Debug, Clone, Error)]
pub enum RotationError {
    /// Password requirements cannot be satisfied
    #[error("Password generation failed: {reason}")]
    Generation { reason: String },

    /// Target system could not be reached or the connection broke
    #[error("Connection failed during {operation}: {reason}")]
    Connectivity { operation: String, reason: String },

    /// An external call exceeded its deadline
    #[error("Operation timed out after {timeout_ms}ms: {operation}")]
    Timeout { operation: String, timeout_ms: u64 },

    /// Target system refused the login used to open a connection
    #[error("Authentication rejected for {username}: {reason}")]
    AuthenticationRejected { username: String, reason: String },

    /// Target system rejected the credential change
    #[error("Failed to apply credential change for {username}: {reason}")]
    Apply {
        username: String,
        reason: String,
        /// Lock timeouts, deadlocks and similar conditions worth retrying
        transient: bool,
    },

    /// Freshly applied credential did not authenticate
    #[error("Credential verification failed for {username}: {reason}")]
    Validation { username: String, reason: String },

    /// Parameters or templates are unusable without operator correction
    #[error("Invalid rotation parameters: {reason}")]
    Policy { reason: String },

    /// A generated secret survived redaction; the original message is discarded
    #[error("Error details withheld: message still contained a generated secret after redaction")]
    RedactionInvariantViolation,

    /// Another operation holds the configuration
    #[error("Operation already in progress for configuration {config_id} (status: {status})")]
    ConcurrentOperation { config_id: String, status: String },

    /// Lifecycle does not allow the requested operation
    #[error("Invalid state transition from {from} to {to}")]
    InvalidStateTransition { from: String, to: String },

    /// Configuration does not exist
    #[error("Rotation configuration not found: {config_id}")]
    NotFound { config_id: String },

    /// No strategy registered for the target type
    #[error("Unsupported target type: {target_type}")]
    UnsupportedTarget { target_type: String },

    /// Operation was cancelled before anything was applied
    #[error("Operation cancelled before apply: {operation}")]
    Cancelled { operation: String },

    /// Configuration repository or secret store failed
    #[error("Store error: {reason}")]
    Store { reason: String },

    /// Internal error (should not normally occur)
    #[error("Internal rotation error: {0}")]
    Internal(String),
}

/// Result type for rotation operations
pub type RotationResult<T> = Result<T, RotationError>;

/// Coarse classification of a [`RotationError`]
///
/// Persisted on the configuration after a failure, so the set of names is part
/// of the stored format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Generation,
    Connectivity,
    Apply,
    Validation,
    Policy,
    RedactionInvariantViolation,
    Conflict,
    NotFound,
    Cancelled,
    Store,
    Internal,
}

impl ErrorKind {
    /// Stable snake_case name
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Generation => "generation",
            Self::Connectivity => "connectivity",
            Self::Apply => "apply",
            Self::Validation => "validation",
            Self::Policy => "policy",
            Self::RedactionInvariantViolation => "redaction_invariant_violation",
            Self::Conflict => "conflict",
            Self::NotFound => "not_found",
            Self::Cancelled => "cancelled",
            Self::Store => "store",
            Self::Internal => "internal",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl RotationError {
    /// Classify the error
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Generation { .. } => ErrorKind::Generation,
            Self::Connectivity { .. } | Self::Timeout { .. } | Self::AuthenticationRejected { .. } => {
                ErrorKind::Connectivity
            }
            Self::Apply { .. } => ErrorKind::Apply,
            Self::Validation { .. } => ErrorKind::Validation,
            Self::Policy { .. } | Self::UnsupportedTarget { .. } => ErrorKind::Policy,
            Self::RedactionInvariantViolation => ErrorKind::RedactionInvariantViolation,
            Self::ConcurrentOperation { .. } | Self::InvalidStateTransition { .. } => {
                ErrorKind::Conflict
            }
            Self::NotFound { .. } => ErrorKind::NotFound,
            Self::Cancelled { .. } => ErrorKind::Cancelled,
            Self::Store { .. } => ErrorKind::Store,
            Self::Internal(_) => ErrorKind::Internal,
        }
    }

    /// Whether re-invoking the same transition may succeed
    ///
    /// Conflicts are not retryable: the holder of the configuration finishes
    /// first and the next trigger picks up from its outcome.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Apply { transient, .. } => *transient,
            other => matches!(other.kind(), ErrorKind::Connectivity | ErrorKind::Store),
        }
    }

    /// Rewrite every free-text field with `f`, keeping the variant
    pub(crate) fn map_text(self, f: impl Fn(&str) -> String) -> Self {
        match self {
            Self::Generation { reason } => Self::Generation { reason: f(&reason) },
            Self::Connectivity { operation, reason } => Self::Connectivity {
                operation: f(&operation),
                reason: f(&reason),
            },
            Self::Timeout {
                operation,
                timeout_ms,
            } => Self::Timeout {
                operation: f(&operation),
                timeout_ms,
            },
            Self::AuthenticationRejected { username, reason } => Self::AuthenticationRejected {
                username: f(&username),
                reason: f(&reason),
            },
            Self::Apply {
                username,
                reason,
                transient,
            } => Self::Apply {
                username: f(&username),
                reason: f(&reason),
                transient,
            },
            Self::Validation { username, reason } => Self::Validation {
                username: f(&username),
                reason: f(&reason),
            },
            Self::Policy { reason } => Self::Policy { reason: f(&reason) },
            Self::RedactionInvariantViolation => Self::RedactionInvariantViolation,
            Self::ConcurrentOperation { config_id, status } => Self::ConcurrentOperation {
                config_id: f(&config_id),
                status,
            },
            Self::InvalidStateTransition { from, to } => Self::InvalidStateTransition { from, to },
            Self::NotFound { config_id } => Self::NotFound {
                config_id: f(&config_id),
            },
            Self::UnsupportedTarget { target_type } => Self::UnsupportedTarget {
                target_type: f(&target_type),
            },
            Self::Cancelled { operation } => Self::Cancelled {
                operation: f(&operation),
            },
            Self::Store { reason } => Self::Store { reason: f(&reason) },
            Self::Internal(message) => Self::Internal(f(&message)),
        }
    }

    /// Shorthand for a [`RotationError::Store`]
    pub fn store(reason: impl std::fmt::Display) -> Self {
        Self::Store {
            reason: reason.to_string(),
        }
    }

    /// Shorthand for a [`RotationError::Policy`]
    pub fn policy(reason: impl Into<String>) -> Self {
        Self::Policy {
            reason: reason.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case(RotationError::Connectivity { operation: "open".into(), reason: "refused".into() }, true)]
    #[case(RotationError::Timeout { operation: "probe".into(), timeout_ms: 10 }, true)]
    #[case(RotationError::AuthenticationRejected { username: "admin".into(), reason: "bad".into() }, true)]
    #[case(RotationError::Apply { username: "svc".into(), reason: "deadlock".into(), transient: true }, true)]
    #[case(RotationError::Apply { username: "svc".into(), reason: "no such role".into(), transient: false }, false)]
    #[case(RotationError::Validation { username: "svc".into(), reason: "rejected".into() }, false)]
    #[case(RotationError::policy("template"), false)]
    #[case(RotationError::Generation { reason: "length".into() }, false)]
    #[case(RotationError::ConcurrentOperation { config_id: "c".into(), status: "rotating".into() }, false)]
    #[case(RotationError::store("disk full"), true)]
    #[case(RotationError::RedactionInvariantViolation, false)]
    fn test_retryable_by_kind(#[case] error: RotationError, #[case] retryable: bool) {
        assert_eq!(error.is_retryable(), retryable, "{error}");
    }

    #[test]
    fn test_kind_names_are_snake_case() {
        assert_eq!(ErrorKind::NotFound.to_string(), "not_found");
        assert_eq!(
            serde_json::to_string(&ErrorKind::RedactionInvariantViolation).unwrap(),
            "\"redaction_invariant_violation\""
        );
    }

    #[test]
    fn test_map_text_keeps_variant_and_flags() {
        let error = RotationError::Apply {
            username: "svc".into(),
            reason: "bad password hunter2".into(),
            transient: true,
        };
        let mapped = error.map_text(|s| s.replace("hunter2", "***"));
        match mapped {
            RotationError::Apply {
                reason, transient, ..
            } => {
                assert_eq!(reason, "bad password ***");
                assert!(transient);
            }
            other => panic!("unexpected variant: {other:?}"),
        }
    }
}

//! Error types for the apply engine

use thiserror::Error;

/// Result type for apply operations
pub type Result<T> = std::result::Result<T, ApplyError>;

/// Server-side failure classification, mirroring the API server's status
/// reasons. This is what callers branch on; the raw message rides along.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorReason {
    NotFound,
    Conflict,
    Invalid,
    Forbidden,
    Timeout,
    Unknown,
}

impl std::fmt::Display for ErrorReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ErrorReason::NotFound => "NotFound",
            ErrorReason::Conflict => "Conflict",
            ErrorReason::Invalid => "Invalid",
            ErrorReason::Forbidden => "Forbidden",
            ErrorReason::Timeout => "Timeout",
            ErrorReason::Unknown => "Unknown",
        };
        f.write_str(s)
    }
}

/// Server messages that identify an immutable-field rejection. Server-side
/// apply cannot change these fields; delete+recreate is the only correct
/// path, so these specific substrings gate force eligibility. Anything else
/// stays a plain `Invalid`.
const IMMUTABLE_ERROR_PATTERNS: &[&str] = &[
    "field is immutable",
    "cannot change roleRef",
    "updates to parameters are forbidden",
];

/// Check whether a server `Invalid` message describes an immutability
/// constraint.
pub fn is_immutable_message(message: &str) -> bool {
    IMMUTABLE_ERROR_PATTERNS.iter().any(|p| message.contains(p))
}

/// Errors surfaced by the apply engine. Every variant carries the subject of
/// the object being processed; messages for Secret kinds never include the
/// object body, only the server's own text.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ApplyError {
    /// The server-side dry-run rejected the object
    #[error("{subject} dry-run failed ({reason}): {message}")]
    DryRun {
        subject: String,
        reason: ErrorReason,
        message: String,
    },

    /// The committing server-side apply failed
    #[error("{subject} apply failed ({reason}): {message}")]
    Apply {
        subject: String,
        reason: ErrorReason,
        message: String,
    },

    /// Fetching the in-cluster counterpart failed
    #[error("{subject} fetch failed ({reason}): {message}")]
    Fetch {
        subject: String,
        reason: ErrorReason,
        message: String,
    },

    /// Forced re-creation (delete, wait, re-apply) failed
    #[error("{subject} re-creation failed ({reason}): {message}")]
    Recreate {
        subject: String,
        reason: ErrorReason,
        message: String,
    },

    /// Metadata cleanup kept hitting resourceVersion conflicts
    #[error("{subject} cleanup failed after {attempts} attempts: {message}")]
    Cleanup {
        subject: String,
        attempts: u32,
        message: String,
    },

    /// The caller's cancellation signal fired
    #[error("apply cancelled")]
    Cancelled,
}

impl ApplyError {
    /// The server-side reason behind this error, when one applies.
    pub fn reason(&self) -> ErrorReason {
        match self {
            ApplyError::DryRun { reason, .. }
            | ApplyError::Apply { reason, .. }
            | ApplyError::Fetch { reason, .. }
            | ApplyError::Recreate { reason, .. } => *reason,
            ApplyError::Cleanup { .. } => ErrorReason::Conflict,
            _ => ErrorReason::Unknown,
        }
    }

    pub fn is_invalid(&self) -> bool {
        self.reason() == ErrorReason::Invalid
    }

    pub fn is_conflict(&self) -> bool {
        self.reason() == ErrorReason::Conflict
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, ApplyError::Cancelled)
    }
}

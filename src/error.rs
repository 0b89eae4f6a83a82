use std::time::Duration;

/// Error type used across all modules.
#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    #[error("Config error: {0}")]
    Config(String),
    #[error("Auth error: {0}")]
    Auth(String),
    #[error("Invalid request: {0}")]
    InvalidRequest(String),
    #[error("Upstream error: status={status}, message={message}")]
    Upstream { status: u16, message: String },
    #[error(
        "Quota exhausted for account '{account}' on model '{model}': resets in {}s; add or switch accounts to continue",
        retry_after.as_secs()
    )]
    QuotaExhausted {
        account: String,
        model: String,
        retry_after: Duration,
        message: String,
    },
    #[error("Transport error: {0}")]
    Transport(String),
    #[error("All candidates exhausted (last status={last_status:?}): {last_message}")]
    CandidatesExhausted {
        last_status: Option<u16>,
        last_message: String,
    },
    #[error("Request cancelled")]
    Cancelled,
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Failure taxonomy driving retry decisions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCategory {
    UserError,
    AuthError,
    QuotaError,
    NotFound,
    Transient,
    Unknown,
}

/// Map an upstream HTTP status code to an error category.
#[must_use]
pub fn category_from_upstream_status(status: u16) -> ErrorCategory {
    match status {
        400 => ErrorCategory::UserError,
        401 => ErrorCategory::AuthError,
        402 | 403 | 429 => ErrorCategory::QuotaError,
        404 => ErrorCategory::NotFound,
        500..=599 => ErrorCategory::Transient,
        _ => ErrorCategory::Unknown,
    }
}

/// A 403 whose body reports `PERMISSION_DENIED` is an access problem, not a
/// quota one, and must not be retried.
#[must_use]
pub fn is_permission_denied(status: u16, body: &str) -> bool {
    status == 403 && body.contains("PERMISSION_DENIED")
}

impl RelayError {
    #[must_use]
    pub fn category(&self) -> ErrorCategory {
        match self {
            RelayError::InvalidRequest(_) => ErrorCategory::UserError,
            RelayError::Auth(_) => ErrorCategory::AuthError,
            RelayError::QuotaExhausted { .. } => ErrorCategory::QuotaError,
            RelayError::Transport(_) => ErrorCategory::Transient,
            RelayError::Config(_)
            | RelayError::CandidatesExhausted { .. }
            | RelayError::Cancelled
            | RelayError::Internal(_) => ErrorCategory::Unknown,
            RelayError::Upstream { status, .. } => category_from_upstream_status(*status),
        }
    }

    /// Last HTTP status carried by this error, if any.
    #[must_use]
    pub fn status(&self) -> Option<u16> {
        match self {
            RelayError::Upstream { status, .. } => Some(*status),
            RelayError::CandidatesExhausted { last_status, .. } => *last_status,
            _ => None,
        }
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        matches!(self, RelayError::Cancelled)
    }
}

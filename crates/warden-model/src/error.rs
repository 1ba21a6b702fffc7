//! ---
//! warden_section: "04-domain-model"
//! warden_subsection: "module"
//! warden_type: "source"
//! warden_scope: "code"
//! warden_description: "Permission domain types and error taxonomy."
//! warden_version: "v0.0.0-prealpha"
//! warden_owner: "tbd"
//! ---
use thiserror::Error;

/// Shared result type for permission operations.
pub type Result<T> = std::result::Result<T, AuthzError>;

/// Failure taxonomy shared by the read path, the write path and the sync engine.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AuthzError {
    /// Topic or resource absent. Only raised by direct lookups.
    #[error("not found: {0}")]
    NotFound(String),
    /// The caller is not allowed to perform the operation.
    #[error("forbidden: {0}")]
    Forbidden(String),
    /// Malformed request data or a violated permission invariant.
    #[error("invalid input: {0}")]
    InvalidInput(String),
    /// A storage, transport or identity call failed or timed out.
    #[error("transient failure: {0}")]
    Transient(String),
    /// A retry budget was exhausted.
    #[error("fatal failure: {0}")]
    Fatal(String),
}

impl AuthzError {
    /// Caller-facing reason without the category prefix.
    pub fn reason(&self) -> &str {
        match self {
            AuthzError::NotFound(reason)
            | AuthzError::Forbidden(reason)
            | AuthzError::InvalidInput(reason)
            | AuthzError::Transient(reason)
            | AuthzError::Fatal(reason) => reason,
        }
    }

    /// Stable short code for the category.
    pub fn kind(&self) -> &'static str {
        match self {
            AuthzError::NotFound(_) => "not_found",
            AuthzError::Forbidden(_) => "forbidden",
            AuthzError::InvalidInput(_) => "invalid_input",
            AuthzError::Transient(_) => "transient",
            AuthzError::Fatal(_) => "fatal",
        }
    }

    /// Whether repeating the same call may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, AuthzError::Transient(_))
    }

    pub fn not_found(reason: impl Into<String>) -> Self {
        AuthzError::NotFound(reason.into())
    }

    pub fn forbidden(reason: impl Into<String>) -> Self {
        AuthzError::Forbidden(reason.into())
    }

    pub fn invalid(reason: impl Into<String>) -> Self {
        AuthzError::InvalidInput(reason.into())
    }

    pub fn transient(reason: impl Into<String>) -> Self {
        AuthzError::Transient(reason.into())
    }
}

use maestro_core::error::ErrorKind;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("Missing bearer token")]
    MissingToken,

    #[error("Invalid token: {0}")]
    InvalidToken(String),

    #[error("Unknown signing key: {kid}")]
    UnknownKey { kid: String },

    #[error("Signing key '{kid}' is not yet active")]
    FutureKey { kid: String },

    #[error("Token expired")]
    Expired,

    #[error("Token not yet valid")]
    NotYetValid,

    #[error("Token use '{0}' is not accepted here")]
    WrongTokenUse(String),

    #[error("Subject '{0}' is not allowed on this endpoint")]
    SubjectNotAllowed(String),

    #[error("Email verification required")]
    EmailUnverified,

    #[error("Insufficient scopes for this operation")]
    InsufficientScope,

    #[error("Role '{held}' does not grant '{required}'")]
    RoleDenied { held: String, required: String },

    #[error("Tenant context mismatch")]
    TenantMismatch,

    #[error("Tenant is {status}")]
    TenantInactive { status: String },

    #[error("Rate limit '{window}' exceeded")]
    RateLimited { window: String, retry_after_secs: u64 },

    #[error("Usage limit exceeded for '{feature_key}'")]
    UsageLimit {
        feature_key: String,
        limit_type: String,
        limit_value: u64,
        current_usage: u64,
        window: String,
    },

    #[error("Usage policy misconfigured: {0}")]
    PolicyMisconfigured(String),

    #[error("Store error: {0}")]
    Store(#[from] maestro_store::StoreError),
}

impl AuthError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            AuthError::MissingToken
            | AuthError::InvalidToken(_)
            | AuthError::UnknownKey { .. }
            | AuthError::FutureKey { .. }
            | AuthError::Expired
            | AuthError::NotYetValid
            | AuthError::WrongTokenUse(_) => ErrorKind::Unauthenticated,
            AuthError::SubjectNotAllowed(_)
            | AuthError::EmailUnverified
            | AuthError::InsufficientScope
            | AuthError::RoleDenied { .. }
            | AuthError::TenantMismatch
            | AuthError::TenantInactive { .. } => ErrorKind::Forbidden,
            AuthError::RateLimited { .. } => ErrorKind::RateLimited,
            AuthError::UsageLimit { .. } => ErrorKind::UsageLimitExceeded,
            AuthError::PolicyMisconfigured(_) => ErrorKind::PaymentRequired,
            AuthError::Store(e) => e.kind(),
        }
    }
}

pub type Result<T> = std::result::Result<T, AuthError>;

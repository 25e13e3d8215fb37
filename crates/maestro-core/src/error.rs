use serde::Serialize;

/// Cross-cutting error taxonomy.
///
/// Every crate's error type maps into one of these kinds so the HTTP
/// boundary and the streaming channel agree on status codes and terminal
/// frame codes without knowing the concrete error type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Unauthenticated,
    Forbidden,
    NotFound,
    Conflict,
    Validation,
    RateLimited,
    UsageLimitExceeded,
    PaymentRequired,
    GuardrailTriggered,
    ProviderUnavailable,
    Cancelled,
    Internal,
}

impl ErrorKind {
    /// Short machine code carried in error envelopes and terminal frames.
    pub fn code(&self) -> &'static str {
        match self {
            ErrorKind::Unauthenticated => "unauthenticated",
            ErrorKind::Forbidden => "forbidden",
            ErrorKind::NotFound => "not_found",
            ErrorKind::Conflict => "conflict",
            ErrorKind::Validation => "validation",
            ErrorKind::RateLimited => "rate_limited",
            ErrorKind::UsageLimitExceeded => "usage_limit_exceeded",
            ErrorKind::PaymentRequired => "payment_required",
            ErrorKind::GuardrailTriggered => "guardrail_triggered",
            ErrorKind::ProviderUnavailable => "provider_unavailable",
            ErrorKind::Cancelled => "cancelled",
            ErrorKind::Internal => "internal",
        }
    }

    /// HTTP status for non-streaming responses.
    pub fn http_status(&self) -> u16 {
        match self {
            ErrorKind::Unauthenticated => 401,
            ErrorKind::Forbidden => 403,
            ErrorKind::NotFound => 404,
            ErrorKind::Conflict => 409,
            ErrorKind::Validation => 400,
            ErrorKind::RateLimited | ErrorKind::UsageLimitExceeded => 429,
            ErrorKind::PaymentRequired => 402,
            ErrorKind::GuardrailTriggered => 400,
            ErrorKind::ProviderUnavailable => 502,
            ErrorKind::Cancelled => 499,
            ErrorKind::Internal => 500,
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.code())
    }
}

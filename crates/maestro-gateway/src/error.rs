use axum::http::{header, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;
use serde_json::{json, Value};

use maestro_core::error::ErrorKind;
use maestro_tenancy::AuthError;

/// Single error envelope for every non-streaming failure:
/// `{ code, message, details? }`.
#[derive(Debug)]
pub struct ApiError {
    pub kind: ErrorKind,
    pub message: String,
    pub details: Option<Value>,
    pub retry_after_secs: Option<u64>,
}

impl ApiError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            details: None,
            retry_after_secs: None,
        }
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Validation, message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::NotFound, message)
    }

    pub fn with_details(mut self, details: Value) -> Self {
        self.details = Some(details);
        self
    }
}

#[derive(Serialize)]
struct ErrorBody<'a> {
    code: &'a str,
    message: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    details: Option<&'a Value>,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status =
            StatusCode::from_u16(self.kind.http_status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        // internal details stay in the logs, not the response
        let message = if self.kind == ErrorKind::Internal {
            tracing::error!(error = %self.message, "internal error");
            "internal error".to_string()
        } else {
            self.message
        };
        let body = Json(ErrorBody {
            code: self.kind.code(),
            message: &message,
            details: self.details.as_ref(),
        });
        let mut response = (status, body).into_response();
        if self.kind == ErrorKind::Unauthenticated {
            response
                .headers_mut()
                .insert(header::WWW_AUTHENTICATE, HeaderValue::from_static("Bearer"));
        }
        if let Some(secs) = self.retry_after_secs {
            if let Ok(value) = HeaderValue::from_str(&secs.to_string()) {
                response.headers_mut().insert(header::RETRY_AFTER, value);
            }
        }
        response
    }
}

impl From<AuthError> for ApiError {
    fn from(e: AuthError) -> Self {
        let kind = e.kind();
        let mut api = ApiError::new(kind, e.to_string());
        match e {
            AuthError::RateLimited {
                window,
                retry_after_secs,
            } => {
                api.retry_after_secs = Some(retry_after_secs);
                api.details = Some(json!({"window": window}));
            }
            AuthError::UsageLimit {
                feature_key,
                limit_type,
                limit_value,
                current_usage,
                window,
            } => {
                api.retry_after_secs = Some(60);
                api.details = Some(json!({
                    "feature_key": feature_key,
                    "limit_type": limit_type,
                    "limit_value": limit_value,
                    "current_usage": current_usage,
                    "window": window,
                }));
            }
            _ => {}
        }
        api
    }
}

impl From<maestro_store::StoreError> for ApiError {
    fn from(e: maestro_store::StoreError) -> Self {
        ApiError::new(e.kind(), e.to_string())
    }
}

impl From<maestro_ledger::LedgerError> for ApiError {
    fn from(e: maestro_ledger::LedgerError) -> Self {
        match e {
            maestro_ledger::LedgerError::ConversationNotFound => {
                ApiError::not_found("conversation not found")
            }
            other => ApiError::new(other.kind(), other.to_string()),
        }
    }
}

impl From<maestro_engine::EngineError> for ApiError {
    fn from(e: maestro_engine::EngineError) -> Self {
        let kind = e.kind();
        match &e {
            maestro_engine::EngineError::Guardrail { key, stage, info } => {
                ApiError::new(kind, format!("guardrail '{key}' triggered")).with_details(json!({
                    "guardrail_key": key,
                    "guardrail_stage": stage,
                    "info": info,
                }))
            }
            _ => ApiError::new(kind, e.to_string()),
        }
    }
}

impl From<maestro_workflows::WorkflowError> for ApiError {
    fn from(e: maestro_workflows::WorkflowError) -> Self {
        ApiError::new(e.kind(), e.to_string())
    }
}

pub type ApiResult<T> = std::result::Result<T, ApiError>;

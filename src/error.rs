//! Typed error taxonomy with wire status mapping.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;

use crate::adapters::ProviderError;

#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    #[error("missing credential")]
    MissingCredential,

    #[error("invalid credential")]
    InvalidCredential,

    #[error("insufficient permission")]
    InsufficientPermission,

    #[error("rate limited, retry after {reset_unix_ts}")]
    RateLimited { reset_unix_ts: i64 },

    #[error("model not found: {0}")]
    ModelNotFound(String),

    #[error("all providers failed: {0}")]
    AllProvidersFailed(ProviderError),

    #[error("upstream timeout")]
    UpstreamTimeout,

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl GatewayError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            GatewayError::MissingCredential => StatusCode::UNAUTHORIZED,
            GatewayError::InvalidCredential => StatusCode::UNAUTHORIZED,
            GatewayError::InsufficientPermission => StatusCode::FORBIDDEN,
            GatewayError::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
            GatewayError::ModelNotFound(_) => StatusCode::NOT_FOUND,
            GatewayError::AllProvidersFailed(_) => StatusCode::BAD_GATEWAY,
            GatewayError::UpstreamTimeout => StatusCode::GATEWAY_TIMEOUT,
            GatewayError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn error_code(&self) -> &'static str {
        match self {
            GatewayError::MissingCredential => "missing_credential",
            GatewayError::InvalidCredential => "invalid_credential",
            GatewayError::InsufficientPermission => "insufficient_permission",
            GatewayError::RateLimited { .. } => "rate_limited",
            GatewayError::ModelNotFound(_) => "model_not_found",
            GatewayError::AllProvidersFailed(_) => "all_providers_failed",
            GatewayError::UpstreamTimeout => "upstream_timeout",
            GatewayError::Internal(_) => "internal",
        }
    }
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if status == StatusCode::INTERNAL_SERVER_ERROR {
            tracing::error!(error = %self, "internal error");
        }
        let mut body = json!({
            "error": self.to_string(),
            "status": self.error_code(),
        });
        if let GatewayError::AllProvidersFailed(ref provider_error) = self {
            body["provider"] = json!(provider_error.provider);
            body["last_status_code"] = json!(provider_error.status_code);
        }
        if let GatewayError::RateLimited { reset_unix_ts } = self {
            body["reset_unix_ts"] = json!(reset_unix_ts);
        }
        (status, Json(body)).into_response()
    }
}

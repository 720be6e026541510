//! 统一的 API 错误类型：状态码 + 机器可读的 kind + 文本说明。

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::Serialize;
use tracing::warn;

use crate::drive::DriveError;
use crate::oauth::OAuthError;
use crate::token_store::TokenStoreError;

#[derive(Debug)]
pub enum ApiError {
    BadRequest(String),
    PayloadTooLarge(String),
    ExchangeFailed(String),
    AuthorizationRequired(String),
    Remote(String),
    Internal(String),
}

#[derive(Serialize)]
struct ErrorBody {
    kind: &'static str,
    message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    authorize_url: Option<&'static str>,
}

impl ApiError {
    pub fn kind(&self) -> &'static str {
        match self {
            ApiError::BadRequest(_) => "bad_request",
            ApiError::PayloadTooLarge(_) => "payload_too_large",
            ApiError::ExchangeFailed(_) => "exchange_failed",
            ApiError::AuthorizationRequired(_) => "authorization_required",
            ApiError::Remote(_) => "remote_api_error",
            ApiError::Internal(_) => "internal",
        }
    }

    fn status(&self) -> StatusCode {
        match self {
            ApiError::BadRequest(_) | ApiError::ExchangeFailed(_) => StatusCode::BAD_REQUEST,
            ApiError::PayloadTooLarge(_) => StatusCode::PAYLOAD_TOO_LARGE,
            ApiError::AuthorizationRequired(_) => StatusCode::UNAUTHORIZED,
            ApiError::Remote(_) | ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        let kind = self.kind();
        let authorize_url = matches!(self, ApiError::AuthorizationRequired(_)).then_some("/");
        let message = match self {
            ApiError::BadRequest(msg)
            | ApiError::PayloadTooLarge(msg)
            | ApiError::ExchangeFailed(msg)
            | ApiError::AuthorizationRequired(msg)
            | ApiError::Remote(msg)
            | ApiError::Internal(msg) => msg,
        };
        if status.is_server_error() {
            warn!(kind, message = %message, "request failed");
        }
        (
            status,
            Json(ErrorBody {
                kind,
                message,
                authorize_url,
            }),
        )
            .into_response()
    }
}

impl From<TokenStoreError> for ApiError {
    fn from(error: TokenStoreError) -> Self {
        match error {
            TokenStoreError::NotFound(_) | TokenStoreError::Decode(_) => {
                ApiError::AuthorizationRequired(error.to_string())
            }
            TokenStoreError::Io(_) => ApiError::Internal(error.to_string()),
        }
    }
}

impl From<OAuthError> for ApiError {
    fn from(error: OAuthError) -> Self {
        match error {
            OAuthError::Exchange(_) => ApiError::ExchangeFailed(error.to_string()),
            OAuthError::AuthExpired | OAuthError::Refresh(_) => {
                ApiError::AuthorizationRequired(error.to_string())
            }
            OAuthError::InvalidEndpoint { .. } | OAuthError::Client(_) => {
                ApiError::Internal(error.to_string())
            }
        }
    }
}

impl From<DriveError> for ApiError {
    fn from(error: DriveError) -> Self {
        match error {
            DriveError::Auth(inner) => inner.into(),
            other => ApiError::Remote(other.to_string()),
        }
    }
}

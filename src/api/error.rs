//! HTTP error boundary.
//!
//! Every failure leaves the service as `{"error": code, "error_description": msg}`
//! with a stable snake_case code. Internal error chains are logged, not returned.

use crate::bridge::{provider_error_code, BridgeError};
use crate::credentials::{LockError, StoreError};
use crate::provider::ProviderError;
use axum::{
    http::{header, HeaderValue, StatusCode},
    response::{IntoResponse, Json, Response},
};
use serde::Serialize;
use tracing::error;

/// Error response body
#[derive(Serialize)]
struct ErrorResponse<'a> {
    error: &'a str,
    error_description: String,
}

/// Application error types for HTTP handlers
#[derive(Debug)]
pub enum ApiError {
    Bridge(BridgeError),
    /// Malformed resource query parameter
    InvalidParameter(String),
    /// Unparsable request body
    InvalidRequest(String),
    /// Local throttling
    RateLimited { retry_after: u64 },
}

impl From<BridgeError> for ApiError {
    fn from(e: BridgeError) -> Self {
        ApiError::Bridge(e)
    }
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::Bridge(e) => bridge_status(e),
            ApiError::InvalidParameter(_) | ApiError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
        }
    }

    pub fn code(&self) -> &str {
        match self {
            ApiError::Bridge(e) => bridge_code(e),
            ApiError::InvalidParameter(_) => "invalid_parameter",
            ApiError::InvalidRequest(_) => "invalid_request",
            ApiError::RateLimited { .. } => "rate_limited",
        }
    }

    fn description(&self) -> String {
        match self {
            ApiError::Bridge(BridgeError::Storage(StoreError::Lock(LockError::Timeout { .. }))) => {
                "Credential store is busy, retry shortly".to_string()
            }
            ApiError::Bridge(BridgeError::Storage(_)) => "Credential store failure".to_string(),
            ApiError::Bridge(BridgeError::Session(_)) => "Internal server error".to_string(),
            ApiError::Bridge(BridgeError::Provider(e)) => match e {
                ProviderError::RateLimited { .. } => "Provider rate limit exceeded".to_string(),
                ProviderError::Unauthorized => {
                    "Provider rejected the stored credential".to_string()
                }
                _ => "Provider request failed".to_string(),
            },
            ApiError::Bridge(e) => e.to_string(),
            ApiError::InvalidParameter(msg) | ApiError::InvalidRequest(msg) => msg.clone(),
            ApiError::RateLimited { .. } => "Too many requests".to_string(),
        }
    }

    fn retry_after(&self) -> Option<u64> {
        match self {
            ApiError::RateLimited { retry_after } => Some(*retry_after),
            ApiError::Bridge(BridgeError::Provider(ProviderError::RateLimited { retry_after })) => {
                *retry_after
            }
            _ => None,
        }
    }
}

fn bridge_status(e: &BridgeError) -> StatusCode {
    match e {
        BridgeError::InvalidState
        | BridgeError::ProviderDenied(_)
        | BridgeError::InvalidGrant(_)
        | BridgeError::UnsupportedGrantType(_)
        | BridgeError::InvalidRequest(_)
        | BridgeError::UnsupportedResponseType
        | BridgeError::InvalidRedirectUri => StatusCode::BAD_REQUEST,
        BridgeError::InvalidClient
        | BridgeError::UnauthorizedClient
        | BridgeError::InvalidToken
        | BridgeError::InvalidSubject
        | BridgeError::RefreshTokenExpired
        | BridgeError::RefreshRejected => StatusCode::UNAUTHORIZED,
        BridgeError::Provider(ProviderError::RateLimited { .. }) => StatusCode::TOO_MANY_REQUESTS,
        BridgeError::Provider(ProviderError::Unauthorized) => StatusCode::UNAUTHORIZED,
        BridgeError::Provider(_) => StatusCode::BAD_GATEWAY,
        BridgeError::Storage(StoreError::Lock(LockError::Timeout { .. })) => {
            StatusCode::SERVICE_UNAVAILABLE
        }
        BridgeError::Storage(_) | BridgeError::Session(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn bridge_code(e: &BridgeError) -> &str {
    match e {
        BridgeError::InvalidState => "invalid_state",
        BridgeError::ProviderDenied(code) => provider_error_code(code),
        BridgeError::InvalidGrant(_) => "invalid_grant",
        BridgeError::UnsupportedGrantType(_) => "unsupported_grant_type",
        BridgeError::InvalidRequest(_) => "invalid_request",
        BridgeError::UnsupportedResponseType => "unsupported_response_type",
        BridgeError::InvalidRedirectUri => "invalid_redirect_uri",
        BridgeError::InvalidClient => "invalid_client",
        BridgeError::UnauthorizedClient => "unauthorized_client",
        BridgeError::InvalidToken => "invalid_token",
        BridgeError::InvalidSubject => "invalid_subject",
        BridgeError::RefreshTokenExpired => "refresh_token_expired",
        BridgeError::RefreshRejected => "refresh_rejected",
        BridgeError::Provider(ProviderError::RateLimited { .. }) => "provider_rate_limited",
        BridgeError::Provider(ProviderError::Unauthorized) => "provider_unauthorized",
        BridgeError::Provider(_) => "provider_error",
        BridgeError::Storage(StoreError::Lock(LockError::Timeout { .. })) => "storage_unavailable",
        BridgeError::Storage(_) => "storage_error",
        BridgeError::Session(_) => "server_error",
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            error!(status = status.as_u16(), error = ?self, "Request failed");
        }

        let body = Json(ErrorResponse {
            error: self.code(),
            error_description: self.description(),
        });
        let mut response = (status, body).into_response();

        if let Some(secs) = self.retry_after() {
            if let Ok(value) = HeaderValue::from_str(&secs.to_string()) {
                response.headers_mut().insert(header::RETRY_AFTER, value);
            }
        }
        if status == StatusCode::UNAUTHORIZED && self.code() == "invalid_token" {
            response.headers_mut().insert(
                header::WWW_AUTHENTICATE,
                HeaderValue::from_static("Bearer error=\"invalid_token\""),
            );
        }
        response
    }
}

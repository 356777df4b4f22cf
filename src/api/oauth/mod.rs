//! OAuth endpoints for both hops.
//!
//! Hop A (provider side):
//! 1. GET /auth/provider/start → redirect to provider (direct reconnection)
//! 2. Provider redirects to GET /auth/provider/callback
//! 3. Exchange code, store encrypted credentials
//!
//! Hop B (downstream side):
//! 1. GET /oauth/authorize → validate client and redirect_uri, then Hop A
//! 2. Hop A callback redirects back to the caller with a one-time code
//! 3. POST /oauth/token exchanges the code (or a refresh token) for backend tokens

use super::error::ApiError;
use super::AppState;
use crate::bridge::{AuthorizeRequest, CallbackOutcome, Flow, TokenGrant};
use axum::{
    body::Bytes,
    extract::{Query, State},
    http::{header, HeaderMap, HeaderValue},
    response::{Html, IntoResponse, Json, Redirect, Response},
};
use serde::Deserialize;
use tracing::{debug, info};

/// OAuth callback query parameters
#[derive(Deserialize)]
pub struct OAuthCallback {
    code: Option<String>,
    state: Option<String>,
    error: Option<String>,
    error_description: Option<String>,
}

const CONNECTED_PAGE: &str = "<!doctype html>\
<html><head><meta charset=\"utf-8\"><title>Connected</title></head>\
<body><h1>Account connected</h1><p>You can close this window.</p></body></html>";

/// GET /auth/provider/start
///
/// Direct reconnection: redirects straight to the provider, no downstream caller.
pub async fn provider_start(State(state): State<AppState>) -> Redirect {
    debug!("Direct provider authorization requested");
    Redirect::temporary(&state.bridge.start(Flow::Direct))
}

/// GET /auth/provider/callback
///
/// # Security
/// - CSRF state is single-use and consumed before the code is exchanged
/// - Provider error descriptions are logged, never echoed
pub async fn provider_callback(
    State(state): State<AppState>,
    Query(callback): Query<OAuthCallback>,
) -> Result<Response, ApiError> {
    if let Some(description) = callback.error_description.as_deref() {
        debug!(description = %description, "Provider callback carried an error description");
    }

    let outcome = state
        .bridge
        .callback(
            callback.code.as_deref(),
            callback.state.as_deref(),
            callback.error.as_deref(),
        )
        .await?;

    match outcome {
        CallbackOutcome::Redirect(url) => Ok(Redirect::temporary(&url).into_response()),
        CallbackOutcome::Connected { subject } => {
            info!(subject = %subject, "Direct reconnection completed");
            Ok(Html(CONNECTED_PAGE).into_response())
        }
    }
}

/// GET /oauth/authorize
pub async fn authorize(
    State(state): State<AppState>,
    Query(request): Query<AuthorizeRequest>,
) -> Result<Redirect, ApiError> {
    let provider_url = state.bridge.authorize(request)?;
    Ok(Redirect::temporary(&provider_url))
}

/// POST /oauth/token
///
/// Accepts `application/x-www-form-urlencoded` or `application/json`.
pub async fn token(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, ApiError> {
    let grant = parse_grant(&headers, &body)?;
    let tokens = state.bridge.token(grant)?;

    let mut response = Json(tokens).into_response();
    let response_headers = response.headers_mut();
    response_headers.insert(header::CACHE_CONTROL, HeaderValue::from_static("no-store"));
    response_headers.insert(header::PRAGMA, HeaderValue::from_static("no-cache"));
    Ok(response)
}

fn parse_grant(headers: &HeaderMap, body: &[u8]) -> Result<TokenGrant, ApiError> {
    let is_json = headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|ct| ct.trim_start().to_ascii_lowercase().starts_with("application/json"));

    if is_json {
        serde_json::from_slice(body)
            .map_err(|_| ApiError::InvalidRequest("Request body is not valid JSON".to_string()))
    } else {
        serde_urlencoded::from_bytes(body)
            .map_err(|_| ApiError::InvalidRequest("Request body is not a valid form".to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_oauth_callback_deserialization() {
        // Success case
        let query = "code=auth_code_123&state=csrf_state_456";
        let callback: OAuthCallback = serde_urlencoded::from_str(query).unwrap();
        assert_eq!(callback.code, Some("auth_code_123".to_string()));
        assert_eq!(callback.state, Some("csrf_state_456".to_string()));
        assert_eq!(callback.error, None);

        // Error case
        let query = "error=access_denied&error_description=User+cancelled";
        let callback: OAuthCallback = serde_urlencoded::from_str(query).unwrap();
        assert_eq!(callback.error, Some("access_denied".to_string()));
        assert_eq!(callback.error_description, Some("User cancelled".to_string()));
        assert_eq!(callback.code, None);
    }

    #[test]
    fn test_parse_grant_form_and_json() {
        let mut headers = HeaderMap::new();
        headers.insert(
            header::CONTENT_TYPE,
            HeaderValue::from_static("application/x-www-form-urlencoded"),
        );
        let grant = parse_grant(&headers, b"grant_type=refresh_token&refresh_token=abc").unwrap();
        assert_eq!(grant.grant_type.as_deref(), Some("refresh_token"));
        assert_eq!(grant.refresh_token.as_deref(), Some("abc"));

        headers.insert(
            header::CONTENT_TYPE,
            HeaderValue::from_static("application/json; charset=utf-8"),
        );
        let grant =
            parse_grant(&headers, br#"{"grant_type":"authorization_code","code":"c"}"#).unwrap();
        assert_eq!(grant.code.as_deref(), Some("c"));

        let err = parse_grant(&headers, b"grant_type=x").unwrap_err();
        assert_eq!(err.code(), "invalid_request");
    }
}

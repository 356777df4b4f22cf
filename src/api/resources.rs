//! Bearer-protected provider passthroughs and connector management.

use super::error::ApiError;
use super::AppState;
use crate::auth::extract_bearer_token;
use crate::auth::session::SessionClaims;
use crate::bridge::BridgeError;
use crate::provider::ItemsQuery;
use axum::{
    extract::{Query, State},
    http::HeaderMap,
    response::Json,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

/// Largest page the provider serves
pub const MAX_PAGE_SIZE: u32 = 20;

#[derive(Debug, Default, Deserialize)]
pub struct UserParams {
    fields: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct ItemsParams {
    cursor: Option<String>,
    max_count: Option<String>,
    fields: Option<String>,
}

#[derive(Serialize)]
pub struct RevokeResponse {
    revoked: bool,
}

/// Verify the backend access token on the request.
fn authenticate(state: &AppState, headers: &HeaderMap) -> Result<SessionClaims, ApiError> {
    let token = extract_bearer_token(headers).map_err(|e| {
        debug!(error = %e, "Missing or malformed bearer token");
        ApiError::Bridge(BridgeError::InvalidToken)
    })?;
    Ok(state.bridge.authenticate(&token)?)
}

/// GET /api/provider/user?fields=a,b
pub async fn user(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(params): Query<UserParams>,
) -> Result<Json<Value>, ApiError> {
    let claims = authenticate(&state, &headers)?;
    let fields = parse_fields(params.fields.as_deref())?;
    Ok(Json(state.bridge.fetch_user(&claims.sub, &fields).await?))
}

/// GET /api/provider/items?cursor=N&max_count=M&fields=a,b
pub async fn items(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(params): Query<ItemsParams>,
) -> Result<Json<Value>, ApiError> {
    let claims = authenticate(&state, &headers)?;
    let query = parse_items_query(&params)?;
    Ok(Json(state.bridge.list_items(&claims.sub, &query).await?))
}

/// POST /api/connector/revoke
pub async fn revoke(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<RevokeResponse>, ApiError> {
    let claims = authenticate(&state, &headers)?;
    let revoked = state.bridge.revoke(&claims.sub).await?;
    Ok(Json(RevokeResponse { revoked }))
}

/// GET /api/connector/status
pub async fn status(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<Value>, ApiError> {
    let claims = authenticate(&state, &headers)?;
    let record = state.bridge.status(&claims.sub).await?;
    Ok(Json(serde_json::json!({
        "connected": record.is_some(),
        "record": record,
    })))
}

/// Comma-separated `[a-z_]+` names.
fn parse_fields(raw: Option<&str>) -> Result<Vec<String>, ApiError> {
    let Some(raw) = raw.filter(|r| !r.is_empty()) else {
        return Ok(Vec::new());
    };

    raw.split(',')
        .map(|field| {
            let field = field.trim();
            if !field.is_empty() && field.bytes().all(|b| b.is_ascii_lowercase() || b == b'_') {
                Ok(field.to_string())
            } else {
                Err(ApiError::InvalidParameter(format!("Invalid field name: {:?}", field)))
            }
        })
        .collect()
}

fn parse_items_query(params: &ItemsParams) -> Result<ItemsQuery, ApiError> {
    let cursor = params
        .cursor
        .as_deref()
        .filter(|c| !c.is_empty())
        .map(|c| {
            c.parse::<u64>().map_err(|_| {
                ApiError::InvalidParameter("cursor must be a non-negative integer".to_string())
            })
        })
        .transpose()?;

    let max_count = match params.max_count.as_deref().filter(|m| !m.is_empty()) {
        None => MAX_PAGE_SIZE,
        Some(raw) => match raw.parse::<u32>() {
            Ok(n) if (1..=MAX_PAGE_SIZE).contains(&n) => n,
            _ => {
                return Err(ApiError::InvalidParameter(format!(
                    "max_count must be between 1 and {}",
                    MAX_PAGE_SIZE
                )))
            }
        },
    };

    Ok(ItemsQuery {
        cursor,
        max_count,
        fields: parse_fields(params.fields.as_deref())?,
    })
}

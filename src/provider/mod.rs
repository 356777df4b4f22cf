//! Remote identity provider / resource API.
//!
//! The bridge only talks to the provider through [`ProviderClient`], so tests
//! can swap in a fake without a network. [`HttpProvider`] is the reqwest-based
//! implementation used in production.

mod config;
mod http;

pub use config::ProviderConfig;
pub use http::HttpProvider;

use async_trait::async_trait;
use serde_json::Value;

/// Token endpoint result (exchange or refresh).
#[derive(Clone, Debug, PartialEq)]
pub struct ProviderTokens {
    /// Stable account id; always present on exchange, optional on refresh
    pub subject: Option<String>,
    pub access_token: String,
    pub refresh_token: Option<String>,
    /// Access token lifetime in seconds
    pub expires_in: Option<i64>,
    /// Refresh token lifetime in seconds
    pub refresh_expires_in: Option<i64>,
    pub scope: Option<String>,
}

/// Paginated item listing parameters (already validated).
#[derive(Clone, Debug, PartialEq, Default)]
pub struct ItemsQuery {
    pub cursor: Option<u64>,
    pub max_count: u32,
    pub fields: Vec<String>,
}

/// Provider failures, classified once at the HTTP boundary.
#[derive(Debug, Clone, PartialEq)]
pub enum ProviderError {
    /// Network error or timeout
    Transport(String),
    /// 4xx from the token endpoint, with the OAuth error code
    Rejected { status: u16, code: String },
    /// Resource API refused the access token
    Unauthorized,
    /// Provider throttled us
    RateLimited { retry_after: Option<u64> },
    /// 5xx or unexpected status
    Upstream { status: u16 },
    /// Body did not have the expected shape
    InvalidResponse(String),
}

impl std::fmt::Display for ProviderError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProviderError::Transport(msg) => write!(f, "Provider request failed: {}", msg),
            ProviderError::Rejected { status, code } => {
                write!(f, "Provider rejected request ({}): {}", status, code)
            }
            ProviderError::Unauthorized => write!(f, "Provider rejected the access token"),
            ProviderError::RateLimited { retry_after } => match retry_after {
                Some(secs) => write!(f, "Provider rate limit exceeded (retry after {}s)", secs),
                None => write!(f, "Provider rate limit exceeded"),
            },
            ProviderError::Upstream { status } => write!(f, "Provider error status {}", status),
            ProviderError::InvalidResponse(msg) => {
                write!(f, "Unexpected provider response: {}", msg)
            }
        }
    }
}

impl std::error::Error for ProviderError {}

/// Everything the bridge needs from the provider.
#[async_trait]
pub trait ProviderClient: Send + Sync {
    /// Authorization URL the user agent is sent to
    fn authorize_url(&self, state: &str, redirect_uri: &str) -> String;

    /// Exchange an authorization code for tokens
    async fn exchange_code(
        &self,
        code: &str,
        redirect_uri: &str,
    ) -> Result<ProviderTokens, ProviderError>;

    /// Use a refresh token to obtain a new access token
    async fn refresh(&self, refresh_token: &str) -> Result<ProviderTokens, ProviderError>;

    /// Authenticated user's profile
    async fn fetch_user(
        &self,
        access_token: &str,
        fields: &[String],
    ) -> Result<Value, ProviderError>;

    /// One page of the authenticated user's items
    async fn list_items(
        &self,
        access_token: &str,
        query: &ItemsQuery,
    ) -> Result<Value, ProviderError>;
}

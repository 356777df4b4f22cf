//! OAuth provider configuration.

use std::time::Duration;

/// OAuth provider configuration
#[derive(Clone, Debug)]
pub struct ProviderConfig {
    /// OAuth authorization endpoint URL
    pub authorize_url: String,

    /// OAuth token endpoint URL (exchange and refresh)
    pub token_url: String,

    /// Resource API base URL, without trailing slash
    pub api_base_url: String,

    /// Requested scopes, passed through verbatim
    pub scope: String,

    pub client_id: String,

    pub client_secret: String,

    /// Bound on every outbound provider call
    pub timeout: Duration,
}

impl ProviderConfig {
    /// Build authorization URL with state and redirect_uri
    pub fn build_auth_url(&self, state: &str, redirect_uri: &str) -> String {
        let separator = if self.authorize_url.contains('?') { '&' } else { '?' };
        format!(
            "{}{}client_id={}&redirect_uri={}&scope={}&state={}&response_type=code",
            self.authorize_url,
            separator,
            urlencoding::encode(&self.client_id),
            urlencoding::encode(redirect_uri),
            urlencoding::encode(&self.scope),
            urlencoding::encode(state)
        )
    }
}

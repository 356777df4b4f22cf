//! Hop B: this service as OAuth server for the downstream client.

use super::{BridgeError, Flow, OAuthBridge};
use crate::auth::session::TokenKind;
use reqwest::Url;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

/// `/oauth/authorize` query parameters
#[derive(Debug, Default, Deserialize)]
pub struct AuthorizeRequest {
    pub response_type: Option<String>,
    pub client_id: Option<String>,
    pub redirect_uri: Option<String>,
    pub state: Option<String>,
}

/// `/oauth/token` body, form or JSON
#[derive(Debug, Default, Deserialize)]
pub struct TokenGrant {
    pub grant_type: Option<String>,
    pub code: Option<String>,
    pub redirect_uri: Option<String>,
    pub refresh_token: Option<String>,
    pub client_id: Option<String>,
    pub client_secret: Option<String>,
}

/// RFC 6749 §5.1 token response
#[derive(Debug, Serialize, Deserialize, PartialEq)]
pub struct TokenResponse {
    pub access_token: String,
    pub token_type: String,
    pub expires_in: u64,
    pub refresh_token: String,
    pub scope: String,
}

impl OAuthBridge {
    /// Validate a downstream authorize request and return the provider authorize URL.
    pub fn authorize(&self, request: AuthorizeRequest) -> Result<String, BridgeError> {
        if request.response_type.as_deref() != Some("code") {
            return Err(BridgeError::UnsupportedResponseType);
        }
        if request.client_id.as_deref() != Some(self.config.client_id.as_str()) {
            warn!(client_id = ?request.client_id, "Authorize request from unknown client");
            return Err(BridgeError::UnauthorizedClient);
        }
        let redirect_uri = request.redirect_uri.ok_or(BridgeError::InvalidRedirectUri)?;
        self.validate_redirect_uri(&redirect_uri)?;

        info!(redirect_host = ?host_of(&redirect_uri), "Downstream authorization started");
        Ok(self.start(Flow::Bridge {
            redirect_uri,
            caller_state: request.state,
        }))
    }

    /// Only http(s) URIs on an allowed host, without fragment.
    fn validate_redirect_uri(&self, redirect_uri: &str) -> Result<(), BridgeError> {
        let url = Url::parse(redirect_uri).map_err(|_| BridgeError::InvalidRedirectUri)?;
        let allowed = matches!(url.scheme(), "http" | "https")
            && url.fragment().is_none()
            && url
                .host_str()
                .is_some_and(|host| self.config.is_allowed_redirect_host(host));

        if !allowed {
            warn!(redirect_host = ?url.host_str(), "Rejected downstream redirect_uri");
            return Err(BridgeError::InvalidRedirectUri);
        }
        Ok(())
    }

    /// Token endpoint: `authorization_code` and `refresh_token` grants.
    pub fn token(&self, grant: TokenGrant) -> Result<TokenResponse, BridgeError> {
        self.authenticate_client(&grant)?;

        match grant.grant_type.as_deref() {
            Some("authorization_code") => self.authorization_code_grant(grant),
            Some("refresh_token") => self.refresh_token_grant(grant),
            Some(other) => Err(BridgeError::UnsupportedGrantType(other.to_string())),
            None => Err(BridgeError::InvalidRequest("missing grant_type")),
        }
    }

    /// `client_id` is optional; a configured secret is not.
    fn authenticate_client(&self, grant: &TokenGrant) -> Result<(), BridgeError> {
        if let Some(client_id) = grant.client_id.as_deref() {
            if client_id != self.config.client_id {
                warn!(client_id = %client_id, "Token request from unknown client");
                return Err(BridgeError::InvalidClient);
            }
        }
        if let Some(expected) = self.config.client_secret.as_deref() {
            let supplied = grant.client_secret.as_deref().unwrap_or("");
            if !constant_time_eq(supplied.as_bytes(), expected.as_bytes()) {
                warn!("Token request with bad client secret");
                return Err(BridgeError::InvalidClient);
            }
        }
        Ok(())
    }

    fn authorization_code_grant(&self, grant: TokenGrant) -> Result<TokenResponse, BridgeError> {
        let code = grant
            .code
            .filter(|c| !c.is_empty())
            .ok_or(BridgeError::InvalidRequest("missing code"))?;
        let entry = self
            .codes
            .consume(&code)
            .ok_or(BridgeError::InvalidGrant("authorization code is invalid or expired"))?;

        if let Some(redirect_uri) = grant.redirect_uri.as_deref() {
            if redirect_uri != entry.redirect_uri {
                return Err(BridgeError::InvalidGrant("redirect_uri does not match"));
            }
        }

        let response = TokenResponse {
            access_token: self
                .sessions
                .issue(&entry.subject, &entry.scopes, TokenKind::Access)?,
            token_type: "Bearer".to_string(),
            expires_in: self.sessions.access_ttl().as_secs(),
            refresh_token: self
                .sessions
                .issue(&entry.subject, &entry.scopes, TokenKind::Refresh)?,
            scope: entry.scopes,
        };
        info!(subject = %entry.subject, "Authorization code exchanged");
        Ok(response)
    }

    fn refresh_token_grant(&self, grant: TokenGrant) -> Result<TokenResponse, BridgeError> {
        let refresh_token = grant
            .refresh_token
            .filter(|t| !t.is_empty())
            .ok_or(BridgeError::InvalidRequest("missing refresh_token"))?;
        let claims = self
            .sessions
            .verify(&refresh_token, TokenKind::Refresh)
            .map_err(|e| {
                debug!(error = %e, "Rejected refresh token");
                BridgeError::InvalidGrant("refresh token is invalid")
            })?;

        let refresh_token = if self.config.settings.session.rotate_refresh_tokens {
            self.sessions
                .issue(&claims.sub, &claims.scope, TokenKind::Refresh)?
        } else {
            refresh_token
        };

        debug!(subject = %claims.sub, "Backend access token refreshed");
        Ok(TokenResponse {
            access_token: self
                .sessions
                .issue(&claims.sub, &claims.scope, TokenKind::Access)?,
            token_type: "Bearer".to_string(),
            expires_in: self.sessions.access_ttl().as_secs(),
            refresh_token,
            scope: claims.scope,
        })
    }
}

fn host_of(uri: &str) -> Option<String> {
    Url::parse(uri).ok()?.host_str().map(str::to_string)
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

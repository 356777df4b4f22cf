//! Two-hop OAuth bridge.
//!
//! Hop A ([`upstream`]): this service is an OAuth client of the provider. It
//! runs the authorization-code flow, then stores the provider tokens keyed by
//! subject.
//!
//! Hop B ([`downstream`]): this service is an OAuth server for the reporting
//! client. It issues its own signed session tokens so the client never sees
//! provider tokens.
//!
//! Resource calls verify a Hop B access token, then resolve a fresh provider
//! access token for its subject, refreshing on read when needed:
//!
//! ```text
//! Unauthenticated ──exchange──▶ Active ──time──▶ NeedsRefresh ──refresh ok──▶ Active
//!                                                    └──refresh fails──▶ Expired ──Hop A──▶ Active
//! any ──revoke──▶ Unauthenticated
//! ```

pub mod downstream;
pub mod upstream;

pub use downstream::{AuthorizeRequest, TokenGrant, TokenResponse};
pub use upstream::CallbackOutcome;

use crate::auth::session::{SessionClaims, SessionError, SessionTokens, TokenKind};
use crate::config::BridgeConfig;
use crate::credentials::{CredentialStore, SafeRecord, StoreError, TokenData};
use crate::ephemeral::EphemeralRegistry;
use crate::provider::{ItemsQuery, ProviderClient, ProviderError, ProviderTokens};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Provider refresh grants without an advertised lifetime are assumed to last this long
const DEFAULT_REFRESH_LIFETIME_DAYS: i64 = 365;

/// Provider access tokens without `expires_in` are assumed to last this long
const DEFAULT_ACCESS_LIFETIME_SECS: i64 = 3600;

/// Which flow a CSRF state belongs to.
#[derive(Clone, Debug, PartialEq)]
pub enum Flow {
    /// Bare reconnection; the callback renders a success page
    Direct,
    /// On behalf of a downstream authorize call
    Bridge {
        redirect_uri: String,
        caller_state: Option<String>,
    },
}

/// Pending provider authorization, keyed by CSRF state.
#[derive(Clone, Debug)]
pub struct StateEntry {
    pub flow: Flow,
    pub created_at: DateTime<Utc>,
}

/// One-time downstream authorization code.
#[derive(Clone, Debug)]
pub struct AuthorizationCode {
    pub subject: String,
    pub scopes: String,
    pub redirect_uri: String,
    pub created_at: DateTime<Utc>,
}

/// Bridge failures, mapped to HTTP responses by `api::error`.
#[derive(Debug)]
pub enum BridgeError {
    /// Unknown, expired or replayed CSRF state
    InvalidState,
    /// Provider reported an authorize-time error
    ProviderDenied(String),
    /// Code or refresh token is invalid, consumed or of the wrong kind
    InvalidGrant(&'static str),
    UnsupportedGrantType(String),
    InvalidRequest(&'static str),
    UnsupportedResponseType,
    InvalidRedirectUri,
    /// Token endpoint client authentication failed
    InvalidClient,
    /// Authorize called with an unknown client id
    UnauthorizedClient,
    /// Missing or invalid backend access token
    InvalidToken,
    /// No stored credential for the subject
    InvalidSubject,
    /// Stored refresh grant has expired; Hop A must be re-run
    RefreshTokenExpired,
    /// Provider refused the stored refresh token
    RefreshRejected,
    Provider(ProviderError),
    Storage(StoreError),
    Session(SessionError),
}

impl std::fmt::Display for BridgeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BridgeError::InvalidState => write!(f, "Invalid or expired OAuth state"),
            BridgeError::ProviderDenied(code) => {
                write!(f, "Provider authorization failed: {}", code)
            }
            BridgeError::InvalidGrant(reason) => write!(f, "Invalid grant: {}", reason),
            BridgeError::UnsupportedGrantType(grant) => {
                write!(f, "Unsupported grant_type: {}", grant)
            }
            BridgeError::InvalidRequest(reason) => write!(f, "Invalid request: {}", reason),
            BridgeError::UnsupportedResponseType => {
                write!(f, "Only response_type=code is supported")
            }
            BridgeError::InvalidRedirectUri => write!(f, "redirect_uri is missing or not allowed"),
            BridgeError::InvalidClient => write!(f, "Client authentication failed"),
            BridgeError::UnauthorizedClient => write!(f, "Unknown client_id"),
            BridgeError::InvalidToken => write!(f, "Missing or invalid access token"),
            BridgeError::InvalidSubject => write!(f, "No stored credential for this account"),
            BridgeError::RefreshTokenExpired => {
                write!(f, "Provider authorization expired, reconnect required")
            }
            BridgeError::RefreshRejected => write!(f, "Provider rejected the refresh token"),
            BridgeError::Provider(e) => write!(f, "{}", e),
            BridgeError::Storage(e) => write!(f, "{}", e),
            BridgeError::Session(e) => write!(f, "{}", e),
        }
    }
}

impl std::error::Error for BridgeError {}

impl From<StoreError> for BridgeError {
    fn from(e: StoreError) -> Self {
        BridgeError::Storage(e)
    }
}

impl From<ProviderError> for BridgeError {
    fn from(e: ProviderError) -> Self {
        BridgeError::Provider(e)
    }
}

impl From<SessionError> for BridgeError {
    fn from(e: SessionError) -> Self {
        BridgeError::Session(e)
    }
}

/// Orchestrates both hops and provider resource access.
#[derive(Clone)]
pub struct OAuthBridge {
    config: Arc<BridgeConfig>,
    store: Arc<CredentialStore>,
    provider: Arc<dyn ProviderClient>,
    sessions: SessionTokens,
    states: EphemeralRegistry<StateEntry>,
    codes: EphemeralRegistry<AuthorizationCode>,
}

impl OAuthBridge {
    pub fn new(
        config: Arc<BridgeConfig>,
        store: Arc<CredentialStore>,
        provider: Arc<dyn ProviderClient>,
    ) -> Result<Self, SessionError> {
        let settings = &config.settings;
        let sessions = SessionTokens::new(
            &config.signing_secret,
            &settings.session.issuer,
            Duration::from_secs(settings.session.access_ttl_seconds),
            Duration::from_secs(settings.session.refresh_ttl_seconds),
        )?;
        let states = EphemeralRegistry::new(
            "oauth_state",
            Duration::from_secs(settings.handshake.state_ttl_seconds),
        );
        let codes = EphemeralRegistry::new(
            "authorization_code",
            Duration::from_secs(settings.handshake.code_ttl_seconds),
        );

        Ok(Self {
            config,
            store,
            provider,
            sessions,
            states,
            codes,
        })
    }

    pub fn config(&self) -> &BridgeConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<CredentialStore> {
        &self.store
    }

    /// Start the background sweeps of both ephemeral registries
    pub fn spawn_sweepers(&self) -> Vec<JoinHandle<()>> {
        vec![self.states.spawn_sweeper(), self.codes.spawn_sweeper()]
    }

    /// Verify a downstream access token.
    pub fn authenticate(&self, bearer: &str) -> Result<SessionClaims, BridgeError> {
        self.sessions.verify(bearer, TokenKind::Access).map_err(|e| {
            debug!(error = %e, "Rejected backend access token");
            BridgeError::InvalidToken
        })
    }

    /// Returns a provider access token for `subject`, refreshing it if needed.
    ///
    /// The whole read-check-refresh-save runs under the store lock, so
    /// concurrent callers serialize and later ones see the refreshed token.
    pub async fn resolve_provider_access_token(
        &self,
        subject: &str,
    ) -> Result<String, BridgeError> {
        let mut tx = self.store.begin().await?;
        let record = tx.get(subject).ok_or(BridgeError::InvalidSubject)?;

        if record.is_access_token_valid() {
            return Ok(record.access_token);
        }
        if !record.is_refresh_token_valid() {
            info!(subject = %subject, "Provider refresh grant expired");
            return Err(BridgeError::RefreshTokenExpired);
        }

        debug!(subject = %subject, "Provider access token near expiry, refreshing");
        let refreshed = self
            .provider
            .refresh(&record.refresh_token)
            .await
            .map_err(|e| match e {
                ProviderError::Rejected { .. } | ProviderError::Unauthorized => {
                    warn!(subject = %subject, error = %e, "Provider rejected refresh token");
                    BridgeError::RefreshRejected
                }
                other => BridgeError::Provider(other),
            })?;

        let now = Utc::now();
        let data = TokenData {
            expires_at: access_expiry(now, &refreshed),
            refresh_expires_at: refreshed
                .refresh_expires_in
                .map(|secs| now + ChronoDuration::seconds(secs))
                .unwrap_or(record.refresh_expires_at),
            // Providers that do not rotate omit the refresh token
            refresh_token: refreshed.refresh_token.unwrap_or(record.refresh_token),
            scopes: refreshed.scope.unwrap_or(record.scopes),
            access_token: refreshed.access_token,
        };
        tx.save(subject, &data)?;

        info!(subject = %subject, expires_at = %data.expires_at, "Provider access token refreshed");
        Ok(data.access_token)
    }

    /// Authenticated user's profile from the provider
    pub async fn fetch_user(&self, subject: &str, fields: &[String]) -> Result<Value, BridgeError> {
        let access_token = self.resolve_provider_access_token(subject).await?;
        Ok(self.provider.fetch_user(&access_token, fields).await?)
    }

    /// One page of the authenticated user's items
    pub async fn list_items(
        &self,
        subject: &str,
        query: &ItemsQuery,
    ) -> Result<Value, BridgeError> {
        let access_token = self.resolve_provider_access_token(subject).await?;
        Ok(self.provider.list_items(&access_token, query).await?)
    }

    /// Delete the stored provider credential. Returns whether one existed.
    pub async fn revoke(&self, subject: &str) -> Result<bool, BridgeError> {
        let removed = self.store.revoke(subject).await?;
        info!(subject = %subject, removed, "Connector revoke requested");
        Ok(removed)
    }

    /// Redacted metadata of the caller's stored credential
    pub async fn status(&self, subject: &str) -> Result<Option<SafeRecord>, BridgeError> {
        let records = self.store.list_safe().await?;
        Ok(records.into_iter().find(|r| r.subject == subject))
    }
}

/// Provider-reported authorization error, echoed only if it looks like an
/// OAuth error code.
pub fn provider_error_code(raw: &str) -> &str {
    let well_formed = !raw.is_empty()
        && raw.len() <= 64
        && raw.bytes().all(|b| b.is_ascii_lowercase() || b == b'_');
    if well_formed {
        raw
    } else {
        "access_denied"
    }
}

fn access_expiry(now: DateTime<Utc>, tokens: &ProviderTokens) -> DateTime<Utc> {
    now + ChronoDuration::seconds(tokens.expires_in.unwrap_or(DEFAULT_ACCESS_LIFETIME_SECS))
}

fn refresh_expiry(now: DateTime<Utc>, tokens: &ProviderTokens) -> DateTime<Utc> {
    match tokens.refresh_expires_in {
        Some(secs) => now + ChronoDuration::seconds(secs),
        None => now + ChronoDuration::days(DEFAULT_REFRESH_LIFETIME_DAYS),
    }
}

//! Backend-issued session tokens for the downstream client.
//!
//! HS256 JWTs carrying the provider subject, the granted scopes and the token
//! kind. Nothing is persisted server-side; the signing secret is loaded once at
//! startup.

use chrono::Utc;
use jsonwebtoken::{
    decode, encode, errors::ErrorKind, Algorithm, DecodingKey, EncodingKey, Header, Validation,
};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use uuid::Uuid;

/// Shortest accepted signing secret
pub const MIN_SECRET_LEN: usize = 32;

/// Values that show up in sample configs and must never reach production
const PLACEHOLDER_SECRETS: &[&str] = &[
    "changeme",
    "change-me",
    "change_me",
    "replace-me",
    "replace_me",
    "your-secret-here",
    "your_secret_here",
    "secret",
    "password",
    "default",
    "example",
];

/// Kind of session token
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TokenKind {
    Access,
    Refresh,
}

impl std::fmt::Display for TokenKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TokenKind::Access => write!(f, "access"),
            TokenKind::Refresh => write!(f, "refresh"),
        }
    }
}

/// JWT claims structure.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SessionClaims {
    /// Provider subject the token is bound to
    pub sub: String,
    /// Granted scopes
    pub scope: String,
    /// Token kind
    #[serde(rename = "typ")]
    pub kind: TokenKind,
    pub iss: String,
    /// Issued at (Unix seconds)
    pub iat: u64,
    /// Expiration (Unix seconds)
    pub exp: u64,
    /// Unique token id
    pub jti: String,
}

/// Session token errors
#[derive(Debug, PartialEq, Clone)]
pub enum SessionError {
    /// Secret too short or a known placeholder
    WeakSecret(String),
    /// Bad signature, wrong issuer or malformed token
    Invalid,
    /// Signature fine, but past `exp`
    Expired,
    /// Valid token of the other kind
    WrongKind { expected: TokenKind, found: TokenKind },
    /// Encoding failed
    Signing(String),
}

impl std::fmt::Display for SessionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SessionError::WeakSecret(reason) => write!(f, "Weak signing secret: {}", reason),
            SessionError::Invalid => write!(f, "Invalid session token"),
            SessionError::Expired => write!(f, "Session token expired"),
            SessionError::WrongKind { expected, found } => {
                write!(f, "Expected a {} token, got a {} token", expected, found)
            }
            SessionError::Signing(msg) => write!(f, "Session token signing failed: {}", msg),
        }
    }
}

impl std::error::Error for SessionError {}

/// Rejects short or placeholder signing secrets.
pub fn validate_secret(secret: &str) -> Result<(), SessionError> {
    if secret.len() < MIN_SECRET_LEN {
        return Err(SessionError::WeakSecret(format!(
            "must be at least {} characters, got {}",
            MIN_SECRET_LEN,
            secret.len()
        )));
    }

    let lowered = secret.to_ascii_lowercase();
    if PLACEHOLDER_SECRETS.iter().any(|p| lowered.contains(p)) {
        return Err(SessionError::WeakSecret(
            "looks like a placeholder value".to_string(),
        ));
    }

    let mut chars = secret.chars();
    if let Some(first) = chars.next() {
        if chars.all(|c| c == first) {
            return Err(SessionError::WeakSecret(
                "consists of a single repeated character".to_string(),
            ));
        }
    }

    Ok(())
}

/// Issues and verifies session tokens.
#[derive(Clone)]
pub struct SessionTokens {
    encoding_key: EncodingKey,
    decoding_key: DecodingKey,
    issuer: String,
    access_ttl: Duration,
    refresh_ttl: Duration,
}

impl SessionTokens {
    /// # Arguments
    /// * `secret` - HMAC secret, validated with [`validate_secret`]
    /// * `issuer` - `iss` claim, checked on verify
    /// * `access_ttl` / `refresh_ttl` - Lifetimes per token kind
    pub fn new(
        secret: &str,
        issuer: &str,
        access_ttl: Duration,
        refresh_ttl: Duration,
    ) -> Result<Self, SessionError> {
        validate_secret(secret)?;
        Ok(Self {
            encoding_key: EncodingKey::from_secret(secret.as_bytes()),
            decoding_key: DecodingKey::from_secret(secret.as_bytes()),
            issuer: issuer.to_string(),
            access_ttl,
            refresh_ttl,
        })
    }

    pub fn access_ttl(&self) -> Duration {
        self.access_ttl
    }

    pub fn issue(
        &self,
        subject: &str,
        scope: &str,
        kind: TokenKind,
    ) -> Result<String, SessionError> {
        let now = Utc::now().timestamp().max(0) as u64;
        let ttl = match kind {
            TokenKind::Access => self.access_ttl,
            TokenKind::Refresh => self.refresh_ttl,
        };

        let claims = SessionClaims {
            sub: subject.to_string(),
            scope: scope.to_string(),
            kind,
            iss: self.issuer.clone(),
            iat: now,
            exp: now + ttl.as_secs(),
            jti: Uuid::new_v4().to_string(),
        };

        encode(&Header::new(Algorithm::HS256), &claims, &self.encoding_key)
            .map_err(|e| SessionError::Signing(e.to_string()))
    }

    /// Verifies signature, issuer, expiry and the claimed kind.
    pub fn verify(&self, token: &str, expected: TokenKind) -> Result<SessionClaims, SessionError> {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.set_issuer(&[&self.issuer]);
        validation.leeway = 0;

        let claims = decode::<SessionClaims>(token, &self.decoding_key, &validation)
            .map(|data| data.claims)
            .map_err(|e| match e.kind() {
                ErrorKind::ExpiredSignature => SessionError::Expired,
                _ => SessionError::Invalid,
            })?;

        if claims.kind != expected {
            return Err(SessionError::WrongKind {
                expected,
                found: claims.kind,
            });
        }

        Ok(claims)
    }
}

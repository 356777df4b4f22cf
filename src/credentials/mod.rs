//! Encrypted credential storage for provider OAuth tokens.
//!
//! One token pair is stored per provider subject, AES-256-GCM encrypted, in a
//! single JSON document guarded by a cross-process lock file.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────┐
//! │       CredentialStore                    │
//! │  - get / save / revoke / prune           │
//! │  - legacy plaintext migration            │
//! └─────────────────────────────────────────┘
//!          ↓                    ↑
//! ┌──────────────┐ ┌───────────┐ ┌──────────────┐
//! │ encryption   │ │ lock      │ │ persistence  │
//! │ AES-256-GCM  │ │ PID file  │ │ tmp + rename │
//! └──────────────┘ └───────────┘ └──────────────┘
//! ```
//!
//! # Usage
//!
//! ```no_run
//! use std::time::Duration;
//! use tokenbridge::credentials::{CredentialStore, EncryptionKey, FileLock, TokenData};
//! use chrono::{Duration as ChronoDuration, Utc};
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let key = EncryptionKey::parse(&std::env::var("BRIDGE_ENCRYPTION_KEY")?)?;
//! let lock = FileLock::new(
//!     "data/tokens.json.lock",
//!     Duration::from_secs(10),
//!     Duration::from_millis(50),
//! );
//! let store = CredentialStore::new("data/tokens.json", lock, key, ChronoDuration::days(30))?;
//!
//! store.save("open-id-123", &TokenData {
//!     access_token: "act.example".to_string(),
//!     refresh_token: "rft.example".to_string(),
//!     expires_at: Utc::now() + ChronoDuration::hours(24),
//!     refresh_expires_at: Utc::now() + ChronoDuration::days(365),
//!     scopes: "user.info.basic,video.list".to_string(),
//! }).await?;
//!
//! if let Some(record) = store.get("open-id-123").await? {
//!     println!("valid: {}", record.is_access_token_valid());
//! }
//! # Ok(())
//! # }
//! ```
//!
//! # Security
//!
//! - Both tokens encrypted at rest, each with its own nonce
//! - A record that fails to decrypt reads as absent, never as an error
//! - Store file is mode 0600 inside an owner-only directory

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;

mod encryption;
mod lock;
mod persistence;
mod storage;

pub use encryption::{decrypt, encrypt, EncryptError, EncryptionKey, Envelope, KeyError};
pub use lock::{FileLock, LockError, LockGuard};
pub use persistence::atomic_write;
pub use storage::{run_prune_loop, CredentialStore, StoreError, StoreTransaction};

/// Tokens are treated as expired this long before their real expiry.
pub const SAFETY_BUFFER_SECS: i64 = 300;

fn safety_buffer() -> Duration {
    Duration::seconds(SAFETY_BUFFER_SECS)
}

/// Plaintext token pair handed to the store for saving.
#[derive(Clone, Debug, PartialEq)]
pub struct TokenData {
    pub access_token: String,
    pub refresh_token: String,
    pub expires_at: DateTime<Utc>,
    pub refresh_expires_at: DateTime<Utc>,
    pub scopes: String,
}

/// Decrypted record for one subject.
#[derive(Clone, Debug, PartialEq)]
pub struct TokenRecord {
    pub subject: String,
    pub access_token: String,
    pub refresh_token: String,
    pub expires_at: DateTime<Utc>,
    pub refresh_expires_at: DateTime<Utc>,
    pub scopes: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl TokenRecord {
    pub fn is_access_token_valid(&self) -> bool {
        self.is_access_token_valid_at(Utc::now())
    }

    pub fn is_access_token_valid_at(&self, now: DateTime<Utc>) -> bool {
        now < self.expires_at - safety_buffer()
    }

    pub fn is_refresh_token_valid(&self) -> bool {
        self.is_refresh_token_valid_at(Utc::now())
    }

    pub fn is_refresh_token_valid_at(&self, now: DateTime<Utc>) -> bool {
        now < self.refresh_expires_at - safety_buffer()
    }
}

/// Non-secret view of a record, for operational inspection.
#[derive(Clone, Debug, Serialize, PartialEq)]
pub struct SafeRecord {
    pub subject: String,
    pub scopes: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub refresh_expires_at: DateTime<Utc>,
    /// First characters of the access token followed by `...`; absent if undecryptable
    #[serde(skip_serializing_if = "Option::is_none")]
    pub access_token_preview: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub access_token_length: Option<usize>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record_expiring_at(expires_at: DateTime<Utc>) -> TokenRecord {
        let now = Utc::now();
        TokenRecord {
            subject: "subject-1".to_string(),
            access_token: "access".to_string(),
            refresh_token: "refresh".to_string(),
            expires_at,
            refresh_expires_at: expires_at,
            scopes: "user.info.basic".to_string(),
            created_at: now,
            updated_at: now,
        }
    }

    #[test]
    fn test_access_token_validity_applies_safety_buffer() {
        let expires_at = Utc::now() + Duration::hours(1);
        let record = record_expiring_at(expires_at);
        let boundary = expires_at - Duration::seconds(SAFETY_BUFFER_SECS);

        assert!(record.is_access_token_valid_at(boundary - Duration::milliseconds(1)));
        assert!(!record.is_access_token_valid_at(boundary));
        assert!(!record.is_access_token_valid_at(expires_at));
    }

    #[test]
    fn test_refresh_token_validity_applies_safety_buffer() {
        let expires_at = Utc::now() + Duration::days(2);
        let record = record_expiring_at(expires_at);
        let boundary = expires_at - Duration::seconds(SAFETY_BUFFER_SECS);

        assert!(record.is_refresh_token_valid_at(boundary - Duration::milliseconds(1)));
        assert!(!record.is_refresh_token_valid_at(boundary));
    }

    #[test]
    fn test_token_expiring_within_buffer_is_already_invalid() {
        let record = record_expiring_at(Utc::now() + Duration::seconds(60));
        assert!(!record.is_access_token_valid());
    }

    #[test]
    fn test_safe_record_omits_missing_preview() {
        let now = Utc::now();
        let safe = SafeRecord {
            subject: "subject-1".to_string(),
            scopes: "user.info.basic".to_string(),
            created_at: now,
            updated_at: now,
            expires_at: now,
            refresh_expires_at: now,
            access_token_preview: None,
            access_token_length: None,
        };

        let json = serde_json::to_string(&safe).unwrap();
        assert!(json.contains("\"subject\":\"subject-1\""));
        assert!(!json.contains("access_token_preview"));
    }
}

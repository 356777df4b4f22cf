//! Encrypted credential storage in a single locked JSON file.
//!
//! Every operation holds the [`FileLock`] for its whole read-modify-write span.
//! Legacy files with plaintext token strings are rewritten in the encrypted
//! shape as soon as they are loaded.

use super::encryption::{self, EncryptError, EncryptionKey, Envelope};
use super::lock::{FileLock, LockError, LockGuard};
use super::persistence::{atomic_write, ensure_private_dir};
use super::{SafeRecord, TokenData, TokenRecord};
use chrono::{DateTime, Duration, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Current on-disk format version
const STORE_VERSION: u32 = 2;

/// Refresh lifetime assumed for legacy records that never recorded one
const LEGACY_REFRESH_LIFETIME_DAYS: i64 = 365;

/// Characters of the access token shown by `list_safe`
const PREVIEW_CHARS: usize = 6;

/// Store errors
#[derive(Debug)]
pub enum StoreError {
    /// Could not acquire the cross-process lock
    Lock(LockError),
    /// Reading or writing the store file failed
    Io(io::Error),
    /// Store file is not valid JSON in any known shape
    Parse(serde_json::Error),
    /// Store file was written by a newer version
    UnsupportedVersion(u32),
    /// Token data violates the record invariant
    InvalidRecord(&'static str),
    /// Token encryption failed
    Encryption(EncryptError),
}

impl std::fmt::Display for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StoreError::Lock(e) => write!(f, "{}", e),
            StoreError::Io(e) => write!(f, "Credential store I/O error: {}", e),
            StoreError::Parse(e) => write!(f, "Credential store file is corrupt: {}", e),
            StoreError::UnsupportedVersion(v) => {
                write!(f, "Unsupported credential store version {}", v)
            }
            StoreError::InvalidRecord(reason) => write!(f, "Invalid token record: {}", reason),
            StoreError::Encryption(e) => write!(f, "{}", e),
        }
    }
}

impl std::error::Error for StoreError {}

impl From<LockError> for StoreError {
    fn from(e: LockError) -> Self {
        StoreError::Lock(e)
    }
}

impl From<io::Error> for StoreError {
    fn from(e: io::Error) -> Self {
        StoreError::Io(e)
    }
}

impl From<EncryptError> for StoreError {
    fn from(e: EncryptError) -> Self {
        StoreError::Encryption(e)
    }
}

/// Persisted document.
///
/// ```json
/// { "version": 2, "tokens": { "<subject>": { "accessToken": {"iv", "authTag", "data"}, ... } } }
/// ```
#[derive(Debug, Default, Serialize, Deserialize)]
struct StoreFile {
    version: u32,
    #[serde(default)]
    tokens: BTreeMap<String, StoredRecord>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StoredRecord {
    access_token: Envelope,
    refresh_token: Envelope,
    expires_at: DateTime<Utc>,
    refresh_expires_at: DateTime<Utc>,
    scopes: String,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

/// Pre-encryption record shape. Timestamps may be RFC 3339 or epoch millis.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct LegacyRecord {
    access_token: String,
    refresh_token: String,
    expires_at: LegacyInstant,
    #[serde(default)]
    refresh_expires_at: Option<LegacyInstant>,
    #[serde(default, alias = "scope")]
    scopes: Option<String>,
    #[serde(default)]
    created_at: Option<LegacyInstant>,
    #[serde(default)]
    updated_at: Option<LegacyInstant>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum LegacyInstant {
    Rfc3339(DateTime<Utc>),
    Millis(i64),
}

impl LegacyInstant {
    fn to_utc(&self) -> Option<DateTime<Utc>> {
        match self {
            LegacyInstant::Rfc3339(dt) => Some(*dt),
            LegacyInstant::Millis(ms) => Utc.timestamp_millis_opt(*ms).single(),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum RecordShape {
    Current(StoredRecord),
    Legacy(LegacyRecord),
}

#[derive(Debug, Deserialize)]
struct RawStoreFile {
    #[serde(default)]
    version: Option<u32>,
    #[serde(default)]
    tokens: BTreeMap<String, RecordShape>,
}

/// Encrypted per-subject token store backed by one JSON file.
///
/// # Concurrency
/// Any number of `CredentialStore` values (in this or other processes) may
/// point at the same file, provided they share the lock path.
pub struct CredentialStore {
    path: PathBuf,
    lock: FileLock,
    encryption_key: EncryptionKey,
    retention: Duration,
}

impl CredentialStore {
    /// Creates a store handle, creating the parent directory owner-only.
    ///
    /// # Arguments
    /// * `path` - Store file path
    /// * `lock` - Lock shared by everyone writing this file
    /// * `encryption_key` - Validated master key
    /// * `retention` - How long a record with an expired refresh grant is kept
    ///   after its last update
    pub fn new(
        path: impl Into<PathBuf>,
        lock: FileLock,
        encryption_key: EncryptionKey,
        retention: Duration,
    ) -> Result<Self, StoreError> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            ensure_private_dir(parent)?;
        }

        Ok(Self {
            path,
            lock,
            encryption_key,
            retention,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Acquires the lock and loads (and if needed migrates) the file.
    pub async fn begin(&self) -> Result<StoreTransaction<'_>, StoreError> {
        let guard = self.lock.acquire().await?;
        let file = self.load_migrated()?;
        Ok(StoreTransaction {
            store: self,
            file,
            _guard: guard,
        })
    }

    /// Encrypts and stores the token pair for `subject`.
    pub async fn save(&self, subject: &str, data: &TokenData) -> Result<(), StoreError> {
        self.begin().await?.save(subject, data)
    }

    /// Returns the decrypted record, or `None` if absent or undecryptable.
    pub async fn get(&self, subject: &str) -> Result<Option<TokenRecord>, StoreError> {
        Ok(self.begin().await?.get(subject))
    }

    /// Removes the record. Returns whether anything was removed.
    pub async fn revoke(&self, subject: &str) -> Result<bool, StoreError> {
        self.begin().await?.revoke(subject)
    }

    /// Removes records whose refresh grant expired and that are older than the retention window.
    pub async fn prune(&self) -> Result<usize, StoreError> {
        self.begin().await?.prune()
    }

    /// Lists non-secret metadata for every record.
    pub async fn list_safe(&self) -> Result<Vec<SafeRecord>, StoreError> {
        Ok(self.begin().await?.list_safe())
    }

    fn load_migrated(&self) -> Result<StoreFile, StoreError> {
        let raw = match fs::read_to_string(&self.path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(empty_file()),
            Err(e) => return Err(StoreError::Io(e)),
        };
        if raw.trim().is_empty() {
            return Ok(empty_file());
        }

        let parsed: RawStoreFile = serde_json::from_str(&raw).map_err(|e| {
            error!(path = %self.path.display(), error = %e, "Credential store file is corrupt");
            StoreError::Parse(e)
        })?;

        if let Some(version) = parsed.version {
            if version > STORE_VERSION {
                return Err(StoreError::UnsupportedVersion(version));
            }
        }

        let mut migrated = 0usize;
        let mut tokens = BTreeMap::new();
        for (subject, shape) in parsed.tokens {
            let record = match shape {
                RecordShape::Current(record) => record,
                RecordShape::Legacy(legacy) => {
                    migrated += 1;
                    self.migrate_legacy(legacy)?
                }
            };
            tokens.insert(subject, record);
        }

        let file = StoreFile {
            version: STORE_VERSION,
            tokens,
        };

        if migrated > 0 || parsed.version != Some(STORE_VERSION) {
            info!(
                path = %self.path.display(),
                migrated,
                "Rewriting credential store in encrypted format"
            );
            self.persist(&file)?;
        }

        Ok(file)
    }

    fn migrate_legacy(&self, legacy: LegacyRecord) -> Result<StoredRecord, StoreError> {
        let now = Utc::now();
        let updated_at = legacy
            .updated_at
            .as_ref()
            .and_then(LegacyInstant::to_utc)
            .unwrap_or(now);
        let created_at = legacy
            .created_at
            .as_ref()
            .and_then(LegacyInstant::to_utc)
            .unwrap_or(updated_at);
        let expires_at = legacy.expires_at.to_utc().unwrap_or(now);
        let refresh_expires_at = legacy
            .refresh_expires_at
            .as_ref()
            .and_then(LegacyInstant::to_utc)
            .unwrap_or_else(|| updated_at + Duration::days(LEGACY_REFRESH_LIFETIME_DAYS));

        Ok(StoredRecord {
            access_token: encryption::encrypt(&legacy.access_token, &self.encryption_key)?,
            refresh_token: encryption::encrypt(&legacy.refresh_token, &self.encryption_key)?,
            expires_at,
            refresh_expires_at,
            scopes: legacy.scopes.unwrap_or_default(),
            created_at,
            updated_at,
        })
    }

    fn persist(&self, file: &StoreFile) -> Result<(), StoreError> {
        let json = serde_json::to_vec_pretty(file).map_err(StoreError::Parse)?;
        atomic_write(&self.path, &json)?;
        Ok(())
    }

    fn decrypt_record(&self, subject: &str, stored: &StoredRecord) -> Option<TokenRecord> {
        let access_token = encryption::decrypt(&stored.access_token, &self.encryption_key);
        let refresh_token = encryption::decrypt(&stored.refresh_token, &self.encryption_key);

        match (access_token, refresh_token) {
            (Some(access_token), Some(refresh_token)) => Some(TokenRecord {
                subject: subject.to_string(),
                access_token,
                refresh_token,
                expires_at: stored.expires_at,
                refresh_expires_at: stored.refresh_expires_at,
                scopes: stored.scopes.clone(),
                created_at: stored.created_at,
                updated_at: stored.updated_at,
            }),
            _ => {
                warn!(
                    subject = %subject,
                    "Stored credential could not be decrypted, treating as absent"
                );
                None
            }
        }
    }

    fn is_prunable(&self, record: &StoredRecord, now: DateTime<Utc>) -> bool {
        record.refresh_expires_at <= now && record.updated_at < now - self.retention
    }
}

fn empty_file() -> StoreFile {
    StoreFile {
        version: STORE_VERSION,
        tokens: BTreeMap::new(),
    }
}

/// Locked, loaded view of the store. The lock is released on drop.
///
/// Mutations are persisted immediately, so a transaction may be dropped at any
/// point without losing completed writes.
pub struct StoreTransaction<'a> {
    store: &'a CredentialStore,
    file: StoreFile,
    _guard: LockGuard,
}

impl StoreTransaction<'_> {
    pub fn get(&self, subject: &str) -> Option<TokenRecord> {
        let stored = self.file.tokens.get(subject)?;
        self.store.decrypt_record(subject, stored)
    }

    /// Encrypts both tokens, keeps the original `created_at`, prunes, then persists.
    pub fn save(&mut self, subject: &str, data: &TokenData) -> Result<(), StoreError> {
        if subject.is_empty() {
            return Err(StoreError::InvalidRecord("subject is empty"));
        }
        if data.access_token.is_empty() {
            return Err(StoreError::InvalidRecord("access token is missing"));
        }
        if data.refresh_token.is_empty() {
            return Err(StoreError::InvalidRecord("refresh token is missing"));
        }

        let key = &self.store.encryption_key;
        let access_token = encryption::encrypt(&data.access_token, key)?;
        let refresh_token = encryption::encrypt(&data.refresh_token, key)?;

        let now = Utc::now();
        let created_at = self
            .file
            .tokens
            .get(subject)
            .map(|existing| existing.created_at)
            .unwrap_or(now);

        self.file.tokens.insert(
            subject.to_string(),
            StoredRecord {
                access_token,
                refresh_token,
                expires_at: data.expires_at,
                refresh_expires_at: data.refresh_expires_at,
                scopes: data.scopes.clone(),
                created_at,
                updated_at: now,
            },
        );

        let pruned = self.prune_in_memory(now);
        if pruned > 0 {
            info!(pruned, "Pruned stale credential records");
        }

        self.store.persist(&self.file)?;
        debug!(subject = %subject, "Credential record saved");
        Ok(())
    }

    pub fn revoke(&mut self, subject: &str) -> Result<bool, StoreError> {
        if self.file.tokens.remove(subject).is_none() {
            return Ok(false);
        }
        self.store.persist(&self.file)?;
        info!(subject = %subject, "Credential record revoked");
        Ok(true)
    }

    pub fn prune(&mut self) -> Result<usize, StoreError> {
        let pruned = self.prune_in_memory(Utc::now());
        if pruned > 0 {
            self.store.persist(&self.file)?;
        }
        Ok(pruned)
    }

    pub fn list_safe(&self) -> Vec<SafeRecord> {
        let key = &self.store.encryption_key;
        self.file
            .tokens
            .iter()
            .map(|(subject, stored)| {
                let access_token = encryption::decrypt(&stored.access_token, key);
                SafeRecord {
                    subject: subject.clone(),
                    scopes: stored.scopes.clone(),
                    created_at: stored.created_at,
                    updated_at: stored.updated_at,
                    expires_at: stored.expires_at,
                    refresh_expires_at: stored.refresh_expires_at,
                    access_token_preview: access_token.as_deref().map(redact),
                    access_token_length: access_token.as_ref().map(|t| t.len()),
                }
            })
            .collect()
    }

    fn prune_in_memory(&mut self, now: DateTime<Utc>) -> usize {
        let before = self.file.tokens.len();
        let store = self.store;
        self.file
            .tokens
            .retain(|_, record| !store.is_prunable(record, now));
        before - self.file.tokens.len()
    }
}

fn redact(token: &str) -> String {
    let prefix: String = token.chars().take(PREVIEW_CHARS).collect();
    format!("{}...", prefix)
}

/// Background task to periodically prune stale records
pub async fn run_prune_loop(store: Arc<CredentialStore>, interval_seconds: u64) {
    let mut interval = tokio::time::interval(tokio::time::Duration::from_secs(interval_seconds));

    loop {
        interval.tick().await;
        match store.prune().await {
            Ok(0) => debug!("Credential prune found nothing to remove"),
            Ok(pruned) => info!(pruned, "Pruned stale credential records"),
            Err(e) => error!(error = %e, "Credential prune failed"),
        }
    }
}

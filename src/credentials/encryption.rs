//! AES-256-GCM encryption for credential tokens.
//!
//! Each token is encrypted separately with a unique nonce. The master key must be
//! 32 bytes (256 bits) and is provided from an environment variable, either hex or
//! base64 encoded.

use aes_gcm::{
    aead::{Aead, AeadCore, KeyInit, OsRng},
    Aes256Gcm, Nonce,
};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use serde::{Deserialize, Serialize};
use tracing::warn;

/// Size of the encryption key in bytes (256 bits)
const KEY_SIZE: usize = 32;

/// Size of the nonce in bytes (96 bits, standard for GCM)
const NONCE_SIZE: usize = 12;

/// Size of the GCM authentication tag in bytes
const TAG_SIZE: usize = 16;

/// Ciphertext envelope as persisted in the store file.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Envelope {
    /// Base64 nonce
    pub iv: String,
    /// Base64 GCM tag
    pub auth_tag: String,
    /// Base64 ciphertext (without the tag)
    pub data: String,
}

/// Validated 32-byte master key.
#[derive(Clone)]
pub struct EncryptionKey([u8; KEY_SIZE]);

impl std::fmt::Debug for EncryptionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("EncryptionKey(<redacted>)")
    }
}

/// Key material errors. These are startup configuration failures.
#[derive(Debug, PartialEq, Clone)]
pub enum KeyError {
    /// Neither valid hex nor valid base64
    Malformed,
    /// Decoded to the wrong number of bytes
    WrongLength(usize),
}

impl std::fmt::Display for KeyError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            KeyError::Malformed => write!(f, "Encryption key is neither hex nor base64"),
            KeyError::WrongLength(n) => write!(
                f,
                "Encryption key must be {} bytes (256 bits), got {} bytes",
                KEY_SIZE, n
            ),
        }
    }
}

impl std::error::Error for KeyError {}

impl EncryptionKey {
    /// Parses a hex (64 chars) or base64 encoded key.
    pub fn parse(encoded: &str) -> Result<Self, KeyError> {
        let encoded = encoded.trim();
        let is_hex = !encoded.is_empty()
            && encoded.len() % 2 == 0
            && encoded.chars().all(|c| c.is_ascii_hexdigit());

        let bytes = if is_hex {
            hex::decode(encoded).map_err(|_| KeyError::Malformed)?
        } else {
            BASE64.decode(encoded).map_err(|_| KeyError::Malformed)?
        };

        let key: [u8; KEY_SIZE] = bytes
            .as_slice()
            .try_into()
            .map_err(|_| KeyError::WrongLength(bytes.len()))?;

        Ok(Self(key))
    }

    pub fn from_bytes(bytes: [u8; KEY_SIZE]) -> Self {
        Self(bytes)
    }

    fn cipher(&self) -> Aes256Gcm {
        Aes256Gcm::new(aes_gcm::Key::<Aes256Gcm>::from_slice(&self.0))
    }
}

/// Encryption failure (only possible for absurdly large plaintexts).
#[derive(Debug, PartialEq, Clone)]
pub struct EncryptError;

impl std::fmt::Display for EncryptError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Encryption failed")
    }
}

impl std::error::Error for EncryptError {}

/// Encrypts plaintext using AES-256-GCM with a random nonce.
///
/// # Security
/// - Uses a cryptographically secure random nonce (never reuse)
/// - Authenticated encryption (tampering detected)
pub fn encrypt(plaintext: &str, key: &EncryptionKey) -> Result<Envelope, EncryptError> {
    let nonce = Aes256Gcm::generate_nonce(&mut OsRng);

    let mut sealed = key
        .cipher()
        .encrypt(&nonce, plaintext.as_bytes())
        .map_err(|_| EncryptError)?;

    // aes-gcm appends the tag to the ciphertext
    let tag = sealed.split_off(sealed.len() - TAG_SIZE);

    Ok(Envelope {
        iv: BASE64.encode(nonce),
        auth_tag: BASE64.encode(tag),
        data: BASE64.encode(sealed),
    })
}

/// Decrypts an envelope.
///
/// Never fails loudly: a tampered envelope, a wrong key or malformed base64 all
/// log a warning and yield `None`, which callers treat as "no usable credential".
pub fn decrypt(envelope: &Envelope, key: &EncryptionKey) -> Option<String> {
    match try_decrypt(envelope, key) {
        Ok(plaintext) => Some(plaintext),
        Err(reason) => {
            warn!(reason, "Credential decryption failed");
            None
        }
    }
}

fn try_decrypt(envelope: &Envelope, key: &EncryptionKey) -> Result<String, &'static str> {
    let nonce_bytes = BASE64.decode(&envelope.iv).map_err(|_| "malformed iv")?;
    if nonce_bytes.len() != NONCE_SIZE {
        return Err("invalid nonce size");
    }
    let tag = BASE64
        .decode(&envelope.auth_tag)
        .map_err(|_| "malformed auth tag")?;
    if tag.len() != TAG_SIZE {
        return Err("invalid auth tag size");
    }
    let mut sealed = BASE64
        .decode(&envelope.data)
        .map_err(|_| "malformed ciphertext")?;
    sealed.extend_from_slice(&tag);

    let plaintext = key
        .cipher()
        .decrypt(Nonce::from_slice(&nonce_bytes), sealed.as_ref())
        .map_err(|_| "authentication failed (wrong key or corrupted data)")?;

    String::from_utf8(plaintext).map_err(|_| "plaintext is not valid UTF-8")
}

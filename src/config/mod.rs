use crate::auth::session::{validate_secret, SessionError};
use crate::credentials::{EncryptionKey, KeyError};
use crate::provider::ProviderConfig;
use reqwest::Url;
use serde::Deserialize;
use std::path::{Component, Path, PathBuf};
use std::time::Duration;

/// Tunables. Loaded from the TOML file named by `BRIDGE_CONFIG`, every key defaulted.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Settings {
    #[serde(default)]
    pub handshake: HandshakeSettings,
    #[serde(default)]
    pub session: SessionSettings,
    #[serde(default)]
    pub storage: StorageSettings,
    #[serde(default)]
    pub provider: ProviderSettings,
    #[serde(default)]
    pub rate_limit: RateLimitSettings,
    #[serde(default)]
    pub server: ServerSettings,
}

/// CSRF state and one-time code lifetimes
#[derive(Debug, Clone, Deserialize)]
pub struct HandshakeSettings {
    #[serde(default = "default_state_ttl")]
    pub state_ttl_seconds: u64,
    #[serde(default = "default_code_ttl")]
    pub code_ttl_seconds: u64,
}

fn default_state_ttl() -> u64 {
    600
}

fn default_code_ttl() -> u64 {
    300
}

impl Default for HandshakeSettings {
    fn default() -> Self {
        Self {
            state_ttl_seconds: default_state_ttl(),
            code_ttl_seconds: default_code_ttl(),
        }
    }
}

/// Backend-issued session tokens
#[derive(Debug, Clone, Deserialize)]
pub struct SessionSettings {
    #[serde(default = "default_issuer")]
    pub issuer: String,
    #[serde(default = "default_access_ttl")]
    pub access_ttl_seconds: u64,
    #[serde(default = "default_refresh_ttl")]
    pub refresh_ttl_seconds: u64,
    /// Issue a new refresh token on every refresh_token grant
    #[serde(default)]
    pub rotate_refresh_tokens: bool,
}

fn default_issuer() -> String {
    "tokenbridge".to_string()
}

fn default_access_ttl() -> u64 {
    3600
}

fn default_refresh_ttl() -> u64 {
    30 * 24 * 3600
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            issuer: default_issuer(),
            access_ttl_seconds: default_access_ttl(),
            refresh_ttl_seconds: default_refresh_ttl(),
            rotate_refresh_tokens: false,
        }
    }
}

/// Credential file locking and pruning
#[derive(Debug, Clone, Deserialize)]
pub struct StorageSettings {
    #[serde(default = "default_lock_timeout")]
    pub lock_timeout_ms: u64,
    #[serde(default = "default_lock_retry")]
    pub lock_retry_ms: u64,
    #[serde(default = "default_retention_days")]
    pub prune_retention_days: u32,
    #[serde(default = "default_prune_interval")]
    pub prune_interval_seconds: u64,
}

fn default_lock_timeout() -> u64 {
    10_000
}

fn default_lock_retry() -> u64 {
    50
}

fn default_retention_days() -> u32 {
    30
}

fn default_prune_interval() -> u64 {
    6 * 3600
}

impl Default for StorageSettings {
    fn default() -> Self {
        Self {
            lock_timeout_ms: default_lock_timeout(),
            lock_retry_ms: default_lock_retry(),
            prune_retention_days: default_retention_days(),
            prune_interval_seconds: default_prune_interval(),
        }
    }
}

/// Outbound provider calls
#[derive(Debug, Clone, Deserialize)]
pub struct ProviderSettings {
    #[serde(default = "default_provider_timeout")]
    pub timeout_seconds: u64,
}

fn default_provider_timeout() -> u64 {
    10
}

impl Default for ProviderSettings {
    fn default() -> Self {
        Self {
            timeout_seconds: default_provider_timeout(),
        }
    }
}

/// Per-client request ceilings on the auth and resource surfaces
#[derive(Debug, Clone, Deserialize)]
pub struct RateLimitSettings {
    #[serde(default = "default_rate_limit_enabled")]
    pub enabled: bool,
    /// Requests per window on `/auth/*` and `/oauth/*`
    #[serde(default = "default_auth_limit")]
    pub auth_limit: u64,
    /// Requests per window on `/api/*`
    #[serde(default = "default_api_limit")]
    pub api_limit: u64,
    #[serde(default = "default_window")]
    pub window_seconds: u64,
}

fn default_rate_limit_enabled() -> bool {
    true
}

fn default_auth_limit() -> u64 {
    30
}

fn default_api_limit() -> u64 {
    120
}

fn default_window() -> u64 {
    60
}

impl Default for RateLimitSettings {
    fn default() -> Self {
        Self {
            enabled: default_rate_limit_enabled(),
            auth_limit: default_auth_limit(),
            api_limit: default_api_limit(),
            window_seconds: default_window(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerSettings {
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,
}

fn default_bind_addr() -> String {
    "0.0.0.0:3000".to_string()
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            bind_addr: default_bind_addr(),
        }
    }
}

/// Startup configuration errors. All of them abort the process.
#[derive(Debug)]
pub enum ConfigError {
    Missing(&'static str),
    InvalidKey(KeyError),
    WeakSecret(SessionError),
    InvalidBaseUrl(String),
    InvalidValue { key: &'static str, value: String },
    /// Store or lock file would be reachable through the public directory
    InsidePublicDir { path: PathBuf, public_dir: PathBuf },
    File { path: String, message: String },
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Missing(key) => write!(f, "{} is required", key),
            ConfigError::InvalidKey(e) => write!(f, "BRIDGE_ENCRYPTION_KEY: {}", e),
            ConfigError::WeakSecret(e) => write!(f, "BRIDGE_SIGNING_SECRET: {}", e),
            ConfigError::InvalidBaseUrl(url) => {
                write!(f, "BRIDGE_BASE_URL is not an absolute http(s) URL: {}", url)
            }
            ConfigError::InvalidValue { key, value } => {
                write!(f, "Invalid value for {}: {:?}", key, value)
            }
            ConfigError::InsidePublicDir { path, public_dir } => write!(
                f,
                "{} must not live inside the public directory {}",
                path.display(),
                public_dir.display()
            ),
            ConfigError::File { path, message } => {
                write!(f, "Failed to load config file {}: {}", path, message)
            }
        }
    }
}

impl std::error::Error for ConfigError {}

/// Complete process configuration, built once at startup.
///
/// Not `Debug`: holds the signing secret.
#[derive(Clone)]
pub struct BridgeConfig {
    pub encryption_key: EncryptionKey,
    pub signing_secret: String,
    /// Externally reachable origin of this service, without trailing slash
    pub base_url: String,
    pub provider: ProviderConfig,
    /// The one downstream client id accepted by `/oauth/authorize` and `/oauth/token`
    pub client_id: String,
    /// When set, `/oauth/token` requires it
    pub client_secret: Option<String>,
    /// Extra hosts downstream redirect URIs may point at (the base URL host is always allowed)
    pub allowed_redirect_hosts: Vec<String>,
    pub cors_origins: Vec<String>,
    pub store_path: PathBuf,
    pub lock_path: PathBuf,
    pub public_dir: PathBuf,
    pub settings: Settings,
}

impl BridgeConfig {
    /// Build from the process environment
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from an arbitrary key lookup (environment-shaped keys).
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());
        let require = |key: &'static str| get(key).ok_or(ConfigError::Missing(key));

        let mut settings = match get("BRIDGE_CONFIG") {
            Some(path) => load_settings(&path)?,
            None => Settings::default(),
        };
        apply_overrides(&mut settings, &get)?;

        let encryption_key = EncryptionKey::parse(&require("BRIDGE_ENCRYPTION_KEY")?)
            .map_err(ConfigError::InvalidKey)?;

        let signing_secret = require("BRIDGE_SIGNING_SECRET")?;
        validate_secret(&signing_secret).map_err(ConfigError::WeakSecret)?;

        let base_url = require("BRIDGE_BASE_URL")?.trim_end_matches('/').to_string();
        let base_host =
            host_of(&base_url).ok_or_else(|| ConfigError::InvalidBaseUrl(base_url.clone()))?;

        let store_path = PathBuf::from(
            get("BRIDGE_STORE_PATH").unwrap_or_else(|| "data/tokens.json".to_string()),
        );
        let lock_path = match get("BRIDGE_LOCK_PATH") {
            Some(path) => PathBuf::from(path),
            None => {
                let mut path = store_path.clone().into_os_string();
                path.push(".lock");
                PathBuf::from(path)
            }
        };
        let public_dir =
            PathBuf::from(get("BRIDGE_PUBLIC_DIR").unwrap_or_else(|| "public".to_string()));

        let cwd = std::env::current_dir().unwrap_or_default();
        for path in [&store_path, &lock_path] {
            if is_within(path, &public_dir, &cwd) {
                return Err(ConfigError::InsidePublicDir {
                    path: path.clone(),
                    public_dir: public_dir.clone(),
                });
            }
        }

        let provider = ProviderConfig {
            authorize_url: require("BRIDGE_PROVIDER_AUTHORIZE_URL")?,
            token_url: require("BRIDGE_PROVIDER_TOKEN_URL")?,
            api_base_url: require("BRIDGE_PROVIDER_API_URL")?.trim_end_matches('/').to_string(),
            scope: get("BRIDGE_PROVIDER_SCOPE").unwrap_or_default(),
            client_id: require("BRIDGE_PROVIDER_CLIENT_ID")?,
            client_secret: require("BRIDGE_PROVIDER_CLIENT_SECRET")?,
            timeout: Duration::from_secs(settings.provider.timeout_seconds),
        };

        let mut allowed_redirect_hosts = vec![base_host];
        for host in split_list(get("BRIDGE_ALLOWED_REDIRECT_HOSTS")) {
            let host = host.to_ascii_lowercase();
            if !allowed_redirect_hosts.contains(&host) {
                allowed_redirect_hosts.push(host);
            }
        }

        Ok(Self {
            encryption_key,
            signing_secret,
            base_url,
            provider,
            client_id: require("BRIDGE_CLIENT_ID")?,
            client_secret: get("BRIDGE_CLIENT_SECRET"),
            allowed_redirect_hosts,
            cors_origins: split_list(get("BRIDGE_CORS_ORIGINS")),
            store_path,
            lock_path,
            public_dir,
            settings,
        })
    }

    /// Redirect URI registered with the provider
    pub fn provider_callback_url(&self) -> String {
        format!("{}/auth/provider/callback", self.base_url)
    }

    pub fn is_allowed_redirect_host(&self, host: &str) -> bool {
        let host = host.to_ascii_lowercase();
        self.allowed_redirect_hosts.iter().any(|h| *h == host)
    }

    pub fn prune_retention(&self) -> chrono::Duration {
        chrono::Duration::days(i64::from(self.settings.storage.prune_retention_days))
    }
}

/// Load settings from TOML file
pub fn load_settings(path: &str) -> Result<Settings, ConfigError> {
    let contents = std::fs::read_to_string(path).map_err(|e| ConfigError::File {
        path: path.to_string(),
        message: e.to_string(),
    })?;
    toml::from_str(&contents).map_err(|e| ConfigError::File {
        path: path.to_string(),
        message: e.to_string(),
    })
}

fn apply_overrides<G>(settings: &mut Settings, get: &G) -> Result<(), ConfigError>
where
    G: Fn(&str) -> Option<String>,
{
    if let Some(v) = parse_var::<u32, _>(get, "BRIDGE_PRUNE_RETENTION_DAYS")? {
        settings.storage.prune_retention_days = v;
    }
    if let Some(v) = parse_var::<bool, _>(get, "BRIDGE_RATE_LIMIT_ENABLED")? {
        settings.rate_limit.enabled = v;
    }
    if let Some(v) = parse_var::<u64, _>(get, "BRIDGE_AUTH_RATE_LIMIT")? {
        settings.rate_limit.auth_limit = v;
    }
    if let Some(v) = parse_var::<u64, _>(get, "BRIDGE_API_RATE_LIMIT")? {
        settings.rate_limit.api_limit = v;
    }
    if let Some(v) = parse_var::<u64, _>(get, "BRIDGE_RATE_LIMIT_WINDOW_SECS")? {
        settings.rate_limit.window_seconds = v;
    }
    if let Some(v) = get("BRIDGE_BIND_ADDR") {
        settings.server.bind_addr = v;
    }
    Ok(())
}

fn parse_var<T, G>(get: &G, key: &'static str) -> Result<Option<T>, ConfigError>
where
    T: std::str::FromStr,
    G: Fn(&str) -> Option<String>,
{
    match get(key) {
        None => Ok(None),
        Some(raw) => raw
            .parse::<T>()
            .map(Some)
            .map_err(|_| ConfigError::InvalidValue { key, value: raw }),
    }
}

fn split_list(raw: Option<String>) -> Vec<String> {
    raw.map(|raw| {
        raw.split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect()
    })
    .unwrap_or_default()
}

fn host_of(url: &str) -> Option<String> {
    let parsed = Url::parse(url).ok()?;
    if parsed.scheme() != "http" && parsed.scheme() != "https" {
        return None;
    }
    parsed.host_str().map(str::to_ascii_lowercase)
}

/// Lexical containment check; symlinks are not resolved.
fn is_within(path: &Path, dir: &Path, cwd: &Path) -> bool {
    normalize(&cwd.join(path)).starts_with(normalize(&cwd.join(dir)))
}

fn normalize(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                out.pop();
            }
            other => out.push(other.as_os_str()),
        }
    }
    out
}

//! Single-use, TTL-bounded in-memory entries.
//!
//! Backs the OAuth CSRF states and the one-time authorization codes. Entries live
//! in process memory only, so a handshake must complete against the instance that
//! started it.

use dashmap::DashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tracing::debug;

struct Entry<T> {
    data: T,
    expires_at: Instant,
}

/// TTL map with atomic get-and-delete. Clones share the same entries.
pub struct EphemeralRegistry<T> {
    name: &'static str,
    entries: Arc<DashMap<String, Entry<T>>>,
    ttl: Duration,
}

impl<T> Clone for EphemeralRegistry<T> {
    fn clone(&self) -> Self {
        Self {
            name: self.name,
            entries: Arc::clone(&self.entries),
            ttl: self.ttl,
        }
    }
}

impl<T: Send + Sync + 'static> EphemeralRegistry<T> {
    /// Create a registry whose entries expire `ttl` after being saved
    pub fn new(name: &'static str, ttl: Duration) -> Self {
        Self {
            name,
            entries: Arc::new(DashMap::new()),
            ttl,
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Store `data` under `key`, replacing any previous entry
    pub fn save(&self, key: impl Into<String>, data: T) {
        self.entries.insert(
            key.into(),
            Entry {
                data,
                expires_at: Instant::now() + self.ttl,
            },
        );
    }

    /// Remove and return the entry.
    ///
    /// Missing and expired entries both yield `None`; an expired entry is deleted
    /// by the same call, so no key can be consumed twice.
    pub fn consume(&self, key: &str) -> Option<T> {
        let (_, entry) = self.entries.remove(key)?;
        if Instant::now() >= entry.expires_at {
            debug!(registry = self.name, "Consumed entry had expired");
            return None;
        }
        Some(entry.data)
    }

    /// Drop every expired entry. Returns the number removed.
    pub fn purge_expired(&self) -> usize {
        let before = self.entries.len();
        let now = Instant::now();
        self.entries.retain(|_, entry| now < entry.expires_at);
        before.saturating_sub(self.entries.len())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Spawn the background sweep at roughly half the TTL
    pub fn spawn_sweeper(&self) -> JoinHandle<()> {
        let interval = (self.ttl / 2).max(Duration::from_millis(100));
        tokio::spawn(run_sweeper(self.clone(), interval))
    }
}

/// Background task to periodically purge expired entries
pub async fn run_sweeper<T: Send + Sync + 'static>(
    registry: EphemeralRegistry<T>,
    every: Duration,
) {
    let mut interval = tokio::time::interval(every);

    loop {
        interval.tick().await;
        let purged = registry.purge_expired();
        debug!(
            registry = registry.name,
            purged,
            remaining = registry.len(),
            "Ephemeral registry sweep complete"
        );
    }
}

//! Short-lived cache of decrypted signing secrets.
//!
//! Entries are keyed by wallet and by a digest of the whole sealed record
//! they were decrypted from (ciphertext, nonce, tag and KDF version). Any
//! change to the stored record misses the cache and goes back through
//! authenticated decryption, even if an invalidation is missed.

use std::{
    collections::HashMap,
    sync::{Mutex, MutexGuard},
    time::{Duration, Instant},
};

use splitvault_types::{WalletId, constants};

use crate::key_vault::SigningSecret;

pub trait SecretCache: Send + Sync {
    fn get(&self, wallet: WalletId, record_digest: &[u8; 32]) -> Option<SigningSecret>;
    fn put(&self, wallet: WalletId, record_digest: [u8; 32], secret: SigningSecret);
    fn invalidate(&self, wallet: WalletId);
}

struct Entry {
    record_digest: [u8; 32],
    secret: SigningSecret,
    expires_at: Instant,
}

/// In-memory TTL cache. A zero TTL disables caching.
pub struct TtlSecretCache {
    ttl: Duration,
    entries: Mutex<HashMap<WalletId, Entry>>,
}

impl TtlSecretCache {
    /// TTLs above the configured maximum are clamped.
    #[must_use]
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl: ttl.min(Duration::from_millis(constants::MAX_SECRET_CACHE_TTL_MS)),
            entries: Mutex::new(HashMap::new()),
        }
    }

    #[must_use]
    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop expired entries.
    pub fn purge_expired(&self) {
        let now = Instant::now();
        self.lock().retain(|_, entry| entry.expires_at > now);
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<WalletId, Entry>> {
        // Entries are plain data; a panic mid-insert cannot leave them torn.
        self.entries
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

impl SecretCache for TtlSecretCache {
    fn get(&self, wallet: WalletId, record_digest: &[u8; 32]) -> Option<SigningSecret> {
        let mut entries = self.lock();
        let fresh = entries.get(&wallet).map(|entry| {
            entry.expires_at > Instant::now() && entry.record_digest == *record_digest
        })?;
        if !fresh {
            entries.remove(&wallet);
            tracing::debug!(%wallet, "Secret cache miss (stale)");
            return None;
        }
        tracing::debug!(%wallet, "Secret cache hit");
        entries.get(&wallet).map(|entry| entry.secret.clone())
    }

    fn put(&self, wallet: WalletId, record_digest: [u8; 32], secret: SigningSecret) {
        if self.ttl.is_zero() {
            return;
        }
        self.lock().insert(
            wallet,
            Entry {
                record_digest,
                secret,
                expires_at: Instant::now() + self.ttl,
            },
        );
    }

    fn invalidate(&self, wallet: WalletId) {
        if self.lock().remove(&wallet).is_some() {
            tracing::debug!(%wallet, "Secret cache entry invalidated");
        }
    }
}

//! Persistent wallet store contract and in-memory implementation.
//!
//! The only concurrency primitive the engine relies on is
//! [`WalletStore::compare_and_swap`]: a write that succeeds only if the
//! stored version still equals the version the caller read. [`mutate`]
//! wraps it into a read-modify-write loop.

use std::{collections::HashMap, sync::Arc};

use async_trait::async_trait;
use splitvault_types::{
    Participant, Result, SettlementMetadata, SplitvaultError, Wallet, WalletId, constants,
};
use tokio::sync::Mutex;

/// A wallet together with its settlement metadata, as persisted.
#[derive(Debug, Clone)]
pub struct WalletRecord {
    pub wallet: Wallet,
    pub settlement: SettlementMetadata,
    /// Incremented by every successful write.
    pub version: u64,
}

#[async_trait]
pub trait WalletStore: Send + Sync {
    /// Insert a new record at version 1.
    ///
    /// # Errors
    /// [`SplitvaultError::DuplicateWallet`] if the id is taken.
    async fn create(&self, wallet: Wallet, settlement: SettlementMetadata)
    -> Result<WalletRecord>;

    /// # Errors
    /// [`SplitvaultError::WalletNotFound`] for an unknown id.
    async fn load(&self, id: WalletId) -> Result<WalletRecord>;

    /// Write `record` if the stored version equals `record.version`.
    ///
    /// Returns the stored record (at `record.version + 1`) on success and
    /// `None` when another writer got there first.
    async fn compare_and_swap(&self, record: WalletRecord) -> Result<Option<WalletRecord>>;

    async fn list(&self) -> Result<Vec<WalletId>>;
}

/// Read-modify-write `id` through `apply`, re-reading on version conflict.
///
/// `apply` may run several times and must be a pure function of the record
/// it is given. An `Err` from `apply` aborts without writing.
///
/// # Errors
/// Errors from `apply` or the store, or
/// [`SplitvaultError::StoreContention`] after
/// [`constants::MAX_STORE_CAS_RETRIES`] lost races.
pub async fn mutate<T, F>(
    store: &dyn WalletStore,
    id: WalletId,
    mut apply: F,
) -> Result<(WalletRecord, T)>
where
    F: FnMut(&mut WalletRecord) -> Result<T> + Send,
    T: Send,
{
    for attempt in 0..constants::MAX_STORE_CAS_RETRIES {
        let mut record = store.load(id).await?;
        let out = apply(&mut record)?;
        if let Some(stored) = store.compare_and_swap(record).await? {
            return Ok((stored, out));
        }
        tracing::debug!(wallet = %id, attempt, "Wallet version conflict, re-reading");
    }
    tracing::warn!(
        wallet = %id,
        retries = constants::MAX_STORE_CAS_RETRIES,
        "Gave up on contended wallet"
    );
    Err(SplitvaultError::StoreContention {
        wallet: id,
        retries: constants::MAX_STORE_CAS_RETRIES,
    })
}

/// Partial update: swap the participant list and leave everything else.
///
/// # Errors
/// As [`mutate`].
pub async fn replace_participants(
    store: &dyn WalletStore,
    id: WalletId,
    participants: Vec<Participant>,
) -> Result<WalletRecord> {
    let now = chrono::Utc::now();
    let (record, ()) = mutate(store, id, |record| {
        record.wallet.participants.clone_from(&participants);
        record.wallet.touch(now);
        Ok(())
    })
    .await?;
    Ok(record)
}

#[must_use]
pub fn memory() -> Arc<dyn WalletStore> {
    Arc::new(MemoryWalletStore::default())
}

/// Process-local store. Suitable for tests and the simulator.
#[derive(Default)]
pub struct MemoryWalletStore {
    inner: Mutex<HashMap<WalletId, WalletRecord>>,
}

#[async_trait]
impl WalletStore for MemoryWalletStore {
    async fn create(
        &self,
        wallet: Wallet,
        settlement: SettlementMetadata,
    ) -> Result<WalletRecord> {
        let mut inner = self.inner.lock().await;
        if inner.contains_key(&wallet.id) {
            return Err(SplitvaultError::DuplicateWallet(wallet.id));
        }
        let record = WalletRecord {
            wallet,
            settlement,
            version: 1,
        };
        inner.insert(record.wallet.id, record.clone());
        Ok(record)
    }

    async fn load(&self, id: WalletId) -> Result<WalletRecord> {
        let inner = self.inner.lock().await;
        inner
            .get(&id)
            .cloned()
            .ok_or(SplitvaultError::WalletNotFound(id))
    }

    async fn compare_and_swap(&self, mut record: WalletRecord) -> Result<Option<WalletRecord>> {
        let mut inner = self.inner.lock().await;
        let Some(current) = inner.get_mut(&record.wallet.id) else {
            return Err(SplitvaultError::WalletNotFound(record.wallet.id));
        };
        if current.version != record.version {
            return Ok(None);
        }
        record.version += 1;
        *current = record.clone();
        Ok(Some(record))
    }

    async fn list(&self) -> Result<Vec<WalletId>> {
        let inner = self.inner.lock().await;
        Ok(inner.keys().copied().collect())
    }
}

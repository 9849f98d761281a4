//! Dispatch idempotency guard: at most one completed transfer per wallet.
//!
//! Once a wallet's funds have moved, asking to move them again returns
//! [`SplitvaultError::AlreadyProcessed`] carrying the original reference
//! and never reaches the transfer client.
//!
//! The guard is a bounded cache with oldest-first eviction so memory stays
//! predictable in long-running processes. The persisted `paymentStatus`
//! remains the durable record; the guard covers the window between a
//! successful transfer and its status write.

use std::collections::{HashMap, VecDeque};

use splitvault_types::{Result, SettlementReference, SplitvaultError, WalletId};

pub struct DispatchGuard {
    /// Wallets with a completed dispatch, and the transfer reference.
    completed: HashMap<WalletId, SettlementReference>,
    /// Insertion order for eviction (front = oldest).
    order: VecDeque<WalletId>,
    max_size: usize,
}

impl DispatchGuard {
    /// A `max_size` of zero is treated as one.
    #[must_use]
    pub fn new(max_size: usize) -> Self {
        let max_size = max_size.max(1);
        Self {
            completed: HashMap::with_capacity(max_size.min(1024)),
            order: VecDeque::with_capacity(max_size.min(1024)),
            max_size,
        }
    }

    /// # Errors
    /// [`SplitvaultError::AlreadyProcessed`] if `wallet` already dispatched.
    pub fn check(&self, wallet: WalletId) -> Result<()> {
        match self.completed.get(&wallet) {
            Some(reference) => Err(SplitvaultError::AlreadyProcessed {
                wallet,
                reference: Some(reference.clone()),
            }),
            None => Ok(()),
        }
    }

    /// Record a completed dispatch.
    ///
    /// # Errors
    /// [`SplitvaultError::AlreadyProcessed`] if `wallet` already dispatched.
    pub fn record(&mut self, wallet: WalletId, reference: SettlementReference) -> Result<()> {
        self.check(wallet)?;

        if self.completed.len() >= self.max_size {
            if let Some(oldest) = self.order.pop_front() {
                self.completed.remove(&oldest);
            }
        }

        self.completed.insert(wallet, reference);
        self.order.push_back(wallet);
        Ok(())
    }

    #[must_use]
    pub fn reference_for(&self, wallet: &WalletId) -> Option<&SettlementReference> {
        self.completed.get(wallet)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.completed.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.completed.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reference(n: u8) -> SettlementReference {
        SettlementReference::new(format!("sig-{n}"))
    }

    #[test]
    fn first_dispatch_ok() {
        let mut guard = DispatchGuard::new(100);
        let wallet = WalletId::new();
        guard.check(wallet).unwrap();
        guard.record(wallet, reference(1)).unwrap();
        assert_eq!(guard.reference_for(&wallet), Some(&reference(1)));
        assert_eq!(guard.len(), 1);
    }

    #[test]
    fn second_dispatch_returns_original_reference() {
        let mut guard = DispatchGuard::new(100);
        let wallet = WalletId::new();
        guard.record(wallet, reference(1)).unwrap();

        let err = guard.record(wallet, reference(2)).unwrap_err();
        assert!(
            matches!(
                &err,
                SplitvaultError::AlreadyProcessed { wallet: w, reference: Some(r) }
                    if *w == wallet && *r == reference(1)
            ),
            "Expected AlreadyProcessed, got: {err:?}"
        );
        assert!(err.is_idempotent_success());
    }

    #[test]
    fn evicts_oldest() {
        let mut guard = DispatchGuard::new(2);
        let (w1, w2, w3) = (WalletId::new(), WalletId::new(), WalletId::new());
        guard.record(w1, reference(1)).unwrap();
        guard.record(w2, reference(2)).unwrap();
        guard.record(w3, reference(3)).unwrap();

        assert_eq!(guard.len(), 2);
        assert!(guard.check(w1).is_ok(), "w1 should have been evicted");
        assert!(guard.check(w2).is_err());
        assert!(guard.check(w3).is_err());
    }

    #[test]
    fn zero_size_behaves_as_one() {
        let mut guard = DispatchGuard::new(0);
        assert!(guard.is_empty());
        guard.record(WalletId::new(), reference(1)).unwrap();
        guard.record(WalletId::new(), reference(2)).unwrap();
        assert_eq!(guard.len(), 1);
    }
}

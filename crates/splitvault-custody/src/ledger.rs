//! Participant Ledger: membership, shares and contributions for one wallet.
//!
//! Every operation is a single [`mutate`] against the store, so concurrent
//! contributions to the same wallet serialize on the record version and
//! never lose an update.

use std::sync::Arc;

use chrono::Utc;
use rust_decimal::Decimal;
use splitvault_types::{
    Participant, ParticipantStatus, Result, SplitPolicy, SplitvaultError, UserId, Wallet,
    WalletId, WalletStatus, validate_threshold,
};

use crate::store::{WalletRecord, WalletStore, mutate};

/// Result of recording a contribution.
#[derive(Debug, Clone)]
pub struct ContributionReceipt {
    /// `false` when the reference had already been recorded.
    pub applied: bool,
    pub participant_total: Decimal,
    pub wallet_total: Decimal,
    pub version: u64,
}

pub struct ParticipantLedger {
    store: Arc<dyn WalletStore>,
}

impl ParticipantLedger {
    #[must_use]
    pub fn new(store: Arc<dyn WalletStore>) -> Self {
        Self { store }
    }

    /// Insert or merge a participant.
    ///
    /// An existing row keeps its `joined_at` and contributions. New rows
    /// are only accepted while the wallet is `Active`; equal shares are
    /// recomputed when membership changes.
    ///
    /// # Errors
    /// [`SplitvaultError::WalletLocked`] when adding to a locked wallet.
    pub async fn upsert_participant(
        &self,
        wallet_id: WalletId,
        participant: Participant,
    ) -> Result<Participant> {
        let now = Utc::now();
        let user = participant.user_id;
        let (_, stored) = mutate(self.store.as_ref(), wallet_id, |record| {
            let wallet = &mut record.wallet;
            if let Some(existing) = wallet.participant_mut(&user) {
                existing.merge_from(participant.clone());
            } else {
                wallet.ensure_membership_open("add participant")?;
                let mut fresh = participant.clone();
                fresh.amount_contributed = Decimal::ZERO;
                fresh.history.clear();
                if fresh.joined_at.is_none() {
                    fresh.joined_at = Some(now);
                }
                wallet.participants.push(fresh);
            }
            rebalance(wallet)?;
            wallet.touch(now);
            wallet
                .participant(&user)
                .cloned()
                .ok_or(SplitvaultError::ParticipantNotFound {
                    wallet: wallet_id,
                    user,
                })
        })
        .await?;
        tracing::debug!(wallet = %wallet_id, %user, status = %stored.status, "Participant upserted");
        Ok(stored)
    }

    /// Remove a participant who has not contributed.
    ///
    /// # Errors
    /// - [`SplitvaultError::WalletLocked`] unless the wallet is `Active`
    /// - [`SplitvaultError::ParticipantNotFound`]
    /// - [`SplitvaultError::InvalidParticipant`] if they already contributed
    pub async fn remove_participant(&self, wallet_id: WalletId, user: UserId) -> Result<()> {
        let now = Utc::now();
        mutate(self.store.as_ref(), wallet_id, |record| {
            let wallet = &mut record.wallet;
            wallet.ensure_membership_open("remove participant")?;
            let idx = wallet
                .participants
                .iter()
                .position(|p| p.user_id == user)
                .ok_or(SplitvaultError::ParticipantNotFound {
                    wallet: wallet_id,
                    user,
                })?;
            if wallet.participants[idx].amount_contributed > Decimal::ZERO {
                return Err(SplitvaultError::InvalidParticipant {
                    reason: format!("participant {user} has contributions and cannot be removed"),
                });
            }
            wallet.participants.remove(idx);
            rebalance(wallet)?;
            wallet.touch(now);
            Ok(())
        })
        .await?;
        tracing::debug!(wallet = %wallet_id, %user, "Participant removed");
        Ok(())
    }

    /// Add `amount` to a participant's contributions and the wallet balance.
    ///
    /// A repeated `reference` is a no-op reported with `applied = false`.
    ///
    /// # Errors
    /// - [`SplitvaultError::InvalidAmount`] for a non-positive amount or a
    ///   balance overflow
    /// - [`SplitvaultError::WalletLocked`] on a closed wallet
    /// - [`SplitvaultError::ParticipantNotFound`]
    pub async fn record_contribution(
        &self,
        wallet_id: WalletId,
        user: UserId,
        amount: Decimal,
        reference: &str,
    ) -> Result<ContributionReceipt> {
        let now = Utc::now();
        let (record, (applied, participant_total)) =
            mutate(self.store.as_ref(), wallet_id, |record| {
                let wallet = &mut record.wallet;
                ensure_accepting_funds(wallet)?;
                let participant = wallet.participant_mut(&user).ok_or(
                    SplitvaultError::ParticipantNotFound {
                        wallet: wallet_id,
                        user,
                    },
                )?;
                let applied = participant.apply_contribution(amount, reference, now)?;
                let total = participant.amount_contributed;
                if applied {
                    credit(wallet, amount)?;
                    wallet.touch(now);
                }
                Ok((applied, total))
            })
            .await?;

        Ok(receipt(wallet_id, user, reference, applied, participant_total, &record))
    }

    /// Raise a participant's contributed total to an observed absolute value.
    ///
    /// # Errors
    /// [`SplitvaultError::ContributionDecrease`] if `new_total` is below the
    /// recorded total. Otherwise as [`Self::record_contribution`].
    pub async fn sync_contribution_total(
        &self,
        wallet_id: WalletId,
        user: UserId,
        new_total: Decimal,
        reference: &str,
    ) -> Result<ContributionReceipt> {
        let now = Utc::now();
        let (record, (delta, participant_total)) =
            mutate(self.store.as_ref(), wallet_id, |record| {
                let wallet = &mut record.wallet;
                ensure_accepting_funds(wallet)?;
                let participant = wallet.participant_mut(&user).ok_or(
                    SplitvaultError::ParticipantNotFound {
                        wallet: wallet_id,
                        user,
                    },
                )?;
                let delta = participant.raise_contribution_total(new_total, reference, now)?;
                let total = participant.amount_contributed;
                if !delta.is_zero() {
                    credit(wallet, delta)?;
                    wallet.touch(now);
                }
                Ok((delta, total))
            })
            .await
            .inspect_err(|error| {
                if matches!(error, SplitvaultError::ContributionDecrease { .. }) {
                    tracing::warn!(wallet = %wallet_id, %user, %error, "Rejected contribution decrease");
                }
            })?;

        let applied = !delta.is_zero();
        Ok(receipt(wallet_id, user, reference, applied, participant_total, &record))
    }

    pub async fn total_contributed(&self, wallet_id: WalletId) -> Result<Decimal> {
        Ok(self.store.load(wallet_id).await?.wallet.total_contributed())
    }

    pub async fn total_owed(&self, wallet_id: WalletId) -> Result<Decimal> {
        Ok(self.store.load(wallet_id).await?.wallet.total_owed)
    }

    /// `total_contributed >= total_owed * fraction`.
    ///
    /// # Errors
    /// [`SplitvaultError::InvalidThreshold`] unless `0 < fraction <= 1`.
    pub async fn threshold_met(&self, wallet_id: WalletId, fraction: Decimal) -> Result<bool> {
        validate_threshold(fraction)?;
        Ok(self.store.load(wallet_id).await?.wallet.threshold_met(fraction))
    }

    /// Switch to manual shares and assign them.
    ///
    /// Participants not named keep their current share.
    ///
    /// # Errors
    /// - [`SplitvaultError::WalletLocked`] unless the wallet is `Active`
    /// - [`SplitvaultError::InvalidAmount`] for a negative share
    /// - [`SplitvaultError::ParticipantNotFound`]
    pub async fn set_manual_shares(
        &self,
        wallet_id: WalletId,
        shares: &[(UserId, Decimal)],
    ) -> Result<()> {
        let now = Utc::now();
        mutate(self.store.as_ref(), wallet_id, |record| {
            let wallet = &mut record.wallet;
            wallet.ensure_membership_open("set manual shares")?;
            for (user, share) in shares {
                if share.is_sign_negative() {
                    return Err(SplitvaultError::InvalidAmount {
                        amount: *share,
                        reason: "share cannot be negative".to_string(),
                    });
                }
                let participant = wallet.participant_mut(user).ok_or(
                    SplitvaultError::ParticipantNotFound {
                        wallet: wallet_id,
                        user: *user,
                    },
                )?;
                participant.share_owed = *share;
            }
            wallet.split_policy = SplitPolicy::Manual;
            wallet.touch(now);
            Ok(())
        })
        .await?;
        tracing::info!(wallet = %wallet_id, count = shares.len(), "Manual shares set");
        Ok(())
    }

    /// Return to equal split and recompute.
    ///
    /// # Errors
    /// [`SplitvaultError::WalletLocked`] unless the wallet is `Active`.
    pub async fn clear_manual_shares(&self, wallet_id: WalletId) -> Result<()> {
        let now = Utc::now();
        mutate(self.store.as_ref(), wallet_id, |record| {
            let wallet = &mut record.wallet;
            wallet.ensure_membership_open("clear manual shares")?;
            wallet.split_policy = SplitPolicy::Equal;
            rebalance(wallet)?;
            wallet.touch(now);
            Ok(())
        })
        .await?;
        Ok(())
    }
}

/// Freeze membership when settlement starts.
///
/// Sets the wallet `Locked` and moves accepted participants to `Locked`.
/// Participants who already paid or declined keep their status.
pub fn lock_membership(wallet: &mut Wallet) {
    wallet.status = WalletStatus::Locked;
    for p in &mut wallet.participants {
        if p.status == ParticipantStatus::Accepted {
            p.status = ParticipantStatus::Locked;
        }
    }
}

fn receipt(
    wallet_id: WalletId,
    user: UserId,
    reference: &str,
    applied: bool,
    participant_total: Decimal,
    record: &WalletRecord,
) -> ContributionReceipt {
    let wallet_total = record.wallet.total_contributed();
    if applied {
        tracing::info!(
            wallet = %wallet_id,
            %user,
            reference,
            %participant_total,
            %wallet_total,
            "Contribution recorded"
        );
    } else {
        tracing::debug!(wallet = %wallet_id, %user, reference, "Duplicate contribution ignored");
    }
    ContributionReceipt {
        applied,
        participant_total,
        wallet_total,
        version: record.version,
    }
}

fn credit(wallet: &mut Wallet, amount: Decimal) -> Result<()> {
    wallet.balance =
        wallet
            .balance
            .checked_add(amount)
            .ok_or_else(|| SplitvaultError::InvalidAmount {
                amount,
                reason: "wallet balance overflows".to_string(),
            })?;
    Ok(())
}

fn rebalance(wallet: &mut Wallet) -> Result<()> {
    if wallet.membership_open() {
        wallet.recompute_equal_shares();
        wallet.check_share_invariant()?;
    }
    Ok(())
}

fn ensure_accepting_funds(wallet: &Wallet) -> Result<()> {
    if wallet.status == WalletStatus::Closed {
        return Err(SplitvaultError::WalletLocked {
            wallet: wallet.id,
            status: wallet.status,
            reason: "cannot record contribution".to_string(),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use splitvault_types::SettlementMetadata;

    use super::*;
    use crate::store::memory;

    async fn ledger_with(total: i64, members: usize) -> (ParticipantLedger, Arc<dyn WalletStore>, WalletId) {
        let store = memory();
        let wallet = Wallet::dummy(Decimal::new(total, 0), members);
        let id = wallet.id;
        store
            .create(wallet, SettlementMetadata::new(None, None, Decimal::ONE).unwrap())
            .await
            .unwrap();
        (ParticipantLedger::new(store.clone()), store, id)
    }

    async fn member(store: &Arc<dyn WalletStore>, id: WalletId, idx: usize) -> UserId {
        store.load(id).await.unwrap().wallet.participants[idx].user_id
    }

    #[tokio::test]
    async fn upsert_adds_and_rebalances() {
        let (ledger, store, id) = ledger_with(90, 2).await;
        let newcomer = Participant::new(UserId::new(), "Carol").with_status(ParticipantStatus::Accepted);
        ledger.upsert_participant(id, newcomer).await.unwrap();

        let wallet = store.load(id).await.unwrap().wallet;
        assert_eq!(wallet.participants.len(), 3);
        assert!(wallet.participants.iter().all(|p| p.share_owed == Decimal::new(30, 0)));
    }

    #[tokio::test]
    async fn upsert_is_idempotent_and_keeps_joined_at() {
        let (ledger, store, id) = ledger_with(100, 2).await;
        let user = member(&store, id, 0).await;
        let original = store.load(id).await.unwrap().wallet.participants[0].joined_at;

        let mut again = Participant::new(user, "Renamed");
        again.status = ParticipantStatus::Accepted;
        again.joined_at = Some(Utc::now() + chrono::Duration::days(1));
        let stored = ledger.upsert_participant(id, again).await.unwrap();

        assert_eq!(stored.display_name, "Renamed");
        assert_eq!(stored.joined_at, original);
        assert_eq!(store.load(id).await.unwrap().wallet.participants.len(), 2);
    }

    #[tokio::test]
    async fn new_participant_after_lock_rejected() {
        let (ledger, store, id) = ledger_with(100, 2).await;
        mutate(store.as_ref(), id, |record| {
            lock_membership(&mut record.wallet);
            Ok(())
        })
        .await
        .unwrap();

        let err = ledger
            .upsert_participant(id, Participant::new(UserId::new(), "Late"))
            .await
            .unwrap_err();
        assert!(matches!(err, SplitvaultError::WalletLocked { .. }));
    }

    #[tokio::test]
    async fn contributions_accumulate_and_dedupe() {
        let (ledger, store, id) = ledger_with(100, 3).await;
        let a = member(&store, id, 0).await;
        let b = member(&store, id, 1).await;

        ledger.record_contribution(id, a, Decimal::new(40, 0), "tx-1").await.unwrap();
        let dup = ledger.record_contribution(id, a, Decimal::new(40, 0), "tx-1").await.unwrap();
        assert!(!dup.applied);
        let r = ledger.record_contribution(id, b, Decimal::new(35, 0), "tx-2").await.unwrap();
        assert!(r.applied);
        assert_eq!(r.wallet_total, Decimal::new(75, 0));

        assert_eq!(ledger.total_contributed(id).await.unwrap(), Decimal::new(75, 0));
        assert_eq!(ledger.total_owed(id).await.unwrap(), Decimal::new(100, 0));
        assert!(!ledger.threshold_met(id, Decimal::ONE).await.unwrap());
        assert!(ledger.threshold_met(id, Decimal::new(7, 1)).await.unwrap());
        assert_eq!(store.load(id).await.unwrap().wallet.balance, Decimal::new(75, 0));
    }

    #[tokio::test]
    async fn sync_total_rejects_decrease() {
        let (ledger, store, id) = ledger_with(100, 2).await;
        let a = member(&store, id, 0).await;
        let r = ledger
            .sync_contribution_total(id, a, Decimal::new(20, 0), "obs-1")
            .await
            .unwrap();
        assert_eq!(r.participant_total, Decimal::new(20, 0));

        let err = ledger
            .sync_contribution_total(id, a, Decimal::new(10, 0), "obs-2")
            .await
            .unwrap_err();
        assert!(matches!(err, SplitvaultError::ContributionDecrease { .. }));
        assert_eq!(ledger.total_contributed(id).await.unwrap(), Decimal::new(20, 0));
    }

    #[tokio::test]
    async fn unknown_participant_and_bad_amount() {
        let (ledger, store, id) = ledger_with(100, 1).await;
        let err = ledger
            .record_contribution(id, UserId::new(), Decimal::ONE, "tx")
            .await
            .unwrap_err();
        assert!(matches!(err, SplitvaultError::ParticipantNotFound { .. }));

        let a = member(&store, id, 0).await;
        let err = ledger
            .record_contribution(id, a, Decimal::new(-5, 0), "tx")
            .await
            .unwrap_err();
        assert!(err.is_validation());
    }

    #[tokio::test]
    async fn balance_overflow_rejected_without_partial_write() {
        let (ledger, store, id) = ledger_with(100, 2).await;
        let a = member(&store, id, 0).await;
        let b = member(&store, id, 1).await;
        ledger.record_contribution(id, a, Decimal::MAX, "tx-max").await.unwrap();

        let err = ledger
            .record_contribution(id, b, Decimal::ONE, "tx-one")
            .await
            .unwrap_err();
        assert!(matches!(err, SplitvaultError::InvalidAmount { .. }));
        let err = ledger
            .sync_contribution_total(id, b, Decimal::ONE, "obs-one")
            .await
            .unwrap_err();
        assert!(matches!(err, SplitvaultError::InvalidAmount { .. }));

        let wallet = store.load(id).await.unwrap().wallet;
        assert_eq!(wallet.balance, Decimal::MAX);
        assert!(wallet.participant(&b).unwrap().amount_contributed.is_zero());
    }

    #[tokio::test]
    async fn remove_rebalances_but_keeps_contributors() {
        let (ledger, store, id) = ledger_with(90, 3).await;
        let a = member(&store, id, 0).await;
        let c = member(&store, id, 2).await;
        ledger.record_contribution(id, a, Decimal::ONE, "tx").await.unwrap();

        let err = ledger.remove_participant(id, a).await.unwrap_err();
        assert!(matches!(err, SplitvaultError::InvalidParticipant { .. }));

        ledger.remove_participant(id, c).await.unwrap();
        let wallet = store.load(id).await.unwrap().wallet;
        assert_eq!(wallet.participants.len(), 2);
        assert_eq!(wallet.total_shares(), Decimal::new(90, 0));
    }

    #[tokio::test]
    async fn manual_shares_survive_membership_change() {
        let (ledger, store, id) = ledger_with(100, 2).await;
        let a = member(&store, id, 0).await;
        let b = member(&store, id, 1).await;
        ledger
            .set_manual_shares(id, &[(a, Decimal::new(70, 0)), (b, Decimal::new(10, 0))])
            .await
            .unwrap();
        ledger
            .upsert_participant(id, Participant::new(UserId::new(), "Dan"))
            .await
            .unwrap();
        let wallet = store.load(id).await.unwrap().wallet;
        assert_eq!(wallet.participant(&a).unwrap().share_owed, Decimal::new(70, 0));

        ledger.clear_manual_shares(id).await.unwrap();
        let wallet = store.load(id).await.unwrap().wallet;
        assert_eq!(wallet.split_policy, SplitPolicy::Equal);
        wallet.check_share_invariant().unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_contributions_are_not_lost() {
        let (ledger, store, id) = ledger_with(100, 4).await;
        let ledger = Arc::new(ledger);
        let mut users = Vec::new();
        for idx in 0..4 {
            users.push(member(&store, id, idx).await);
        }

        let handles: Vec<_> = users
            .into_iter()
            .enumerate()
            .map(|(idx, user)| {
                let ledger = ledger.clone();
                tokio::spawn(async move {
                    ledger
                        .record_contribution(id, user, Decimal::new(25, 0), &format!("tx-{idx}"))
                        .await
                })
            })
            .collect();
        for handle in handles {
            handle.await.unwrap().unwrap();
        }
        assert_eq!(ledger.total_contributed(id).await.unwrap(), Decimal::new(100, 0));
        assert!(ledger.threshold_met(id, Decimal::ONE).await.unwrap());
    }
}

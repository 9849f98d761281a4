//! Settlement Engine: decides when a wallet settles and makes sure its
//! funds move at most once.
//!
//! ## Flow (per contribution event)
//!
//! 1. `paid`/`refunded` → [`SettlementOutcome::AlreadyPaid`];
//!    `processing` → [`SettlementOutcome::InFlight`]. No dispatch. A
//!    `processing` wallet whose transfer already completed is recorded as
//!    `paid` instead.
//! 2. A closed wallet is rejected. Resolve the payment mode. A malformed
//!    payee is a validation error.
//! 3. Threshold not met → [`SettlementOutcome::ThresholdNotMet`].
//! 4. Self-settling: `pending → processing → paid` in one write. The funds
//!    stay in the custodial account; the dispatcher is never called.
//! 5. Forwarding: claim the wallet with one versioned write
//!    (`pending|failed → processing`, fresh idempotency key, attempt
//!    counted). Losing that race aborts quietly.
//! 6. Risk gate. Deny → `failed`, no dispatch.
//! 7. Unlock the secret and dispatch. Success → `paid`; failure → `failed`
//!    with the attempt still counted. The `paid` write is retried with
//!    backoff; if it still fails the wallet stays `processing` until the
//!    next evaluation records the completed transfer.
//! 8. On `paid`, deliver the webhook in a background task.
//!
//! Slow I/O (risk backend, transfer client, webhook) always runs between
//! store writes, never inside one.

use std::{sync::Arc, time::Duration};

use chrono::Utc;
use rust_decimal::Decimal;
use splitvault_custody::{
    ContributionReceipt, ParticipantLedger, RiskAssessor, RiskContext, SecretProvider,
    WalletRecord, WalletStore, lock_membership, store::mutate,
};
use splitvault_types::{
    Address, DeliveryStatus, IdempotencyKey, NotificationPayload, PaymentMode, PaymentStatus,
    Result, SettlementConfig, SettlementReference, SplitvaultError, UserId, WalletId,
    WalletStatus, constants, has_malformed_payee, resolve_mode,
};

use crate::{
    dispatcher::{DispatchRequest, FundDispatch, WalletHandle},
    notifier::SettlementNotifier,
};

/// Result of evaluating a wallet for settlement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SettlementOutcome {
    /// This call moved the wallet to `paid`.
    Settled {
        mode: PaymentMode,
        reference: SettlementReference,
        amount: Decimal,
    },
    /// Already settled earlier; nothing was dispatched.
    AlreadyPaid {
        reference: Option<SettlementReference>,
    },
    /// Another attempt holds the wallet.
    InFlight,
    /// This call lost the claim race to a concurrent attempt.
    Superseded,
    ThresholdNotMet {
        contributed: Decimal,
        required: Decimal,
    },
    /// The risk gate denied; the wallet is `failed`.
    Denied { score: u8, reason: String },
    /// The transfer failed; the wallet is `failed`.
    DispatchFailed { attempts_remaining: u32 },
    /// `failed` with no attempts left.
    RetriesExhausted { attempts: u32 },
}

impl SettlementOutcome {
    #[must_use]
    pub fn is_paid(&self) -> bool {
        matches!(self, Self::Settled { .. } | Self::AlreadyPaid { .. })
    }
}

struct Claim {
    key: IdempotencyKey,
    record: WalletRecord,
}

pub struct SettlementEngine {
    store: Arc<dyn WalletStore>,
    ledger: ParticipantLedger,
    secrets: Arc<dyn SecretProvider>,
    risk: Arc<dyn RiskAssessor>,
    dispatcher: Arc<dyn FundDispatch>,
    notifier: Option<Arc<dyn SettlementNotifier>>,
    config: SettlementConfig,
}

impl SettlementEngine {
    #[must_use]
    pub fn new(
        store: Arc<dyn WalletStore>,
        secrets: Arc<dyn SecretProvider>,
        risk: Arc<dyn RiskAssessor>,
        dispatcher: Arc<dyn FundDispatch>,
        config: SettlementConfig,
    ) -> Self {
        Self {
            ledger: ParticipantLedger::new(store.clone()),
            store,
            secrets,
            risk,
            dispatcher,
            notifier: None,
            config,
        }
    }

    #[must_use]
    pub fn with_notifier(mut self, notifier: Arc<dyn SettlementNotifier>) -> Self {
        self.notifier = Some(notifier);
        self
    }

    #[must_use]
    pub fn ledger(&self) -> &ParticipantLedger {
        &self.ledger
    }

    /// Record a contribution, then evaluate the wallet.
    pub async fn record_contribution_and_settle(
        &self,
        wallet_id: WalletId,
        user: UserId,
        amount: Decimal,
        reference: &str,
    ) -> Result<(ContributionReceipt, SettlementOutcome)> {
        let receipt = self
            .ledger
            .record_contribution(wallet_id, user, amount, reference)
            .await?;
        let outcome = self.on_contribution(wallet_id).await?;
        Ok((receipt, outcome))
    }

    /// Evaluate a wallet after a contribution.
    ///
    /// Informational results (threshold not met, already paid, lost race,
    /// no attempts left) come back as outcomes, not errors.
    ///
    /// # Errors
    /// Validation, access and store errors.
    pub async fn on_contribution(&self, wallet_id: WalletId) -> Result<SettlementOutcome> {
        let record = self.store.load(wallet_id).await?;
        match record.settlement.payment_status {
            PaymentStatus::Paid | PaymentStatus::Refunded => {
                tracing::debug!(wallet = %wallet_id, "Already settled, skipping");
                return Ok(SettlementOutcome::AlreadyPaid {
                    reference: record.settlement.settlement_reference,
                });
            }
            PaymentStatus::Processing => {
                if let Some(outcome) = self.recover_completed(&record).await {
                    return outcome;
                }
                tracing::debug!(wallet = %wallet_id, "Settlement in flight, skipping");
                return Ok(SettlementOutcome::InFlight);
            }
            PaymentStatus::Pending | PaymentStatus::Failed => {}
        }
        ensure_open(&record)?;
        ensure_well_formed_payee(&record)?;

        let fraction = record.settlement.threshold_fraction;
        if !record.wallet.threshold_met(fraction) {
            return Ok(SettlementOutcome::ThresholdNotMet {
                contributed: record.wallet.total_contributed(),
                required: record.wallet.required_for(fraction),
            });
        }

        let result = match resolve_mode(&record.settlement) {
            PaymentMode::SelfSettling => self.settle_in_place(wallet_id).await,
            PaymentMode::Forwarding => self.forward(wallet_id).await,
        };
        result.or_else(informational)
    }

    /// Explicit retry of a `failed` wallet.
    ///
    /// A `processing` wallet whose transfer already completed is recorded
    /// as `paid` without a second dispatch.
    ///
    /// # Errors
    /// Unlike [`Self::on_contribution`], informational results surface as
    /// errors: [`SplitvaultError::AlreadyProcessed`],
    /// [`SplitvaultError::ThresholdNotMet`],
    /// [`SplitvaultError::RetriesExhausted`],
    /// [`SplitvaultError::ConcurrentModification`],
    /// [`SplitvaultError::WalletLocked`] for a closed wallet.
    pub async fn retry_settlement(&self, wallet_id: WalletId) -> Result<SettlementOutcome> {
        let record = self.store.load(wallet_id).await?;
        if record.settlement.payment_status == PaymentStatus::Processing {
            if let Some(outcome) = self.recover_completed(&record).await {
                return outcome;
            }
        }
        ensure_open(&record)?;
        ensure_well_formed_payee(&record)?;
        match resolve_mode(&record.settlement) {
            PaymentMode::SelfSettling => self.settle_in_place(wallet_id).await,
            PaymentMode::Forwarding => self.forward(wallet_id).await,
        }
    }

    /// Administrative reversal: `paid → refunded` only.
    ///
    /// # Errors
    /// [`SplitvaultError::ConcurrentModification`] from any other status.
    pub async fn mark_refunded(&self, wallet_id: WalletId) -> Result<WalletRecord> {
        let now = Utc::now();
        let (record, ()) = mutate(self.store.as_ref(), wallet_id, |record| {
            record.settlement.transition(PaymentStatus::Refunded)?;
            record.wallet.touch(now);
            Ok(())
        })
        .await?;
        tracing::info!(wallet = %wallet_id, "Settlement marked refunded");
        Ok(record)
    }

    /// Rebuild the notification from stored records and deliver it now.
    ///
    /// # Errors
    /// [`SplitvaultError::Configuration`] without a notifier;
    /// [`SplitvaultError::Internal`] if the wallet never settled.
    pub async fn redeliver_notification(&self, wallet_id: WalletId) -> Result<DeliveryStatus> {
        let Some(notifier) = self.notifier.clone() else {
            return Err(SplitvaultError::Configuration(
                "no webhook endpoint configured".to_string(),
            ));
        };
        deliver_and_record(self.store.clone(), notifier, wallet_id).await
    }

    async fn settle_in_place(&self, wallet_id: WalletId) -> Result<SettlementOutcome> {
        let now = Utc::now();
        let mut reads = 0u32;
        let result = mutate(self.store.as_ref(), wallet_id, |record| {
            reads += 1;
            precheck_claim(record)?;
            let amount = record.wallet.balance;
            let reference = SettlementReference::new(format!("self-settled:{}", wallet_id.0));
            record.settlement.transition(PaymentStatus::Processing)?;
            record.settlement.complete(Some(reference.clone()), amount, now)?;
            lock_membership(&mut record.wallet);
            record.wallet.status = WalletStatus::Settled;
            record.wallet.touch(now);
            Ok((reference, amount))
        })
        .await;
        let (reference, amount) = match result {
            Ok((_, settled)) => settled,
            Err(error) if lost_race(&error, reads) => return Ok(SettlementOutcome::Superseded),
            Err(error) => return Err(error),
        };

        tracing::info!(
            wallet = %wallet_id,
            amount = %amount,
            "Self-settling wallet reached threshold, funds retained"
        );
        self.schedule_notification(wallet_id);
        Ok(SettlementOutcome::Settled {
            mode: PaymentMode::SelfSettling,
            reference,
            amount,
        })
    }

    async fn forward(&self, wallet_id: WalletId) -> Result<SettlementOutcome> {
        let Some(Claim { key, record }) = self.claim(wallet_id).await? else {
            return Ok(SettlementOutcome::Superseded);
        };
        let amount = record.wallet.balance;
        tracing::info!(
            wallet = %wallet_id,
            attempt = record.settlement.attempt_count,
            key = key.as_str(),
            %amount,
            "Wallet claimed for dispatch"
        );

        let decision = self
            .risk
            .assess(&RiskContext {
                amount,
                channel: PaymentMode::Forwarding,
                wallet_id,
            })
            .await;
        if !decision.allow {
            let reason = decision
                .reason
                .clone()
                .unwrap_or_else(|| format!("risk score {}", decision.score));
            self.fail(wallet_id, &reason).await?;
            return Ok(SettlementOutcome::Denied {
                score: decision.score,
                reason,
            });
        }

        let secret = match self.secrets.unlock_for_settlement(&record.wallet) {
            Ok(secret) => secret,
            Err(error) => {
                self.fail(wallet_id, &error.to_string()).await?;
                return Err(error);
            }
        };

        let request = DispatchRequest {
            handle: WalletHandle {
                wallet_id,
                address: record.wallet.address.clone(),
                secret,
            },
            payee_address: record.settlement.payee_address.clone().unwrap_or_default(),
            amount,
            currency: record.wallet.currency.clone(),
            external_order_id: record.settlement.external_order_id.clone(),
            bill_reference: record.wallet.bill_reference.clone(),
            idempotency_key: key,
        };

        match self.dispatcher.dispatch(request).await {
            Ok(reference) => self.finalize(wallet_id, reference, amount).await,
            Err(SplitvaultError::AlreadyProcessed {
                reference: Some(reference),
                ..
            }) => {
                tracing::warn!(
                    wallet = %wallet_id,
                    reference = reference.as_str(),
                    "Dispatch already completed, recording original reference"
                );
                self.finalize(wallet_id, reference, amount).await
            }
            Err(error @ SplitvaultError::DispatchFailure { .. }) => {
                let failed = self.fail(wallet_id, &error.to_string()).await?;
                Ok(SettlementOutcome::DispatchFailed {
                    attempts_remaining: failed
                        .settlement
                        .attempts_remaining(self.config.max_attempts),
                })
            }
            Err(error) => {
                self.fail(wallet_id, &error.to_string()).await?;
                Err(error)
            }
        }
    }

    /// `pending|failed → processing` as one versioned write.
    ///
    /// `None` when a concurrent caller claimed the wallet between our read
    /// and our write.
    async fn claim(&self, wallet_id: WalletId) -> Result<Option<Claim>> {
        let now = Utc::now();
        let max_attempts = self.config.max_attempts;
        let mut reads = 0u32;
        let result = mutate(self.store.as_ref(), wallet_id, |record| {
            reads += 1;
            precheck_claim(record)?;
            let key = record.settlement.begin_attempt(wallet_id, max_attempts, now)?;
            lock_membership(&mut record.wallet);
            record.wallet.touch(now);
            Ok(key)
        })
        .await;
        match result {
            Ok((record, key)) => Ok(Some(Claim { key, record })),
            Err(error) if lost_race(&error, reads) => Ok(None),
            Err(error) => Err(error),
        }
    }

    /// Record a `processing` wallet as `paid` when the dispatcher already
    /// holds a completed transfer for it.
    async fn recover_completed(&self, record: &WalletRecord) -> Option<Result<SettlementOutcome>> {
        let wallet_id = record.wallet.id;
        let reference = self.dispatcher.completed_reference(wallet_id)?;
        tracing::warn!(
            wallet = %wallet_id,
            reference = reference.as_str(),
            "Recording completed transfer for wallet left processing"
        );
        Some(self.finalize(wallet_id, reference, record.wallet.balance).await)
    }

    async fn finalize(
        &self,
        wallet_id: WalletId,
        reference: SettlementReference,
        amount: Decimal,
    ) -> Result<SettlementOutcome> {
        let mut attempt = 1;
        let recorded = loop {
            match self.record_paid(wallet_id, &reference, amount).await {
                Ok(recorded) => break recorded,
                Err(error) if attempt < constants::FINALIZE_WRITE_ATTEMPTS && is_retryable(&error) => {
                    let backoff = constants::FINALIZE_RETRY_BACKOFF_MS << (attempt - 1);
                    tracing::warn!(
                        wallet = %wallet_id,
                        reference = reference.as_str(),
                        attempt,
                        %error,
                        "Retrying settlement write"
                    );
                    tokio::time::sleep(Duration::from_millis(backoff)).await;
                    attempt += 1;
                }
                Err(error) => {
                    tracing::error!(
                        wallet = %wallet_id,
                        reference = reference.as_str(),
                        %error,
                        "Funds moved but settlement could not be recorded"
                    );
                    return Err(error);
                }
            }
        };
        if !recorded {
            return Ok(SettlementOutcome::AlreadyPaid {
                reference: Some(reference),
            });
        }
        tracing::info!(wallet = %wallet_id, reference = reference.as_str(), "Settlement paid");
        self.schedule_notification(wallet_id);
        Ok(SettlementOutcome::Settled {
            mode: PaymentMode::Forwarding,
            reference,
            amount,
        })
    }

    /// `processing → paid`.
    ///
    /// `false` when a concurrent caller already recorded the same reference.
    async fn record_paid(
        &self,
        wallet_id: WalletId,
        reference: &SettlementReference,
        amount: Decimal,
    ) -> Result<bool> {
        let now = Utc::now();
        let (_, recorded) = mutate(self.store.as_ref(), wallet_id, |record| {
            if record.settlement.payment_status == PaymentStatus::Paid
                && record.settlement.settlement_reference.as_ref() == Some(reference)
            {
                return Ok(false);
            }
            record
                .settlement
                .complete(Some(reference.clone()), amount, now)?;
            record.wallet.status = WalletStatus::Settled;
            record.wallet.touch(now);
            Ok(true)
        })
        .await?;
        Ok(recorded)
    }

    async fn fail(&self, wallet_id: WalletId, reason: &str) -> Result<WalletRecord> {
        let now = Utc::now();
        let (record, ()) = mutate(self.store.as_ref(), wallet_id, |record| {
            record.settlement.fail(reason)?;
            record.wallet.touch(now);
            Ok(())
        })
        .await?;
        tracing::warn!(
            wallet = %wallet_id,
            attempts = record.settlement.attempt_count,
            "Settlement attempt failed"
        );
        Ok(record)
    }

    fn schedule_notification(&self, wallet_id: WalletId) {
        let Some(notifier) = self.notifier.clone() else {
            return;
        };
        let store = self.store.clone();
        tokio::spawn(async move {
            if let Err(error) = deliver_and_record(store, notifier, wallet_id).await {
                tracing::warn!(wallet = %wallet_id, %error, "Settlement notification not sent");
            }
        });
    }
}

/// Build, deliver and record. Never touches `payment_status`.
async fn deliver_and_record(
    store: Arc<dyn WalletStore>,
    notifier: Arc<dyn SettlementNotifier>,
    wallet_id: WalletId,
) -> Result<DeliveryStatus> {
    let record = store.load(wallet_id).await?;
    let payload = NotificationPayload::from_records(&record.wallet, &record.settlement)?;
    let status = notifier.notify(&payload).await;
    let recorded = status.clone();
    mutate(store.as_ref(), wallet_id, move |record| {
        record.settlement.delivery = recorded.clone();
        Ok(())
    })
    .await?;
    Ok(status)
}

/// Reject before any mutation if the wallet cannot be claimed.
fn precheck_claim(record: &WalletRecord) -> Result<()> {
    let status = record.settlement.payment_status;
    if status.is_settled() {
        return Err(SplitvaultError::AlreadyProcessed {
            wallet: record.wallet.id,
            reference: record.settlement.settlement_reference.clone(),
        });
    }
    ensure_open(record)?;
    if status == PaymentStatus::Processing {
        return Err(SplitvaultError::ConcurrentModification {
            from: status,
            to: PaymentStatus::Processing,
        });
    }
    let fraction = record.settlement.threshold_fraction;
    if !record.wallet.threshold_met(fraction) {
        return Err(SplitvaultError::ThresholdNotMet {
            contributed: record.wallet.total_contributed(),
            required: record.wallet.required_for(fraction),
        });
    }
    Ok(())
}

/// A closed wallet never settles again.
fn ensure_open(record: &WalletRecord) -> Result<()> {
    if record.wallet.status == WalletStatus::Closed {
        return Err(SplitvaultError::WalletLocked {
            wallet: record.wallet.id,
            status: WalletStatus::Closed,
            reason: "wallet is closed".to_string(),
        });
    }
    Ok(())
}

fn ensure_well_formed_payee(record: &WalletRecord) -> Result<()> {
    if has_malformed_payee(&record.settlement) {
        let raw = record.settlement.payee_address.as_deref().unwrap_or_default();
        Address::parse(raw)?;
    }
    Ok(())
}

/// A processing conflict seen only on a re-read means a concurrent caller
/// won the claim.
fn lost_race(error: &SplitvaultError, reads: u32) -> bool {
    let lost = reads > 1
        && matches!(
            error,
            SplitvaultError::ConcurrentModification {
                from: PaymentStatus::Processing,
                ..
            }
        );
    if lost {
        tracing::debug!("Lost settlement claim race");
    }
    lost
}

/// Store failures are worth another write; status conflicts are not.
fn is_retryable(error: &SplitvaultError) -> bool {
    matches!(
        error,
        SplitvaultError::Store(_) | SplitvaultError::StoreContention { .. }
    )
}

fn informational(error: SplitvaultError) -> Result<SettlementOutcome> {
    match error {
        SplitvaultError::AlreadyProcessed { reference, .. } => {
            Ok(SettlementOutcome::AlreadyPaid { reference })
        }
        SplitvaultError::ConcurrentModification {
            from: PaymentStatus::Processing,
            ..
        } => Ok(SettlementOutcome::InFlight),
        SplitvaultError::ThresholdNotMet {
            contributed,
            required,
        } => Ok(SettlementOutcome::ThresholdNotMet {
            contributed,
            required,
        }),
        SplitvaultError::RetriesExhausted { attempts } => {
            tracing::warn!(attempts, "Settlement retries exhausted");
            Ok(SettlementOutcome::RetriesExhausted { attempts })
        }
        other => Err(other),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn conflict_on_first_read_is_in_flight_not_superseded() {
        let conflict = SplitvaultError::ConcurrentModification {
            from: PaymentStatus::Processing,
            to: PaymentStatus::Processing,
        };
        assert!(!lost_race(&conflict, 1));
        assert!(lost_race(&conflict, 2));
        assert_eq!(informational(conflict).unwrap(), SettlementOutcome::InFlight);
    }

    #[test]
    fn closed_wallet_cannot_be_claimed() {
        let mut wallet = splitvault_types::Wallet::dummy(Decimal::new(100, 0), 1);
        wallet.balance = Decimal::new(100, 0);
        wallet.participants[0].amount_contributed = Decimal::new(100, 0);
        wallet.status = WalletStatus::Closed;
        let record = WalletRecord {
            wallet,
            settlement: splitvault_types::SettlementMetadata::new(None, None, Decimal::ONE)
                .unwrap(),
            version: 1,
        };

        let err = precheck_claim(&record).unwrap_err();
        assert!(matches!(
            err,
            SplitvaultError::WalletLocked {
                status: WalletStatus::Closed,
                ..
            }
        ));
        assert!(informational(err).is_err());
    }

    #[test]
    fn only_store_failures_retry_the_paid_write() {
        assert!(is_retryable(&SplitvaultError::Store("io".to_string())));
        assert!(!is_retryable(&SplitvaultError::ConcurrentModification {
            from: PaymentStatus::Failed,
            to: PaymentStatus::Paid,
        }));
    }

    #[test]
    fn informational_errors_become_outcomes() {
        let outcome = informational(SplitvaultError::ThresholdNotMet {
            contributed: Decimal::new(40, 0),
            required: Decimal::new(100, 0),
        })
        .unwrap();
        assert!(matches!(outcome, SettlementOutcome::ThresholdNotMet { .. }));
        assert_eq!(
            informational(SplitvaultError::RetriesExhausted { attempts: 3 }).unwrap(),
            SettlementOutcome::RetriesExhausted { attempts: 3 }
        );
        let paid = informational(SplitvaultError::AlreadyProcessed {
            wallet: WalletId::new(),
            reference: None,
        })
        .unwrap();
        assert!(paid.is_paid());

        let err = informational(SplitvaultError::DispatchFailure {
            reason: "rpc".to_string(),
        })
        .unwrap_err();
        assert!(matches!(err, SplitvaultError::DispatchFailure { .. }));
    }
}

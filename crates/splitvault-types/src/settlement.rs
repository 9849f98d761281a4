//! Settlement metadata and the payment status machine.
//!
//! ## State Machine
//!
//! ```text
//!   ┌─────────┐ claim  ┌────────────┐ dispatch ok ┌──────┐ admin ┌──────────┐
//!   │ PENDING ├───────▶│ PROCESSING ├────────────▶│ PAID ├──────▶│ REFUNDED │
//!   └────┬────┘        └─────┬──────┘             └──────┘       └──────────┘
//!        │                   │ dispatch failed / risk denied
//!        │                   ▼
//!        │             ┌────────┐  retry (attempt_count < max_attempts)
//!        └────────────▶│ FAILED ├──────────────▶ PROCESSING
//!                      └────────┘
//! ```
//!
//! Any other move, including every move back toward PENDING, is rejected
//! with [`SplitvaultError::ConcurrentModification`]. Nothing is clamped.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::{
    Address, IdempotencyKey, SettlementReference, SplitvaultError, WalletId, constants,
};

/// Payment status of a wallet's settlement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentStatus {
    /// Collecting; nothing dispatched.
    Pending,
    /// A dispatch attempt holds the wallet.
    Processing,
    /// Settled. Terminal in the normal flow.
    Paid,
    /// Last attempt failed. Retryable while attempts remain.
    Failed,
    /// Administrative reversal after `Paid`. Terminal.
    Refunded,
}

impl PaymentStatus {
    /// Exhaustive transition table.
    #[must_use]
    pub fn can_transition_to(&self, target: Self) -> bool {
        use PaymentStatus::{Failed, Paid, Pending, Processing, Refunded};
        matches!(
            (self, target),
            (Pending, Processing | Failed)
                | (Processing, Paid | Failed)
                | (Failed, Processing)
                | (Paid, Refunded)
        )
    }

    /// Terminal states never change again (apart from `Paid → Refunded`).
    #[must_use]
    pub fn is_settled(&self) -> bool {
        matches!(self, Self::Paid | Self::Refunded)
    }

    /// A claim (`→ Processing`) may start from here.
    #[must_use]
    pub fn is_claimable(&self) -> bool {
        matches!(self, Self::Pending | Self::Failed)
    }
}

impl std::fmt::Display for PaymentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Processing => "processing",
            Self::Paid => "paid",
            Self::Failed => "failed",
            Self::Refunded => "refunded",
        };
        f.write_str(s)
    }
}

/// Where collected funds end up.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentMode {
    /// Funds stay in the custodial account for the creator.
    SelfSettling,
    /// Funds are sent on to a single external payee.
    Forwarding,
}

impl std::fmt::Display for PaymentMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::SelfSettling => f.write_str("self_settling"),
            Self::Forwarding => f.write_str("forwarding"),
        }
    }
}

/// Outcome of the most recent settlement notification delivery.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum DeliveryStatus {
    NotAttempted,
    Delivered { attempts: u32 },
    Undelivered { attempts: u32, reason: String },
}

/// Settlement bookkeeping for one wallet.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SettlementMetadata {
    pub mode: PaymentMode,
    /// Raw payee address. Required iff `mode == Forwarding`.
    pub payee_address: Option<String>,
    pub external_order_id: Option<String>,
    /// Fraction of `total_owed` that must be contributed, in (0, 1].
    pub threshold_fraction: Decimal,
    pub payment_status: PaymentStatus,
    pub attempt_count: u32,
    pub last_attempt_at: Option<DateTime<Utc>>,
    pub idempotency_key: Option<IdempotencyKey>,
    /// Transfer reference, set when the dispatch succeeds.
    pub settlement_reference: Option<SettlementReference>,
    /// Amount moved (or retained, when self-settling) at settlement.
    pub settled_amount: Option<Decimal>,
    pub settled_at: Option<DateTime<Utc>>,
    /// Internal reason for the last failure. Not shown to end users.
    pub last_failure: Option<String>,
    pub delivery: DeliveryStatus,
}

impl SettlementMetadata {
    /// Build metadata for a new wallet.
    ///
    /// The mode is resolved from `payee_address`.
    ///
    /// # Errors
    /// - [`SplitvaultError::InvalidAddress`] for a non-empty malformed payee
    /// - [`SplitvaultError::InvalidThreshold`] for a fraction outside (0, 1]
    pub fn new(
        payee_address: Option<&str>,
        external_order_id: Option<String>,
        threshold_fraction: Decimal,
    ) -> crate::Result<Self> {
        validate_threshold(threshold_fraction)?;
        let payee = match payee_address.map(str::trim).filter(|s| !s.is_empty()) {
            Some(raw) => Some(Address::parse(raw)?.to_string()),
            None => None,
        };
        let mut meta = Self {
            mode: PaymentMode::SelfSettling,
            payee_address: payee,
            external_order_id,
            threshold_fraction,
            payment_status: PaymentStatus::Pending,
            attempt_count: 0,
            last_attempt_at: None,
            idempotency_key: None,
            settlement_reference: None,
            settled_amount: None,
            settled_at: None,
            last_failure: None,
            delivery: DeliveryStatus::NotAttempted,
        };
        meta.mode = crate::resolve_mode(&meta);
        Ok(meta)
    }

    /// Apply one status transition, enforcing the table.
    ///
    /// # Errors
    /// [`SplitvaultError::ConcurrentModification`] for any move the table
    /// does not allow. The rejection is logged.
    pub fn transition(&mut self, target: PaymentStatus) -> crate::Result<()> {
        if !self.payment_status.can_transition_to(target) {
            tracing::warn!(
                from = %self.payment_status,
                to = %target,
                "Rejected payment status transition"
            );
            return Err(SplitvaultError::ConcurrentModification {
                from: self.payment_status,
                to: target,
            });
        }
        self.payment_status = target;
        Ok(())
    }

    /// Claim the wallet for a dispatch attempt (`→ Processing`).
    ///
    /// Generates a fresh idempotency key and counts the attempt.
    ///
    /// # Errors
    /// - [`SplitvaultError::RetriesExhausted`] when no attempts remain
    /// - [`SplitvaultError::ConcurrentModification`] if not claimable
    pub fn begin_attempt(
        &mut self,
        wallet_id: WalletId,
        max_attempts: u32,
        now: DateTime<Utc>,
    ) -> crate::Result<IdempotencyKey> {
        if self.attempt_count >= max_attempts {
            return Err(SplitvaultError::RetriesExhausted {
                attempts: self.attempt_count,
            });
        }
        self.transition(PaymentStatus::Processing)?;
        let key = IdempotencyKey::derive(wallet_id, self.external_order_id.as_deref(), now);
        self.attempt_count += 1;
        self.last_attempt_at = Some(now);
        self.idempotency_key = Some(key.clone());
        self.last_failure = None;
        Ok(key)
    }

    /// `Processing → Paid`, recording the outcome.
    ///
    /// # Errors
    /// [`SplitvaultError::ConcurrentModification`] if not `Processing`.
    pub fn complete(
        &mut self,
        reference: Option<SettlementReference>,
        amount: Decimal,
        now: DateTime<Utc>,
    ) -> crate::Result<()> {
        self.transition(PaymentStatus::Paid)?;
        self.settlement_reference = reference;
        self.settled_amount = Some(amount);
        self.settled_at = Some(now);
        Ok(())
    }

    /// `→ Failed`. `attempt_count` is left as is.
    ///
    /// # Errors
    /// [`SplitvaultError::ConcurrentModification`] from `Paid`/`Refunded`.
    pub fn fail(&mut self, reason: impl Into<String>) -> crate::Result<()> {
        self.transition(PaymentStatus::Failed)?;
        self.last_failure = Some(reason.into());
        Ok(())
    }

    #[must_use]
    pub fn attempts_remaining(&self, max_attempts: u32) -> u32 {
        max_attempts.saturating_sub(self.attempt_count)
    }
}

/// Default threshold: 100% of total owed.
#[must_use]
pub fn default_threshold_fraction() -> Decimal {
    Decimal::new(constants::DEFAULT_THRESHOLD_FRACTION_PERCENT, 2)
}

/// # Errors
/// [`SplitvaultError::InvalidThreshold`] unless `0 < fraction <= 1`.
pub fn validate_threshold(fraction: Decimal) -> crate::Result<()> {
    if fraction <= Decimal::ZERO || fraction > Decimal::ONE {
        return Err(SplitvaultError::InvalidThreshold(fraction));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn forwarding() -> SettlementMetadata {
        SettlementMetadata::new(
            Some(Address::dummy().as_str()),
            Some("order-42".to_string()),
            Decimal::ONE,
        )
        .unwrap()
    }

    #[test]
    fn state_transitions_valid() {
        use PaymentStatus::*;
        assert!(Pending.can_transition_to(Processing));
        assert!(Pending.can_transition_to(Failed));
        assert!(Processing.can_transition_to(Paid));
        assert!(Processing.can_transition_to(Failed));
        assert!(Failed.can_transition_to(Processing));
        assert!(Paid.can_transition_to(Refunded));
    }

    #[test]
    fn state_transitions_invalid() {
        use PaymentStatus::*;
        assert!(!Paid.can_transition_to(Processing));
        assert!(!Paid.can_transition_to(Pending));
        assert!(!Processing.can_transition_to(Pending));
        assert!(!Processing.can_transition_to(Processing));
        assert!(!Failed.can_transition_to(Paid));
        assert!(!Failed.can_transition_to(Pending));
        assert!(!Refunded.can_transition_to(Paid));
        assert!(!Pending.can_transition_to(Refunded));
    }

    #[test]
    fn new_resolves_mode() {
        assert_eq!(forwarding().mode, PaymentMode::Forwarding);
        let own = SettlementMetadata::new(None, None, Decimal::ONE).unwrap();
        assert_eq!(own.mode, PaymentMode::SelfSettling);
        let blank = SettlementMetadata::new(Some("  "), None, Decimal::ONE).unwrap();
        assert_eq!(blank.mode, PaymentMode::SelfSettling);
        assert!(blank.payee_address.is_none());
    }

    #[test]
    fn new_rejects_bad_payee_and_threshold() {
        assert!(matches!(
            SettlementMetadata::new(Some("nope!"), None, Decimal::ONE),
            Err(SplitvaultError::InvalidAddress { .. })
        ));
        assert!(matches!(
            SettlementMetadata::new(None, None, Decimal::new(15, 1)),
            Err(SplitvaultError::InvalidThreshold(_))
        ));
        assert!(matches!(
            SettlementMetadata::new(None, None, Decimal::ZERO),
            Err(SplitvaultError::InvalidThreshold(_))
        ));
    }

    #[test]
    fn begin_attempt_counts_and_keys() {
        let mut meta = forwarding();
        let wallet = WalletId::new();
        let key = meta.begin_attempt(wallet, 3, Utc::now()).unwrap();
        assert_eq!(meta.payment_status, PaymentStatus::Processing);
        assert_eq!(meta.attempt_count, 1);
        assert_eq!(meta.idempotency_key, Some(key));
    }

    #[test]
    fn second_claim_while_processing_rejected() {
        let mut meta = forwarding();
        let wallet = WalletId::new();
        meta.begin_attempt(wallet, 3, Utc::now()).unwrap();
        let err = meta.begin_attempt(wallet, 3, Utc::now()).unwrap_err();
        assert!(matches!(err, SplitvaultError::ConcurrentModification { .. }));
        assert_eq!(meta.attempt_count, 1);
    }

    #[test]
    fn failure_keeps_attempt_count_and_allows_retry() {
        let mut meta = forwarding();
        let wallet = WalletId::new();
        meta.begin_attempt(wallet, 2, Utc::now()).unwrap();
        meta.fail("rpc timeout").unwrap();
        assert_eq!(meta.attempt_count, 1);
        assert_eq!(meta.attempts_remaining(2), 1);

        meta.begin_attempt(wallet, 2, Utc::now()).unwrap();
        meta.fail("rpc timeout").unwrap();
        let err = meta.begin_attempt(wallet, 2, Utc::now()).unwrap_err();
        assert!(matches!(err, SplitvaultError::RetriesExhausted { attempts: 2 }));
        assert_eq!(meta.payment_status, PaymentStatus::Failed);
    }

    #[test]
    fn paid_cannot_regress() {
        let mut meta = forwarding();
        meta.begin_attempt(WalletId::new(), 3, Utc::now()).unwrap();
        meta.complete(Some(SettlementReference::new("sig")), Decimal::ONE, Utc::now())
            .unwrap();
        assert!(meta.transition(PaymentStatus::Processing).is_err());
        assert!(meta.transition(PaymentStatus::Pending).is_err());
        assert!(meta.fail("late").is_err());
        assert_eq!(meta.payment_status, PaymentStatus::Paid);
        meta.transition(PaymentStatus::Refunded).unwrap();
    }

    #[test]
    fn serde_roundtrip() {
        let meta = forwarding();
        let json = serde_json::to_string(&meta).unwrap();
        assert!(json.contains("\"forwarding\""));
        let back: SettlementMetadata = serde_json::from_str(&json).unwrap();
        assert_eq!(back.payment_status, PaymentStatus::Pending);
        assert_eq!(back.delivery, DeliveryStatus::NotAttempted);
    }
}

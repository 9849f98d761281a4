//! Error types for the SplitVault settlement engine.
//!
//! All errors use the `SV_ERR_` prefix convention for easy grepping in logs.
//! Error codes are grouped by subsystem:
//! - 1xx: Validation errors (caller-fixable, never retried automatically)
//! - 2xx: Key vault errors
//! - 3xx: Settlement errors
//! - 4xx: Notification errors
//! - 5xx: Store / ledger errors
//! - 9xx: General / internal errors

use rust_decimal::Decimal;
use thiserror::Error;

use crate::{PaymentStatus, SettlementReference, UserId, WalletId};

/// Central error enum for all SplitVault operations.
#[derive(Debug, Error)]
pub enum SplitvaultError {
    // =================================================================
    // Validation Errors (1xx)
    // =================================================================
    /// A payee or payout address is not a well-formed account key.
    #[error("SV_ERR_100: Invalid address `{address}`: {reason}")]
    InvalidAddress { address: String, reason: String },

    /// An amount is zero, negative, or otherwise unusable.
    #[error("SV_ERR_101: Invalid amount {amount}: {reason}")]
    InvalidAmount { amount: Decimal, reason: String },

    /// Threshold fraction outside (0, 1].
    #[error("SV_ERR_102: Invalid threshold fraction {0}")]
    InvalidThreshold(Decimal),

    /// A participant's contributed amount would go down.
    #[error("SV_ERR_103: Contribution for {user} cannot decrease from {current} to {attempted}")]
    ContributionDecrease {
        user: UserId,
        current: Decimal,
        attempted: Decimal,
    },

    /// The settlement memo would exceed the transfer client's limit.
    #[error("SV_ERR_104: Memo too long: {len} bytes (max {max})")]
    MemoTooLong { len: usize, max: usize },

    /// The wallet no longer accepts this kind of mutation.
    #[error("SV_ERR_105: Wallet {wallet} is {status}: {reason}")]
    WalletLocked {
        wallet: WalletId,
        status: crate::WalletStatus,
        reason: String,
    },

    /// `Σ share_owed` drifted away from `total_owed` under equal split.
    #[error("SV_ERR_106: Share invariant violated: shares sum to {shares}, total owed {total}")]
    ShareInvariantViolation { shares: Decimal, total: Decimal },

    /// Participant payload failed validation.
    #[error("SV_ERR_107: Invalid participant: {reason}")]
    InvalidParticipant { reason: String },

    // =================================================================
    // Key Vault Errors (2xx)
    // =================================================================
    /// The caller's identity or key material is not allowed to decrypt.
    #[error("SV_ERR_200: Access denied for {identity} on wallet {wallet}")]
    AccessDenied { identity: UserId, wallet: WalletId },

    /// Ciphertext, nonce or MAC failed authentication.
    #[error("SV_ERR_201: Integrity failure: {reason}")]
    IntegrityFailure { reason: String },

    /// The wallet's encrypted secret has been revoked by cleanup.
    #[error("SV_ERR_202: Secret revoked for wallet {0}")]
    SecretRevoked(WalletId),

    /// The record names a key-derivation version this build does not know.
    #[error("SV_ERR_203: Unsupported KDF version {0}")]
    UnsupportedKdfVersion(u16),

    // =================================================================
    // Settlement Errors (3xx)
    // =================================================================
    /// Informational: not enough has been contributed yet.
    #[error("SV_ERR_300: Threshold not met: contributed {contributed}, required {required}")]
    ThresholdNotMet {
        contributed: Decimal,
        required: Decimal,
    },

    /// Idempotent no-op: the wallet has already been settled.
    #[error("SV_ERR_301: Wallet {wallet} already processed")]
    AlreadyProcessed {
        wallet: WalletId,
        reference: Option<SettlementReference>,
    },

    /// The transfer client failed to move funds.
    #[error("SV_ERR_302: Dispatch failure: {reason}")]
    DispatchFailure { reason: String },

    /// An out-of-order or racing status transition was rejected.
    #[error("SV_ERR_303: Concurrent modification: cannot move {from} -> {to}")]
    ConcurrentModification {
        from: PaymentStatus,
        to: PaymentStatus,
    },

    /// Cleanup refused because a dispatch is in flight.
    #[error("SV_ERR_304: Cleanup refused for wallet {wallet}: payment status is {status}")]
    CleanupRefused {
        wallet: WalletId,
        status: PaymentStatus,
    },

    /// `attempt_count` reached `max_attempts`.
    #[error("SV_ERR_305: Settlement retries exhausted after {attempts} attempts")]
    RetriesExhausted { attempts: u32 },

    // =================================================================
    // Notification Errors (4xx)
    // =================================================================
    /// Webhook delivery did not succeed. Never affects settlement state.
    #[error("SV_ERR_400: Webhook delivery failed after {attempts} attempts: {reason}")]
    WebhookDeliveryFailure { attempts: u32, reason: String },

    // =================================================================
    // Store / Ledger Errors (5xx)
    // =================================================================
    /// No wallet with this id.
    #[error("SV_ERR_500: Wallet not found: {0}")]
    WalletNotFound(WalletId),

    /// A wallet with this id already exists.
    #[error("SV_ERR_501: Wallet already exists: {0}")]
    DuplicateWallet(WalletId),

    /// No participant with this user id in the wallet.
    #[error("SV_ERR_502: Participant {user} not found in wallet {wallet}")]
    ParticipantNotFound { wallet: WalletId, user: UserId },

    /// The store kept losing version races.
    #[error("SV_ERR_503: Store contention on wallet {wallet} after {retries} re-reads")]
    StoreContention { wallet: WalletId, retries: usize },

    /// Backend store failure.
    #[error("SV_ERR_504: Store error: {0}")]
    Store(String),

    // =================================================================
    // General / Internal (9xx)
    // =================================================================
    /// Unrecoverable internal error.
    #[error("SV_ERR_900: Internal error: {0}")]
    Internal(String),

    /// Serialization / deserialization error.
    #[error("SV_ERR_901: Serialization error: {0}")]
    Serialization(String),

    /// Configuration error (bad env var, out-of-range value, etc.).
    #[error("SV_ERR_902: Configuration error: {0}")]
    Configuration(String),
}

impl SplitvaultError {
    /// Caller-fixable input problems. These surface immediately and are
    /// never retried by the engine.
    #[must_use]
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            Self::InvalidAddress { .. }
                | Self::InvalidAmount { .. }
                | Self::InvalidThreshold(_)
                | Self::ContributionDecrease { .. }
                | Self::MemoTooLong { .. }
                | Self::WalletLocked { .. }
                | Self::ShareInvariantViolation { .. }
                | Self::InvalidParticipant { .. }
        )
    }

    /// Failures that count against `attempt_count` and may be retried.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::DispatchFailure { .. } | Self::StoreContention { .. })
    }

    /// Outcomes callers should treat as success.
    #[must_use]
    pub fn is_idempotent_success(&self) -> bool {
        matches!(self, Self::AlreadyProcessed { .. })
    }
}

/// Crate-wide `Result` alias.
pub type Result<T> = std::result::Result<T, SplitvaultError>;

impl From<serde_json::Error> for SplitvaultError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display_contains_prefix() {
        let err = SplitvaultError::WalletNotFound(WalletId::new());
        let msg = format!("{err}");
        assert!(msg.starts_with("SV_ERR_500"), "Got: {msg}");
    }

    #[test]
    fn contribution_decrease_display() {
        let err = SplitvaultError::ContributionDecrease {
            user: UserId::new(),
            current: Decimal::new(40, 0),
            attempted: Decimal::new(30, 0),
        };
        let msg = format!("{err}");
        assert!(msg.contains("SV_ERR_103"));
        assert!(msg.contains("40"));
        assert!(msg.contains("30"));
    }

    #[test]
    fn concurrent_modification_names_both_states() {
        let err = SplitvaultError::ConcurrentModification {
            from: PaymentStatus::Paid,
            to: PaymentStatus::Processing,
        };
        let msg = format!("{err}");
        assert!(msg.contains("paid"));
        assert!(msg.contains("processing"));
    }

    #[test]
    fn classifiers() {
        assert!(
            SplitvaultError::InvalidAddress {
                address: "x".into(),
                reason: "bad".into()
            }
            .is_validation()
        );
        assert!(
            SplitvaultError::DispatchFailure {
                reason: "rpc down".into()
            }
            .is_retryable()
        );
        assert!(
            SplitvaultError::AlreadyProcessed {
                wallet: WalletId::new(),
                reference: None
            }
            .is_idempotent_success()
        );
        assert!(!SplitvaultError::Internal("x".into()).is_validation());
    }

    #[test]
    fn all_errors_have_sv_err_prefix() {
        let errors: Vec<Box<dyn std::error::Error>> = vec![
            Box::new(SplitvaultError::RetriesExhausted { attempts: 3 }),
            Box::new(SplitvaultError::SecretRevoked(WalletId::new())),
            Box::new(SplitvaultError::IntegrityFailure {
                reason: "tag".into(),
            }),
            Box::new(SplitvaultError::Internal("test".into())),
            Box::new(SplitvaultError::WebhookDeliveryFailure {
                attempts: 3,
                reason: "500".into(),
            }),
        ];
        for err in errors {
            let msg = format!("{err}");
            assert!(
                msg.starts_with("SV_ERR_"),
                "Error missing SV_ERR_ prefix: {msg}"
            );
        }
    }
}

//! Custodial group wallet model.
//!
//! A `Wallet` is created when a bill is locked into group collection. It
//! owns the participant list and the encrypted signing secret of the
//! custodial account. Shares, contributions and thresholds are all computed
//! from this record.

use chrono::{DateTime, Utc};
use rust_decimal::{Decimal, RoundingStrategy};
use serde::{Deserialize, Serialize};

use crate::{Address, Participant, SplitvaultError, UserId, WalletId, constants};

/// Wallet lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WalletStatus {
    /// Collecting contributions; membership may still change.
    Active,
    /// Settlement has started; membership is frozen.
    Locked,
    /// Settlement completed.
    Settled,
    /// Cleaned up and secret revoked. Terminal.
    Closed,
}

impl std::fmt::Display for WalletStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Active => "active",
            Self::Locked => "locked",
            Self::Settled => "settled",
            Self::Closed => "closed",
        };
        f.write_str(s)
    }
}

/// Who may authorize spending from the custodial account.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SharingMode {
    /// Any accepted participant (and the creator) may decrypt the secret.
    AnyParticipant,
    /// Only the creator may decrypt the secret.
    CreatorOnly,
}

/// How owed shares are assigned.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SplitPolicy {
    /// `total_owed` divided evenly; recomputed on membership change.
    Equal,
    /// Shares set explicitly; the share-sum invariant is not enforced.
    Manual,
}

/// Key-derivation version tag carried by every encrypted record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum KdfVersion {
    /// Legacy: `HMAC-SHA256(master, salt)`.
    V1,
    /// Current: wallet-bound, domain-separated HMAC-SHA256.
    V2,
}

impl KdfVersion {
    pub const CURRENT: Self = Self::V2;

    #[must_use]
    pub fn as_u16(self) -> u16 {
        match self {
            Self::V1 => 1,
            Self::V2 => 2,
        }
    }

    /// # Errors
    /// [`SplitvaultError::UnsupportedKdfVersion`] for unknown tags.
    pub fn from_u16(value: u16) -> crate::Result<Self> {
        match value {
            1 => Ok(Self::V1),
            2 => Ok(Self::V2),
            other => Err(SplitvaultError::UnsupportedKdfVersion(other)),
        }
    }
}

/// Authenticated-encryption envelope for the custodial signing secret.
///
/// Never stored or logged in plaintext. `ciphertext` excludes the tag;
/// the tag lives in `mac`.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncryptedSecret {
    pub ciphertext: Vec<u8>,
    pub iv: [u8; 12],
    pub mac: [u8; 16],
    pub kdf_version: KdfVersion,
}

impl std::fmt::Debug for EncryptedSecret {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EncryptedSecret")
            .field("ciphertext_len", &self.ciphertext.len())
            .field("kdf_version", &self.kdf_version)
            .finish_non_exhaustive()
    }
}

/// A custodial group wallet.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Wallet {
    pub id: WalletId,
    /// Link to the externally owned bill / order record.
    pub bill_reference: String,
    /// Custodial account address.
    pub address: Address,
    pub creator: UserId,
    pub sharing_mode: SharingMode,
    pub split_policy: SplitPolicy,
    /// `None` once revoked by cleanup.
    pub encrypted_secret: Option<EncryptedSecret>,
    /// Per-wallet salt for key derivation.
    pub key_salt: Vec<u8>,
    pub currency: String,
    /// Total bill amount to be collected.
    pub total_owed: Decimal,
    /// Funds held by the custodial account.
    pub balance: Decimal,
    pub status: WalletStatus,
    pub participants: Vec<Participant>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Wallet {
    /// Sum of all participants' contributions.
    #[must_use]
    pub fn total_contributed(&self) -> Decimal {
        self.participants.iter().map(|p| p.amount_contributed).sum()
    }

    /// Sum of all owed shares.
    #[must_use]
    pub fn total_shares(&self) -> Decimal {
        self.participants.iter().map(|p| p.share_owed).sum()
    }

    /// Amount that must be contributed before settlement at `fraction`.
    #[must_use]
    pub fn required_for(&self, fraction: Decimal) -> Decimal {
        self.total_owed * fraction
    }

    /// `total_contributed >= total_owed * fraction`.
    #[must_use]
    pub fn threshold_met(&self, fraction: Decimal) -> bool {
        self.total_contributed() >= self.required_for(fraction)
    }

    #[must_use]
    pub fn participant(&self, user_id: &UserId) -> Option<&Participant> {
        self.participants.iter().find(|p| p.user_id == *user_id)
    }

    pub fn participant_mut(&mut self, user_id: &UserId) -> Option<&mut Participant> {
        self.participants.iter_mut().find(|p| p.user_id == *user_id)
    }

    /// Membership changes are only allowed while collecting.
    #[must_use]
    pub fn membership_open(&self) -> bool {
        self.status == WalletStatus::Active
    }

    /// # Errors
    /// [`SplitvaultError::WalletLocked`] unless the wallet is `Active`.
    pub fn ensure_membership_open(&self, action: &str) -> crate::Result<()> {
        if self.membership_open() {
            Ok(())
        } else {
            Err(SplitvaultError::WalletLocked {
                wallet: self.id,
                status: self.status,
                reason: format!("cannot {action}"),
            })
        }
    }

    /// Redistribute `total_owed` evenly over participants who count toward
    /// the split. Shares are rounded down to [`constants::AMOUNT_SCALE`]
    /// places; leftover units go to the earliest participants so the sum
    /// is exact. No-op under [`SplitPolicy::Manual`].
    pub fn recompute_equal_shares(&mut self) {
        if self.split_policy == SplitPolicy::Manual {
            return;
        }
        let counted = self
            .participants
            .iter()
            .filter(|p| p.status.counts_toward_split())
            .count();
        if counted == 0 {
            for p in &mut self.participants {
                p.share_owed = Decimal::ZERO;
            }
            return;
        }

        let count = Decimal::from(counted);
        let base = (self.total_owed / count)
            .round_dp_with_strategy(constants::AMOUNT_SCALE, RoundingStrategy::ToZero);
        let unit = Decimal::new(1, constants::AMOUNT_SCALE);
        let mut remainder = self.total_owed - base * count;

        for p in &mut self.participants {
            if !p.status.counts_toward_split() {
                p.share_owed = Decimal::ZERO;
                continue;
            }
            p.share_owed = base;
            if remainder >= unit {
                p.share_owed += unit;
                remainder -= unit;
            }
        }
    }

    /// `Σ share_owed == total_owed` within epsilon, unless shares are manual.
    ///
    /// # Errors
    /// [`SplitvaultError::ShareInvariantViolation`] on drift.
    pub fn check_share_invariant(&self) -> crate::Result<()> {
        if self.split_policy == SplitPolicy::Manual || self.participants.is_empty() {
            return Ok(());
        }
        let shares = self.total_shares();
        let epsilon = Decimal::new(constants::SHARE_SUM_EPSILON_UNITS, constants::AMOUNT_SCALE);
        if (shares - self.total_owed).abs() > epsilon {
            return Err(SplitvaultError::ShareInvariantViolation {
                shares,
                total: self.total_owed,
            });
        }
        Ok(())
    }

    pub fn touch(&mut self, now: DateTime<Utc>) {
        self.updated_at = now;
    }
}

/// Dummy wallet for testing. **Never use in production.**
#[cfg(any(test, feature = "test-helpers"))]
impl Wallet {
    /// A wallet with `participants` accepted members splitting
    /// `total_owed` evenly. No encrypted secret is attached.
    pub fn dummy(total_owed: Decimal, participants: usize) -> Self {
        let now = Utc::now();
        let mut wallet = Self {
            id: WalletId::new(),
            bill_reference: format!("bill-{}", rand::random::<u32>()),
            address: Address::dummy(),
            creator: UserId::new(),
            sharing_mode: SharingMode::AnyParticipant,
            split_policy: SplitPolicy::Equal,
            encrypted_secret: None,
            key_salt: rand::random::<[u8; 32]>().to_vec(),
            currency: "USDC".to_string(),
            total_owed,
            balance: Decimal::ZERO,
            status: WalletStatus::Active,
            participants: (0..participants)
                .map(|_| Participant::dummy(Decimal::ZERO))
                .collect(),
            created_at: now,
            updated_at: now,
        };
        wallet.recompute_equal_shares();
        wallet
    }
}

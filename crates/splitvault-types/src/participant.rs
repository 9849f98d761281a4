//! Participant model: who owes what, who has paid what.
//!
//! ## Status Machine
//!
//! ```text
//!   PENDING ──▶ INVITED ──▶ ACCEPTED ──▶ PAID
//!      │           │            │         ▲
//!      │           ▼            ▼         │
//!      │       DECLINED      LOCKED ──────┘
//!      └──────────────────────────────────┘ (contribution)
//! ```
//!
//! `amount_contributed` is monotonically non-decreasing.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::{Address, SplitvaultError, UserId};

/// Lifecycle status of a participant within one wallet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParticipantStatus {
    /// Added to the wallet, nothing sent yet.
    Pending,
    /// Invitation delivered.
    Invited,
    /// Agreed to pay their share.
    Accepted,
    /// Refused. Excluded from equal-split recomputation.
    Declined,
    /// Contributed at least their owed share. Terminal.
    Paid,
    /// Frozen because the wallet locked before they paid.
    Locked,
}

impl ParticipantStatus {
    /// Can a participant move from `self` to `target`?
    #[must_use]
    pub fn can_transition_to(&self, target: Self) -> bool {
        use ParticipantStatus::{Accepted, Declined, Invited, Locked, Paid, Pending};
        matches!(
            (self, target),
            (Pending, Invited | Accepted | Declined | Paid | Locked)
                | (Invited, Accepted | Declined | Paid | Locked)
                | (Accepted, Paid | Locked)
                | (Declined, Invited | Accepted)
                | (Locked, Paid)
        )
    }

    /// Whether this participant is part of the split.
    #[must_use]
    pub fn counts_toward_split(&self) -> bool {
        !matches!(self, Self::Declined)
    }
}

impl std::fmt::Display for ParticipantStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Invited => "invited",
            Self::Accepted => "accepted",
            Self::Declined => "declined",
            Self::Paid => "paid",
            Self::Locked => "locked",
        };
        f.write_str(s)
    }
}

/// One recorded contribution.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Contribution {
    pub amount: Decimal,
    /// External transfer reference (on-chain signature etc.).
    pub reference: String,
    pub recorded_at: DateTime<Utc>,
}

/// A member of a group wallet.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Participant {
    pub user_id: UserId,
    pub display_name: String,
    /// Where refunds or payouts for this participant go, if known.
    pub payout_address: Option<Address>,
    pub share_owed: Decimal,
    /// Never decreases.
    pub amount_contributed: Decimal,
    pub status: ParticipantStatus,
    pub joined_at: Option<DateTime<Utc>>,
    pub paid_at: Option<DateTime<Utc>>,
    /// Reference of the most recent contribution.
    pub contribution_reference: Option<String>,
    /// Append-only contribution log.
    #[serde(default)]
    pub history: Vec<Contribution>,
}

impl Participant {
    #[must_use]
    pub fn new(user_id: UserId, display_name: impl Into<String>) -> Self {
        Self {
            user_id,
            display_name: display_name.into(),
            payout_address: None,
            share_owed: Decimal::ZERO,
            amount_contributed: Decimal::ZERO,
            status: ParticipantStatus::Pending,
            joined_at: None,
            paid_at: None,
            contribution_reference: None,
            history: Vec::new(),
        }
    }

    #[must_use]
    pub fn with_status(mut self, status: ParticipantStatus) -> Self {
        self.status = status;
        self
    }

    #[must_use]
    pub fn with_payout_address(mut self, address: Address) -> Self {
        self.payout_address = Some(address);
        self
    }

    /// What is still owed (never negative).
    #[must_use]
    pub fn outstanding(&self) -> Decimal {
        (self.share_owed - self.amount_contributed).max(Decimal::ZERO)
    }

    /// Has a contribution with this reference already been recorded?
    #[must_use]
    pub fn has_contribution(&self, reference: &str) -> bool {
        self.history.iter().any(|c| c.reference == reference)
    }

    /// Move to `target`, enforcing the status machine.
    ///
    /// # Errors
    /// Returns [`SplitvaultError::InvalidParticipant`] for an illegal move.
    pub fn transition(&mut self, target: ParticipantStatus) -> crate::Result<()> {
        if self.status == target {
            return Ok(());
        }
        if !self.status.can_transition_to(target) {
            return Err(SplitvaultError::InvalidParticipant {
                reason: format!(
                    "participant {} cannot move from {} to {target}",
                    self.user_id, self.status
                ),
            });
        }
        self.status = target;
        Ok(())
    }

    /// Record a positive contribution.
    ///
    /// Returns `false` without changing anything when `reference` was
    /// already recorded (the same transfer delivered twice).
    ///
    /// # Errors
    /// [`SplitvaultError::InvalidAmount`] for a zero or negative amount, or
    /// one that would overflow the contributed total.
    pub fn apply_contribution(
        &mut self,
        amount: Decimal,
        reference: &str,
        at: DateTime<Utc>,
    ) -> crate::Result<bool> {
        if amount <= Decimal::ZERO {
            return Err(SplitvaultError::InvalidAmount {
                amount,
                reason: "contribution must be positive".to_string(),
            });
        }
        if self.has_contribution(reference) {
            return Ok(false);
        }
        self.amount_contributed = self.amount_contributed.checked_add(amount).ok_or_else(|| {
            SplitvaultError::InvalidAmount {
                amount,
                reason: "contributed total overflows".to_string(),
            }
        })?;
        self.history.push(Contribution {
            amount,
            reference: reference.to_string(),
            recorded_at: at,
        });
        self.contribution_reference = Some(reference.to_string());
        if self.joined_at.is_none() {
            self.joined_at = Some(at);
        }
        self.mark_paid_if_covered(at);
        Ok(true)
    }

    /// Raise the contributed total to an externally observed value.
    ///
    /// Returns the delta that was applied (zero when unchanged).
    ///
    /// # Errors
    /// [`SplitvaultError::ContributionDecrease`] if `new_total` is below
    /// the current total. The value is rejected, not clamped.
    pub fn raise_contribution_total(
        &mut self,
        new_total: Decimal,
        reference: &str,
        at: DateTime<Utc>,
    ) -> crate::Result<Decimal> {
        if new_total < self.amount_contributed {
            return Err(SplitvaultError::ContributionDecrease {
                user: self.user_id,
                current: self.amount_contributed,
                attempted: new_total,
            });
        }
        let delta = new_total - self.amount_contributed;
        if delta.is_zero() {
            return Ok(Decimal::ZERO);
        }
        self.apply_contribution(delta, reference, at)?;
        Ok(delta)
    }

    /// Merge an upserted copy into this row.
    ///
    /// Contributions and the original `joined_at` are kept; shares are
    /// owned by the ledger and are not taken from `incoming`. `Paid` is
    /// never taken from `incoming` either: only covering contributions
    /// set it.
    pub fn merge_from(&mut self, incoming: Participant) {
        let name = incoming.display_name.trim();
        if !name.is_empty() {
            self.display_name = name.to_string();
        }
        if incoming.payout_address.is_some() {
            self.payout_address = incoming.payout_address;
        }
        if self.joined_at.is_none() {
            self.joined_at = incoming.joined_at;
        }
        if incoming.status == ParticipantStatus::Paid && self.status != ParticipantStatus::Paid {
            tracing::warn!(
                user = %self.user_id,
                from = %self.status,
                "Ignoring paid status on upsert, paid follows contributions"
            );
        } else if incoming.status != self.status {
            if self.status.can_transition_to(incoming.status) {
                self.status = incoming.status;
            } else {
                tracing::warn!(
                    user = %self.user_id,
                    from = %self.status,
                    to = %incoming.status,
                    "Ignoring illegal participant status change on upsert"
                );
            }
        }
    }

    fn mark_paid_if_covered(&mut self, at: DateTime<Utc>) {
        if self.share_owed > Decimal::ZERO
            && self.amount_contributed >= self.share_owed
            && self.status.can_transition_to(ParticipantStatus::Paid)
        {
            self.status = ParticipantStatus::Paid;
            self.paid_at = Some(at);
        }
    }
}

/// Dummy participant for testing. **Never use in production.**
#[cfg(any(test, feature = "test-helpers"))]
impl Participant {
    pub fn dummy(share_owed: Decimal) -> Self {
        let mut p = Self::new(UserId::new(), "Test Participant")
            .with_status(ParticipantStatus::Accepted)
            .with_payout_address(Address::dummy());
        p.share_owed = share_owed;
        p.joined_at = Some(Utc::now());
        p
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_transitions_valid() {
        use ParticipantStatus::*;
        assert!(Pending.can_transition_to(Invited));
        assert!(Invited.can_transition_to(Accepted));
        assert!(Accepted.can_transition_to(Paid));
        assert!(Locked.can_transition_to(Paid));
        assert!(Declined.can_transition_to(Accepted));
    }

    #[test]
    fn status_transitions_invalid() {
        use ParticipantStatus::*;
        assert!(!Paid.can_transition_to(Pending));
        assert!(!Paid.can_transition_to(Locked));
        assert!(!Accepted.can_transition_to(Invited));
        assert!(!Declined.can_transition_to(Paid));
    }

    #[test]
    fn contribution_accumulates_and_marks_paid() {
        let mut p = Participant::dummy(Decimal::new(50, 0));
        let now = Utc::now();
        assert!(p.apply_contribution(Decimal::new(20, 0), "tx1", now).unwrap());
        assert_eq!(p.status, ParticipantStatus::Accepted);
        assert_eq!(p.outstanding(), Decimal::new(30, 0));

        assert!(p.apply_contribution(Decimal::new(30, 0), "tx2", now).unwrap());
        assert_eq!(p.status, ParticipantStatus::Paid);
        assert_eq!(p.paid_at, Some(now));
        assert_eq!(p.contribution_reference.as_deref(), Some("tx2"));
        assert_eq!(p.history.len(), 2);
    }

    #[test]
    fn duplicate_reference_is_noop() {
        let mut p = Participant::dummy(Decimal::new(50, 0));
        let now = Utc::now();
        p.apply_contribution(Decimal::new(10, 0), "tx1", now).unwrap();
        let applied = p.apply_contribution(Decimal::new(10, 0), "tx1", now).unwrap();
        assert!(!applied);
        assert_eq!(p.amount_contributed, Decimal::new(10, 0));
    }

    #[test]
    fn non_positive_contribution_rejected() {
        let mut p = Participant::dummy(Decimal::new(50, 0));
        let err = p
            .apply_contribution(Decimal::new(-5, 0), "tx", Utc::now())
            .unwrap_err();
        assert!(matches!(err, SplitvaultError::InvalidAmount { .. }));
        assert_eq!(p.amount_contributed, Decimal::ZERO);
    }

    #[test]
    fn overflowing_contribution_rejected() {
        let mut p = Participant::dummy(Decimal::new(50, 0));
        p.apply_contribution(Decimal::MAX, "tx1", Utc::now()).unwrap();
        let err = p.apply_contribution(Decimal::ONE, "tx2", Utc::now()).unwrap_err();
        assert!(matches!(err, SplitvaultError::InvalidAmount { .. }));
        assert_eq!(p.amount_contributed, Decimal::MAX);
        assert_eq!(p.history.len(), 1);
    }

    #[test]
    fn decrease_rejected_not_clamped() {
        let mut p = Participant::dummy(Decimal::new(50, 0));
        p.raise_contribution_total(Decimal::new(40, 0), "obs1", Utc::now())
            .unwrap();
        let err = p
            .raise_contribution_total(Decimal::new(30, 0), "obs2", Utc::now())
            .unwrap_err();
        assert!(matches!(err, SplitvaultError::ContributionDecrease { .. }));
        assert_eq!(p.amount_contributed, Decimal::new(40, 0));
    }

    #[test]
    fn raise_to_same_total_is_noop() {
        let mut p = Participant::dummy(Decimal::new(50, 0));
        p.raise_contribution_total(Decimal::new(40, 0), "obs1", Utc::now())
            .unwrap();
        let delta = p
            .raise_contribution_total(Decimal::new(40, 0), "obs2", Utc::now())
            .unwrap();
        assert!(delta.is_zero());
        assert_eq!(p.history.len(), 1);
    }

    #[test]
    fn merge_preserves_joined_at_and_contributions() {
        let mut p = Participant::dummy(Decimal::new(50, 0));
        let original_join = p.joined_at;
        p.apply_contribution(Decimal::new(10, 0), "tx1", Utc::now())
            .unwrap();

        let mut incoming = Participant::new(p.user_id, "Renamed");
        incoming.joined_at = Some(Utc::now() + chrono::Duration::days(1));
        incoming.status = ParticipantStatus::Paid;
        p.merge_from(incoming);

        assert_eq!(p.display_name, "Renamed");
        assert_eq!(p.joined_at, original_join);
        assert_eq!(p.amount_contributed, Decimal::new(10, 0));
        assert_eq!(p.status, ParticipantStatus::Accepted);
    }

    #[test]
    fn merge_cannot_mark_paid_without_contribution() {
        let mut p = Participant::dummy(Decimal::new(50, 0));
        let incoming = Participant::new(p.user_id, "").with_status(ParticipantStatus::Paid);
        p.merge_from(incoming);
        assert_eq!(p.status, ParticipantStatus::Accepted);
        assert!(p.paid_at.is_none());

        p.apply_contribution(Decimal::new(50, 0), "tx1", Utc::now())
            .unwrap();
        assert_eq!(p.status, ParticipantStatus::Paid);
    }

    #[test]
    fn merge_still_applies_legal_non_paid_status() {
        let mut p = Participant::dummy(Decimal::new(50, 0)).with_status(ParticipantStatus::Invited);
        let incoming = Participant::new(p.user_id, "").with_status(ParticipantStatus::Accepted);
        p.merge_from(incoming);
        assert_eq!(p.status, ParticipantStatus::Accepted);
    }

    #[test]
    fn merge_ignores_illegal_status() {
        let mut p = Participant::dummy(Decimal::new(50, 0)).with_status(ParticipantStatus::Paid);
        let incoming = Participant::new(p.user_id, "").with_status(ParticipantStatus::Pending);
        p.merge_from(incoming);
        assert_eq!(p.status, ParticipantStatus::Paid);
        assert_eq!(p.display_name, "Test Participant");
    }

    #[test]
    fn serde_roundtrip() {
        let p = Participant::dummy(Decimal::new(1234, 2));
        let json = serde_json::to_string(&p).unwrap();
        let back: Participant = serde_json::from_str(&json).unwrap();
        assert_eq!(p.user_id, back.user_id);
        assert_eq!(p.share_owed, back.share_owed);
        assert_eq!(p.status, back.status);
    }
}

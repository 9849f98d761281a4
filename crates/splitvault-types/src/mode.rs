//! Payment mode resolution.
//!
//! Pure: no I/O, no side effects, safe to call as a guard before any
//! mutation.

use crate::{Address, PaymentMode, SettlementMetadata};

/// Classify a wallet as forwarding or self-settling.
///
/// A non-empty, well-formed `payee_address` means `Forwarding`; anything
/// else means `SelfSettling`.
#[must_use]
pub fn resolve_mode(meta: &SettlementMetadata) -> PaymentMode {
    match meta.payee_address.as_deref().map(str::trim) {
        Some(raw) if !raw.is_empty() && Address::is_valid(raw) => PaymentMode::Forwarding,
        _ => PaymentMode::SelfSettling,
    }
}

/// `true` when a payee is present but malformed. Such a wallet must not
/// silently fall back to self-settling.
#[must_use]
pub fn has_malformed_payee(meta: &SettlementMetadata) -> bool {
    match meta.payee_address.as_deref().map(str::trim) {
        Some(raw) => !raw.is_empty() && !Address::is_valid(raw),
        None => false,
    }
}

//! Settlement notification payload.
//!
//! The payload is rebuilt from the wallet and settlement records alone, so
//! any delivery can be replayed for debugging or manual re-delivery. The
//! wire format is camelCase JSON.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::{
    PaymentMode, PaymentStatus, SettlementMetadata, SettlementReference, SplitvaultError, Wallet,
    WalletId,
};

/// Body POSTed to the settlement webhook.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NotificationPayload {
    pub external_order_id: Option<String>,
    pub wallet_id: WalletId,
    pub settlement_reference: SettlementReference,
    pub amount: Decimal,
    pub currency: String,
    pub payout_addresses: Vec<String>,
    pub status: PaymentStatus,
    pub timestamp: DateTime<Utc>,
}

impl NotificationPayload {
    /// Rebuild the payload for a settled wallet.
    ///
    /// # Errors
    /// [`SplitvaultError::Internal`] if the settlement has not completed a
    /// dispatch (no reference, amount or settlement time recorded).
    pub fn from_records(wallet: &Wallet, settlement: &SettlementMetadata) -> crate::Result<Self> {
        if !settlement.payment_status.is_settled() {
            return Err(SplitvaultError::Internal(format!(
                "wallet {} is {}, nothing to notify",
                wallet.id, settlement.payment_status
            )));
        }
        let (Some(reference), Some(amount), Some(settled_at)) = (
            settlement.settlement_reference.clone(),
            settlement.settled_amount,
            settlement.settled_at,
        ) else {
            return Err(SplitvaultError::Internal(format!(
                "wallet {} has no dispatched settlement to notify",
                wallet.id
            )));
        };

        Ok(Self {
            external_order_id: settlement.external_order_id.clone(),
            wallet_id: wallet.id,
            settlement_reference: reference,
            amount,
            currency: wallet.currency.clone(),
            payout_addresses: payout_addresses(wallet, settlement),
            status: settlement.payment_status,
            timestamp: settled_at,
        })
    }

    /// SHA-256 fingerprint of the canonical JSON body. Equal for replays.
    ///
    /// # Errors
    /// [`SplitvaultError::Serialization`] if the payload cannot be encoded.
    pub fn fingerprint(&self) -> crate::Result<String> {
        let body = serde_json::to_vec(self)?;
        Ok(hex::encode(Sha256::digest(&body)))
    }
}

/// Forwarded funds went to the payee; retained funds pay out to the creator.
fn payout_addresses(wallet: &Wallet, settlement: &SettlementMetadata) -> Vec<String> {
    match settlement.mode {
        PaymentMode::Forwarding => settlement.payee_address.iter().cloned().collect(),
        PaymentMode::SelfSettling => wallet
            .participant(&wallet.creator)
            .and_then(|creator| creator.payout_address.as_ref())
            .map(|address| address.as_str().to_string())
            .into_iter()
            .collect(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Address;

    fn settled() -> (Wallet, SettlementMetadata) {
        let wallet = Wallet::dummy(Decimal::new(100, 0), 2);
        let mut meta = SettlementMetadata::new(
            Some(Address::dummy().as_str()),
            Some("order-7".to_string()),
            Decimal::ONE,
        )
        .unwrap();
        meta.begin_attempt(wallet.id, 3, Utc::now()).unwrap();
        meta.complete(
            Some(SettlementReference::new("sig-abc")),
            Decimal::new(100, 0),
            Utc::now(),
        )
        .unwrap();
        (wallet, meta)
    }

    #[test]
    fn rebuilds_from_records() {
        let (wallet, meta) = settled();
        let payload = NotificationPayload::from_records(&wallet, &meta).unwrap();
        assert_eq!(payload.wallet_id, wallet.id);
        assert_eq!(payload.settlement_reference.as_str(), "sig-abc");
        assert_eq!(payload.external_order_id.as_deref(), Some("order-7"));
        assert_eq!(payload.payout_addresses, vec![meta.payee_address.clone().unwrap()]);
        assert_eq!(payload.status, PaymentStatus::Paid);
    }

    #[test]
    fn self_settled_payload_names_creator_payout() {
        let mut wallet = Wallet::dummy(Decimal::new(100, 0), 2);
        wallet.creator = wallet.participants[0].user_id;
        let mut meta = SettlementMetadata::new(None, None, Decimal::ONE).unwrap();
        assert_eq!(meta.mode, PaymentMode::SelfSettling);
        meta.transition(PaymentStatus::Processing).unwrap();
        meta.complete(
            Some(SettlementReference::new(format!("self-settled:{}", wallet.id))),
            Decimal::new(100, 0),
            Utc::now(),
        )
        .unwrap();

        let payload = NotificationPayload::from_records(&wallet, &meta).unwrap();
        let creator_address = wallet.participants[0].payout_address.clone().unwrap();
        assert_eq!(payload.payout_addresses, vec![creator_address.as_str().to_string()]);

        wallet.participants[0].payout_address = None;
        let payload = NotificationPayload::from_records(&wallet, &meta).unwrap();
        assert!(payload.payout_addresses.is_empty());
    }

    #[test]
    fn replay_is_identical() {
        let (wallet, meta) = settled();
        let a = NotificationPayload::from_records(&wallet, &meta).unwrap();
        let b = NotificationPayload::from_records(&wallet, &meta).unwrap();
        assert_eq!(a, b);
        assert_eq!(a.fingerprint().unwrap(), b.fingerprint().unwrap());
    }

    #[test]
    fn pending_wallet_has_no_payload() {
        let wallet = Wallet::dummy(Decimal::new(100, 0), 2);
        let meta = SettlementMetadata::new(None, None, Decimal::ONE).unwrap();
        assert!(NotificationPayload::from_records(&wallet, &meta).is_err());
    }

    #[test]
    fn wire_format_is_camel_case() {
        let (wallet, meta) = settled();
        let payload = NotificationPayload::from_records(&wallet, &meta).unwrap();
        let json = serde_json::to_value(&payload).unwrap();
        assert!(json.get("externalOrderId").is_some());
        assert!(json.get("settlementReference").is_some());
        assert!(json.get("payoutAddresses").is_some());
        assert_eq!(json["status"], "paid");
    }
}

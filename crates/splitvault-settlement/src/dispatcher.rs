//! Fund Dispatcher: moves custodial funds to a payee through the external
//! transfer client.
//!
//! This component only validates, builds the memo, guards against a second
//! dispatch, and maps client errors into [`SplitvaultError`]. Transaction
//! construction and signing belong to the client.

use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use rust_decimal::Decimal;
use splitvault_custody::SigningSecret;
use splitvault_types::{
    Address, IdempotencyKey, Result, SettlementReference, SplitvaultError, WalletId, constants,
};

use crate::dispatch_guard::DispatchGuard;

const MEMO_PREFIX: &str = "splitvault:v1";

/// Source account and the unlocked secret that authorizes spending from it.
#[derive(Debug, Clone)]
pub struct WalletHandle {
    pub wallet_id: WalletId,
    pub address: Address,
    pub secret: SigningSecret,
}

/// What the engine asks the dispatcher to do.
#[derive(Debug, Clone)]
pub struct DispatchRequest {
    pub handle: WalletHandle,
    pub payee_address: String,
    pub amount: Decimal,
    pub currency: String,
    pub external_order_id: Option<String>,
    pub bill_reference: String,
    pub idempotency_key: IdempotencyKey,
}

/// What the dispatcher hands to the chain client.
#[derive(Debug, Clone)]
pub struct TransferRequest {
    pub source: Address,
    pub secret: SigningSecret,
    pub destination: Address,
    pub amount: Decimal,
    pub currency: String,
    pub memo: String,
    pub idempotency_key: IdempotencyKey,
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum TransferError {
    #[error("transfer rejected: {0}")]
    Rejected(String),
    #[error("transfer client unavailable: {0}")]
    Unavailable(String),
    #[error("transfer timed out")]
    Timeout,
}

/// External chain client. Returns the transfer signature.
#[async_trait]
pub trait TransferClient: Send + Sync {
    async fn transfer(&self, request: &TransferRequest) -> std::result::Result<String, TransferError>;
}

/// Seam the engine depends on.
#[async_trait]
pub trait FundDispatch: Send + Sync {
    async fn dispatch(&self, request: DispatchRequest) -> Result<SettlementReference>;

    /// Reference of a transfer this dispatcher already completed for `wallet`.
    fn completed_reference(&self, wallet: WalletId) -> Option<SettlementReference>;
}

/// Deterministic memo tying the transfer to the external order.
///
/// Falls back to the bill reference when there is no external order id.
///
/// # Errors
/// [`SplitvaultError::MemoTooLong`] above [`constants::MAX_MEMO_BYTES`].
pub fn settlement_memo(
    wallet_id: WalletId,
    external_order_id: Option<&str>,
    bill_reference: &str,
) -> Result<String> {
    let subject = match external_order_id.map(str::trim).filter(|s| !s.is_empty()) {
        Some(order) => format!("order:{}", escape(order)),
        None => format!("bill:{}", escape(bill_reference)),
    };
    let memo = format!("{MEMO_PREFIX}|{subject}|wallet:{}", wallet_id.0);
    if memo.len() > constants::MAX_MEMO_BYTES {
        return Err(SplitvaultError::MemoTooLong {
            len: memo.len(),
            max: constants::MAX_MEMO_BYTES,
        });
    }
    Ok(memo)
}

fn escape(value: &str) -> String {
    value.replace('%', "%25").replace('|', "%7C")
}

pub struct FundDispatcher {
    client: Arc<dyn TransferClient>,
    guard: Mutex<DispatchGuard>,
}

impl FundDispatcher {
    #[must_use]
    pub fn new(client: Arc<dyn TransferClient>) -> Self {
        Self::with_guard_size(client, constants::DISPATCH_GUARD_CACHE_SIZE)
    }

    #[must_use]
    pub fn with_guard_size(client: Arc<dyn TransferClient>, guard_size: usize) -> Self {
        Self {
            client,
            guard: Mutex::new(DispatchGuard::new(guard_size)),
        }
    }

    fn guard(&self) -> MutexGuard<'_, DispatchGuard> {
        self.guard
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

#[async_trait]
impl FundDispatch for FundDispatcher {
    /// Validate, then transfer.
    ///
    /// Nothing reaches the client if the payee, amount or memo is invalid,
    /// or if this wallet already dispatched.
    async fn dispatch(&self, request: DispatchRequest) -> Result<SettlementReference> {
        let wallet_id = request.handle.wallet_id;
        let destination = Address::parse(&request.payee_address)?;
        if request.amount <= Decimal::ZERO {
            return Err(SplitvaultError::InvalidAmount {
                amount: request.amount,
                reason: "dispatch amount must be positive".to_string(),
            });
        }
        let memo = settlement_memo(
            wallet_id,
            request.external_order_id.as_deref(),
            &request.bill_reference,
        )?;
        self.guard().check(wallet_id)?;

        let transfer = TransferRequest {
            source: request.handle.address,
            secret: request.handle.secret,
            destination,
            amount: request.amount,
            currency: request.currency,
            memo,
            idempotency_key: request.idempotency_key,
        };

        match self.client.transfer(&transfer).await {
            Ok(signature) => {
                let reference = SettlementReference::new(signature);
                self.guard().record(wallet_id, reference.clone())?;
                tracing::info!(
                    wallet = %wallet_id,
                    destination = %transfer.destination,
                    amount = %transfer.amount,
                    reference = reference.as_str(),
                    key = transfer.idempotency_key.as_str(),
                    "Funds dispatched"
                );
                Ok(reference)
            }
            Err(error) => {
                tracing::warn!(wallet = %wallet_id, %error, "Transfer client failed");
                Err(SplitvaultError::DispatchFailure {
                    reason: error.to_string(),
                })
            }
        }
    }

    fn completed_reference(&self, wallet: WalletId) -> Option<SettlementReference> {
        self.guard().reference_for(&wallet).cloned()
    }
}

//! Wallet creation and cleanup.
//!
//! A wallet is created when a bill is locked into group collection. It is
//! closed only by [`WalletLifecycle::close_wallet`], which also revokes the
//! sealed signing secret and is refused while a dispatch is in flight.

use std::sync::Arc;

use chrono::Utc;
use rust_decimal::Decimal;
use sha2::{Digest, Sha256};
use splitvault_types::{
    Address, Participant, ParticipantStatus, PaymentStatus, Result, SettlementConfig,
    SettlementMetadata, SharingMode, SplitPolicy, SplitvaultError, UserId, Wallet, WalletId,
    WalletStatus, constants,
};

use crate::{
    key_vault::{KeyVault, SigningSecret},
    store::{WalletRecord, WalletStore, mutate},
};

/// A freshly provisioned custodial account.
#[derive(Debug, Clone)]
pub struct CustodialAccount {
    pub address: Address,
    pub secret: SigningSecret,
}

impl CustodialAccount {
    /// Random account for simulation and tests. Production accounts are
    /// provisioned by the chain client.
    #[must_use]
    pub fn generate() -> Self {
        let seed: [u8; 32] = rand::random();
        let digest = Sha256::new()
            .chain_update(b"splitvault:sim-account")
            .chain_update(seed)
            .finalize();
        let mut public = [0u8; 32];
        public.copy_from_slice(&digest);
        Self {
            address: Address::from_key_bytes(&public),
            secret: SigningSecret::new(seed.to_vec()),
        }
    }
}

/// Parameters for a new wallet.
#[derive(Debug, Clone)]
pub struct CreateWallet {
    pub bill_reference: String,
    pub creator: UserId,
    pub creator_name: String,
    pub sharing_mode: SharingMode,
    pub currency: String,
    pub total_owed: Decimal,
    pub payee_address: Option<String>,
    pub external_order_id: Option<String>,
    /// Defaults to the configured threshold.
    pub threshold_fraction: Option<Decimal>,
    pub participants: Vec<Participant>,
}

pub struct WalletLifecycle {
    store: Arc<dyn WalletStore>,
    vault: Arc<KeyVault>,
    settlement: SettlementConfig,
}

impl WalletLifecycle {
    #[must_use]
    pub fn new(store: Arc<dyn WalletStore>, vault: Arc<KeyVault>, settlement: SettlementConfig) -> Self {
        Self {
            store,
            vault,
            settlement,
        }
    }

    /// Create and persist a wallet, sealing `account.secret` for it.
    ///
    /// The creator is always an accepted participant. Duplicate user ids in
    /// `request.participants` are merged.
    ///
    /// # Errors
    /// Validation errors for the amount, currency, payee or threshold.
    pub async fn create_wallet(
        &self,
        request: CreateWallet,
        account: CustodialAccount,
    ) -> Result<WalletRecord> {
        if request.total_owed <= Decimal::ZERO {
            return Err(SplitvaultError::InvalidAmount {
                amount: request.total_owed,
                reason: "total owed must be positive".to_string(),
            });
        }
        if request.currency.trim().is_empty() {
            return Err(SplitvaultError::Configuration(
                "wallet currency is empty".to_string(),
            ));
        }
        let settlement = SettlementMetadata::new(
            request.payee_address.as_deref(),
            request.external_order_id.clone(),
            request
                .threshold_fraction
                .unwrap_or(self.settlement.default_threshold_fraction),
        )?;

        let now = Utc::now();
        let mut participants: Vec<Participant> = Vec::with_capacity(request.participants.len() + 1);
        let mut creator = Participant::new(request.creator, request.creator_name.clone())
            .with_status(ParticipantStatus::Accepted);
        creator.joined_at = Some(now);
        participants.push(creator);
        for incoming in request.participants {
            if let Some(existing) = participants.iter_mut().find(|p| p.user_id == incoming.user_id) {
                existing.merge_from(incoming);
            } else {
                let mut fresh = incoming;
                fresh.amount_contributed = Decimal::ZERO;
                fresh.history.clear();
                participants.push(fresh);
            }
        }

        let mut wallet = Wallet {
            id: WalletId::new(),
            bill_reference: request.bill_reference,
            address: account.address,
            creator: request.creator,
            sharing_mode: request.sharing_mode,
            split_policy: SplitPolicy::Equal,
            encrypted_secret: None,
            key_salt: (0..constants::WALLET_SALT_BYTES)
                .map(|_| rand::random::<u8>())
                .collect(),
            currency: request.currency,
            total_owed: request.total_owed,
            balance: Decimal::ZERO,
            status: WalletStatus::Active,
            participants,
            created_at: now,
            updated_at: now,
        };
        wallet.recompute_equal_shares();
        wallet.check_share_invariant()?;

        let ctx = self.vault.issue_context(wallet.creator, &wallet)?;
        wallet.encrypted_secret = Some(self.vault.encrypt(&wallet, &account.secret, &ctx)?);

        let record = self.store.create(wallet, settlement).await?;
        tracing::info!(
            wallet = %record.wallet.id,
            bill = %record.wallet.bill_reference,
            mode = %record.settlement.mode,
            participants = record.wallet.participants.len(),
            total_owed = %record.wallet.total_owed,
            "Wallet created"
        );
        Ok(record)
    }

    /// Close a wallet and revoke its sealed secret.
    ///
    /// Closing an already closed wallet is a no-op.
    ///
    /// # Errors
    /// [`SplitvaultError::CleanupRefused`] while a dispatch is in flight.
    pub async fn close_wallet(&self, wallet_id: WalletId) -> Result<WalletRecord> {
        let now = Utc::now();
        let (record, ()) = mutate(self.store.as_ref(), wallet_id, |record| {
            if record.settlement.payment_status == PaymentStatus::Processing {
                return Err(SplitvaultError::CleanupRefused {
                    wallet: wallet_id,
                    status: record.settlement.payment_status,
                });
            }
            record.wallet.status = WalletStatus::Closed;
            record.wallet.encrypted_secret = None;
            record.wallet.touch(now);
            Ok(())
        })
        .await
        .inspect_err(|error| {
            if matches!(error, SplitvaultError::CleanupRefused { .. }) {
                tracing::warn!(wallet = %wallet_id, "Cleanup refused: dispatch in flight");
            }
        })?;
        self.vault.revoke(wallet_id);
        tracing::info!(wallet = %wallet_id, payment_status = %record.settlement.payment_status, "Wallet closed");
        Ok(record)
    }

    /// Re-seal a legacy secret under the current KDF version.
    ///
    /// Returns `true` if the record was rewritten.
    pub async fn rewrap_secret(&self, wallet_id: WalletId) -> Result<bool> {
        let vault = self.vault.clone();
        let (_, rewrapped) = mutate(self.store.as_ref(), wallet_id, move |record| {
            let ctx = vault.issue_context(record.wallet.creator, &record.wallet)?;
            match vault.rewrap(&record.wallet, &ctx)? {
                Some(sealed) => {
                    record.wallet.encrypted_secret = Some(sealed);
                    Ok(true)
                }
                None => Ok(false),
            }
        })
        .await?;
        Ok(rewrapped)
    }
}

//! # splitvault-custody
//!
//! **Custody plane**: everything that owns wallet state before money moves.
//!
//! - [`WalletStore`]: persistence with a single versioned check-and-set
//!   primitive ([`store::mutate`])
//! - [`KeyVault`]: sealed signing secrets, versioned key derivation,
//!   participant-scoped access
//! - [`ParticipantLedger`]: membership, shares, contributions, thresholds
//! - [`RiskGate`]: fail-open pre-settlement scoring
//! - [`WalletLifecycle`]: wallet creation and cleanup
//!
//! The settlement crate depends on the [`SecretProvider`] and
//! [`RiskAssessor`] traits rather than on the concrete types here.

pub mod kdf;
pub mod key_vault;
pub mod ledger;
pub mod lifecycle;
pub mod risk_gate;
pub mod secret_cache;
pub mod store;

pub use kdf::{AccessKey, MasterKey};
pub use key_vault::{AccessContext, AccessPolicy, KeyVault, SecretProvider, SigningSecret};
pub use ledger::{ContributionReceipt, ParticipantLedger, lock_membership};
pub use lifecycle::{CreateWallet, CustodialAccount, WalletLifecycle};
pub use risk_gate::{
    DecisionSource, GateUnavailable, RiskAssessor, RiskBackend, RiskContext, RiskDecision,
    RiskGate,
};
pub use secret_cache::{SecretCache, TtlSecretCache};
pub use store::{MemoryWalletStore, WalletRecord, WalletStore};

//! # splitvault-types
//!
//! Shared types, errors, and configuration for the **SplitVault** custodial
//! group-wallet settlement engine.
//!
//! This crate is the leaf dependency of the workspace; every other crate
//! depends on it. It defines:
//!
//! - **Identifiers**: [`WalletId`], [`UserId`], [`SettlementReference`], [`IdempotencyKey`]
//! - **Addresses**: [`Address`] (base58 32-byte account keys)
//! - **Wallet model**: [`Wallet`], [`WalletStatus`], [`SharingMode`], [`SplitPolicy`], [`EncryptedSecret`], [`KdfVersion`]
//! - **Participant model**: [`Participant`], [`ParticipantStatus`], [`Contribution`]
//! - **Settlement model**: [`SettlementMetadata`], [`PaymentStatus`], [`PaymentMode`], [`DeliveryStatus`]
//! - **Mode resolution**: [`resolve_mode`], [`has_malformed_payee`]
//! - **Notifications**: [`NotificationPayload`]
//! - **Configuration**: [`SplitvaultConfig`] and its sections
//! - **Errors**: [`SplitvaultError`] with `SV_ERR_` prefix codes
//! - **Constants**: system-wide limits and defaults

pub mod address;
pub mod config;
pub mod constants;
pub mod error;
pub mod ids;
pub mod mode;
pub mod notification;
pub mod participant;
pub mod settlement;
pub mod wallet;

// Re-export all primary types at crate root:
//   use splitvault_types::{Wallet, Participant, SettlementMetadata, ...};

pub use address::*;
pub use config::*;
pub use error::*;
pub use ids::*;
pub use mode::*;
pub use notification::*;
pub use participant::*;
pub use settlement::*;
pub use wallet::*;

// Constants are accessed via `splitvault_types::constants::FOO`.

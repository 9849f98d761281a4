//! # splitvault-settlement
//!
//! **Finality plane**: turns a funded wallet into a completed settlement.
//!
//! ## Architecture
//!
//! The [`SettlementEngine`] is invoked after every contribution and:
//! 1. Short-circuits wallets already `paid`, `refunded` or `processing`
//! 2. Resolves the payment mode from the payee address
//! 3. Claims the wallet with a single versioned write (`→ processing`)
//! 4. Consults the risk gate (forwarding only)
//! 5. Hands the transfer to the [`FundDispatcher`], guarded by the
//!    [`DispatchGuard`] so a wallet never moves funds twice
//! 6. Records `paid`/`failed` and schedules the [`WebhookNotifier`]
//!
//! Self-settling wallets stop after step 3: funds stay in custody and the
//! dispatcher is never invoked.

pub mod dispatch_guard;
pub mod dispatcher;
pub mod engine;
pub mod notifier;

pub use dispatch_guard::DispatchGuard;
pub use dispatcher::{
    DispatchRequest, FundDispatch, FundDispatcher, TransferClient, TransferError, TransferRequest,
    WalletHandle, settlement_memo,
};
pub use engine::{SettlementEngine, SettlementOutcome};
pub use notifier::{SettlementNotifier, WebhookNotifier};

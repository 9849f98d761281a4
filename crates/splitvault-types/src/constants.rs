//! System-wide constants for the SplitVault settlement engine.

/// Decimal places kept for owed shares and contributions.
pub const AMOUNT_SCALE: u32 = 6;

/// Maximum allowed drift between `Σ share_owed` and `total_owed`
/// (one unit at [`AMOUNT_SCALE`]).
pub const SHARE_SUM_EPSILON_UNITS: i64 = 1;

/// Default settlement threshold, as a fraction of total owed (100%).
pub const DEFAULT_THRESHOLD_FRACTION_PERCENT: i64 = 100;

/// Default bound on settlement dispatch attempts per wallet.
pub const DEFAULT_MAX_SETTLEMENT_ATTEMPTS: u32 = 3;

/// Default TTL for a decrypted signing secret held in memory (5 minutes).
pub const DEFAULT_SECRET_CACHE_TTL_MS: u64 = 5 * 60 * 1000;

/// Hard upper bound on the secret cache TTL. Minutes, not hours.
pub const MAX_SECRET_CACHE_TTL_MS: u64 = 30 * 60 * 1000;

/// Risk score above which a settlement is denied.
pub const DEFAULT_RISK_DENY_CEILING: u8 = 85;

/// Amount at which the magnitude component of the risk score reaches half
/// of its range.
pub const DEFAULT_RISK_AMOUNT_HALF_POINT: i64 = 1_000;

/// Per-call timeout for the optional risk backend, in milliseconds.
pub const DEFAULT_RISK_BACKEND_TIMEOUT_MS: u64 = 2_000;

/// Webhook delivery attempts before giving up.
pub const DEFAULT_WEBHOOK_MAX_ATTEMPTS: u32 = 3;

/// First webhook retry delay; doubles on every subsequent retry.
pub const DEFAULT_WEBHOOK_BASE_BACKOFF_MS: u64 = 1_000;

/// Per-attempt webhook timeout.
pub const DEFAULT_WEBHOOK_ATTEMPT_TIMEOUT_MS: u64 = 10_000;

/// Maximum memo length accepted by the transfer client, in bytes.
pub const MAX_MEMO_BYTES: usize = 256;

/// Raw length of a custodial account public key.
pub const ADDRESS_BYTES: usize = 32;

/// Number of wallets the dispatch guard remembers before evicting the oldest.
pub const DISPATCH_GUARD_CACHE_SIZE: usize = 100_000;

/// Re-reads a store mutation performs after losing a version race.
pub const MAX_STORE_CAS_RETRIES: usize = 16;

/// Writes attempted to record a completed dispatch as `paid`.
pub const FINALIZE_WRITE_ATTEMPTS: u32 = 3;

/// First backoff between those writes, doubled per attempt.
pub const FINALIZE_RETRY_BACKOFF_MS: u64 = 50;

/// Random salt length for per-wallet key derivation.
pub const WALLET_SALT_BYTES: usize = 32;

/// Version string.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Engine name.
pub const ENGINE_NAME: &str = "SplitVault";

//! Versioned HMAC-SHA256 key derivation.
//!
//! Two things are derived from the vault master key:
//!
//! - **wallet keys**, which encrypt a wallet's signing secret, and
//! - **access keys**, which prove that a caller's identity was issued a
//!   credential for a given wallet salt.
//!
//! Both are single HMAC invocations. Inputs are a high-entropy master key
//! and random per-wallet salts, so no work factor is applied.

use hmac::{Hmac, Mac};
use sha2::Sha256;
use splitvault_types::{KdfVersion, SplitvaultError, UserId, WalletId};

type HmacSha256 = Hmac<Sha256>;

const WALLET_KEY_DOMAIN_V2: &[u8] = b"splitvault:wallet-key:v2";
const ACCESS_KEY_DOMAIN: &[u8] = b"splitvault:access-key:v1";

/// 32-byte vault master key.
#[derive(Clone)]
pub struct MasterKey([u8; 32]);

impl MasterKey {
    #[must_use]
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Parse a 64-character hex string.
    ///
    /// # Errors
    /// [`SplitvaultError::Configuration`] for bad hex or wrong length.
    pub fn from_hex(encoded: &str) -> splitvault_types::Result<Self> {
        let bytes = hex::decode(encoded.trim()).map_err(|error| {
            SplitvaultError::Configuration(format!("master key is not hex: {error}"))
        })?;
        let bytes: [u8; 32] = bytes.try_into().map_err(|bytes: Vec<u8>| {
            SplitvaultError::Configuration(format!(
                "master key must be 32 bytes, got {}",
                bytes.len()
            ))
        })?;
        Ok(Self(bytes))
    }

    #[must_use]
    pub fn generate() -> Self {
        Self(rand::random())
    }

    fn mac(&self) -> splitvault_types::Result<HmacSha256> {
        HmacSha256::new_from_slice(&self.0)
            .map_err(|error| SplitvaultError::Internal(format!("hmac init: {error}")))
    }
}

impl std::fmt::Debug for MasterKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("MasterKey(..)")
    }
}

/// Per-identity access credential for one wallet.
#[derive(Clone, PartialEq, Eq)]
pub struct AccessKey([u8; 32]);

impl AccessKey {
    #[must_use]
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    #[must_use]
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl std::fmt::Debug for AccessKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("AccessKey(..)")
    }
}

/// Derive the symmetric key protecting a wallet's signing secret.
///
/// # Errors
/// [`SplitvaultError::Internal`] if the MAC cannot be keyed.
pub fn derive_wallet_key(
    master: &MasterKey,
    version: KdfVersion,
    wallet_id: WalletId,
    salt: &[u8],
) -> splitvault_types::Result<[u8; 32]> {
    let mut mac = master.mac()?;
    match version {
        KdfVersion::V1 => mac.update(salt),
        KdfVersion::V2 => {
            mac.update(WALLET_KEY_DOMAIN_V2);
            mac.update(wallet_id.as_bytes());
            mac.update(salt);
        }
    }
    Ok(finalize(mac))
}

fn finalize(mac: HmacSha256) -> [u8; 32] {
    let mut out = [0u8; 32];
    out.copy_from_slice(&mac.finalize().into_bytes());
    out
}

fn access_mac(
    master: &MasterKey,
    identity: UserId,
    salt: &[u8],
) -> splitvault_types::Result<HmacSha256> {
    let mut mac = master.mac()?;
    mac.update(ACCESS_KEY_DOMAIN);
    mac.update(salt);
    mac.update(identity.0.as_bytes());
    Ok(mac)
}

/// `HMAC(master, domain || salt || identity)`.
///
/// # Errors
/// [`SplitvaultError::Internal`] if the MAC cannot be keyed.
pub fn derive_access_key(
    master: &MasterKey,
    identity: UserId,
    salt: &[u8],
) -> splitvault_types::Result<AccessKey> {
    let mac = access_mac(master, identity, salt)?;
    Ok(AccessKey(finalize(mac)))
}

/// Constant-time check that `key` was derived for `identity` and `salt`.
#[must_use]
pub fn verify_access_key(
    master: &MasterKey,
    identity: UserId,
    salt: &[u8],
    key: &AccessKey,
) -> bool {
    access_mac(master, identity, salt).is_ok_and(|mac| mac.verify_slice(&key.0).is_ok())
}

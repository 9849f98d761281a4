//! Key Vault: custody of each wallet's signing secret.
//!
//! Secrets are sealed with ChaCha20-Poly1305 under a per-wallet key from
//! [`crate::kdf`]. The associated data binds the ciphertext to its wallet id
//! and KDF version, so a record copied onto another wallet fails to open.
//!
//! ## Access
//!
//! Every `encrypt`/`decrypt` carries an [`AccessContext`]: the caller's
//! identity plus an access key issued for that identity and the wallet's
//! salt. Both checks must pass:
//!
//! 1. the identity is allowed by the wallet's [`AccessPolicy`], and
//! 2. the access key verifies for that identity.
//!
//! Failing either is [`SplitvaultError::AccessDenied`]. A record that fails
//! authentication is [`SplitvaultError::IntegrityFailure`].

use std::sync::Arc;

use chacha20poly1305::{
    ChaCha20Poly1305, KeyInit, Nonce,
    aead::{Aead, Payload},
};
use sha2::{Digest, Sha256};
use splitvault_types::{
    EncryptedSecret, KdfVersion, ParticipantStatus, Result, SharingMode, SplitvaultError, UserId,
    VaultConfig, Wallet, WalletId,
};

use crate::{
    kdf::{self, AccessKey, MasterKey},
    secret_cache::SecretCache,
};

const TAG_LEN: usize = 16;

/// Plaintext signing secret. Debug output is redacted.
#[derive(Clone, PartialEq, Eq)]
pub struct SigningSecret(Vec<u8>);

impl SigningSecret {
    #[must_use]
    pub fn new(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }

    #[must_use]
    pub fn expose(&self) -> &[u8] {
        &self.0
    }
}

impl std::fmt::Debug for SigningSecret {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "SigningSecret({} bytes)", self.0.len())
    }
}

/// Who is asking, and the credential they were issued.
#[derive(Debug, Clone)]
pub struct AccessContext {
    pub identity: UserId,
    pub key: AccessKey,
}

/// Identities allowed to open a wallet's secret.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AccessPolicy {
    CreatorOnly { creator: UserId },
    AnyParticipant { creator: UserId, members: Vec<UserId> },
}

impl AccessPolicy {
    #[must_use]
    pub fn for_wallet(wallet: &Wallet) -> Self {
        match wallet.sharing_mode {
            SharingMode::CreatorOnly => Self::CreatorOnly {
                creator: wallet.creator,
            },
            SharingMode::AnyParticipant => Self::AnyParticipant {
                creator: wallet.creator,
                members: wallet
                    .participants
                    .iter()
                    .filter(|p| {
                        matches!(
                            p.status,
                            ParticipantStatus::Accepted
                                | ParticipantStatus::Paid
                                | ParticipantStatus::Locked
                        )
                    })
                    .map(|p| p.user_id)
                    .collect(),
            },
        }
    }

    #[must_use]
    pub fn permits(&self, identity: UserId) -> bool {
        match self {
            Self::CreatorOnly { creator } => *creator == identity,
            Self::AnyParticipant { creator, members } => {
                *creator == identity || members.contains(&identity)
            }
        }
    }
}

/// What the settlement side needs from custody.
pub trait SecretProvider: Send + Sync {
    /// Open the wallet's secret on behalf of its creator.
    fn unlock_for_settlement(&self, wallet: &Wallet) -> Result<SigningSecret>;
}

pub struct KeyVault {
    master: MasterKey,
    cache: Arc<dyn SecretCache>,
    current_version: KdfVersion,
}

impl KeyVault {
    #[must_use]
    pub fn new(master: MasterKey, cache: Arc<dyn SecretCache>, config: &VaultConfig) -> Self {
        Self {
            master,
            cache,
            current_version: config.current_kdf_version,
        }
    }

    #[must_use]
    pub fn current_version(&self) -> KdfVersion {
        self.current_version
    }

    /// Versioned HMAC derivation; see [`kdf::derive_access_key`].
    pub fn derive_access_key(&self, identity: UserId, wallet_salt: &[u8]) -> Result<AccessKey> {
        kdf::derive_access_key(&self.master, identity, wallet_salt)
    }

    /// Build a context for `identity` on `wallet`.
    ///
    /// Issuing does not authorize: the policy is checked on use.
    pub fn issue_context(&self, identity: UserId, wallet: &Wallet) -> Result<AccessContext> {
        Ok(AccessContext {
            identity,
            key: self.derive_access_key(identity, &wallet.key_salt)?,
        })
    }

    /// Seal `secret` for `wallet` under the current KDF version.
    ///
    /// The caller stores the returned record on the wallet; any cached
    /// plaintext for the wallet is dropped.
    ///
    /// # Errors
    /// [`SplitvaultError::AccessDenied`] if `ctx` may not use this wallet.
    pub fn encrypt(
        &self,
        wallet: &Wallet,
        secret: &SigningSecret,
        ctx: &AccessContext,
    ) -> Result<EncryptedSecret> {
        self.authorize(wallet, ctx)?;
        let record = self.seal(wallet, secret, self.current_version)?;
        self.cache.invalidate(wallet.id);
        tracing::info!(
            wallet = %wallet.id,
            kdf_version = record.kdf_version.as_u16(),
            "Sealed wallet secret"
        );
        Ok(record)
    }

    /// Open the wallet's stored secret.
    ///
    /// # Errors
    /// - [`SplitvaultError::AccessDenied`] for an unauthorized context
    /// - [`SplitvaultError::SecretRevoked`] once the wallet was cleaned up
    /// - [`SplitvaultError::IntegrityFailure`] for a tampered record
    pub fn decrypt(&self, wallet: &Wallet, ctx: &AccessContext) -> Result<SigningSecret> {
        self.authorize(wallet, ctx)?;
        let record = wallet
            .encrypted_secret
            .as_ref()
            .ok_or(SplitvaultError::SecretRevoked(wallet.id))?;

        let digest = record_digest(record);
        if let Some(hit) = self.cache.get(wallet.id, &digest) {
            return Ok(hit);
        }
        let secret = self.open(wallet, record)?;
        self.cache.put(wallet.id, digest, secret.clone());
        Ok(secret)
    }

    /// Re-seal a legacy record under the current KDF version.
    ///
    /// Returns `None` when the record is already current.
    pub fn rewrap(&self, wallet: &Wallet, ctx: &AccessContext) -> Result<Option<EncryptedSecret>> {
        let Some(record) = wallet.encrypted_secret.as_ref() else {
            return Err(SplitvaultError::SecretRevoked(wallet.id));
        };
        if record.kdf_version == self.current_version {
            return Ok(None);
        }
        let secret = self.decrypt(wallet, ctx)?;
        let from = record.kdf_version;
        let rewrapped = self.seal(wallet, &secret, self.current_version)?;
        self.cache.invalidate(wallet.id);
        tracing::info!(
            wallet = %wallet.id,
            from = from.as_u16(),
            to = rewrapped.kdf_version.as_u16(),
            "Rewrapped wallet secret"
        );
        Ok(Some(rewrapped))
    }

    /// Forget any cached plaintext for `wallet`.
    pub fn revoke(&self, wallet: WalletId) {
        self.cache.invalidate(wallet);
    }

    fn authorize(&self, wallet: &Wallet, ctx: &AccessContext) -> Result<()> {
        let allowed = AccessPolicy::for_wallet(wallet).permits(ctx.identity)
            && kdf::verify_access_key(&self.master, ctx.identity, &wallet.key_salt, &ctx.key);
        if allowed {
            Ok(())
        } else {
            tracing::warn!(
                wallet = %wallet.id,
                identity = %ctx.identity,
                "Key vault access denied"
            );
            Err(SplitvaultError::AccessDenied {
                identity: ctx.identity,
                wallet: wallet.id,
            })
        }
    }

    fn cipher(&self, wallet: &Wallet, version: KdfVersion) -> Result<ChaCha20Poly1305> {
        let key = kdf::derive_wallet_key(&self.master, version, wallet.id, &wallet.key_salt)?;
        ChaCha20Poly1305::new_from_slice(&key)
            .map_err(|error| SplitvaultError::Internal(format!("cipher init: {error}")))
    }

    fn seal(
        &self,
        wallet: &Wallet,
        secret: &SigningSecret,
        version: KdfVersion,
    ) -> Result<EncryptedSecret> {
        let iv: [u8; 12] = rand::random();
        let aad = associated_data(wallet.id, version);
        let mut sealed = self
            .cipher(wallet, version)?
            .encrypt(
                Nonce::from_slice(&iv),
                Payload {
                    msg: secret.expose(),
                    aad: &aad,
                },
            )
            .map_err(|error| SplitvaultError::Internal(format!("seal failed: {error}")))?;

        let split = sealed.len().checked_sub(TAG_LEN).ok_or_else(|| {
            SplitvaultError::Internal("sealed output shorter than tag".to_string())
        })?;
        let mut mac = [0u8; TAG_LEN];
        mac.copy_from_slice(&sealed[split..]);
        sealed.truncate(split);

        Ok(EncryptedSecret {
            ciphertext: sealed,
            iv,
            mac,
            kdf_version: version,
        })
    }

    fn open(&self, wallet: &Wallet, record: &EncryptedSecret) -> Result<SigningSecret> {
        let aad = associated_data(wallet.id, record.kdf_version);
        let mut sealed = Vec::with_capacity(record.ciphertext.len() + TAG_LEN);
        sealed.extend_from_slice(&record.ciphertext);
        sealed.extend_from_slice(&record.mac);

        let plain = self
            .cipher(wallet, record.kdf_version)?
            .decrypt(
                Nonce::from_slice(&record.iv),
                Payload {
                    msg: &sealed,
                    aad: &aad,
                },
            )
            .map_err(|_| {
                tracing::warn!(wallet = %wallet.id, "Wallet secret failed authentication");
                SplitvaultError::IntegrityFailure {
                    reason: format!("record for {} failed authentication", wallet.id),
                }
            })?;
        Ok(SigningSecret::new(plain))
    }
}

impl SecretProvider for KeyVault {
    fn unlock_for_settlement(&self, wallet: &Wallet) -> Result<SigningSecret> {
        let ctx = self.issue_context(wallet.creator, wallet)?;
        self.decrypt(wallet, &ctx)
    }
}

/// SHA-256 over every field of the sealed record.
fn record_digest(record: &EncryptedSecret) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(record.kdf_version.as_u16().to_be_bytes());
    hasher.update(record.iv);
    hasher.update(record.mac);
    hasher.update((record.ciphertext.len() as u64).to_be_bytes());
    hasher.update(&record.ciphertext);
    let mut out = [0u8; 32];
    out.copy_from_slice(&hasher.finalize());
    out
}

fn associated_data(wallet: WalletId, version: KdfVersion) -> Vec<u8> {
    let mut aad = Vec::with_capacity(18);
    aad.extend_from_slice(wallet.as_bytes());
    aad.extend_from_slice(&version.as_u16().to_be_bytes());
    aad
}

//! Custodial / payee account addresses.
//!
//! An address is the base58 encoding of a 32-byte account public key.
//! Construction goes through [`Address::parse`], so holding an `Address`
//! means the format has already been checked.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::{SplitvaultError, constants};

/// A validated account address.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Address(String);

impl Address {
    /// Parse and validate a base58 account address.
    ///
    /// # Errors
    /// Returns [`SplitvaultError::InvalidAddress`] if the string is empty,
    /// not base58, or does not decode to exactly 32 bytes.
    pub fn parse(raw: &str) -> crate::Result<Self> {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return Err(SplitvaultError::InvalidAddress {
                address: raw.to_string(),
                reason: "address is empty".to_string(),
            });
        }
        let bytes = bs58::decode(trimmed)
            .into_vec()
            .map_err(|error| SplitvaultError::InvalidAddress {
                address: raw.to_string(),
                reason: format!("not base58: {error}"),
            })?;
        if bytes.len() != constants::ADDRESS_BYTES {
            return Err(SplitvaultError::InvalidAddress {
                address: raw.to_string(),
                reason: format!(
                    "decodes to {} bytes, expected {}",
                    bytes.len(),
                    constants::ADDRESS_BYTES
                ),
            });
        }
        Ok(Self(trimmed.to_string()))
    }

    /// Returns `true` if `raw` would parse.
    #[must_use]
    pub fn is_valid(raw: &str) -> bool {
        Self::parse(raw).is_ok()
    }

    /// Build an address from raw key bytes.
    #[must_use]
    pub fn from_key_bytes(bytes: &[u8; constants::ADDRESS_BYTES]) -> Self {
        Self(bs58::encode(bytes).into_string())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for Address {
    type Error = SplitvaultError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<Address> for String {
    fn from(value: Address) -> Self {
        value.0
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Random address for tests. **Never use in production.**
#[cfg(any(test, feature = "test-helpers"))]
impl Address {
    pub fn dummy() -> Self {
        Self::from_key_bytes(&rand::random::<[u8; 32]>())
    }
}

//! Configuration types for the SplitVault engine.
//!
//! Every field has a default from [`crate::constants`]. Binaries overlay
//! `SPLITVAULT_*` environment variables with [`SplitvaultConfig::from_env`].

use std::{collections::HashMap, env, str::FromStr, time::Duration};

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::{KdfVersion, SplitvaultError, constants, settlement};

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SplitvaultConfig {
    pub settlement: SettlementConfig,
    pub vault: VaultConfig,
    pub risk: RiskGateConfig,
    pub webhook: WebhookConfig,
}

/// Settlement engine knobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SettlementConfig {
    /// Upper bound on dispatch attempts per wallet.
    pub max_attempts: u32,
    /// Threshold used when a wallet is created without one.
    pub default_threshold_fraction: Decimal,
}

impl Default for SettlementConfig {
    fn default() -> Self {
        Self {
            max_attempts: constants::DEFAULT_MAX_SETTLEMENT_ATTEMPTS,
            default_threshold_fraction: settlement::default_threshold_fraction(),
        }
    }
}

/// Key vault knobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VaultConfig {
    /// TTL for decrypted secrets held in memory.
    pub secret_cache_ttl_ms: u64,
    /// Version used for newly encrypted records.
    pub current_kdf_version: KdfVersion,
}

impl VaultConfig {
    #[must_use]
    pub fn secret_cache_ttl(&self) -> Duration {
        Duration::from_millis(self.secret_cache_ttl_ms)
    }
}

impl Default for VaultConfig {
    fn default() -> Self {
        Self {
            secret_cache_ttl_ms: constants::DEFAULT_SECRET_CACHE_TTL_MS,
            current_kdf_version: KdfVersion::CURRENT,
        }
    }
}

/// Risk gate knobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RiskGateConfig {
    /// When `false` the gate always allows with score 0.
    pub enabled: bool,
    /// Scores strictly above this are denied.
    pub deny_ceiling: u8,
    /// Amount at which the magnitude component reaches half its range.
    pub amount_half_point: Decimal,
    /// Per-call bound on the optional risk backend.
    pub backend_timeout_ms: u64,
}

impl RiskGateConfig {
    #[must_use]
    pub fn backend_timeout(&self) -> Duration {
        Duration::from_millis(self.backend_timeout_ms)
    }

    /// A gate that never scores.
    #[must_use]
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            ..Self::default()
        }
    }
}

impl Default for RiskGateConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            deny_ceiling: constants::DEFAULT_RISK_DENY_CEILING,
            amount_half_point: Decimal::new(constants::DEFAULT_RISK_AMOUNT_HALF_POINT, 0),
            backend_timeout_ms: constants::DEFAULT_RISK_BACKEND_TIMEOUT_MS,
        }
    }
}

/// Webhook delivery knobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookConfig {
    /// Total attempts, including the first.
    pub max_attempts: u32,
    /// Delay before the first retry; doubled for each further retry.
    pub base_backoff_ms: u64,
    /// Per-attempt timeout.
    pub attempt_timeout_ms: u64,
    /// Endpoint URL. No notification is sent when unset.
    pub endpoint: Option<String>,
    /// Bearer token for the endpoint.
    #[serde(skip_serializing)]
    pub auth_token: Option<String>,
}

impl WebhookConfig {
    /// Delay before retry number `retry` (1-based): `base * 2^(retry-1)`.
    #[must_use]
    pub fn backoff_for(&self, retry: u32) -> Duration {
        let factor = 1u64 << retry.saturating_sub(1).min(16);
        Duration::from_millis(self.base_backoff_ms.saturating_mul(factor))
    }

    #[must_use]
    pub fn attempt_timeout(&self) -> Duration {
        Duration::from_millis(self.attempt_timeout_ms)
    }
}

impl Default for WebhookConfig {
    fn default() -> Self {
        Self {
            max_attempts: constants::DEFAULT_WEBHOOK_MAX_ATTEMPTS,
            base_backoff_ms: constants::DEFAULT_WEBHOOK_BASE_BACKOFF_MS,
            attempt_timeout_ms: constants::DEFAULT_WEBHOOK_ATTEMPT_TIMEOUT_MS,
            endpoint: None,
            auth_token: None,
        }
    }
}

impl SplitvaultConfig {
    /// Defaults overlaid with `SPLITVAULT_*` environment variables.
    ///
    /// # Errors
    /// [`SplitvaultError::Configuration`] for unparsable or out-of-range values.
    pub fn from_env() -> crate::Result<Self> {
        let vars: HashMap<String, String> = env::vars()
            .filter(|(key, _)| key.starts_with("SPLITVAULT_"))
            .collect();
        Self::from_vars(&vars)
    }

    /// Same as [`Self::from_env`] over an explicit map.
    ///
    /// # Errors
    /// [`SplitvaultError::Configuration`] for unparsable or out-of-range values.
    pub fn from_vars(vars: &HashMap<String, String>) -> crate::Result<Self> {
        let mut cfg = Self::default();

        if let Some(v) = parse_var(vars, "SPLITVAULT_MAX_ATTEMPTS")? {
            cfg.settlement.max_attempts = v;
        }
        if let Some(v) = parse_var(vars, "SPLITVAULT_THRESHOLD_FRACTION")? {
            cfg.settlement.default_threshold_fraction = v;
        }
        if let Some(v) = parse_var(vars, "SPLITVAULT_SECRET_CACHE_TTL_MS")? {
            cfg.vault.secret_cache_ttl_ms = v;
        }
        if let Some(v) = parse_var::<u16>(vars, "SPLITVAULT_KDF_VERSION")? {
            cfg.vault.current_kdf_version = KdfVersion::from_u16(v)?;
        }
        if let Some(v) = parse_var(vars, "SPLITVAULT_RISK_ENABLED")? {
            cfg.risk.enabled = v;
        }
        if let Some(v) = parse_var(vars, "SPLITVAULT_RISK_DENY_CEILING")? {
            cfg.risk.deny_ceiling = v;
        }
        if let Some(v) = parse_var(vars, "SPLITVAULT_RISK_BACKEND_TIMEOUT_MS")? {
            cfg.risk.backend_timeout_ms = v;
        }
        if let Some(v) = parse_var(vars, "SPLITVAULT_WEBHOOK_MAX_ATTEMPTS")? {
            cfg.webhook.max_attempts = v;
        }
        if let Some(v) = parse_var(vars, "SPLITVAULT_WEBHOOK_BASE_BACKOFF_MS")? {
            cfg.webhook.base_backoff_ms = v;
        }
        if let Some(v) = parse_var(vars, "SPLITVAULT_WEBHOOK_TIMEOUT_MS")? {
            cfg.webhook.attempt_timeout_ms = v;
        }
        cfg.webhook.endpoint = non_empty(vars, "SPLITVAULT_WEBHOOK_URL");
        cfg.webhook.auth_token = non_empty(vars, "SPLITVAULT_WEBHOOK_TOKEN");

        cfg.validate()?;
        Ok(cfg)
    }

    /// # Errors
    /// [`SplitvaultError::Configuration`] describing the first bad value.
    pub fn validate(&self) -> crate::Result<()> {
        if self.settlement.max_attempts == 0 {
            return Err(SplitvaultError::Configuration(
                "settlement.max_attempts must be at least 1".to_string(),
            ));
        }
        settlement::validate_threshold(self.settlement.default_threshold_fraction).map_err(
            |_| {
                SplitvaultError::Configuration(format!(
                    "settlement.default_threshold_fraction {} not in (0, 1]",
                    self.settlement.default_threshold_fraction
                ))
            },
        )?;
        if self.vault.secret_cache_ttl_ms > constants::MAX_SECRET_CACHE_TTL_MS {
            return Err(SplitvaultError::Configuration(format!(
                "vault.secret_cache_ttl_ms {} exceeds {}",
                self.vault.secret_cache_ttl_ms,
                constants::MAX_SECRET_CACHE_TTL_MS
            )));
        }
        if self.risk.deny_ceiling > 100 {
            return Err(SplitvaultError::Configuration(format!(
                "risk.deny_ceiling {} exceeds 100",
                self.risk.deny_ceiling
            )));
        }
        if self.risk.amount_half_point <= Decimal::ZERO {
            return Err(SplitvaultError::Configuration(
                "risk.amount_half_point must be positive".to_string(),
            ));
        }
        if self.webhook.max_attempts == 0 {
            return Err(SplitvaultError::Configuration(
                "webhook.max_attempts must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

fn parse_var<T>(vars: &HashMap<String, String>, key: &str) -> crate::Result<Option<T>>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    let Some(raw) = vars.get(key).map(|v| v.trim()).filter(|v| !v.is_empty()) else {
        return Ok(None);
    };
    raw.parse::<T>()
        .map(Some)
        .map_err(|error| SplitvaultError::Configuration(format!("{key}={raw}: {error}")))
}

fn non_empty(vars: &HashMap<String, String>, key: &str) -> Option<String> {
    vars.get(key)
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vars(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect()
    }

    #[test]
    fn defaults_are_valid() {
        let cfg = SplitvaultConfig::default();
        cfg.validate().unwrap();
        assert_eq!(cfg.settlement.max_attempts, 3);
        assert_eq!(cfg.settlement.default_threshold_fraction, Decimal::ONE);
        assert_eq!(cfg.webhook.max_attempts, 3);
        assert_eq!(cfg.webhook.attempt_timeout(), Duration::from_secs(10));
        assert!(cfg.risk.enabled);
    }

    #[test]
    fn backoff_doubles() {
        let cfg = WebhookConfig::default();
        assert_eq!(cfg.backoff_for(1), Duration::from_secs(1));
        assert_eq!(cfg.backoff_for(2), Duration::from_secs(2));
        assert_eq!(cfg.backoff_for(3), Duration::from_secs(4));
    }

    #[test]
    fn env_overlay() {
        let cfg = SplitvaultConfig::from_vars(&vars(&[
            ("SPLITVAULT_MAX_ATTEMPTS", "5"),
            ("SPLITVAULT_THRESHOLD_FRACTION", "0.8"),
            ("SPLITVAULT_RISK_ENABLED", "false"),
            ("SPLITVAULT_WEBHOOK_URL", " https://hooks.example/settled "),
            ("SPLITVAULT_KDF_VERSION", "1"),
        ]))
        .unwrap();
        assert_eq!(cfg.settlement.max_attempts, 5);
        assert_eq!(cfg.settlement.default_threshold_fraction, Decimal::new(8, 1));
        assert!(!cfg.risk.enabled);
        assert_eq!(
            cfg.webhook.endpoint.as_deref(),
            Some("https://hooks.example/settled")
        );
        assert_eq!(cfg.vault.current_kdf_version, KdfVersion::V1);
    }

    #[test]
    fn bad_values_rejected() {
        let err = SplitvaultConfig::from_vars(&vars(&[("SPLITVAULT_MAX_ATTEMPTS", "many")]))
            .unwrap_err();
        assert!(matches!(err, SplitvaultError::Configuration(_)));

        let err = SplitvaultConfig::from_vars(&vars(&[("SPLITVAULT_MAX_ATTEMPTS", "0")]))
            .unwrap_err();
        assert!(format!("{err}").contains("max_attempts"));

        let err =
            SplitvaultConfig::from_vars(&vars(&[("SPLITVAULT_THRESHOLD_FRACTION", "1.5")]))
                .unwrap_err();
        assert!(format!("{err}").contains("threshold"));

        let err = SplitvaultConfig::from_vars(&vars(&[("SPLITVAULT_RISK_DENY_CEILING", "150")]))
            .unwrap_err();
        assert!(format!("{err}").contains("deny_ceiling"));
    }

    #[test]
    fn auth_token_not_serialized() {
        let mut cfg = SplitvaultConfig::default();
        cfg.webhook.auth_token = Some("s3cret".to_string());
        let json = serde_json::to_string(&cfg).unwrap();
        assert!(!json.contains("s3cret"));
    }
}

//! Risk Gate: fail-open pre-settlement authorization.
//!
//! The score is a bounded, monotonic function of amount and channel:
//!
//! ```text
//! local = channel_base + floor(70 * amount / (amount + half_point))
//! score = min(100, max(local, backend))
//! ```
//!
//! A settlement is denied only when a successfully computed score is above
//! the configured ceiling. If the optional backend errors or times out the
//! gate allows with a warning. [`RiskGate::try_assess`] exposes that failure
//! as a value; [`RiskGate::assess`] applies the fail-open policy to it.

use std::sync::Arc;

use async_trait::async_trait;
use rust_decimal::{Decimal, prelude::ToPrimitive};
use splitvault_types::{PaymentMode, RiskGateConfig, WalletId};

/// Inputs to one assessment.
#[derive(Debug, Clone)]
pub struct RiskContext {
    pub amount: Decimal,
    pub channel: PaymentMode,
    pub wallet_id: WalletId,
}

/// How a decision was reached.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecisionSource {
    Computed,
    FailOpen,
    Disabled,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RiskDecision {
    pub allow: bool,
    /// 0..=100
    pub score: u8,
    pub source: DecisionSource,
    pub reason: Option<String>,
}

impl RiskDecision {
    fn allow(score: u8, source: DecisionSource) -> Self {
        Self {
            allow: true,
            score,
            source,
            reason: None,
        }
    }
}

/// The gate's dependencies could not produce a score.
#[derive(Debug, Clone, thiserror::Error)]
pub enum GateUnavailable {
    #[error("risk backend error: {0}")]
    Backend(String),
    #[error("risk backend timed out after {0} ms")]
    Timeout(u64),
}

/// Optional external scoring service.
#[async_trait]
pub trait RiskBackend: Send + Sync {
    async fn score(&self, ctx: &RiskContext) -> Result<u8, GateUnavailable>;
}

/// What the settlement side needs from the gate.
#[async_trait]
pub trait RiskAssessor: Send + Sync {
    async fn assess(&self, ctx: &RiskContext) -> RiskDecision;
}

pub struct RiskGate {
    config: RiskGateConfig,
    backend: Option<Arc<dyn RiskBackend>>,
}

const FORWARDING_BASE: u8 = 20;
const MAGNITUDE_RANGE: u8 = 70;

impl RiskGate {
    #[must_use]
    pub fn new(config: RiskGateConfig) -> Self {
        Self {
            config,
            backend: None,
        }
    }

    #[must_use]
    pub fn with_backend(mut self, backend: Arc<dyn RiskBackend>) -> Self {
        self.backend = Some(backend);
        self
    }

    /// Channel and amount component, without the backend.
    #[must_use]
    pub fn local_score(&self, ctx: &RiskContext) -> u8 {
        let base = match ctx.channel {
            PaymentMode::SelfSettling => 0,
            PaymentMode::Forwarding => FORWARDING_BASE,
        };
        let amount = ctx.amount.max(Decimal::ZERO);
        let magnitude = if amount.is_zero() {
            0
        } else {
            self.magnitude(amount).unwrap_or(MAGNITUDE_RANGE)
        };
        base.saturating_add(magnitude).min(100)
    }

    /// `floor(70 * amount / (amount + half_point))`, or `None` when the
    /// intermediate values leave the decimal range. The curve tends to the
    /// full range for such amounts.
    fn magnitude(&self, amount: Decimal) -> Option<u8> {
        let denominator = amount.checked_add(self.config.amount_half_point)?;
        let fraction = amount.checked_div(denominator)?;
        Decimal::from(MAGNITUDE_RANGE)
            .checked_mul(fraction)?
            .floor()
            .to_u8()
    }

    /// Compute a decision, reporting backend failure instead of hiding it.
    ///
    /// # Errors
    /// [`GateUnavailable`] if the backend fails or exceeds its timeout.
    pub async fn try_assess(&self, ctx: &RiskContext) -> Result<RiskDecision, GateUnavailable> {
        if !self.config.enabled {
            return Ok(RiskDecision::allow(0, DecisionSource::Disabled));
        }
        let mut score = self.local_score(ctx);
        if let Some(backend) = &self.backend {
            let timeout = self.config.backend_timeout();
            let remote = tokio::time::timeout(timeout, backend.score(ctx))
                .await
                .map_err(|_| GateUnavailable::Timeout(self.config.backend_timeout_ms))??;
            score = score.max(remote.min(100));
        }

        if score > self.config.deny_ceiling {
            Ok(RiskDecision {
                allow: false,
                score,
                source: DecisionSource::Computed,
                reason: Some(format!(
                    "risk score {score} exceeds ceiling {}",
                    self.config.deny_ceiling
                )),
            })
        } else {
            Ok(RiskDecision::allow(score, DecisionSource::Computed))
        }
    }
}

#[async_trait]
impl RiskAssessor for RiskGate {
    /// Fail-open wrapper around [`RiskGate::try_assess`].
    async fn assess(&self, ctx: &RiskContext) -> RiskDecision {
        match self.try_assess(ctx).await {
            Ok(decision) => {
                if decision.allow {
                    tracing::debug!(wallet = %ctx.wallet_id, score = decision.score, "Risk gate allowed");
                } else {
                    tracing::warn!(
                        wallet = %ctx.wallet_id,
                        score = decision.score,
                        ceiling = self.config.deny_ceiling,
                        "Risk gate denied settlement"
                    );
                }
                decision
            }
            Err(error) => {
                tracing::warn!(
                    wallet = %ctx.wallet_id,
                    %error,
                    "Risk gate unavailable, allowing settlement"
                );
                RiskDecision {
                    allow: true,
                    score: 0,
                    source: DecisionSource::FailOpen,
                    reason: Some(error.to_string()),
                }
            }
        }
    }
}

//! Typed metering settings assembled from any [`ConfigProvider`].

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use super::provider::{ConfigProvider, ConfigProviderExt};
use super::{ConfigError, ConfigResult, ValidationErrors};
use crate::events::DEFAULT_EVENT_CAPACITY;
use crate::pricing::{DEFAULT_PROFIT_MARGIN, DEFAULT_TOKENS_PER_USD};
use crate::quota::GenerationLimits;
use crate::types::{GenerationType, Plan};

pub const DEFAULT_PREMIUM_THRESHOLD: u64 = 500_000;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TierSettings {
    /// A balance strictly above this marks the user premium.
    pub premium_threshold: u64,
    pub premium_plans: Vec<Plan>,
}

impl TierSettings {
    pub fn is_premium(&self, plan: Plan, balance: u64) -> bool {
        self.premium_plans.contains(&plan) || balance > self.premium_threshold
    }
}

impl Default for TierSettings {
    fn default() -> Self {
        Self {
            premium_threshold: DEFAULT_PREMIUM_THRESHOLD,
            premium_plans: vec![Plan::Premium, Plan::Paid],
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PricingSettings {
    pub profit_margin: Decimal,
    pub tokens_per_usd: u64,
}

impl Default for PricingSettings {
    fn default() -> Self {
        Self {
            profit_margin: DEFAULT_PROFIT_MARGIN,
            tokens_per_usd: DEFAULT_TOKENS_PER_USD,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MeteringSettings {
    pub tier: TierSettings,
    pub limits: GenerationLimits,
    pub pricing: PricingSettings,
    pub events_capacity: usize,
}

impl Default for MeteringSettings {
    fn default() -> Self {
        Self {
            tier: TierSettings::default(),
            limits: GenerationLimits::default(),
            pricing: PricingSettings::default(),
            events_capacity: DEFAULT_EVENT_CAPACITY,
        }
    }
}

impl MeteringSettings {
    /// Reads every known key, keeping the default for absent ones, then
    /// validates the result.
    pub async fn load(provider: &dyn ConfigProvider) -> ConfigResult<Self> {
        let mut settings = Self::default();

        if let Some(threshold) = provider.get_parsed("tier.premium_threshold").await? {
            settings.tier.premium_threshold = threshold;
        }
        if let Some(raw) = provider.get_raw("tier.premium_plans").await? {
            settings.tier.premium_plans = parse_plans(&raw)?;
        }

        for kind in GenerationType::ALL {
            if let Some(limit) = provider
                .get_parsed(&format!("limits.daily.{}", kind))
                .await?
            {
                settings.limits.daily.insert(kind, limit);
            }
            if let Some(limit) = provider
                .get_parsed(&format!("limits.monthly.{}", kind))
                .await?
            {
                settings.limits.monthly.insert(kind, limit);
            }
        }
        if let Some(sentinel) = provider.get_parsed("limits.paid_sentinel").await? {
            settings.limits.paid_sentinel = sentinel;
        }

        if let Some(margin) = provider.get_parsed("pricing.profit_margin").await? {
            settings.pricing.profit_margin = margin;
        }
        if let Some(rate) = provider.get_parsed("pricing.tokens_per_usd").await? {
            settings.pricing.tokens_per_usd = rate;
        }
        if let Some(capacity) = provider.get_parsed("events.capacity").await? {
            settings.events_capacity = capacity;
        }

        settings.validate()?;
        tracing::debug!(source = provider.name(), "metering settings loaded");
        Ok(settings)
    }

    pub fn validate(&self) -> ConfigResult<()> {
        let mut errors = Vec::new();

        if self.pricing.profit_margin.is_sign_negative() {
            errors.push(ConfigError::invalid(
                "pricing.profit_margin",
                "must not be negative",
            ));
        }
        if self.pricing.tokens_per_usd == 0 {
            errors.push(ConfigError::invalid(
                "pricing.tokens_per_usd",
                "must be greater than zero",
            ));
        }
        if self.events_capacity == 0 {
            errors.push(ConfigError::invalid(
                "events.capacity",
                "must be greater than zero",
            ));
        }
        for (period, caps) in [("daily", &self.limits.daily), ("monthly", &self.limits.monthly)] {
            for (kind, cap) in caps {
                if *cap > self.limits.paid_sentinel {
                    errors.push(ConfigError::invalid(
                        format!("limits.{}.{}", period, kind),
                        format!("exceeds paid sentinel {}", self.limits.paid_sentinel),
                    ));
                }
            }
        }

        match errors.len() {
            0 => Ok(()),
            1 => Err(errors.remove(0)),
            _ => Err(ConfigError::Validation(ValidationErrors(errors))),
        }
    }
}

fn parse_plans(raw: &str) -> ConfigResult<Vec<Plan>> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|label| {
            label
                .parse::<Plan>()
                .map_err(|e| ConfigError::invalid("tier.premium_plans", e.to_string()))
        })
        .collect()
}

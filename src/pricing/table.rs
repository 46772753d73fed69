//! Per-model message pricing.
//!
//! Prices can be customized via environment variables or programmatically.
//! Token costs are derived from USD at `tokens_per_usd` unless pinned.

use std::collections::HashMap;
use std::sync::LazyLock;

use rust_decimal::Decimal;
use rust_decimal::prelude::ToPrimitive;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};

use super::TokenizerKind;

pub const DEFAULT_TOKENS_PER_USD: u64 = 1_000_000;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelCost {
    pub provider: String,
    /// Flat provider cost per call in USD.
    pub cost_per_message: Decimal,
    /// Metering tokens charged per call when the caller supplies no amount.
    pub tokens_per_message: u64,
    pub tokenizer: TokenizerKind,
}

impl ModelCost {
    pub fn new(provider: impl Into<String>, cost_per_message: Decimal, tokenizer: TokenizerKind) -> Self {
        Self::with_rate(provider, cost_per_message, tokenizer, DEFAULT_TOKENS_PER_USD)
    }

    pub fn with_rate(
        provider: impl Into<String>,
        cost_per_message: Decimal,
        tokenizer: TokenizerKind,
        tokens_per_usd: u64,
    ) -> Self {
        Self {
            provider: provider.into(),
            cost_per_message,
            tokens_per_message: derive_tokens(cost_per_message, tokens_per_usd),
            tokenizer,
        }
    }

    pub fn pinned(mut self, tokens_per_message: u64) -> Self {
        self.tokens_per_message = tokens_per_message;
        self
    }
}

/// `ceil(cost_usd * tokens_per_usd)`, saturating.
pub fn derive_tokens(cost_usd: Decimal, tokens_per_usd: u64) -> u64 {
    if cost_usd <= Decimal::ZERO {
        return 0;
    }
    cost_usd
        .checked_mul(Decimal::from(tokens_per_usd))
        .and_then(|tokens| tokens.ceil().to_u64())
        .unwrap_or(u64::MAX)
}

#[derive(Debug, Clone)]
pub struct PricingTable {
    models: HashMap<String, ModelCost>,
    default: ModelCost,
    tokens_per_usd: u64,
}

impl PricingTable {
    pub fn builder() -> PricingTableBuilder {
        PricingTableBuilder::new()
    }

    /// Exact or alias match only.
    pub fn resolve(&self, model: &str) -> Option<&ModelCost> {
        let normalized = Self::normalize_model_id(model);
        self.models
            .get(&normalized)
            .or_else(|| Self::family_alias(&normalized).and_then(|id| self.models.get(id)))
    }

    /// Falls back to the default cost for unknown models.
    pub fn get(&self, model: &str) -> &ModelCost {
        self.resolve(model).unwrap_or_else(|| {
            tracing::debug!(model, "no pricing entry, using default cost");
            &self.default
        })
    }

    pub fn contains(&self, model: &str) -> bool {
        self.resolve(model).is_some()
    }

    pub fn tokens_per_usd(&self) -> u64 {
        self.tokens_per_usd
    }

    pub fn model_ids(&self) -> impl Iterator<Item = &str> {
        self.models.keys().map(String::as_str)
    }

    /// Lowercases and strips router prefixes (`openai/gpt-4o`) and variant
    /// suffixes (`deepseek-chat:free`).
    fn normalize_model_id(model: &str) -> String {
        let model = model.trim().to_lowercase();
        let model = model.rsplit('/').next().unwrap_or(&model);
        let model = model.split(':').next().unwrap_or(model);
        model.to_string()
    }

    fn family_alias(normalized: &str) -> Option<&'static str> {
        const FAMILIES: &[(&str, &str)] = &[
            ("sonnet", "claude-sonnet-4-5"),
            ("haiku", "claude-haiku-4-5"),
            ("gpt-4o-mini", "gpt-4o-mini"),
            ("gpt-4o", "gpt-4o"),
            ("gemini", "gemini-2.5-flash"),
            ("deepseek", "deepseek-chat"),
            ("kimi", "kimi-k2"),
            ("dall-e", "dall-e-3"),
            ("flux", "flux-pro"),
            ("imagen", "imagen-4"),
            ("veo", "veo-3"),
            ("sora", "sora-2"),
            ("kling", "kling-v2"),
            ("runway", "runway-gen4"),
            ("suno", "suno-v4"),
            ("eleven", "eleven-multilingual-v2"),
            ("gamma", "gamma-ppt"),
        ];
        FAMILIES
            .iter()
            .find(|(needle, _)| normalized.contains(needle))
            .map(|(_, id)| *id)
    }
}

impl Default for PricingTable {
    fn default() -> Self {
        global_pricing_table().clone()
    }
}

#[derive(Debug, Clone)]
enum Entry {
    Derived {
        provider: String,
        cost: Decimal,
        tokenizer: TokenizerKind,
    },
    Fixed(ModelCost),
}

#[derive(Debug, Default)]
pub struct PricingTableBuilder {
    models: HashMap<String, Entry>,
    default: Option<ModelCost>,
    tokens_per_usd: Option<u64>,
}

impl PricingTableBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_defaults(self) -> Self {
        let chat = TokenizerKind::characters(4.0);
        self.model_usd("gpt-4o", "openai", dec!(0.010), chat)
            .model_usd("gpt-4o-mini", "openai", dec!(0.0006), chat)
            .model_usd("claude-sonnet-4-5", "anthropic", dec!(0.015), chat)
            .model_usd("claude-haiku-4-5", "anthropic", dec!(0.004), chat)
            .model_usd("gemini-2.5-flash", "google", dec!(0.0008), chat)
            .model_usd("deepseek-chat", "deepseek", dec!(0.0014), chat)
            .model_usd("kimi-k2", "moonshot", dec!(0.002), TokenizerKind::words(1.3))
            .model_usd("dall-e-3", "openai", dec!(0.04), TokenizerKind::PerMessage)
            .model_usd("flux-pro", "fal", dec!(0.05), TokenizerKind::PerMessage)
            .model_usd("imagen-4", "google", dec!(0.04), TokenizerKind::PerMessage)
            .model_usd("veo-3", "google", dec!(1.20), TokenizerKind::PerMessage)
            .model_usd("sora-2", "openai", dec!(1.00), TokenizerKind::PerMessage)
            .model_usd("kling-v2", "kling", dec!(0.90), TokenizerKind::PerMessage)
            .model_usd("runway-gen4", "runway", dec!(0.50), TokenizerKind::PerMessage)
            .model_usd("suno-v4", "suno", dec!(0.10), TokenizerKind::PerMessage)
            .model_usd(
                "eleven-multilingual-v2",
                "elevenlabs",
                dec!(0.03),
                TokenizerKind::PerMessage,
            )
            .model_usd("gamma-ppt", "gamma", dec!(0.25), TokenizerKind::PerMessage)
    }

    /// Price in USD; the token cost is derived when the table is built.
    pub fn model_usd(
        mut self,
        id: impl Into<String>,
        provider: impl Into<String>,
        cost_per_message: Decimal,
        tokenizer: TokenizerKind,
    ) -> Self {
        self.models.insert(
            id.into().to_lowercase(),
            Entry::Derived {
                provider: provider.into(),
                cost: cost_per_message,
                tokenizer,
            },
        );
        self
    }

    /// Fully specified cost, including a pinned token amount.
    pub fn model(mut self, id: impl Into<String>, cost: ModelCost) -> Self {
        self.models.insert(id.into().to_lowercase(), Entry::Fixed(cost));
        self
    }

    pub fn default_cost(mut self, cost: ModelCost) -> Self {
        self.default = Some(cost);
        self
    }

    pub fn tokens_per_usd(mut self, rate: u64) -> Self {
        self.tokens_per_usd = Some(rate);
        self
    }

    /// Defaults plus `KRONIQ_PRICING_TOKENS_PER_USD` and one
    /// `KRONIQ_PRICING_<MODEL>_COST` override per known model, where `<MODEL>`
    /// is the id uppercased with `-` and `.` replaced by `_`.
    pub fn from_env(mut self) -> Self {
        self = self.with_defaults();

        if let Some(rate) = std::env::var("KRONIQ_PRICING_TOKENS_PER_USD")
            .ok()
            .and_then(|v| v.trim().parse::<u64>().ok())
        {
            self.tokens_per_usd = Some(rate);
        }

        for (id, entry) in self.models.iter_mut() {
            if let Some(cost) = Self::parse_env_cost(id)
                && let Entry::Derived { cost: current, .. } = entry
            {
                *current = cost;
            }
        }

        self
    }

    fn env_key(id: &str) -> String {
        format!(
            "KRONIQ_PRICING_{}_COST",
            id.to_uppercase().replace(['-', '.'], "_")
        )
    }

    fn parse_env_cost(id: &str) -> Option<Decimal> {
        std::env::var(Self::env_key(id))
            .ok()?
            .trim()
            .parse::<Decimal>()
            .ok()
            .filter(|cost| *cost >= Decimal::ZERO)
    }

    pub fn build(self) -> PricingTable {
        let rate = self.tokens_per_usd.unwrap_or(DEFAULT_TOKENS_PER_USD);
        let models = self
            .models
            .into_iter()
            .map(|(id, entry)| {
                let cost = match entry {
                    Entry::Derived {
                        provider,
                        cost,
                        tokenizer,
                    } => ModelCost::with_rate(provider, cost, tokenizer, rate),
                    Entry::Fixed(cost) => cost,
                };
                (id, cost)
            })
            .collect();

        let default = self.default.unwrap_or_else(|| {
            ModelCost::with_rate("openai", dec!(0.010), TokenizerKind::default(), rate)
        });

        PricingTable {
            models,
            default,
            tokens_per_usd: rate,
        }
    }
}

static GLOBAL_PRICING: LazyLock<PricingTable> =
    LazyLock::new(|| PricingTableBuilder::new().from_env().build());

pub fn global_pricing_table() -> &'static PricingTable {
    &GLOBAL_PRICING
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_derived_token_cost() {
        let table = PricingTableBuilder::new().with_defaults().build();

        assert_eq!(table.get("gamma-ppt").tokens_per_message, 250_000);
        assert_eq!(table.get("veo-3").tokens_per_message, 1_200_000);
        assert_eq!(table.get("gpt-4o").tokens_per_message, 10_000);
        assert_eq!(table.get("gpt-4o-mini").tokens_per_message, 600);
    }

    #[test]
    fn test_normalized_lookup() {
        let table = PricingTableBuilder::new().with_defaults().build();

        assert_eq!(table.get("OpenAI/GPT-4o").provider, "openai");
        assert_eq!(
            table.get("deepseek/deepseek-chat:free").cost_per_message,
            dec!(0.0014)
        );
        assert_eq!(table.get("veo-3-fast").cost_per_message, dec!(1.20));
        assert!(table.contains("anthropic/claude-3-5-sonnet"));
    }

    #[test]
    fn test_unknown_model_uses_default() {
        let table = PricingTableBuilder::new().with_defaults().build();

        assert!(!table.contains("mystery-model"));
        assert_eq!(table.get("mystery-model").cost_per_message, dec!(0.010));
    }

    #[test]
    fn test_custom_rate() {
        let table = PricingTableBuilder::new()
            .model_usd("custom", "acme", dec!(0.5), TokenizerKind::PerMessage)
            .tokens_per_usd(1_000)
            .build();

        assert_eq!(table.get("custom").tokens_per_message, 500);
        assert_eq!(table.tokens_per_usd(), 1_000);
    }

    #[test]
    fn test_pinned_cost() {
        let table = PricingTableBuilder::new()
            .model(
                "studio-image",
                ModelCost::new("fal", dec!(0.02), TokenizerKind::PerMessage).pinned(250_000),
            )
            .build();

        assert_eq!(table.get("studio-image").tokens_per_message, 250_000);
    }

    #[test]
    fn test_env_override() {
        // SAFETY: Test-only environment setup
        unsafe { std::env::set_var("KRONIQ_PRICING_SUNO_V4_COST", "0.2") };
        let table = PricingTableBuilder::new().from_env().build();
        unsafe { std::env::remove_var("KRONIQ_PRICING_SUNO_V4_COST") };

        assert_eq!(table.get("suno-v4").cost_per_message, dec!(0.2));
        assert_eq!(table.get("suno-v4").tokens_per_message, 200_000);
    }

    #[test]
    fn test_derive_tokens_rounds_up() {
        assert_eq!(derive_tokens(dec!(0.0000015), 1_000_000), 2);
        assert_eq!(derive_tokens(Decimal::ZERO, 1_000_000), 0);
    }
}

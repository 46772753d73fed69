//! One-call metering around a generation.
//!
//! [`Metering::run`] performs the steps in a fixed order: optional pre-flight
//! estimate, quota check, generation, token deduction, then the quota
//! counter increment. Nothing is charged for a generation that fails. A
//! failure after the deduction (a dropped response, say) is not refunded.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::Instrument;

use crate::clock::{Clock, SystemClock};
use crate::config::MeteringSettings;
use crate::estimator::{CostEstimate, CostEstimator};
use crate::events::BalanceNotifier;
use crate::ledger::{DeductionResult, TokenLedger};
use crate::observability::{GenerationSpan, MeteringMetrics, MetricsSummary};
use crate::pricing::{PricingTable, PricingTableBuilder};
use crate::quota::{LimitCheck, QuotaGate};
use crate::store::{ProfileStore, UsageStore};
use crate::tier::TierResolver;
use crate::types::GenerationType;
use crate::{Error, Result};

/// What to generate and how to meter it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GenerationRequest {
    pub model_id: String,
    /// Empty to use the provider from the pricing table.
    pub provider: String,
    /// `None` for chat, which has no generation cap.
    pub kind: Option<GenerationType>,
    pub prompt: String,
    /// Explicit token charge. Otherwise a preflight request is charged its
    /// estimate, and anything else the generator's reported usage or the
    /// model's per-message cost.
    pub tokens: Option<u64>,
    pub preflight: bool,
}

impl GenerationRequest {
    pub fn chat(model_id: impl Into<String>, prompt: impl Into<String>) -> Self {
        Self {
            model_id: model_id.into(),
            provider: String::new(),
            kind: None,
            prompt: prompt.into(),
            tokens: None,
            preflight: false,
        }
    }

    pub fn media(
        kind: GenerationType,
        model_id: impl Into<String>,
        prompt: impl Into<String>,
    ) -> Self {
        Self {
            kind: Some(kind),
            ..Self::chat(model_id, prompt)
        }
    }

    pub fn with_provider(mut self, provider: impl Into<String>) -> Self {
        self.provider = provider.into();
        self
    }

    pub fn with_tokens(mut self, tokens: u64) -> Self {
        self.tokens = Some(tokens);
        self
    }

    pub fn with_preflight(mut self) -> Self {
        self.preflight = true;
        self
    }

    pub fn request_type(&self) -> &'static str {
        self.kind.map(|k| k.as_str()).unwrap_or("chat")
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GenerationOutput {
    pub content: String,
    /// Metering tokens the provider reports having used, if it reports any.
    pub tokens_used: Option<u64>,
}

impl GenerationOutput {
    pub fn new(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            tokens_used: None,
        }
    }

    pub fn with_tokens_used(mut self, tokens: u64) -> Self {
        self.tokens_used = Some(tokens);
        self
    }
}

#[derive(Debug, thiserror::Error)]
#[error("{provider} generation failed: {message}")]
pub struct GeneratorError {
    pub provider: String,
    pub message: String,
}

impl GeneratorError {
    pub fn new(provider: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            provider: provider.into(),
            message: message.into(),
        }
    }
}

/// A chat, image, video, music, speech or slide provider.
#[async_trait::async_trait]
pub trait Generator: Send + Sync {
    fn name(&self) -> &str;

    async fn generate(
        &self,
        request: &GenerationRequest,
    ) -> std::result::Result<GenerationOutput, GeneratorError>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MeteredOutcome {
    pub output: GenerationOutput,
    /// A failed deduction is reported here; the output is still returned.
    pub deduction: DeductionResult,
    pub quota: Option<LimitCheck>,
    pub estimate: Option<CostEstimate>,
    /// Whether the quota counter was incremented.
    pub counted: bool,
}

pub struct MeteringBuilder {
    profiles: Arc<dyn ProfileStore>,
    usage: Arc<dyn UsageStore>,
    settings: MeteringSettings,
    pricing: Option<Arc<PricingTable>>,
    clock: Arc<dyn Clock>,
    notifier: Option<BalanceNotifier>,
}

impl MeteringBuilder {
    pub fn settings(mut self, settings: MeteringSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn pricing(mut self, pricing: Arc<PricingTable>) -> Self {
        self.pricing = Some(pricing);
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn notifier(mut self, notifier: BalanceNotifier) -> Self {
        self.notifier = Some(notifier);
        self
    }

    pub fn build(self) -> Metering {
        let settings = self.settings;
        let pricing = self.pricing.unwrap_or_else(|| {
            Arc::new(
                PricingTableBuilder::new()
                    .from_env()
                    .tokens_per_usd(settings.pricing.tokens_per_usd)
                    .build(),
            )
        });
        let notifier = self
            .notifier
            .unwrap_or_else(|| BalanceNotifier::new(settings.events_capacity));
        let metrics = Arc::new(MeteringMetrics::new());

        let tiers = Arc::new(
            TierResolver::new(Arc::clone(&self.profiles))
                .with_settings(settings.tier.clone())
                .with_clock(Arc::clone(&self.clock))
                .with_notifier(notifier.clone())
                .with_metrics(Arc::clone(&metrics)),
        );
        let quota = QuotaGate::new(self.usage, Arc::clone(&tiers))
            .with_limits(settings.limits.clone())
            .with_clock(Arc::clone(&self.clock))
            .with_metrics(Arc::clone(&metrics));
        let ledger = TokenLedger::new(self.profiles)
            .with_pricing(Arc::clone(&pricing))
            .with_clock(Arc::clone(&self.clock))
            .with_notifier(notifier.clone())
            .with_metrics(Arc::clone(&metrics));
        let estimator = CostEstimator::new(Arc::clone(&tiers))
            .with_pricing(pricing)
            .with_profit_margin(settings.pricing.profit_margin);

        Metering {
            tiers,
            quota,
            ledger,
            estimator,
            notifier,
            metrics,
        }
    }
}

/// The four metering components wired to one set of stores, one notifier
/// and one metrics registry.
pub struct Metering {
    tiers: Arc<TierResolver>,
    quota: QuotaGate,
    ledger: TokenLedger,
    estimator: CostEstimator,
    notifier: BalanceNotifier,
    metrics: Arc<MeteringMetrics>,
}

impl Metering {
    pub fn builder(profiles: Arc<dyn ProfileStore>, usage: Arc<dyn UsageStore>) -> MeteringBuilder {
        MeteringBuilder {
            profiles,
            usage,
            settings: MeteringSettings::default(),
            pricing: None,
            clock: Arc::new(SystemClock),
            notifier: None,
        }
    }

    pub fn tiers(&self) -> &TierResolver {
        &self.tiers
    }

    pub fn quota(&self) -> &QuotaGate {
        &self.quota
    }

    pub fn ledger(&self) -> &TokenLedger {
        &self.ledger
    }

    pub fn estimator(&self) -> &CostEstimator {
        &self.estimator
    }

    pub fn notifier(&self) -> &BalanceNotifier {
        &self.notifier
    }

    pub fn metrics(&self) -> MetricsSummary {
        MetricsSummary::from_metrics(&self.metrics)
    }

    pub async fn run(
        &self,
        user_id: &str,
        request: &GenerationRequest,
        generator: &dyn Generator,
    ) -> Result<MeteredOutcome> {
        let estimate = if request.preflight {
            let estimate = self
                .estimator
                .estimate_request_cost(user_id, &request.model_id, &request.prompt)
                .await;
            let required = request.tokens.unwrap_or(estimate.estimated_tokens);
            if estimate.current_balance < required {
                return Err(Error::InsufficientBalance {
                    required,
                    available: estimate.current_balance,
                });
            }
            Some(estimate)
        } else {
            None
        };

        let quota = match request.kind {
            Some(kind) => {
                let check = self.quota.check_generation_limit(user_id, kind).await;
                if !check.can_generate {
                    return Err(Error::QuotaExceeded {
                        kind,
                        current: check.current,
                        limit: check.limit,
                        message: check.message.unwrap_or_default(),
                    });
                }
                Some(check)
            }
            None => None,
        };

        let span = GenerationSpan::new(user_id, request.request_type(), &request.model_id);
        self.metrics.record_generation_start();
        tracing::debug!(user_id, generator = generator.name(), "generation started");
        let result = generator
            .generate(request)
            .instrument(span.span().clone())
            .await;
        self.metrics
            .record_generation_end(span.finish(result.is_ok()));
        let output = result?;

        // A preflight estimate binds the charge to the amount it checked.
        let tokens = request
            .tokens
            .or(estimate.as_ref().map(|e| e.estimated_tokens))
            .or(output.tokens_used)
            .unwrap_or(0);
        let deduction = self
            .ledger
            .deduct_tokens_for_request(
                user_id,
                &request.model_id,
                &request.provider,
                tokens,
                request.request_type(),
            )
            .await;

        let counted = match request.kind {
            Some(kind) => self.quota.increment_generation_count(user_id, kind).await,
            None => false,
        };

        Ok(MeteredOutcome {
            output,
            deduction,
            quota,
            estimate,
            counted,
        })
    }
}

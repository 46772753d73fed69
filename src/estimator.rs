//! Pre-flight cost estimates.
//!
//! Two units are kept apart here. USD figures are bookkeeping at provider
//! rates and are charged per message, not per token. The balance check
//! compares metering tokens with metering tokens and never looks at USD.

use std::sync::Arc;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::pricing::{DEFAULT_PROFIT_MARGIN, PricingTable, estimate_tokens, global_pricing_table};
use crate::tier::TierResolver;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CostEstimate {
    pub model_id: String,
    pub estimated_tokens: u64,
    pub provider_cost_usd: Decimal,
    pub profit_margin_usd: Decimal,
    pub total_cost_usd: Decimal,
    pub has_enough_balance: bool,
    pub current_balance: u64,
}

pub struct CostEstimator {
    tiers: Arc<TierResolver>,
    pricing: Arc<PricingTable>,
    profit_margin: Decimal,
}

impl CostEstimator {
    pub fn new(tiers: Arc<TierResolver>) -> Self {
        Self {
            tiers,
            pricing: Arc::new(global_pricing_table().clone()),
            profit_margin: DEFAULT_PROFIT_MARGIN,
        }
    }

    pub fn with_pricing(mut self, pricing: Arc<PricingTable>) -> Self {
        self.pricing = pricing;
        self
    }

    pub fn with_profit_margin(mut self, margin: Decimal) -> Self {
        self.profit_margin = margin;
        self
    }

    /// The balance comes from the tier resolver, so an unreadable profile
    /// estimates against a zero balance.
    pub async fn estimate_request_cost(
        &self,
        user_id: &str,
        model_id: &str,
        input_text: &str,
    ) -> CostEstimate {
        let cost = self.pricing.get(model_id);
        let estimated_tokens = estimate_tokens(input_text, cost);

        let provider_cost_usd = cost.cost_per_message;
        let profit_margin_usd = (provider_cost_usd * self.profit_margin).round_dp(6);
        let current_balance = self.tiers.get_user_tier(user_id).await.token_balance;

        let estimate = CostEstimate {
            model_id: model_id.to_string(),
            estimated_tokens,
            provider_cost_usd,
            profit_margin_usd,
            total_cost_usd: provider_cost_usd + profit_margin_usd,
            has_enough_balance: current_balance >= estimated_tokens,
            current_balance,
        };

        tracing::debug!(
            user_id,
            model_id,
            estimated_tokens,
            current_balance,
            has_enough_balance = estimate.has_enough_balance,
            "request cost estimated"
        );
        estimate
    }
}

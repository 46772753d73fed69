use std::sync::Arc;

use futures::future::join_all;
use serde::{Deserialize, Serialize};
use tracing::Instrument;

use super::GenerationLimits;
use crate::clock::{Clock, SystemClock};
use crate::observability::{MeteringMetrics, quota_span};
use crate::store::UsageStore;
use crate::tier::TierResolver;
use crate::types::{GenerationType, UsagePeriod};

/// Outcome of the daily pre-generation check.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LimitCheck {
    pub generation_type: GenerationType,
    pub can_generate: bool,
    pub current: u32,
    pub limit: u32,
    pub is_paid: bool,
    /// Set when generation is blocked.
    pub message: Option<String>,
}

impl LimitCheck {
    pub fn remaining(&self) -> u32 {
        self.limit.saturating_sub(self.current)
    }
}

/// Outcome of the monthly check-and-increment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsageDecision {
    pub allowed: bool,
    /// Count after the increment when allowed.
    pub current: u32,
    pub limit: u32,
    pub message: Option<String>,
}

pub struct QuotaGate {
    usage: Arc<dyn UsageStore>,
    tiers: Arc<TierResolver>,
    limits: GenerationLimits,
    clock: Arc<dyn Clock>,
    metrics: Arc<MeteringMetrics>,
}

impl QuotaGate {
    pub fn new(usage: Arc<dyn UsageStore>, tiers: Arc<TierResolver>) -> Self {
        Self {
            usage,
            tiers,
            limits: GenerationLimits::default(),
            clock: Arc::new(SystemClock),
            metrics: Arc::new(MeteringMetrics::new()),
        }
    }

    pub fn with_limits(mut self, limits: GenerationLimits) -> Self {
        self.limits = limits;
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_metrics(mut self, metrics: Arc<MeteringMetrics>) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn limits(&self) -> &GenerationLimits {
        &self.limits
    }

    /// Passes while today's count is below the cap: the free cap for free
    /// users, the paid sentinel for paid users. A counter read failure lets
    /// the request through.
    pub async fn check_generation_limit(&self, user_id: &str, kind: GenerationType) -> LimitCheck {
        let span = quota_span(user_id, kind);
        async {
            let is_paid = self.tiers.get_user_tier(user_id).await.is_paid();
            let limit = if is_paid {
                self.limits.paid_sentinel
            } else {
                self.limits.daily_limit(kind)
            };
            let today = UsagePeriod::day_of(self.clock.now());

            let check = match self.usage.get_count(user_id, &today, kind).await {
                Ok(current) => {
                    let can_generate = current < limit;
                    LimitCheck {
                        generation_type: kind,
                        can_generate,
                        current,
                        limit,
                        is_paid,
                        message: (!can_generate)
                            .then(|| blocked_message(kind, limit, "today", is_paid)),
                    }
                }
                Err(e) => {
                    tracing::warn!(user_id, kind = %kind, error = %e, "usage read failed, allowing generation");
                    self.metrics.quota_fail_open.inc();
                    LimitCheck {
                        generation_type: kind,
                        can_generate: true,
                        current: 0,
                        limit,
                        is_paid,
                        message: None,
                    }
                }
            };

            tracing::Span::current().record("current", check.current);
            tracing::Span::current().record("limit", check.limit);
            self.metrics.record_quota(check.can_generate);
            if !check.can_generate {
                tracing::info!(user_id, kind = %kind, current = check.current, limit = check.limit, "generation blocked by daily cap");
            }
            check
        }
        .instrument(span)
        .await
    }

    /// Counts one successful generation against today's record. Returns
    /// `false` on failure; callers do not retry, so a failure only
    /// under-counts.
    pub async fn increment_generation_count(&self, user_id: &str, kind: GenerationType) -> bool {
        let today = UsagePeriod::day_of(self.clock.now());
        match self.usage.increment(user_id, &today, kind).await {
            Ok(count) => {
                tracing::debug!(user_id, kind = %kind, count, "generation counted");
                true
            }
            Err(e) => {
                tracing::warn!(user_id, kind = %kind, error = %e, "failed to count generation");
                false
            }
        }
    }

    /// Checks the monthly cap and counts the generation in one store
    /// operation. Fails open like the daily check.
    pub async fn check_and_increment_usage(
        &self,
        user_id: &str,
        kind: GenerationType,
    ) -> UsageDecision {
        let is_paid = self.tiers.get_user_tier(user_id).await.is_paid();
        let limit = if is_paid {
            self.limits.paid_sentinel
        } else {
            self.limits.monthly_limit(kind)
        };
        let month = UsagePeriod::month_of(self.clock.now());

        let decision = match self
            .usage
            .check_and_increment(user_id, &month, kind, limit)
            .await
        {
            Ok(update) => UsageDecision {
                allowed: update.allowed,
                current: update.count,
                limit,
                message: (!update.allowed)
                    .then(|| blocked_message(kind, limit, "this month", is_paid)),
            },
            Err(e) => {
                tracing::warn!(user_id, kind = %kind, error = %e, "monthly usage update failed, allowing generation");
                self.metrics.quota_fail_open.inc();
                UsageDecision {
                    allowed: true,
                    current: 0,
                    limit,
                    message: None,
                }
            }
        };

        self.metrics.record_quota(decision.allowed);
        decision
    }

    /// Daily checks for every generation type.
    pub async fn quota_summary(&self, user_id: &str) -> Vec<LimitCheck> {
        join_all(
            GenerationType::ALL
                .into_iter()
                .map(|kind| self.check_generation_limit(user_id, kind)),
        )
        .await
    }
}

fn blocked_message(kind: GenerationType, limit: u32, window: &str, is_paid: bool) -> String {
    if is_paid {
        return format!("You've reached the limit of {} {} {}.", limit, kind.plural(), window);
    }
    format!(
        "You've reached the free limit of {} {} {}. Upgrade to a paid plan for unlimited generations.",
        limit,
        kind.plural(),
        window
    )
}

//! Tier resolution and daily free-token refresh.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::clock::{Clock, SystemClock};
use crate::config::TierSettings;
use crate::events::{BalanceChange, BalanceEvent, BalanceNotifier};
use crate::observability::MeteringMetrics;
use crate::store::{ProfileStore, StoreResult};
use crate::types::{Plan, TokenTransaction, UserProfile};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Tier {
    Free,
    Paid,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserTier {
    pub tier: Tier,
    pub is_premium: bool,
    pub token_balance: u64,
    pub free_tokens: u64,
    pub paid_tokens: u64,
    pub plan: Plan,
}

impl UserTier {
    /// What every caller sees when the profile cannot be read.
    pub fn free_default() -> Self {
        Self {
            tier: Tier::Free,
            is_premium: false,
            token_balance: 0,
            free_tokens: 0,
            paid_tokens: 0,
            plan: Plan::Free,
        }
    }

    pub fn is_paid(&self) -> bool {
        self.tier == Tier::Paid
    }

    fn from_profile(profile: &UserProfile, settings: &TierSettings) -> Self {
        let is_premium = settings.is_premium(profile.plan, profile.token_balance);
        Self {
            tier: if is_premium { Tier::Paid } else { Tier::Free },
            is_premium,
            token_balance: profile.token_balance,
            free_tokens: profile.free_tokens,
            paid_tokens: profile.paid_tokens,
            plan: profile.plan,
        }
    }
}

pub struct TierResolver {
    profiles: Arc<dyn ProfileStore>,
    settings: TierSettings,
    clock: Arc<dyn Clock>,
    notifier: BalanceNotifier,
    metrics: Arc<MeteringMetrics>,
}

impl TierResolver {
    pub fn new(profiles: Arc<dyn ProfileStore>) -> Self {
        Self {
            profiles,
            settings: TierSettings::default(),
            clock: Arc::new(SystemClock),
            notifier: BalanceNotifier::default(),
            metrics: Arc::new(MeteringMetrics::new()),
        }
    }

    pub fn with_settings(mut self, settings: TierSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_notifier(mut self, notifier: BalanceNotifier) -> Self {
        self.notifier = notifier;
        self
    }

    pub fn with_metrics(mut self, metrics: Arc<MeteringMetrics>) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn settings(&self) -> &TierSettings {
        &self.settings
    }

    /// Never fails: a missing profile or a store error resolves to the free
    /// tier with a zero balance.
    pub async fn get_user_tier(&self, user_id: &str) -> UserTier {
        match self.profiles.get_profile(user_id).await {
            Ok(Some(profile)) => UserTier::from_profile(&profile, &self.settings),
            Ok(None) => {
                tracing::warn!(user_id, "no profile found, treating as free tier");
                self.metrics.tier_defaults.inc();
                UserTier::free_default()
            }
            Err(e) => {
                tracing::warn!(user_id, error = %e, "tier lookup failed, treating as free tier");
                self.metrics.tier_defaults.inc();
                UserTier::free_default()
            }
        }
    }

    /// Resets the free bucket of an enrolled, non-premium user whose last
    /// refresh is at least a day old. Returns the new balance when a refresh
    /// happened.
    ///
    /// The profile read only screens out premium users; the due check and
    /// the reset run inside the store's atomic refresh, so a debit landing
    /// in between is kept.
    pub async fn refresh_daily_allowance(&self, user_id: &str) -> StoreResult<Option<u64>> {
        let Some(profile) = self.profiles.get_profile(user_id).await? else {
            return Ok(None);
        };

        let now = self.clock.now();
        if self.settings.is_premium(profile.plan, profile.token_balance)
            || !profile.refresh_due(now)
        {
            return Ok(None);
        }

        let Some(transaction) = self
            .profiles
            .refresh_if_due(user_id, TokenTransaction::refresh(user_id, 0).at(now))
            .await?
        else {
            tracing::debug!(user_id, "refresh already applied elsewhere");
            return Ok(None);
        };

        self.metrics.daily_refreshes.inc();
        tracing::info!(
            user_id,
            allowance = transaction.tokens,
            balance = transaction.balance_after,
            "daily free tokens refreshed"
        );
        self.notifier.publish(BalanceEvent::new(
            user_id,
            BalanceChange::Refreshed,
            transaction.tokens,
            transaction.balance_after,
            now,
        ));

        Ok(Some(transaction.balance_after))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::store::MemoryProfileStore;
    use crate::store::testing::FlakyProfileStore;
    use chrono::{Duration, TimeZone, Utc};
    use std::sync::atomic::Ordering;

    fn resolver(profiles: impl IntoIterator<Item = UserProfile>) -> TierResolver {
        TierResolver::new(Arc::new(MemoryProfileStore::with_profiles(profiles)))
    }

    #[tokio::test]
    async fn test_balance_above_threshold_is_premium() {
        let resolver = resolver([UserProfile::new("u1").with_paid_tokens(600_000)]);
        let tier = resolver.get_user_tier("u1").await;
        assert_eq!(tier.tier, Tier::Paid);
        assert!(tier.is_premium);
        assert_eq!(tier.plan, Plan::Free);
    }

    #[tokio::test]
    async fn test_pro_plan_with_low_balance_is_free() {
        let resolver = resolver([UserProfile::new("u1")
            .with_plan(Plan::Pro)
            .with_paid_tokens(1_000)]);
        let tier = resolver.get_user_tier("u1").await;
        assert_eq!(tier.tier, Tier::Free);
        assert_eq!(tier.token_balance, 1_000);
    }

    #[tokio::test]
    async fn test_premium_plan_with_zero_balance() {
        let resolver = resolver([UserProfile::new("u1").with_plan(Plan::Premium)]);
        assert!(resolver.get_user_tier("u1").await.is_paid());
    }

    #[tokio::test]
    async fn test_missing_profile_defaults() {
        let resolver = resolver([]);
        assert_eq!(resolver.get_user_tier("ghost").await, UserTier::free_default());
    }

    #[tokio::test]
    async fn test_store_error_fails_soft() {
        let store = FlakyProfileStore::new(MemoryProfileStore::with_profiles([
            UserProfile::new("u1").with_plan(Plan::Paid),
        ]));
        store.fail_reads.store(true, Ordering::SeqCst);
        let metrics = Arc::new(MeteringMetrics::new());
        let resolver = TierResolver::new(store).with_metrics(Arc::clone(&metrics));

        assert_eq!(resolver.get_user_tier("u1").await, UserTier::free_default());
        assert_eq!(metrics.tier_defaults.get(), 1);
    }

    #[tokio::test]
    async fn test_refresh_daily_allowance() {
        let start = Utc.with_ymd_and_hms(2026, 3, 1, 9, 0, 0).unwrap();
        let clock = ManualClock::new(start);
        let store = MemoryProfileStore::with_profiles([UserProfile::new("u1")
            .with_free_tokens(10)
            .with_paid_tokens(100)
            .with_daily_allowance(5_000)
            .with_last_refresh(start - Duration::hours(30))]);
        let notifier = BalanceNotifier::default();
        let mut events = notifier.subscribe();
        let resolver = TierResolver::new(Arc::new(store.clone()))
            .with_clock(Arc::new(clock.clone()))
            .with_notifier(notifier);

        assert_eq!(resolver.refresh_daily_allowance("u1").await.unwrap(), Some(5_100));
        let event = events.recv().await.unwrap();
        assert_eq!(event.change, BalanceChange::Refreshed);
        assert_eq!(event.balance, 5_100);

        // Not due again until a full day has passed.
        clock.advance(Duration::hours(23));
        assert_eq!(resolver.refresh_daily_allowance("u1").await.unwrap(), None);
        clock.advance(Duration::hours(1));
        assert_eq!(resolver.refresh_daily_allowance("u1").await.unwrap(), Some(5_100));

        let history = store.transactions("u1", 10).await.unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].request_type.as_deref(), Some("daily_refresh"));
    }

    /// Runs an atomic debit on the inner store right after the first
    /// profile read.
    struct DebitAfterRead {
        inner: MemoryProfileStore,
        debited: std::sync::atomic::AtomicBool,
    }

    #[async_trait::async_trait]
    impl ProfileStore for DebitAfterRead {
        fn name(&self) -> &str {
            "debit-after-read"
        }

        async fn get_profile(&self, user_id: &str) -> StoreResult<Option<UserProfile>> {
            let profile = self.inner.get_profile(user_id).await?;
            if !self.debited.swap(true, Ordering::SeqCst) {
                let debit = TokenTransaction::debit(
                    user_id,
                    50,
                    rust_decimal::Decimal::ZERO,
                    "gpt-4o",
                    "openai",
                    "chat",
                );
                self.inner.deduct_if_sufficient(user_id, debit).await?;
            }
            Ok(profile)
        }

        async fn put_profile(&self, profile: &UserProfile) -> StoreResult<()> {
            self.inner.put_profile(profile).await
        }

        async fn deduct_if_sufficient(
            &self,
            user_id: &str,
            transaction: TokenTransaction,
        ) -> StoreResult<crate::store::DeductOutcome> {
            self.inner.deduct_if_sufficient(user_id, transaction).await
        }

        async fn credit(&self, transaction: TokenTransaction) -> StoreResult<TokenTransaction> {
            self.inner.credit(transaction).await
        }

        async fn refresh_if_due(
            &self,
            user_id: &str,
            transaction: TokenTransaction,
        ) -> StoreResult<Option<TokenTransaction>> {
            self.inner.refresh_if_due(user_id, transaction).await
        }

        async fn append_transaction(&self, transaction: &TokenTransaction) -> StoreResult<()> {
            self.inner.append_transaction(transaction).await
        }

        async fn transactions(
            &self,
            user_id: &str,
            limit: usize,
        ) -> StoreResult<Vec<TokenTransaction>> {
            self.inner.transactions(user_id, limit).await
        }
    }

    #[tokio::test]
    async fn test_refresh_keeps_concurrent_debit() {
        let inner = MemoryProfileStore::with_profiles([UserProfile::new("u1")
            .with_paid_tokens(100)
            .with_daily_allowance(1_000)]);
        let store = Arc::new(DebitAfterRead {
            inner: inner.clone(),
            debited: Default::default(),
        });
        let resolver = TierResolver::new(store);

        assert_eq!(resolver.refresh_daily_allowance("u1").await.unwrap(), Some(1_050));

        let profile = inner.get_profile("u1").await.unwrap().unwrap();
        assert_eq!((profile.free_tokens, profile.paid_tokens), (1_000, 50));
        assert_eq!(profile.token_balance, 1_050);
        assert_eq!(inner.transaction_count().await, 2);
    }

    #[tokio::test]
    async fn test_refresh_skips_premium_and_unenrolled() {
        let resolver = resolver([
            UserProfile::new("rich")
                .with_paid_tokens(900_000)
                .with_daily_allowance(5_000),
            UserProfile::new("plain").with_paid_tokens(10),
        ]);
        assert_eq!(resolver.refresh_daily_allowance("rich").await.unwrap(), None);
        assert_eq!(resolver.refresh_daily_allowance("plain").await.unwrap(), None);
        assert_eq!(resolver.refresh_daily_allowance("ghost").await.unwrap(), None);
    }
}

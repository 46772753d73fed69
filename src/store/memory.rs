//! In-memory backends (for testing and single-instance deployments).
//!
//! The profile store holds profiles and the ledger behind one lock, so the
//! deduct-if-sufficient operation is atomic with respect to every other
//! operation on the same store.

use std::collections::HashMap;
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::RwLock;

use super::{CounterUpdate, DeductOutcome, ProfileStore, StoreError, StoreResult, UsageStore};
use crate::types::{
    DeductionPath, GenerationType, TokenTransaction, UsagePeriod, UserProfile,
};

#[derive(Debug, Default)]
struct Ledger {
    profiles: HashMap<String, UserProfile>,
    transactions: Vec<TokenTransaction>,
}

#[derive(Debug, Clone, Default)]
pub struct MemoryProfileStore {
    ledger: Arc<RwLock<Ledger>>,
}

impl MemoryProfileStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_profiles(profiles: impl IntoIterator<Item = UserProfile>) -> Self {
        let profiles = profiles
            .into_iter()
            .map(|p| (p.user_id.clone(), p))
            .collect();
        Self {
            ledger: Arc::new(RwLock::new(Ledger {
                profiles,
                transactions: Vec::new(),
            })),
        }
    }

    pub async fn insert(&self, profile: UserProfile) {
        self.ledger
            .write()
            .await
            .profiles
            .insert(profile.user_id.clone(), profile);
    }

    pub async fn count(&self) -> usize {
        self.ledger.read().await.profiles.len()
    }

    pub async fn transaction_count(&self) -> usize {
        self.ledger.read().await.transactions.len()
    }

    pub async fn clear(&self) {
        let mut ledger = self.ledger.write().await;
        ledger.profiles.clear();
        ledger.transactions.clear();
    }
}

#[async_trait::async_trait]
impl ProfileStore for MemoryProfileStore {
    fn name(&self) -> &str {
        "memory"
    }

    async fn get_profile(&self, user_id: &str) -> StoreResult<Option<UserProfile>> {
        Ok(self.ledger.read().await.profiles.get(user_id).cloned())
    }

    async fn put_profile(&self, profile: &UserProfile) -> StoreResult<()> {
        self.ledger
            .write()
            .await
            .profiles
            .insert(profile.user_id.clone(), profile.clone());
        Ok(())
    }

    async fn deduct_if_sufficient(
        &self,
        user_id: &str,
        mut transaction: TokenTransaction,
    ) -> StoreResult<DeductOutcome> {
        let mut ledger = self.ledger.write().await;
        let profile = ledger
            .profiles
            .get_mut(user_id)
            .ok_or_else(|| StoreError::not_found(user_id))?;

        if profile.token_balance < transaction.tokens {
            return Ok(DeductOutcome::Insufficient {
                balance: profile.token_balance,
            });
        }

        profile.debit(transaction.tokens, transaction.created_at);
        transaction.path = Some(DeductionPath::Atomic);
        transaction.balance_after = profile.token_balance;
        ledger.transactions.push(transaction.clone());

        Ok(DeductOutcome::Deducted(transaction))
    }

    async fn credit(&self, mut transaction: TokenTransaction) -> StoreResult<TokenTransaction> {
        let mut ledger = self.ledger.write().await;
        let profile = ledger
            .profiles
            .entry(transaction.user_id.clone())
            .or_insert_with(|| UserProfile::new(transaction.user_id.clone()));

        profile.credit(transaction.tokens, transaction.created_at);
        transaction.balance_after = profile.token_balance;
        ledger.transactions.push(transaction.clone());

        Ok(transaction)
    }

    async fn refresh_if_due(
        &self,
        user_id: &str,
        mut transaction: TokenTransaction,
    ) -> StoreResult<Option<TokenTransaction>> {
        let mut ledger = self.ledger.write().await;
        let Some(profile) = ledger.profiles.get_mut(user_id) else {
            return Ok(None);
        };
        if !profile.refresh_due(transaction.created_at) {
            return Ok(None);
        }

        profile.refresh_free_tokens(transaction.created_at);
        transaction.tokens = profile.daily_free_token_allowance;
        transaction.balance_after = profile.token_balance;
        ledger.transactions.push(transaction.clone());

        Ok(Some(transaction))
    }

    async fn append_transaction(&self, transaction: &TokenTransaction) -> StoreResult<()> {
        self.ledger
            .write()
            .await
            .transactions
            .push(transaction.clone());
        Ok(())
    }

    async fn transactions(
        &self,
        user_id: &str,
        limit: usize,
    ) -> StoreResult<Vec<TokenTransaction>> {
        let ledger = self.ledger.read().await;
        Ok(ledger
            .transactions
            .iter()
            .rev()
            .filter(|t| t.user_id == user_id)
            .take(limit)
            .cloned()
            .collect())
    }
}

/// Usage counters in a sharded map; each key's shard lock makes increments
/// and check-and-increment atomic.
#[derive(Debug, Clone, Default)]
pub struct MemoryUsageStore {
    counters: Arc<DashMap<String, u32>>,
}

impl MemoryUsageStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn counter_key(user_id: &str, period: &UsagePeriod, kind: GenerationType) -> String {
        format!("{}:{}:{}", user_id, period.key(), kind)
    }

    pub fn record_count(&self) -> usize {
        self.counters.len()
    }
}

#[async_trait::async_trait]
impl UsageStore for MemoryUsageStore {
    fn name(&self) -> &str {
        "memory"
    }

    async fn get_count(
        &self,
        user_id: &str,
        period: &UsagePeriod,
        kind: GenerationType,
    ) -> StoreResult<u32> {
        let key = Self::counter_key(user_id, period, kind);
        Ok(self.counters.get(&key).map(|c| *c).unwrap_or(0))
    }

    async fn increment(
        &self,
        user_id: &str,
        period: &UsagePeriod,
        kind: GenerationType,
    ) -> StoreResult<u32> {
        let key = Self::counter_key(user_id, period, kind);
        let mut count = self.counters.entry(key).or_insert(0);
        *count = count.saturating_add(1);
        Ok(*count)
    }

    async fn check_and_increment(
        &self,
        user_id: &str,
        period: &UsagePeriod,
        kind: GenerationType,
        limit: u32,
    ) -> StoreResult<CounterUpdate> {
        let key = Self::counter_key(user_id, period, kind);
        let mut count = self.counters.entry(key).or_insert(0);
        if *count < limit {
            *count += 1;
            Ok(CounterUpdate {
                allowed: true,
                count: *count,
            })
        } else {
            Ok(CounterUpdate {
                allowed: false,
                count: *count,
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use rust_decimal_macros::dec;

    fn debit(user: &str, tokens: u64) -> TokenTransaction {
        TokenTransaction::debit(user, tokens, dec!(0.25), "gamma-ppt", "gamma", "ppt")
    }

    #[tokio::test]
    async fn test_deduct_if_sufficient() {
        let store =
            MemoryProfileStore::with_profiles([UserProfile::new("u1").with_paid_tokens(1_000)]);

        let outcome = store.deduct_if_sufficient("u1", debit("u1", 400)).await.unwrap();
        let DeductOutcome::Deducted(tx) = outcome else {
            panic!("expected deduction");
        };
        assert_eq!(tx.balance_after, 600);
        assert_eq!(tx.path, Some(DeductionPath::Atomic));
        assert_eq!(store.transaction_count().await, 1);
    }

    #[tokio::test]
    async fn test_deduct_insufficient_writes_nothing() {
        let store =
            MemoryProfileStore::with_profiles([UserProfile::new("u1").with_paid_tokens(100)]);

        let outcome = store.deduct_if_sufficient("u1", debit("u1", 400)).await.unwrap();
        assert_eq!(outcome, DeductOutcome::Insufficient { balance: 100 });
        assert_eq!(store.transaction_count().await, 0);
        let profile = store.get_profile("u1").await.unwrap().unwrap();
        assert_eq!(profile.token_balance, 100);
    }

    #[tokio::test]
    async fn test_deduct_missing_profile() {
        let store = MemoryProfileStore::new();
        let err = store
            .deduct_if_sufficient("ghost", debit("ghost", 1))
            .await
            .unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_credit_creates_profile() {
        let store = MemoryProfileStore::new();
        let tx = store
            .credit(TokenTransaction::credit("u9", 5_000, "purchase"))
            .await
            .unwrap();

        assert_eq!(tx.balance_after, 5_000);
        let profile = store.get_profile("u9").await.unwrap().unwrap();
        assert_eq!(profile.paid_tokens, 5_000);
    }

    #[tokio::test]
    async fn test_refresh_if_due_only_once_per_day() {
        let now = Utc::now();
        let store = MemoryProfileStore::with_profiles([UserProfile::new("u1")
            .with_free_tokens(3)
            .with_paid_tokens(40)
            .with_daily_allowance(1_000)]);

        let tx = store
            .refresh_if_due("u1", TokenTransaction::refresh("u1", 0).at(now))
            .await
            .unwrap()
            .unwrap();
        assert_eq!((tx.tokens, tx.balance_after), (1_000, 1_040));

        let again = store
            .refresh_if_due("u1", TokenTransaction::refresh("u1", 0).at(now))
            .await
            .unwrap();
        assert!(again.is_none());
        assert!(store
            .refresh_if_due("ghost", TokenTransaction::refresh("ghost", 0).at(now))
            .await
            .unwrap()
            .is_none());
        assert_eq!(store.transaction_count().await, 1);
    }

    #[tokio::test]
    async fn test_transactions_newest_first() {
        let store =
            MemoryProfileStore::with_profiles([UserProfile::new("u1").with_paid_tokens(1_000)]);
        store.deduct_if_sufficient("u1", debit("u1", 1)).await.unwrap();
        store.deduct_if_sufficient("u1", debit("u1", 2)).await.unwrap();
        store.deduct_if_sufficient("u1", debit("u1", 3)).await.unwrap();

        let recent = store.transactions("u1", 2).await.unwrap();
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[0].tokens, 3);
        assert_eq!(recent[1].tokens, 2);
        assert!(store.transactions("other", 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_usage_increment_creates_then_counts() {
        let store = MemoryUsageStore::new();
        let today = UsagePeriod::day_of(Utc::now());

        assert_eq!(store.get_count("u1", &today, GenerationType::Image).await.unwrap(), 0);
        assert_eq!(store.increment("u1", &today, GenerationType::Image).await.unwrap(), 1);
        assert_eq!(store.increment("u1", &today, GenerationType::Image).await.unwrap(), 2);
        assert_eq!(store.get_count("u1", &today, GenerationType::Video).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_check_and_increment_stops_at_limit() {
        let store = MemoryUsageStore::new();
        let month = UsagePeriod::month_of(Utc::now());

        for expected in 1..=2 {
            let update = store
                .check_and_increment("u1", &month, GenerationType::Ppt, 2)
                .await
                .unwrap();
            assert!(update.allowed);
            assert_eq!(update.count, expected);
        }

        let blocked = store
            .check_and_increment("u1", &month, GenerationType::Ppt, 2)
            .await
            .unwrap();
        assert_eq!(
            blocked,
            CounterUpdate {
                allowed: false,
                count: 2
            }
        );
    }

    #[tokio::test]
    async fn test_concurrent_check_and_increment() {
        let store = MemoryUsageStore::new();
        let month = UsagePeriod::month_of(Utc::now());

        let handles: Vec<_> = (0..20)
            .map(|_| {
                let store = store.clone();
                tokio::spawn(async move {
                    store
                        .check_and_increment("u1", &month, GenerationType::Video, 5)
                        .await
                        .unwrap()
                        .allowed
                })
            })
            .collect();

        let mut allowed = 0;
        for handle in handles {
            if handle.await.unwrap() {
                allowed += 1;
            }
        }

        assert_eq!(allowed, 5);
        assert_eq!(store.get_count("u1", &month, GenerationType::Video).await.unwrap(), 5);
    }
}

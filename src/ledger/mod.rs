//! Token ledger: moves tokens out of a user's balance for each generation
//! and records every movement as an append-only transaction.
//!
//! A deduction runs as a small state machine:
//!
//! ```text
//! AtomicAttempt ──ok──────────────► settled (path = atomic)
//!      │  └──insufficient─────────► rejected, nothing written
//!      │ store error
//!      ▼
//! FallbackAttempt ──ok────────────► settled (path = fallback, clamped at 0)
//!      │ store error
//!      ▼
//!   Failed
//! ```
//!
//! The fallback is a read-then-write and is not safe against concurrent
//! deductions for the same user; it exists only to keep generation usable
//! while the atomic operation is unavailable. Nothing is retried.

mod result;

pub use result::{CreditResult, DeductionResult, LedgerFailure};

use std::sync::Arc;

use tracing::Instrument;

use crate::clock::{Clock, SystemClock};
use crate::events::{BalanceChange, BalanceEvent, BalanceNotifier};
use crate::observability::{MeteringMetrics, deduction_span};
use crate::pricing::{PricingTable, global_pricing_table};
use crate::store::{DeductOutcome, ProfileStore, StoreError, StoreResult};
use crate::types::{DeductionPath, TokenTransaction};

#[derive(Debug)]
enum DeductionState {
    AtomicAttempt,
    FallbackAttempt { cause: StoreError },
    Failed(LedgerFailure),
}

impl DeductionState {
    fn name(&self) -> &'static str {
        match self {
            Self::AtomicAttempt => "atomic_attempt",
            Self::FallbackAttempt { .. } => "fallback_attempt",
            Self::Failed(_) => "failed",
        }
    }
}

pub struct TokenLedger {
    profiles: Arc<dyn ProfileStore>,
    pricing: Arc<PricingTable>,
    clock: Arc<dyn Clock>,
    notifier: BalanceNotifier,
    metrics: Arc<MeteringMetrics>,
}

impl TokenLedger {
    pub fn new(profiles: Arc<dyn ProfileStore>) -> Self {
        Self {
            profiles,
            pricing: Arc::new(global_pricing_table().clone()),
            clock: Arc::new(SystemClock),
            notifier: BalanceNotifier::default(),
            metrics: Arc::new(MeteringMetrics::new()),
        }
    }

    pub fn with_pricing(mut self, pricing: Arc<PricingTable>) -> Self {
        self.pricing = pricing;
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

    pub fn notifier(&self) -> &BalanceNotifier {
        &self.notifier
    }

    /// Charges one generation. `tokens_to_deduct == 0` charges the model's
    /// per-message token cost. An empty `provider` falls back to the one in
    /// the pricing table.
    pub async fn deduct_tokens_for_request(
        &self,
        user_id: &str,
        model_id: &str,
        provider: &str,
        tokens_to_deduct: u64,
        request_type: &str,
    ) -> DeductionResult {
        let span = deduction_span(user_id, model_id, request_type);
        self.deduct(user_id, model_id, provider, tokens_to_deduct, request_type)
            .instrument(span)
            .await
    }

    async fn deduct(
        &self,
        user_id: &str,
        model_id: &str,
        provider: &str,
        tokens_to_deduct: u64,
        request_type: &str,
    ) -> DeductionResult {
        let cost = self.pricing.get(model_id);
        let tokens = if tokens_to_deduct > 0 {
            tokens_to_deduct
        } else {
            cost.tokens_per_message
        };
        let provider = if provider.is_empty() {
            cost.provider.as_str()
        } else {
            provider
        };
        tracing::Span::current().record("tokens", tokens);

        let transaction = TokenTransaction::debit(
            user_id,
            tokens,
            cost.cost_per_message,
            model_id,
            provider,
            request_type,
        )
        .at(self.clock.now());

        let mut state = DeductionState::AtomicAttempt;
        loop {
            let next = match state {
                DeductionState::AtomicAttempt => {
                    match self
                        .profiles
                        .deduct_if_sufficient(user_id, transaction.clone())
                        .await
                    {
                        Ok(DeductOutcome::Deducted(settled)) => return self.settle(settled),
                        Ok(DeductOutcome::Insufficient { balance }) => {
                            self.metrics.insufficient_balance.inc();
                            tracing::Span::current().record("success", false);
                            tracing::info!(
                                user_id,
                                required = tokens,
                                balance,
                                "insufficient balance, deduction rejected"
                            );
                            return DeductionResult::failed(
                                tokens,
                                balance,
                                LedgerFailure::InsufficientBalance {
                                    required: tokens,
                                    available: balance,
                                },
                            );
                        }
                        Err(e) if e.is_not_found() => {
                            DeductionState::Failed(LedgerFailure::ProfileNotFound {
                                user_id: user_id.to_string(),
                            })
                        }
                        Err(cause) => DeductionState::FallbackAttempt { cause },
                    }
                }
                DeductionState::FallbackAttempt { ref cause } => {
                    tracing::warn!(user_id, cause = %cause, "atomic deduction failed, using non-atomic fallback");
                    match self.fallback_deduct(transaction.clone()).await {
                        Ok(settled) => return self.settle(settled),
                        Err(e) if e.is_not_found() => {
                            DeductionState::Failed(LedgerFailure::ProfileNotFound {
                                user_id: user_id.to_string(),
                            })
                        }
                        Err(e) => DeductionState::Failed(LedgerFailure::Unavailable {
                            message: e.to_string(),
                        }),
                    }
                }
                DeductionState::Failed(failure) => {
                    self.metrics.deductions_failed.inc();
                    tracing::Span::current().record("success", false);
                    tracing::error!(user_id, model_id, tokens, error = %failure, "token deduction failed");
                    return DeductionResult::failed(tokens, 0, failure);
                }
            };
            tracing::debug!(from = state.name(), to = next.name(), "deduction state transition");
            state = next;
        }
    }

    /// Read, clamp at zero, write, then append the ledger entry. The profile
    /// write is the commit point; a lost ledger entry is logged only.
    async fn fallback_deduct(
        &self,
        mut transaction: TokenTransaction,
    ) -> StoreResult<TokenTransaction> {
        let mut profile = self
            .profiles
            .get_profile(&transaction.user_id)
            .await?
            .ok_or_else(|| StoreError::not_found(&transaction.user_id))?;

        transaction.shortfall = profile.debit(transaction.tokens, transaction.created_at);
        transaction.balance_after = profile.token_balance;
        transaction.path = Some(DeductionPath::Fallback);
        self.profiles.put_profile(&profile).await?;

        if let Err(e) = self.profiles.append_transaction(&transaction).await {
            tracing::error!(
                user_id = %transaction.user_id,
                transaction_id = %transaction.id,
                error = %e,
                "fallback deduction applied but ledger entry not written"
            );
        }
        if transaction.shortfall > 0 {
            tracing::warn!(
                user_id = %transaction.user_id,
                shortfall = transaction.shortfall,
                "fallback deduction clamped at zero"
            );
        }
        Ok(transaction)
    }

    fn settle(&self, transaction: TokenTransaction) -> DeductionResult {
        let path = transaction.path.unwrap_or(DeductionPath::Atomic);
        self.metrics
            .record_deduction(path, transaction.tokens, transaction.shortfall);
        self.metrics.record_cost(transaction.cost_usd);

        let span = tracing::Span::current();
        span.record("path", path.as_str());
        span.record("success", true);
        tracing::info!(
            user_id = %transaction.user_id,
            tokens = transaction.tokens,
            balance = transaction.balance_after,
            path = %path,
            "tokens deducted"
        );

        self.notifier.publish(BalanceEvent::new(
            transaction.user_id.clone(),
            BalanceChange::Deducted,
            transaction.settled_tokens(),
            transaction.balance_after,
            transaction.created_at,
        ));

        DeductionResult {
            success: true,
            balance: transaction.balance_after,
            tokens: transaction.tokens,
            transaction_id: Some(transaction.id),
            path: Some(path),
            shortfall: transaction.shortfall,
            error: None,
        }
    }

    /// Adds purchased tokens to the paid bucket, creating the profile if
    /// needed.
    pub async fn credit_tokens(&self, user_id: &str, tokens: u64, reason: &str) -> CreditResult {
        if tokens == 0 {
            return CreditResult {
                success: false,
                balance: 0,
                transaction_id: None,
                error: Some(LedgerFailure::InvalidAmount),
            };
        }

        match self
            .profiles
            .credit(TokenTransaction::credit(user_id, tokens, reason).at(self.clock.now()))
            .await
        {
            Ok(transaction) => {
                self.metrics.tokens_credited.add(tokens);
                tracing::info!(user_id, tokens, reason, balance = transaction.balance_after, "tokens credited");
                self.notifier.publish(BalanceEvent::new(
                    user_id,
                    BalanceChange::Credited,
                    tokens,
                    transaction.balance_after,
                    transaction.created_at,
                ));
                CreditResult {
                    success: true,
                    balance: transaction.balance_after,
                    transaction_id: Some(transaction.id),
                    error: None,
                }
            }
            Err(e) => {
                tracing::error!(user_id, tokens, error = %e, "token credit failed");
                CreditResult {
                    success: false,
                    balance: 0,
                    transaction_id: None,
                    error: Some(LedgerFailure::Unavailable {
                        message: e.to_string(),
                    }),
                }
            }
        }
    }

    /// Newest first.
    pub async fn transactions(
        &self,
        user_id: &str,
        limit: usize,
    ) -> StoreResult<Vec<TokenTransaction>> {
        self.profiles.transactions(user_id, limit).await
    }

    pub async fn balance(&self, user_id: &str) -> StoreResult<u64> {
        self.profiles
            .get_profile(user_id)
            .await?
            .map(|p| p.token_balance)
            .ok_or_else(|| StoreError::not_found(user_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pricing::ModelCost;
    use crate::store::MemoryProfileStore;
    use crate::store::testing::FlakyProfileStore;
    use crate::types::UserProfile;
    use rust_decimal_macros::dec;
    use std::sync::atomic::Ordering;

    fn pricing() -> Arc<PricingTable> {
        Arc::new(
            PricingTable::builder()
                .with_defaults()
                .model(
                    "test-model",
                    ModelCost::with_rate("acme", dec!(0.25), Default::default(), 1_000_000),
                )
                .build(),
        )
    }

    fn ledger(store: Arc<dyn ProfileStore>) -> TokenLedger {
        TokenLedger::new(store).with_pricing(pricing())
    }

    #[tokio::test]
    async fn test_deducts_model_base_cost() {
        let store = MemoryProfileStore::with_profiles([UserProfile::new("u1").with_paid_tokens(1_000_000)]);
        let ledger = ledger(Arc::new(store.clone()));

        let result = ledger
            .deduct_tokens_for_request("u1", "test-model", "acme", 0, "chat")
            .await;

        assert!(result.success);
        assert_eq!(result.tokens, 250_000);
        assert_eq!(result.balance, 750_000);
        assert_eq!(result.path, Some(DeductionPath::Atomic));

        let history = store.transactions("u1", 10).await.unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].model_id.as_deref(), Some("test-model"));
        assert_eq!(Some(history[0].id), result.transaction_id);
    }

    #[tokio::test]
    async fn test_caller_amount_wins() {
        let store = MemoryProfileStore::with_profiles([UserProfile::new("u1").with_paid_tokens(500)]);
        let ledger = ledger(Arc::new(store));
        let result = ledger
            .deduct_tokens_for_request("u1", "test-model", "", 120, "chat")
            .await;
        assert_eq!(result.balance, 380);
    }

    #[tokio::test]
    async fn test_insufficient_balance_is_structured() {
        let store = FlakyProfileStore::new(MemoryProfileStore::with_profiles([
            UserProfile::new("u1").with_paid_tokens(100),
        ]));
        let ledger = ledger(store.clone());
        let mut events = ledger.notifier().subscribe();

        let result = ledger
            .deduct_tokens_for_request("u1", "test-model", "acme", 400, "chat")
            .await;

        assert!(!result.success);
        assert!(result.is_insufficient());
        assert_eq!(result.balance, 100);
        assert_eq!(store.inner.transaction_count().await, 0);
        assert!(events.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_atomic_failure_falls_back() {
        let store = FlakyProfileStore::new(MemoryProfileStore::with_profiles([
            UserProfile::new("u1").with_free_tokens(100).with_paid_tokens(900),
        ]));
        store.fail_atomic.store(true, Ordering::SeqCst);
        let metrics = Arc::new(MeteringMetrics::new());
        let ledger = ledger(store.clone()).with_metrics(Arc::clone(&metrics));
        let mut events = ledger.notifier().subscribe();

        let result = ledger
            .deduct_tokens_for_request("u1", "test-model", "acme", 300, "chat")
            .await;

        assert!(result.success);
        assert_eq!(result.path, Some(DeductionPath::Fallback));
        assert_eq!(result.balance, 700);
        let profile = store.inner.get_profile("u1").await.unwrap().unwrap();
        assert_eq!((profile.free_tokens, profile.paid_tokens), (0, 700));

        assert_eq!(events.try_recv().unwrap().balance, 700);
        assert!(events.try_recv().is_err());
        assert_eq!(metrics.deductions_fallback.get(), 1);
    }

    #[tokio::test]
    async fn test_fallback_clamps_at_zero() {
        let store = FlakyProfileStore::new(MemoryProfileStore::with_profiles([
            UserProfile::new("u1").with_paid_tokens(50),
        ]));
        store.fail_atomic.store(true, Ordering::SeqCst);
        let ledger = ledger(store.clone());

        let result = ledger
            .deduct_tokens_for_request("u1", "test-model", "acme", 80, "chat")
            .await;

        assert!(result.success);
        assert_eq!(result.balance, 0);
        assert_eq!(result.shortfall, 30);
        let history = store.inner.transactions("u1", 1).await.unwrap();
        assert_eq!(history[0].shortfall, 30);
        assert_eq!(history[0].settled_tokens(), 50);
    }

    #[tokio::test]
    async fn test_both_paths_failing() {
        let store = FlakyProfileStore::new(MemoryProfileStore::with_profiles([
            UserProfile::new("u1").with_paid_tokens(500),
        ]));
        store.fail_atomic.store(true, Ordering::SeqCst);
        store.fail_reads.store(true, Ordering::SeqCst);
        let ledger = ledger(store.clone());
        let mut events = ledger.notifier().subscribe();

        let result = ledger
            .deduct_tokens_for_request("u1", "test-model", "acme", 10, "chat")
            .await;

        assert!(!result.success);
        assert!(matches!(result.error, Some(LedgerFailure::Unavailable { .. })));
        assert_eq!(store.atomic_calls.load(Ordering::SeqCst), 1);
        assert!(events.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_missing_profile_skips_fallback() {
        let ledger = ledger(Arc::new(MemoryProfileStore::new()));
        let result = ledger
            .deduct_tokens_for_request("ghost", "test-model", "acme", 10, "chat")
            .await;
        assert_eq!(
            result.error,
            Some(LedgerFailure::ProfileNotFound {
                user_id: "ghost".into()
            })
        );
    }

    #[tokio::test]
    async fn test_timestamps_follow_injected_clock() {
        use crate::clock::ManualClock;
        use chrono::{TimeZone, Utc};

        let at = Utc.with_ymd_and_hms(2026, 7, 4, 12, 0, 0).unwrap();
        let store = FlakyProfileStore::new(MemoryProfileStore::with_profiles([
            UserProfile::new("u1").with_paid_tokens(500),
        ]));
        store.fail_atomic.store(true, Ordering::SeqCst);
        let ledger = ledger(store.clone()).with_clock(Arc::new(ManualClock::new(at)));
        let mut events = ledger.notifier().subscribe();

        ledger
            .deduct_tokens_for_request("u1", "test-model", "acme", 10, "chat")
            .await;

        assert_eq!(events.try_recv().unwrap().at, at);
        let profile = store.inner.get_profile("u1").await.unwrap().unwrap();
        assert_eq!(profile.updated_at, at);
        let history = store.inner.transactions("u1", 1).await.unwrap();
        assert_eq!(history[0].created_at, at);
    }

    #[tokio::test]
    async fn test_credit_and_balance() {
        let store = MemoryProfileStore::new();
        let ledger = ledger(Arc::new(store));
        let mut events = ledger.notifier().subscribe();

        let credit = ledger.credit_tokens("u2", 2_000, "purchase").await;
        assert!(credit.success);
        assert_eq!(credit.balance, 2_000);
        assert_eq!(events.try_recv().unwrap().change, BalanceChange::Credited);
        assert_eq!(ledger.balance("u2").await.unwrap(), 2_000);

        let zero = ledger.credit_tokens("u2", 0, "purchase").await;
        assert_eq!(zero.error, Some(LedgerFailure::InvalidAmount));
        assert!(ledger.balance("nobody").await.unwrap_err().is_not_found());
    }
}

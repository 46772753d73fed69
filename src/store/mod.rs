//! Storage backends for profiles, ledger entries and usage counters.
//!
//! The store is the only authoritative copy of balances and counters. Every
//! read is a fresh fetch and every mutation is a single remote operation.

pub mod memory;
#[cfg(feature = "postgres")]
pub mod postgres;
#[cfg(feature = "redis-backend")]
pub mod redis_usage;

pub use memory::{MemoryProfileStore, MemoryUsageStore};
#[cfg(feature = "postgres")]
pub use postgres::{PostgresConfig, PostgresProfileStore, PostgresUsageStore};
#[cfg(feature = "redis-backend")]
pub use redis_usage::{RedisConfig, RedisUsageStore};

use thiserror::Error;

use crate::types::{GenerationType, TokenTransaction, UsagePeriod, UserProfile};

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Profile not found: {user_id}")]
    NotFound { user_id: String },

    #[error("Store unavailable: {message}")]
    Unavailable { message: String },

    #[error("Storage error: {message}")]
    Storage { message: String },

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl StoreError {
    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::Unavailable {
            message: message.into(),
        }
    }

    pub fn not_found(user_id: impl Into<String>) -> Self {
        Self::NotFound {
            user_id: user_id.into(),
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }
}

pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Result of the atomic deduct-if-sufficient operation.
#[derive(Debug, Clone, PartialEq)]
pub enum DeductOutcome {
    /// Balance covered the debit; the stored transaction is returned with its
    /// `balance_after` filled in.
    Deducted(TokenTransaction),
    /// Nothing was written.
    Insufficient { balance: u64 },
}

/// Result of an atomic check-and-increment on a usage counter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CounterUpdate {
    pub allowed: bool,
    /// Post-increment count when allowed, otherwise the unchanged count.
    pub count: u32,
}

/// Profile and ledger storage.
#[async_trait::async_trait]
pub trait ProfileStore: Send + Sync {
    fn name(&self) -> &str;

    async fn get_profile(&self, user_id: &str) -> StoreResult<Option<UserProfile>>;

    /// Plain write used by the non-atomic paths (fallback debit, refresh).
    async fn put_profile(&self, profile: &UserProfile) -> StoreResult<()>;

    /// Checks `balance >= transaction.tokens`, debits and appends the
    /// transaction as one operation. The transaction's `path` is set to
    /// `Atomic` by the store.
    async fn deduct_if_sufficient(
        &self,
        user_id: &str,
        transaction: TokenTransaction,
    ) -> StoreResult<DeductOutcome>;

    /// Adds `transaction.tokens` to the paid bucket and appends the
    /// transaction as one operation, creating the profile if absent.
    async fn credit(&self, transaction: TokenTransaction) -> StoreResult<TokenTransaction>;

    /// Resets the free bucket to the daily allowance and appends the refresh
    /// transaction as one operation, if the refresh is due at
    /// `transaction.created_at`. The store fills in `tokens` and
    /// `balance_after`. `None` for a missing, unenrolled or recently
    /// refreshed profile.
    async fn refresh_if_due(
        &self,
        user_id: &str,
        transaction: TokenTransaction,
    ) -> StoreResult<Option<TokenTransaction>>;

    async fn append_transaction(&self, transaction: &TokenTransaction) -> StoreResult<()>;

    /// Newest first.
    async fn transactions(&self, user_id: &str, limit: usize)
    -> StoreResult<Vec<TokenTransaction>>;
}

/// Per-period generation counters keyed by user, period and type.
#[async_trait::async_trait]
pub trait UsageStore: Send + Sync {
    fn name(&self) -> &str;

    /// Zero when no record exists for the period.
    async fn get_count(
        &self,
        user_id: &str,
        period: &UsagePeriod,
        kind: GenerationType,
    ) -> StoreResult<u32>;

    /// Creates the record at 1 or increments it; returns the new count.
    async fn increment(
        &self,
        user_id: &str,
        period: &UsagePeriod,
        kind: GenerationType,
    ) -> StoreResult<u32>;

    /// Increments only while `count < limit`, as one operation.
    async fn check_and_increment(
        &self,
        user_id: &str,
        period: &UsagePeriod,
        kind: GenerationType,
        limit: u32,
    ) -> StoreResult<CounterUpdate>;
}

#[cfg(any(feature = "postgres", feature = "redis-backend"))]
pub(crate) trait StorageResultExt<T> {
    fn storage_err(self) -> StoreResult<T>;
    fn storage_err_ctx(self, context: &str) -> StoreResult<T>;
}

#[cfg(any(feature = "postgres", feature = "redis-backend"))]
impl<T, E: std::fmt::Display> StorageResultExt<T> for std::result::Result<T, E> {
    fn storage_err(self) -> StoreResult<T> {
        self.map_err(|e| StoreError::Storage {
            message: e.to_string(),
        })
    }

    fn storage_err_ctx(self, context: &str) -> StoreResult<T> {
        self.map_err(|e| StoreError::Unavailable {
            message: format!("{}: {}", context, e),
        })
    }
}

/// Retries side-effect free operations such as acquiring a connection.
/// Never wrap a debit in this: a retry after an ambiguous failure can charge
/// twice.
#[cfg(any(feature = "postgres", feature = "redis-backend"))]
pub(crate) async fn with_retry<F, Fut, T>(
    max_retries: u32,
    initial_backoff: std::time::Duration,
    max_backoff: std::time::Duration,
    is_retryable: impl Fn(&StoreError) -> bool,
    operation: F,
) -> StoreResult<T>
where
    F: Fn() -> Fut,
    Fut: std::future::Future<Output = StoreResult<T>>,
{
    let mut attempt = 0;
    let mut backoff = initial_backoff;

    loop {
        match operation().await {
            Ok(result) => return Ok(result),
            Err(e) if attempt < max_retries && is_retryable(&e) => {
                attempt += 1;
                tracing::warn!(
                    attempt = attempt,
                    error = %e,
                    "Retrying store operation after transient failure"
                );
                let jitter_factor = 1.0 + (rand::random::<f64>() * 0.2 - 0.1);
                tokio::time::sleep(backoff.mul_f64(jitter_factor)).await;
                backoff = (backoff * 2).min(max_backoff);
            }
            Err(e) => return Err(e),
        }
    }
}

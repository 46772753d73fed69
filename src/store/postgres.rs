//! PostgreSQL backends for profiles, the ledger and usage counters.
//!
//! Enable with the `postgres` feature flag. The atomic debit runs inside the
//! `<prefix>deduct_tokens` stored function created by [`PostgresProfileStore::migrate`],
//! which locks the profile row with `SELECT ... FOR UPDATE`.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::Row;

use super::{
    CounterUpdate, DeductOutcome, ProfileStore, StorageResultExt, StoreError, StoreResult,
    UsageStore,
};
use crate::types::{
    DAILY_REFRESH_INTERVAL_HOURS, DeductionPath, GenerationType, Plan, TokenTransaction,
    TransactionKind, UsagePeriod, UserProfile,
};

/// SQLSTATE raised by the stored function when the profile row is missing.
const NO_DATA_FOUND: &str = "P0002";

#[derive(Clone, Debug)]
pub struct PostgresConfig {
    pub table_prefix: String,
    pub max_connections: u32,
    pub connect_timeout: Duration,
    pub max_retries: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for PostgresConfig {
    fn default() -> Self {
        Self {
            table_prefix: "kroniq_".to_string(),
            max_connections: 10,
            connect_timeout: Duration::from_secs(10),
            max_retries: 3,
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(5),
        }
    }
}

impl PostgresConfig {
    pub fn prefix(mut self, prefix: impl Into<String>) -> StoreResult<Self> {
        let prefix = prefix.into();
        if !prefix
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_')
        {
            return Err(StoreError::Storage {
                message: format!(
                    "Invalid table prefix '{}': only ASCII alphanumeric and underscore allowed",
                    prefix
                ),
            });
        }
        self.table_prefix = prefix;
        Ok(self)
    }

    pub fn max_connections(mut self, max: u32) -> Self {
        self.max_connections = max;
        self
    }

    fn profiles_table(&self) -> String {
        format!("{}user_profiles", self.table_prefix)
    }

    fn transactions_table(&self) -> String {
        format!("{}token_transactions", self.table_prefix)
    }

    fn usage_table(&self) -> String {
        format!("{}generation_usage", self.table_prefix)
    }

    fn deduct_function(&self) -> String {
        format!("{}deduct_tokens", self.table_prefix)
    }

    pub async fn connect(&self, database_url: &str) -> StoreResult<Arc<PgPool>> {
        let pool = super::with_retry(
            self.max_retries,
            self.initial_backoff,
            self.max_backoff,
            |e| matches!(e, StoreError::Unavailable { .. }),
            || async {
                PgPoolOptions::new()
                    .max_connections(self.max_connections)
                    .acquire_timeout(self.connect_timeout)
                    .connect(database_url)
                    .await
                    .storage_err_ctx("connect")
            },
        )
        .await?;
        Ok(Arc::new(pool))
    }
}

fn to_db(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

fn from_db(value: i64) -> u64 {
    u64::try_from(value).unwrap_or(0)
}

fn map_sqlx(error: sqlx::Error) -> StoreError {
    match &error {
        sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed | sqlx::Error::Io(_) => {
            StoreError::unavailable(error.to_string())
        }
        _ => StoreError::Storage {
            message: error.to_string(),
        },
    }
}

pub struct PostgresProfileStore {
    pool: Arc<PgPool>,
    config: PostgresConfig,
}

impl PostgresProfileStore {
    pub async fn new(database_url: &str) -> StoreResult<Self> {
        let config = PostgresConfig::default();
        let pool = config.connect(database_url).await?;
        Ok(Self::with_pool(pool, config))
    }

    pub fn with_pool(pool: Arc<PgPool>, config: PostgresConfig) -> Self {
        Self { pool, config }
    }

    pub fn pool(&self) -> Arc<PgPool> {
        Arc::clone(&self.pool)
    }

    /// Creates tables, indexes and the atomic debit function. Idempotent.
    pub async fn migrate(&self) -> StoreResult<()> {
        let profiles = self.config.profiles_table();
        let transactions = self.config.transactions_table();
        let usage = self.config.usage_table();
        let function = self.config.deduct_function();

        let ddl = format!(
            r#"
            CREATE TABLE IF NOT EXISTS {profiles} (
                user_id VARCHAR(255) PRIMARY KEY,
                plan VARCHAR(32) NOT NULL DEFAULT 'free',
                token_balance BIGINT NOT NULL DEFAULT 0 CHECK (token_balance >= 0),
                free_tokens BIGINT NOT NULL DEFAULT 0 CHECK (free_tokens >= 0),
                paid_tokens BIGINT NOT NULL DEFAULT 0 CHECK (paid_tokens >= 0),
                daily_free_token_allowance BIGINT NOT NULL DEFAULT 0,
                last_token_refresh TIMESTAMPTZ,
                updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
            );

            CREATE TABLE IF NOT EXISTS {transactions} (
                id UUID PRIMARY KEY,
                user_id VARCHAR(255) NOT NULL,
                kind VARCHAR(16) NOT NULL,
                tokens BIGINT NOT NULL,
                cost_usd NUMERIC(20, 8) NOT NULL DEFAULT 0,
                model_id VARCHAR(255),
                provider VARCHAR(255),
                request_type VARCHAR(64),
                path VARCHAR(16),
                shortfall BIGINT NOT NULL DEFAULT 0,
                balance_after BIGINT NOT NULL,
                created_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
            );
            CREATE INDEX IF NOT EXISTS idx_{transactions}_user
                ON {transactions} (user_id, created_at DESC);

            CREATE TABLE IF NOT EXISTS {usage} (
                user_id VARCHAR(255) NOT NULL,
                period_key VARCHAR(10) NOT NULL,
                generation_type VARCHAR(16) NOT NULL,
                count INTEGER NOT NULL DEFAULT 0,
                updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                PRIMARY KEY (user_id, period_key, generation_type)
            );

            CREATE OR REPLACE FUNCTION {function}(
                p_user_id VARCHAR,
                p_tokens BIGINT,
                p_tx_id UUID,
                p_cost NUMERIC,
                p_model VARCHAR,
                p_provider VARCHAR,
                p_request_type VARCHAR
            ) RETURNS TABLE (deducted BOOLEAN, balance BIGINT) AS $$
            DECLARE
                v_free BIGINT;
                v_paid BIGINT;
                v_from_free BIGINT;
            BEGIN
                SELECT free_tokens, paid_tokens INTO v_free, v_paid
                    FROM {profiles} WHERE user_id = p_user_id FOR UPDATE;
                IF NOT FOUND THEN
                    RAISE EXCEPTION 'profile % not found', p_user_id
                        USING ERRCODE = 'no_data_found';
                END IF;

                IF v_free + v_paid < p_tokens THEN
                    RETURN QUERY SELECT FALSE, v_free + v_paid;
                    RETURN;
                END IF;

                v_from_free := LEAST(v_free, p_tokens);
                UPDATE {profiles} SET
                    free_tokens = v_free - v_from_free,
                    paid_tokens = v_paid - (p_tokens - v_from_free),
                    token_balance = v_free + v_paid - p_tokens,
                    updated_at = NOW()
                WHERE user_id = p_user_id;

                INSERT INTO {transactions}
                    (id, user_id, kind, tokens, cost_usd, model_id, provider,
                     request_type, path, balance_after)
                VALUES
                    (p_tx_id, p_user_id, 'debit', p_tokens, p_cost, p_model, p_provider,
                     p_request_type, 'atomic', v_free + v_paid - p_tokens);

                RETURN QUERY SELECT TRUE, v_free + v_paid - p_tokens;
            END;
            $$ LANGUAGE plpgsql;
            "#
        );

        sqlx::raw_sql(&ddl)
            .execute(&*self.pool)
            .await
            .map_err(map_sqlx)?;
        Ok(())
    }

    fn profile_from_row(row: &PgRow) -> StoreResult<UserProfile> {
        let plan: String = row.try_get("plan").storage_err()?;
        Ok(UserProfile {
            user_id: row.try_get("user_id").storage_err()?,
            plan: Plan::from_label(&plan),
            token_balance: from_db(row.try_get("token_balance").storage_err()?),
            free_tokens: from_db(row.try_get("free_tokens").storage_err()?),
            paid_tokens: from_db(row.try_get("paid_tokens").storage_err()?),
            daily_free_token_allowance: from_db(
                row.try_get("daily_free_token_allowance").storage_err()?,
            ),
            last_token_refresh: row.try_get("last_token_refresh").storage_err()?,
            updated_at: row.try_get("updated_at").storage_err()?,
        })
    }

    fn transaction_from_row(row: &PgRow) -> StoreResult<TokenTransaction> {
        let kind: String = row.try_get("kind").storage_err()?;
        let path: Option<String> = row.try_get("path").storage_err()?;
        Ok(TokenTransaction {
            id: row.try_get("id").storage_err()?,
            user_id: row.try_get("user_id").storage_err()?,
            kind: match kind.as_str() {
                "credit" => TransactionKind::Credit,
                "refresh" => TransactionKind::Refresh,
                _ => TransactionKind::Debit,
            },
            tokens: from_db(row.try_get("tokens").storage_err()?),
            cost_usd: row.try_get("cost_usd").storage_err()?,
            model_id: row.try_get("model_id").storage_err()?,
            provider: row.try_get("provider").storage_err()?,
            request_type: row.try_get("request_type").storage_err()?,
            path: path.map(|p| match p.as_str() {
                "fallback" => DeductionPath::Fallback,
                _ => DeductionPath::Atomic,
            }),
            shortfall: from_db(row.try_get("shortfall").storage_err()?),
            balance_after: from_db(row.try_get("balance_after").storage_err()?),
            created_at: row.try_get("created_at").storage_err()?,
        })
    }

    async fn insert_transaction<'e, E>(
        &self,
        executor: E,
        transaction: &TokenTransaction,
    ) -> StoreResult<()>
    where
        E: sqlx::Executor<'e, Database = sqlx::Postgres>,
    {
        let query = format!(
            r#"
            INSERT INTO {} (id, user_id, kind, tokens, cost_usd, model_id, provider,
                            request_type, path, shortfall, balance_after, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
            "#,
            self.config.transactions_table()
        );

        sqlx::query(&query)
            .bind(transaction.id)
            .bind(&transaction.user_id)
            .bind(transaction.kind.as_str())
            .bind(to_db(transaction.tokens))
            .bind(transaction.cost_usd)
            .bind(&transaction.model_id)
            .bind(&transaction.provider)
            .bind(&transaction.request_type)
            .bind(transaction.path.map(|p| p.as_str()))
            .bind(to_db(transaction.shortfall))
            .bind(to_db(transaction.balance_after))
            .bind(transaction.created_at)
            .execute(executor)
            .await
            .map_err(map_sqlx)?;
        Ok(())
    }
}

#[async_trait]
impl ProfileStore for PostgresProfileStore {
    fn name(&self) -> &str {
        "postgres"
    }

    async fn get_profile(&self, user_id: &str) -> StoreResult<Option<UserProfile>> {
        let query = format!(
            "SELECT * FROM {} WHERE user_id = $1",
            self.config.profiles_table()
        );
        let row = sqlx::query(&query)
            .bind(user_id)
            .fetch_optional(&*self.pool)
            .await
            .map_err(map_sqlx)?;

        row.as_ref().map(Self::profile_from_row).transpose()
    }

    async fn put_profile(&self, profile: &UserProfile) -> StoreResult<()> {
        let query = format!(
            r#"
            INSERT INTO {} (user_id, plan, token_balance, free_tokens, paid_tokens,
                            daily_free_token_allowance, last_token_refresh, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            ON CONFLICT (user_id) DO UPDATE SET
                plan = $2,
                token_balance = $3,
                free_tokens = $4,
                paid_tokens = $5,
                daily_free_token_allowance = $6,
                last_token_refresh = $7,
                updated_at = $8
            "#,
            self.config.profiles_table()
        );

        sqlx::query(&query)
            .bind(&profile.user_id)
            .bind(profile.plan.as_str())
            .bind(to_db(profile.token_balance))
            .bind(to_db(profile.free_tokens))
            .bind(to_db(profile.paid_tokens))
            .bind(to_db(profile.daily_free_token_allowance))
            .bind(profile.last_token_refresh)
            .bind(profile.updated_at)
            .execute(&*self.pool)
            .await
            .map_err(map_sqlx)?;
        Ok(())
    }

    async fn deduct_if_sufficient(
        &self,
        user_id: &str,
        mut transaction: TokenTransaction,
    ) -> StoreResult<DeductOutcome> {
        let query = format!(
            "SELECT deducted, balance FROM {}($1, $2, $3, $4, $5, $6, $7)",
            self.config.deduct_function()
        );

        let row = sqlx::query(&query)
            .bind(user_id)
            .bind(to_db(transaction.tokens))
            .bind(transaction.id)
            .bind(transaction.cost_usd)
            .bind(&transaction.model_id)
            .bind(&transaction.provider)
            .bind(&transaction.request_type)
            .fetch_one(&*self.pool)
            .await
            .map_err(|e| {
                if let sqlx::Error::Database(db) = &e
                    && db.code().as_deref() == Some(NO_DATA_FOUND)
                {
                    return StoreError::not_found(user_id);
                }
                map_sqlx(e)
            })?;

        let deducted: bool = row.try_get("deducted").storage_err()?;
        let balance = from_db(row.try_get("balance").storage_err()?);

        if !deducted {
            return Ok(DeductOutcome::Insufficient { balance });
        }

        transaction.path = Some(DeductionPath::Atomic);
        transaction.balance_after = balance;
        Ok(DeductOutcome::Deducted(transaction))
    }

    async fn credit(&self, mut transaction: TokenTransaction) -> StoreResult<TokenTransaction> {
        let query = format!(
            r#"
            INSERT INTO {} (user_id, paid_tokens, token_balance)
            VALUES ($1, $2, $2)
            ON CONFLICT (user_id) DO UPDATE SET
                paid_tokens = {}.paid_tokens + $2,
                token_balance = {}.token_balance + $2,
                updated_at = NOW()
            RETURNING token_balance
            "#,
            self.config.profiles_table(),
            self.config.profiles_table(),
            self.config.profiles_table()
        );

        let mut tx = self.pool.begin().await.map_err(map_sqlx)?;

        let row = sqlx::query(&query)
            .bind(&transaction.user_id)
            .bind(to_db(transaction.tokens))
            .fetch_one(&mut *tx)
            .await
            .map_err(map_sqlx)?;
        transaction.balance_after = from_db(row.try_get("token_balance").storage_err()?);

        self.insert_transaction(&mut *tx, &transaction).await?;
        tx.commit().await.map_err(map_sqlx)?;

        Ok(transaction)
    }

    async fn refresh_if_due(
        &self,
        user_id: &str,
        mut transaction: TokenTransaction,
    ) -> StoreResult<Option<TokenTransaction>> {
        let query = format!(
            r#"
            UPDATE {} SET
                free_tokens = daily_free_token_allowance,
                token_balance = daily_free_token_allowance + paid_tokens,
                last_token_refresh = $2,
                updated_at = $2
            WHERE user_id = $1
              AND daily_free_token_allowance > 0
              AND (last_token_refresh IS NULL
                   OR last_token_refresh <= $2 - make_interval(hours => $3))
            RETURNING daily_free_token_allowance, token_balance
            "#,
            self.config.profiles_table()
        );

        let mut tx = self.pool.begin().await.map_err(map_sqlx)?;

        let row = sqlx::query(&query)
            .bind(user_id)
            .bind(transaction.created_at)
            .bind(i32::try_from(DAILY_REFRESH_INTERVAL_HOURS).unwrap_or(24))
            .fetch_optional(&mut *tx)
            .await
            .map_err(map_sqlx)?;
        let Some(row) = row else {
            tx.rollback().await.map_err(map_sqlx)?;
            return Ok(None);
        };

        transaction.tokens = from_db(row.try_get("daily_free_token_allowance").storage_err()?);
        transaction.balance_after = from_db(row.try_get("token_balance").storage_err()?);
        self.insert_transaction(&mut *tx, &transaction).await?;
        tx.commit().await.map_err(map_sqlx)?;

        Ok(Some(transaction))
    }

    async fn append_transaction(&self, transaction: &TokenTransaction) -> StoreResult<()> {
        self.insert_transaction(&*self.pool, transaction).await
    }

    async fn transactions(
        &self,
        user_id: &str,
        limit: usize,
    ) -> StoreResult<Vec<TokenTransaction>> {
        let query = format!(
            "SELECT * FROM {} WHERE user_id = $1 ORDER BY created_at DESC LIMIT $2",
            self.config.transactions_table()
        );

        let rows = sqlx::query(&query)
            .bind(user_id)
            .bind(i64::try_from(limit).unwrap_or(i64::MAX))
            .fetch_all(&*self.pool)
            .await
            .map_err(map_sqlx)?;

        rows.iter().map(Self::transaction_from_row).collect()
    }
}

pub struct PostgresUsageStore {
    pool: Arc<PgPool>,
    config: PostgresConfig,
}

impl PostgresUsageStore {
    /// Shares the pool of a profile store; run the profile store's
    /// `migrate` first, it creates the usage table too.
    pub fn with_pool(pool: Arc<PgPool>, config: PostgresConfig) -> Self {
        Self { pool, config }
    }
}

#[async_trait]
impl UsageStore for PostgresUsageStore {
    fn name(&self) -> &str {
        "postgres"
    }

    async fn get_count(
        &self,
        user_id: &str,
        period: &UsagePeriod,
        kind: GenerationType,
    ) -> StoreResult<u32> {
        let query = format!(
            "SELECT count FROM {} WHERE user_id = $1 AND period_key = $2 AND generation_type = $3",
            self.config.usage_table()
        );

        let count: Option<i32> = sqlx::query_scalar(&query)
            .bind(user_id)
            .bind(period.key())
            .bind(kind.as_str())
            .fetch_optional(&*self.pool)
            .await
            .map_err(map_sqlx)?;

        Ok(count.map(|c| u32::try_from(c).unwrap_or(0)).unwrap_or(0))
    }

    async fn increment(
        &self,
        user_id: &str,
        period: &UsagePeriod,
        kind: GenerationType,
    ) -> StoreResult<u32> {
        let table = self.config.usage_table();
        let query = format!(
            r#"
            INSERT INTO {table} (user_id, period_key, generation_type, count)
            VALUES ($1, $2, $3, 1)
            ON CONFLICT (user_id, period_key, generation_type) DO UPDATE SET
                count = {table}.count + 1,
                updated_at = NOW()
            RETURNING count
            "#
        );

        let count: i32 = sqlx::query_scalar(&query)
            .bind(user_id)
            .bind(period.key())
            .bind(kind.as_str())
            .fetch_one(&*self.pool)
            .await
            .map_err(map_sqlx)?;

        Ok(u32::try_from(count).unwrap_or(0))
    }

    async fn check_and_increment(
        &self,
        user_id: &str,
        period: &UsagePeriod,
        kind: GenerationType,
        limit: u32,
    ) -> StoreResult<CounterUpdate> {
        if limit == 0 {
            let count = self.get_count(user_id, period, kind).await?;
            return Ok(CounterUpdate {
                allowed: false,
                count,
            });
        }

        let table = self.config.usage_table();
        let query = format!(
            r#"
            INSERT INTO {table} (user_id, period_key, generation_type, count)
            VALUES ($1, $2, $3, 1)
            ON CONFLICT (user_id, period_key, generation_type) DO UPDATE SET
                count = {table}.count + 1,
                updated_at = NOW()
            WHERE {table}.count < $4
            RETURNING count
            "#
        );

        let updated: Option<i32> = sqlx::query_scalar(&query)
            .bind(user_id)
            .bind(period.key())
            .bind(kind.as_str())
            .bind(i32::try_from(limit).unwrap_or(i32::MAX))
            .fetch_optional(&*self.pool)
            .await
            .map_err(map_sqlx)?;

        match updated {
            Some(count) => Ok(CounterUpdate {
                allowed: true,
                count: u32::try_from(count).unwrap_or(0),
            }),
            None => Ok(CounterUpdate {
                allowed: false,
                count: self.get_count(user_id, period, kind).await?,
            }),
        }
    }
}

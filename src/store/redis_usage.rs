//! Redis backend for usage counters.
//!
//! Counters are plain integer keys that expire after their period has passed;
//! past periods are never read. Check-and-increment runs as a Lua script so
//! the comparison and the `INCR` cannot interleave with another client.

use async_trait::async_trait;
use redis::AsyncCommands;
use std::sync::Arc;
use std::time::Duration;

use super::{CounterUpdate, StorageResultExt, StoreError, StoreResult, UsageStore};
use crate::types::{GenerationType, UsagePeriod};

const CHECK_AND_INCREMENT: &str = r#"
    local current = tonumber(redis.call('GET', KEYS[1]) or '0')
    local limit = tonumber(ARGV[1])
    if current >= limit then
        return {0, current}
    end
    local updated = redis.call('INCR', KEYS[1])
    redis.call('EXPIRE', KEYS[1], ARGV[2])
    return {1, updated}
"#;

#[derive(Clone, Debug)]
pub struct RedisConfig {
    pub key_prefix: String,
    pub daily_ttl: Duration,
    pub monthly_ttl: Duration,
    pub connection_timeout: Duration,
    /// Maximum retry attempts when acquiring a connection.
    pub max_retries: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            key_prefix: "kroniq:usage:".to_string(),
            daily_ttl: Duration::from_secs(86400 * 2),
            monthly_ttl: Duration::from_secs(86400 * 35),
            connection_timeout: Duration::from_secs(5),
            max_retries: 3,
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(2),
        }
    }
}

impl RedisConfig {
    pub fn prefix(mut self, prefix: impl Into<String>) -> StoreResult<Self> {
        let prefix = prefix.into();
        if !prefix
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == ':')
        {
            return Err(StoreError::Storage {
                message: format!(
                    "Invalid key prefix '{}': only ASCII alphanumeric, underscore, and colon allowed",
                    prefix
                ),
            });
        }
        self.key_prefix = prefix;
        Ok(self)
    }

    fn ttl_for(&self, period: &UsagePeriod) -> u64 {
        if period.is_daily() {
            self.daily_ttl.as_secs()
        } else {
            self.monthly_ttl.as_secs()
        }
    }
}

pub struct RedisUsageStore {
    client: Arc<redis::Client>,
    config: RedisConfig,
    script: redis::Script,
}

impl RedisUsageStore {
    pub fn new(redis_url: &str) -> Result<Self, redis::RedisError> {
        Self::from_config(redis_url, RedisConfig::default())
    }

    pub fn from_config(redis_url: &str, config: RedisConfig) -> Result<Self, redis::RedisError> {
        let client = redis::Client::open(redis_url)?;
        Ok(Self {
            client: Arc::new(client),
            config,
            script: redis::Script::new(CHECK_AND_INCREMENT),
        })
    }

    fn counter_key(&self, user_id: &str, period: &UsagePeriod, kind: GenerationType) -> String {
        format!("{}{}:{}:{}", self.config.key_prefix, period.key(), user_id, kind)
    }

    async fn get_connection(&self) -> StoreResult<redis::aio::MultiplexedConnection> {
        super::with_retry(
            self.config.max_retries,
            self.config.initial_backoff,
            self.config.max_backoff,
            Self::is_retryable,
            || async {
                tokio::time::timeout(
                    self.config.connection_timeout,
                    self.client.get_multiplexed_async_connection(),
                )
                .await
                .storage_err_ctx("connection timeout")?
                .storage_err_ctx("connection")
            },
        )
        .await
    }

    fn is_retryable(error: &StoreError) -> bool {
        match error {
            StoreError::Unavailable { message } => {
                message.contains("timeout")
                    || message.contains("connection")
                    || message.contains("BUSY")
                    || message.contains("LOADING")
            }
            _ => false,
        }
    }
}

#[async_trait]
impl UsageStore for RedisUsageStore {
    fn name(&self) -> &str {
        "redis"
    }

    async fn get_count(
        &self,
        user_id: &str,
        period: &UsagePeriod,
        kind: GenerationType,
    ) -> StoreResult<u32> {
        let mut conn = self.get_connection().await?;
        let count: Option<u32> = conn
            .get(self.counter_key(user_id, period, kind))
            .await
            .storage_err()?;
        Ok(count.unwrap_or(0))
    }

    async fn increment(
        &self,
        user_id: &str,
        period: &UsagePeriod,
        kind: GenerationType,
    ) -> StoreResult<u32> {
        let mut conn = self.get_connection().await?;
        let key = self.counter_key(user_id, period, kind);

        let (count,): (u32,) = redis::pipe()
            .atomic()
            .incr(&key, 1)
            .expire(&key, self.config.ttl_for(period) as i64)
            .ignore()
            .query_async(&mut conn)
            .await
            .storage_err()?;

        Ok(count)
    }

    async fn check_and_increment(
        &self,
        user_id: &str,
        period: &UsagePeriod,
        kind: GenerationType,
        limit: u32,
    ) -> StoreResult<CounterUpdate> {
        let mut conn = self.get_connection().await?;

        let (allowed, count): (i64, i64) = self
            .script
            .key(self.counter_key(user_id, period, kind))
            .arg(limit)
            .arg(self.config.ttl_for(period))
            .invoke_async(&mut conn)
            .await
            .storage_err()?;

        Ok(CounterUpdate {
            allowed: allowed == 1,
            count: u32::try_from(count).unwrap_or(u32::MAX),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    #[test]
    fn test_prefix_validation() {
        assert!(RedisConfig::default().prefix("app:usage:").is_ok());
        assert!(RedisConfig::default().prefix("bad prefix*").is_err());
    }

    #[test]
    fn test_counter_key_layout() {
        let store = RedisUsageStore::new("redis://127.0.0.1/").unwrap();
        let day = UsagePeriod::day_of(Utc.with_ymd_and_hms(2026, 5, 4, 8, 0, 0).unwrap());
        assert_eq!(
            store.counter_key("u1", &day, GenerationType::Song),
            "kroniq:usage:2026-05-04:u1:song"
        );
    }

    #[test]
    fn test_ttl_by_period() {
        let config = RedisConfig::default();
        let now = Utc::now();
        assert_eq!(config.ttl_for(&UsagePeriod::day_of(now)), 172_800);
        assert_eq!(config.ttl_for(&UsagePeriod::month_of(now)), 3_024_000);
    }
}

//! Environment variable provider.
//!
//! `limits.daily.image` maps to `KRONIQ_LIMITS_DAILY_IMAGE`. Variables are
//! captured once at construction; the process environment is never mutated.

use std::collections::HashMap;

use super::ConfigResult;
use super::provider::ConfigProvider;

pub const DEFAULT_ENV_PREFIX: &str = "KRONIQ_";

#[derive(Debug, Clone)]
pub struct EnvConfigProvider {
    prefix: String,
    vars: HashMap<String, String>,
}

impl EnvConfigProvider {
    pub fn new() -> Self {
        Self::with_prefix(DEFAULT_ENV_PREFIX)
    }

    pub fn with_prefix(prefix: impl Into<String>) -> Self {
        Self::from_vars(prefix, std::env::vars())
    }

    /// Builds the provider from an explicit variable set.
    pub fn from_vars(
        prefix: impl Into<String>,
        vars: impl IntoIterator<Item = (String, String)>,
    ) -> Self {
        let prefix = prefix.into();
        let vars = vars
            .into_iter()
            .filter(|(k, _)| k.starts_with(&prefix))
            .collect();
        Self { prefix, vars }
    }

    fn env_key(&self, key: &str) -> String {
        format!("{}{}", self.prefix, key.to_uppercase().replace(['.', '-'], "_"))
    }

    fn key_from_env(&self, env_name: &str) -> Option<String> {
        env_name
            .strip_prefix(&self.prefix)
            .map(|rest| rest.to_lowercase().replace('_', "."))
    }
}

impl Default for EnvConfigProvider {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl ConfigProvider for EnvConfigProvider {
    fn name(&self) -> &str {
        "env"
    }

    async fn get_raw(&self, key: &str) -> ConfigResult<Option<String>> {
        Ok(self.vars.get(&self.env_key(key)).cloned())
    }

    async fn list_keys(&self, prefix: &str) -> ConfigResult<Vec<String>> {
        let env_prefix = self.env_key(prefix);
        let mut keys: Vec<String> = self
            .vars
            .keys()
            .filter(|k| k.starts_with(&env_prefix))
            .filter_map(|k| self.key_from_env(k))
            .collect();
        keys.sort();
        Ok(keys)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn provider() -> EnvConfigProvider {
        EnvConfigProvider::from_vars(
            DEFAULT_ENV_PREFIX,
            [
                ("KRONIQ_LIMITS_DAILY_IMAGE".to_string(), "12".to_string()),
                ("KRONIQ_TIER_PREMIUM_THRESHOLD".to_string(), "750000".to_string()),
                ("UNRELATED".to_string(), "x".to_string()),
            ],
        )
    }

    #[test]
    fn test_env_key_conversion() {
        let p = provider();
        assert_eq!(p.env_key("limits.daily.image"), "KRONIQ_LIMITS_DAILY_IMAGE");
        assert_eq!(p.env_key("pricing.gpt-4o"), "KRONIQ_PRICING_GPT_4O");
    }

    #[tokio::test]
    async fn test_get_raw() {
        let p = provider();
        assert_eq!(
            p.get_raw("limits.daily.image").await.unwrap(),
            Some("12".to_string())
        );
        assert_eq!(p.get_raw("limits.daily.video").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_list_keys() {
        let p = provider();
        assert_eq!(
            p.list_keys("limits").await.unwrap(),
            vec!["limits.daily.image".to_string()]
        );
    }
}

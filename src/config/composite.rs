//! Layered provider: the first provider holding a key wins.

use std::collections::BTreeSet;

use super::ConfigResult;
use super::provider::ConfigProvider;

#[derive(Default)]
pub struct CompositeConfigProvider {
    providers: Vec<Box<dyn ConfigProvider>>,
}

impl CompositeConfigProvider {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a provider with lower priority than those already added.
    pub fn push(&mut self, provider: Box<dyn ConfigProvider>) {
        self.providers.push(provider);
    }

    pub fn provider(mut self, provider: Box<dyn ConfigProvider>) -> Self {
        self.push(provider);
        self
    }

    pub fn provider_names(&self) -> Vec<&str> {
        self.providers.iter().map(|p| p.name()).collect()
    }
}

#[async_trait::async_trait]
impl ConfigProvider for CompositeConfigProvider {
    fn name(&self) -> &str {
        "composite"
    }

    async fn get_raw(&self, key: &str) -> ConfigResult<Option<String>> {
        for provider in &self.providers {
            if let Some(value) = provider.get_raw(key).await? {
                tracing::trace!(key, source = provider.name(), "config key resolved");
                return Ok(Some(value));
            }
        }
        Ok(None)
    }

    async fn list_keys(&self, prefix: &str) -> ConfigResult<Vec<String>> {
        let mut keys = BTreeSet::new();
        for provider in &self.providers {
            keys.extend(provider.list_keys(prefix).await?);
        }
        Ok(keys.into_iter().collect())
    }
}

impl std::fmt::Debug for CompositeConfigProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompositeConfigProvider")
            .field("providers", &self.provider_names())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MemoryConfigProvider;

    #[tokio::test]
    async fn test_first_provider_wins() {
        let overrides = MemoryConfigProvider::from_pairs([("limits.daily.image", "20")]);
        let defaults = MemoryConfigProvider::from_pairs([
            ("limits.daily.image", "7"),
            ("limits.daily.video", "2"),
        ]);

        let composite = CompositeConfigProvider::new()
            .provider(Box::new(overrides))
            .provider(Box::new(defaults));

        assert_eq!(
            composite.get_raw("limits.daily.image").await.unwrap(),
            Some("20".to_string())
        );
        assert_eq!(
            composite.get_raw("limits.daily.video").await.unwrap(),
            Some("2".to_string())
        );
        assert_eq!(composite.list_keys("limits").await.unwrap().len(), 2);
    }
}

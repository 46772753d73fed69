//! Layered configuration.
//!
//! ```rust,no_run
//! use kroniq_metering::config::{ConfigBuilder, MeteringSettings};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let provider = ConfigBuilder::new()
//!     .env()
//!     .file("metering.json")
//!     .build()
//!     .await?;
//! let settings = MeteringSettings::load(&provider).await?;
//! # Ok(())
//! # }
//! ```

pub mod composite;
pub mod env;
pub mod file;
pub mod memory;
pub mod provider;
pub mod settings;

pub use composite::CompositeConfigProvider;
pub use env::{DEFAULT_ENV_PREFIX, EnvConfigProvider};
pub use file::FileConfigProvider;
pub use memory::MemoryConfigProvider;
pub use provider::{ConfigProvider, ConfigProviderExt};
pub use settings::{DEFAULT_PREMIUM_THRESHOLD, MeteringSettings, PricingSettings, TierSettings};

use std::path::PathBuf;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Key not found: {key}")]
    NotFound { key: String },

    #[error("Invalid value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Validation(ValidationErrors),
}

impl ConfigError {
    pub fn invalid(key: impl Into<String>, message: impl Into<String>) -> Self {
        Self::InvalidValue {
            key: key.into(),
            message: message.into(),
        }
    }
}

#[derive(Debug)]
pub struct ValidationErrors(pub Vec<ConfigError>);

impl std::fmt::Display for ValidationErrors {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let msgs: Vec<String> = self.0.iter().map(|e| e.to_string()).collect();
        write!(f, "Validation failed: {}", msgs.join("; "))
    }
}

pub type ConfigResult<T> = std::result::Result<T, ConfigError>;

enum Source {
    Env(String),
    File(PathBuf),
    Provider(Box<dyn ConfigProvider>),
}

/// Stacks providers; earlier sources take priority.
#[derive(Default)]
pub struct ConfigBuilder {
    sources: Vec<Source>,
}

impl ConfigBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn env(self) -> Self {
        self.env_with_prefix(DEFAULT_ENV_PREFIX)
    }

    pub fn env_with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.sources.push(Source::Env(prefix.into()));
        self
    }

    pub fn file(mut self, path: impl Into<PathBuf>) -> Self {
        self.sources.push(Source::File(path.into()));
        self
    }

    pub fn memory(self, provider: MemoryConfigProvider) -> Self {
        self.provider(Box::new(provider))
    }

    pub fn provider(mut self, provider: Box<dyn ConfigProvider>) -> Self {
        self.sources.push(Source::Provider(provider));
        self
    }

    /// Snapshots the environment and reads any files.
    pub async fn build(self) -> ConfigResult<CompositeConfigProvider> {
        let mut composite = CompositeConfigProvider::new();
        for source in self.sources {
            let provider: Box<dyn ConfigProvider> = match source {
                Source::Env(prefix) => Box::new(EnvConfigProvider::with_prefix(prefix)),
                Source::File(path) => Box::new(FileConfigProvider::load(path).await?),
                Source::Provider(p) => p,
            };
            composite.push(provider);
        }
        Ok(composite)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_config_error_display() {
        let err = ConfigError::invalid("limits.daily.image", "not a number");
        assert_eq!(
            err.to_string(),
            "Invalid value for limits.daily.image: not a number"
        );
    }

    #[tokio::test]
    async fn test_builder_priority() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("metering.json");
        tokio::fs::write(&path, r#"{"limits": {"daily": {"image": 9, "video": 4}}}"#)
            .await
            .unwrap();

        let provider = ConfigBuilder::new()
            .memory(MemoryConfigProvider::from_pairs([("limits.daily.image", "11")]))
            .file(&path)
            .build()
            .await
            .unwrap();

        assert_eq!(provider.provider_names(), vec!["memory", "file"]);
        let settings = MeteringSettings::load(&provider).await.unwrap();
        assert_eq!(settings.limits.daily_limit(crate::types::GenerationType::Image), 11);
        assert_eq!(settings.limits.daily_limit(crate::types::GenerationType::Video), 4);
    }
}

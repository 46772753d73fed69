//! Configuration source trait.

use std::str::FromStr;

use super::{ConfigError, ConfigResult};

/// A read-only source of dotted configuration keys such as
/// `limits.daily.image`.
#[async_trait::async_trait]
pub trait ConfigProvider: Send + Sync {
    fn name(&self) -> &str;

    async fn get_raw(&self, key: &str) -> ConfigResult<Option<String>>;

    /// Keys under `prefix`, in dotted form.
    async fn list_keys(&self, prefix: &str) -> ConfigResult<Vec<String>>;
}

/// Typed access on top of [`ConfigProvider::get_raw`].
pub trait ConfigProviderExt: ConfigProvider {
    /// Parses the raw value with `FromStr`; suits env vars and scalars.
    fn get_parsed<T>(
        &self,
        key: &str,
    ) -> impl std::future::Future<Output = ConfigResult<Option<T>>> + Send
    where
        T: FromStr + Send,
        T::Err: std::fmt::Display,
        Self: Sync,
    {
        async move {
            let Some(raw) = self.get_raw(key).await? else {
                return Ok(None);
            };
            raw.trim()
                .parse::<T>()
                .map(Some)
                .map_err(|e| ConfigError::invalid(key, e.to_string()))
        }
    }
}

impl<P: ConfigProvider + ?Sized> ConfigProviderExt for P {}

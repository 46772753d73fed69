//! JSON file provider.
//!
//! Nested objects are addressed with dotted keys:
//!
//! ```json
//! { "limits": { "daily": { "image": 10 } }, "tier": { "premium_threshold": 400000 } }
//! ```

use std::path::{Path, PathBuf};

use serde_json::Value;

use super::ConfigResult;
use super::provider::ConfigProvider;

#[derive(Debug, Clone)]
pub struct FileConfigProvider {
    path: PathBuf,
    root: Value,
}

impl FileConfigProvider {
    /// Reads and parses the file. A missing file yields an empty provider.
    pub async fn load(path: impl AsRef<Path>) -> ConfigResult<Self> {
        let path = path.as_ref().to_path_buf();
        let root = match tokio::fs::read_to_string(&path).await {
            Ok(content) => serde_json::from_str(&content)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!(path = %path.display(), "config file not found, using defaults");
                Value::Object(Default::default())
            }
            Err(e) => return Err(e.into()),
        };
        Ok(Self { path, root })
    }

    pub fn from_value(root: Value) -> Self {
        Self {
            path: PathBuf::new(),
            root,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn lookup(&self, key: &str) -> Option<&Value> {
        key.split('.')
            .try_fold(&self.root, |node, part| node.get(part))
    }

    fn collect_keys(node: &Value, path: String, out: &mut Vec<String>) {
        match node {
            Value::Object(map) => {
                for (k, v) in map {
                    let next = if path.is_empty() {
                        k.clone()
                    } else {
                        format!("{}.{}", path, k)
                    };
                    Self::collect_keys(v, next, out);
                }
            }
            _ => out.push(path),
        }
    }
}

#[async_trait::async_trait]
impl ConfigProvider for FileConfigProvider {
    fn name(&self) -> &str {
        "file"
    }

    async fn get_raw(&self, key: &str) -> ConfigResult<Option<String>> {
        Ok(match self.lookup(key) {
            Some(Value::String(s)) => Some(s.clone()),
            Some(Value::Array(items)) => Some(
                items
                    .iter()
                    .map(|v| v.as_str().map(str::to_string).unwrap_or_else(|| v.to_string()))
                    .collect::<Vec<_>>()
                    .join(","),
            ),
            Some(Value::Null) | Some(Value::Object(_)) | None => None,
            Some(v) => Some(v.to_string()),
        })
    }

    async fn list_keys(&self, prefix: &str) -> ConfigResult<Vec<String>> {
        let mut keys = Vec::new();
        Self::collect_keys(&self.root, String::new(), &mut keys);
        keys.retain(|k| k.starts_with(prefix));
        keys.sort();
        Ok(keys)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_load_nested_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("metering.json");
        tokio::fs::write(
            &path,
            r#"{"limits": {"daily": {"image": 10}}, "tier": {"premium_plans": ["premium", "pro"]}}"#,
        )
        .await
        .unwrap();

        let provider = FileConfigProvider::load(&path).await.unwrap();
        assert_eq!(
            provider.get_raw("limits.daily.image").await.unwrap(),
            Some("10".to_string())
        );
        assert_eq!(
            provider.get_raw("tier.premium_plans").await.unwrap(),
            Some("premium,pro".to_string())
        );
        assert_eq!(provider.get_raw("limits.daily").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_missing_file_is_empty() {
        let dir = tempdir().unwrap();
        let provider = FileConfigProvider::load(dir.path().join("absent.json"))
            .await
            .unwrap();
        assert!(provider.list_keys("").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_malformed_file_errors() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("bad.json");
        tokio::fs::write(&path, "{not json").await.unwrap();
        assert!(FileConfigProvider::load(&path).await.is_err());
    }

    #[tokio::test]
    async fn test_list_keys_prefix() {
        let provider = FileConfigProvider::from_value(json!({
            "limits": {"daily": {"image": 1, "video": 2}, "paid_sentinel": 5},
            "pricing": {"profit_margin": "0.4"}
        }));
        assert_eq!(
            provider.list_keys("limits.daily").await.unwrap(),
            vec!["limits.daily.image", "limits.daily.video"]
        );
    }
}

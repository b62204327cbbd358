use crate::error::Result;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub versioning: VersioningConfig,
    pub sync: SyncConfig,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct VersioningConfig {
    /// Seconds without a further edit before a pending manual build is finalized.
    /// Zero finalizes manual builds immediately.
    pub idle_window_secs: u64,
    pub max_version_retries: u32,
    pub sweep_interval_secs: u64,
}

impl Default for VersioningConfig {
    fn default() -> Self {
        Self {
            idle_window_secs: 300,
            max_version_retries: 3,
            sweep_interval_secs: 30,
        }
    }
}

impl VersioningConfig {
    pub fn idle_window(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.idle_window_secs as i64)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs.max(1))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    pub fetch_retries: u32,
    pub backoff_base_ms: u64,
    /// Directory for files of entities pushed without an existing link.
    pub push_dir: String,
    pub file_extension: String,
    /// Author recorded on git-sourced builds.
    pub author: String,
    /// Tracked path prefixes; empty tracks every file in the tree.
    pub include_prefixes: Vec<String>,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            fetch_retries: 3,
            backoff_base_ms: 200,
            push_dir: "models".to_string(),
            file_extension: "sql".to_string(),
            author: "git-sync".to_string(),
            include_prefixes: Vec::new(),
        }
    }
}

impl SyncConfig {
    pub fn backoff(&self, attempt: u32) -> Duration {
        Duration::from_millis(self.backoff_base_ms.saturating_mul(1 << attempt.min(10)))
    }

    pub fn tracks(&self, path: &str) -> bool {
        self.include_prefixes.is_empty()
            || self
                .include_prefixes
                .iter()
                .any(|prefix| path.starts_with(prefix.as_str()))
    }

    pub fn default_path(&self, name: &str) -> String {
        let dir = self.push_dir.trim_end_matches('/');
        if dir.is_empty() {
            format!("{}.{}", name, self.file_extension)
        } else {
            format!("{}/{}.{}", dir, name, self.file_extension)
        }
    }
}

impl EngineConfig {
    pub fn from_toml(contents: &str) -> Result<Self> {
        Ok(toml::from_str(contents)?)
    }

    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_toml(&contents)
    }

    pub fn load_or_default<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        if path.exists() {
            Self::load(path)
        } else {
            Ok(Self::default())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let config = EngineConfig::from_toml(
            r#"
            [versioning]
            idle_window_secs = 60

            [sync]
            include_prefixes = ["models/"]
            "#,
        )
        .unwrap();

        assert_eq!(config.versioning.idle_window_secs, 60);
        assert_eq!(config.versioning.max_version_retries, 3);
        assert_eq!(config.sync.author, "git-sync");
        assert!(config.sync.tracks("models/x.sql"));
        assert!(!config.sync.tracks("README.md"));
    }

    #[test]
    fn test_load_or_default() {
        let dir = TempDir::new().unwrap();
        let missing = dir.path().join("config.toml");
        assert_eq!(EngineConfig::load_or_default(&missing).unwrap(), EngineConfig::default());

        std::fs::write(&missing, "[sync]\npush_dir = \"builds\"\n").unwrap();
        let config = EngineConfig::load_or_default(&missing).unwrap();
        assert_eq!(config.sync.default_path("orders"), "builds/orders.sql");
    }

    #[test]
    fn test_backoff_grows() {
        let sync = SyncConfig::default();
        assert_eq!(sync.backoff(0), Duration::from_millis(200));
        assert_eq!(sync.backoff(2), Duration::from_millis(800));
    }
}

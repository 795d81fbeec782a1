//! Storage configuration: which disks exist, which are critical, where the fallback lives.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::error::ConfigError;

const DEFAULT_ROOT_NAMESPACE: &str = "users_files";
const DEFAULT_MAX_ASSET_BYTES: u64 = 64 * 1024 * 1024;
const DEFAULT_PUT_TIMEOUT_MS: u64 = 30_000;
pub(crate) const DEFAULT_COMMIT_TIMEOUT_MS: u64 = 5_000;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Visibility {
    #[default]
    Public,
    Private,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum BackendConfig {
    Local {
        root: PathBuf,
        base_url: Option<String>,
    },
    S3 {
        bucket: Option<String>,
        endpoint: Option<String>,
        region: Option<String>,
        root: Option<String>,
        access_key_id: Option<String>,
        secret_access_key: Option<String>,
        public_url: Option<String>,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct DiskConfig {
    pub name: String,
    #[serde(default)]
    pub critical: bool,
    #[serde(default)]
    pub visibility: Visibility,
    pub backend: BackendConfig,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct StorageConfig {
    #[serde(default = "default_root_namespace")]
    pub root_namespace: String,
    #[serde(default = "default_max_asset_bytes")]
    pub max_asset_bytes: u64,
    #[serde(default = "default_put_timeout_ms")]
    pub put_timeout_ms: u64,
    #[serde(default = "default_commit_timeout_ms")]
    pub commit_timeout_ms: u64,
    /// Number of disks written at the same time, 1 means strictly sequential
    #[serde(default = "default_fanout_concurrency")]
    pub fanout_concurrency: usize,
    pub disks: Vec<DiskConfig>,
    pub fallback: Option<DiskConfig>,
}

fn default_root_namespace() -> String {
    String::from(DEFAULT_ROOT_NAMESPACE)
}

fn default_max_asset_bytes() -> u64 {
    DEFAULT_MAX_ASSET_BYTES
}

fn default_put_timeout_ms() -> u64 {
    DEFAULT_PUT_TIMEOUT_MS
}

fn default_commit_timeout_ms() -> u64 {
    DEFAULT_COMMIT_TIMEOUT_MS
}

fn default_fanout_concurrency() -> usize {
    1
}

impl StorageConfig {
    /// Reads the TOML file at `path`, or builds the local default when it does not exist.
    pub fn load(path: &Path, data_dir: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            tracing::info!(
                "storage config {} not found, using local disks under {}",
                path.display(),
                data_dir.display()
            );
            return Ok(Self::local_default(data_dir));
        }
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        let config: StorageConfig = toml::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path.display().to_string(),
            source,
        })?;
        config.validate()?;
        Ok(config)
    }

    /// One critical local disk named `public` and a `local` fallback disk.
    #[must_use]
    pub fn local_default(data_dir: &Path) -> Self {
        Self {
            root_namespace: default_root_namespace(),
            max_asset_bytes: DEFAULT_MAX_ASSET_BYTES,
            put_timeout_ms: DEFAULT_PUT_TIMEOUT_MS,
            commit_timeout_ms: DEFAULT_COMMIT_TIMEOUT_MS,
            fanout_concurrency: default_fanout_concurrency(),
            disks: vec![DiskConfig {
                name: String::from("public"),
                critical: true,
                visibility: Visibility::Public,
                backend: BackendConfig::Local {
                    root: data_dir.join("storage"),
                    base_url: None,
                },
            }],
            fallback: Some(DiskConfig {
                name: String::from("local"),
                critical: false,
                visibility: Visibility::Private,
                backend: BackendConfig::Local {
                    root: data_dir.join("fallback"),
                    base_url: None,
                },
            }),
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.disks.is_empty() {
            return Err(ConfigError::Invalid(String::from(
                "at least one disk must be configured",
            )));
        }
        let mut names = HashSet::new();
        for disk in &self.disks {
            if disk.name.trim().is_empty() {
                return Err(ConfigError::Invalid(String::from("disk name is empty")));
            }
            if !names.insert(disk.name.as_str()) {
                return Err(ConfigError::Invalid(format!(
                    "disk '{}' is configured twice",
                    disk.name
                )));
            }
        }
        if let Some(fallback) = &self.fallback {
            let shadowed = self
                .disks
                .iter()
                .find(|d| d.name == fallback.name)
                .is_some_and(|d| d.backend != fallback.backend);
            if shadowed {
                return Err(ConfigError::Invalid(format!(
                    "fallback disk '{}' has the name of a different configured disk",
                    fallback.name
                )));
            }
        }
        if self.fanout_concurrency == 0 {
            return Err(ConfigError::Invalid(String::from(
                "fanout_concurrency must be at least 1",
            )));
        }
        if !self.disks.iter().any(|d| d.critical) {
            tracing::warn!("no critical disk configured, any single stored copy will be accepted");
        }
        Ok(())
    }

    #[must_use]
    pub fn put_timeout(&self) -> Duration {
        Duration::from_millis(self.put_timeout_ms)
    }

    #[must_use]
    pub fn commit_timeout(&self) -> Duration {
        Duration::from_millis(self.commit_timeout_ms)
    }
}

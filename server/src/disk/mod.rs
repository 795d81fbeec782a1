use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;

use crate::config::{BackendConfig, DiskConfig, Visibility};
use crate::error::DiskError;

mod local;
mod object;

pub use local::LocalDisk;
pub use object::ObjectStoreDisk;

/// One configured storage destination.
#[async_trait]
pub trait DiskBackend: Send + Sync {
    /// Stores `bytes` under `key`. Either the whole content is visible afterwards or
    /// nothing is. Overwriting an existing key is not an error.
    ///
    /// Local disks apply `visibility` as file permissions. Object stores leave access to
    /// the bucket policy and send it as the object's `Cache-Control`.
    async fn put(&self, key: &str, bytes: Bytes, visibility: Visibility) -> Result<(), DiskError>;

    /// Public URL of `key`, or the key (path) itself when the disk has none.
    fn url(&self, key: &str) -> String;

    async fn exists(&self, key: &str) -> Result<bool, DiskError>;

    /// Removes `key`. Removing a missing key succeeds.
    async fn delete(&self, key: &str) -> Result<(), DiskError>;
}

/// Builds the backend described by `config`.
///
/// Fails with `ConfigMissing` when the configuration is incomplete.
pub fn build(config: &DiskConfig) -> Result<Arc<dyn DiskBackend>, DiskError> {
    match &config.backend {
        BackendConfig::Local { root, base_url } => Ok(Arc::new(LocalDisk::new(
            &config.name,
            root.clone(),
            base_url.clone(),
        ))),
        BackendConfig::S3 { .. } => Ok(Arc::new(ObjectStoreDisk::from_config(
            &config.name,
            &config.backend,
        )?)),
    }
}

use std::path::{Component, Path, PathBuf};

use async_trait::async_trait;
use bytes::Bytes;
use tokio::io::AsyncWriteExt;
use uuid::Uuid;

use crate::config::Visibility;
use crate::disk::DiskBackend;
use crate::error::{DiskError, DiskErrorKind};

#[cfg(unix)]
const PUBLIC_MODE: u32 = 0o644;
#[cfg(unix)]
const PRIVATE_MODE: u32 = 0o600;

/// Disk backed by a local directory.
pub struct LocalDisk {
    name: String,
    root: PathBuf,
    base_url: Option<String>,
}

impl LocalDisk {
    #[must_use]
    pub fn new(name: &str, root: PathBuf, base_url: Option<String>) -> Self {
        Self {
            name: name.to_owned(),
            root,
            base_url: base_url.map(|u| u.trim_end_matches('/').to_owned()),
        }
    }

    fn path_of(&self, key: &str) -> Result<PathBuf, DiskError> {
        let relative = Path::new(key);
        let escapes = relative
            .components()
            .any(|c| !matches!(c, Component::Normal(_)));
        if key.is_empty() || escapes {
            return Err(DiskError::new(
                &self.name,
                DiskErrorKind::IoFailure,
                format!("key '{key}' is not a relative path"),
            ));
        }
        Ok(self.root.join(relative))
    }

    fn io_error(&self, e: &std::io::Error) -> DiskError {
        DiskError::io(&self.name, e)
    }
}

#[async_trait]
impl DiskBackend for LocalDisk {
    async fn put(&self, key: &str, bytes: Bytes, visibility: Visibility) -> Result<(), DiskError> {
        let target = self.path_of(key)?;
        let parent = target.parent().unwrap_or(&self.root);
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|e| self.io_error(&e))?;

        let file_name = target
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let temp = parent.join(format!(".{file_name}.{}.tmp", Uuid::new_v4().simple()));

        let written = async {
            let mut file = tokio::fs::File::create(&temp).await?;
            file.write_all(&bytes).await?;
            file.sync_all().await?;
            #[cfg(unix)]
            {
                use std::os::unix::fs::PermissionsExt;
                let mode = match visibility {
                    Visibility::Public => PUBLIC_MODE,
                    Visibility::Private => PRIVATE_MODE,
                };
                tokio::fs::set_permissions(&temp, std::fs::Permissions::from_mode(mode)).await?;
            }
            #[cfg(not(unix))]
            let _ = visibility;
            tokio::fs::rename(&temp, &target).await
        }
        .await;

        if let Err(e) = written {
            tokio::fs::remove_file(&temp).await.unwrap_or_default();
            return Err(self.io_error(&e));
        }
        Ok(())
    }

    fn url(&self, key: &str) -> String {
        match &self.base_url {
            Some(base) => format!("{base}/{key}"),
            None => self.root.join(key).display().to_string(),
        }
    }

    async fn exists(&self, key: &str) -> Result<bool, DiskError> {
        let path = self.path_of(key)?;
        tokio::fs::try_exists(path)
            .await
            .map_err(|e| self.io_error(&e))
    }

    async fn delete(&self, key: &str) -> Result<(), DiskError> {
        let path = self.path_of(key)?;
        match tokio::fs::remove_file(path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(self.io_error(&e)),
        }
    }
}

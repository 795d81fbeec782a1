use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use kernel::{StoredAsset, UploadReceipt};
use tokio::io::AsyncRead;

use crate::addresser::{extension_of, mime_for_extension, ContentAddresser};
use crate::cache::CacheInvalidator;
use crate::config::StorageConfig;
use crate::domain::Storage;
use crate::error::{UploadError, UploadResult};
use crate::sqlite::{Mode, Sqlite};
use crate::transaction::{FileMeta, UploadTransaction};
use crate::writer::MultiDiskWriter;

const DEFAULT_MIME: &str = "application/octet-stream";

/// What the caller knows about an upload before its bytes are read.
#[derive(Debug, Clone, Default)]
pub struct UploadRequest {
    pub owner_id: i64,
    pub container_id: i64,
    pub file_name: Option<String>,
    pub declared_extension: Option<String>,
    pub declared_mime: Option<String>,
    pub declared_size: Option<u64>,
}

impl UploadRequest {
    #[must_use]
    pub fn new(owner_id: i64, container_id: i64) -> Self {
        Self {
            owner_id,
            container_id,
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_file_name(mut self, file_name: &str) -> Self {
        self.file_name = Some(file_name.to_owned());
        self
    }

    fn extension_hint(&self) -> Option<&str> {
        self.declared_extension
            .as_deref()
            .or_else(|| self.file_name.as_deref().and_then(extension_of))
    }
}

/// Runs uploads end to end. One instance is shared by all requests.
pub struct Uploader {
    db: PathBuf,
    addresser: ContentAddresser,
    writer: MultiDiskWriter,
    invalidator: Arc<dyn CacheInvalidator>,
    commit_timeout: Duration,
}

impl Uploader {
    #[must_use]
    pub fn new(
        db: PathBuf,
        addresser: ContentAddresser,
        writer: MultiDiskWriter,
        invalidator: Arc<dyn CacheInvalidator>,
    ) -> Self {
        Self {
            db,
            addresser,
            writer,
            invalidator,
            commit_timeout: Duration::from_millis(crate::config::DEFAULT_COMMIT_TIMEOUT_MS),
        }
    }

    pub fn from_config(
        db: PathBuf,
        config: &StorageConfig,
        invalidator: Arc<dyn CacheInvalidator>,
    ) -> UploadResult<Self> {
        let addresser = ContentAddresser::new(&config.root_namespace)?;
        let writer = MultiDiskWriter::from_config(config);
        Ok(Self::new(db, addresser, writer, invalidator).with_commit_timeout(config.commit_timeout()))
    }

    /// How long each metadata transaction waits for the database write lock.
    #[must_use]
    pub fn with_commit_timeout(mut self, timeout: Duration) -> Self {
        self.commit_timeout = timeout;
        self
    }

    #[must_use]
    pub fn max_bytes(&self) -> u64 {
        self.writer.max_bytes()
    }

    pub async fn upload<R>(&self, request: UploadRequest, source: R) -> UploadResult<UploadReceipt>
    where
        R: AsyncRead + Unpin,
    {
        let start = Instant::now();
        let bytes = self.writer.buffer_source(source).await?;
        if let Some(declared) = request.declared_size {
            if declared != bytes.len() as u64 {
                return Err(UploadError::SourceRead {
                    source: std::io::Error::new(
                        std::io::ErrorKind::UnexpectedEof,
                        format!("declared {declared} bytes but read {}", bytes.len()),
                    ),
                });
            }
        }

        let extension = ContentAddresser::resolve_extension(request.extension_hint(), &bytes)?;
        let mime_type = mime_for_extension(&extension)
            .map(str::to_owned)
            .or(request.declared_mime)
            .unwrap_or_else(|| DEFAULT_MIME.to_owned());
        let content_hash = ContentAddresser::compute_hash(&bytes);

        let (store, existing) = self
            .find_existing(request.owner_id, content_hash.clone())
            .await?;
        match existing {
            Some(asset) if asset.has_locations_for(self.writer.critical_disks()) => {
                tracing::info!(
                    "owner {} already has content {content_hash} as asset {}",
                    request.owner_id,
                    asset.id
                );
                return Ok(UploadReceipt::from_asset(&asset, true));
            }
            Some(asset) => tracing::info!(
                "asset {} has the same content but misses critical copies, storing again",
                asset.id
            ),
            None => {}
        }

        let meta = FileMeta {
            extension,
            mime_type,
            byte_size: bytes.len() as u64,
            content_hash,
        };
        let (transaction, asset) = UploadTransaction::begin(
            store,
            &self.addresser,
            request.owner_id,
            request.container_id,
            meta,
        )
        .await?;
        let result = transaction
            .attempt_store(asset, &bytes, &self.writer, self.invalidator.as_ref())
            .await;
        tracing::info!("upload time: {:?}", start.elapsed());
        result
    }

    /// Opens this upload's own connection and looks up a stored asset of the same owner
    /// with the same content.
    async fn find_existing(
        &self,
        owner_id: i64,
        content_hash: String,
    ) -> UploadResult<(Sqlite, Option<StoredAsset>)> {
        let db = self.db.clone();
        let timeout = self.commit_timeout;
        tokio::task::spawn_blocking(move || {
            let mut store = Sqlite::open(&db, Mode::ReadWrite)?;
            store.set_busy_timeout(timeout)?;
            let existing = store.find_stored_by_hash(owner_id, &content_hash)?;
            Ok::<_, rusqlite::Error>((store, existing))
        })
        .await
        .map_err(UploadError::database)?
        .map_err(UploadError::database)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::ListingCache;
    use crate::config::Visibility;
    use crate::disk::LocalDisk;
    use crate::writer::DiskTarget;
    use rstest::rstest;
    use tempfile::TempDir;

    const PNG: &[u8] = b"\x89PNG\r\n\x1A\npixels";

    fn uploader(dir: &TempDir, cache: Arc<ListingCache>) -> Uploader {
        let db = dir.path().join("egistore.db");
        Sqlite::open(&db, Mode::ReadWrite)
            .unwrap()
            .new_database()
            .unwrap();
        let disk = LocalDisk::new("public", dir.path().join("public"), None);
        let writer = MultiDiskWriter::new(
            vec![DiskTarget::new("public", true, Visibility::Public, Arc::new(disk))],
            None,
        );
        Uploader::new(
            db,
            ContentAddresser::new("users_files").unwrap(),
            writer,
            cache,
        )
    }

    #[tokio::test]
    async fn upload_stores_and_evicts_listing() {
        // Arrange
        let dir = tempfile::tempdir().unwrap();
        let cache = Arc::new(ListingCache::new());
        cache.put(10, cache.generation(10), Vec::new());
        let uploader = uploader(&dir, cache.clone());
        let request = UploadRequest::new(2, 10).with_file_name("photo.bin");

        // Act
        let receipt = uploader.upload(request, PNG).await.unwrap();

        // Assert
        assert!(receipt.content_key.ends_with(".png"));
        assert_eq!(receipt.byte_size, PNG.len() as u64);
        assert!(!receipt.deduplicated);
        assert!(dir.path().join("public").join(&receipt.content_key).exists());
        assert!(cache.get(10).is_none());
        assert!(cache.is_empty());
    }

    #[tokio::test]
    async fn listing_read_before_commit_is_not_cached() {
        // Arrange
        let dir = tempfile::tempdir().unwrap();
        let cache = Arc::new(ListingCache::new());
        let uploader = uploader(&dir, cache.clone());
        let generation = cache.generation(10);
        let before = Sqlite::open(dir.path().join("egistore.db"), Mode::ReadOnly)
            .unwrap()
            .get_container_assets(10)
            .unwrap();

        // Act
        uploader
            .upload(UploadRequest::new(2, 10), PNG)
            .await
            .unwrap();
        let cached = cache.put(10, generation, before);

        // Assert
        assert!(!cached);
        assert!(cache.get(10).is_none());
    }

    #[tokio::test]
    async fn same_content_from_same_owner_is_deduplicated() {
        let dir = tempfile::tempdir().unwrap();
        let uploader = uploader(&dir, Arc::new(ListingCache::new()));

        let first = uploader
            .upload(UploadRequest::new(2, 10), PNG)
            .await
            .unwrap();
        let second = uploader
            .upload(UploadRequest::new(2, 11), PNG)
            .await
            .unwrap();
        let other_owner = uploader
            .upload(UploadRequest::new(3, 10), PNG)
            .await
            .unwrap();

        assert!(second.deduplicated);
        assert_eq!(second.asset_id, first.asset_id);
        assert_eq!(second.content_key, first.content_key);
        assert!(!other_owner.deduplicated);
        assert_ne!(other_owner.asset_id, first.asset_id);
    }

    #[rstest]
    #[case(Some("txt"), None, "txt", "text/plain")]
    #[case(None, Some("notes.md"), "md", "application/octet-stream")]
    #[case(Some("pdf"), Some("x.txt"), "pdf", "application/pdf")]
    #[trace]
    #[tokio::test]
    async fn extension_from_declaration_when_content_is_unknown(
        #[case] declared: Option<&str>,
        #[case] file_name: Option<&str>,
        #[case] expected_ext: &str,
        #[case] expected_mime: &str,
    ) {
        let dir = tempfile::tempdir().unwrap();
        let uploader = uploader(&dir, Arc::new(ListingCache::new()));
        let request = UploadRequest {
            owner_id: 1,
            container_id: 1,
            file_name: file_name.map(str::to_owned),
            declared_extension: declared.map(str::to_owned),
            ..UploadRequest::default()
        };

        let receipt = uploader.upload(request, &b"plain words"[..]).await.unwrap();

        assert!(receipt.content_key.ends_with(&format!(".{expected_ext}")));
        let stored = Sqlite::open(dir.path().join("egistore.db"), Mode::ReadOnly)
            .unwrap()
            .get_asset(receipt.asset_id)
            .unwrap()
            .unwrap();
        assert_eq!(stored.mime_type, expected_mime);
    }

    #[tokio::test]
    async fn unknown_extension_is_invalid_input_without_writes() {
        let dir = tempfile::tempdir().unwrap();
        let uploader = uploader(&dir, Arc::new(ListingCache::new()));

        let result = uploader
            .upload(UploadRequest::new(1, 1), &b"plain words"[..])
            .await;

        assert!(matches!(result, Err(UploadError::InvalidInput { .. })));
        assert!(!dir.path().join("public").exists());
    }

    #[tokio::test]
    async fn declared_size_mismatch_is_source_read_failure() {
        let dir = tempfile::tempdir().unwrap();
        let uploader = uploader(&dir, Arc::new(ListingCache::new()));
        let request = UploadRequest {
            declared_size: Some(1024),
            ..UploadRequest::new(1, 1)
        };

        let result = uploader.upload(request, PNG).await;

        assert!(matches!(result, Err(UploadError::SourceRead { .. })));
        assert!(!dir.path().join("public").exists());
    }
}

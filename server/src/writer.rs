//! Fan-out of one asset to every configured disk.
//!
//! Every disk is attempted in configured order, a failing disk never stops the
//! following ones. Failures are then classified against the critical set:
//!
//! * some disks succeeded: the successful locations are returned, failed disks are
//!   reported alongside so the caller can decide whether the critical copies exist;
//! * nothing succeeded: one emergency write goes to the fallback disk, unless that disk
//!   was already part of the fan-out. If it fails too the whole write is a
//!   `CriticalStorageFailure`.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use futures::StreamExt;
use tokio::io::{AsyncRead, AsyncReadExt};

use crate::config::{DiskConfig, StorageConfig, Visibility};
use crate::disk::{self, DiskBackend};
use crate::error::{DiskError, DiskErrorKind, UploadError, UploadResult};

/// A disk the writer fans out to.
#[derive(Clone)]
pub struct DiskTarget {
    name: String,
    critical: bool,
    visibility: Visibility,
    backend: Result<Arc<dyn DiskBackend>, DiskError>,
}

impl DiskTarget {
    pub fn new(
        name: &str,
        critical: bool,
        visibility: Visibility,
        backend: Arc<dyn DiskBackend>,
    ) -> Self {
        Self {
            name: name.to_owned(),
            critical,
            visibility,
            backend: Ok(backend),
        }
    }

    /// Builds the backend from configuration. A disk that cannot be built stays in the
    /// fan-out and fails every attempt with `ConfigMissing`.
    #[must_use]
    pub fn from_config(config: &DiskConfig) -> Self {
        let backend = disk::build(config).inspect_err(|e| {
            tracing::error!("storage disk '{}' is not usable: {e}", config.name);
        });
        Self {
            name: config.name.clone(),
            critical: config.critical,
            visibility: config.visibility,
            backend,
        }
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }
}

/// Result of one `put` on one disk.
#[derive(Debug, Clone)]
pub struct DiskWriteOutcome {
    pub disk: String,
    pub result: Result<String, DiskError>,
}

/// Aggregated result of a fan-out that was not fatal.
#[derive(Debug, Clone, Default)]
pub struct WriteReport {
    /// Disk name to URL or path, for every disk that stored the content
    pub locations: BTreeMap<String, String>,
    pub failures: Vec<DiskError>,
    /// Names of failed disks from the critical set
    pub critical_failures: Vec<String>,
    /// True when the locations come from the emergency fallback write
    pub via_fallback: bool,
}

impl WriteReport {
    /// Whether the asset may be marked as stored.
    #[must_use]
    pub fn critical_satisfied(&self) -> bool {
        self.via_fallback || self.critical_failures.is_empty()
    }

    #[must_use]
    pub fn written_disks(&self) -> Vec<String> {
        self.locations.keys().cloned().collect()
    }
}

pub struct MultiDiskWriter {
    targets: Vec<DiskTarget>,
    fallback: Option<DiskTarget>,
    put_timeout: Duration,
    max_bytes: u64,
    concurrency: usize,
}

impl MultiDiskWriter {
    const DEFAULT_PUT_TIMEOUT: Duration = Duration::from_secs(30);
    const DEFAULT_MAX_BYTES: u64 = 64 * 1024 * 1024;

    #[must_use]
    pub fn new(targets: Vec<DiskTarget>, fallback: Option<DiskTarget>) -> Self {
        Self {
            targets,
            fallback,
            put_timeout: Self::DEFAULT_PUT_TIMEOUT,
            max_bytes: Self::DEFAULT_MAX_BYTES,
            concurrency: 1,
        }
    }

    #[must_use]
    pub fn from_config(config: &StorageConfig) -> Self {
        let targets = config.disks.iter().map(DiskTarget::from_config).collect();
        let fallback = config.fallback.as_ref().map(DiskTarget::from_config);
        Self::new(targets, fallback)
            .with_put_timeout(config.put_timeout())
            .with_max_bytes(config.max_asset_bytes)
            .with_concurrency(config.fanout_concurrency)
    }

    #[must_use]
    pub fn with_put_timeout(mut self, timeout: Duration) -> Self {
        self.put_timeout = timeout;
        self
    }

    #[must_use]
    pub fn with_max_bytes(mut self, max_bytes: u64) -> Self {
        self.max_bytes = max_bytes;
        self
    }

    /// Number of disks written at once. Outcomes are still collected in configured order.
    #[must_use]
    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    #[must_use]
    pub fn max_bytes(&self) -> u64 {
        self.max_bytes
    }

    /// Names of the fan-out disks in configured order.
    #[must_use]
    pub fn disk_names(&self) -> Vec<String> {
        self.targets.iter().map(|t| t.name.clone()).collect()
    }

    pub fn critical_disks(&self) -> impl Iterator<Item = &str> {
        self.targets
            .iter()
            .filter(|t| t.critical)
            .map(DiskTarget::name)
    }

    /// Reads the whole source exactly once. Callers write only what this returned, so a
    /// broken source never reaches a disk.
    pub async fn buffer_source<R>(&self, source: R) -> UploadResult<Bytes>
    where
        R: AsyncRead + Unpin,
    {
        let mut buffer = Vec::new();
        let mut limited = source.take(self.max_bytes.saturating_add(1));
        limited
            .read_to_end(&mut buffer)
            .await
            .map_err(|source| {
                tracing::error!("cannot read upload content: {source}");
                UploadError::SourceRead { source }
            })?;
        if buffer.len() as u64 > self.max_bytes {
            return Err(UploadError::invalid_input(format!(
                "content exceeds the {} bytes limit",
                self.max_bytes
            )));
        }
        Ok(Bytes::from(buffer))
    }

    pub async fn write(&self, key: &str, bytes: &Bytes) -> UploadResult<WriteReport> {
        let names: Vec<&str> = self.targets.iter().map(DiskTarget::name).collect();
        tracing::info!(
            "saving {key} ({} bytes) to disks: {names:?}, critical: {:?}",
            bytes.len(),
            self.critical_disks().collect::<Vec<_>>()
        );

        // collected first: futures borrowing a closure argument are not `Send` in a spawned task
        let attempts: Vec<_> = self
            .targets
            .iter()
            .map(|target| self.attempt(target, key, bytes.clone()))
            .collect();
        let outcomes: Vec<DiskWriteOutcome> = futures::stream::iter(attempts)
            .buffered(self.concurrency)
            .collect()
            .await;

        let mut report = WriteReport::default();
        for (target, outcome) in self.targets.iter().zip(outcomes) {
            match outcome.result {
                Ok(location) => {
                    report.locations.insert(outcome.disk, location);
                }
                Err(e) => {
                    if target.critical {
                        report.critical_failures.push(outcome.disk);
                    }
                    report.failures.push(e);
                }
            }
        }

        // Nothing stored: with at least one critical disk this means a critical disk failed,
        // without one there is still no copy at all. Both go through the fallback.
        if report.locations.is_empty() {
            return self.emergency_write(key, bytes, report).await;
        }

        if !report.failures.is_empty() {
            tracing::warn!(
                "{key} stored on {:?} with failures: {}",
                report.written_disks(),
                describe(&report.failures)
            );
        }
        Ok(report)
    }

    async fn emergency_write(
        &self,
        key: &str,
        bytes: &Bytes,
        mut report: WriteReport,
    ) -> UploadResult<WriteReport> {
        let mut attempted = self.disk_names();
        let fallback = self
            .fallback
            .as_ref()
            .filter(|f| !attempted.iter().any(|name| name == &f.name));

        let Some(fallback) = fallback else {
            tracing::error!(
                "critical storage failure for {key}, no untried fallback disk: {}",
                describe(&report.failures)
            );
            return Err(UploadError::CriticalStorageFailure {
                asset_id: None,
                attempted,
                failures: report.failures,
            });
        };

        tracing::warn!(
            "all disks failed for {key}, trying fallback disk '{}'",
            fallback.name
        );
        attempted.push(fallback.name.clone());
        let outcome = self.attempt(fallback, key, bytes.clone()).await;
        match outcome.result {
            Ok(location) => {
                report.locations.insert(outcome.disk, location);
                report.via_fallback = true;
                Ok(report)
            }
            Err(e) => {
                report.failures.push(e);
                tracing::error!(
                    "critical storage failure for {key}, fallback failed too: {}",
                    describe(&report.failures)
                );
                Err(UploadError::CriticalStorageFailure {
                    asset_id: None,
                    attempted,
                    failures: report.failures,
                })
            }
        }
    }

    async fn attempt(&self, target: &DiskTarget, key: &str, bytes: Bytes) -> DiskWriteOutcome {
        let start = Instant::now();
        let result = match &target.backend {
            Ok(backend) => {
                match tokio::time::timeout(
                    self.put_timeout,
                    backend.put(key, bytes, target.visibility),
                )
                .await
                {
                    Ok(Ok(())) => Ok(backend.url(key)),
                    Ok(Err(e)) => Err(e),
                    Err(_) => Err(DiskError::new(
                        &target.name,
                        DiskErrorKind::IoFailure,
                        format!("put timed out after {:?}", self.put_timeout),
                    )),
                }
            }
            Err(e) => Err(e.clone()),
        };
        match &result {
            Ok(location) => tracing::info!(
                "disk '{}' stored {key} at {location} in {:?}",
                target.name,
                start.elapsed()
            ),
            Err(e) => tracing::error!("disk '{}' failed to store {key}: {e}", target.name),
        }
        DiskWriteOutcome {
            disk: target.name.clone(),
            result,
        }
    }

    /// Best effort removal of `key` from `disks`, used to compensate a write whose
    /// metadata will not be committed.
    pub async fn cleanup(&self, key: &str, disks: &[String]) {
        tracing::warn!("removing {key} from disks {disks:?}");
        for name in disks {
            let target = self
                .targets
                .iter()
                .chain(self.fallback.as_ref())
                .find(|t| &t.name == name);
            let Some(Ok(backend)) = target.map(|t| &t.backend) else {
                tracing::warn!("cleanup: disk '{name}' is not available, skipping");
                continue;
            };
            match backend.exists(key).await {
                Ok(true) => match backend.delete(key).await {
                    Ok(()) => tracing::info!("cleanup: {key} deleted from '{name}'"),
                    Err(e) => tracing::error!("cleanup: {key} not deleted from '{name}': {e}"),
                },
                Ok(false) => tracing::info!("cleanup: {key} does not exist on '{name}'"),
                Err(e) => tracing::error!("cleanup: cannot check {key} on '{name}': {e}"),
            }
        }
    }
}

fn describe(failures: &[DiskError]) -> String {
    failures
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use mockall::{mock, predicate::eq, Sequence};
    use std::io;
    use tokio_util::io::StreamReader;

    const KEY: &str = "ns/containers_1/owners_2/a.png";

    mock! {
        pub Disk {}
        #[async_trait]
        impl DiskBackend for Disk {
            async fn put(&self, key: &str, bytes: Bytes, visibility: Visibility) -> Result<(), DiskError>;
            fn url(&self, key: &str) -> String;
            async fn exists(&self, key: &str) -> Result<bool, DiskError>;
            async fn delete(&self, key: &str) -> Result<(), DiskError>;
        }
    }

    fn ok_disk(name: &'static str) -> MockDisk {
        let mut disk = MockDisk::new();
        disk.expect_put().times(1).returning(|_, _, _| Ok(()));
        disk.expect_url()
            .returning(move |key| format!("https://{name}/{key}"));
        disk
    }

    fn failing_disk(name: &'static str, kind: DiskErrorKind) -> MockDisk {
        let mut disk = MockDisk::new();
        disk.expect_put()
            .times(1)
            .returning(move |_, _, _| Err(DiskError::new(name, kind, "unavailable")));
        disk
    }

    fn untouched_disk() -> MockDisk {
        let mut disk = MockDisk::new();
        disk.expect_put().never();
        disk
    }

    fn target(name: &str, critical: bool, disk: MockDisk) -> DiskTarget {
        DiskTarget::new(name, critical, Visibility::Public, Arc::new(disk))
    }

    fn content() -> Bytes {
        Bytes::from_static(b"\x89PNG\r\n\x1A\ncontent")
    }

    #[tokio::test]
    async fn single_critical_disk_success() {
        // Arrange
        let writer = MultiDiskWriter::new(vec![target("public", true, ok_disk("public"))], None);

        // Act
        let report = writer.write(KEY, &content()).await.unwrap();

        // Assert
        assert!(report.critical_satisfied());
        assert!(!report.via_fallback);
        assert_eq!(
            report.locations,
            BTreeMap::from([("public".to_owned(), format!("https://public/{KEY}"))])
        );
    }

    #[tokio::test]
    async fn non_critical_failure_is_degraded_success() {
        // Arrange
        let writer = MultiDiskWriter::new(
            vec![
                target("public", true, ok_disk("public")),
                target("cdn", false, failing_disk("cdn", DiskErrorKind::IoFailure)),
            ],
            Some(target("local", false, untouched_disk())),
        );

        // Act
        let report = writer.write(KEY, &content()).await.unwrap();

        // Assert
        assert!(report.critical_satisfied());
        assert_eq!(report.written_disks(), vec!["public".to_owned()]);
        assert_eq!(report.failures.len(), 1);
        assert_eq!(report.failures[0].disk, "cdn");
        assert!(report.critical_failures.is_empty());
    }

    #[tokio::test]
    async fn critical_failure_with_other_success_is_reported_not_fatal() {
        let writer = MultiDiskWriter::new(
            vec![
                target("public", true, failing_disk("public", DiskErrorKind::QuotaExceeded)),
                target("cdn", false, ok_disk("cdn")),
            ],
            Some(target("local", false, untouched_disk())),
        );

        let report = writer.write(KEY, &content()).await.unwrap();

        assert!(!report.critical_satisfied());
        assert_eq!(report.critical_failures, vec!["public".to_owned()]);
        assert_eq!(report.written_disks(), vec!["cdn".to_owned()]);
    }

    #[tokio::test]
    async fn fallback_already_attempted_is_critical_failure() {
        // Arrange
        let writer = MultiDiskWriter::new(
            vec![target(
                "public",
                true,
                failing_disk("public", DiskErrorKind::IoFailure),
            )],
            Some(target("public", true, untouched_disk())),
        );

        // Act
        let result = writer.write(KEY, &content()).await;

        // Assert
        match result {
            Err(UploadError::CriticalStorageFailure {
                attempted,
                failures,
                ..
            }) => {
                assert_eq!(attempted, vec!["public".to_owned()]);
                assert_eq!(failures.len(), 1);
            }
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[tokio::test]
    async fn untried_fallback_rescues_the_write() {
        // Arrange
        let writer = MultiDiskWriter::new(
            vec![target("cdn", true, failing_disk("cdn", DiskErrorKind::IoFailure))],
            Some(target("local", false, ok_disk("local"))),
        );

        // Act
        let report = writer.write(KEY, &content()).await.unwrap();

        // Assert
        assert!(report.via_fallback);
        assert!(report.critical_satisfied());
        assert_eq!(report.written_disks(), vec!["local".to_owned()]);
        assert_eq!(report.critical_failures, vec!["cdn".to_owned()]);
    }

    #[tokio::test]
    async fn fallback_failure_is_critical_failure() {
        let writer = MultiDiskWriter::new(
            vec![target("cdn", true, failing_disk("cdn", DiskErrorKind::IoFailure))],
            Some(target("local", false, failing_disk("local", DiskErrorKind::QuotaExceeded))),
        );

        let result = writer.write(KEY, &content()).await;

        match result {
            Err(UploadError::CriticalStorageFailure {
                attempted,
                failures,
                ..
            }) => {
                assert_eq!(attempted, vec!["cdn".to_owned(), "local".to_owned()]);
                assert_eq!(failures[1].kind, DiskErrorKind::QuotaExceeded);
            }
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[tokio::test]
    async fn no_critical_disk_and_nothing_stored_uses_fallback() {
        let writer = MultiDiskWriter::new(
            vec![target("cdn", false, failing_disk("cdn", DiskErrorKind::IoFailure))],
            Some(target("local", false, ok_disk("local"))),
        );

        let report = writer.write(KEY, &content()).await.unwrap();

        assert!(report.via_fallback);
        assert_eq!(report.written_disks(), vec!["local".to_owned()]);
    }

    #[tokio::test]
    async fn unconfigured_disk_fails_with_config_missing() {
        let config = DiskConfig {
            name: "do".to_owned(),
            critical: false,
            visibility: Visibility::Public,
            backend: crate::config::BackendConfig::S3 {
                bucket: None,
                endpoint: None,
                region: None,
                root: None,
                access_key_id: None,
                secret_access_key: None,
                public_url: None,
            },
        };
        let writer = MultiDiskWriter::new(
            vec![
                target("public", true, ok_disk("public")),
                DiskTarget::from_config(&config),
            ],
            None,
        );

        let report = writer.write(KEY, &content()).await.unwrap();

        assert!(report.critical_satisfied());
        assert_eq!(report.failures[0].kind, DiskErrorKind::ConfigMissing);
    }

    #[tokio::test]
    async fn disks_attempted_in_configured_order() {
        // Arrange
        let mut seq = Sequence::new();
        let mut first = MockDisk::new();
        first
            .expect_put()
            .with(eq(KEY), mockall::predicate::always(), eq(Visibility::Public))
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, _, _| Err(DiskError::new("first", DiskErrorKind::IoFailure, "x")));
        let mut second = MockDisk::new();
        second
            .expect_put()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, _, _| Ok(()));
        second.expect_url().returning(|key| key.to_owned());
        let writer = MultiDiskWriter::new(
            vec![target("first", false, first), target("second", true, second)],
            None,
        );

        // Act
        let report = writer.write(KEY, &content()).await.unwrap();

        // Assert
        assert_eq!(report.written_disks(), vec!["second".to_owned()]);
    }

    #[tokio::test]
    async fn parallel_fanout_keeps_classification() {
        let writer = MultiDiskWriter::new(
            vec![
                target("public", true, ok_disk("public")),
                target("cdn", false, failing_disk("cdn", DiskErrorKind::IoFailure)),
                target("backup", false, ok_disk("backup")),
            ],
            None,
        )
        .with_concurrency(3);

        let report = writer.write(KEY, &content()).await.unwrap();

        assert!(report.critical_satisfied());
        assert_eq!(
            report.written_disks(),
            vec!["backup".to_owned(), "public".to_owned()]
        );
        assert_eq!(report.failures[0].disk, "cdn");
    }

    struct StalledDisk;

    #[async_trait]
    impl DiskBackend for StalledDisk {
        async fn put(&self, _key: &str, _bytes: Bytes, _v: Visibility) -> Result<(), DiskError> {
            tokio::time::sleep(Duration::from_secs(10)).await;
            Ok(())
        }

        fn url(&self, key: &str) -> String {
            key.to_owned()
        }

        async fn exists(&self, _key: &str) -> Result<bool, DiskError> {
            Ok(false)
        }

        async fn delete(&self, _key: &str) -> Result<(), DiskError> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn stalled_disk_times_out_as_io_failure() {
        let writer = MultiDiskWriter::new(
            vec![
                DiskTarget::new("slow", false, Visibility::Public, Arc::new(StalledDisk)),
                target("public", true, ok_disk("public")),
            ],
            None,
        )
        .with_put_timeout(Duration::from_millis(50));

        let report = writer.write(KEY, &content()).await.unwrap();

        assert_eq!(report.written_disks(), vec!["public".to_owned()]);
        assert_eq!(report.failures.len(), 1);
        assert_eq!(report.failures[0].disk, "slow");
        assert_eq!(report.failures[0].kind, DiskErrorKind::IoFailure);
    }

    #[tokio::test]
    async fn source_read_failure_is_reported() {
        // Arrange
        let writer = MultiDiskWriter::new(vec![target("public", true, untouched_disk())], None);
        let chunks: Vec<io::Result<Bytes>> = vec![
            Ok(Bytes::from_static(b"partial")),
            Err(io::Error::new(io::ErrorKind::ConnectionReset, "reset")),
        ];
        let source = StreamReader::new(futures::stream::iter(chunks));

        // Act
        let result = writer.buffer_source(source).await;

        // Assert
        assert!(matches!(result, Err(UploadError::SourceRead { .. })));
    }

    #[tokio::test]
    async fn source_over_ceiling_is_invalid_input() {
        let writer = MultiDiskWriter::new(vec![target("public", true, untouched_disk())], None)
            .with_max_bytes(4);

        let result = writer.buffer_source(&b"12345"[..]).await;

        assert!(matches!(result, Err(UploadError::InvalidInput { .. })));
    }

    #[tokio::test]
    async fn source_at_ceiling_is_accepted() {
        let writer = MultiDiskWriter::new(vec![target("public", true, ok_disk("public"))], None)
            .with_max_bytes(5);

        let bytes = writer.buffer_source(&b"12345"[..]).await.unwrap();
        let report = writer.write(KEY, &bytes).await.unwrap();

        assert_eq!(report.written_disks(), vec!["public".to_owned()]);
    }

    #[tokio::test]
    async fn parallel_write_runs_inside_spawned_task() {
        // Arrange
        let writer = Arc::new(
            MultiDiskWriter::new(
                vec![
                    target("public", true, ok_disk("public")),
                    target("cdn", false, ok_disk("cdn")),
                ],
                None,
            )
            .with_concurrency(2),
        );
        let bytes = content();

        // Act
        let report = tokio::spawn({
            let writer = writer.clone();
            async move { writer.write(KEY, &bytes).await }
        })
        .await
        .unwrap()
        .unwrap();

        // Assert
        assert_eq!(
            report.written_disks(),
            vec!["cdn".to_owned(), "public".to_owned()]
        );
    }

    #[tokio::test]
    async fn cleanup_deletes_only_existing_keys() {
        // Arrange
        let mut public = MockDisk::new();
        public.expect_exists().times(1).returning(|_| Ok(true));
        public.expect_delete().with(eq(KEY)).times(1).returning(|_| Ok(()));
        let mut cdn = MockDisk::new();
        cdn.expect_exists().times(1).returning(|_| Ok(false));
        cdn.expect_delete().never();
        let writer = MultiDiskWriter::new(
            vec![target("public", true, public), target("cdn", false, cdn)],
            None,
        );

        // Act
        writer
            .cleanup(KEY, &["public".to_owned(), "cdn".to_owned(), "ghost".to_owned()])
            .await;
    }
}

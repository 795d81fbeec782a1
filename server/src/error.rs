use std::fmt;
use std::io;

use uuid::Uuid;

/// Why a single disk refused a write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiskErrorKind {
    ConfigMissing,
    IoFailure,
    QuotaExceeded,
}

impl fmt::Display for DiskErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            DiskErrorKind::ConfigMissing => "config missing",
            DiskErrorKind::IoFailure => "io failure",
            DiskErrorKind::QuotaExceeded => "quota exceeded",
        };
        f.write_str(s)
    }
}

/// Failure of one disk operation. Never fatal on its own.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("disk '{disk}' {kind}: {message}")]
pub struct DiskError {
    pub disk: String,
    pub kind: DiskErrorKind,
    pub message: String,
}

impl DiskError {
    pub fn new(disk: &str, kind: DiskErrorKind, message: impl Into<String>) -> Self {
        Self {
            disk: disk.to_owned(),
            kind,
            message: message.into(),
        }
    }

    pub fn io(disk: &str, e: &io::Error) -> Self {
        let kind = match e.kind() {
            io::ErrorKind::StorageFull | io::ErrorKind::FileTooLarge => {
                DiskErrorKind::QuotaExceeded
            }
            _ => DiskErrorKind::IoFailure,
        };
        Self::new(disk, kind, e.to_string())
    }
}

pub type UploadResult<T> = Result<T, UploadError>;

#[derive(Debug, thiserror::Error)]
pub enum UploadError {
    #[error("invalid input: {reason}")]
    InvalidInput { reason: String },

    #[error("source stream could not be read: {source}")]
    SourceRead {
        #[source]
        source: io::Error,
    },

    #[error("critical storage failure for asset {asset_id:?} on disk(s) {}; attempted: {}", join_disks(failures), attempted.join(", "))]
    CriticalStorageFailure {
        asset_id: Option<Uuid>,
        attempted: Vec<String>,
        failures: Vec<DiskError>,
    },

    #[error("asset {asset_id} written to {} but not committed: {source}", written.join(", "))]
    TransactionCommit {
        asset_id: Uuid,
        written: Vec<String>,
        #[source]
        source: anyhow::Error,
    },

    #[error("database error: {source}")]
    Database {
        #[source]
        source: anyhow::Error,
    },
}

impl UploadError {
    pub fn invalid_input(reason: impl Into<String>) -> Self {
        UploadError::InvalidInput {
            reason: reason.into(),
        }
    }

    pub fn database<E>(e: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        UploadError::Database { source: e.into() }
    }

    /// Attaches the allocated asset id to a storage failure.
    #[must_use]
    pub fn for_asset(self, id: Uuid) -> Self {
        match self {
            UploadError::CriticalStorageFailure {
                attempted, failures, ..
            } => UploadError::CriticalStorageFailure {
                asset_id: Some(id),
                attempted,
                failures,
            },
            other => other,
        }
    }

    /// Stable code reported to API callers.
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            UploadError::InvalidInput { .. } => "INVALID_INPUT",
            UploadError::SourceRead { .. } => "SOURCE_READ_FAILED",
            UploadError::CriticalStorageFailure { .. } => "CRITICAL_STORAGE_FAILURE",
            UploadError::TransactionCommit { .. } => "TRANSACTION_COMMIT_FAILED",
            UploadError::Database { .. } => "DATABASE_ERROR",
        }
    }

    #[must_use]
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            UploadError::InvalidInput { .. } | UploadError::SourceRead { .. }
        )
    }
}

fn join_disks(failures: &[DiskError]) -> String {
    failures
        .iter()
        .map(|f| f.disk.as_str())
        .collect::<Vec<_>>()
        .join(", ")
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("config file {path} cannot be read: {source}")]
    Read {
        path: String,
        #[source]
        source: io::Error,
    },

    #[error("config file {path} is malformed: {source}")]
    Parse {
        path: String,
        #[source]
        source: toml::de::Error,
    },

    #[error("invalid storage config: {0}")]
    Invalid(String),
}

#[derive(Debug, thiserror::Error)]
#[error("cache invalidation failed for {scope}: {message}")]
pub struct CacheError {
    pub scope: String,
    pub message: String,
}

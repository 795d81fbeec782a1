#![warn(clippy::unwrap_in_result)]
#![warn(clippy::unwrap_used)]

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use utoipa::ToSchema;
use uuid::Uuid;

/// Lifecycle state of a stored asset.
///
/// Only `Stored` assets are ever visible to readers. `Pending` exists inside an open
/// upload transaction and `Failed` marks an asset whose critical copies could not be
/// written; neither survives a commit.
#[derive(Serialize, Deserialize, ToSchema, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum AssetStatus {
    Pending,
    Stored,
    Failed,
}

impl AssetStatus {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            AssetStatus::Pending => "pending",
            AssetStatus::Stored => "stored",
            AssetStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for AssetStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AssetStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(AssetStatus::Pending),
            "stored" => Ok(AssetStatus::Stored),
            "failed" => Ok(AssetStatus::Failed),
            other => Err(format!("unknown asset status: {other}")),
        }
    }
}

/// Represents one uploaded binary object.
///
/// Identity, ownership, content key and descriptive metadata are fixed at creation.
/// Only `storage_locations` and `status` change, and only while the upload
/// transaction that created the asset is still open.
#[derive(Serialize, Deserialize, ToSchema, Debug, Clone, PartialEq, Eq)]
pub struct StoredAsset {
    /// Unique identifier, freshly assigned for every upload attempt
    pub id: Uuid,
    /// Owner of the asset
    pub owner_id: i64,
    /// Grouping (collection) the asset belongs to
    pub container_id: i64,
    /// Canonical storage key used on every disk
    pub content_key: String,
    /// BLAKE3 hash of the content for integrity verification and deduplication
    pub content_hash: String,
    /// Mime type of the content
    pub mime_type: String,
    /// Size of the content in bytes
    pub byte_size: u64,
    /// Lower-case file extension without a dot
    pub extension: String,
    /// Disk name to URL (or path when the disk cannot produce a URL)
    pub storage_locations: BTreeMap<String, String>,
    /// Lifecycle state
    pub status: AssetStatus,
}

impl StoredAsset {
    /// Whether every disk in `critical` has a recorded location.
    #[must_use]
    pub fn has_locations_for<'a, I>(&self, critical: I) -> bool
    where
        I: IntoIterator<Item = &'a str>,
    {
        critical
            .into_iter()
            .all(|disk| self.storage_locations.contains_key(disk))
    }
}

/// Result of a successful upload.
#[derive(Serialize, Deserialize, ToSchema, Debug, Clone, PartialEq, Eq)]
pub struct UploadReceipt {
    pub asset_id: Uuid,
    pub container_id: i64,
    pub content_key: String,
    pub content_hash: String,
    pub byte_size: u64,
    pub storage_locations: BTreeMap<String, String>,
    /// True when an already stored asset with the same owner and hash was returned
    /// and nothing was written
    pub deduplicated: bool,
}

impl UploadReceipt {
    #[must_use]
    pub fn from_asset(asset: &StoredAsset, deduplicated: bool) -> Self {
        Self {
            asset_id: asset.id,
            container_id: asset.container_id,
            content_key: asset.content_key.clone(),
            content_hash: asset.content_hash.clone(),
            byte_size: asset.byte_size,
            storage_locations: asset.storage_locations.clone(),
            deduplicated,
        }
    }
}

/// Error payload returned to callers when an upload or lookup fails.
#[derive(Serialize, Deserialize, ToSchema, Debug, Clone)]
pub struct ErrorBody {
    /// Message safe to show to end users
    pub user_message: String,
    /// Stable machine readable code
    pub error_code: String,
    /// Technical details for logs and debugging
    pub error_details: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn asset() -> StoredAsset {
        StoredAsset {
            id: Uuid::nil(),
            owner_id: 1,
            container_id: 2,
            content_key: "users_files/containers_2/owners_1/x.png".to_owned(),
            content_hash: "abc".to_owned(),
            mime_type: "image/png".to_owned(),
            byte_size: 3,
            extension: "png".to_owned(),
            storage_locations: BTreeMap::from([("public".to_owned(), "/p".to_owned())]),
            status: AssetStatus::Stored,
        }
    }

    #[test]
    fn status_round_trips_through_str() {
        for status in [AssetStatus::Pending, AssetStatus::Stored, AssetStatus::Failed] {
            assert_eq!(status.as_str().parse::<AssetStatus>(), Ok(status));
        }
        assert!("gone".parse::<AssetStatus>().is_err());
    }

    #[test]
    fn status_serializes_lowercase() {
        let json = serde_json::to_string(&AssetStatus::Stored).unwrap();
        assert_eq!(json, r#""stored""#);
    }

    #[test]
    fn has_locations_for_critical_disks() {
        let a = asset();
        assert!(a.has_locations_for(["public"]));
        assert!(a.has_locations_for([]));
        assert!(!a.has_locations_for(["public", "cdn"]));
    }

    #[test]
    fn receipt_copies_asset_fields() {
        let a = asset();
        let r = UploadReceipt::from_asset(&a, true);
        assert_eq!(r.asset_id, a.id);
        assert_eq!(r.storage_locations, a.storage_locations);
        assert!(r.deduplicated);
    }
}

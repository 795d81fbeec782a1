use std::fmt::{Debug, Display};

use kernel::{AssetStatus, StoredAsset};
use uuid::Uuid;

/// Relational store of asset metadata.
///
/// Write methods are only valid between `begin` and `commit`/`rollback`. Readers never
/// see rows that are not committed and `STORED`, so a committed `PENDING` row is private
/// to the upload that created it.
pub trait Storage {
    type Err: Debug + Display + std::error::Error + Send + Sync + 'static;

    fn new_database(&self) -> Result<(), Self::Err>;

    fn begin(&mut self) -> Result<(), Self::Err>;

    fn commit(&mut self) -> Result<(), Self::Err>;

    fn rollback(&mut self) -> Result<(), Self::Err>;

    fn in_transaction(&self) -> bool;

    fn insert_asset(&mut self, asset: &StoredAsset) -> Result<(), Self::Err>;

    fn insert_location(&mut self, id: Uuid, disk: &str, location: &str) -> Result<(), Self::Err>;

    fn update_status(&mut self, id: Uuid, status: AssetStatus) -> Result<(), Self::Err>;

    /// Removes the asset row and its locations. Removing a missing row succeeds.
    fn delete_asset(&mut self, id: Uuid) -> Result<(), Self::Err>;

    fn find_stored_by_hash(
        &mut self,
        owner_id: i64,
        content_hash: &str,
    ) -> Result<Option<StoredAsset>, Self::Err>;

    fn get_asset(&mut self, id: Uuid) -> Result<Option<StoredAsset>, Self::Err>;

    fn get_container_assets(&mut self, container_id: i64) -> Result<Vec<StoredAsset>, Self::Err>;
}

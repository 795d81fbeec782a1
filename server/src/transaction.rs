//! Ties the metadata row to the physical write.
//!
//! The relational store and the disks cannot share a transaction, so consistency comes
//! from ordering and compensation. The PENDING row is committed before any byte is
//! written, in a short transaction of its own. Readers only see STORED rows, so the
//! row stays private while the disks are written and no database lock is held
//! meanwhile. A second short transaction records the locations and flips the row to
//! STORED once the critical copies exist. When that cannot happen, the written keys
//! are deleted together with the row. Caches hear about the asset only after the
//! commit.

use std::sync::Arc;

use bytes::Bytes;
use kernel::{AssetStatus, StoredAsset, UploadReceipt};
use tokio::sync::Mutex;
use tokio::task::JoinError;
use uuid::Uuid;

use crate::addresser::ContentAddresser;
use crate::cache::{container_scope, CacheInvalidator};
use crate::domain::Storage;
use crate::error::{UploadError, UploadResult};
use crate::writer::{MultiDiskWriter, WriteReport};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionState {
    Open,
    Writing,
    Committed,
    RolledBack,
}

/// Descriptive metadata of the inbound file, known before the transaction opens.
#[derive(Debug, Clone)]
pub struct FileMeta {
    pub extension: String,
    pub mime_type: String,
    pub byte_size: u64,
    pub content_hash: String,
}

/// Why the STORED transition did not happen.
enum Finish<E> {
    NotRecorded(E),
    NotCommitted(E),
}

pub struct UploadTransaction<S: Storage + Send + 'static> {
    store: Arc<Mutex<S>>,
    state: TransactionState,
    asset_id: Uuid,
}

impl<S: Storage + Send + 'static> UploadTransaction<S> {
    /// Commits the PENDING asset row.
    ///
    /// The asset id is fresh for every call, so a retry of a failed upload never lands
    /// on a key written by an earlier attempt.
    pub async fn begin(
        store: S,
        addresser: &ContentAddresser,
        owner_id: i64,
        container_id: i64,
        meta: FileMeta,
    ) -> UploadResult<(Self, StoredAsset)> {
        let id = Uuid::new_v4();
        let content_key = addresser.compute_key(owner_id, container_id, id, &meta.extension)?;
        let asset = StoredAsset {
            id,
            owner_id,
            container_id,
            content_key,
            content_hash: meta.content_hash,
            mime_type: meta.mime_type,
            byte_size: meta.byte_size,
            extension: meta.extension,
            storage_locations: Default::default(),
            status: AssetStatus::Pending,
        };

        let store = Arc::new(Mutex::new(store));
        let row = asset.clone();
        blocking(&store, move |s| {
            short_transaction(s, |s| s.insert_asset(&row)).map_err(UploadError::database)
        })
        .await
        .map_err(UploadError::database)??;

        tracing::info!(
            "asset {id} created as pending, owner: {owner_id} container: {container_id} key: {}",
            asset.content_key
        );
        let transaction = Self {
            store,
            state: TransactionState::Open,
            asset_id: id,
        };
        Ok((transaction, asset))
    }

    /// Writes the bytes and marks the asset stored or removes it, depending on the
    /// critical disks.
    pub async fn attempt_store(
        mut self,
        mut asset: StoredAsset,
        bytes: &Bytes,
        writer: &MultiDiskWriter,
        invalidator: &dyn CacheInvalidator,
    ) -> UploadResult<UploadReceipt> {
        self.state = TransactionState::Writing;

        let report = match writer.write(&asset.content_key, bytes).await {
            Ok(report) => report,
            Err(e) => {
                self.abort().await;
                return Err(e.for_asset(asset.id));
            }
        };

        asset.storage_locations = report.locations.clone();
        let critical_copies =
            report.via_fallback || asset.has_locations_for(writer.critical_disks());
        if !report.critical_satisfied() || !critical_copies {
            tracing::error!(
                "asset {} missing critical copies on {:?}, rolling back",
                asset.id,
                report.critical_failures
            );
            writer
                .cleanup(&asset.content_key, &report.written_disks())
                .await;
            self.abort().await;
            return Err(UploadError::CriticalStorageFailure {
                asset_id: Some(asset.id),
                attempted: writer.disk_names(),
                failures: report.failures,
            });
        }

        let row = asset.clone();
        let finished = blocking(&self.store, move |s| record_stored(s, &row)).await;
        match finished {
            Ok(Ok(())) => {}
            Ok(Err(Finish::NotCommitted(e))) => {
                return Err(self.commit_failed(&asset, &report, writer, e.into()).await);
            }
            Ok(Err(Finish::NotRecorded(e))) => {
                tracing::error!("asset {} cannot be marked stored: {e}", asset.id);
                writer
                    .cleanup(&asset.content_key, &report.written_disks())
                    .await;
                self.abort().await;
                return Err(UploadError::database(e));
            }
            Err(e) => {
                return Err(self.commit_failed(&asset, &report, writer, e.into()).await);
            }
        }
        self.state = TransactionState::Committed;
        asset.status = AssetStatus::Stored;
        tracing::info!(
            "asset {} stored on {:?}",
            asset.id,
            report.written_disks()
        );

        let scopes = [container_scope(asset.container_id)];
        if let Err(e) = invalidator.invalidate(&scopes).await {
            tracing::warn!("{e}");
        }

        Ok(UploadReceipt::from_asset(&asset, false))
    }

    async fn commit_failed(
        &mut self,
        asset: &StoredAsset,
        report: &WriteReport,
        writer: &MultiDiskWriter,
        e: anyhow::Error,
    ) -> UploadError {
        let written = report.written_disks();
        tracing::error!(
            "MANUAL RECONCILIATION REQUIRED: asset {} key {} written to {written:?} but commit failed: {e}",
            asset.id,
            asset.content_key
        );
        writer.cleanup(&asset.content_key, &written).await;
        self.abort().await;
        UploadError::TransactionCommit {
            asset_id: asset.id,
            written,
            source: e,
        }
    }

    async fn abort(&mut self) {
        let id = self.asset_id;
        if let Err(e) = blocking(&self.store, move |s| discard(s, id)).await {
            tracing::error!("asset {id} rollback did not run: {e}");
        }
        self.state = TransactionState::RolledBack;
    }
}

impl<S: Storage + Send + 'static> Drop for UploadTransaction<S> {
    fn drop(&mut self) {
        if !matches!(
            self.state,
            TransactionState::Open | TransactionState::Writing
        ) {
            return;
        }
        let store = self.store.clone();
        let id = self.asset_id;
        let remove = move || discard(&mut *store.blocking_lock(), id);
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                runtime.spawn_blocking(remove);
            }
            Err(_) => remove(),
        }
    }
}

/// Runs `action` against the store on the blocking pool.
async fn blocking<S, R, F>(store: &Arc<Mutex<S>>, action: F) -> Result<R, JoinError>
where
    S: Send + 'static,
    R: Send + 'static,
    F: FnOnce(&mut S) -> R + Send + 'static,
{
    let store = store.clone();
    tokio::task::spawn_blocking(move || action(&mut *store.blocking_lock())).await
}

fn short_transaction<S, F>(store: &mut S, work: F) -> Result<(), S::Err>
where
    S: Storage,
    F: FnOnce(&mut S) -> Result<(), S::Err>,
{
    store.begin()?;
    let result = work(store).and_then(|()| store.commit());
    if result.is_err() && store.in_transaction() {
        if let Err(e) = store.rollback() {
            tracing::error!("rollback failed: {e}");
        }
    }
    result
}

fn record_stored<S: Storage>(store: &mut S, asset: &StoredAsset) -> Result<(), Finish<S::Err>> {
    store.begin().map_err(Finish::NotRecorded)?;
    let recorded = asset
        .storage_locations
        .iter()
        .try_for_each(|(disk, location)| store.insert_location(asset.id, disk, location))
        .and_then(|()| store.update_status(asset.id, AssetStatus::Stored));
    let result = match recorded {
        Ok(()) => store.commit().map_err(Finish::NotCommitted),
        Err(e) => Err(Finish::NotRecorded(e)),
    };
    if result.is_err() && store.in_transaction() {
        if let Err(e) = store.rollback() {
            tracing::error!("asset {} rollback failed: {e}", asset.id);
        }
    }
    result
}

/// Removes the PENDING row so no trace of a failed upload stays in the database.
fn discard<S: Storage>(store: &mut S, id: Uuid) {
    if store.in_transaction() {
        if let Err(e) = store.rollback() {
            tracing::error!("asset {id} rollback failed: {e}");
        }
    }
    match short_transaction(store, |s| s.delete_asset(id)) {
        Ok(()) => tracing::warn!("asset {id} rolled back"),
        Err(e) => tracing::error!("asset {id} stays pending, row not removed: {e}"),
    }
}

use std::collections::BTreeMap;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use kernel::{AssetStatus, StoredAsset};
use rusqlite::types::Type;
use rusqlite::{params, Connection, Error, OpenFlags, OptionalExtension, Row};
use uuid::Uuid;

use crate::domain::Storage;

const CACHE_SIZE: &str = "4096";

const ASSET_COLUMNS: &str = "id, owner_id, container_id, content_key, content_hash, mime_type, byte_size, extension, status";

pub enum Mode {
    ReadWrite,
    ReadOnly,
}

pub struct Sqlite {
    conn: Connection,
}

impl Storage for Sqlite {
    type Err = Error;

    fn new_database(&self) -> Result<(), Self::Err> {
        self.pragma_update("encoding", "UTF-8")?;
        let mode: String = self
            .conn
            .pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get(0))?;
        tracing::debug!("journal mode: {mode}");

        self.conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS asset (
                  id            TEXT PRIMARY KEY,
                  owner_id      INTEGER NOT NULL,
                  container_id  INTEGER NOT NULL,
                  content_key   TEXT NOT NULL UNIQUE,
                  content_hash  TEXT NOT NULL,
                  mime_type     TEXT NOT NULL,
                  byte_size     INTEGER NOT NULL,
                  extension     TEXT NOT NULL,
                  status        TEXT NOT NULL
                  );
             CREATE TABLE IF NOT EXISTS asset_location (
                  asset_id  TEXT NOT NULL REFERENCES asset(id) ON DELETE CASCADE ON UPDATE RESTRICT,
                  disk      TEXT NOT NULL,
                  location  TEXT NOT NULL,
                  PRIMARY KEY (asset_id, disk)
                  );
             CREATE INDEX IF NOT EXISTS asset_owner_hash_ix ON asset(owner_id, content_hash);
             CREATE INDEX IF NOT EXISTS asset_container_ix ON asset(container_id);",
        )?;

        Ok(())
    }

    fn begin(&mut self) -> Result<(), Self::Err> {
        self.assign_cache_size()?;
        self.enable_foreign_keys()?;
        self.pragma_update("synchronous", "FULL")?;
        // IMMEDIATE takes the write lock up front, waiting at most the busy timeout
        self.conn.execute_batch("BEGIN IMMEDIATE")
    }

    fn commit(&mut self) -> Result<(), Self::Err> {
        self.conn.execute_batch("COMMIT")
    }

    fn rollback(&mut self) -> Result<(), Self::Err> {
        self.conn.execute_batch("ROLLBACK")
    }

    fn in_transaction(&self) -> bool {
        !self.conn.is_autocommit()
    }

    fn insert_asset(&mut self, asset: &StoredAsset) -> Result<(), Self::Err> {
        let size = i64::try_from(asset.byte_size)
            .map_err(|e| Error::ToSqlConversionFailure(Box::new(e)))?;
        self.conn
            .prepare_cached(
                "INSERT INTO asset (id, owner_id, container_id, content_key, content_hash, mime_type, byte_size, extension, status)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            )?
            .execute(params![
                asset.id.to_string(),
                asset.owner_id,
                asset.container_id,
                &asset.content_key,
                &asset.content_hash,
                &asset.mime_type,
                size,
                &asset.extension,
                asset.status.as_str(),
            ])?;
        for (disk, location) in &asset.storage_locations {
            self.insert_location(asset.id, disk, location)?;
        }
        Ok(())
    }

    fn insert_location(&mut self, id: Uuid, disk: &str, location: &str) -> Result<(), Self::Err> {
        self.conn
            .prepare_cached(
                "INSERT OR REPLACE INTO asset_location (asset_id, disk, location) VALUES (?1, ?2, ?3)",
            )?
            .execute(params![id.to_string(), disk, location])?;
        Ok(())
    }

    fn update_status(&mut self, id: Uuid, status: AssetStatus) -> Result<(), Self::Err> {
        let updated = self
            .conn
            .prepare_cached("UPDATE asset SET status = ?1 WHERE id = ?2")?
            .execute(params![status.as_str(), id.to_string()])?;
        if updated == 0 {
            return Err(Error::QueryReturnedNoRows);
        }
        Ok(())
    }

    fn delete_asset(&mut self, id: Uuid) -> Result<(), Self::Err> {
        let id = id.to_string();
        self.conn
            .prepare_cached("DELETE FROM asset_location WHERE asset_id = ?1")?
            .execute(params![&id])?;
        self.conn
            .prepare_cached("DELETE FROM asset WHERE id = ?1")?
            .execute(params![&id])?;
        Ok(())
    }

    fn find_stored_by_hash(
        &mut self,
        owner_id: i64,
        content_hash: &str,
    ) -> Result<Option<StoredAsset>, Self::Err> {
        let sql = format!(
            "SELECT {ASSET_COLUMNS} FROM asset
             WHERE owner_id = ?1 AND content_hash = ?2 AND status = ?3
             ORDER BY rowid LIMIT 1"
        );
        let asset = self
            .conn
            .prepare_cached(&sql)?
            .query_row(
                params![owner_id, content_hash, AssetStatus::Stored.as_str()],
                asset_from_row,
            )
            .optional()?;
        asset.map(|a| self.with_locations(a)).transpose()
    }

    fn get_asset(&mut self, id: Uuid) -> Result<Option<StoredAsset>, Self::Err> {
        let sql = format!("SELECT {ASSET_COLUMNS} FROM asset WHERE id = ?1 AND status = ?2");
        let asset = self
            .conn
            .prepare_cached(&sql)?
            .query_row(
                params![id.to_string(), AssetStatus::Stored.as_str()],
                asset_from_row,
            )
            .optional()?;
        asset.map(|a| self.with_locations(a)).transpose()
    }

    fn get_container_assets(&mut self, container_id: i64) -> Result<Vec<StoredAsset>, Self::Err> {
        let sql = format!(
            "SELECT {ASSET_COLUMNS} FROM asset WHERE container_id = ?1 AND status = ?2 ORDER BY rowid"
        );
        let assets = self
            .conn
            .prepare_cached(&sql)?
            .query_map(
                params![container_id, AssetStatus::Stored.as_str()],
                asset_from_row,
            )?
            .collect::<Result<Vec<_>, _>>()?;
        assets
            .into_iter()
            .map(|a| self.with_locations(a))
            .collect()
    }
}

impl Sqlite {
    pub fn open<P: AsRef<Path>>(path: P, mode: Mode) -> Result<Self, Error> {
        let c = match mode {
            Mode::ReadWrite => Connection::open(path),
            Mode::ReadOnly => Connection::open_with_flags(path, OpenFlags::SQLITE_OPEN_READ_ONLY),
        };
        Ok(Self { conn: c? })
    }

    /// How long a statement waits for a lock held by another connection before failing.
    pub fn set_busy_timeout(&self, timeout: Duration) -> Result<(), Error> {
        self.conn.busy_timeout(timeout)
    }

    fn with_locations(&self, mut asset: StoredAsset) -> Result<StoredAsset, Error> {
        let locations = self
            .conn
            .prepare_cached("SELECT disk, location FROM asset_location WHERE asset_id = ?1")?
            .query_map(params![asset.id.to_string()], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
            })?
            .collect::<Result<BTreeMap<_, _>, _>>()?;
        asset.storage_locations = locations;
        Ok(asset)
    }

    fn enable_foreign_keys(&self) -> Result<(), Error> {
        self.pragma_update("foreign_keys", "ON")
    }

    fn assign_cache_size(&self) -> Result<(), Error> {
        self.pragma_update("cache_size", CACHE_SIZE)
    }

    fn pragma_update(&self, name: &str, value: &str) -> Result<(), Error> {
        self.conn.pragma_update(None, name, value)
    }
}

fn asset_from_row(row: &Row<'_>) -> Result<StoredAsset, Error> {
    let id: String = row.get(0)?;
    let id = Uuid::parse_str(&id)
        .map_err(|e| Error::FromSqlConversionFailure(0, Type::Text, Box::new(e)))?;
    let size: i64 = row.get(6)?;
    let status: String = row.get(8)?;
    let status = AssetStatus::from_str(&status)
        .map_err(|e| Error::FromSqlConversionFailure(8, Type::Text, e.into()))?;
    Ok(StoredAsset {
        id,
        owner_id: row.get(1)?,
        container_id: row.get(2)?,
        content_key: row.get(3)?,
        content_hash: row.get(4)?,
        mime_type: row.get(5)?,
        byte_size: u64::try_from(size).unwrap_or_default(),
        extension: row.get(7)?,
        storage_locations: BTreeMap::new(),
        status,
    })
}

//! Durable local store for photo records
//!
//! All access goes through one SQLite connection behind a mutex, which
//! serializes every mutation. Status changes are validated and written inside
//! a transaction so readers never observe a half-applied transition.

use crate::config::StoreConfig;
use crate::models::{ImageFormat, PhotoRecord, StorageEstimate, SyncStatus};
use crate::schema::init_photo_schema;
use chrono::{DateTime, Utc};
use rusqlite::types::{FromSql, FromSqlError, FromSqlResult, ToSql, ToSqlOutput, Type, ValueRef};
use rusqlite::{params, Connection, OptionalExtension, Params, Row};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use uuid::Uuid;

/// Metadata key holding the RFC 3339 time of the last completed sync pass
pub const LAST_SYNC_KEY: &str = "lastSync";

const SELECT_COLUMNS: &str = "id, owner_user_id, product_id, category, bytes, thumbnail_bytes,
    size, width, height, format, quality, timestamp, sync_status, upload_key, upload_url,
    retry_count, sync_error, last_sync_attempt";

/// Error type for local store operations
#[derive(Debug)]
pub enum StoreError {
    DatabaseError(rusqlite::Error),
    IoError(std::io::Error),
    NotFound(String),
    InvalidTransition {
        id: Uuid,
        from: SyncStatus,
        to: SyncStatus,
    },
    QuotaExceeded {
        required: u64,
        available: u64,
    },
    Corrupt(String),
}

impl std::fmt::Display for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StoreError::DatabaseError(e) => write!(f, "Database error: {}", e),
            StoreError::IoError(e) => write!(f, "IO error: {}", e),
            StoreError::NotFound(msg) => write!(f, "Not found: {}", msg),
            StoreError::InvalidTransition { id, from, to } => {
                write!(f, "Photo {} cannot move from {} to {}", id, from, to)
            }
            StoreError::QuotaExceeded {
                required,
                available,
            } => write!(
                f,
                "Storage quota exceeded: {} bytes required, {} bytes available",
                required, available
            ),
            StoreError::Corrupt(msg) => write!(f, "Store corrupt: {}", msg),
        }
    }
}

impl std::error::Error for StoreError {}

impl From<rusqlite::Error> for StoreError {
    fn from(err: rusqlite::Error) -> Self {
        StoreError::DatabaseError(err)
    }
}

impl From<std::io::Error> for StoreError {
    fn from(err: std::io::Error) -> Self {
        StoreError::IoError(err)
    }
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Result of [`PhotoStore::record_failure`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FailureOutcome {
    pub status: SyncStatus,
    pub retry_count: u32,
}

impl ToSql for SyncStatus {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(ToSqlOutput::from(self.as_str()))
    }
}

impl FromSql for SyncStatus {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        let s = value.as_str()?;
        SyncStatus::parse(s)
            .ok_or_else(|| FromSqlError::Other(format!("unknown sync status '{}'", s).into()))
    }
}

fn from_millis(column: usize, millis: i64) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::from_timestamp_millis(millis)
        .ok_or(rusqlite::Error::IntegralValueOutOfRange(column, millis))
}

fn row_to_record(row: &Row<'_>) -> rusqlite::Result<PhotoRecord> {
    let id: String = row.get(0)?;
    let format: String = row.get(9)?;
    let timestamp: i64 = row.get(11)?;
    let last_sync_attempt: Option<i64> = row.get(17)?;

    Ok(PhotoRecord {
        id: Uuid::parse_str(&id)
            .map_err(|e| rusqlite::Error::FromSqlConversionFailure(0, Type::Text, Box::new(e)))?,
        owner_user_id: row.get(1)?,
        product_id: row.get(2)?,
        category: row.get(3)?,
        bytes: row.get(4)?,
        thumbnail_bytes: row.get(5)?,
        size: row.get::<_, i64>(6)? as u64,
        width: row.get(7)?,
        height: row.get(8)?,
        format: ImageFormat::parse(&format).ok_or_else(|| {
            rusqlite::Error::FromSqlConversionFailure(
                9,
                Type::Text,
                format!("unknown image format '{}'", format).into(),
            )
        })?,
        quality: row.get::<_, f64>(10)? as f32,
        timestamp: from_millis(11, timestamp)?,
        sync_status: row.get(12)?,
        upload_key: row.get(13)?,
        upload_url: row.get(14)?,
        retry_count: row.get(15)?,
        sync_error: row.get(16)?,
        last_sync_attempt: last_sync_attempt.map(|ms| from_millis(17, ms)).transpose()?,
    })
}

fn current_status(conn: &Connection, id: &Uuid) -> StoreResult<(SyncStatus, u32)> {
    conn.query_row(
        "SELECT sync_status, retry_count FROM photos WHERE id = ?1",
        params![id.to_string()],
        |row| Ok((row.get(0)?, row.get(1)?)),
    )
    .optional()?
    .ok_or_else(|| StoreError::NotFound(format!("Photo {}", id)))
}

fn usage(conn: &Connection, quota: u64) -> rusqlite::Result<StorageEstimate> {
    let page_count: i64 = conn.query_row("PRAGMA page_count", [], |row| row.get(0))?;
    let page_size: i64 = conn.query_row("PRAGMA page_size", [], |row| row.get(0))?;
    let freelist: i64 = conn.query_row("PRAGMA freelist_count", [], |row| row.get(0))?;

    let used = ((page_count - freelist).max(0) * page_size) as u64;
    Ok(StorageEstimate {
        used,
        available: quota.saturating_sub(used),
        quota,
    })
}

/// SQLite-backed photo repository
pub struct PhotoStore {
    conn: Mutex<Connection>,
    config: StoreConfig,
}

impl PhotoStore {
    /// Opens (or creates) the store at `path`.
    ///
    /// Photos left in `syncing` by an interrupted process are put back to
    /// `pending` so the next pass picks them up again.
    pub fn open(path: impl AsRef<Path>, config: StoreConfig) -> StoreResult<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let store = Self::from_connection(Connection::open(path)?, config)?;
        let recovered = store.recover_interrupted()?;
        if recovered > 0 {
            log::info!("Recovered {} interrupted uploads in {:?}", recovered, path);
        }
        Ok(store)
    }

    pub fn open_in_memory(config: StoreConfig) -> StoreResult<Self> {
        Self::from_connection(Connection::open_in_memory()?, config)
    }

    fn from_connection(conn: Connection, config: StoreConfig) -> StoreResult<Self> {
        init_photo_schema(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
            config,
        })
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    fn conn(&self) -> StoreResult<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| StoreError::Corrupt("connection lock poisoned".to_string()))
    }

    fn query_records<P: Params>(&self, clause: &str, params: P) -> StoreResult<Vec<PhotoRecord>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!("SELECT {} FROM photos {}", SELECT_COLUMNS, clause))?;
        let records = stmt
            .query_map(params, row_to_record)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(records)
    }

    /// Inserts or replaces a record.
    ///
    /// Replacing is subject to the same status rules as
    /// [`update_sync_status`](Self::update_sync_status); new records must fit
    /// into the configured quota.
    pub fn put(&self, record: &PhotoRecord) -> StoreResult<()> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;

        let existing = tx
            .query_row(
                "SELECT sync_status FROM photos WHERE id = ?1",
                params![record.id.to_string()],
                |row| row.get::<_, SyncStatus>(0),
            )
            .optional()?;

        match existing {
            Some(current)
                if current != record.sync_status
                    && !current.can_transition_to(record.sync_status) =>
            {
                return Err(StoreError::InvalidTransition {
                    id: record.id,
                    from: current,
                    to: record.sync_status,
                });
            }
            Some(_) => {}
            None => {
                let required = (record.bytes.len() + record.thumbnail_bytes.len()) as u64;
                let estimate = usage(&tx, self.config.quota_bytes)?;
                if required > estimate.available {
                    return Err(StoreError::QuotaExceeded {
                        required,
                        available: estimate.available,
                    });
                }
            }
        }

        tx.execute(
            "INSERT OR REPLACE INTO photos (id, owner_user_id, product_id, category, bytes,
                thumbnail_bytes, size, width, height, format, quality, timestamp, sync_status,
                upload_key, upload_url, retry_count, sync_error, last_sync_attempt)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18)",
            params![
                record.id.to_string(),
                record.owner_user_id,
                record.product_id,
                record.category,
                record.bytes,
                record.thumbnail_bytes,
                record.size as i64,
                record.width,
                record.height,
                record.format.as_str(),
                record.quality as f64,
                record.timestamp.timestamp_millis(),
                record.sync_status,
                record.upload_key,
                record.upload_url,
                record.retry_count,
                record.sync_error,
                record.last_sync_attempt.map(|t| t.timestamp_millis()),
            ],
        )?;
        tx.commit()?;

        log::debug!("Stored photo {} ({})", record.id, record.sync_status);
        Ok(())
    }

    pub fn get(&self, id: &Uuid) -> StoreResult<Option<PhotoRecord>> {
        let conn = self.conn()?;
        let record = conn
            .query_row(
                &format!("SELECT {} FROM photos WHERE id = ?1", SELECT_COLUMNS),
                params![id.to_string()],
                row_to_record,
            )
            .optional()?;
        Ok(record)
    }

    /// All photos of a user, newest first
    pub fn query_by_user(&self, user_id: &str) -> StoreResult<Vec<PhotoRecord>> {
        self.query_records(
            "WHERE owner_user_id = ?1 ORDER BY timestamp DESC, id",
            params![user_id],
        )
    }

    /// Photos in `status`, oldest first
    pub fn query_by_sync_status(&self, status: SyncStatus) -> StoreResult<Vec<PhotoRecord>> {
        self.query_records(
            "WHERE sync_status = ?1 ORDER BY timestamp ASC, id",
            params![status],
        )
    }

    /// Photos attached to a product, oldest first
    pub fn query_by_product(&self, product_id: &str) -> StoreResult<Vec<PhotoRecord>> {
        self.query_records(
            "WHERE product_id = ?1 ORDER BY timestamp ASC, id",
            params![product_id],
        )
    }

    pub fn count_by_sync_status(&self, status: SyncStatus) -> StoreResult<usize> {
        let conn = self.conn()?;
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM photos WHERE sync_status = ?1",
            params![status],
            |row| row.get(0),
        )?;
        Ok(count as usize)
    }

    /// Moves a photo to `status`.
    ///
    /// Upload key and URL are stored only for `synced` and cleared otherwise.
    /// Reaching `synced` also resets the retry bookkeeping.
    pub fn update_sync_status(
        &self,
        id: &Uuid,
        status: SyncStatus,
        upload_key: Option<&str>,
        upload_url: Option<&str>,
    ) -> StoreResult<()> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;

        let (current, _) = current_status(&tx, id)?;
        if current != status && !current.can_transition_to(status) {
            return Err(StoreError::InvalidTransition {
                id: *id,
                from: current,
                to: status,
            });
        }

        match status {
            SyncStatus::Synced => tx.execute(
                "UPDATE photos SET sync_status = ?2, upload_key = ?3, upload_url = ?4,
                    retry_count = 0, sync_error = NULL
                 WHERE id = ?1",
                params![id.to_string(), status, upload_key, upload_url],
            )?,
            SyncStatus::Syncing => tx.execute(
                "UPDATE photos SET sync_status = ?2, upload_key = NULL, upload_url = NULL,
                    last_sync_attempt = ?3
                 WHERE id = ?1",
                params![id.to_string(), status, Utc::now().timestamp_millis()],
            )?,
            SyncStatus::Pending | SyncStatus::Failed => tx.execute(
                "UPDATE photos SET sync_status = ?2, upload_key = NULL, upload_url = NULL
                 WHERE id = ?1",
                params![id.to_string(), status],
            )?,
        };
        tx.commit()?;

        log::debug!("Photo {}: {} -> {}", id, current, status);
        Ok(())
    }

    /// Books a failed upload attempt for a photo that is currently `syncing`.
    ///
    /// The retry counter is incremented; the photo goes back to `pending`
    /// while the counter is below `max_retries` and to `failed` otherwise.
    pub fn record_failure(
        &self,
        id: &Uuid,
        error: &str,
        max_retries: u32,
    ) -> StoreResult<FailureOutcome> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;

        let (current, retry_count) = current_status(&tx, id)?;
        if current != SyncStatus::Syncing {
            return Err(StoreError::InvalidTransition {
                id: *id,
                from: current,
                to: SyncStatus::Failed,
            });
        }

        let retry_count = retry_count + 1;
        let status = if retry_count >= max_retries {
            SyncStatus::Failed
        } else {
            SyncStatus::Pending
        };

        tx.execute(
            "UPDATE photos SET sync_status = ?2, retry_count = ?3, sync_error = ?4,
                upload_key = NULL, upload_url = NULL
             WHERE id = ?1",
            params![id.to_string(), status, retry_count, error],
        )?;
        tx.commit()?;

        Ok(FailureOutcome {
            status,
            retry_count,
        })
    }

    /// Puts every `failed` photo back to `pending` with a fresh retry budget
    pub fn reset_failed(&self) -> StoreResult<usize> {
        let conn = self.conn()?;
        let count = conn.execute(
            "UPDATE photos SET sync_status = 'pending', retry_count = 0, sync_error = NULL
             WHERE sync_status = 'failed'",
            [],
        )?;
        Ok(count)
    }

    /// Returns photos stuck in `syncing` to `pending`
    pub fn recover_interrupted(&self) -> StoreResult<usize> {
        let conn = self.conn()?;
        let count = conn.execute(
            "UPDATE photos SET sync_status = 'pending' WHERE sync_status = 'syncing'",
            [],
        )?;
        Ok(count)
    }

    pub fn delete(&self, id: &Uuid) -> StoreResult<()> {
        let conn = self.conn()?;
        let rows = conn.execute("DELETE FROM photos WHERE id = ?1", params![id.to_string()])?;

        if rows == 0 {
            return Err(StoreError::NotFound(format!("Photo {}", id)));
        }
        Ok(())
    }

    /// Deletes the oldest photos of `user_id` beyond the newest `keep_count`.
    ///
    /// Best effort: a photo that cannot be deleted is logged and skipped.
    /// Returns the number of photos actually deleted.
    pub fn cleanup_oldest(&self, user_id: &str, keep_count: usize) -> StoreResult<usize> {
        let ids: Vec<String> = {
            let conn = self.conn()?;
            let mut stmt = conn.prepare(
                "SELECT id FROM photos WHERE owner_user_id = ?1
                 ORDER BY timestamp DESC, id LIMIT -1 OFFSET ?2",
            )?;
            let ids = stmt
                .query_map(params![user_id, keep_count as i64], |row| row.get(0))?
                .collect::<Result<Vec<_>, _>>()?;
            ids
        };

        let mut deleted = 0;
        for id in ids {
            let result = Uuid::parse_str(&id)
                .map_err(|e| StoreError::Corrupt(format!("invalid photo id {}: {}", id, e)))
                .and_then(|uuid| self.delete(&uuid));
            match result {
                Ok(()) => deleted += 1,
                Err(e) => log::warn!("Cleanup could not delete photo {}: {}", id, e),
            }
        }

        if deleted > 0 {
            log::info!("Cleaned up {} old photos of user {}", deleted, user_id);
        }
        Ok(deleted)
    }

    pub fn estimate_usage(&self) -> StoreResult<StorageEstimate> {
        let conn = self.conn()?;
        Ok(usage(&conn, self.config.quota_bytes)?)
    }

    pub fn set_metadata(&self, key: &str, value: &str) -> StoreResult<()> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO sync_metadata (key, value) VALUES (?1, ?2)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = CURRENT_TIMESTAMP",
            params![key, value],
        )?;
        Ok(())
    }

    pub fn get_metadata(&self, key: &str) -> StoreResult<Option<String>> {
        let conn = self.conn()?;
        let value = conn
            .query_row(
                "SELECT value FROM sync_metadata WHERE key = ?1",
                params![key],
                |row| row.get(0),
            )
            .optional()?;
        Ok(value)
    }

    pub fn last_sync(&self) -> StoreResult<Option<DateTime<Utc>>> {
        match self.get_metadata(LAST_SYNC_KEY)? {
            Some(raw) => DateTime::parse_from_rfc3339(&raw)
                .map(|t| Some(t.with_timezone(&Utc)))
                .map_err(|e| StoreError::Corrupt(format!("invalid {}: {}", LAST_SYNC_KEY, e))),
            None => Ok(None),
        }
    }

    pub fn set_last_sync(&self, at: DateTime<Utc>) -> StoreResult<()> {
        self.set_metadata(LAST_SYNC_KEY, &at.to_rfc3339())
    }
}

//! Upload schema and data access.
//!
//! A data item lives in exactly one of four stateful tables:
//! `new_item`, `planned_item`, `permanent_item`, `failed_item`. State
//! moves are single transactions that delete from the source table and
//! insert into the target, verifying the row was still where the caller
//! thought it was — a stale transition rolls back and affects nothing.

use rusqlite::{params, Connection, OptionalExtension};
use std::sync::Mutex;
use weft::WeftError;

use crate::error::{is_unique_violation, UploadError};

/// Where an item currently lives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ItemState {
    New,
    Planned { bundle_id: String },
    Permanent { bundle_id: String },
    Failed { reason: String },
}

impl ItemState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ItemState::New => "received",
            ItemState::Planned { .. } => "planned",
            ItemState::Permanent { .. } => "permanent",
            ItemState::Failed { .. } => "failed",
        }
    }
}

#[derive(Debug, Clone)]
pub struct ItemRow {
    pub item_id: String,
    pub owner_address: String,
    pub signature_kind: String,
    pub byte_count: u64,
    pub uploaded_at: i64,
    pub payment_id: Option<String>,
    pub reservation_id: Option<String>,
    pub cached: bool,
    pub is_container: bool,
}

pub mod bundle_status {
    pub const PLANNED: &str = "planned";
    pub const PREPARED: &str = "prepared";
    pub const POSTED: &str = "posted";
    pub const VERIFIED: &str = "verified";
    pub const FAILED: &str = "failed";
}

#[derive(Debug, Clone)]
pub struct BundleRow {
    pub bundle_id: String,
    pub status: String,
    pub standalone: bool,
    pub planned_at: i64,
    pub prepared_at: Option<i64>,
    pub posted_at: Option<i64>,
    pub verified_at: Option<i64>,
    pub byte_count: u64,
    pub item_count: u64,
    pub tx_id: Option<String>,
    pub tx_signature: Option<String>,
}

#[derive(Debug, Clone)]
pub struct OffsetRow {
    pub bundle_id: String,
    pub item_id: String,
    pub offset: u64,
    pub length: u64,
}

#[derive(Debug, Clone)]
pub struct MultipartRow {
    pub upload_id: String,
    pub created_at: i64,
    pub expires_at: i64,
    pub finalized_at: Option<i64>,
    pub chunk_count: u64,
    pub byte_count: u64,
}

/// Placeholder `bundle_id` for pre-bundling offsets that point into the
/// raw bucket.
pub const RAW_POINTER_BUNDLE: &str = "raw";

const ITEM_COLS: &str = "item_id, owner_address, signature_kind, byte_count, uploaded_at,
     payment_id, reservation_id, cached, is_container";

fn item_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<ItemRow> {
    Ok(ItemRow {
        item_id: row.get(0)?,
        owner_address: row.get(1)?,
        signature_kind: row.get(2)?,
        byte_count: row.get::<_, i64>(3)? as u64,
        uploaded_at: row.get(4)?,
        payment_id: row.get(5)?,
        reservation_id: row.get(6)?,
        cached: row.get::<_, i64>(7)? != 0,
        is_container: row.get::<_, i64>(8)? != 0,
    })
}

fn now_ts() -> i64 {
    chrono::Utc::now().timestamp()
}

pub struct UploadDb {
    conn: Mutex<Connection>,
}

impl UploadDb {
    pub fn open(path: &str) -> Result<Self, UploadError> {
        let conn = Connection::open(path)?;
        conn.busy_timeout(std::time::Duration::from_secs(5))?;
        let db = Self {
            conn: Mutex::new(conn),
        };
        db.init_schema()?;
        Ok(db)
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Connection>, UploadError> {
        self.conn
            .lock()
            .map_err(|_| UploadError::internal("database lock poisoned"))
    }

    fn init_schema(&self) -> Result<(), UploadError> {
        let conn = self.lock()?;
        conn.execute_batch(
            r#"
            PRAGMA journal_mode=WAL;

            CREATE TABLE IF NOT EXISTS new_item (
                item_id TEXT PRIMARY KEY,
                owner_address TEXT NOT NULL,
                signature_kind TEXT NOT NULL,
                byte_count INTEGER NOT NULL,
                uploaded_at INTEGER NOT NULL,
                payment_id TEXT,
                reservation_id TEXT,
                cached INTEGER NOT NULL DEFAULT 0,
                is_container INTEGER NOT NULL DEFAULT 0
            );
            CREATE INDEX IF NOT EXISTS idx_new_item_uploaded ON new_item(uploaded_at);

            CREATE TABLE IF NOT EXISTS planned_item (
                item_id TEXT PRIMARY KEY,
                owner_address TEXT NOT NULL,
                signature_kind TEXT NOT NULL,
                byte_count INTEGER NOT NULL,
                uploaded_at INTEGER NOT NULL,
                payment_id TEXT,
                reservation_id TEXT,
                cached INTEGER NOT NULL DEFAULT 0,
                is_container INTEGER NOT NULL DEFAULT 0,
                bundle_id TEXT NOT NULL,
                position INTEGER NOT NULL,
                planned_at INTEGER NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_planned_bundle
                ON planned_item(bundle_id, position);

            CREATE TABLE IF NOT EXISTS permanent_item (
                item_id TEXT PRIMARY KEY,
                owner_address TEXT NOT NULL,
                signature_kind TEXT NOT NULL,
                byte_count INTEGER NOT NULL,
                uploaded_at INTEGER NOT NULL,
                payment_id TEXT,
                reservation_id TEXT,
                cached INTEGER NOT NULL DEFAULT 0,
                is_container INTEGER NOT NULL DEFAULT 0,
                bundle_id TEXT NOT NULL,
                verified_at INTEGER NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_permanent_bundle
                ON permanent_item(bundle_id);

            CREATE TABLE IF NOT EXISTS failed_item (
                item_id TEXT PRIMARY KEY,
                owner_address TEXT NOT NULL,
                signature_kind TEXT NOT NULL,
                byte_count INTEGER NOT NULL,
                uploaded_at INTEGER NOT NULL,
                payment_id TEXT,
                reservation_id TEXT,
                failure_reason TEXT NOT NULL,
                failed_at INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS bundle (
                bundle_id TEXT PRIMARY KEY,
                status TEXT NOT NULL,
                standalone INTEGER NOT NULL DEFAULT 0,
                planned_at INTEGER NOT NULL,
                prepared_at INTEGER,
                posted_at INTEGER,
                verified_at INTEGER,
                byte_count INTEGER NOT NULL,
                item_count INTEGER NOT NULL,
                tx_id TEXT,
                tx_signature TEXT
            );
            CREATE INDEX IF NOT EXISTS idx_bundle_status ON bundle(status);

            CREATE TABLE IF NOT EXISTS item_offset (
                bundle_id TEXT NOT NULL,
                item_id TEXT NOT NULL,
                offset INTEGER NOT NULL,
                length INTEGER NOT NULL,
                PRIMARY KEY (bundle_id, item_id)
            );

            CREATE TABLE IF NOT EXISTS multipart_upload (
                upload_id TEXT PRIMARY KEY,
                created_at INTEGER NOT NULL,
                expires_at INTEGER NOT NULL,
                finalized_at INTEGER,
                chunk_count INTEGER NOT NULL DEFAULT 0,
                byte_count INTEGER NOT NULL DEFAULT 0
            );
            "#,
        )?;
        Ok(())
    }

    // --- duplicate guard & lookups ---

    /// Read-through existence check across all four stateful tables.
    pub fn item_state(&self, item_id: &str) -> Result<Option<ItemState>, UploadError> {
        let conn = self.lock()?;
        if conn
            .query_row(
                "SELECT 1 FROM new_item WHERE item_id = ?1",
                params![item_id],
                |_| Ok(()),
            )
            .optional()?
            .is_some()
        {
            return Ok(Some(ItemState::New));
        }
        if let Some(bundle_id) = conn
            .query_row(
                "SELECT bundle_id FROM planned_item WHERE item_id = ?1",
                params![item_id],
                |row| row.get::<_, String>(0),
            )
            .optional()?
        {
            return Ok(Some(ItemState::Planned { bundle_id }));
        }
        if let Some(bundle_id) = conn
            .query_row(
                "SELECT bundle_id FROM permanent_item WHERE item_id = ?1",
                params![item_id],
                |row| row.get::<_, String>(0),
            )
            .optional()?
        {
            return Ok(Some(ItemState::Permanent { bundle_id }));
        }
        if let Some(reason) = conn
            .query_row(
                "SELECT failure_reason FROM failed_item WHERE item_id = ?1",
                params![item_id],
                |row| row.get::<_, String>(0),
            )
            .optional()?
        {
            return Ok(Some(ItemState::Failed { reason }));
        }
        Ok(None)
    }

    pub fn new_item(&self, item_id: &str) -> Result<Option<ItemRow>, UploadError> {
        let conn = self.lock()?;
        let row = conn
            .query_row(
                &format!("SELECT {ITEM_COLS} FROM new_item WHERE item_id = ?1"),
                params![item_id],
                item_from_row,
            )
            .optional()?;
        Ok(row)
    }

    /// Locate the item's metadata in whichever live table holds it.
    pub fn item_any(&self, item_id: &str) -> Result<Option<ItemRow>, UploadError> {
        let conn = self.lock()?;
        for table in ["new_item", "planned_item", "permanent_item"] {
            let row = conn
                .query_row(
                    &format!("SELECT {ITEM_COLS} FROM {table} WHERE item_id = ?1"),
                    params![item_id],
                    item_from_row,
                )
                .optional()?;
            if row.is_some() {
                return Ok(row);
            }
        }
        Ok(None)
    }

    /// Insert a freshly ingested item. The UNIQUE primary key plus the
    /// in-transaction union check make concurrent duplicate acceptance
    /// impossible.
    pub fn insert_new_item(&self, item: &ItemRow) -> Result<(), UploadError> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;

        for table in ["planned_item", "permanent_item", "failed_item"] {
            let exists = tx
                .query_row(
                    &format!("SELECT 1 FROM {table} WHERE item_id = ?1"),
                    params![item.item_id],
                    |_| Ok(()),
                )
                .optional()?;
            if exists.is_some() {
                return Err(UploadError::Core(WeftError::Duplicate(
                    item.item_id.clone(),
                )));
            }
        }

        let result = tx.execute(
            "INSERT INTO new_item
                 (item_id, owner_address, signature_kind, byte_count, uploaded_at,
                  payment_id, reservation_id, cached, is_container)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                item.item_id,
                item.owner_address,
                item.signature_kind,
                item.byte_count as i64,
                item.uploaded_at,
                item.payment_id,
                item.reservation_id,
                item.cached as i64,
                item.is_container as i64
            ],
        );
        match result {
            Ok(_) => {}
            Err(e) if is_unique_violation(&e) => {
                return Err(UploadError::Core(WeftError::Duplicate(
                    item.item_id.clone(),
                )))
            }
            Err(e) => return Err(e.into()),
        }
        tx.commit()?;
        Ok(())
    }

    /// `new → failed`. No-op if the row already moved on.
    pub fn fail_new_item(&self, item_id: &str, reason: &str) -> Result<bool, UploadError> {
        let now = now_ts();
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        let moved = tx.execute(
            "INSERT INTO failed_item
                 (item_id, owner_address, signature_kind, byte_count, uploaded_at,
                  payment_id, reservation_id, failure_reason, failed_at)
             SELECT item_id, owner_address, signature_kind, byte_count, uploaded_at,
                    payment_id, reservation_id, ?2, ?3
             FROM new_item WHERE item_id = ?1",
            params![item_id, reason, now],
        )?;
        if moved == 0 {
            return Ok(false);
        }
        tx.execute("DELETE FROM new_item WHERE item_id = ?1", params![item_id])?;
        tx.commit()?;
        Ok(true)
    }

    // --- planning ---

    /// Candidate rows for the planner, oldest first.
    pub fn new_items_for_planning(&self, limit: u64) -> Result<Vec<ItemRow>, UploadError> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {ITEM_COLS} FROM new_item ORDER BY uploaded_at ASC, item_id ASC LIMIT ?1"
        ))?;
        let rows = stmt
            .query_map(params![limit as i64], item_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Create a bundle and move its members `new → planned` in one
    /// transaction. Fails (and rolls back whole) if any member has
    /// already left `new_item`.
    pub fn assign_bundle(
        &self,
        bundle_id: &str,
        item_ids: &[String],
        byte_count: u64,
        standalone: bool,
    ) -> Result<(), UploadError> {
        let now = now_ts();
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;

        tx.execute(
            "INSERT INTO bundle (bundle_id, status, standalone, planned_at, byte_count, item_count)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                bundle_id,
                bundle_status::PLANNED,
                standalone as i64,
                now,
                byte_count as i64,
                item_ids.len() as i64
            ],
        )?;

        for (position, item_id) in item_ids.iter().enumerate() {
            let moved = tx.execute(
                "INSERT INTO planned_item
                     (item_id, owner_address, signature_kind, byte_count, uploaded_at,
                      payment_id, reservation_id, cached, is_container,
                      bundle_id, position, planned_at)
                 SELECT item_id, owner_address, signature_kind, byte_count, uploaded_at,
                        payment_id, reservation_id, cached, is_container,
                        ?2, ?3, ?4
                 FROM new_item WHERE item_id = ?1",
                params![item_id, bundle_id, position as i64, now],
            )?;
            if moved == 0 {
                return Err(UploadError::internal(format!(
                    "item {item_id} left new_item during planning"
                )));
            }
            tx.execute("DELETE FROM new_item WHERE item_id = ?1", params![item_id])?;
        }

        tx.commit()?;
        Ok(())
    }

    // --- bundles ---

    pub fn bundle(&self, bundle_id: &str) -> Result<Option<BundleRow>, UploadError> {
        let conn = self.lock()?;
        let row = conn
            .query_row(
                "SELECT bundle_id, status, standalone, planned_at, prepared_at, posted_at,
                        verified_at, byte_count, item_count, tx_id, tx_signature
                 FROM bundle WHERE bundle_id = ?1",
                params![bundle_id],
                |row| {
                    Ok(BundleRow {
                        bundle_id: row.get(0)?,
                        status: row.get(1)?,
                        standalone: row.get::<_, i64>(2)? != 0,
                        planned_at: row.get(3)?,
                        prepared_at: row.get(4)?,
                        posted_at: row.get(5)?,
                        verified_at: row.get(6)?,
                        byte_count: row.get::<_, i64>(7)? as u64,
                        item_count: row.get::<_, i64>(8)? as u64,
                        tx_id: row.get(9)?,
                        tx_signature: row.get(10)?,
                    })
                },
            )
            .optional()?;
        Ok(row)
    }

    /// Members of a planned bundle in their assigned order.
    pub fn bundle_items(&self, bundle_id: &str) -> Result<Vec<ItemRow>, UploadError> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {ITEM_COLS} FROM planned_item WHERE bundle_id = ?1 ORDER BY position ASC"
        ))?;
        let rows = stmt
            .query_map(params![bundle_id], item_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    pub fn permanent_items(&self, bundle_id: &str) -> Result<Vec<ItemRow>, UploadError> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {ITEM_COLS} FROM permanent_item WHERE bundle_id = ?1"
        ))?;
        let rows = stmt
            .query_map(params![bundle_id], item_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// `planned|prepared → prepared`, recording the signed envelope.
    /// Re-running prepare on an already prepared bundle is recovery, not
    /// an error.
    pub fn set_bundle_prepared(
        &self,
        bundle_id: &str,
        tx_id: &str,
        tx_signature: &str,
    ) -> Result<bool, UploadError> {
        let now = now_ts();
        let conn = self.lock()?;
        let changed = conn.execute(
            "UPDATE bundle SET status = ?2, prepared_at = ?3, tx_id = ?4, tx_signature = ?5
             WHERE bundle_id = ?1 AND status IN ('planned', 'prepared')",
            params![bundle_id, bundle_status::PREPARED, now, tx_id, tx_signature],
        )?;
        Ok(changed == 1)
    }

    /// `prepared|posted → posted`.
    pub fn set_bundle_posted(&self, bundle_id: &str) -> Result<bool, UploadError> {
        let now = now_ts();
        let conn = self.lock()?;
        let changed = conn.execute(
            "UPDATE bundle SET status = ?2, posted_at = ?3
             WHERE bundle_id = ?1 AND status IN ('prepared', 'posted')",
            params![bundle_id, bundle_status::POSTED, now],
        )?;
        Ok(changed == 1)
    }

    /// Confirmed on the storage network: move every member
    /// `planned → permanent` and mark the bundle verified, atomically.
    /// Returns the moved rows; empty when the bundle was already
    /// verified (idempotent re-delivery).
    pub fn move_bundle_to_permanent(
        &self,
        bundle_id: &str,
    ) -> Result<Vec<ItemRow>, UploadError> {
        let now = now_ts();
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;

        let changed = tx.execute(
            "UPDATE bundle SET status = ?2, verified_at = ?3
             WHERE bundle_id = ?1 AND status = 'posted'",
            params![bundle_id, bundle_status::VERIFIED, now],
        )?;
        if changed == 0 {
            return Ok(Vec::new());
        }

        let items = {
            let mut stmt = tx.prepare(&format!(
                "SELECT {ITEM_COLS} FROM planned_item WHERE bundle_id = ?1 ORDER BY position ASC"
            ))?;
            let rows = stmt
                .query_map(params![bundle_id], item_from_row)?
                .collect::<Result<Vec<_>, _>>()?;
            rows
        };

        tx.execute(
            "INSERT INTO permanent_item
                 (item_id, owner_address, signature_kind, byte_count, uploaded_at,
                  payment_id, reservation_id, cached, is_container, bundle_id, verified_at)
             SELECT item_id, owner_address, signature_kind, byte_count, uploaded_at,
                    payment_id, reservation_id, cached, is_container, bundle_id, ?2
             FROM planned_item WHERE bundle_id = ?1",
            params![bundle_id, now],
        )?;
        tx.execute(
            "DELETE FROM planned_item WHERE bundle_id = ?1",
            params![bundle_id],
        )?;
        tx.commit()?;
        Ok(items)
    }

    /// Terminal failure: bundle → failed, members → `failed_item`.
    /// Returns the failed rows so reservations can be refunded.
    pub fn fail_bundle(
        &self,
        bundle_id: &str,
        reason: &str,
    ) -> Result<Vec<ItemRow>, UploadError> {
        let now = now_ts();
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;

        let changed = tx.execute(
            "UPDATE bundle SET status = ?2
             WHERE bundle_id = ?1 AND status NOT IN ('verified', 'failed')",
            params![bundle_id, bundle_status::FAILED],
        )?;
        if changed == 0 {
            return Ok(Vec::new());
        }

        let items = {
            let mut stmt = tx.prepare(&format!(
                "SELECT {ITEM_COLS} FROM planned_item WHERE bundle_id = ?1"
            ))?;
            let rows = stmt
                .query_map(params![bundle_id], item_from_row)?
                .collect::<Result<Vec<_>, _>>()?;
            rows
        };

        tx.execute(
            "INSERT INTO failed_item
                 (item_id, owner_address, signature_kind, byte_count, uploaded_at,
                  payment_id, reservation_id, failure_reason, failed_at)
             SELECT item_id, owner_address, signature_kind, byte_count, uploaded_at,
                    payment_id, reservation_id, ?2, ?3
             FROM planned_item WHERE bundle_id = ?1",
            params![bundle_id, reason, now],
        )?;
        tx.execute(
            "DELETE FROM planned_item WHERE bundle_id = ?1",
            params![bundle_id],
        )?;
        tx.commit()?;
        Ok(items)
    }

    // --- offsets ---

    /// Batched UPSERT of item offsets.
    pub fn upsert_offsets(&self, offsets: &[OffsetRow]) -> Result<(), UploadError> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        {
            let mut stmt = tx.prepare(
                "INSERT INTO item_offset (bundle_id, item_id, offset, length)
                 VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT (bundle_id, item_id)
                 DO UPDATE SET offset = excluded.offset, length = excluded.length",
            )?;
            for o in offsets {
                stmt.execute(params![
                    o.bundle_id,
                    o.item_id,
                    o.offset as i64,
                    o.length as i64
                ])?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    pub fn offsets_for_bundle(&self, bundle_id: &str) -> Result<Vec<OffsetRow>, UploadError> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT bundle_id, item_id, offset, length FROM item_offset
             WHERE bundle_id = ?1 ORDER BY offset ASC",
        )?;
        let rows = stmt
            .query_map(params![bundle_id], |row| {
                Ok(OffsetRow {
                    bundle_id: row.get(0)?,
                    item_id: row.get(1)?,
                    offset: row.get::<_, i64>(2)? as u64,
                    length: row.get::<_, i64>(3)? as u64,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    pub fn delete_offset(&self, bundle_id: &str, item_id: &str) -> Result<(), UploadError> {
        let conn = self.lock()?;
        conn.execute(
            "DELETE FROM item_offset WHERE bundle_id = ?1 AND item_id = ?2",
            params![bundle_id, item_id],
        )?;
        Ok(())
    }

    // --- multipart ---

    pub fn create_multipart(&self, ttl_secs: u64) -> Result<MultipartRow, UploadError> {
        let now = now_ts();
        let upload_id = uuid::Uuid::new_v4().to_string();
        let expires_at = now + ttl_secs as i64;
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO multipart_upload (upload_id, created_at, expires_at)
             VALUES (?1, ?2, ?3)",
            params![upload_id, now, expires_at],
        )?;
        Ok(MultipartRow {
            upload_id,
            created_at: now,
            expires_at,
            finalized_at: None,
            chunk_count: 0,
            byte_count: 0,
        })
    }

    pub fn multipart(&self, upload_id: &str) -> Result<Option<MultipartRow>, UploadError> {
        let conn = self.lock()?;
        let row = conn
            .query_row(
                "SELECT upload_id, created_at, expires_at, finalized_at, chunk_count, byte_count
                 FROM multipart_upload WHERE upload_id = ?1",
                params![upload_id],
                |row| {
                    Ok(MultipartRow {
                        upload_id: row.get(0)?,
                        created_at: row.get(1)?,
                        expires_at: row.get(2)?,
                        finalized_at: row.get(3)?,
                        chunk_count: row.get::<_, i64>(4)? as u64,
                        byte_count: row.get::<_, i64>(5)? as u64,
                    })
                },
            )
            .optional()?;
        Ok(row)
    }

    pub fn record_multipart_chunk(
        &self,
        upload_id: &str,
        chunk_bytes: u64,
    ) -> Result<(), UploadError> {
        let conn = self.lock()?;
        let changed = conn.execute(
            "UPDATE multipart_upload
             SET chunk_count = chunk_count + 1, byte_count = byte_count + ?2
             WHERE upload_id = ?1 AND finalized_at IS NULL",
            params![upload_id, chunk_bytes as i64],
        )?;
        if changed == 0 {
            return Err(UploadError::bad_request(format!(
                "unknown or finalized multipart upload: {upload_id}"
            )));
        }
        Ok(())
    }

    pub fn finalize_multipart(&self, upload_id: &str) -> Result<(), UploadError> {
        let now = now_ts();
        let conn = self.lock()?;
        let changed = conn.execute(
            "UPDATE multipart_upload SET finalized_at = ?2
             WHERE upload_id = ?1 AND finalized_at IS NULL AND expires_at > ?2",
            params![upload_id, now],
        )?;
        if changed == 0 {
            return Err(UploadError::bad_request(format!(
                "multipart upload {upload_id} is unknown, expired, or already finalized"
            )));
        }
        Ok(())
    }

    /// Expired, never-finalized uploads; rows are removed and returned
    /// so their part objects can be deleted.
    pub fn sweep_expired_multiparts(&self) -> Result<Vec<String>, UploadError> {
        let now = now_ts();
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        let ids = {
            let mut stmt = tx.prepare(
                "SELECT upload_id FROM multipart_upload
                 WHERE finalized_at IS NULL AND expires_at <= ?1",
            )?;
            let rows = stmt
                .query_map(params![now], |row| row.get::<_, String>(0))?
                .collect::<Result<Vec<_>, _>>()?;
            rows
        };
        tx.execute(
            "DELETE FROM multipart_upload WHERE finalized_at IS NULL AND expires_at <= ?1",
            params![now],
        )?;
        tx.commit()?;
        Ok(ids)
    }

    // --- metrics support ---

    pub fn table_count(&self, table: &str) -> Result<u64, UploadError> {
        let conn = self.lock()?;
        let count: i64 =
            conn.query_row(&format!("SELECT COUNT(*) FROM {table}"), [], |row| {
                row.get(0)
            })?;
        Ok(count as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_db() -> UploadDb {
        UploadDb::open(":memory:").unwrap()
    }

    fn item(id: &str, bytes: u64) -> ItemRow {
        ItemRow {
            item_id: id.to_string(),
            owner_address: "owner".to_string(),
            signature_kind: "arweave".to_string(),
            byte_count: bytes,
            uploaded_at: 1_000,
            payment_id: None,
            reservation_id: Some(format!("res-{id}")),
            cached: false,
            is_container: false,
        }
    }

    #[test]
    fn duplicate_insert_is_rejected() {
        let db = test_db();
        db.insert_new_item(&item("a", 10)).unwrap();
        let err = db.insert_new_item(&item("a", 10)).unwrap_err();
        assert_eq!(err.as_wire().error, "duplicate");
    }

    #[test]
    fn duplicate_across_tables_is_rejected() {
        let db = test_db();
        db.insert_new_item(&item("a", 10)).unwrap();
        db.assign_bundle("b1", &["a".to_string()], 10, false).unwrap();

        // The id now lives in planned_item; re-ingesting it must fail.
        let err = db.insert_new_item(&item("a", 10)).unwrap_err();
        assert_eq!(err.as_wire().error, "duplicate");
    }

    #[test]
    fn item_is_in_exactly_one_table_through_lifecycle() {
        let db = test_db();
        db.insert_new_item(&item("a", 10)).unwrap();
        assert_eq!(db.item_state("a").unwrap(), Some(ItemState::New));
        assert_eq!(db.table_count("new_item").unwrap(), 1);

        db.assign_bundle("b1", &["a".to_string()], 10, false).unwrap();
        assert!(matches!(
            db.item_state("a").unwrap(),
            Some(ItemState::Planned { .. })
        ));
        assert_eq!(db.table_count("new_item").unwrap(), 0);
        assert_eq!(db.table_count("planned_item").unwrap(), 1);

        db.set_bundle_prepared("b1", "tx-1", "sig").unwrap();
        db.set_bundle_posted("b1").unwrap();
        let moved = db.move_bundle_to_permanent("b1").unwrap();
        assert_eq!(moved.len(), 1);
        assert!(matches!(
            db.item_state("a").unwrap(),
            Some(ItemState::Permanent { .. })
        ));
        assert_eq!(db.table_count("planned_item").unwrap(), 0);
        assert_eq!(db.table_count("permanent_item").unwrap(), 1);
    }

    #[test]
    fn stale_verify_is_a_noop() {
        let db = test_db();
        db.insert_new_item(&item("a", 10)).unwrap();
        db.assign_bundle("b1", &["a".to_string()], 10, false).unwrap();
        // Bundle is still 'planned': verification cannot move it.
        assert!(db.move_bundle_to_permanent("b1").unwrap().is_empty());

        db.set_bundle_prepared("b1", "tx-1", "sig").unwrap();
        db.set_bundle_posted("b1").unwrap();
        assert_eq!(db.move_bundle_to_permanent("b1").unwrap().len(), 1);
        // Second delivery after verification: no rows moved.
        assert!(db.move_bundle_to_permanent("b1").unwrap().is_empty());
    }

    #[test]
    fn bundle_members_keep_assigned_order() {
        let db = test_db();
        for id in ["c", "a", "b"] {
            db.insert_new_item(&item(id, 5)).unwrap();
        }
        db.assign_bundle(
            "b1",
            &["c".to_string(), "a".to_string(), "b".to_string()],
            15,
            false,
        )
        .unwrap();
        let members: Vec<String> = db
            .bundle_items("b1")
            .unwrap()
            .into_iter()
            .map(|i| i.item_id)
            .collect();
        assert_eq!(members, vec!["c", "a", "b"]);
    }

    #[test]
    fn fail_bundle_moves_members_and_reports_them() {
        let db = test_db();
        db.insert_new_item(&item("a", 10)).unwrap();
        db.insert_new_item(&item("b", 20)).unwrap();
        db.assign_bundle("b1", &["a".to_string(), "b".to_string()], 30, false)
            .unwrap();

        let failed = db.fail_bundle("b1", "not_confirmed").unwrap();
        assert_eq!(failed.len(), 2);
        assert!(matches!(
            db.item_state("a").unwrap(),
            Some(ItemState::Failed { .. })
        ));
        assert_eq!(db.bundle("b1").unwrap().unwrap().status, "failed");
        // Idempotent.
        assert!(db.fail_bundle("b1", "not_confirmed").unwrap().is_empty());
    }

    #[test]
    fn offsets_upsert_and_replace() {
        let db = test_db();
        db.upsert_offsets(&[OffsetRow {
            bundle_id: RAW_POINTER_BUNDLE.to_string(),
            item_id: "a".to_string(),
            offset: 0,
            length: 10,
        }])
        .unwrap();
        db.upsert_offsets(&[
            OffsetRow {
                bundle_id: "b1".to_string(),
                item_id: "a".to_string(),
                offset: 44,
                length: 10,
            },
            OffsetRow {
                bundle_id: "b1".to_string(),
                item_id: "b".to_string(),
                offset: 54,
                length: 20,
            },
        ])
        .unwrap();

        let offsets = db.offsets_for_bundle("b1").unwrap();
        assert_eq!(offsets.len(), 2);
        // Re-upsert with identical values leaves rows unchanged.
        db.upsert_offsets(&[OffsetRow {
            bundle_id: "b1".to_string(),
            item_id: "a".to_string(),
            offset: 44,
            length: 10,
        }])
        .unwrap();
        assert_eq!(db.offsets_for_bundle("b1").unwrap().len(), 2);

        // Offset ranges within the bundle are disjoint.
        let mut ranges: Vec<(u64, u64)> =
            offsets.iter().map(|o| (o.offset, o.offset + o.length)).collect();
        ranges.sort();
        for pair in ranges.windows(2) {
            assert!(pair[0].1 <= pair[1].0);
        }
    }

    #[test]
    fn multipart_lifecycle() {
        let db = test_db();
        let up = db.create_multipart(3600).unwrap();
        db.record_multipart_chunk(&up.upload_id, 100).unwrap();
        db.record_multipart_chunk(&up.upload_id, 200).unwrap();

        let row = db.multipart(&up.upload_id).unwrap().unwrap();
        assert_eq!(row.chunk_count, 2);
        assert_eq!(row.byte_count, 300);

        db.finalize_multipart(&up.upload_id).unwrap();
        assert!(db.finalize_multipart(&up.upload_id).is_err());
        assert!(db.record_multipart_chunk(&up.upload_id, 1).is_err());
    }
}

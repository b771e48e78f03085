//! SQLite storage backend

use super::traits::{OpenStore, RecordStore, StorageError, StorageResult};
use crate::model::{CanonicalEntry, TargetItem, WorkItem};
use chrono::{DateTime, Utc};
use rusqlite::{params, params_from_iter, Connection, OptionalExtension};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};

/// SQLite-backed record store
///
/// One database file with a table for canonical entries and one for target
/// items. Thread-safe via internal mutex on the connection.
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    fn init_schema(conn: &Connection) -> StorageResult<()> {
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS canonical_entries (
                id TEXT PRIMARY KEY,
                text TEXT NOT NULL,
                verified INTEGER NOT NULL DEFAULT 1,
                origin_item_id TEXT,
                origin_collection_id TEXT,
                created_at TEXT
            );

            CREATE TABLE IF NOT EXISTS target_items (
                id TEXT PRIMARY KEY,
                collection_id TEXT NOT NULL,
                text TEXT NOT NULL,
                correspondence TEXT,
                updated_at TEXT
            );

            CREATE INDEX IF NOT EXISTS idx_items_collection
                ON target_items(collection_id);
            CREATE INDEX IF NOT EXISTS idx_items_correspondence
                ON target_items(collection_id, correspondence);

            PRAGMA journal_mode = WAL;
            "#,
        )?;
        Ok(())
    }

    fn lock(&self) -> StorageResult<MutexGuard<'_, Connection>> {
        self.conn.lock().map_err(|_| StorageError::LockPoisoned)
    }

    fn row_to_item(row: &rusqlite::Row<'_>) -> rusqlite::Result<TargetItem> {
        Ok(TargetItem {
            id: row.get(0)?,
            collection_id: row.get(1)?,
            text: row.get(2)?,
            correspondence: row.get(3)?,
        })
    }

    fn insert_entry(conn: &Connection, entry: &CanonicalEntry) -> StorageResult<()> {
        conn.execute(
            r#"
            INSERT INTO canonical_entries
                (id, text, verified, origin_item_id, origin_collection_id, created_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6)
            "#,
            params![
                entry.id,
                entry.text,
                entry.verified,
                entry.origin_item_id,
                entry.origin_collection_id,
                entry.created_at.map(|t| t.to_rfc3339()),
            ],
        )?;
        Ok(())
    }

    /// Guarded single-item update; never overwrites an existing correspondence.
    fn link(
        conn: &Connection,
        item_id: &str,
        collection_id: &str,
        reference_id: &str,
    ) -> StorageResult<bool> {
        let rows = conn.execute(
            "UPDATE target_items SET correspondence = ?1, updated_at = ?2
             WHERE id = ?3 AND collection_id = ?4 AND correspondence IS NULL",
            params![reference_id, Utc::now().to_rfc3339(), item_id, collection_id],
        )?;
        Ok(rows > 0)
    }

    fn parse_timestamp(raw: Option<String>) -> StorageResult<Option<DateTime<Utc>>> {
        raw.map(|s| {
            DateTime::parse_from_rfc3339(&s)
                .map(|dt| dt.with_timezone(&Utc))
                .map_err(|e| StorageError::DateParse(format!("{}: {}", s, e)))
        })
        .transpose()
    }
}

impl RecordStore for SqliteStore {
    fn work_items(&self, filter: Option<&[String]>) -> StorageResult<Vec<WorkItem>> {
        let conn = self.lock()?;

        let mut sql = String::from(
            "SELECT collection_id, COUNT(*) AS total,
                    SUM(CASE WHEN correspondence IS NULL THEN 1 ELSE 0 END) AS pending
             FROM target_items",
        );
        let collections: Vec<&str> = filter
            .map(|f| f.iter().map(String::as_str).collect())
            .unwrap_or_default();
        if filter.is_some() {
            if collections.is_empty() {
                return Ok(Vec::new());
            }
            let placeholders = vec!["?"; collections.len()].join(", ");
            sql.push_str(&format!(" WHERE collection_id IN ({})", placeholders));
        }
        sql.push_str(" GROUP BY collection_id HAVING pending > 0 ORDER BY collection_id");

        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(params_from_iter(collections.iter()), |row| {
            let id: String = row.get(0)?;
            let total: i64 = row.get(1)?;
            let pending: i64 = row.get(2)?;
            Ok(WorkItem::new(id, total as usize, pending as usize))
        })?;

        let mut items = Vec::new();
        for row in rows {
            items.push(row?);
        }
        Ok(items)
    }

    fn pending_items(&self, collection_id: &str) -> StorageResult<Vec<TargetItem>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT id, collection_id, text, correspondence FROM target_items
             WHERE collection_id = ?1 AND correspondence IS NULL
             ORDER BY id",
        )?;
        let rows = stmt.query_map(params![collection_id], Self::row_to_item)?;

        let mut items = Vec::new();
        for row in rows {
            items.push(row?);
        }
        Ok(items)
    }

    fn canonical_entries(&self) -> StorageResult<Vec<CanonicalEntry>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT id, text, verified, origin_item_id, origin_collection_id, created_at
             FROM canonical_entries ORDER BY id",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, bool>(2)?,
                row.get::<_, Option<String>>(3)?,
                row.get::<_, Option<String>>(4)?,
                row.get::<_, Option<String>>(5)?,
            ))
        })?;

        let mut entries = Vec::new();
        for row in rows {
            let (id, text, verified, origin_item_id, origin_collection_id, created_at) = row?;
            entries.push(CanonicalEntry {
                id,
                text,
                verified,
                origin_item_id,
                origin_collection_id,
                created_at: Self::parse_timestamp(created_at)?,
            });
        }
        Ok(entries)
    }

    fn target_item(&self, item_id: &str) -> StorageResult<Option<TargetItem>> {
        let conn = self.lock()?;
        let item = conn
            .query_row(
                "SELECT id, collection_id, text, correspondence FROM target_items WHERE id = ?1",
                params![item_id],
                Self::row_to_item,
            )
            .optional()?;
        Ok(item)
    }

    fn has_canonical(&self, reference_id: &str) -> StorageResult<bool> {
        let conn = self.lock()?;
        let exists: bool = conn.query_row(
            "SELECT COUNT(*) > 0 FROM canonical_entries WHERE id = ?1",
            params![reference_id],
            |row| row.get(0),
        )?;
        Ok(exists)
    }

    fn item_for_reference(
        &self,
        collection_id: &str,
        reference_id: &str,
    ) -> StorageResult<Option<String>> {
        let conn = self.lock()?;
        let item = conn
            .query_row(
                "SELECT id FROM target_items
                 WHERE collection_id = ?1 AND correspondence = ?2
                 ORDER BY id LIMIT 1",
                params![collection_id, reference_id],
                |row| row.get(0),
            )
            .optional()?;
        Ok(item)
    }

    fn set_correspondence(
        &self,
        item_id: &str,
        collection_id: &str,
        reference_id: &str,
    ) -> StorageResult<bool> {
        let conn = self.lock()?;
        Self::link(&conn, item_id, collection_id, reference_id)
    }

    fn insert_canonical(&self, entry: &CanonicalEntry) -> StorageResult<()> {
        let conn = self.lock()?;
        Self::insert_entry(&conn, entry)
    }

    fn create_and_link(
        &self,
        entry: &CanonicalEntry,
        item_id: &str,
        collection_id: &str,
    ) -> StorageResult<bool> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        Self::insert_entry(&tx, entry)?;
        if !Self::link(&tx, item_id, collection_id, &entry.id)? {
            // dropping the transaction rolls the insert back
            return Ok(false);
        }
        tx.commit()?;
        Ok(true)
    }

    fn upsert_target_item(&self, item: &TargetItem) -> StorageResult<()> {
        let conn = self.lock()?;
        conn.execute(
            r#"
            INSERT INTO target_items (id, collection_id, text, correspondence, updated_at)
            VALUES (?1, ?2, ?3, ?4, ?5)
            ON CONFLICT(id) DO UPDATE SET
                collection_id = excluded.collection_id,
                text = excluded.text,
                correspondence = excluded.correspondence,
                updated_at = excluded.updated_at
            "#,
            params![
                item.id,
                item.collection_id,
                item.text,
                item.correspondence,
                Utc::now().to_rfc3339(),
            ],
        )?;
        Ok(())
    }
}

impl OpenStore for SqliteStore {
    fn open(path: impl AsRef<Path>) -> StorageResult<Self> {
        if let Some(parent) = path.as_ref().parent() {
            std::fs::create_dir_all(parent)?;
        }

        let conn = Connection::open(path)?;
        Self::init_schema(&conn)?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn open_in_memory() -> StorageResult<Self> {
        let conn = Connection::open_in_memory()?;
        Self::init_schema(&conn)?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }
}

//! DuckDB event table shared by the cache and the durable store.
//!
//! Each table holds one row per composite identity
//! `(partition_key, row_key, sid, event_hash)`; writing the same identity
//! again updates the stored payload instead of adding a row.
//!
//! All methods are synchronous. Callers reach the table through
//! [`SharedTable::with`], which serializes access and runs the work on the
//! blocking thread pool.

use crate::event::Event;
use crate::keys::{CacheEntry, EntryKey};
use duckdb::{params, Config, Connection};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::Mutex;
use tonic::Status;
use tracing::{debug, warn};

/// Position of a row in `(row_key, id)` order, used to resume paged reads.
pub type RowCursor = (i64, i64);

pub struct EventTable {
    conn: Connection,
    name: &'static str,
}

impl EventTable {
    /// Opens (or creates) the database at `connection` and ensures the schema.
    ///
    /// `":memory:"` opens a private in-memory database.
    pub fn open(
        connection: &str,
        name: &'static str,
        options: &HashMap<String, String>,
    ) -> Result<Self, Status> {
        let mut config = Config::default();
        if let Some(threads) = options.get("threads") {
            let threads = threads.parse::<i64>().map_err(|e| {
                Status::invalid_argument(format!("invalid threads option {threads:?}: {e}"))
            })?;
            config = config
                .threads(threads)
                .map_err(|e| Status::invalid_argument(e.to_string()))?;
        }
        let conn = Connection::open_with_flags(connection, config)
            .map_err(|e| Status::internal(format!("Failed to open {connection}: {e}")))?;
        let table = Self { conn, name };
        table.create_schema()?;
        Ok(table)
    }

    fn create_schema(&self) -> Result<(), Status> {
        let name = self.name;
        self.conn
            .execute_batch(&format!(
                r#"
                CREATE SEQUENCE IF NOT EXISTS {name}_id_seq;
                CREATE TABLE IF NOT EXISTS {name} (
                    id BIGINT PRIMARY KEY DEFAULT nextval('{name}_id_seq'),
                    partition_key BIGINT NOT NULL,
                    row_key BIGINT NOT NULL,
                    sid VARCHAR NOT NULL,
                    event_hash VARCHAR NOT NULL,
                    json VARCHAR NOT NULL,
                    UNIQUE (partition_key, row_key, sid, event_hash)
                );
                CREATE INDEX IF NOT EXISTS {name}_sid_idx ON {name}(sid);
                "#
            ))
            .map_err(|e| Status::internal(format!("Failed to create {name} schema: {e}")))
    }

    fn begin(&self) -> Result<(), Status> {
        self.conn
            .execute_batch("BEGIN TRANSACTION")
            .map_err(|e| Status::internal(format!("Failed to begin transaction: {e}")))
    }

    fn commit(&self) -> Result<(), Status> {
        self.conn
            .execute_batch("COMMIT")
            .map_err(|e| Status::internal(format!("Failed to commit transaction: {e}")))
    }

    fn rollback(&self) {
        if let Err(e) = self.conn.execute_batch("ROLLBACK") {
            warn!(table = self.name, error = %e, "rollback failed");
        }
    }

    fn upsert(&self, entry: &CacheEntry) -> Result<(), duckdb::Error> {
        let mut stmt = self.conn.prepare_cached(&format!(
            r#"
            INSERT INTO {} (partition_key, row_key, sid, event_hash, json)
            VALUES (?, ?, ?, ?, ?)
            ON CONFLICT (partition_key, row_key, sid, event_hash) DO UPDATE
            SET json = EXCLUDED.json
            "#,
            self.name
        ))?;
        stmt.execute(params![
            entry.key.partition_key,
            entry.key.row_key,
            entry.key.sid,
            entry.key.event_hash,
            entry.json,
        ])?;
        Ok(())
    }

    /// Writes `entries` in one transaction and returns how many were written.
    ///
    /// An entry the database rejects is logged and left out: the transaction
    /// is rolled back and replayed without it, so readers never observe a
    /// partially written batch. The second value is the number of entries
    /// left out.
    pub fn upsert_batch(&mut self, entries: &[CacheEntry]) -> Result<(usize, usize), Status> {
        // Repeated identities within one batch collapse onto their last occurrence.
        let mut last_of: HashMap<&EntryKey, usize> = HashMap::with_capacity(entries.len());
        for (index, entry) in entries.iter().enumerate() {
            last_of.insert(&entry.key, index);
        }
        let mut rejected: HashSet<usize> = HashSet::new();
        loop {
            self.begin()?;
            let mut failure = None;
            for (index, entry) in entries.iter().enumerate() {
                if last_of.get(&entry.key) != Some(&index) {
                    continue;
                }
                if rejected.contains(&index) {
                    continue;
                }
                if let Err(e) = self.upsert(entry) {
                    failure = Some((index, e));
                    break;
                }
            }
            match failure {
                None => {
                    self.commit()?;
                    return Ok((entries.len() - rejected.len(), rejected.len()));
                }
                Some((index, e)) => {
                    self.rollback();
                    warn!(
                        table = self.name,
                        sid = %entries[index].key.sid,
                        row_key = entries[index].key.row_key,
                        error = %e,
                        "event rejected by storage, replaying batch without it"
                    );
                    rejected.insert(index);
                }
            }
        }
    }

    /// Keeps the newest `keep` rows of every sensor and deletes the rest.
    ///
    /// Runs as one transaction and returns the number of deleted rows.
    pub fn retain_latest(&mut self, keep: usize) -> Result<usize, Status> {
        self.begin()?;
        match self.retain_latest_inner(keep) {
            Ok(deleted) => {
                self.commit()?;
                Ok(deleted)
            }
            Err(e) => {
                self.rollback();
                Err(Status::internal(format!("Cleanup of {} failed: {e}", self.name)))
            }
        }
    }

    fn retain_latest_inner(&self, keep: usize) -> Result<usize, duckdb::Error> {
        let sids = {
            let mut stmt = self
                .conn
                .prepare(&format!("SELECT DISTINCT sid FROM {}", self.name))?;
            let mut rows = stmt.query(params![])?;
            let mut sids = Vec::new();
            while let Some(row) = rows.next()? {
                sids.push(row.get::<_, String>(0)?);
            }
            sids
        };

        let mut stmt = self.conn.prepare(&format!(
            r#"
            DELETE FROM {name} WHERE sid = ? AND id NOT IN (
                SELECT id FROM {name} WHERE sid = ?
                ORDER BY row_key DESC, id DESC
                LIMIT ?
            )
            "#,
            name = self.name
        ))?;
        let mut deleted = 0;
        for sid in &sids {
            let removed = stmt.execute(params![sid, sid, keep as i64])?;
            if removed > 0 {
                debug!(table = self.name, %sid, removed, "pruned cached events");
            }
            deleted += removed;
        }
        Ok(deleted)
    }

    /// Row key of the oldest stored event of `sid`.
    pub fn oldest_row_key(&self, sid: &str) -> Result<Option<i64>, Status> {
        let mut stmt = self
            .conn
            .prepare_cached(&format!("SELECT MIN(row_key) FROM {} WHERE sid = ?", self.name))
            .map_err(|e| Status::internal(e.to_string()))?;
        stmt.query_row(params![sid], |row| row.get::<_, Option<i64>>(0))
            .map_err(|e| Status::internal(e.to_string()))
    }

    /// Newest stored event of `sid`.
    pub fn latest(&self, sid: &str) -> Result<Option<Event>, Status> {
        let sql = format!(
            "SELECT json FROM {} WHERE sid = ? ORDER BY row_key DESC, id DESC LIMIT 1",
            self.name
        );
        Ok(self.read_events(&sql, params![sid])?.into_iter().next())
    }

    /// Events of `sid` with `since <= row_key <= until`, oldest first.
    pub fn range(&self, sid: &str, since: i64, until: i64) -> Result<Vec<Event>, Status> {
        let sql = format!(
            r#"
            SELECT json FROM {} WHERE sid = ? AND row_key >= ? AND row_key <= ?
            ORDER BY row_key ASC, id ASC
            "#,
            self.name
        );
        self.read_events(&sql, params![sid, since, until])
    }

    /// One page of [`EventTable::range`] starting after `after`.
    ///
    /// Returns the events and the cursor of the last one.
    pub fn range_page(
        &self,
        sid: &str,
        since: i64,
        until: i64,
        after: Option<RowCursor>,
        limit: usize,
    ) -> Result<(Vec<Event>, Option<RowCursor>), Status> {
        let (after_row, after_id) = after.unwrap_or((i64::MIN, i64::MIN));
        let mut stmt = self
            .conn
            .prepare_cached(&format!(
                r#"
                SELECT row_key, id, json FROM {} WHERE sid = ? AND row_key >= ? AND row_key <= ?
                AND (row_key > ? OR (row_key = ? AND id > ?))
                ORDER BY row_key ASC, id ASC
                LIMIT ?
                "#,
                self.name
            ))
            .map_err(|e| Status::internal(e.to_string()))?;
        let mut rows = stmt
            .query(params![sid, since, until, after_row, after_row, after_id, limit as i64])
            .map_err(|e| Status::internal(e.to_string()))?;

        let mut events = Vec::new();
        let mut cursor = None;
        while let Some(row) = rows.next().map_err(|e| Status::internal(e.to_string()))? {
            let row_key: i64 = row.get(0).map_err(|e| Status::internal(e.to_string()))?;
            let id: i64 = row.get(1).map_err(|e| Status::internal(e.to_string()))?;
            let json: String = row.get(2).map_err(|e| Status::internal(e.to_string()))?;
            events.push(decode(&json)?);
            cursor = Some((row_key, id));
        }
        Ok((events, cursor))
    }

    pub fn count(&self, sid: &str) -> Result<usize, Status> {
        let mut stmt = self
            .conn
            .prepare_cached(&format!("SELECT COUNT(*) FROM {} WHERE sid = ?", self.name))
            .map_err(|e| Status::internal(e.to_string()))?;
        let count: i64 = stmt
            .query_row(params![sid], |row| row.get(0))
            .map_err(|e| Status::internal(e.to_string()))?;
        Ok(count as usize)
    }

    fn read_events(&self, sql: &str, params: &[&dyn duckdb::ToSql]) -> Result<Vec<Event>, Status> {
        let mut stmt = self
            .conn
            .prepare_cached(sql)
            .map_err(|e| Status::internal(e.to_string()))?;
        let mut rows = stmt
            .query(params)
            .map_err(|e| Status::internal(e.to_string()))?;
        let mut events = Vec::new();
        while let Some(row) = rows.next().map_err(|e| Status::internal(e.to_string()))? {
            let json: String = row.get(0).map_err(|e| Status::internal(e.to_string()))?;
            events.push(decode(&json)?);
        }
        Ok(events)
    }
}

fn decode(json: &str) -> Result<Event, Status> {
    Event::decode(json).map_err(|e| Status::data_loss(format!("stored event is corrupt: {e}")))
}

/// An [`EventTable`] that is opened on start and closed on stop.
///
/// Holding the lock serializes every read and write of the table; the work
/// itself runs on the blocking pool.
#[derive(Clone)]
pub struct SharedTable {
    inner: Arc<Mutex<Option<EventTable>>>,
}

impl Default for SharedTable {
    fn default() -> Self {
        Self {
            inner: Arc::new(Mutex::new(None)),
        }
    }
}

impl SharedTable {
    pub async fn open(
        &self,
        connection: String,
        name: &'static str,
        options: HashMap<String, String>,
    ) -> Result<(), Status> {
        let mut guard = self.inner.clone().lock_owned().await;
        let table = tokio::task::spawn_blocking(move || EventTable::open(&connection, name, &options))
            .await
            .map_err(|e| Status::internal(format!("storage worker failed: {e}")))??;
        *guard = Some(table);
        Ok(())
    }

    pub async fn close(&self) {
        self.inner.lock().await.take();
    }

    /// Runs `f` against the open table on the blocking pool.
    pub async fn with<F, R>(&self, f: F) -> Result<R, Status>
    where
        F: FnOnce(&mut EventTable) -> Result<R, Status> + Send + 'static,
        R: Send + 'static,
    {
        let mut guard = self.inner.clone().lock_owned().await;
        tokio::task::spawn_blocking(move || {
            let table = guard
                .as_mut()
                .ok_or_else(|| Status::failed_precondition("storage is not open"))?;
            f(table)
        })
        .await
        .map_err(|e| Status::internal(format!("storage worker failed: {e}")))?
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn entry(sid: &str, ts: &str, value: i64) -> CacheEntry {
        let event = Event::try_from(json!({"SID": sid, "timestamp": ts, "value": value})).unwrap();
        CacheEntry::from_event(&event).unwrap()
    }

    fn table() -> EventTable {
        EventTable::open(":memory:", "test_events", &HashMap::new()).unwrap()
    }

    #[test]
    fn test_upsert_is_idempotent() {
        let mut table = table();
        let e = entry("a", "2024-01-01T00:00:00Z", 1);
        assert_eq!(table.upsert_batch(&[e.clone(), e.clone()]).unwrap(), (2, 0));
        assert_eq!(table.upsert_batch(&[e]).unwrap(), (1, 0));
        assert_eq!(table.count("a").unwrap(), 1);
    }

    #[test]
    fn test_same_instant_different_content_are_distinct() {
        let mut table = table();
        table
            .upsert_batch(&[
                entry("a", "2024-01-01T00:00:00Z", 1),
                entry("a", "2024-01-01T00:00:00Z", 2),
            ])
            .unwrap();
        assert_eq!(table.count("a").unwrap(), 2);
    }

    #[test]
    fn test_retain_latest() {
        let mut table = table();
        let entries: Vec<_> = (0..10)
            .map(|i| entry("a", &format!("2024-01-01T00:00:{i:02}Z"), i))
            .chain((0..3).map(|i| entry("b", &format!("2024-01-01T00:00:{i:02}Z"), i)))
            .collect();
        table.upsert_batch(&entries).unwrap();

        assert_eq!(table.retain_latest(4).unwrap(), 6);
        assert_eq!(table.count("a").unwrap(), 4);
        assert_eq!(table.count("b").unwrap(), 3);
        let oldest = table.oldest_row_key("a").unwrap().unwrap();
        assert_eq!(oldest, entry("a", "2024-01-01T00:00:06Z", 6).key.row_key);
    }

    #[test]
    fn test_range_and_pages() {
        let mut table = table();
        let entries: Vec<_> = (0..5)
            .map(|i| entry("a", &format!("2024-01-01T00:00:0{i}Z"), i))
            .collect();
        table.upsert_batch(&entries).unwrap();

        let since = entries[1].key.row_key;
        let until = entries[3].key.row_key;
        let values: Vec<_> = table
            .range("a", since, until)
            .unwrap()
            .iter()
            .map(|e| e.fields()["value"].as_i64().unwrap())
            .collect();
        assert_eq!(values, vec![1, 2, 3]);

        let (first, cursor) = table.range_page("a", since, until, None, 2).unwrap();
        assert_eq!(first.len(), 2);
        let (second, cursor) = table.range_page("a", since, until, cursor, 2).unwrap();
        assert_eq!(second.len(), 1);
        let (third, _) = table.range_page("a", since, until, cursor, 2).unwrap();
        assert!(third.is_empty());
    }

    #[test]
    fn test_latest_and_oldest_of_unknown_sid() {
        let table = table();
        assert!(table.latest("nope").unwrap().is_none());
        assert!(table.oldest_row_key("nope").unwrap().is_none());
    }
}

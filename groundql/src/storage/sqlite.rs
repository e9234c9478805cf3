use super::{check_guards, BatchOp, Direction, KeyRange, KeyValue, StorageBackend, WriteBatch};
use crate::error::StorageError;
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};
use std::path::Path;

/// SQLite-backed store: one `kv` table ordered by its BLOB key.
///
/// Batches run in an immediate transaction, so guards are checked and the
/// batch applied under the database write lock even when several processes
/// share one file.
pub struct SqliteBackend {
    conn: Mutex<Connection>,
}

impl SqliteBackend {
    /// Open or create the index database at the given path.
    pub fn open(path: &Path) -> Result<Self, StorageError> {
        let conn = Connection::open(path)?;
        conn.busy_timeout(std::time::Duration::from_secs(5))?;
        Self::from_connection(conn)
    }

    /// Open an in-memory database (for testing).
    pub fn open_in_memory() -> Result<Self, StorageError> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> Result<Self, StorageError> {
        conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS kv (
                k BLOB PRIMARY KEY,
                v BLOB NOT NULL
            ) WITHOUT ROWID;
            ",
        )?;
        Ok(SqliteBackend {
            conn: Mutex::new(conn),
        })
    }
}

impl StorageBackend for SqliteBackend {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, StorageError> {
        let conn = self.conn.lock();
        let value = conn
            .query_row("SELECT v FROM kv WHERE k = ?1", params![key], |row| row.get(0))
            .optional()?;
        Ok(value)
    }

    fn scan(
        &self,
        range: &KeyRange,
        direction: Direction,
        limit: usize,
    ) -> Result<Vec<KeyValue>, StorageError> {
        if range.is_empty() || limit == 0 {
            return Ok(Vec::new());
        }
        let order = match direction {
            Direction::Forward => "ASC",
            Direction::Reverse => "DESC",
        };
        let conn = self.conn.lock();
        let map_row = |row: &rusqlite::Row<'_>| -> rusqlite::Result<KeyValue> {
            Ok((row.get(0)?, row.get(1)?))
        };
        let rows = match &range.end {
            Some(end) => {
                let sql = format!(
                    "SELECT k, v FROM kv WHERE k >= ?1 AND k < ?2 ORDER BY k {order} LIMIT {limit}"
                );
                let mut stmt = conn.prepare_cached(&sql)?;
                let rows = stmt.query_map(params![range.start, end], map_row)?;
                rows.collect::<Result<Vec<KeyValue>, _>>()?
            }
            None => {
                let sql = format!("SELECT k, v FROM kv WHERE k >= ?1 ORDER BY k {order} LIMIT {limit}");
                let mut stmt = conn.prepare_cached(&sql)?;
                let rows = stmt.query_map(params![range.start], map_row)?;
                rows.collect::<Result<Vec<KeyValue>, _>>()?
            }
        };
        Ok(rows)
    }

    fn write(&self, batch: WriteBatch) -> Result<(), StorageError> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        check_guards(&batch, |key| {
            tx.query_row("SELECT v FROM kv WHERE k = ?1", params![key], |row| row.get(0))
                .optional()
                .map_err(StorageError::from)
        })?;
        for op in &batch.ops {
            match op {
                BatchOp::Put { key, value } => {
                    tx.execute(
                        "INSERT OR REPLACE INTO kv (k, v) VALUES (?1, ?2)",
                        params![key, value],
                    )?;
                }
                BatchOp::Delete { key } => {
                    tx.execute("DELETE FROM kv WHERE k = ?1", params![key])?;
                }
            }
        }
        tx.commit()?;
        Ok(())
    }
}

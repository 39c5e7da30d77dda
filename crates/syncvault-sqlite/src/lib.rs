//! SQLite binding for syncvault
//!
//! Implements the database operation contract over `rusqlite`. This
//! is the reference vendor adapter: the core crate only ever sees
//! [`syncvault_core::DatabaseConnection`], so swapping in another
//! embedded database means writing another crate like this one.
//!
//! Transactions are issued as plain `BEGIN IMMEDIATE` / `COMMIT` /
//! `ROLLBACK` statements so the contract stays object-safe; `BEGIN
//! IMMEDIATE` takes the write lock up front, matching the
//! one-writer-at-a-time model of a pooled SQLite file.

use std::path::{Path, PathBuf};
use std::time::Duration;

use rusqlite::types::ValueRef;
use rusqlite::Connection;
use serde_json::{Map, Number, Value};
use tracing::debug;

use syncvault_core::{
    ConnectionFactory, DatabaseConnection, ExecuteResult, Row, StorageError, StoreResult,
};

/// Default busy timeout for a pooled file database
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// A rusqlite-backed database operation contract instance
pub struct SqliteConnection {
    conn: Connection,
}

impl SqliteConnection {
    /// Open (or create) a database file
    pub fn open(path: &Path) -> StoreResult<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| StorageError::io(format!("create directory {:?}: {}", parent, e)))?;
        }
        let conn = Connection::open(path)
            .map_err(|e| StorageError::io(format!("open database {:?}: {}", path, e)))?;
        conn.busy_timeout(BUSY_TIMEOUT)
            .map_err(|e| StorageError::io(e.to_string()))?;
        // WAL lets pooled readers proceed while one writer holds the lock.
        conn.pragma_update(None, "journal_mode", "WAL")
            .map_err(|e| StorageError::io(e.to_string()))?;
        debug!(?path, "opened sqlite database");
        Ok(Self { conn })
    }

    /// Open an in-memory database.
    ///
    /// Each call creates an independent database, so this suits a
    /// single-connection store, not a pool.
    pub fn open_in_memory() -> StoreResult<Self> {
        let conn = Connection::open_in_memory()
            .map_err(|e| StorageError::io(format!("open in-memory database: {}", e)))?;
        Ok(Self { conn })
    }

    fn bind_params(params: &[Value]) -> Vec<rusqlite::types::Value> {
        params.iter().map(json_to_sql).collect()
    }
}

impl DatabaseConnection for SqliteConnection {
    fn execute(&self, sql: &str, params: &[Value]) -> StoreResult<ExecuteResult> {
        let changes = self
            .conn
            .execute(sql, rusqlite::params_from_iter(Self::bind_params(params)))
            .map_err(|e| StorageError::io(format!("execute failed: {}", e)))?;
        Ok(ExecuteResult {
            changes: changes as u64,
            last_insert_id: self.conn.last_insert_rowid(),
        })
    }

    fn query_one(&self, sql: &str, params: &[Value]) -> StoreResult<Option<Row>> {
        let mut rows = self.query_all(sql, params)?;
        if rows.is_empty() {
            Ok(None)
        } else {
            Ok(Some(rows.remove(0)))
        }
    }

    fn query_all(&self, sql: &str, params: &[Value]) -> StoreResult<Vec<Row>> {
        let mut stmt = self
            .conn
            .prepare(sql)
            .map_err(|e| StorageError::io(format!("prepare failed: {}", e)))?;
        let columns: Vec<String> = stmt.column_names().iter().map(|c| c.to_string()).collect();

        let mut rows = stmt
            .query(rusqlite::params_from_iter(Self::bind_params(params)))
            .map_err(|e| StorageError::io(format!("query failed: {}", e)))?;

        let mut out = Vec::new();
        while let Some(row) = rows
            .next()
            .map_err(|e| StorageError::io(format!("row fetch failed: {}", e)))?
        {
            let mut object = Map::with_capacity(columns.len());
            for (index, column) in columns.iter().enumerate() {
                let value = row
                    .get_ref(index)
                    .map_err(|e| StorageError::io(format!("column '{}': {}", column, e)))?;
                object.insert(column.clone(), sql_to_json(value));
            }
            out.push(object);
        }
        Ok(out)
    }

    fn begin_transaction(&self) -> StoreResult<()> {
        self.conn
            .execute_batch("BEGIN IMMEDIATE")
            .map_err(|e| StorageError::io(format!("begin transaction: {}", e)))
    }

    fn commit(&self) -> StoreResult<()> {
        self.conn
            .execute_batch("COMMIT")
            .map_err(|e| StorageError::io(format!("commit: {}", e)))
    }

    fn rollback(&self) -> StoreResult<()> {
        self.conn
            .execute_batch("ROLLBACK")
            .map_err(|e| StorageError::io(format!("rollback: {}", e)))
    }
}

/// Pool factory producing connections to one database file
pub fn sqlite_factory(path: impl Into<PathBuf>) -> ConnectionFactory {
    let path = path.into();
    Box::new(move || {
        Ok(Box::new(SqliteConnection::open(&path)?) as Box<dyn DatabaseConnection>)
    })
}

fn json_to_sql(value: &Value) -> rusqlite::types::Value {
    use rusqlite::types::Value as Sql;
    match value {
        Value::Null => Sql::Null,
        Value::Bool(b) => Sql::Integer(i64::from(*b)),
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                Sql::Integer(i)
            } else {
                Sql::Real(n.as_f64().unwrap_or(0.0))
            }
        }
        Value::String(s) => Sql::Text(s.clone()),
        // Structured params are stored as their JSON text.
        other => Sql::Text(other.to_string()),
    }
}

fn sql_to_json(value: ValueRef<'_>) -> Value {
    match value {
        ValueRef::Null => Value::Null,
        ValueRef::Integer(i) => Value::Number(Number::from(i)),
        ValueRef::Real(f) => Number::from_f64(f).map(Value::Number).unwrap_or(Value::Null),
        ValueRef::Text(t) => Value::String(String::from_utf8_lossy(t).into_owned()),
        ValueRef::Blob(b) => Value::String(String::from_utf8_lossy(b).into_owned()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use syncvault_core::with_transaction;

    fn conn() -> SqliteConnection {
        let conn = SqliteConnection::open_in_memory().unwrap();
        conn.execute(
            "CREATE TABLE t (id TEXT PRIMARY KEY, n INTEGER, x REAL, s TEXT)",
            &[],
        )
        .unwrap();
        conn
    }

    #[test]
    fn test_execute_reports_changes_and_rowid() {
        let conn = conn();
        let result = conn
            .execute(
                "INSERT INTO t (id, n, x, s) VALUES (?, ?, ?, ?)",
                &[json!("a"), json!(7), json!(1.5), json!("hi")],
            )
            .unwrap();
        assert_eq!(result.changes, 1);
        assert!(result.last_insert_id > 0);
    }

    #[test]
    fn test_query_round_trips_values() {
        let conn = conn();
        conn.execute(
            "INSERT INTO t (id, n, x, s) VALUES (?, ?, ?, ?)",
            &[json!("a"), json!(7), json!(1.5), Value::Null],
        )
        .unwrap();

        let row = conn
            .query_one("SELECT * FROM t WHERE id = ?", &[json!("a")])
            .unwrap()
            .unwrap();
        assert_eq!(row["id"], json!("a"));
        assert_eq!(row["n"], json!(7));
        assert_eq!(row["x"], json!(1.5));
        assert_eq!(row["s"], Value::Null);
    }

    #[test]
    fn test_query_one_absent_is_none() {
        let conn = conn();
        assert!(conn
            .query_one("SELECT * FROM t WHERE id = ?", &[json!("ghost")])
            .unwrap()
            .is_none());
    }

    #[test]
    fn test_query_all_returns_every_row() {
        let conn = conn();
        for id in ["a", "b", "c"] {
            conn.execute("INSERT INTO t (id) VALUES (?)", &[json!(id)])
                .unwrap();
        }
        let rows = conn.query_all("SELECT id FROM t ORDER BY id", &[]).unwrap();
        assert_eq!(rows.len(), 3);
        assert_eq!(rows[1]["id"], json!("b"));
    }

    #[test]
    fn test_transaction_rollback_discards_writes() {
        let conn = conn();
        let result: StoreResult<()> = with_transaction(&conn, |tx| {
            tx.execute("INSERT INTO t (id) VALUES (?)", &[json!("doomed")])?;
            Err(StorageError::malformed("abort"))
        });
        assert!(result.is_err());

        assert!(conn
            .query_one("SELECT id FROM t WHERE id = ?", &[json!("doomed")])
            .unwrap()
            .is_none());
    }

    #[test]
    fn test_transaction_commit_persists_writes() {
        let conn = conn();
        with_transaction(&conn, |tx| {
            tx.execute("INSERT INTO t (id) VALUES (?)", &[json!("kept")])?;
            Ok(())
        })
        .unwrap();

        assert!(conn
            .query_one("SELECT id FROM t WHERE id = ?", &[json!("kept")])
            .unwrap()
            .is_some());
    }

    #[test]
    fn test_structured_params_stored_as_json_text() {
        let conn = conn();
        conn.execute(
            "INSERT INTO t (id, s) VALUES (?, ?)",
            &[json!("a"), json!({"k": [1, 2]})],
        )
        .unwrap();
        let row = conn
            .query_one("SELECT s FROM t WHERE id = ?", &[json!("a")])
            .unwrap()
            .unwrap();
        assert_eq!(row["s"], json!(r#"{"k":[1,2]}"#));
    }
}

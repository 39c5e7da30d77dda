//! Database operation contract
//!
//! The single seam between the storage coordination layer and any
//! vendor embedded-database binding. A binding implements
//! [`DatabaseConnection`]; the core never sees anything else of the
//! vendor API. All statements are parameterized strings with
//! positional arguments.

use serde_json::{Map, Value};
use tracing::warn;

use crate::error::StoreResult;

/// One result row, keyed by column name
pub type Row = Map<String, Value>;

/// Outcome of a mutating statement
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExecuteResult {
    /// Rows changed by the statement
    pub changes: u64,
    /// Rowid of the last inserted row, if the vendor exposes one
    pub last_insert_id: i64,
}

/// A live connection to the embedded database.
///
/// At most one statement is active per connection; true parallelism
/// only exists across distinct connections. Transactions are plain
/// begin/commit/rollback statements so the trait stays object-safe;
/// use [`with_transaction`] rather than pairing them by hand.
pub trait DatabaseConnection: Send {
    /// Run a mutating statement
    fn execute(&self, sql: &str, params: &[Value]) -> StoreResult<ExecuteResult>;

    /// Run a query expected to return at most one row
    fn query_one(&self, sql: &str, params: &[Value]) -> StoreResult<Option<Row>>;

    /// Run a query returning all matching rows
    fn query_all(&self, sql: &str, params: &[Value]) -> StoreResult<Vec<Row>>;

    /// Open a transaction on this connection
    fn begin_transaction(&self) -> StoreResult<()>;

    /// Commit the open transaction
    fn commit(&self) -> StoreResult<()>;

    /// Roll back the open transaction
    fn rollback(&self) -> StoreResult<()>;
}

/// Run `body` inside a transaction on `conn`.
///
/// Commits on success, rolls back on failure. A rollback failure is
/// logged and swallowed; the body's error is always the one the
/// caller sees.
pub fn with_transaction<T>(
    conn: &dyn DatabaseConnection,
    body: impl FnOnce(&dyn DatabaseConnection) -> StoreResult<T>,
) -> StoreResult<T> {
    conn.begin_transaction()?;
    match body(conn) {
        Ok(value) => {
            conn.commit()?;
            Ok(value)
        }
        Err(err) => {
            if let Err(rollback_err) = conn.rollback() {
                warn!(error = %rollback_err, "rollback failed after transaction error");
            }
            Err(err)
        }
    }
}

#[cfg(test)]
pub(crate) mod testing {
    //! A scripted in-memory fake of the contract, for unit tests that
    //! must not touch a real database.

    use std::sync::Mutex;

    use super::*;
    use crate::error::StorageError;

    /// Call record kept by [`FakeConnection`]
    #[derive(Debug, Clone, PartialEq)]
    pub enum Call {
        Execute(String),
        QueryOne(String),
        QueryAll(String),
        Begin,
        Commit,
        Rollback,
    }

    /// Fake connection that records calls and optionally fails
    #[derive(Default)]
    pub struct FakeConnection {
        pub calls: Mutex<Vec<Call>>,
        /// When set, every statement fails with this message
        pub fail_with: Option<String>,
        /// Scripted responses for query_one, popped front-first
        pub one_responses: Mutex<Vec<Option<Row>>>,
        /// Scripted responses for query_all, popped front-first
        pub all_responses: Mutex<Vec<Vec<Row>>>,
    }

    impl FakeConnection {
        pub fn failing(msg: &str) -> Self {
            Self {
                fail_with: Some(msg.to_string()),
                ..Self::default()
            }
        }

        pub fn call_count(&self) -> usize {
            self.calls.lock().unwrap().len()
        }

        fn check_failure(&self) -> StoreResult<()> {
            match &self.fail_with {
                Some(msg) => Err(StorageError::io(msg.clone())),
                None => Ok(()),
            }
        }
    }

    impl DatabaseConnection for FakeConnection {
        fn execute(&self, sql: &str, _params: &[Value]) -> StoreResult<ExecuteResult> {
            self.calls.lock().unwrap().push(Call::Execute(sql.to_string()));
            self.check_failure()?;
            Ok(ExecuteResult::default())
        }

        fn query_one(&self, sql: &str, _params: &[Value]) -> StoreResult<Option<Row>> {
            self.calls.lock().unwrap().push(Call::QueryOne(sql.to_string()));
            self.check_failure()?;
            let mut scripted = self.one_responses.lock().unwrap();
            if scripted.is_empty() {
                Ok(None)
            } else {
                Ok(scripted.remove(0))
            }
        }

        fn query_all(&self, sql: &str, _params: &[Value]) -> StoreResult<Vec<Row>> {
            self.calls.lock().unwrap().push(Call::QueryAll(sql.to_string()));
            self.check_failure()?;
            let mut scripted = self.all_responses.lock().unwrap();
            if scripted.is_empty() {
                Ok(Vec::new())
            } else {
                Ok(scripted.remove(0))
            }
        }

        fn begin_transaction(&self) -> StoreResult<()> {
            self.calls.lock().unwrap().push(Call::Begin);
            self.check_failure()
        }

        fn commit(&self) -> StoreResult<()> {
            self.calls.lock().unwrap().push(Call::Commit);
            self.check_failure()
        }

        fn rollback(&self) -> StoreResult<()> {
            self.calls.lock().unwrap().push(Call::Rollback);
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testing::{Call, FakeConnection};
    use super::*;
    use crate::error::StorageError;

    #[test]
    fn test_with_transaction_commits_on_success() {
        let conn = FakeConnection::default();
        let result = with_transaction(&conn, |c| {
            c.execute("INSERT INTO t VALUES (?)", &[])?;
            Ok(42)
        })
        .unwrap();
        assert_eq!(result, 42);

        let calls = conn.calls.lock().unwrap();
        assert_eq!(calls.first(), Some(&Call::Begin));
        assert_eq!(calls.last(), Some(&Call::Commit));
    }

    #[test]
    fn test_with_transaction_rolls_back_on_error() {
        let conn = FakeConnection::default();
        let result: StoreResult<()> = with_transaction(&conn, |_| {
            Err(StorageError::malformed("bad record"))
        });
        assert!(matches!(result, Err(StorageError::MalformedInput(_))));

        let calls = conn.calls.lock().unwrap();
        assert_eq!(calls.last(), Some(&Call::Rollback));
        assert!(!calls.contains(&Call::Commit));
    }
}

//! Unified storage interface
//!
//! The [`Store`] is the facade the sync engine talks to. It owns a
//! connection pool (or a single connection) and a layout strategy,
//! resolves logical store names, and enforces the lifecycle: nothing
//! works before `initialize()`, nothing works after `close()`.
//!
//! ## Store names
//!
//! Callers address records by a logical store name. `"meta"` is the
//! metadata store; `"docs"` is the generic document store (collection
//! discovered through the inventory); any other name is a document
//! store scoped to that collection. This resolution is the only place
//! that knows the convention.
//!
//! ## Usage
//!
//! ```ignore
//! let mut store = Store::pooled(pool, Box::new(SharedTableLayout::default()));
//! store.initialize()?;
//!
//! store.write_records(&WriteBatch::docs(records))?;
//! let record = store.read_record("users", "u1")?;
//! let inventory = store.read_inventory()?;
//! store.close();
//! ```

use std::sync::{Arc, Mutex};

use tracing::{debug, info};

use crate::contract::DatabaseConnection;
use crate::error::{StorageError, StoreResult};
use crate::layout::LayoutStrategy;
use crate::models::{Inventory, InventoryOp, Record, RecordKind, WriteBatch, WriteOptions};
use crate::pool::ConnectionPool;

/// Logical store name of the metadata store
pub const META_STORE: &str = "meta";

/// Logical store name of the generic document store
pub const DOCS_STORE: &str = "docs";

/// Where the store gets its connections from
enum ConnectionSource {
    /// Bounded pool; each logical operation borrows one connection
    Pooled(Arc<ConnectionPool>),
    /// One caller-supplied connection, serialized by a mutex
    Single(Mutex<Box<dyn DatabaseConnection>>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Lifecycle {
    /// Constructed but initialize() has not completed
    New,
    /// Schema and inventory are in place
    Ready,
    /// close() was called; the store cannot be reused
    Closed,
}

/// Storage coordinator: the stable CRUD + inventory API
pub struct Store {
    strategy: Box<dyn LayoutStrategy>,
    source: Option<ConnectionSource>,
    lifecycle: Lifecycle,
}

impl Store {
    /// Build a store over a connection pool
    pub fn pooled(pool: Arc<ConnectionPool>, strategy: Box<dyn LayoutStrategy>) -> Self {
        Self {
            strategy,
            source: Some(ConnectionSource::Pooled(pool)),
            lifecycle: Lifecycle::New,
        }
    }

    /// Build a store over a single connection
    pub fn single(conn: Box<dyn DatabaseConnection>, strategy: Box<dyn LayoutStrategy>) -> Self {
        Self {
            strategy,
            source: Some(ConnectionSource::Single(Mutex::new(conn))),
            lifecycle: Lifecycle::New,
        }
    }

    /// Create schema objects and the inventory, then mark the store
    /// usable. All mutating operations fail fast before this runs.
    pub fn initialize(&mut self) -> StoreResult<()> {
        if self.lifecycle == Lifecycle::Closed {
            return Err(StorageError::NotReady("store was closed"));
        }
        self.with_conn(|conn| {
            self.strategy.initialize_schema(conn)?;
            self.strategy.initialize_inventory(conn)?;
            Ok(())
        })?;
        self.lifecycle = Lifecycle::Ready;
        info!("store initialized");
        Ok(())
    }

    /// Mark the store not-ready and release its connection source.
    /// A closed store rejects every operation without attempting I/O.
    pub fn close(&mut self) {
        if let Some(ConnectionSource::Pooled(pool)) = &self.source {
            pool.close();
        }
        self.source = None;
        self.lifecycle = Lifecycle::Closed;
        debug!("store closed");
    }

    /// Write a batch atomically; document writes upsert the inventory
    pub fn write_records(&self, batch: &WriteBatch) -> StoreResult<()> {
        self.write_records_with(batch, WriteOptions::default())
    }

    /// Write a batch with explicit options (the no-transaction escape
    /// hatch exists for tests only)
    pub fn write_records_with(&self, batch: &WriteBatch, options: WriteOptions) -> StoreResult<()> {
        self.ensure_ready()?;
        self.with_conn(|conn| self.strategy.write_records(conn, batch, options))
    }

    /// Read one record by store name and id; `Ok(None)` when absent
    pub fn read_record(&self, store: &str, id: &str) -> StoreResult<Option<Record>> {
        self.ensure_ready()?;
        let (kind, collection) = Self::resolve(store);
        self.with_conn(|conn| self.strategy.read_record(conn, kind, collection, id))
    }

    /// Read every record in a store
    pub fn read_all_records(&self, store: &str) -> StoreResult<Vec<Record>> {
        self.ensure_ready()?;
        let (kind, collection) = Self::resolve(store);
        self.with_conn(|conn| self.strategy.read_all_records(conn, kind, collection))
    }

    /// Read all matching records for a list of ids.
    ///
    /// Uses the strategy's native bulk path when it has one,
    /// otherwise falls back to per-id reads on the same connection,
    /// short-circuiting on the first error. Either way the result is
    /// the same record set a sequence of [`Store::read_record`] calls
    /// would produce (order not guaranteed).
    pub fn read_records_bulk(&self, store: &str, ids: &[String]) -> StoreResult<Vec<Record>> {
        self.ensure_ready()?;
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let (kind, collection) = Self::resolve(store);
        self.with_conn(|conn| {
            if let Some(records) = self.strategy.read_records_bulk(conn, kind, collection, ids)? {
                return Ok(records);
            }
            let mut records = Vec::with_capacity(ids.len());
            for id in ids {
                if let Some(record) = self.strategy.read_record(conn, kind, collection, id)? {
                    records.push(record);
                }
            }
            Ok(records)
        })
    }

    /// Delete one record; missing rows and tables are a no-op
    pub fn delete_record(&self, store: &str, id: &str) -> StoreResult<()> {
        self.ensure_ready()?;
        let (kind, collection) = Self::resolve(store);
        self.with_conn(|conn| self.strategy.delete_record(conn, kind, collection, id))
    }

    /// Apply one mutation to the inventory
    pub fn update_inventory(
        &self,
        collection: &str,
        doc_id: &str,
        version: i64,
        op: InventoryOp,
    ) -> StoreResult<()> {
        self.ensure_ready()?;
        self.with_conn(|conn| {
            self.strategy
                .update_inventory_item(conn, collection, doc_id, version, op)
        })
    }

    /// Full inventory snapshot
    pub fn read_inventory(&self) -> StoreResult<Inventory> {
        self.ensure_ready()?;
        self.with_conn(|conn| self.strategy.read_inventory(conn))
    }

    /// Drop every table the strategy created. The store needs
    /// another `initialize()` before further use.
    pub fn delete_database(&mut self) -> StoreResult<()> {
        self.ensure_ready()?;
        self.with_conn(|conn| self.strategy.delete_all_tables(conn))?;
        self.lifecycle = Lifecycle::New;
        info!("database deleted");
        Ok(())
    }

    /// The active layout strategy (for tests and diagnostics)
    pub fn strategy(&self) -> &dyn LayoutStrategy {
        self.strategy.as_ref()
    }

    /// Resolve a logical store name into a kind and collection.
    fn resolve(store: &str) -> (RecordKind, Option<&str>) {
        match store {
            META_STORE => (RecordKind::Meta, None),
            DOCS_STORE => (RecordKind::Doc, None),
            collection => (RecordKind::Doc, Some(collection)),
        }
    }

    /// Fail fast, before any I/O, when the lifecycle forbids work.
    fn ensure_ready(&self) -> StoreResult<()> {
        match self.lifecycle {
            Lifecycle::Ready => Ok(()),
            Lifecycle::New => Err(StorageError::NotReady("initialize() has not been called")),
            Lifecycle::Closed => Err(StorageError::NotReady("store was closed")),
        }
    }

    /// Run an operation on exactly one connection.
    fn with_conn<T>(
        &self,
        operation: impl FnOnce(&dyn DatabaseConnection) -> StoreResult<T>,
    ) -> StoreResult<T> {
        match &self.source {
            Some(ConnectionSource::Pooled(pool)) => pool.with_connection(operation),
            Some(ConnectionSource::Single(conn)) => {
                let guard = conn.lock().expect("connection mutex poisoned");
                operation(&**guard)
            }
            None => Err(StorageError::NotReady("store was closed")),
        }
    }
}

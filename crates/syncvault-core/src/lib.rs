//! syncvault core library
//!
//! Storage coordination layer for an offline-capable
//! document-synchronization client. Durably stores versioned
//! documents in a single embedded database file and keeps the
//! inventory (collection -> document -> version) the sync engine
//! uses to decide what must be re-synced after a reconnect.
//!
//! # Architecture
//!
//! - **Database operation contract**: the one seam to a vendor
//!   binding (execute / query-one / query-all / transaction control)
//! - **Connection pool**: bounded set of contract instances, one
//!   lent per logical operation
//! - **Layout strategies**: pluggable mapping from collections to
//!   tables; shared-table and table-per-collection ship built in
//! - **Store**: the facade the sync engine calls
//!
//! The reference SQLite binding lives in the `syncvault-sqlite`
//! crate; this crate never depends on a vendor API.
//!
//! # Quick Start
//!
//! ```text
//! let pool = ConnectionPool::new(factory, PoolConfig::default());
//! let mut store = Store::pooled(pool, Box::new(SharedTableLayout::default()));
//! store.initialize()?;
//!
//! store.write_records(&WriteBatch::docs(records))?;
//! let record = store.read_record("users", "u1")?;
//! ```
//!
//! # Modules
//!
//! - `store`: storage coordinator facade (main entry point)
//! - `layout`: layout strategy trait and the two reference strategies
//! - `pool`: connection pool
//! - `contract`: database operation contract
//! - `crypto`: optional record encryption
//! - `models`: records, collections, inventory types
//! - `config`: store configuration
//! - `error`: typed storage errors

pub mod config;
pub mod contract;
pub mod crypto;
pub mod error;
pub mod layout;
pub mod models;
pub mod pool;
pub mod store;

pub use config::{LayoutKind, PoolSettings, StoreConfig};
pub use contract::{with_transaction, DatabaseConnection, ExecuteResult, Row};
pub use crypto::{Base64Cipher, Cipher, CipherHandle};
pub use error::{StorageError, StoreResult};
pub use layout::{LayoutStrategy, SharedTableLayout, TablePerCollectionLayout};
pub use models::{
    CollectionConfig, Inventory, InventoryOp, Payload, Record, RecordKind, WriteBatch,
    WriteOptions,
};
pub use pool::{ConnectionFactory, ConnectionPool, PoolConfig, PoolHealth, PoolStats, PooledConnection};
pub use store::{Store, DOCS_STORE, META_STORE};

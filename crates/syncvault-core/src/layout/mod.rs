//! Layout strategies
//!
//! A [`LayoutStrategy`] decides how logical collections map to
//! physical tables and issues every statement the store runs: schema
//! creation, record writes and reads, deletes, and inventory
//! bookkeeping. Strategies operate on a borrowed
//! [`DatabaseConnection`] and know nothing about pooling.
//!
//! Two reference strategies ship with the crate:
//!
//! - [`SharedTableLayout`]: all documents in one `docs` table, one
//!   JSON blob per row; inventory is a JSON document in `meta`.
//! - [`TablePerCollectionLayout`]: one table per collection with
//!   optional per-field index columns; inventory is a relational
//!   table.

pub mod per_collection;
pub mod shared;

pub use per_collection::TablePerCollectionLayout;
pub use shared::SharedTableLayout;

use serde_json::Value;

use crate::contract::{DatabaseConnection, Row};
use crate::crypto::{decrypt_payload, CipherHandle};
use crate::error::{StorageError, StoreResult};
use crate::models::{
    Inventory, InventoryOp, Payload, Record, RecordKind, WriteBatch, WriteOptions,
};

/// Reserved collection name resolving to the metadata table
pub const METADATA_COLLECTION: &str = "_meta";

/// Reserved collection name resolving to the inventory's physical home
pub const INVENTORY_COLLECTION: &str = "_inventory";

/// Pluggable mapping from logical collections to physical tables.
///
/// All operations take a live connection as first argument and report
/// failure through [`StoreResult`]. Reads return `Ok(None)` for
/// not-found, never an error.
pub trait LayoutStrategy: Send + Sync {
    /// Create every table and index the strategy needs, idempotently
    fn initialize_schema(&self, conn: &dyn DatabaseConnection) -> StoreResult<()>;

    /// Whether the minimum required tables exist; mutates nothing
    fn validate_schema(&self, conn: &dyn DatabaseConnection) -> StoreResult<bool>;

    /// Pure mapping from a collection name (including the reserved
    /// [`METADATA_COLLECTION`] and [`INVENTORY_COLLECTION`]) to a
    /// sanitized physical table identifier
    fn table_name_for(&self, collection: &str) -> String;

    /// Write a batch grouped by kind, wrapped in a single transaction
    /// unless `options.no_transaction`. Writing a document upserts
    /// its inventory entry as a side effect; any failure rolls back
    /// the whole batch including inventory changes.
    fn write_records(
        &self,
        conn: &dyn DatabaseConnection,
        batch: &WriteBatch,
        options: WriteOptions,
    ) -> StoreResult<()>;

    /// Read one record. For documents with an unknown collection the
    /// strategy may consult the inventory to locate it; with no
    /// inventory entry the result is `None` without a table scan.
    fn read_record(
        &self,
        conn: &dyn DatabaseConnection,
        kind: RecordKind,
        collection: Option<&str>,
        id: &str,
    ) -> StoreResult<Option<Record>>;

    /// Read every record of a kind, optionally limited to one collection
    fn read_all_records(
        &self,
        conn: &dyn DatabaseConnection,
        kind: RecordKind,
        collection: Option<&str>,
    ) -> StoreResult<Vec<Record>>;

    /// Fetch all matching rows for a list of ids in one round trip.
    ///
    /// Returns `Ok(None)` when the strategy has no native bulk path;
    /// the coordinator then falls back to per-id reads. No ordering
    /// guarantee. An empty id list yields an empty result with zero
    /// database calls.
    fn read_records_bulk(
        &self,
        _conn: &dyn DatabaseConnection,
        _kind: RecordKind,
        _collection: Option<&str>,
        _ids: &[String],
    ) -> StoreResult<Option<Vec<Record>>> {
        Ok(None)
    }

    /// Delete a record. Deleting a missing row, or from a table that
    /// does not exist, is a no-op. Deleting a document also removes
    /// its inventory entry.
    fn delete_record(
        &self,
        conn: &dyn DatabaseConnection,
        kind: RecordKind,
        collection: Option<&str>,
        id: &str,
    ) -> StoreResult<()>;

    /// Apply one mutation to the inventory
    fn update_inventory_item(
        &self,
        conn: &dyn DatabaseConnection,
        collection: &str,
        doc_id: &str,
        version: i64,
        op: InventoryOp,
    ) -> StoreResult<()>;

    /// Full inventory snapshot; empty if never initialized
    fn read_inventory(&self, conn: &dyn DatabaseConnection) -> StoreResult<Inventory>;

    /// Create an empty inventory if absent, otherwise return the
    /// existing one unchanged. Never overwrites existing data.
    fn initialize_inventory(&self, conn: &dyn DatabaseConnection) -> StoreResult<Inventory>;

    /// Drop every table this strategy created, and nothing else
    fn delete_all_tables(&self, conn: &dyn DatabaseConnection) -> StoreResult<()>;
}

/// Sanitize a collection name into a legal table identifier.
///
/// Lowercases, keeps `[a-z0-9_]`, substitutes `_` for everything
/// else, and prefixes names starting with a digit. Deterministic.
/// Two distinct collection names can sanitize to the same identifier
/// (for example `"a.b"` and `"a_b"`); that collision is a known
/// ambiguity of the design and is not detected at runtime.
pub fn sanitize_identifier(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    for ch in name.chars() {
        let ch = ch.to_ascii_lowercase();
        if ch.is_ascii_alphanumeric() || ch == '_' {
            out.push(ch);
        } else {
            out.push('_');
        }
    }
    if out.is_empty() {
        out.push('t');
    }
    if out.chars().next().is_some_and(|c| c.is_ascii_digit()) {
        out.insert_str(0, "t_");
    }
    out
}

/// Whether a table exists, checked against the catalog
pub(crate) fn table_exists(conn: &dyn DatabaseConnection, table: &str) -> StoreResult<bool> {
    let row = conn.query_one(
        "SELECT name FROM sqlite_master WHERE type = 'table' AND name = ?",
        &[Value::String(table.to_string())],
    )?;
    Ok(row.is_some())
}

/// Comma-separated positional placeholders for an IN clause
pub(crate) fn placeholders(count: usize) -> String {
    let mut out = String::with_capacity(count * 3);
    for i in 0..count {
        if i > 0 {
            out.push_str(", ");
        }
        out.push('?');
    }
    out
}

/// Parse a stored `data` column back into a decrypted record
pub(crate) fn row_to_record(
    cipher: &CipherHandle,
    row: &Row,
    encrypted: bool,
) -> StoreResult<Record> {
    let id = row
        .get("id")
        .and_then(Value::as_str)
        .ok_or_else(|| StorageError::io("row is missing its id column"))?
        .to_string();
    let data = row
        .get("data")
        .and_then(Value::as_str)
        .ok_or_else(|| StorageError::io(format!("row '{}' is missing its data column", id)))?;
    let stored: Payload = serde_json::from_str(data)
        .map_err(|e| StorageError::io(format!("row '{}' holds invalid JSON: {}", id, e)))?;
    let payload = if encrypted {
        decrypt_payload(cipher, &stored)?
    } else {
        stored
    };
    Ok(Record { id, payload })
}

/// Look up a (possibly nested) payload field by dotted path
pub(crate) fn extract_path<'a>(payload: &'a Payload, path: &str) -> Option<&'a Value> {
    let mut parts = path.split('.');
    let mut current = payload.get(parts.next()?)?;
    for part in parts {
        current = current.as_object()?.get(part)?;
    }
    Some(current)
}

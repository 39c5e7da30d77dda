//! Table-per-collection layout
//!
//! Each collection gets its own table, created eagerly for
//! collections named in the static configuration and lazily on first
//! write for everything else. Indexed payload fields are extracted
//! into dedicated columns with secondary indexes. The inventory is a
//! relational table keyed on `(collection, doc_id)`.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Mutex;

use chrono::Utc;
use serde_json::Value;
use tracing::debug;

use crate::contract::{with_transaction, DatabaseConnection};
use crate::crypto::{encrypt_payload, CipherHandle};
use crate::error::{StorageError, StoreResult};
use crate::models::{
    CollectionConfig, Inventory, InventoryOp, Record, RecordKind, WriteBatch, WriteOptions,
};

use super::{
    extract_path, placeholders, row_to_record, sanitize_identifier, table_exists, LayoutStrategy,
    INVENTORY_COLLECTION, METADATA_COLLECTION,
};

/// Reserved metadata table
const META_TABLE: &str = "meta";

/// Reserved inventory table
const INVENTORY_TABLE: &str = "inventory";

/// Prefix for dynamically created per-collection tables
const COLLECTION_TABLE_PREFIX: &str = "docs_";

/// Prefix for extracted index columns, so a field named `id` or
/// `data` cannot shadow the fixed columns
const INDEX_COLUMN_PREFIX: &str = "f_";

/// One table per collection with optional per-field indexes
pub struct TablePerCollectionLayout {
    collections: HashMap<String, CollectionConfig>,
    cipher: CipherHandle,
    /// Collections whose backing table is known to exist. A cache to
    /// skip redundant DDL round trips, never the source of truth;
    /// the DDL itself stays idempotent.
    created_tables: Mutex<HashSet<String>>,
}

impl TablePerCollectionLayout {
    pub fn new(collections: HashMap<String, CollectionConfig>, cipher: CipherHandle) -> Self {
        Self {
            collections,
            cipher,
            created_tables: Mutex::new(HashSet::new()),
        }
    }

    fn config_for(&self, collection: &str) -> CollectionConfig {
        self.collections.get(collection).cloned().unwrap_or_default()
    }

    fn index_column(field: &str) -> String {
        format!("{}{}", INDEX_COLUMN_PREFIX, sanitize_identifier(field))
    }

    /// Lazily create a collection's table and indexes, memoized in
    /// the created-table registry. Safe under concurrent callers:
    /// both may issue the DDL, which is idempotent.
    pub fn ensure_table(&self, conn: &dyn DatabaseConnection, collection: &str) -> StoreResult<()> {
        {
            let created = self.created_tables.lock().expect("registry mutex poisoned");
            if created.contains(collection) {
                return Ok(());
            }
        }

        let table = self.table_name_for(collection);
        let config = self.config_for(collection);

        let mut columns = vec![
            "id TEXT PRIMARY KEY".to_string(),
            "collection TEXT NOT NULL".to_string(),
            "data TEXT NOT NULL".to_string(),
        ];
        for field in &config.indexes {
            columns.push(format!("{} TEXT", Self::index_column(field)));
        }
        conn.execute(
            &format!(
                "CREATE TABLE IF NOT EXISTS {} ({})",
                table,
                columns.join(", ")
            ),
            &[],
        )
        .map_err(|e| StorageError::schema(&table, e.to_string()))?;

        for field in &config.indexes {
            let column = Self::index_column(field);
            conn.execute(
                &format!(
                    "CREATE INDEX IF NOT EXISTS idx_{}_{} ON {} ({})",
                    table, column, table, column
                ),
                &[],
            )
            .map_err(|e| StorageError::schema(&table, e.to_string()))?;
        }

        self.created_tables
            .lock()
            .expect("registry mutex poisoned")
            .insert(collection.to_string());
        debug!(collection, table, "collection table ready");
        Ok(())
    }

    fn upsert_inventory_row(
        conn: &dyn DatabaseConnection,
        collection: &str,
        doc_id: &str,
        version: i64,
    ) -> StoreResult<()> {
        conn.execute(
            &format!(
                "INSERT OR REPLACE INTO {} (collection, doc_id, version, updated_at) \
                 VALUES (?, ?, ?, ?)",
                INVENTORY_TABLE
            ),
            &[
                Value::String(collection.to_string()),
                Value::String(doc_id.to_string()),
                Value::from(version),
                Value::from(Utc::now().timestamp_millis()),
            ],
        )?;
        Ok(())
    }

    fn delete_inventory_row(
        conn: &dyn DatabaseConnection,
        collection: &str,
        doc_id: &str,
    ) -> StoreResult<()> {
        conn.execute(
            &format!(
                "DELETE FROM {} WHERE collection = ? AND doc_id = ?",
                INVENTORY_TABLE
            ),
            &[
                Value::String(collection.to_string()),
                Value::String(doc_id.to_string()),
            ],
        )?;
        Ok(())
    }

    /// The collection holding a document, resolved through the
    /// inventory. `None` means the document is not durably stored.
    fn collection_of(
        &self,
        conn: &dyn DatabaseConnection,
        doc_id: &str,
    ) -> StoreResult<Option<String>> {
        let row = conn.query_one(
            &format!(
                "SELECT collection FROM {} WHERE doc_id = ?",
                INVENTORY_TABLE
            ),
            &[Value::String(doc_id.to_string())],
        )?;
        Ok(row
            .and_then(|r| r.get("collection").and_then(Value::as_str).map(String::from)))
    }

    fn write_doc(&self, conn: &dyn DatabaseConnection, record: &Record) -> StoreResult<()> {
        let collection = record.collection()?.to_string();
        self.ensure_table(conn, &collection)?;

        let config = self.config_for(&collection);
        let table = self.table_name_for(&collection);

        // Index values come from the plaintext payload, before any
        // encryption removes the fields.
        let mut column_names = vec!["id", "collection", "data"]
            .into_iter()
            .map(String::from)
            .collect::<Vec<_>>();
        let stored = encrypt_payload(&self.cipher, &record.payload, &config.encrypted_fields)?;
        let data = serde_json::to_string(&stored)
            .map_err(|e| StorageError::io(format!("serialize doc '{}': {}", record.id, e)))?;
        let mut params = vec![
            Value::String(record.id.clone()),
            Value::String(collection.clone()),
            Value::String(data),
        ];
        for field in &config.indexes {
            column_names.push(Self::index_column(field));
            params.push(match extract_path(&record.payload, field) {
                Some(Value::String(s)) => Value::String(s.clone()),
                Some(other) => Value::String(other.to_string()),
                None => Value::Null,
            });
        }

        conn.execute(
            &format!(
                "INSERT OR REPLACE INTO {} ({}) VALUES ({})",
                table,
                column_names.join(", "),
                placeholders(params.len())
            ),
            &params,
        )?;

        Self::upsert_inventory_row(conn, &collection, &record.id, record.version())
    }

    fn apply_batch(&self, conn: &dyn DatabaseConnection, batch: &WriteBatch) -> StoreResult<()> {
        for record in &batch.meta {
            let data = serde_json::to_string(&record.payload)
                .map_err(|e| StorageError::io(format!("serialize meta '{}': {}", record.id, e)))?;
            conn.execute(
                &format!(
                    "INSERT OR REPLACE INTO {} (id, data) VALUES (?, ?)",
                    META_TABLE
                ),
                &[Value::String(record.id.clone()), Value::String(data)],
            )?;
        }

        // Validate every collection tag before touching any table so
        // a malformed record cannot leave a partial batch behind even
        // with the transaction escape hatch in play.
        for record in &batch.docs {
            record.collection()?;
        }
        for record in &batch.docs {
            self.write_doc(conn, record)?;
        }
        Ok(())
    }

    /// Every collection known to hold documents, per the inventory
    fn known_collections(&self, conn: &dyn DatabaseConnection) -> StoreResult<BTreeSet<String>> {
        let rows = conn.query_all(
            &format!("SELECT DISTINCT collection FROM {}", INVENTORY_TABLE),
            &[],
        )?;
        Ok(rows
            .iter()
            .filter_map(|r| r.get("collection").and_then(Value::as_str).map(String::from))
            .collect())
    }
}

impl LayoutStrategy for TablePerCollectionLayout {
    fn initialize_schema(&self, conn: &dyn DatabaseConnection) -> StoreResult<()> {
        conn.execute(
            &format!(
                "CREATE TABLE IF NOT EXISTS {} (id TEXT PRIMARY KEY, data TEXT NOT NULL)",
                META_TABLE
            ),
            &[],
        )
        .map_err(|e| StorageError::schema(META_TABLE, e.to_string()))?;

        conn.execute(
            &format!(
                "CREATE TABLE IF NOT EXISTS {} (\
                 collection TEXT NOT NULL, \
                 doc_id TEXT NOT NULL, \
                 version INTEGER NOT NULL, \
                 updated_at INTEGER NOT NULL, \
                 PRIMARY KEY (collection, doc_id))",
                INVENTORY_TABLE
            ),
            &[],
        )
        .map_err(|e| StorageError::schema(INVENTORY_TABLE, e.to_string()))?;

        for (index, column) in [
            ("idx_inventory_collection", "collection"),
            ("idx_inventory_updated_at", "updated_at"),
        ] {
            conn.execute(
                &format!(
                    "CREATE INDEX IF NOT EXISTS {} ON {} ({})",
                    index, INVENTORY_TABLE, column
                ),
                &[],
            )
            .map_err(|e| StorageError::schema(INVENTORY_TABLE, e.to_string()))?;
        }

        // Eagerly create tables for statically configured collections.
        for collection in self.collections.keys() {
            self.ensure_table(conn, collection)?;
        }
        debug!("table-per-collection schema ready");
        Ok(())
    }

    fn validate_schema(&self, conn: &dyn DatabaseConnection) -> StoreResult<bool> {
        Ok(table_exists(conn, META_TABLE)? && table_exists(conn, INVENTORY_TABLE)?)
    }

    fn table_name_for(&self, collection: &str) -> String {
        match collection {
            METADATA_COLLECTION => META_TABLE.to_string(),
            INVENTORY_COLLECTION => INVENTORY_TABLE.to_string(),
            _ => format!(
                "{}{}",
                COLLECTION_TABLE_PREFIX,
                sanitize_identifier(collection)
            ),
        }
    }

    fn write_records(
        &self,
        conn: &dyn DatabaseConnection,
        batch: &WriteBatch,
        options: WriteOptions,
    ) -> StoreResult<()> {
        if batch.is_empty() {
            return Ok(());
        }
        if options.no_transaction {
            self.apply_batch(conn, batch)
        } else {
            let result = with_transaction(conn, |tx| self.apply_batch(tx, batch));
            if result.is_err() {
                // A rollback also undoes any lazy DDL issued inside
                // the transaction; forget those tables so the next
                // write re-issues it.
                let mut created = self.created_tables.lock().expect("registry mutex poisoned");
                for record in &batch.docs {
                    if let Ok(collection) = record.collection() {
                        created.remove(collection);
                    }
                }
            }
            result
        }
    }

    fn read_record(
        &self,
        conn: &dyn DatabaseConnection,
        kind: RecordKind,
        collection: Option<&str>,
        id: &str,
    ) -> StoreResult<Option<Record>> {
        let (table, encrypted) = match kind {
            RecordKind::Meta => (META_TABLE.to_string(), false),
            RecordKind::Doc => {
                let collection = match collection {
                    Some(c) => c.to_string(),
                    // Only the id in hand: the inventory tells us
                    // which table holds it. No entry means no scan.
                    None => match self.collection_of(conn, id)? {
                        Some(c) => c,
                        None => return Ok(None),
                    },
                };
                (self.table_name_for(&collection), true)
            }
        };

        if !table_exists(conn, &table)? {
            return Ok(None);
        }
        let row = conn.query_one(
            &format!("SELECT id, data FROM {} WHERE id = ?", table),
            &[Value::String(id.to_string())],
        )?;
        match row {
            None => Ok(None),
            Some(row) => Ok(Some(row_to_record(&self.cipher, &row, encrypted)?)),
        }
    }

    fn read_all_records(
        &self,
        conn: &dyn DatabaseConnection,
        kind: RecordKind,
        collection: Option<&str>,
    ) -> StoreResult<Vec<Record>> {
        match kind {
            RecordKind::Meta => {
                let rows =
                    conn.query_all(&format!("SELECT id, data FROM {}", META_TABLE), &[])?;
                rows.iter()
                    .map(|row| row_to_record(&self.cipher, row, false))
                    .collect()
            }
            RecordKind::Doc => {
                let collections: BTreeSet<String> = match collection {
                    Some(c) => BTreeSet::from([c.to_string()]),
                    None => self.known_collections(conn)?,
                };
                let mut records = Vec::new();
                for collection in collections {
                    let table = self.table_name_for(&collection);
                    if !table_exists(conn, &table)? {
                        continue;
                    }
                    let rows =
                        conn.query_all(&format!("SELECT id, data FROM {}", table), &[])?;
                    for row in &rows {
                        records.push(row_to_record(&self.cipher, row, true)?);
                    }
                }
                Ok(records)
            }
        }
    }

    fn read_records_bulk(
        &self,
        conn: &dyn DatabaseConnection,
        kind: RecordKind,
        collection: Option<&str>,
        ids: &[String],
    ) -> StoreResult<Option<Vec<Record>>> {
        if ids.is_empty() {
            return Ok(Some(Vec::new()));
        }
        let (table, encrypted) = match kind {
            RecordKind::Meta => (META_TABLE.to_string(), false),
            RecordKind::Doc => match collection {
                Some(c) => (self.table_name_for(c), true),
                // Ids may be scattered across tables; let the
                // coordinator fall back to per-id reads.
                None => return Ok(None),
            },
        };

        if !table_exists(conn, &table)? {
            return Ok(Some(Vec::new()));
        }
        let params: Vec<Value> = ids.iter().cloned().map(Value::String).collect();
        let rows = conn.query_all(
            &format!(
                "SELECT id, data FROM {} WHERE id IN ({})",
                table,
                placeholders(ids.len())
            ),
            &params,
        )?;
        let mut records = Vec::with_capacity(rows.len());
        for row in &rows {
            records.push(row_to_record(&self.cipher, row, encrypted)?);
        }
        Ok(Some(records))
    }

    fn delete_record(
        &self,
        conn: &dyn DatabaseConnection,
        kind: RecordKind,
        collection: Option<&str>,
        id: &str,
    ) -> StoreResult<()> {
        if kind == RecordKind::Meta {
            if table_exists(conn, META_TABLE)? {
                conn.execute(
                    &format!("DELETE FROM {} WHERE id = ?", META_TABLE),
                    &[Value::String(id.to_string())],
                )?;
            }
            return Ok(());
        }

        let collection = match collection {
            Some(c) => Some(c.to_string()),
            None => self.collection_of(conn, id)?,
        };
        // No collection and no inventory entry: nothing to delete.
        let Some(collection) = collection else {
            return Ok(());
        };

        let table = self.table_name_for(&collection);
        with_transaction(conn, |tx| {
            if table_exists(tx, &table)? {
                tx.execute(
                    &format!("DELETE FROM {} WHERE id = ?", table),
                    &[Value::String(id.to_string())],
                )?;
            }
            Self::delete_inventory_row(tx, &collection, id)
        })
    }

    fn update_inventory_item(
        &self,
        conn: &dyn DatabaseConnection,
        collection: &str,
        doc_id: &str,
        version: i64,
        op: InventoryOp,
    ) -> StoreResult<()> {
        match op {
            InventoryOp::Add | InventoryOp::Update => {
                Self::upsert_inventory_row(conn, collection, doc_id, version)
            }
            InventoryOp::Remove => Self::delete_inventory_row(conn, collection, doc_id),
        }
    }

    fn read_inventory(&self, conn: &dyn DatabaseConnection) -> StoreResult<Inventory> {
        let rows = conn.query_all(
            &format!(
                "SELECT collection, doc_id, version FROM {}",
                INVENTORY_TABLE
            ),
            &[],
        )?;
        let mut inventory = Inventory::new();
        for row in &rows {
            let collection = row
                .get("collection")
                .and_then(Value::as_str)
                .ok_or_else(|| StorageError::io("inventory row is missing its collection"))?;
            let doc_id = row
                .get("doc_id")
                .and_then(Value::as_str)
                .ok_or_else(|| StorageError::io("inventory row is missing its doc_id"))?;
            let version = row.get("version").and_then(Value::as_i64).unwrap_or(1);
            inventory
                .entry(collection.to_string())
                .or_default()
                .insert(doc_id.to_string(), version);
        }
        Ok(inventory)
    }

    fn initialize_inventory(&self, conn: &dyn DatabaseConnection) -> StoreResult<Inventory> {
        // Creating the (empty) table if missing is the whole job;
        // existing rows are returned untouched.
        conn.execute(
            &format!(
                "CREATE TABLE IF NOT EXISTS {} (\
                 collection TEXT NOT NULL, \
                 doc_id TEXT NOT NULL, \
                 version INTEGER NOT NULL, \
                 updated_at INTEGER NOT NULL, \
                 PRIMARY KEY (collection, doc_id))",
                INVENTORY_TABLE
            ),
            &[],
        )
        .map_err(|e| StorageError::schema(INVENTORY_TABLE, e.to_string()))?;
        self.read_inventory(conn)
    }

    fn delete_all_tables(&self, conn: &dyn DatabaseConnection) -> StoreResult<()> {
        // Only tables this strategy created: the reserved pair plus
        // per-collection tables known from the registry, the static
        // config, and the inventory.
        let mut collections: BTreeSet<String> = self.collections.keys().cloned().collect();
        collections.extend(
            self.created_tables
                .lock()
                .expect("registry mutex poisoned")
                .iter()
                .cloned(),
        );
        if table_exists(conn, INVENTORY_TABLE)? {
            collections.extend(self.known_collections(conn)?);
        }

        for collection in collections {
            let table = self.table_name_for(&collection);
            conn.execute(&format!("DROP TABLE IF EXISTS {}", table), &[])?;
        }
        for table in [INVENTORY_TABLE, META_TABLE] {
            conn.execute(&format!("DROP TABLE IF EXISTS {}", table), &[])?;
        }
        self.created_tables
            .lock()
            .expect("registry mutex poisoned")
            .clear();
        debug!("table-per-collection schema dropped");
        Ok(())
    }
}

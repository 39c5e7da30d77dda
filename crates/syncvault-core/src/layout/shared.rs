//! Shared-table layout
//!
//! The simplest mapping: every document lives as one JSON blob in a
//! single `docs` table, metadata in a single `meta` table, and the
//! inventory as one JSON document under a reserved id inside `meta`.
//! Inventory mutations are read-modify-write, so every multi-step
//! operation here runs inside one transaction.

use std::collections::HashMap;

use serde_json::Value;
use tracing::debug;

use crate::contract::{with_transaction, DatabaseConnection};
use crate::crypto::{encrypt_payload, CipherHandle};
use crate::error::{StorageError, StoreResult};
use crate::models::{
    CollectionConfig, Inventory, InventoryOp, Record, RecordKind, WriteBatch, WriteOptions,
};

use super::{
    placeholders, row_to_record, table_exists, LayoutStrategy, INVENTORY_COLLECTION,
    METADATA_COLLECTION,
};

/// Table holding all document records
const DOCS_TABLE: &str = "docs";

/// Table holding metadata records and the inventory document
const META_TABLE: &str = "meta";

/// Reserved meta id under which the JSON inventory lives
pub const INVENTORY_ID: &str = "_inventory";

/// All documents in one table, one JSON blob per row
pub struct SharedTableLayout {
    collections: HashMap<String, CollectionConfig>,
    cipher: CipherHandle,
}

impl Default for SharedTableLayout {
    fn default() -> Self {
        Self::new(HashMap::new(), None)
    }
}

impl SharedTableLayout {
    pub fn new(collections: HashMap<String, CollectionConfig>, cipher: CipherHandle) -> Self {
        Self {
            collections,
            cipher,
        }
    }

    fn encrypted_fields(&self, collection: &str) -> &[String] {
        self.collections
            .get(collection)
            .map(|c| c.encrypted_fields.as_slice())
            .unwrap_or(&[])
    }

    fn table_for_kind(kind: RecordKind) -> &'static str {
        match kind {
            RecordKind::Doc => DOCS_TABLE,
            RecordKind::Meta => META_TABLE,
        }
    }

    fn upsert_row(
        conn: &dyn DatabaseConnection,
        table: &str,
        id: &str,
        data: String,
    ) -> StoreResult<()> {
        conn.execute(
            &format!("INSERT OR REPLACE INTO {} (id, data) VALUES (?, ?)", table),
            &[Value::String(id.to_string()), Value::String(data)],
        )?;
        Ok(())
    }

    /// Write the whole batch plus its inventory side effects on an
    /// already-open transaction (or bare connection when the caller
    /// opted out of one).
    fn apply_batch(&self, conn: &dyn DatabaseConnection, batch: &WriteBatch) -> StoreResult<()> {
        for record in &batch.meta {
            let data = serde_json::to_string(&record.payload)
                .map_err(|e| StorageError::io(format!("serialize meta '{}': {}", record.id, e)))?;
            Self::upsert_row(conn, META_TABLE, &record.id, data)?;
        }

        if batch.docs.is_empty() {
            return Ok(());
        }

        // Resolve every collection tag up front: a missing tag fails
        // the batch before any document row is written.
        let mut tagged = Vec::with_capacity(batch.docs.len());
        for record in &batch.docs {
            tagged.push((record, record.collection()?.to_string()));
        }

        for (record, collection) in &tagged {
            let stored = encrypt_payload(
                &self.cipher,
                &record.payload,
                self.encrypted_fields(collection),
            )?;
            let data = serde_json::to_string(&stored)
                .map_err(|e| StorageError::io(format!("serialize doc '{}': {}", record.id, e)))?;
            Self::upsert_row(conn, DOCS_TABLE, &record.id, data)?;
        }

        // One read-modify-write for the whole batch.
        let mut inventory = self.load_inventory(conn)?;
        for (record, collection) in &tagged {
            inventory
                .entry(collection.clone())
                .or_default()
                .insert(record.id.clone(), record.version());
        }
        self.store_inventory(conn, &inventory)
    }

    fn load_inventory(&self, conn: &dyn DatabaseConnection) -> StoreResult<Inventory> {
        let row = conn.query_one(
            &format!("SELECT id, data FROM {} WHERE id = ?", META_TABLE),
            &[Value::String(INVENTORY_ID.to_string())],
        )?;
        match row {
            None => Ok(Inventory::new()),
            Some(row) => {
                let data = row.get("data").and_then(Value::as_str).ok_or_else(|| {
                    StorageError::io("inventory row is missing its data column")
                })?;
                serde_json::from_str(data)
                    .map_err(|e| StorageError::io(format!("inventory holds invalid JSON: {}", e)))
            }
        }
    }

    fn store_inventory(
        &self,
        conn: &dyn DatabaseConnection,
        inventory: &Inventory,
    ) -> StoreResult<()> {
        let data = serde_json::to_string(inventory)
            .map_err(|e| StorageError::io(format!("serialize inventory: {}", e)))?;
        Self::upsert_row(conn, META_TABLE, INVENTORY_ID, data)
    }

    fn apply_inventory_mutation(
        inventory: &mut Inventory,
        collection: &str,
        doc_id: &str,
        version: i64,
        op: InventoryOp,
    ) {
        match op {
            InventoryOp::Add | InventoryOp::Update => {
                inventory
                    .entry(collection.to_string())
                    .or_default()
                    .insert(doc_id.to_string(), version);
            }
            InventoryOp::Remove => {
                if let Some(docs) = inventory.get_mut(collection) {
                    docs.remove(doc_id);
                    // The JSON representation prunes an emptied
                    // collection key.
                    if docs.is_empty() {
                        inventory.remove(collection);
                    }
                }
            }
        }
    }
}

impl LayoutStrategy for SharedTableLayout {
    fn initialize_schema(&self, conn: &dyn DatabaseConnection) -> StoreResult<()> {
        for table in [DOCS_TABLE, META_TABLE] {
            conn.execute(
                &format!(
                    "CREATE TABLE IF NOT EXISTS {} (id TEXT PRIMARY KEY, data TEXT NOT NULL)",
                    table
                ),
                &[],
            )
            .map_err(|e| StorageError::schema(table, e.to_string()))?;
        }
        debug!("shared-table schema ready");
        Ok(())
    }

    fn validate_schema(&self, conn: &dyn DatabaseConnection) -> StoreResult<bool> {
        Ok(table_exists(conn, DOCS_TABLE)? && table_exists(conn, META_TABLE)?)
    }

    fn table_name_for(&self, collection: &str) -> String {
        match collection {
            METADATA_COLLECTION | INVENTORY_COLLECTION => META_TABLE.to_string(),
            _ => DOCS_TABLE.to_string(),
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
            with_transaction(conn, |tx| self.apply_batch(tx, batch))
        }
    }

    fn read_record(
        &self,
        conn: &dyn DatabaseConnection,
        kind: RecordKind,
        collection: Option<&str>,
        id: &str,
    ) -> StoreResult<Option<Record>> {
        let table = Self::table_for_kind(kind);
        let row = conn.query_one(
            &format!("SELECT id, data FROM {} WHERE id = ?", table),
            &[Value::String(id.to_string())],
        )?;
        let Some(row) = row else {
            return Ok(None);
        };
        let record = row_to_record(&self.cipher, &row, kind == RecordKind::Doc)?;
        // A collection-scoped read must not surface another
        // collection's document just because ids are globally unique.
        if kind == RecordKind::Doc {
            if let Some(wanted) = collection {
                if record.collection().ok() != Some(wanted) {
                    return Ok(None);
                }
            }
        }
        Ok(Some(record))
    }

    fn read_all_records(
        &self,
        conn: &dyn DatabaseConnection,
        kind: RecordKind,
        collection: Option<&str>,
    ) -> StoreResult<Vec<Record>> {
        let table = Self::table_for_kind(kind);
        let rows = match kind {
            RecordKind::Doc => conn.query_all(&format!("SELECT id, data FROM {}", table), &[])?,
            // The inventory document is bookkeeping, not a record.
            RecordKind::Meta => conn.query_all(
                &format!("SELECT id, data FROM {} WHERE id != ?", table),
                &[Value::String(INVENTORY_ID.to_string())],
            )?,
        };

        let mut records = Vec::with_capacity(rows.len());
        for row in &rows {
            let record = row_to_record(&self.cipher, row, kind == RecordKind::Doc)?;
            if kind == RecordKind::Doc {
                if let Some(wanted) = collection {
                    if record.collection().ok() != Some(wanted) {
                        continue;
                    }
                }
            }
            records.push(record);
        }
        Ok(records)
    }

    fn read_records_bulk(
        &self,
        conn: &dyn DatabaseConnection,
        kind: RecordKind,
        _collection: Option<&str>,
        ids: &[String],
    ) -> StoreResult<Option<Vec<Record>>> {
        if ids.is_empty() {
            return Ok(Some(Vec::new()));
        }
        let table = Self::table_for_kind(kind);
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
            records.push(row_to_record(&self.cipher, row, kind == RecordKind::Doc)?);
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
        let table = Self::table_for_kind(kind);
        if !table_exists(conn, table)? {
            return Ok(());
        }

        if kind == RecordKind::Meta {
            conn.execute(
                &format!("DELETE FROM {} WHERE id = ?", table),
                &[Value::String(id.to_string())],
            )?;
            return Ok(());
        }

        // Document delete and its inventory prune are one unit.
        with_transaction(conn, |tx| {
            tx.execute(
                &format!("DELETE FROM {} WHERE id = ?", DOCS_TABLE),
                &[Value::String(id.to_string())],
            )?;
            let mut inventory = self.load_inventory(tx)?;
            let owner = collection.map(str::to_string).or_else(|| {
                inventory
                    .iter()
                    .find(|(_, docs)| docs.contains_key(id))
                    .map(|(c, _)| c.clone())
            });
            if let Some(owner) = owner {
                Self::apply_inventory_mutation(&mut inventory, &owner, id, 0, InventoryOp::Remove);
                self.store_inventory(tx, &inventory)?;
            }
            Ok(())
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
        with_transaction(conn, |tx| {
            let mut inventory = self.load_inventory(tx)?;
            Self::apply_inventory_mutation(&mut inventory, collection, doc_id, version, op);
            self.store_inventory(tx, &inventory)
        })
    }

    fn read_inventory(&self, conn: &dyn DatabaseConnection) -> StoreResult<Inventory> {
        self.load_inventory(conn)
    }

    fn initialize_inventory(&self, conn: &dyn DatabaseConnection) -> StoreResult<Inventory> {
        // INSERT OR IGNORE never clobbers an existing inventory.
        conn.execute(
            &format!(
                "INSERT OR IGNORE INTO {} (id, data) VALUES (?, ?)",
                META_TABLE
            ),
            &[
                Value::String(INVENTORY_ID.to_string()),
                Value::String("{}".to_string()),
            ],
        )?;
        self.load_inventory(conn)
    }

    fn delete_all_tables(&self, conn: &dyn DatabaseConnection) -> StoreResult<()> {
        for table in [DOCS_TABLE, META_TABLE] {
            conn.execute(&format!("DROP TABLE IF EXISTS {}", table), &[])?;
        }
        debug!("shared-table schema dropped");
        Ok(())
    }
}

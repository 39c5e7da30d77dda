//! Data structures for records, collections, and the inventory
//!
//! A [`Record`] is the atomic persisted unit: an id plus a
//! strategy-opaque JSON payload. Documents carry their collection
//! name and version inside the payload; the storage layer never
//! interprets anything else in it.

use std::collections::BTreeMap;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{StorageError, StoreResult};

/// Payload field naming the collection a document belongs to
pub const COLLECTION_FIELD: &str = "collection";

/// Payload fields checked (in order) for the document version
pub const VERSION_FIELDS: [&str; 2] = ["version", "v"];

/// JSON object type used for payloads and rows
pub type Payload = Map<String, Value>;

/// The atomic persisted unit: a document or a metadata entry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    /// Globally unique id within its store (conventionally
    /// `"<collection>/<docId>"` for documents)
    pub id: String,
    /// Strategy-opaque structured data
    pub payload: Payload,
}

impl Record {
    pub fn new(id: impl Into<String>, payload: Payload) -> Self {
        Self {
            id: id.into(),
            payload,
        }
    }

    /// The collection tag declared inside the payload.
    ///
    /// A document record without one is a fatal input error, never a
    /// partial success.
    pub fn collection(&self) -> StoreResult<&str> {
        self.payload
            .get(COLLECTION_FIELD)
            .and_then(Value::as_str)
            .ok_or_else(|| {
                StorageError::malformed(format!(
                    "record '{}' is missing its '{}' field",
                    self.id, COLLECTION_FIELD
                ))
            })
    }

    /// The version declared inside the payload, defaulting to 1
    pub fn version(&self) -> i64 {
        VERSION_FIELDS
            .iter()
            .find_map(|f| self.payload.get(*f).and_then(Value::as_i64))
            .unwrap_or(1)
    }
}

/// Kind of a persisted record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RecordKind {
    /// Synchronized document, sharded by collection, may be encrypted
    Doc,
    /// Metadata/control record: never encrypted, never sharded
    Meta,
}

/// A batch of records to write, grouped by kind
#[derive(Debug, Clone, Default)]
pub struct WriteBatch {
    pub docs: Vec<Record>,
    pub meta: Vec<Record>,
}

impl WriteBatch {
    pub fn docs(records: Vec<Record>) -> Self {
        Self {
            docs: records,
            meta: Vec::new(),
        }
    }

    pub fn meta(records: Vec<Record>) -> Self {
        Self {
            docs: Vec::new(),
            meta: records,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.docs.is_empty() && self.meta.is_empty()
    }
}

/// Options controlling a batch write
#[derive(Debug, Clone, Copy, Default)]
pub struct WriteOptions {
    /// Skip the wrapping transaction. Test-only escape hatch; leaves
    /// partially applied batches visible on failure.
    pub no_transaction: bool,
}

/// Per-collection configuration, supplied at construction
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CollectionConfig {
    /// Field paths to extract into indexed columns
    #[serde(default)]
    pub indexes: Vec<String>,
    /// Field paths to encrypt individually. Empty with encryption
    /// enabled means the whole payload is encrypted atomically.
    #[serde(default)]
    pub encrypted_fields: Vec<String>,
}

/// Version index used to reconcile local storage against a remote
/// source of truth: `collection -> (docId -> version)`
pub type Inventory = BTreeMap<String, BTreeMap<String, i64>>;

/// Mutation applied to a single inventory entry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InventoryOp {
    Add,
    Update,
    Remove,
}

impl FromStr for InventoryOp {
    type Err = StorageError;

    fn from_str(s: &str) -> StoreResult<Self> {
        match s {
            "add" => Ok(InventoryOp::Add),
            "update" => Ok(InventoryOp::Update),
            "remove" => Ok(InventoryOp::Remove),
            other => Err(StorageError::malformed(format!(
                "invalid inventory operation '{}' (expected add, update, or remove)",
                other
            ))),
        }
    }
}

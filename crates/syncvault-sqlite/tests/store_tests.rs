//! End-to-end tests driving the storage coordinator and both layout
//! strategies against a real SQLite database.

use std::collections::HashMap;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use serde_json::{json, Map, Value};
use tempfile::TempDir;

use syncvault_core::{
    Base64Cipher, Cipher, CollectionConfig, ConnectionPool, InventoryOp, LayoutStrategy,
    PoolConfig, Record, SharedTableLayout, StorageError, Store, TablePerCollectionLayout,
    WriteBatch, DOCS_STORE, META_STORE,
};
use syncvault_sqlite::{sqlite_factory, SqliteConnection};

fn payload(entries: &[(&str, Value)]) -> Map<String, Value> {
    entries
        .iter()
        .map(|(k, v)| (k.to_string(), v.clone()))
        .collect()
}

fn doc(collection: &str, doc_id: &str, version: i64, extra: &[(&str, Value)]) -> Record {
    let mut p = payload(&[
        ("collection", json!(collection)),
        ("version", json!(version)),
    ]);
    for (k, v) in extra {
        p.insert(k.to_string(), v.clone());
    }
    Record::new(format!("{}/{}", collection, doc_id), p)
}

fn shared_store(collections: HashMap<String, CollectionConfig>) -> Store {
    let conn = SqliteConnection::open_in_memory().unwrap();
    let mut store = Store::single(
        Box::new(conn),
        Box::new(SharedTableLayout::new(collections, None)),
    );
    store.initialize().unwrap();
    store
}

fn per_collection_store(collections: HashMap<String, CollectionConfig>) -> Store {
    let conn = SqliteConnection::open_in_memory().unwrap();
    let mut store = Store::single(
        Box::new(conn),
        Box::new(TablePerCollectionLayout::new(collections, None)),
    );
    store.initialize().unwrap();
    store
}

#[test]
fn test_shared_layout_write_read_delete_round_trip() {
    let store = shared_store(HashMap::new());

    let batch = WriteBatch::docs(vec![
        doc("notes", "n1", 3, &[("title", json!("first"))]),
        doc("notes", "n2", 1, &[("title", json!("second"))]),
    ]);
    store.write_records(&batch).unwrap();

    let record = store.read_record("notes", "notes/n1").unwrap().unwrap();
    assert_eq!(record.payload["title"], json!("first"));
    assert_eq!(record.version(), 3);

    store.delete_record("notes", "notes/n1").unwrap();
    assert!(store.read_record("notes", "notes/n1").unwrap().is_none());
    // The sibling survives.
    assert!(store.read_record("notes", "notes/n2").unwrap().is_some());
}

#[test]
fn test_per_collection_layout_scenario() {
    // A store configured with an index on "name": write, read back,
    // check the inventory, delete, check again.
    let mut collections = HashMap::new();
    collections.insert(
        "users".to_string(),
        CollectionConfig {
            indexes: vec!["name".to_string()],
            ..Default::default()
        },
    );
    let store = per_collection_store(collections);

    store
        .write_records(&WriteBatch::docs(vec![doc(
            "users",
            "u1",
            1,
            &[("name", json!("ada"))],
        )]))
        .unwrap();

    let record = store.read_record("users", "users/u1").unwrap().unwrap();
    assert_eq!(record.payload["name"], json!("ada"));

    let inventory = store.read_inventory().unwrap();
    assert_eq!(inventory["users"]["users/u1"], 1);

    store.delete_record("users", "users/u1").unwrap();
    assert!(store.read_record("users", "users/u1").unwrap().is_none());
    assert!(store.read_inventory().unwrap().get("users").is_none());
}

#[test]
fn test_docs_store_discovers_collection_from_inventory() {
    let store = per_collection_store(HashMap::new());
    store
        .write_records(&WriteBatch::docs(vec![doc("tasks", "t1", 2, &[])]))
        .unwrap();

    // Reading through the generic docs store name resolves the
    // collection via the inventory.
    let record = store.read_record(DOCS_STORE, "tasks/t1").unwrap().unwrap();
    assert_eq!(record.payload["collection"], json!("tasks"));

    // Unknown id short-circuits without scanning any table.
    assert!(store.read_record(DOCS_STORE, "tasks/ghost").unwrap().is_none());
}

#[test]
fn test_meta_records_round_trip_both_layouts() {
    for store in [shared_store(HashMap::new()), per_collection_store(HashMap::new())] {
        store
            .write_records(&WriteBatch::meta(vec![Record::new(
                "sync_state",
                payload(&[("cursor", json!("abc123"))]),
            )]))
            .unwrap();

        let record = store.read_record(META_STORE, "sync_state").unwrap().unwrap();
        assert_eq!(record.payload["cursor"], json!("abc123"));

        // Meta listing never leaks the inventory row.
        let all = store.read_all_records(META_STORE).unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].id, "sync_state");
    }
}

#[test]
fn test_bulk_read_matches_individual_reads() {
    for store in [shared_store(HashMap::new()), per_collection_store(HashMap::new())] {
        store
            .write_records(&WriteBatch::docs(vec![
                doc("notes", "a", 1, &[]),
                doc("notes", "b", 2, &[]),
                doc("notes", "c", 3, &[]),
            ]))
            .unwrap();

        let ids: Vec<String> = ["notes/a", "notes/b", "notes/ghost", "notes/c"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        let mut bulk = store.read_records_bulk("notes", &ids).unwrap();
        bulk.sort_by(|a, b| a.id.cmp(&b.id));

        let mut individual = Vec::new();
        for id in &ids {
            if let Some(r) = store.read_record("notes", id).unwrap() {
                individual.push(r);
            }
        }
        individual.sort_by(|a, b| a.id.cmp(&b.id));

        assert_eq!(bulk.len(), 3);
        assert_eq!(
            bulk.iter().map(|r| r.id.as_str()).collect::<Vec<_>>(),
            individual.iter().map(|r| r.id.as_str()).collect::<Vec<_>>()
        );
    }
}

#[test]
fn test_failed_batch_leaves_no_trace() {
    for store in [shared_store(HashMap::new()), per_collection_store(HashMap::new())] {
        let bad = Record::new("notes/broken", payload(&[("title", json!("no tag"))]));
        let batch = WriteBatch::docs(vec![doc("notes", "ok", 1, &[]), bad]);

        let err = store.write_records(&batch).unwrap_err();
        assert!(matches!(err, StorageError::MalformedInput(_)));

        // Neither the valid sibling nor any inventory entry landed.
        assert!(store.read_record("notes", "notes/ok").unwrap().is_none());
        assert!(store.read_inventory().unwrap().is_empty());
    }
}

#[test]
fn test_whole_payload_encryption_round_trip() {
    let cipher = Some(Arc::new(Base64Cipher) as Arc<dyn Cipher>);
    let conn = SqliteConnection::open_in_memory().unwrap();
    let mut store = Store::single(
        Box::new(conn),
        Box::new(SharedTableLayout::new(HashMap::new(), cipher)),
    );
    store.initialize().unwrap();

    store
        .write_records(&WriteBatch::docs(vec![doc(
            "secrets",
            "s1",
            1,
            &[("body", json!("classified"))],
        )]))
        .unwrap();

    let record = store.read_record("secrets", "secrets/s1").unwrap().unwrap();
    assert_eq!(record.payload["body"], json!("classified"));
    assert!(record.payload.get("encrypted_payload").is_none());
}

#[test]
fn test_field_level_encryption_keeps_plaintext_indexable() {
    let cipher = Some(Arc::new(Base64Cipher) as Arc<dyn Cipher>);
    let mut collections = HashMap::new();
    collections.insert(
        "users".to_string(),
        CollectionConfig {
            indexes: vec!["name".to_string()],
            encrypted_fields: vec!["ssn".to_string()],
        },
    );
    let conn = SqliteConnection::open_in_memory().unwrap();
    let mut store = Store::single(
        Box::new(conn),
        Box::new(TablePerCollectionLayout::new(collections, cipher)),
    );
    store.initialize().unwrap();

    store
        .write_records(&WriteBatch::docs(vec![doc(
            "users",
            "u1",
            1,
            &[("name", json!("ada")), ("ssn", json!("000-00-0000"))],
        )]))
        .unwrap();

    // Decrypted on the way out.
    let record = store.read_record("users", "users/u1").unwrap().unwrap();
    assert_eq!(record.payload["ssn"], json!("000-00-0000"));
    assert_eq!(record.payload["name"], json!("ada"));
}

#[test]
fn test_inventory_mutations() {
    for store in [shared_store(HashMap::new()), per_collection_store(HashMap::new())] {
        store
            .update_inventory("notes", "n1", 1, InventoryOp::Add)
            .unwrap();
        store
            .update_inventory("notes", "n1", 5, InventoryOp::Update)
            .unwrap();
        store
            .update_inventory("tasks", "t1", 2, InventoryOp::Add)
            .unwrap();

        let inventory = store.read_inventory().unwrap();
        assert_eq!(inventory["notes"]["n1"], 5);
        assert_eq!(inventory["tasks"]["t1"], 2);

        store
            .update_inventory("notes", "n1", 0, InventoryOp::Remove)
            .unwrap();
        let inventory = store.read_inventory().unwrap();
        // Emptied collections disappear, populated ones stay.
        assert!(inventory.get("notes").is_none());
        assert_eq!(inventory["tasks"]["t1"], 2);
    }
}

#[test]
fn test_initialize_is_idempotent_and_preserves_data() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("vault.db");

    {
        let conn = SqliteConnection::open(&path).unwrap();
        let mut store = Store::single(
            Box::new(conn),
            Box::new(SharedTableLayout::new(HashMap::new(), None)),
        );
        store.initialize().unwrap();
        store
            .write_records(&WriteBatch::docs(vec![doc("notes", "n1", 4, &[])]))
            .unwrap();
    }

    // Reopening and re-initializing must not clobber anything.
    let conn = SqliteConnection::open(&path).unwrap();
    let mut store = Store::single(
        Box::new(conn),
        Box::new(SharedTableLayout::new(HashMap::new(), None)),
    );
    store.initialize().unwrap();

    let record = store.read_record("notes", "notes/n1").unwrap().unwrap();
    assert_eq!(record.version(), 4);
    assert_eq!(store.read_inventory().unwrap()["notes"]["notes/n1"], 4);
}

#[test]
fn test_delete_database_requires_reinitialize() {
    let mut store = per_collection_store(HashMap::new());
    store
        .write_records(&WriteBatch::docs(vec![doc("notes", "n1", 1, &[])]))
        .unwrap();

    store.delete_database().unwrap();
    assert!(matches!(
        store.read_inventory().unwrap_err(),
        StorageError::NotReady(_)
    ));

    store.initialize().unwrap();
    assert!(store.read_inventory().unwrap().is_empty());
    assert!(store.read_record(DOCS_STORE, "notes/n1").unwrap().is_none());
}

#[test]
fn test_pool_serves_more_checkouts_than_capacity() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("pooled.db");

    let pool = ConnectionPool::new(
        sqlite_factory(path),
        PoolConfig {
            max_size: 2,
            acquire_timeout: Duration::from_secs(5),
            ..Default::default()
        },
    );

    let handles: Vec<_> = (0..3)
        .map(|_| {
            let pool = Arc::clone(&pool);
            thread::spawn(move || {
                pool.with_connection(|conn| {
                    conn.query_one("SELECT 1 AS one", &[]).map(|_| ())
                })
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap().unwrap();
    }

    let stats = pool.stats();
    assert_eq!(stats.acquire_successes, 3);
    assert!(pool.health().healthy);
}

#[test]
fn test_pooled_store_round_trip() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("pooled_store.db");

    let pool = ConnectionPool::new(sqlite_factory(path), PoolConfig::default());
    let mut store = Store::pooled(
        pool,
        Box::new(TablePerCollectionLayout::new(HashMap::new(), None)),
    );
    store.initialize().unwrap();

    store
        .write_records(&WriteBatch::docs(vec![doc("notes", "n1", 1, &[])]))
        .unwrap();
    assert!(store.read_record("notes", "notes/n1").unwrap().is_some());

    store.close();
    assert!(matches!(
        store.read_inventory().unwrap_err(),
        StorageError::NotReady(_)
    ));
}

#[test]
fn test_schema_validation_both_layouts() {
    let strategies: Vec<Box<dyn LayoutStrategy>> = vec![
        Box::new(SharedTableLayout::new(HashMap::new(), None)),
        Box::new(TablePerCollectionLayout::new(HashMap::new(), None)),
    ];
    for strategy in strategies {
        let conn = SqliteConnection::open_in_memory().unwrap();
        assert!(!strategy.validate_schema(&conn).unwrap());
        strategy.initialize_schema(&conn).unwrap();
        assert!(strategy.validate_schema(&conn).unwrap());
    }
}

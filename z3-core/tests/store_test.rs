//! Triple store integration tests on real database files.

use rusqlite::Connection;
use tempfile::TempDir;
use z3_core::{
    Checkpoint, Fields, ItemKey, Object, StoreError, SubjectKind, TripleStore, WriteOrigin,
};

fn seed(store: &TripleStore, key: &ItemKey) {
    store
        .upsert_triples(
            key,
            SubjectKind::Item,
            &Fields::new()
                .with("itemType", "map")
                .with("title", "Tabula Rogeriana")
                .with("tag", "medieval")
                .with("tag", "arabic"),
            WriteOrigin::Remote { version: 7 },
        )
        .unwrap();
}

#[test]
fn test_failed_write_leaves_prior_triples_intact() {
    let temp_dir = TempDir::new().unwrap();
    let db_path = temp_dir.path().join("z3.db");
    let store = TripleStore::open(&db_path).unwrap();
    let key = ItemKey::new("ROGER222");
    seed(&store, &key);
    let before = store.get_item(&key).unwrap();
    let revision = store.current_revision().unwrap();

    // fail after the old triples were deleted and some new ones written
    let raw = Connection::open(&db_path).unwrap();
    raw.execute_batch(
        "CREATE TRIGGER inject_failure BEFORE INSERT ON metadata
         WHEN NEW.object = 'boom'
         BEGIN SELECT RAISE(ABORT, 'injected failure'); END;",
    )
    .unwrap();

    let broken = Fields::new()
        .with("itemType", "map")
        .with("title", "Changed")
        .with("extra", "boom");
    let result = store.upsert_triples(&key, SubjectKind::Item, &broken, WriteOrigin::Local);
    assert!(matches!(result, Err(StoreError::Database(_))));

    let after = store.get_item(&key).unwrap();
    assert_eq!(after.triples, before.triples);
    assert_eq!(after.record, before.record);
    assert!(!after.record.is_dirty());
    assert_eq!(store.current_revision().unwrap(), revision);
}

#[test]
fn test_data_survives_reopen() {
    let temp_dir = TempDir::new().unwrap();
    let db_path = temp_dir.path().join("z3.db");
    let key = ItemKey::new("ROGER222");
    {
        let store = TripleStore::open(&db_path).unwrap();
        seed(&store, &key);
        let mut cp = Checkpoint {
            library_version: 7,
            ..Default::default()
        };
        cp.items.insert(key.clone(), 7);
        cp.save(&store, None).unwrap();
    }

    let store = TripleStore::open(&db_path).unwrap();
    let item = store.get_item(&key).unwrap();
    assert_eq!(
        item.fields().values("tag"),
        vec![&Object::text("medieval"), &Object::text("arabic")]
    );
    assert_eq!(item.record.remote_version, Some(7));
    assert_eq!(Checkpoint::load(&store).unwrap().item_version(&key), Some(7));
}

#[test]
fn test_database_runs_in_wal_mode() {
    let temp_dir = TempDir::new().unwrap();
    let db_path = temp_dir.path().join("z3.db");
    let store = TripleStore::open(&db_path).unwrap();
    let key = ItemKey::new("ROGER222");
    seed(&store, &key);

    let reader = Connection::open(&db_path).unwrap();
    let mode: String = reader
        .query_row("PRAGMA journal_mode", [], |r| r.get(0))
        .unwrap();
    assert_eq!(mode, "wal");

    let tags: i64 = reader
        .query_row(
            "SELECT COUNT(*) FROM metadata WHERE subject = ?1 AND predicate = 'tag'",
            [key.as_str()],
            |r| r.get(0),
        )
        .unwrap();
    assert_eq!(tags, 2);
}

#[test]
fn test_created_keys_are_unique() {
    let temp_dir = TempDir::new().unwrap();
    let store = TripleStore::open(&temp_dir.path().join("z3.db")).unwrap();
    let mut keys = std::collections::BTreeSet::new();
    for i in 0..50 {
        let key = store
            .create_item(SubjectKind::Item, &Fields::new().with("title", format!("Map {}", i)))
            .unwrap();
        let record = store.get_record(&key).unwrap().unwrap();
        assert!(record.is_dirty());
        assert!(!record.is_pushed());
        keys.insert(key);
    }
    assert_eq!(keys.len(), 50);
    assert_eq!(store.list_changed_since(0).unwrap().len(), 50);
}

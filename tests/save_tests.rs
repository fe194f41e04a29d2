/// Save and insert tests
///
/// Optimistic locking, identity generation and plain upsert saves
/// Run with: cargo test --test save_tests

mod common;

use common::{Note, Person, Sku, template};
use rustdocmap::driver::OperationKind;
use rustdocmap::{DbError, InMemoryDriver};
use serde_json::json;

#[tokio::test]
async fn test_versioned_save_increments_version() {
    let driver = InMemoryDriver::new();
    let template = template(&driver);

    let saved = template.save(Person::new("Ada", 36)).await.unwrap();
    assert_eq!(saved.version, Some(0));
    assert!(saved.id.is_some());

    let saved = template.save(saved).await.unwrap();
    let saved = template.save(saved).await.unwrap();
    assert_eq!(saved.version, Some(2));

    let stored = driver.documents("test.person");
    assert_eq!(stored.len(), 1);
    assert_eq!(stored[0]["version"], json!(2));
    assert_eq!(stored[0]["fn"], json!("Ada"));
    assert!(!stored[0].contains_key("first_name"));
}

#[tokio::test]
async fn test_stale_version_is_rejected() {
    let driver = InMemoryDriver::new();
    let template = template(&driver);

    let original = template.save(Person::new("Ada", 36)).await.unwrap();
    let mut current = template.save(original.clone()).await.unwrap();

    // Save from the outdated copy
    let err = template.save(original.clone()).await.unwrap_err();
    assert!(err.is_conflict());
    match err {
        DbError::OptimisticLockingFailure {
            entity,
            collection,
            version,
            ..
        } => {
            assert_eq!(entity, "Person");
            assert_eq!(collection, "person");
            assert_eq!(version, 0);
        }
        other => panic!("unexpected error: {other:?}"),
    }

    // The stored document keeps the winning write
    current.age = 37;
    let current = template.save(current).await.unwrap();
    assert_eq!(current.version, Some(2));
    assert_eq!(driver.documents("test.person")[0]["age"], json!(37));
}

#[tokio::test]
async fn test_plain_save_is_idempotent_upsert() {
    let driver = InMemoryDriver::new();
    let template = template(&driver);
    let note = Note {
        id: Some("n1".to_string()),
        text: "hello".to_string(),
    };

    let first = template.save(note.clone()).await.unwrap();
    let after_first = driver.documents("test.note");
    let second = template.save(note).await.unwrap();

    assert_eq!(first, second);
    assert_eq!(driver.documents("test.note"), after_first);
    assert_eq!(after_first.len(), 1);
    assert_eq!(driver.count_operations(OperationKind::ReplaceOne), 2);
    assert_eq!(driver.count_operations(OperationKind::InsertOne), 0);
}

#[tokio::test]
async fn test_plain_save_without_id_inserts() {
    let driver = InMemoryDriver::new();
    let template = template(&driver);

    let saved = template.save(Note::new("draft")).await.unwrap();

    assert!(saved.id.is_some());
    assert_eq!(driver.count_operations(OperationKind::InsertOne), 1);
    assert_eq!(driver.documents("test.note")[0]["_id"], json!(saved.id.unwrap()));
}

#[tokio::test]
async fn test_insert_generates_id_and_rejects_duplicates() {
    let driver = InMemoryDriver::new();
    let template = template(&driver);

    let inserted = template.insert(Note::new("first")).await.unwrap();
    let id = inserted.id.clone().expect("generated id");
    assert!(!id.is_empty());

    let err = template.insert(inserted).await.unwrap_err();
    assert!(matches!(err, DbError::DuplicateKey(_)));
    assert_eq!(driver.documents("test.note").len(), 1);
}

#[tokio::test]
async fn test_assigned_id_must_be_set() {
    let driver = InMemoryDriver::new();
    let template = template(&driver);

    let err = template
        .insert(Sku {
            id: None,
            name: "widget".to_string(),
        })
        .await
        .unwrap_err();

    assert!(err.is_usage_error());
    assert!(driver.operations().is_empty());
}

#[tokio::test]
async fn test_insert_all_assigns_ids_in_order() {
    let driver = InMemoryDriver::new();
    let template = template(&driver);

    let saved = template
        .insert_all(vec![Person::new("Ada", 36), Person::new("Grace", 45)])
        .await
        .unwrap();

    assert_eq!(saved.len(), 2);
    assert_eq!(saved[0].first_name, "Ada");
    assert_eq!(saved[1].first_name, "Grace");
    assert!(saved.iter().all(|p| p.version == Some(0)));
    assert_ne!(saved[0].id, saved[1].id);
    assert_eq!(driver.count_operations(OperationKind::InsertMany), 1);

    // Empty batches never reach the store
    let none: Vec<Person> = template.insert_all(Vec::new()).await.unwrap();
    assert!(none.is_empty());
    assert_eq!(driver.count_operations(OperationKind::InsertMany), 1);
}

#[tokio::test]
async fn test_saved_entity_reads_back_unchanged() {
    let driver = InMemoryDriver::new();
    let template = template(&driver);

    let saved = template.save(Person::new("Ada", 36)).await.unwrap();
    let loaded: Option<Person> = template
        .find_by_id(json!(saved.id.clone().unwrap()))
        .await
        .unwrap();

    assert_eq!(loaded, Some(saved));
}

#[tokio::test]
async fn test_remove_with_stale_version_deletes_nothing() {
    let driver = InMemoryDriver::new();
    let template = template(&driver);

    let original = template.save(Person::new("Ada", 36)).await.unwrap();
    let current = template.save(original.clone()).await.unwrap();

    let stale = template.remove(&original).await.unwrap();
    assert_eq!(stale.deleted_count, 0);
    assert_eq!(driver.documents("test.person").len(), 1);

    let removed = template.remove(&current).await.unwrap();
    assert_eq!(removed.deleted_count, 1);
    assert!(driver.documents("test.person").is_empty());
}

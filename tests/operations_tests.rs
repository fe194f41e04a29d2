/// Template operation tests
///
/// Updates, removes, queries and the find-and-modify family
/// Run with: cargo test --test operations_tests

mod common;

use common::{Note, Person, template};
use futures::TryStreamExt;
use rustdocmap::driver::OperationKind;
use rustdocmap::{
    Collation, DocumentTemplate, FindAndModifyOptions, FindAndReplaceOptions, InMemoryDriver,
    Projection, Query, ReadPreference, TemplateConfig, Update,
};
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;

#[derive(Debug, PartialEq, Deserialize)]
struct PersonName {
    first_name: String,
}

impl Projection for PersonName {
    fn properties() -> &'static [&'static str] {
        &["first_name"]
    }
}

async fn seed_people(template: &DocumentTemplate) -> Vec<Person> {
    template
        .insert_all(vec![
            Person::new("Ada", 36),
            Person::new("Grace", 45),
            Person::new("Linus", 28),
        ])
        .await
        .unwrap()
}

fn by_name(name: &str) -> Query {
    Query::by_field("first_name", json!(name))
}

#[tokio::test]
async fn test_update_first_increments_version() {
    let driver = InMemoryDriver::new();
    let template = template(&driver);
    seed_people(&template).await;

    let result = template
        .update_first::<Person>(&by_name("Ada"), &Update::new().set("age", json!(37)))
        .await
        .unwrap();
    assert_eq!(result.matched_count, 1);

    let ada: Person = template.find_one(&by_name("Ada")).await.unwrap().unwrap();
    assert_eq!(ada.age, 37);
    assert_eq!(ada.version, Some(1));
}

#[tokio::test]
async fn test_update_multi_and_invalid_updates() {
    let driver = InMemoryDriver::new();
    let template = template(&driver);
    seed_people(&template).await;

    let older = Query::parse(json!({"age": {"$gte": 30}})).unwrap();
    let result = template
        .update_multi::<Person>(&older, &Update::new().inc("age", 1))
        .await
        .unwrap();
    assert_eq!(result.matched_count, 2);
    assert_eq!(result.modified_count, 2);

    let err = template
        .update_first::<Person>(&older, &Update::new())
        .await
        .unwrap_err();
    assert!(err.is_usage_error());

    let replacement = Update::parse(json!({"first_name": "Nobody", "age": 1})).unwrap();
    let err = template
        .update_multi::<Person>(&older, &replacement)
        .await
        .unwrap_err();
    assert!(err.is_usage_error());
}

#[tokio::test]
async fn test_upsert_inserts_from_filter() {
    let driver = InMemoryDriver::new();
    let template = template(&driver);

    let result = template
        .upsert::<Person>(&by_name("Ken"), &Update::new().set("age", json!(80)))
        .await
        .unwrap();

    assert!(result.upserted_id.is_some());
    let stored = driver.documents("test.person");
    assert_eq!(stored.len(), 1);
    assert_eq!(stored[0]["fn"], json!("Ken"));
    assert_eq!(stored[0]["age"], json!(80));
    assert_eq!(stored[0]["version"], json!(1));
}

#[tokio::test]
async fn test_remove_matching() {
    let driver = InMemoryDriver::new();
    let template = template(&driver);
    seed_people(&template).await;

    let result = template
        .remove_matching::<Person>(&Query::parse(json!({"age": {"$lt": 40}})).unwrap())
        .await
        .unwrap();

    assert_eq!(result.deleted_count, 2);
    assert_eq!(template.count::<Person>(&Query::all()).await.unwrap(), 1);
}

#[tokio::test]
async fn test_find_sort_skip_limit() {
    let driver = InMemoryDriver::new();
    let template = template(&driver);
    seed_people(&template).await;

    let query = Query::all()
        .sort(json!({"age": -1}))
        .unwrap()
        .skip(1)
        .limit(1);
    let found: Vec<Person> = template.find(&query).try_collect().await.unwrap();

    assert_eq!(found.len(), 1);
    assert_eq!(found[0].first_name, "Ada");
}

#[tokio::test]
async fn test_find_is_lazy() {
    let driver = InMemoryDriver::new();
    let template = template(&driver);

    let stream = template.find::<Person>(&Query::all());
    assert_eq!(driver.count_operations(OperationKind::Find), 0);

    let found: Vec<Person> = stream.try_collect().await.unwrap();
    assert!(found.is_empty());
    assert_eq!(driver.count_operations(OperationKind::Find), 1);
}

#[tokio::test]
async fn test_find_as_projection() {
    let driver = InMemoryDriver::new();
    let template = template(&driver);
    seed_people(&template).await;

    let query = Query::all().sort(json!({"first_name": 1})).unwrap();
    let names: Vec<PersonName> = template
        .find_as::<Person, PersonName>(&query)
        .try_collect()
        .await
        .unwrap();

    let names: Vec<&str> = names.iter().map(|n| n.first_name.as_str()).collect();
    assert_eq!(names, vec!["Ada", "Grace", "Linus"]);
}

#[tokio::test]
async fn test_count_and_exists() {
    let driver = InMemoryDriver::new();
    let template = template(&driver);
    seed_people(&template).await;

    assert_eq!(template.count::<Person>(&Query::all()).await.unwrap(), 3);
    assert!(template.exists::<Person>(&by_name("Grace")).await.unwrap());
    assert!(!template.exists::<Person>(&by_name("Barbara")).await.unwrap());
}

#[tokio::test]
async fn test_read_preference_reaches_driver() {
    let driver = InMemoryDriver::new();
    let template = DocumentTemplate::new(
        Arc::new(driver.clone()),
        TemplateConfig::default().read_preference(ReadPreference::SecondaryPreferred),
    )
    .unwrap();

    template.count::<Person>(&Query::all()).await.unwrap();
    template
        .count::<Person>(&Query::all().read_preference(ReadPreference::Nearest))
        .await
        .unwrap();

    let preferences: Vec<_> = driver
        .operations()
        .into_iter()
        .map(|op| op.read_preference)
        .collect();
    assert_eq!(
        preferences,
        vec![Some(ReadPreference::SecondaryPreferred), Some(ReadPreference::Nearest)]
    );
}

#[tokio::test]
async fn test_find_and_modify_returns_old_or_new() {
    let driver = InMemoryDriver::new();
    let template = template(&driver);
    seed_people(&template).await;
    let bump = Update::new().inc("age", 1);

    let old: Person = template
        .find_and_modify(&by_name("Ada"), &bump, &FindAndModifyOptions::new())
        .await
        .unwrap()
        .unwrap();
    assert_eq!((old.age, old.version), (36, Some(0)));

    let new: Person = template
        .find_and_modify(&by_name("Ada"), &bump, &FindAndModifyOptions::new().return_new(true))
        .await
        .unwrap()
        .unwrap();
    assert_eq!((new.age, new.version), (38, Some(2)));

    let missing: Option<Person> = template
        .find_and_modify(&by_name("Nobody"), &bump, &FindAndModifyOptions::new())
        .await
        .unwrap();
    assert!(missing.is_none());
}

#[tokio::test]
async fn test_find_and_modify_rejects_double_collation() {
    let driver = InMemoryDriver::new();
    let template = template(&driver);

    let query = by_name("Ada").collation(Collation::of("en"));
    let options = FindAndModifyOptions::new().collation(Collation::of("de"));
    let err = template
        .find_and_modify::<Person>(&query, &Update::new().inc("age", 1), &options)
        .await
        .unwrap_err();

    assert!(err.is_usage_error());
    assert!(driver.operations().is_empty());
}

#[tokio::test]
async fn test_find_and_modify_remove_option() {
    let driver = InMemoryDriver::new();
    let template = template(&driver);
    seed_people(&template).await;

    let removed: Option<Person> = template
        .find_and_modify(
            &by_name("Linus"),
            &Update::new().inc("age", 1),
            &FindAndModifyOptions::new().remove(true),
        )
        .await
        .unwrap();

    assert_eq!(removed.unwrap().age, 28);
    assert_eq!(driver.count_operations(OperationKind::FindOneAndDelete), 1);
    assert_eq!(template.count::<Person>(&Query::all()).await.unwrap(), 2);
}

#[tokio::test]
async fn test_find_and_modify_remove_keeps_collation() {
    let driver = InMemoryDriver::new();
    let template = template(&driver);
    seed_people(&template).await;

    let removed: Option<Person> = template
        .find_and_modify(
            &by_name("Linus"),
            &Update::new().inc("age", 1),
            &FindAndModifyOptions::new().remove(true).collation(Collation::of("de")),
        )
        .await
        .unwrap();
    assert_eq!(removed.unwrap().age, 28);

    let delete = driver
        .operations()
        .into_iter()
        .find(|op| op.kind == OperationKind::FindOneAndDelete)
        .unwrap();
    assert_eq!(delete.collation, Some(Collation::of("de")));
}

#[tokio::test]
async fn test_find_and_replace() {
    let driver = InMemoryDriver::new();
    let template = template(&driver);
    template.save(Note::new("draft")).await.unwrap();

    let previous: Option<Note> = template
        .find_and_replace(
            &Query::by_field("text", json!("draft")),
            Note::new("final"),
            FindAndReplaceOptions::new(),
        )
        .await
        .unwrap();
    assert_eq!(previous.unwrap().text, "draft");

    let upserted: Option<Note> = template
        .find_and_replace(
            &Query::by_field("text", json!("missing")),
            Note::new("created"),
            FindAndReplaceOptions::new().upsert(true).return_new(true),
        )
        .await
        .unwrap();
    assert_eq!(upserted.unwrap().text, "created");

    let texts: Vec<_> = driver
        .documents("test.note")
        .into_iter()
        .map(|doc| doc["text"].clone())
        .collect();
    assert_eq!(texts, vec![json!("final"), json!("created")]);
}

#[tokio::test]
async fn test_versioned_find_and_replace() {
    let driver = InMemoryDriver::new();
    let template = DocumentTemplate::new(
        Arc::new(driver.clone()),
        TemplateConfig::default().versioned_find_and_replace(true),
    )
    .unwrap();
    let stale = template.save(Person::new("Ada", 36)).await.unwrap();
    let current = template.save(stale.clone()).await.unwrap();

    let err = template
        .find_and_replace(&by_name("Ada"), stale, FindAndReplaceOptions::new())
        .await
        .unwrap_err();
    assert!(err.is_conflict());

    let replaced: Person = template
        .find_and_replace(
            &by_name("Ada"),
            Person { age: 40, ..current },
            FindAndReplaceOptions::new().return_new(true),
        )
        .await
        .unwrap()
        .unwrap();
    assert_eq!((replaced.age, replaced.version), (40, Some(2)));

    // No document at all is a plain miss
    let missing: Option<Person> = template
        .find_and_replace(&by_name("Nobody"), replaced, FindAndReplaceOptions::new())
        .await
        .unwrap();
    assert!(missing.is_none());
}

#[tokio::test]
async fn test_versioned_find_and_replace_upsert() {
    let driver = InMemoryDriver::new();
    let template = DocumentTemplate::new(
        Arc::new(driver.clone()),
        TemplateConfig::default().versioned_find_and_replace(true),
    )
    .unwrap();
    let stale = template.save(Person::new("Ada", 36)).await.unwrap();
    template.save(stale.clone()).await.unwrap();
    driver.clear_operations();

    // step 1: a stale version conflicts and inserts nothing
    let err = template
        .find_and_replace(&by_name("Ada"), stale, FindAndReplaceOptions::new().upsert(true))
        .await
        .unwrap_err();
    assert!(err.is_conflict());
    assert_eq!(driver.documents("test.person").len(), 1);
    assert_eq!(driver.count_operations(OperationKind::FindOneAndReplace), 1);

    // step 2: with nothing matching the query the replacement is upserted
    let fresh = Person {
        version: Some(0),
        ..Person::new("Linus", 28)
    };
    let inserted: Person = template
        .find_and_replace(
            &by_name("Linus"),
            fresh,
            FindAndReplaceOptions::new().upsert(true).return_new(true),
        )
        .await
        .unwrap()
        .unwrap();
    assert_eq!((inserted.age, inserted.version), (28, Some(1)));
    assert_eq!(driver.documents("test.person").len(), 2);
    assert_eq!(driver.count_operations(OperationKind::FindOneAndReplace), 3);
}

#[tokio::test]
async fn test_find_and_remove() {
    let driver = InMemoryDriver::new();
    let template = template(&driver);
    seed_people(&template).await;

    let oldest: Option<Person> = template
        .find_and_remove(&Query::all().sort(json!({"age": -1})).unwrap())
        .await
        .unwrap();
    assert_eq!(oldest.unwrap().first_name, "Grace");

    let rest: Vec<Person> = template
        .find_all_and_remove(&Query::parse(json!({"age": {"$gt": 20}})).unwrap())
        .await
        .unwrap();
    assert_eq!(rest.len(), 2);
    assert!(driver.documents("test.person").is_empty());

    let none: Vec<Person> = template.find_all_and_remove(&Query::all()).await.unwrap();
    assert!(none.is_empty());
}

#[tokio::test]
async fn test_tail_reads_current_documents() {
    let driver = InMemoryDriver::new();
    let template = template(&driver);
    template
        .insert_all(vec![Note::new("one"), Note::new("two")])
        .await
        .unwrap();

    let notes: Vec<Note> = template.tail(&Query::all()).try_collect().await.unwrap();

    assert_eq!(notes.len(), 2);
}

#[tokio::test]
async fn test_explicit_collection_overrides_entity_collection() {
    let driver = InMemoryDriver::new();
    let template = template(&driver);

    template
        .insert_in(Note::new("archived"), "note_archive")
        .await
        .unwrap();

    assert_eq!(driver.documents("test.note_archive").len(), 1);
    assert!(driver.documents("test.note").is_empty());
    assert_eq!(
        template.count_in::<Note>(&Query::all(), "note_archive").await.unwrap(),
        1
    );
}

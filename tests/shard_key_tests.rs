/// Shard key tests
///
/// Completion of single-document replacement filters on sharded collections
/// Run with: cargo test --test shard_key_tests

mod common;

use common::{Order, Shipment, template};
use rustdocmap::driver::OperationKind;
use rustdocmap::{InMemoryDriver, Query, Update};
use serde_json::{Value, json};

fn replace_filters(driver: &InMemoryDriver) -> Vec<Value> {
    driver
        .operations()
        .into_iter()
        .filter(|op| op.kind == OperationKind::ReplaceOne)
        .filter_map(|op| op.filter.map(Value::Object))
        .collect()
}

#[tokio::test]
async fn test_immutable_key_taken_from_entity() {
    let driver = InMemoryDriver::new();
    let template = template(&driver);
    let shipment = Shipment {
        id: "s1".to_string(),
        region: "eu".to_string(),
        weight: 12,
    };

    template.save(shipment.clone()).await.unwrap();
    template.save(shipment).await.unwrap();

    assert_eq!(driver.count_operations(OperationKind::Find), 0);
    assert_eq!(
        replace_filters(&driver),
        vec![json!({"_id": "s1", "region": "eu"}), json!({"_id": "s1", "region": "eu"})]
    );
    assert_eq!(driver.documents("test.shipment").len(), 1);
}

#[tokio::test]
async fn test_mutable_key_read_back_once_per_save() {
    let driver = InMemoryDriver::new();
    let template = template(&driver);
    let order = Order {
        id: "o1".to_string(),
        region: "eu".to_string(),
        total: 10,
    };

    // Nothing stored yet: falls back to the entity's own key
    template.save(order.clone()).await.unwrap();
    assert_eq!(driver.count_operations(OperationKind::Find), 1);
    assert_eq!(replace_filters(&driver), vec![json!({"_id": "o1", "region": "eu"})]);

    driver.clear_operations();

    // Key moved: the stored value addresses the existing document
    let moved = Order {
        region: "us".to_string(),
        ..order
    };
    template.save(moved).await.unwrap();
    assert_eq!(driver.count_operations(OperationKind::Find), 1);
    assert_eq!(replace_filters(&driver), vec![json!({"_id": "o1", "region": "eu"})]);

    let stored = driver.documents("test.order");
    assert_eq!(stored.len(), 1);
    assert_eq!(stored[0]["region"], json!("us"));
}

#[tokio::test]
async fn test_filter_with_key_skips_resolution() {
    let driver = InMemoryDriver::new();
    let template = template(&driver);

    let query = Query::parse(json!({"id": "o2", "region": "eu"})).unwrap();
    let replacement = Update::parse(json!({"region": "eu", "total": 3})).unwrap();
    let result = template
        .upsert::<Order>(&query, &replacement)
        .await
        .unwrap();

    assert_eq!(result.upserted_id, Some(json!("o2")));
    assert_eq!(driver.count_operations(OperationKind::Find), 0);
}

#[tokio::test]
async fn test_incomplete_shard_key_is_usage_error() {
    let driver = InMemoryDriver::new();
    let template = template(&driver);

    let query = Query::parse(json!({"id": "missing"})).unwrap();
    let replacement = Update::parse(json!({"total": 5})).unwrap();
    let err = template
        .update_first::<Order>(&query, &replacement)
        .await
        .unwrap_err();

    assert!(err.is_usage_error());
    assert_eq!(driver.count_operations(OperationKind::ReplaceOne), 0);
}

#[tokio::test]
async fn test_multi_update_needs_no_shard_key() {
    let driver = InMemoryDriver::new();
    let template = template(&driver);
    for (id, region) in [("a", "eu"), ("b", "us")] {
        template
            .save(Order {
                id: id.to_string(),
                region: region.to_string(),
                total: 1,
            })
            .await
            .unwrap();
    }
    driver.clear_operations();

    let result = template
        .update_multi::<Order>(&Query::all(), &Update::new().inc("total", 4))
        .await
        .unwrap();

    assert_eq!(result.modified_count, 2);
    assert_eq!(driver.count_operations(OperationKind::Find), 0);
    assert!(
        driver
            .documents("test.order")
            .iter()
            .all(|doc| doc["total"] == json!(5))
    );
}

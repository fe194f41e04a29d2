#![allow(dead_code)]

use rustdocmap::{
    DocumentTemplate, Entity, EntityMetadata, EventPhase, IdGeneration, InMemoryDriver,
    LifecycleEvent, ListenerBus, ShardKey, TemplateConfig,
};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Person {
    pub id: Option<String>,
    pub first_name: String,
    pub age: i64,
    pub version: Option<i64>,
}

impl Person {
    pub fn new(first_name: &str, age: i64) -> Self {
        Self {
            id: None,
            first_name: first_name.to_string(),
            age,
            version: None,
        }
    }
}

impl Entity for Person {
    fn describe() -> EntityMetadata {
        EntityMetadata::new("Person")
            .version_property("version")
            .field("first_name", "fn")
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Note {
    pub id: Option<String>,
    pub text: String,
}

impl Note {
    pub fn new(text: &str) -> Self {
        Self {
            id: None,
            text: text.to_string(),
        }
    }
}

impl Entity for Note {
    fn describe() -> EntityMetadata {
        EntityMetadata::new("Note")
    }
}

/// Sharded by a key that may change after insert.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Order {
    pub id: String,
    pub region: String,
    pub total: i64,
}

impl Entity for Order {
    fn describe() -> EntityMetadata {
        EntityMetadata::new("Order")
            .id_generation(IdGeneration::Assigned)
            .shard_key(ShardKey::of(&["region"]))
    }
}

/// Sharded by a key that never changes once written.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Shipment {
    pub id: String,
    pub region: String,
    pub weight: i64,
}

impl Entity for Shipment {
    fn describe() -> EntityMetadata {
        EntityMetadata::new("Shipment")
            .id_generation(IdGeneration::Assigned)
            .shard_key(ShardKey::of(&["region"]).immutable(true))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Sku {
    pub id: Option<String>,
    pub name: String,
}

impl Entity for Sku {
    fn describe() -> EntityMetadata {
        EntityMetadata::new("Sku").id_generation(IdGeneration::Assigned)
    }
}

pub fn template(driver: &InMemoryDriver) -> DocumentTemplate {
    DocumentTemplate::new(Arc::new(driver.clone()), TemplateConfig::default()).unwrap()
}

/// Collects every published lifecycle event.
#[derive(Clone, Default)]
pub struct EventLog {
    events: Arc<Mutex<Vec<LifecycleEvent>>>,
}

impl EventLog {
    pub fn bus(&self) -> ListenerBus {
        let events = self.events.clone();
        ListenerBus::new().on(move |event| events.lock().unwrap().push(event.clone()))
    }

    pub fn phases(&self) -> Vec<EventPhase> {
        self.events.lock().unwrap().iter().map(|e| e.phase()).collect()
    }

    pub fn events(&self) -> Vec<LifecycleEvent> {
        self.events.lock().unwrap().clone()
    }

    pub fn clear(&self) {
        self.events.lock().unwrap().clear();
    }
}

pub fn template_with_events(driver: &InMemoryDriver, log: &EventLog) -> DocumentTemplate {
    DocumentTemplate::builder(Arc::new(driver.clone()))
        .publisher(Arc::new(log.bus()))
        .build()
        .unwrap()
}

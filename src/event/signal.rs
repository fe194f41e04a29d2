use crate::core::Document;
use chrono::{DateTime, Utc};
use serde_json::Value;
use std::fmt;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventPhase {
    BeforeConvert,
    BeforeSave,
    AfterSave,
    BeforeDelete,
    AfterDelete,
    AfterLoad,
    AfterConvert,
}

impl fmt::Display for EventPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            EventPhase::BeforeConvert => "before-convert",
            EventPhase::BeforeSave => "before-save",
            EventPhase::AfterSave => "after-save",
            EventPhase::BeforeDelete => "before-delete",
            EventPhase::AfterDelete => "after-delete",
            EventPhase::AfterLoad => "after-load",
            EventPhase::AfterConvert => "after-convert",
        };
        f.write_str(name)
    }
}

/// What an event is about.
#[derive(Debug, Clone, PartialEq)]
pub enum EventSource {
    /// Property-level snapshot of the entity.
    Entity(Value),
    /// Wire-level filter of a delete.
    Query(Document),
    /// Raw document as read from the store.
    Document(Document),
}

/// Immutable notification broadcast once per phase of an operation.
#[derive(Debug, Clone, PartialEq)]
pub struct LifecycleEvent {
    phase: EventPhase,
    source: EventSource,
    document: Option<Document>,
    collection: String,
    entity_type: String,
    timestamp: DateTime<Utc>,
}

impl LifecycleEvent {
    pub fn new(
        phase: EventPhase,
        source: EventSource,
        document: Option<Document>,
        collection: impl Into<String>,
        entity_type: impl Into<String>,
    ) -> Self {
        Self {
            phase,
            source,
            document,
            collection: collection.into(),
            entity_type: entity_type.into(),
            timestamp: Utc::now(),
        }
    }

    pub fn phase(&self) -> EventPhase {
        self.phase
    }

    pub fn source(&self) -> &EventSource {
        &self.source
    }

    pub fn document(&self) -> Option<&Document> {
        self.document.as_ref()
    }

    pub fn collection(&self) -> &str {
        &self.collection
    }

    pub fn entity_type(&self) -> &str {
        &self.entity_type
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }
}

/// Receives lifecycle events. Publishing is synchronous and cannot fail or
/// veto the operation.
pub trait EventPublisher: Send + Sync {
    fn publish(&self, event: &LifecycleEvent);
}

#[derive(Debug, Clone, Copy, Default)]
pub struct NoopPublisher;

impl EventPublisher for NoopPublisher {
    fn publish(&self, _event: &LifecycleEvent) {}
}

pub trait LifecycleListener: Send + Sync {
    fn on_event(&self, event: &LifecycleEvent);

    /// Restricts delivery to one entity type; `None` receives everything.
    fn entity_type(&self) -> Option<&str> {
        None
    }
}

struct FnListener<F> {
    entity_type: Option<String>,
    handler: F,
}

impl<F> LifecycleListener for FnListener<F>
where
    F: Fn(&LifecycleEvent) + Send + Sync,
{
    fn on_event(&self, event: &LifecycleEvent) {
        (self.handler)(event)
    }

    fn entity_type(&self) -> Option<&str> {
        self.entity_type.as_deref()
    }
}

/// Fans events out to listeners in registration order.
#[derive(Clone, Default)]
pub struct ListenerBus {
    listeners: Vec<Arc<dyn LifecycleListener>>,
}

impl ListenerBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn listener(mut self, listener: Arc<dyn LifecycleListener>) -> Self {
        self.listeners.push(listener);
        self
    }

    pub fn on<F>(self, handler: F) -> Self
    where
        F: Fn(&LifecycleEvent) + Send + Sync + 'static,
    {
        self.listener(Arc::new(FnListener {
            entity_type: None,
            handler,
        }))
    }

    pub fn on_type<F>(self, entity_type: &str, handler: F) -> Self
    where
        F: Fn(&LifecycleEvent) + Send + Sync + 'static,
    {
        self.listener(Arc::new(FnListener {
            entity_type: Some(entity_type.to_string()),
            handler,
        }))
    }

    pub fn len(&self) -> usize {
        self.listeners.len()
    }

    pub fn is_empty(&self) -> bool {
        self.listeners.is_empty()
    }
}

impl EventPublisher for ListenerBus {
    fn publish(&self, event: &LifecycleEvent) {
        for listener in &self.listeners {
            match listener.entity_type() {
                Some(entity_type) if entity_type != event.entity_type() => continue,
                _ => listener.on_event(event),
            }
        }
    }
}

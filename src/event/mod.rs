//! Lifecycle signals (fire-and-forget) and entity callbacks (in-pipeline).

pub mod callback;
pub mod signal;

pub use callback::{
    AfterConvertCallback, AfterSaveCallback, BeforeConvertCallback, BeforeSaveCallback,
    EntityCallbacks, EntityCallbacksBuilder,
};
pub use signal::{
    EventPhase, EventPublisher, EventSource, LifecycleEvent, LifecycleListener, ListenerBus,
    NoopPublisher,
};

// ============================================================================
// rustdocmap Library
// ============================================================================

//! Execution engine of a document-store client.
//!
//! [`DocumentTemplate`] maps domain entities onto documents and runs every
//! persistence operation through a fixed pipeline: lifecycle events, entity
//! callbacks, write-concern selection, shard-key completion, optimistic
//! locking and exception translation. The store itself sits behind the
//! [`StoreDriver`] trait; [`InMemoryDriver`] is a complete in-process
//! implementation.
//!
//! # Examples
//!
//! ```
//! use rustdocmap::{DocumentTemplate, Entity, EntityMetadata, InMemoryDriver, TemplateConfig};
//! use serde::{Deserialize, Serialize};
//! use std::sync::Arc;
//!
//! #[derive(Debug, Serialize, Deserialize)]
//! struct Person {
//!     id: Option<String>,
//!     name: String,
//!     version: Option<i64>,
//! }
//!
//! impl Entity for Person {
//!     fn describe() -> EntityMetadata {
//!         EntityMetadata::new("Person").version_property("version")
//!     }
//! }
//!
//! # tokio_test::block_on(async {
//! let template =
//!     DocumentTemplate::new(Arc::new(InMemoryDriver::new()), TemplateConfig::new("shop")).unwrap();
//!
//! let saved = template
//!     .save(Person { id: None, name: "Ada".into(), version: None })
//!     .await
//!     .unwrap();
//! assert_eq!(saved.version, Some(0));
//!
//! let saved = template.save(saved).await.unwrap();
//! assert_eq!(saved.version, Some(1));
//! # });
//! ```

pub mod core;
pub mod driver;
pub mod event;
pub mod mapping;
pub mod session;
pub mod template;

// Re-export main types for convenience
pub use crate::core::{
    Acknowledgment, CallbackPhase, Collation, DbError, Document, Query, ReadPreference, Result,
    Update, WriteConcern,
};
pub use crate::driver::{
    ClientSession, DeleteResult, DriverError, DriverErrorKind, InMemoryDriver, SessionHandle,
    SessionOptions, StoreDriver, TransactionOptions, TransactionState, UpdateResult,
};
pub use crate::event::{
    AfterConvertCallback, AfterSaveCallback, BeforeConvertCallback, BeforeSaveCallback,
    EntityCallbacks, EventPhase, EventPublisher, LifecycleEvent, ListenerBus,
};
pub use crate::mapping::{Entity, EntityMetadata, IdGeneration, Projection, ShardKey};
pub use crate::session::{ScopeState, SessionScoped, SessionSource, TransactionScoped};
pub use crate::template::{
    DocumentTemplate, FindAndModifyOptions, FindAndReplaceOptions, TemplateConfig,
    WriteResultChecking,
};

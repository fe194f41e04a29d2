//! The execution driver.
//!
//! [`DocumentTemplate`] turns entity-level requests into driver calls and
//! sequences everything around them: lifecycle events, entity callbacks,
//! write-concern selection, shard-key completion, optimistic locking and
//! exception translation. Operations come in two flavours, one deriving the
//! collection from the entity type and an `_in` variant taking it explicitly.
//!
//! A template is cheap to clone. A template bound to a session (see
//! [`DocumentTemplate::with_session_handle`] and the `session` module) is the
//! same type carrying that session into every driver call.

pub mod config;
mod modify;
mod optimistic;
mod read;
pub mod shard;
pub mod translate;
mod write;
pub mod write_concern;

pub use config::{TemplateConfig, WriteResultChecking};
pub use modify::{FindAndModifyOptions, FindAndReplaceOptions};
pub use optimistic::SaveState;
pub use shard::{ShardKeyResolver, requires_shard_key};
pub use translate::{DefaultExceptionTranslator, ExceptionTranslator};
pub use write_concern::{
    DefaultWriteConcernResolver, WriteAction, WriteActionKind, WriteConcernPolicy,
    WriteConcernResolver,
};

use crate::core::{DbError, Document, ReadPreference, Result, WriteConcern};
use crate::driver::{DriverError, PreparedCollection, SessionHandle, StoreDriver};
use crate::event::{
    EntityCallbacks, EventPhase, EventPublisher, EventSource, LifecycleEvent, NoopPublisher,
};
use crate::mapping::{DocumentCodec, Entity, EntityMetadata, FieldNameCodec, MappingContext};
use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use tracing::{Level, event};

struct TemplateInner {
    driver: Arc<dyn StoreDriver>,
    codec: Arc<dyn DocumentCodec>,
    mapping: MappingContext,
    publisher: Arc<dyn EventPublisher>,
    callbacks: EntityCallbacks,
    write_concern: WriteConcernPolicy,
    translator: Arc<dyn ExceptionTranslator>,
    config: TemplateConfig,
}

/// Entry point for every document operation.
///
/// Runs each call through the same pipeline: lifecycle signals, entity
/// callbacks, write-concern resolution, shard-key completion, optimistic
/// locking and translation of driver failures into [`DbError`]. Cloning is
/// cheap; clones share the driver, mapping cache and configuration.
#[derive(Clone)]
pub struct DocumentTemplate {
    inner: Arc<TemplateInner>,
    session: Option<SessionHandle>,
}

impl fmt::Debug for DocumentTemplate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DocumentTemplate")
            .field("database", &self.inner.config.database)
            .field("session", &self.session.as_ref().map(|s| s.id().to_string()))
            .finish_non_exhaustive()
    }
}

/// Configures the collaborators of a [`DocumentTemplate`].
///
/// Every collaborator has a default: [`FieldNameCodec`], [`NoopPublisher`],
/// no callbacks, [`DefaultWriteConcernResolver`] and
/// [`DefaultExceptionTranslator`].
pub struct TemplateBuilder {
    driver: Arc<dyn StoreDriver>,
    config: TemplateConfig,
    codec: Arc<dyn DocumentCodec>,
    publisher: Arc<dyn EventPublisher>,
    callbacks: EntityCallbacks,
    resolver: Arc<dyn WriteConcernResolver>,
    translator: Arc<dyn ExceptionTranslator>,
}

impl TemplateBuilder {
    /// Replaces the default [`TemplateConfig`].
    pub fn config(mut self, config: TemplateConfig) -> Self {
        self.config = config;
        self
    }

    /// Codec mapping entity properties to stored field names.
    pub fn codec(mut self, codec: Arc<dyn DocumentCodec>) -> Self {
        self.codec = codec;
        self
    }

    /// Receiver of lifecycle signals.
    pub fn publisher(mut self, publisher: Arc<dyn EventPublisher>) -> Self {
        self.publisher = publisher;
        self
    }

    /// Typed entity callbacks, fixed for the template's lifetime.
    pub fn callbacks(mut self, callbacks: EntityCallbacks) -> Self {
        self.callbacks = callbacks;
        self
    }

    /// Chooses the write concern of each write.
    pub fn write_concern_resolver(mut self, resolver: Arc<dyn WriteConcernResolver>) -> Self {
        self.resolver = resolver;
        self
    }

    /// Maps driver failures onto [`DbError`].
    pub fn exception_translator(mut self, translator: Arc<dyn ExceptionTranslator>) -> Self {
        self.translator = translator;
        self
    }

    /// Validates the configuration and assembles the template.
    ///
    /// Fails with [`DbError::InvalidUsage`] when the configuration
    /// does not validate.
    pub fn build(self) -> Result<DocumentTemplate> {
        self.config.validate()?;
        let write_concern =
            WriteConcernPolicy::new(self.resolver, self.config.write_result_checking);
        event!(
            Level::DEBUG,
            database = %self.config.database,
            callbacks = !self.callbacks.is_empty(),
            "document template created"
        );
        Ok(DocumentTemplate {
            inner: Arc::new(TemplateInner {
                driver: self.driver,
                codec: self.codec,
                mapping: MappingContext::new(),
                publisher: self.publisher,
                callbacks: self.callbacks,
                write_concern,
                translator: self.translator,
                config: self.config,
            }),
            session: None,
        })
    }
}

impl DocumentTemplate {
    /// Starts a builder over `driver` with default collaborators.
    pub fn builder(driver: Arc<dyn StoreDriver>) -> TemplateBuilder {
        TemplateBuilder {
            driver,
            config: TemplateConfig::default(),
            codec: Arc::new(FieldNameCodec),
            publisher: Arc::new(NoopPublisher),
            callbacks: EntityCallbacks::none(),
            resolver: Arc::new(DefaultWriteConcernResolver),
            translator: Arc::new(DefaultExceptionTranslator),
        }
    }

    /// Template with default collaborators and the given configuration.
    pub fn new(driver: Arc<dyn StoreDriver>, config: TemplateConfig) -> Result<Self> {
        Self::builder(driver).config(config).build()
    }

    pub fn config(&self) -> &TemplateConfig {
        &self.inner.config
    }

    /// Session every operation of this template is bound to.
    pub fn session(&self) -> Option<&SessionHandle> {
        self.session.as_ref()
    }

    /// A template sharing this one's configuration whose operations all carry `session`.
    pub fn with_session_handle(&self, session: SessionHandle) -> Self {
        Self {
            inner: self.inner.clone(),
            session: Some(session),
        }
    }

    /// Metadata cache shared by all clones of this template.
    pub fn mapping(&self) -> &MappingContext {
        &self.inner.mapping
    }

    /// Cached metadata of `T`, validated on first use.
    pub fn metadata<T: Entity>(&self) -> Result<Arc<EntityMetadata>> {
        self.inner.mapping.metadata::<T>()
    }

    /// Collection `T` is stored in when no collection is given.
    pub fn collection_name<T: Entity>(&self) -> Result<String> {
        self.inner.mapping.collection_name::<T>()
    }

    pub(crate) fn driver(&self) -> &dyn StoreDriver {
        self.inner.driver.as_ref()
    }

    pub(crate) fn codec(&self) -> &dyn DocumentCodec {
        self.inner.codec.as_ref()
    }

    pub(crate) fn callbacks(&self) -> &EntityCallbacks {
        &self.inner.callbacks
    }

    pub(crate) fn prepare_collection(
        &self,
        name: &str,
        read_preference: Option<ReadPreference>,
        write_concern: Option<WriteConcern>,
    ) -> PreparedCollection {
        PreparedCollection::new(self.inner.config.database.clone(), name)
            .with_read_preference(read_preference.unwrap_or(self.inner.config.read_preference))
            .with_write_concern(write_concern)
    }

    pub(crate) fn resolve_write_concern(&self, action: WriteAction<'_>) -> Option<WriteConcern> {
        let action = action.default_concern(self.inner.config.write_concern.as_ref());
        self.inner.write_concern.resolve(&action)
    }

    pub(crate) fn translate(&self, error: DriverError) -> DbError {
        match self.inner.translator.translate(&error) {
            Some(translated) => {
                event!(Level::WARN, error = %error, translated = %translated, "driver failure translated");
                translated
            }
            None => {
                event!(Level::WARN, error = %error, "driver failure passed through");
                DbError::Driver(error)
            }
        }
    }

    /// Rejects unacknowledged results when strict result checking is on.
    pub(crate) fn check_acknowledged(
        &self,
        acknowledged: bool,
        operation: &str,
        collection: &str,
    ) -> Result<()> {
        if acknowledged || self.inner.write_concern.checking() != WriteResultChecking::Exception {
            return Ok(());
        }
        event!(Level::ERROR, operation, collection, "write was not acknowledged");
        Err(DbError::DataIntegrityViolation(format!(
            "{} on collection '{}' was not acknowledged",
            operation, collection
        )))
    }

    pub(crate) fn emit(
        &self,
        phase: EventPhase,
        source: impl FnOnce() -> EventSource,
        document: Option<&Document>,
        collection: &str,
        entity_type: &str,
    ) {
        if !self.inner.config.entity_lifecycle_events {
            return;
        }
        let event = LifecycleEvent::new(phase, source(), document.cloned(), collection, entity_type);
        self.inner.publisher.publish(&event);
    }

    pub(crate) fn emit_entity<E: Serialize>(
        &self,
        phase: EventPhase,
        entity: &E,
        document: Option<&Document>,
        collection: &str,
        entity_type: &str,
    ) {
        if !self.inner.config.entity_lifecycle_events {
            return;
        }
        match serde_json::to_value(entity) {
            Ok(snapshot) => self.emit(
                phase,
                || EventSource::Entity(snapshot),
                document,
                collection,
                entity_type,
            ),
            Err(err) => {
                event!(Level::WARN, error = %err, %phase, collection, "lifecycle event skipped")
            }
        }
    }
}

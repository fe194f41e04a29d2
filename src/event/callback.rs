//! Typed, ordered entity callbacks.
//!
//! Callbacks run inside the pipeline and may replace the entity (and, before
//! save, edit the mapped document). They are registered per entity type when
//! the registry is built; dispatch is a single map lookup by `TypeId`.

use crate::core::{Document, Result};
use async_trait::async_trait;
use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{Level, event};

#[async_trait]
pub trait BeforeConvertCallback<T>: Send + Sync {
    async fn on_before_convert(&self, entity: T, collection: &str) -> Result<T>;
}

#[async_trait]
pub trait BeforeSaveCallback<T>: Send + Sync {
    /// `document` is what will be written; edits to it reach the store.
    async fn on_before_save(&self, entity: T, document: &mut Document, collection: &str)
    -> Result<T>;
}

#[async_trait]
pub trait AfterSaveCallback<T>: Send + Sync {
    async fn on_after_save(&self, entity: T, document: &Document, collection: &str) -> Result<T>;
}

#[async_trait]
pub trait AfterConvertCallback<T>: Send + Sync {
    async fn on_after_convert(&self, entity: T, document: &Document, collection: &str)
    -> Result<T>;
}

struct TypedCallbacks<T> {
    before_convert: Vec<Arc<dyn BeforeConvertCallback<T>>>,
    before_save: Vec<Arc<dyn BeforeSaveCallback<T>>>,
    after_save: Vec<Arc<dyn AfterSaveCallback<T>>>,
    after_convert: Vec<Arc<dyn AfterConvertCallback<T>>>,
}

impl<T> Default for TypedCallbacks<T> {
    fn default() -> Self {
        Self {
            before_convert: Vec::new(),
            before_save: Vec::new(),
            after_save: Vec::new(),
            after_convert: Vec::new(),
        }
    }
}

/// Registry of entity callbacks; phases without callbacks pass the entity through.
#[derive(Clone, Default)]
pub struct EntityCallbacks {
    by_type: Arc<HashMap<TypeId, Box<dyn Any + Send + Sync>>>,
}

impl EntityCallbacks {
    pub fn none() -> Self {
        Self::default()
    }

    pub fn builder() -> EntityCallbacksBuilder {
        EntityCallbacksBuilder::default()
    }

    pub fn is_empty(&self) -> bool {
        self.by_type.is_empty()
    }

    fn typed<T: 'static>(&self) -> Option<&TypedCallbacks<T>> {
        self.by_type
            .get(&TypeId::of::<T>())
            .and_then(|callbacks| callbacks.downcast_ref::<TypedCallbacks<T>>())
    }

    pub async fn before_convert<T: Send + 'static>(&self, entity: T, collection: &str) -> Result<T> {
        let Some(callbacks) = self.typed::<T>() else {
            return Ok(entity);
        };
        let mut entity = entity;
        for callback in &callbacks.before_convert {
            entity = callback.on_before_convert(entity, collection).await?;
        }
        event!(Level::TRACE, collection, count = callbacks.before_convert.len(), "before-convert callbacks applied");
        Ok(entity)
    }

    pub async fn before_save<T: Send + 'static>(
        &self,
        entity: T,
        document: &mut Document,
        collection: &str,
    ) -> Result<T> {
        let Some(callbacks) = self.typed::<T>() else {
            return Ok(entity);
        };
        let mut entity = entity;
        for callback in &callbacks.before_save {
            entity = callback.on_before_save(entity, document, collection).await?;
        }
        event!(Level::TRACE, collection, count = callbacks.before_save.len(), "before-save callbacks applied");
        Ok(entity)
    }

    pub async fn after_save<T: Send + 'static>(
        &self,
        entity: T,
        document: &Document,
        collection: &str,
    ) -> Result<T> {
        let Some(callbacks) = self.typed::<T>() else {
            return Ok(entity);
        };
        let mut entity = entity;
        for callback in &callbacks.after_save {
            entity = callback.on_after_save(entity, document, collection).await?;
        }
        Ok(entity)
    }

    pub async fn after_convert<T: Send + 'static>(
        &self,
        entity: T,
        document: &Document,
        collection: &str,
    ) -> Result<T> {
        let Some(callbacks) = self.typed::<T>() else {
            return Ok(entity);
        };
        let mut entity = entity;
        for callback in &callbacks.after_convert {
            entity = callback.on_after_convert(entity, document, collection).await?;
        }
        Ok(entity)
    }
}

#[derive(Default)]
pub struct EntityCallbacksBuilder {
    by_type: HashMap<TypeId, Box<dyn Any + Send + Sync>>,
}

impl EntityCallbacksBuilder {
    /// Adds to the callbacks of `T`, starting an empty set on first use.
    fn register<T: Send + 'static>(&mut self, add: impl FnOnce(&mut TypedCallbacks<T>)) {
        let key = TypeId::of::<T>();
        let mut typed = self
            .by_type
            .remove(&key)
            .and_then(|slot| slot.downcast::<TypedCallbacks<T>>().ok())
            .map(|slot| *slot)
            .unwrap_or_default();
        add(&mut typed);
        self.by_type.insert(key, Box::new(typed));
    }

    pub fn before_convert<T: Send + 'static>(
        mut self,
        callback: impl BeforeConvertCallback<T> + 'static,
    ) -> Self {
        self.register::<T>(|typed| typed.before_convert.push(Arc::new(callback)));
        self
    }

    pub fn before_save<T: Send + 'static>(
        mut self,
        callback: impl BeforeSaveCallback<T> + 'static,
    ) -> Self {
        self.register::<T>(|typed| typed.before_save.push(Arc::new(callback)));
        self
    }

    pub fn after_save<T: Send + 'static>(mut self, callback: impl AfterSaveCallback<T> + 'static) -> Self {
        self.register::<T>(|typed| typed.after_save.push(Arc::new(callback)));
        self
    }

    pub fn after_convert<T: Send + 'static>(
        mut self,
        callback: impl AfterConvertCallback<T> + 'static,
    ) -> Self {
        self.register::<T>(|typed| typed.after_convert.push(Arc::new(callback)));
        self
    }

    pub fn build(self) -> EntityCallbacks {
        EntityCallbacks {
            by_type: Arc::new(self.by_type),
        }
    }
}

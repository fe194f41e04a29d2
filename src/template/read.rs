use super::DocumentTemplate;
use crate::core::{Document, Query, Result};
use crate::driver::{CursorType, DocumentCursor, DriverResult, FindOptions};
use crate::event::{EventPhase, EventSource};
use crate::mapping::{Entity, EntityMetadata, ID_FIELD, Projection};
use futures::stream::{self, BoxStream};
use futures::{StreamExt, TryStreamExt};
use serde_json::Value;
use std::sync::Arc;
use tracing::{Instrument, Level, debug_span, event};

impl DocumentTemplate {
    /// Streams the matching entities. Nothing is sent to the store before the
    /// stream is first polled.
    pub fn find<T: Entity>(&self, query: &Query) -> BoxStream<'static, Result<T>> {
        match self.collection_name::<T>() {
            Ok(collection) => self.find_in(query, &collection),
            Err(err) => stream::iter([Err(err)]).boxed(),
        }
    }

    pub fn find_in<T: Entity>(&self, query: &Query, collection: &str) -> BoxStream<'static, Result<T>> {
        self.entity_stream(query, collection, CursorType::NonTailable)
    }

    /// Like [`DocumentTemplate::find`] over a tailable cursor of a capped collection.
    pub fn tail<T: Entity>(&self, query: &Query) -> BoxStream<'static, Result<T>> {
        match self.collection_name::<T>() {
            Ok(collection) => self.tail_in(query, &collection),
            Err(err) => stream::iter([Err(err)]).boxed(),
        }
    }

    pub fn tail_in<T: Entity>(&self, query: &Query, collection: &str) -> BoxStream<'static, Result<T>> {
        self.entity_stream(query, collection, CursorType::Tailable)
    }

    pub async fn find_one<T: Entity>(&self, query: &Query) -> Result<Option<T>> {
        let collection = self.collection_name::<T>()?;
        self.find_one_in(query, &collection).await
    }

    pub async fn find_one_in<T: Entity>(&self, query: &Query, collection: &str) -> Result<Option<T>> {
        let query = query.clone().limit(1);
        self.find_in::<T>(&query, collection).next().await.transpose()
    }

    /// `id` is the identity value as held by the entity.
    pub async fn find_by_id<T: Entity>(&self, id: Value) -> Result<Option<T>> {
        let collection = self.collection_name::<T>()?;
        self.find_by_id_in(id, &collection).await
    }

    pub async fn find_by_id_in<T: Entity>(&self, id: Value, collection: &str) -> Result<Option<T>> {
        let query = Query::by_field(ID_FIELD, id);
        self.find_one_in(&query, collection).await
    }

    /// Reads a closed projection `P` of entity `T`; only the projected
    /// properties are fetched.
    pub fn find_as<T: Entity, P: Projection>(&self, query: &Query) -> BoxStream<'static, Result<P>> {
        match self.collection_name::<T>() {
            Ok(collection) => self.find_as_in::<T, P>(query, &collection),
            Err(err) => stream::iter([Err(err)]).boxed(),
        }
    }

    pub fn find_as_in<T: Entity, P: Projection>(
        &self,
        query: &Query,
        collection: &str,
    ) -> BoxStream<'static, Result<P>> {
        let mut query = query.clone();
        let fields = projected_fields(query.fields(), P::properties());
        query.restrict_fields(fields);

        let metadata = match self.metadata::<T>() {
            Ok(metadata) => metadata,
            Err(err) => return stream::iter([Err(err)]).boxed(),
        };
        let cursor = match self.open_cursor(&query, &metadata, collection, CursorType::NonTailable) {
            Ok(cursor) => cursor,
            Err(err) => return stream::iter([Err(err)]).boxed(),
        };
        let template = self.clone();
        let collection = collection.to_string();
        cursor
            .then(move |raw| {
                let template = template.clone();
                let metadata = metadata.clone();
                let collection = collection.clone();
                async move { template.read_projection::<P>(raw, &metadata, &collection) }
            })
            .boxed()
    }

    pub async fn count<T: Entity>(&self, query: &Query) -> Result<u64> {
        let collection = self.collection_name::<T>()?;
        self.count_in::<T>(query, &collection).await
    }

    pub async fn count_in<T: Entity>(&self, query: &Query, collection: &str) -> Result<u64> {
        let metadata = self.metadata::<T>()?;
        let filter = self.codec().map_filter(query.filter(), Some(&metadata))?;
        let target = self.prepare_collection(collection, query.read_preference_override(), None);
        let span = debug_span!("template.count", collection, entity_type = metadata.type_name());
        self.driver()
            .count_documents(&target, filter, self.session())
            .instrument(span)
            .await
            .map_err(|err| self.translate(err))
    }

    pub async fn exists<T: Entity>(&self, query: &Query) -> Result<bool> {
        let collection = self.collection_name::<T>()?;
        self.exists_in::<T>(query, &collection).await
    }

    pub async fn exists_in<T: Entity>(&self, query: &Query, collection: &str) -> Result<bool> {
        let metadata = self.metadata::<T>()?;
        let mut query = query.clone().limit(1);
        query.restrict_fields(Document::from_iter([(
            metadata.id_property_name().to_string(),
            Value::from(1),
        )]));
        let mut cursor = self.open_cursor(&query, &metadata, collection, CursorType::NonTailable)?;
        match cursor.try_next().await {
            Ok(found) => Ok(found.is_some()),
            Err(err) => Err(self.translate(err)),
        }
    }

    fn entity_stream<T: Entity>(
        &self,
        query: &Query,
        collection: &str,
        cursor_type: CursorType,
    ) -> BoxStream<'static, Result<T>> {
        let metadata = match self.metadata::<T>() {
            Ok(metadata) => metadata,
            Err(err) => return stream::iter([Err(err)]).boxed(),
        };
        let cursor = match self.open_cursor(query, &metadata, collection, cursor_type) {
            Ok(cursor) => cursor,
            Err(err) => return stream::iter([Err(err)]).boxed(),
        };
        event!(Level::DEBUG, collection, entity_type = metadata.type_name(), ?cursor_type, "cursor opened");
        let template = self.clone();
        let collection = collection.to_string();
        cursor
            .then(move |raw| {
                let template = template.clone();
                let metadata = metadata.clone();
                let collection = collection.clone();
                async move {
                    let document = raw.map_err(|err| template.translate(err))?;
                    template.read_entity::<T>(document, &metadata, &collection).await
                }
            })
            .boxed()
    }

    pub(crate) fn open_cursor(
        &self,
        query: &Query,
        metadata: &EntityMetadata,
        collection: &str,
        cursor_type: CursorType,
    ) -> Result<DocumentCursor> {
        let filter = self.codec().map_filter(query.filter(), Some(metadata))?;
        let options = FindOptions {
            projection: query.fields().map(|f| self.codec().map_fields(f, Some(metadata))),
            sort: query.sort_spec().map(|s| self.codec().map_sort(s, Some(metadata))),
            skip: query.skip_count(),
            limit: query.limit_count(),
            collation: query.collation_spec().cloned(),
            cursor_type,
        };
        let target = self.prepare_collection(collection, query.read_preference_override(), None);
        Ok(self
            .driver()
            .find(&target, filter, options, self.session().cloned()))
    }

    /// after-load signal, decode, after-convert signal and callbacks.
    pub(crate) async fn read_entity<T: Entity>(
        &self,
        document: Document,
        metadata: &Arc<EntityMetadata>,
        collection: &str,
    ) -> Result<T> {
        let entity_type = metadata.type_name();
        self.emit(
            EventPhase::AfterLoad,
            || EventSource::Document(document.clone()),
            Some(&document),
            collection,
            entity_type,
        );
        let properties = self.codec().decode(document.clone(), metadata)?;
        let entity: T = serde_json::from_value(Value::Object(properties))?;
        self.emit_entity(EventPhase::AfterConvert, &entity, Some(&document), collection, entity_type);
        self.callbacks()
            .after_convert(entity, &document, collection)
            .await
    }

    fn read_projection<P: Projection>(
        &self,
        raw: DriverResult<Document>,
        metadata: &EntityMetadata,
        collection: &str,
    ) -> Result<P> {
        let document = raw.map_err(|err| self.translate(err))?;
        let entity_type = metadata.type_name();
        self.emit(
            EventPhase::AfterLoad,
            || EventSource::Document(document.clone()),
            Some(&document),
            collection,
            entity_type,
        );
        let properties = self.codec().decode(document.clone(), metadata)?;
        let snapshot = Value::Object(properties);
        let projection = serde_json::from_value(snapshot.clone())?;
        self.emit(
            EventPhase::AfterConvert,
            || EventSource::Entity(snapshot),
            Some(&document),
            collection,
            entity_type,
        );
        Ok(projection)
    }
}

/// Projected properties, narrowed to the fields the query already selects.
fn projected_fields(selected: Option<&Document>, properties: &[&str]) -> Document {
    properties
        .iter()
        .filter(|property| selected.map(|s| s.contains_key(**property)).unwrap_or(true))
        .map(|property| ((*property).to_string(), Value::from(1)))
        .collect()
}

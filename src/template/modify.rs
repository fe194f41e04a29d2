use super::DocumentTemplate;
use crate::core::{Collation, DbError, Document, Query, Result, Update};
use crate::driver::{FindOneAndModifyOptions, ReturnDocument};
use crate::event::{EventPhase, EventSource};
use crate::mapping::{Entity, EntityAdapter, EntityMetadata, ID_FIELD};
use futures::TryStreamExt;
use serde_json::Value;
use std::sync::Arc;
use tracing::{Instrument, Level, debug_span, event};

#[derive(Debug, Clone, Default, PartialEq)]
pub struct FindAndModifyOptions {
    return_new: bool,
    upsert: bool,
    remove: bool,
    collation: Option<Collation>,
}

impl FindAndModifyOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Return the document as modified instead of as found.
    pub fn return_new(mut self, return_new: bool) -> Self {
        self.return_new = return_new;
        self
    }

    pub fn upsert(mut self, upsert: bool) -> Self {
        self.upsert = upsert;
        self
    }

    /// Delete the matched document instead of updating it.
    pub fn remove(mut self, remove: bool) -> Self {
        self.remove = remove;
        self
    }

    pub fn collation(mut self, collation: Collation) -> Self {
        self.collation = Some(collation);
        self
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FindAndReplaceOptions {
    return_new: bool,
    upsert: bool,
}

impl FindAndReplaceOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn return_new(mut self, return_new: bool) -> Self {
        self.return_new = return_new;
        self
    }

    pub fn upsert(mut self, upsert: bool) -> Self {
        self.upsert = upsert;
        self
    }
}

fn return_document(return_new: bool) -> ReturnDocument {
    if return_new {
        ReturnDocument::After
    } else {
        ReturnDocument::Before
    }
}

impl DocumentTemplate {
    pub async fn find_and_modify<T: Entity>(
        &self,
        query: &Query,
        update: &Update,
        options: &FindAndModifyOptions,
    ) -> Result<Option<T>> {
        let collection = self.collection_name::<T>()?;
        self.find_and_modify_in(query, update, options, &collection).await
    }

    /// Atomically updates the first match and returns it, as found or as
    /// modified depending on `options`.
    pub async fn find_and_modify_in<T: Entity>(
        &self,
        query: &Query,
        update: &Update,
        options: &FindAndModifyOptions,
        collection: &str,
    ) -> Result<Option<T>> {
        if query.collation_spec().is_some() && options.collation.is_some() {
            return Err(DbError::InvalidUsage(
                "Both Query and FindAndModifyOptions define a collation; specify it in only one place"
                    .to_string(),
            ));
        }
        let metadata = self.metadata::<T>()?;
        let span = debug_span!(
            "template.find_and_modify",
            collection,
            entity_type = metadata.type_name()
        );
        async move {
            let collation = options
                .collation
                .clone()
                .or_else(|| query.collation_spec().cloned());
            if options.remove {
                return self
                    .find_one_and_delete::<T>(query, collation, &metadata, collection)
                    .await;
            }
            let update = self.versioned_update(update, &metadata)?;
            if !update.is_operator_update() {
                return Err(DbError::InvalidUsage(
                    "find_and_modify requires update operators; use find_and_replace for replacement documents"
                        .to_string(),
                ));
            }
            let filter = self.codec().map_filter(query.filter(), Some(&metadata))?;
            let mapped_update = self.codec().map_update(update.document(), Some(&metadata))?;
            let driver_options = FindOneAndModifyOptions {
                projection: self.mapped_fields(query, &metadata),
                sort: self.mapped_sort(query, &metadata),
                upsert: options.upsert,
                return_document: return_document(options.return_new),
                collation,
            };
            let target = self.prepare_collection(collection, None, None);
            event!(Level::DEBUG, "find and modify");
            let found = self
                .driver()
                .find_one_and_update(&target, filter, mapped_update, driver_options, self.session())
                .await
                .map_err(|err| self.translate(err))?;
            match found {
                Some(document) => Ok(Some(self.read_entity(document, &metadata, collection).await?)),
                None => Ok(None),
            }
        }
        .instrument(span)
        .await
    }

    pub async fn find_and_replace<T: Entity>(
        &self,
        query: &Query,
        replacement: T,
        options: FindAndReplaceOptions,
    ) -> Result<Option<T>> {
        let collection = self.collection_name::<T>()?;
        self.find_and_replace_in(query, replacement, options, &collection)
            .await
    }

    /// Replaces the first match with `replacement`. The replacement runs the
    /// convert/save phases; the returned document runs the read phases.
    ///
    /// With `versioned_find_and_replace` configured, a versioned replacement
    /// only matches its current version and is stored with the next one; a
    /// miss on a document that does exist is an optimistic-lock failure.
    pub async fn find_and_replace_in<T: Entity>(
        &self,
        query: &Query,
        replacement: T,
        options: FindAndReplaceOptions,
        collection: &str,
    ) -> Result<Option<T>> {
        let metadata = self.metadata::<T>()?;
        let span = debug_span!(
            "template.find_and_replace",
            collection,
            entity_type = metadata.type_name()
        );
        async move {
            let mut adapter = EntityAdapter::from_entity(&replacement, metadata.clone())?;
            let base_filter = self.codec().map_filter(query.filter(), Some(&metadata))?;
            let mut filter = base_filter.clone();

            let locked_version = match (
                self.config().versioned_find_and_replace,
                metadata.version_field(),
                adapter.version(),
            ) {
                (true, Some(field), Some(version)) => {
                    filter.insert(field, Value::from(version));
                    adapter.increment_version()?;
                    Some(version)
                }
                _ => None,
            };
            let id = adapter.id_display();
            let replacement: T = if locked_version.is_some() {
                adapter.into_entity()?
            } else {
                replacement
            };

            let (replacement, document) =
                self.convert_for_write(replacement, &metadata, collection).await?;
            let mut body = document.clone();
            body.remove(ID_FIELD);

            // Version-locked replaces upsert only once a miss is known not to be a stale version.
            let driver_options = FindOneAndModifyOptions {
                projection: self.mapped_fields(query, &metadata),
                sort: self.mapped_sort(query, &metadata),
                upsert: options.upsert && locked_version.is_none(),
                return_document: return_document(options.return_new),
                collation: query.collation_spec().cloned(),
            };
            let target = self.prepare_collection(collection, None, None);
            event!(Level::DEBUG, "find and replace");
            let mut found = self
                .driver()
                .find_one_and_replace(&target, filter, body.clone(), driver_options.clone(), self.session())
                .await
                .map_err(|err| self.translate(err))?;

            if let (None, Some(version)) = (&found, locked_version) {
                let existing = self
                    .driver()
                    .count_documents(&target, base_filter.clone(), self.session())
                    .await
                    .map_err(|err| self.translate(err))?;
                if existing > 0 {
                    event!(Level::WARN, id = %id, version, "optimistic lock conflict on replace");
                    return Err(DbError::OptimisticLockingFailure {
                        entity: metadata.type_name().to_string(),
                        collection: collection.to_string(),
                        id,
                        version,
                    });
                }
                if options.upsert {
                    event!(Level::DEBUG, "no document matched, upserting replacement");
                    let upsert_options = FindOneAndModifyOptions {
                        upsert: true,
                        ..driver_options
                    };
                    found = self
                        .driver()
                        .find_one_and_replace(&target, base_filter, body, upsert_options, self.session())
                        .await
                        .map_err(|err| self.translate(err))?;
                }
            }

            self.emit_entity(
                EventPhase::AfterSave,
                &replacement,
                Some(&document),
                collection,
                metadata.type_name(),
            );
            self.callbacks()
                .after_save(replacement, &document, collection)
                .await?;

            match found {
                Some(found) => Ok(Some(self.read_entity(found, &metadata, collection).await?)),
                None => Ok(None),
            }
        }
        .instrument(span)
        .await
    }

    pub async fn find_and_remove<T: Entity>(&self, query: &Query) -> Result<Option<T>> {
        let collection = self.collection_name::<T>()?;
        self.find_and_remove_in(query, &collection).await
    }

    pub async fn find_and_remove_in<T: Entity>(&self, query: &Query, collection: &str) -> Result<Option<T>> {
        let metadata = self.metadata::<T>()?;
        let span = debug_span!(
            "template.find_and_remove",
            collection,
            entity_type = metadata.type_name()
        );
        self.find_one_and_delete::<T>(query, query.collation_spec().cloned(), &metadata, collection)
            .instrument(span)
            .await
    }

    pub async fn find_all_and_remove<T: Entity>(&self, query: &Query) -> Result<Vec<T>> {
        let collection = self.collection_name::<T>()?;
        self.find_all_and_remove_in(query, &collection).await
    }

    /// Reads every match, then removes exactly the documents that were read.
    pub async fn find_all_and_remove_in<T: Entity>(&self, query: &Query, collection: &str) -> Result<Vec<T>> {
        let metadata = self.metadata::<T>()?;
        let found: Vec<T> = self.find_in::<T>(query, collection).try_collect().await?;
        if found.is_empty() {
            return Ok(found);
        }
        let mut ids = Vec::with_capacity(found.len());
        for entity in &found {
            let adapter = EntityAdapter::from_entity(entity, metadata.clone())?;
            if let Some(id) = adapter.id() {
                ids.push(id.clone());
            }
        }
        let mut filter = Document::new();
        filter.insert(
            ID_FIELD.to_string(),
            Value::Object(Document::from_iter([("$in".to_string(), Value::Array(ids))])),
        );
        let span = debug_span!(
            "template.find_all_and_remove",
            collection,
            entity_type = metadata.type_name(),
            count = found.len()
        );
        self.delete_matching(filter, &metadata, collection)
            .instrument(span)
            .await?;
        Ok(found)
    }

    async fn find_one_and_delete<T: Entity>(
        &self,
        query: &Query,
        collation: Option<Collation>,
        metadata: &Arc<EntityMetadata>,
        collection: &str,
    ) -> Result<Option<T>> {
        let filter = self.codec().map_filter(query.filter(), Some(metadata))?;
        let entity_type = metadata.type_name();
        self.emit(
            EventPhase::BeforeDelete,
            || EventSource::Query(filter.clone()),
            None,
            collection,
            entity_type,
        );
        let driver_options = FindOneAndModifyOptions {
            projection: self.mapped_fields(query, metadata),
            sort: self.mapped_sort(query, metadata),
            collation,
            ..FindOneAndModifyOptions::default()
        };
        let target = self.prepare_collection(collection, None, None);
        event!(Level::DEBUG, "find and remove");
        let found = self
            .driver()
            .find_one_and_delete(&target, filter.clone(), driver_options, self.session())
            .await
            .map_err(|err| self.translate(err))?;
        self.emit(
            EventPhase::AfterDelete,
            || EventSource::Query(filter),
            None,
            collection,
            entity_type,
        );
        match found {
            Some(document) => Ok(Some(self.read_entity(document, metadata, collection).await?)),
            None => Ok(None),
        }
    }

    fn mapped_fields(&self, query: &Query, metadata: &EntityMetadata) -> Option<Document> {
        query
            .fields()
            .map(|fields| self.codec().map_fields(fields, Some(metadata)))
    }

    fn mapped_sort(&self, query: &Query, metadata: &EntityMetadata) -> Option<Document> {
        query
            .sort_spec()
            .map(|sort| self.codec().map_sort(sort, Some(metadata)))
    }
}

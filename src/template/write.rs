use super::DocumentTemplate;
use super::shard::ShardKeyResolver;
use super::write_concern::{WriteAction, WriteActionKind};
use crate::core::{DbError, Document, Query, Result, Update};
use crate::driver::{DeleteResult, UpdateOptions, UpdateResult};
use crate::event::{EventPhase, EventSource};
use crate::mapping::{Entity, EntityAdapter, EntityMetadata, ID_FIELD};
use serde_json::Value;
use std::sync::Arc;
use tracing::{Instrument, Level, debug_span, event};

impl DocumentTemplate {
    pub async fn insert<T: Entity>(&self, entity: T) -> Result<T> {
        let collection = self.collection_name::<T>()?;
        self.insert_in(entity, &collection).await
    }

    pub async fn insert_in<T: Entity>(&self, entity: T, collection: &str) -> Result<T> {
        let metadata = self.metadata::<T>()?;
        let span = debug_span!("template.insert", collection, entity_type = metadata.type_name());
        self.insert_entity(entity, metadata, collection)
            .instrument(span)
            .await
    }

    pub async fn insert_all<T: Entity>(&self, entities: Vec<T>) -> Result<Vec<T>> {
        let collection = self.collection_name::<T>()?;
        self.insert_all_in(entities, &collection).await
    }

    /// Batch insert; every entity runs its own convert/save phases and gets
    /// its generated identity back in input order.
    pub async fn insert_all_in<T: Entity>(&self, entities: Vec<T>, collection: &str) -> Result<Vec<T>> {
        let metadata = self.metadata::<T>()?;
        let span = debug_span!(
            "template.insert_all",
            collection,
            entity_type = metadata.type_name(),
            count = entities.len()
        );
        async move {
            if entities.is_empty() {
                return Ok(Vec::new());
            }
            let mut prepared = Vec::with_capacity(entities.len());
            for entity in entities {
                let entity = self.prepare_insert(entity, &metadata)?;
                prepared.push(self.convert_for_write(entity, &metadata, collection).await?);
            }

            let documents: Vec<Document> = prepared.iter().map(|(_, doc)| doc.clone()).collect();
            let write_concern = self.resolve_write_concern(
                WriteAction::new(WriteActionKind::InsertList, collection)
                    .entity_type(metadata.type_name()),
            );
            let target = self.prepare_collection(collection, None, write_concern);
            event!(Level::DEBUG, count = documents.len(), "inserting documents");
            let result = self
                .driver()
                .insert_many(&target, documents, self.session())
                .await
                .map_err(|err| self.translate(err))?;
            self.check_acknowledged(result.acknowledged, "insert_all", collection)?;

            let mut saved = Vec::with_capacity(prepared.len());
            let mut ids = result.inserted_ids.into_iter();
            for (entity, document) in prepared {
                let generated = ids.next();
                saved.push(
                    self.complete_save(entity, &metadata, document, generated, collection)
                        .await?,
                );
            }
            Ok(saved)
        }
        .instrument(span)
        .await
    }

    /// Inserts new entities and replaces existing ones. Versioned types are
    /// saved under optimistic locking.
    pub async fn save<T: Entity>(&self, entity: T) -> Result<T> {
        let collection = self.collection_name::<T>()?;
        self.save_in(entity, &collection).await
    }

    pub async fn save_in<T: Entity>(&self, entity: T, collection: &str) -> Result<T> {
        let metadata = self.metadata::<T>()?;
        let span = debug_span!(
            "template.save",
            collection,
            entity_type = metadata.type_name(),
            versioned = metadata.is_versioned()
        );
        if metadata.is_versioned() {
            self.save_versioned(entity, metadata, collection)
                .instrument(span)
                .await
        } else {
            self.save_plain(entity, metadata, collection)
                .instrument(span)
                .await
        }
    }

    pub async fn update_first<T: Entity>(&self, query: &Query, update: &Update) -> Result<UpdateResult> {
        let collection = self.collection_name::<T>()?;
        self.update_first_in::<T>(query, update, &collection).await
    }

    pub async fn update_first_in<T: Entity>(
        &self,
        query: &Query,
        update: &Update,
        collection: &str,
    ) -> Result<UpdateResult> {
        self.do_update::<T>(query, update, collection, false, false).await
    }

    pub async fn update_multi<T: Entity>(&self, query: &Query, update: &Update) -> Result<UpdateResult> {
        let collection = self.collection_name::<T>()?;
        self.update_multi_in::<T>(query, update, &collection).await
    }

    pub async fn update_multi_in<T: Entity>(
        &self,
        query: &Query,
        update: &Update,
        collection: &str,
    ) -> Result<UpdateResult> {
        self.do_update::<T>(query, update, collection, false, true).await
    }

    pub async fn upsert<T: Entity>(&self, query: &Query, update: &Update) -> Result<UpdateResult> {
        let collection = self.collection_name::<T>()?;
        self.upsert_in::<T>(query, update, &collection).await
    }

    pub async fn upsert_in<T: Entity>(
        &self,
        query: &Query,
        update: &Update,
        collection: &str,
    ) -> Result<UpdateResult> {
        self.do_update::<T>(query, update, collection, true, false).await
    }

    /// Removes one entity by identity; versioned entities only match their
    /// current version.
    pub async fn remove<T: Entity>(&self, entity: &T) -> Result<DeleteResult> {
        let collection = self.collection_name::<T>()?;
        self.remove_in(entity, &collection).await
    }

    pub async fn remove_in<T: Entity>(&self, entity: &T, collection: &str) -> Result<DeleteResult> {
        let metadata = self.metadata::<T>()?;
        let adapter = EntityAdapter::from_entity(entity, metadata.clone())?;
        let filter = adapter.remove_filter()?;
        let span = debug_span!("template.remove", collection, entity_type = metadata.type_name());
        self.delete_matching(filter, &metadata, collection)
            .instrument(span)
            .await
    }

    pub async fn remove_matching<T: Entity>(&self, query: &Query) -> Result<DeleteResult> {
        let collection = self.collection_name::<T>()?;
        self.remove_matching_in::<T>(query, &collection).await
    }

    pub async fn remove_matching_in<T: Entity>(
        &self,
        query: &Query,
        collection: &str,
    ) -> Result<DeleteResult> {
        let metadata = self.metadata::<T>()?;
        let filter = self.codec().map_filter(query.filter(), Some(&metadata))?;
        let span = debug_span!(
            "template.remove_matching",
            collection,
            entity_type = metadata.type_name()
        );
        self.delete_matching(filter, &metadata, collection)
            .instrument(span)
            .await
    }

    /// Identity check and version initialization ahead of an insert.
    pub(crate) fn prepare_insert<T: Entity>(&self, entity: T, metadata: &Arc<EntityMetadata>) -> Result<T> {
        let mut adapter = EntityAdapter::from_entity(&entity, metadata.clone())?;
        adapter.assert_id_settable_or_autogenerable()?;
        if adapter.is_versioned() && adapter.version().is_none() {
            adapter.initialize_version();
            return adapter.into_entity();
        }
        Ok(entity)
    }

    pub(crate) async fn insert_entity<T: Entity>(
        &self,
        entity: T,
        metadata: Arc<EntityMetadata>,
        collection: &str,
    ) -> Result<T> {
        let entity = self.prepare_insert(entity, &metadata)?;
        let (entity, document) = self.convert_for_write(entity, &metadata, collection).await?;

        let write_concern = self.resolve_write_concern(
            WriteAction::new(WriteActionKind::Insert, collection)
                .entity_type(metadata.type_name())
                .document(&document),
        );
        let target = self.prepare_collection(collection, None, write_concern);
        event!(Level::DEBUG, "inserting document");
        let result = self
            .driver()
            .insert_one(&target, document.clone(), self.session())
            .await
            .map_err(|err| self.translate(err))?;
        self.check_acknowledged(result.acknowledged, "insert", collection)?;

        self.complete_save(entity, &metadata, document, Some(result.inserted_id), collection)
            .await
    }

    /// before-convert signal and callbacks, encode, before-save signal and callbacks.
    pub(crate) async fn convert_for_write<T: Entity>(
        &self,
        entity: T,
        metadata: &Arc<EntityMetadata>,
        collection: &str,
    ) -> Result<(T, Document)> {
        let entity_type = metadata.type_name();
        self.emit_entity(EventPhase::BeforeConvert, &entity, None, collection, entity_type);
        let entity = self.callbacks().before_convert(entity, collection).await?;

        let properties = EntityAdapter::from_entity(&entity, metadata.clone())?.into_properties();
        let mut document = self.codec().encode(properties, metadata)?;

        self.emit_entity(EventPhase::BeforeSave, &entity, Some(&document), collection, entity_type);
        let entity = self
            .callbacks()
            .before_save(entity, &mut document, collection)
            .await?;
        Ok((entity, document))
    }

    /// Populates a store-generated identity, then after-save signal and callbacks.
    pub(crate) async fn complete_save<T: Entity>(
        &self,
        entity: T,
        metadata: &Arc<EntityMetadata>,
        mut document: Document,
        generated_id: Option<Value>,
        collection: &str,
    ) -> Result<T> {
        let entity = match generated_id {
            Some(id) if !id.is_null() => {
                let mut adapter = EntityAdapter::from_entity(&entity, metadata.clone())?;
                if adapter.id().is_none() {
                    document.entry(ID_FIELD).or_insert_with(|| id.clone());
                    adapter.populate_id(id);
                    adapter.into_entity()?
                } else {
                    entity
                }
            }
            _ => entity,
        };
        self.emit_entity(
            EventPhase::AfterSave,
            &entity,
            Some(&document),
            collection,
            metadata.type_name(),
        );
        self.callbacks().after_save(entity, &document, collection).await
    }

    async fn save_plain<T: Entity>(
        &self,
        entity: T,
        metadata: Arc<EntityMetadata>,
        collection: &str,
    ) -> Result<T> {
        let adapter = EntityAdapter::from_entity(&entity, metadata.clone())?;
        if adapter.id().is_none() {
            return self.insert_entity(entity, metadata, collection).await;
        }

        let (entity, document) = self.convert_for_write(entity, &metadata, collection).await?;
        // Callbacks may have changed the identity; address what is written.
        let filter = EntityAdapter::from_entity(&entity, metadata.clone())?.by_id_filter()?;
        let mut replacement = document.clone();
        replacement.remove(ID_FIELD);

        let write_concern = self.resolve_write_concern(
            WriteAction::new(WriteActionKind::Save, collection)
                .entity_type(metadata.type_name())
                .document(&document)
                .query(&filter),
        );
        let target = self.prepare_collection(collection, None, write_concern);
        let filter = ShardKeyResolver::new(self, &target)
            .resolve(filter, &metadata, &document)
            .await?;

        event!(Level::DEBUG, "replacing document with upsert");
        let options = UpdateOptions {
            upsert: true,
            collation: None,
        };
        let result = self
            .driver()
            .replace_one(&target, filter, replacement, options, self.session())
            .await
            .map_err(|err| self.translate(err))?;
        self.check_acknowledged(result.acknowledged, "save", collection)?;

        self.complete_save(entity, &metadata, document, result.upserted_id, collection)
            .await
    }

    async fn do_update<T: Entity>(
        &self,
        query: &Query,
        update: &Update,
        collection: &str,
        upsert: bool,
        multi: bool,
    ) -> Result<UpdateResult> {
        let metadata = self.metadata::<T>()?;
        let span = debug_span!(
            "template.update",
            collection,
            entity_type = metadata.type_name(),
            upsert,
            multi
        );
        async move {
            let update = self.versioned_update(update, &metadata)?;
            let filter = self.codec().map_filter(query.filter(), Some(&metadata))?;
            let mapped_update = self.codec().map_update(update.document(), Some(&metadata))?;

            let write_concern = self.resolve_write_concern(
                WriteAction::new(WriteActionKind::Update, collection)
                    .entity_type(metadata.type_name())
                    .query(&filter)
                    .document(&mapped_update),
            );
            let target = self.prepare_collection(collection, None, write_concern);
            let options = UpdateOptions {
                upsert,
                collation: query.collation_spec().cloned(),
            };

            let outcome = if update.is_operator_update() {
                event!(Level::DEBUG, "updating documents");
                if multi {
                    self.driver()
                        .update_many(&target, filter, mapped_update, options, self.session())
                        .await
                } else {
                    self.driver()
                        .update_one(&target, filter, mapped_update, options, self.session())
                        .await
                }
            } else {
                if multi {
                    return Err(DbError::InvalidUsage(
                        "A multi update requires update operators, not a replacement document"
                            .to_string(),
                    ));
                }
                let filter = ShardKeyResolver::new(self, &target)
                    .resolve(filter, &metadata, &mapped_update)
                    .await?;
                event!(Level::DEBUG, "replacing document");
                self.driver()
                    .replace_one(&target, filter, mapped_update, options, self.session())
                    .await
            };
            let result = outcome.map_err(|err| self.translate(err))?;

            self.check_acknowledged(result.acknowledged, "update", collection)?;
            Ok(result)
        }
        .instrument(span)
        .await
    }

    /// Adds a version increment to operator updates of versioned types that
    /// do not set the version themselves.
    pub(crate) fn versioned_update(&self, update: &Update, metadata: &EntityMetadata) -> Result<Update> {
        if update.document().is_empty() {
            return Err(DbError::InvalidUsage("Update must not be empty".to_string()));
        }
        match metadata.version_property_name() {
            Some(version) if update.is_operator_update() && !update.modifies(version) => {
                Ok(update.clone().inc(version, 1))
            }
            _ => Ok(update.clone()),
        }
    }

    pub(crate) async fn delete_matching(
        &self,
        filter: Document,
        metadata: &EntityMetadata,
        collection: &str,
    ) -> Result<DeleteResult> {
        let entity_type = metadata.type_name();
        self.emit(
            EventPhase::BeforeDelete,
            || EventSource::Query(filter.clone()),
            None,
            collection,
            entity_type,
        );

        let write_concern = self.resolve_write_concern(
            WriteAction::new(WriteActionKind::Remove, collection)
                .entity_type(entity_type)
                .query(&filter),
        );
        let target = self.prepare_collection(collection, None, write_concern);
        event!(Level::DEBUG, "removing documents");
        let result = self
            .driver()
            .delete_many(&target, filter.clone(), self.session())
            .await
            .map_err(|err| self.translate(err))?;
        self.check_acknowledged(result.acknowledged, "remove", collection)?;

        self.emit(
            EventPhase::AfterDelete,
            || EventSource::Query(filter),
            None,
            collection,
            entity_type,
        );
        Ok(result)
    }
}

use super::DocumentTemplate;
use super::shard::ShardKeyResolver;
use super::write_concern::{WriteAction, WriteActionKind};
use crate::core::{DbError, Result};
use crate::driver::{UpdateOptions, UpdateResult};
use crate::mapping::{Entity, EntityAdapter, EntityMetadata, ID_FIELD};
use std::sync::Arc;
use tracing::{Level, event};

/// Progress of one versioned save.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SaveState {
    /// No version yet: the entity is inserted with version 0.
    New,
    /// Stored at `version`: replaced under a version-qualified filter.
    Existing { version: i64 },
    /// The replacement hit the expected version.
    Matched,
    /// Nothing matched the version-qualified filter.
    Conflict,
}

impl SaveState {
    pub fn of(adapter: &EntityAdapter) -> Self {
        match adapter.version() {
            Some(version) if !adapter.is_new() => SaveState::Existing { version },
            _ => SaveState::New,
        }
    }

    /// Outcome of the replacement. Unacknowledged writes carry no match count
    /// and never count as a conflict; neither does a filter that lost its
    /// version predicate.
    pub fn after_replace(result: &UpdateResult, filter_has_version: bool) -> Self {
        if result.acknowledged && result.matched_count == 0 && filter_has_version {
            SaveState::Conflict
        } else {
            SaveState::Matched
        }
    }
}

impl DocumentTemplate {
    pub(crate) async fn save_versioned<T: Entity>(
        &self,
        entity: T,
        metadata: Arc<EntityMetadata>,
        collection: &str,
    ) -> Result<T> {
        let mut adapter = EntityAdapter::from_entity(&entity, metadata.clone())?;
        let version = match SaveState::of(&adapter) {
            SaveState::Existing { version } => version,
            _ => {
                event!(Level::DEBUG, "versioned entity is new, inserting");
                return self.insert_entity(entity, metadata, collection).await;
            }
        };

        let query = adapter.version_filter()?;
        let id = adapter.id_display();
        adapter.increment_version()?;
        let entity: T = adapter.into_entity()?;

        let (entity, document) = self.convert_for_write(entity, &metadata, collection).await?;
        let mut replacement = document.clone();
        replacement.remove(ID_FIELD);

        let write_concern = self.resolve_write_concern(
            WriteAction::new(WriteActionKind::Save, collection)
                .entity_type(metadata.type_name())
                .document(&document)
                .query(&query),
        );
        let target = self.prepare_collection(collection, None, write_concern);
        let filter = ShardKeyResolver::new(self, &target)
            .resolve(query, &metadata, &document)
            .await?;
        let filter_has_version = metadata
            .version_field()
            .map(|field| filter.contains_key(&field))
            .unwrap_or(false);

        event!(Level::DEBUG, version, "replacing versioned document");
        let options = UpdateOptions {
            upsert: false,
            collation: None,
        };
        let result = self
            .driver()
            .replace_one(&target, filter, replacement, options, self.session())
            .await
            .map_err(|err| self.translate(err))?;
        self.check_acknowledged(result.acknowledged, "save", collection)?;

        match SaveState::after_replace(&result, filter_has_version) {
            SaveState::Conflict => {
                event!(Level::WARN, id = %id, version, "optimistic lock conflict");
                Err(DbError::OptimisticLockingFailure {
                    entity: metadata.type_name().to_string(),
                    collection: collection.to_string(),
                    id,
                    version,
                })
            }
            _ => {
                self.complete_save(entity, &metadata, document, None, collection)
                    .await
            }
        }
    }
}

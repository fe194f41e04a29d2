use super::DocumentTemplate;
use crate::core::{DbError, Document, Result};
use crate::driver::matcher::get_path;
use crate::driver::{FindOptions, PreparedCollection};
use crate::mapping::EntityMetadata;
use futures::StreamExt;
use serde_json::Value;
use tracing::{Level, event};

/// Whether a single-document write on a sharded collection needs its filter
/// completed with shard-key values.
pub fn requires_shard_key(filter: &Document, metadata: &EntityMetadata, multi: bool) -> bool {
    if multi || !metadata.is_sharded() || metadata.is_sharded_by_id() {
        return false;
    }
    metadata
        .shard_key_fields()
        .iter()
        .any(|field| !filter.contains_key(field))
}

/// Completes replacement filters with the shard key of the target document.
pub struct ShardKeyResolver<'a> {
    template: &'a DocumentTemplate,
    collection: &'a PreparedCollection,
}

impl<'a> ShardKeyResolver<'a> {
    pub fn new(template: &'a DocumentTemplate, collection: &'a PreparedCollection) -> Self {
        Self {
            template,
            collection,
        }
    }

    /// Immutable keys are copied from `candidate`. Mutable keys are read back
    /// from the stored document with one point read, falling back to
    /// `candidate` when nothing is stored yet.
    pub async fn resolve(
        &self,
        filter: Document,
        metadata: &EntityMetadata,
        candidate: &Document,
    ) -> Result<Document> {
        if !requires_shard_key(&filter, metadata, false) {
            return Ok(filter);
        }
        let fields = metadata.shard_key_fields();
        let immutable = metadata
            .shard_key_spec()
            .map(|key| key.is_immutable())
            .unwrap_or(false);

        let stored = if immutable {
            None
        } else {
            self.read_stored_key(&filter, &fields).await?
        };

        let mut filter = filter;
        for field in &fields {
            if filter.contains_key(field) {
                continue;
            }
            let value = stored
                .as_ref()
                .and_then(|doc| get_path(doc, field))
                .or_else(|| get_path(candidate, field));
            if let Some(value) = value {
                filter.insert(field.clone(), value.clone());
            }
        }

        if let Some(missing) = fields.iter().find(|field| !filter.contains_key(*field)) {
            return Err(DbError::InvalidUsage(format!(
                "Shard key {} not fully contained in filter {} for collection '{}'; missing '{}'",
                fields.join(", "),
                Value::Object(filter.clone()),
                self.collection.name,
                missing
            )));
        }
        event!(
            Level::DEBUG,
            collection = %self.collection.name,
            immutable,
            "shard key added to replacement filter"
        );
        Ok(filter)
    }

    async fn read_stored_key(&self, filter: &Document, fields: &[String]) -> Result<Option<Document>> {
        let projection: Document = fields
            .iter()
            .map(|field| (field.clone(), Value::from(1)))
            .collect();
        let options = FindOptions {
            projection: Some(projection),
            limit: Some(1),
            ..FindOptions::default()
        };
        let mut cursor = self.template.driver().find(
            self.collection,
            filter.clone(),
            options,
            self.template.session().cloned(),
        );
        match cursor.next().await {
            Some(Ok(document)) => Ok(Some(document)),
            Some(Err(err)) => Err(self.template.translate(err)),
            None => Ok(None),
        }
    }
}

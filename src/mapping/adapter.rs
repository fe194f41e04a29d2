use super::metadata::{EntityMetadata, ID_FIELD, IdGeneration};
use crate::core::types::json_type_name;
use crate::core::{DbError, Document, Result};
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::sync::Arc;

/// Property-level view of one entity together with its metadata.
///
/// The adapter owns the serialized entity, so version increments and id
/// population never touch the caller's value; they produce a new one when
/// converted back with [`EntityAdapter::into_entity`].
#[derive(Debug, Clone)]
pub struct EntityAdapter {
    properties: Document,
    metadata: Arc<EntityMetadata>,
}

impl EntityAdapter {
    pub fn from_entity<T: Serialize>(entity: &T, metadata: Arc<EntityMetadata>) -> Result<Self> {
        Self::from_value(serde_json::to_value(entity)?, metadata)
    }

    /// Rejects collection-like values where a single entity is expected.
    pub fn from_value(value: Value, metadata: Arc<EntityMetadata>) -> Result<Self> {
        match value {
            Value::Object(properties) => Ok(Self {
                properties,
                metadata,
            }),
            Value::Array(_) => Err(DbError::InvalidUsage(format!(
                "Cannot use a collection of {} as single entity; use the batch operations instead",
                metadata.type_name()
            ))),
            other => Err(DbError::InvalidUsage(format!(
                "Entity {} must serialize to a document, got {}",
                metadata.type_name(),
                json_type_name(&other)
            ))),
        }
    }

    pub fn into_entity<T: DeserializeOwned>(self) -> Result<T> {
        Ok(serde_json::from_value(Value::Object(self.properties))?)
    }

    pub fn metadata(&self) -> &EntityMetadata {
        &self.metadata
    }

    pub fn properties(&self) -> &Document {
        &self.properties
    }

    pub fn into_properties(self) -> Document {
        self.properties
    }

    pub fn id(&self) -> Option<&Value> {
        self.properties
            .get(self.metadata.id_property_name())
            .filter(|id| !id.is_null())
    }

    pub fn is_versioned(&self) -> bool {
        self.metadata.is_versioned()
    }

    pub fn version(&self) -> Option<i64> {
        let property = self.metadata.version_property_name()?;
        self.properties.get(property).and_then(Value::as_i64)
    }

    /// Unset identity, or unset version on a versioned type.
    pub fn is_new(&self) -> bool {
        self.id().is_none() || (self.is_versioned() && self.version().is_none())
    }

    /// Sets the version to 0 when the type is versioned and no version is set yet.
    pub fn initialize_version(&mut self) -> Option<i64> {
        let property = self.metadata.version_property_name()?.to_string();
        if let Some(current) = self.version() {
            return Some(current);
        }
        self.properties.insert(property, Value::from(0));
        Some(0)
    }

    /// Bumps the version by one and returns the new value.
    pub fn increment_version(&mut self) -> Result<i64> {
        let Some(property) = self.metadata.version_property_name().map(str::to_string) else {
            return Err(DbError::InvalidUsage(format!(
                "Entity {} is not versioned",
                self.metadata.type_name()
            )));
        };
        let current = self.version().unwrap_or(0);
        let next = current.checked_add(1).ok_or_else(|| {
            DbError::InvalidUsage(format!("Version of {} overflows", self.metadata.type_name()))
        })?;
        self.properties.insert(property, Value::from(next));
        Ok(next)
    }

    pub fn assert_id_settable_or_autogenerable(&self) -> Result<()> {
        if self.id().is_some() {
            return Ok(());
        }
        match self.metadata.id_generation_strategy() {
            IdGeneration::Generated => Ok(()),
            IdGeneration::Assigned => Err(DbError::InvalidUsage(format!(
                "Cannot autogenerate id of type {} for entity of type {}",
                self.metadata.id_property_name(),
                self.metadata.type_name()
            ))),
        }
    }

    /// Stores a store-generated identity; an already assigned one is kept.
    pub fn populate_id(&mut self, generated: Value) {
        if self.id().is_some() || generated.is_null() {
            return;
        }
        let property = self.metadata.id_property_name().to_string();
        self.properties.insert(property, generated);
    }

    fn required_id(&self) -> Result<Value> {
        self.id().cloned().ok_or_else(|| {
            DbError::InvalidUsage(format!(
                "Entity {} has no identity to address it by",
                self.metadata.type_name()
            ))
        })
    }

    /// `_id = id`.
    pub fn by_id_filter(&self) -> Result<Document> {
        let mut filter = Document::new();
        filter.insert(ID_FIELD.to_string(), self.required_id()?);
        Ok(filter)
    }

    /// `_id = id AND version = v` for the version currently held.
    pub fn version_filter(&self) -> Result<Document> {
        let mut filter = self.by_id_filter()?;
        if let Some(field) = self.metadata.version_field() {
            let version = self.version().map(Value::from).unwrap_or(Value::Null);
            filter.insert(field, version);
        }
        Ok(filter)
    }

    /// Filter used to remove the entity: version-qualified when versioned and
    /// carrying the shard key values held by the entity.
    pub fn remove_filter(&self) -> Result<Document> {
        let mut filter = if self.is_versioned() && self.version().is_some() {
            self.version_filter()?
        } else {
            self.by_id_filter()?
        };
        if let Some(key) = self.metadata.shard_key_spec() {
            for property in key.properties() {
                let field = self.metadata.wire_name(property);
                if field == ID_FIELD {
                    continue;
                }
                if let Some(value) = self.properties.get(property) {
                    filter.insert(field, value.clone());
                }
            }
        }
        Ok(filter)
    }

    /// Rendering of the identity used in error messages.
    pub fn id_display(&self) -> String {
        match self.id() {
            Some(Value::String(s)) => s.clone(),
            Some(other) => other.to_string(),
            None => "<unset>".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mapping::metadata::ShardKey;
    use serde_json::json;

    fn versioned() -> Arc<EntityMetadata> {
        Arc::new(
            EntityMetadata::new("Account")
                .version_property("version")
                .shard_key(ShardKey::of(&["region"])),
        )
    }

    #[test]
    fn new_and_version_lifecycle() {
        let mut adapter =
            EntityAdapter::from_value(json!({"id": "a1", "region": "eu"}), versioned()).unwrap();
        assert!(adapter.is_new());
        assert_eq!(adapter.initialize_version(), Some(0));
        assert!(!adapter.is_new());
        assert_eq!(adapter.increment_version().unwrap(), 1);
        assert_eq!(
            Value::Object(adapter.version_filter().unwrap()),
            json!({"_id": "a1", "version": 1})
        );
        assert_eq!(
            Value::Object(adapter.remove_filter().unwrap()),
            json!({"_id": "a1", "region": "eu", "version": 1})
        );
    }

    #[test]
    fn rejects_collections_as_single_entity() {
        let err = EntityAdapter::from_value(json!([{"id": 1}]), versioned()).unwrap_err();
        assert!(err.is_usage_error());
    }

    #[test]
    fn assigned_identity_must_be_present() {
        let meta = Arc::new(EntityMetadata::new("Sku").id_generation(IdGeneration::Assigned));
        let adapter = EntityAdapter::from_value(json!({"id": null}), meta.clone()).unwrap();
        assert!(adapter.assert_id_settable_or_autogenerable().is_err());

        let mut generated =
            EntityAdapter::from_value(json!({"name": "x"}), Arc::new(EntityMetadata::new("Item"))).unwrap();
        assert!(generated.assert_id_settable_or_autogenerable().is_ok());
        generated.populate_id(json!("g1"));
        generated.populate_id(json!("g2"));
        assert_eq!(generated.id(), Some(&json!("g1")));
    }

    #[test]
    fn unversioned_remove_filter_is_by_id() {
        let adapter =
            EntityAdapter::from_value(json!({"id": 4, "name": "n"}), Arc::new(EntityMetadata::new("Item")))
                .unwrap();
        assert_eq!(Value::Object(adapter.remove_filter().unwrap()), json!({"_id": 4}));
        assert!(EntityAdapter::from_value(json!({}), Arc::new(EntityMetadata::new("Item")))
            .unwrap()
            .by_id_filter()
            .is_err());
    }
}

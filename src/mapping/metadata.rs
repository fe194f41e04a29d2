use crate::core::{DbError, Result};
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::any::TypeId;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

/// Wire name of the identity field.
pub const ID_FIELD: &str = "_id";

/// Whether the store may generate an identity for a new entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum IdGeneration {
    /// Identity may be left unset on insert; the store generates it.
    #[default]
    Generated,
    /// Identity must be assigned by the application before insert.
    Assigned,
}

/// Shard key declaration of a collection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShardKey {
    properties: Vec<String>,
    immutable: bool,
}

impl ShardKey {
    pub fn of(properties: &[&str]) -> Self {
        Self {
            properties: properties.iter().map(|p| (*p).to_string()).collect(),
            immutable: false,
        }
    }

    /// Values of an immutable key never change once written, so they can be
    /// taken from the document about to be stored.
    pub fn immutable(mut self, immutable: bool) -> Self {
        self.immutable = immutable;
        self
    }

    pub fn properties(&self) -> &[String] {
        &self.properties
    }

    pub fn is_immutable(&self) -> bool {
        self.immutable
    }
}

/// Identity, version, naming and sharding metadata of an entity type.
#[derive(Debug, Clone, PartialEq)]
pub struct EntityMetadata {
    type_name: String,
    collection: String,
    id_property: String,
    id_generation: IdGeneration,
    version_property: Option<String>,
    shard_key: Option<ShardKey>,
    field_names: HashMap<String, String>,
}

impl EntityMetadata {
    /// Metadata with `id` as identity property and the type name with a
    /// lower-case first letter as collection name.
    pub fn new(type_name: &str) -> Self {
        let mut chars = type_name.chars();
        let collection = match chars.next() {
            Some(first) => first.to_lowercase().chain(chars).collect(),
            None => String::new(),
        };
        Self {
            type_name: type_name.to_string(),
            collection,
            id_property: "id".to_string(),
            id_generation: IdGeneration::Generated,
            version_property: None,
            shard_key: None,
            field_names: HashMap::new(),
        }
    }

    pub fn collection(mut self, collection: &str) -> Self {
        self.collection = collection.to_string();
        self
    }

    pub fn id_property(mut self, property: &str) -> Self {
        self.id_property = property.to_string();
        self
    }

    pub fn id_generation(mut self, generation: IdGeneration) -> Self {
        self.id_generation = generation;
        self
    }

    pub fn version_property(mut self, property: &str) -> Self {
        self.version_property = Some(property.to_string());
        self
    }

    /// Stores `property` under `wire_name` in documents.
    pub fn field(mut self, property: &str, wire_name: &str) -> Self {
        self.field_names
            .insert(property.to_string(), wire_name.to_string());
        self
    }

    pub fn shard_key(mut self, shard_key: ShardKey) -> Self {
        self.shard_key = Some(shard_key);
        self
    }

    pub fn type_name(&self) -> &str {
        &self.type_name
    }

    pub fn collection_name(&self) -> &str {
        &self.collection
    }

    pub fn id_property_name(&self) -> &str {
        &self.id_property
    }

    pub fn id_generation_strategy(&self) -> IdGeneration {
        self.id_generation
    }

    pub fn version_property_name(&self) -> Option<&str> {
        self.version_property.as_deref()
    }

    pub fn is_versioned(&self) -> bool {
        self.version_property.is_some()
    }

    pub fn shard_key_spec(&self) -> Option<&ShardKey> {
        self.shard_key.as_ref()
    }

    pub fn is_sharded(&self) -> bool {
        self.shard_key
            .as_ref()
            .map(|key| !key.properties.is_empty())
            .unwrap_or(false)
    }

    /// Sharded on the identity alone; an id filter already pins the shard.
    pub fn is_sharded_by_id(&self) -> bool {
        match &self.shard_key {
            Some(key) => key.properties.len() == 1 && self.wire_name(&key.properties[0]) == ID_FIELD,
            None => false,
        }
    }

    /// Wire name of a property path; only the first segment is renamed.
    pub fn wire_name(&self, property: &str) -> String {
        let (head, rest) = match property.split_once('.') {
            Some((head, rest)) => (head, Some(rest)),
            None => (property, None),
        };
        let head = if head == self.id_property {
            ID_FIELD
        } else {
            self.field_names.get(head).map(String::as_str).unwrap_or(head)
        };
        match rest {
            Some(rest) => format!("{}.{}", head, rest),
            None => head.to_string(),
        }
    }

    /// Property name of a top-level wire field.
    pub fn property_name(&self, wire_name: &str) -> String {
        if wire_name == ID_FIELD {
            return self.id_property.clone();
        }
        self.field_names
            .iter()
            .find(|(_, wire)| wire.as_str() == wire_name)
            .map(|(property, _)| property.clone())
            .unwrap_or_else(|| wire_name.to_string())
    }

    pub fn version_field(&self) -> Option<String> {
        self.version_property.as_deref().map(|p| self.wire_name(p))
    }

    pub fn shard_key_fields(&self) -> Vec<String> {
        self.shard_key
            .as_ref()
            .map(|key| key.properties.iter().map(|p| self.wire_name(p)).collect())
            .unwrap_or_default()
    }

    pub fn validate(&self) -> Result<()> {
        if self.collection.is_empty() {
            return Err(DbError::InvalidUsage(format!(
                "Entity {} has no collection name",
                self.type_name
            )));
        }
        if self.version_property.as_deref() == Some(self.id_property.as_str()) {
            return Err(DbError::InvalidUsage(format!(
                "Entity {} uses '{}' both as identity and version",
                self.type_name, self.id_property
            )));
        }
        if let Some(key) = &self.shard_key {
            if key.properties.is_empty() {
                return Err(DbError::InvalidUsage(format!(
                    "Entity {} declares an empty shard key",
                    self.type_name
                )));
            }
        }
        let mut wire_names: Vec<&String> = self.field_names.values().collect();
        wire_names.sort();
        wire_names.dedup();
        if wire_names.len() != self.field_names.len()
            || self.field_names.values().any(|w| w == ID_FIELD)
        {
            return Err(DbError::InvalidUsage(format!(
                "Entity {} maps two properties to the same field",
                self.type_name
            )));
        }
        Ok(())
    }
}

/// A domain type the template can persist.
///
/// The serialized form must be a JSON object whose keys are the property
/// names used in [`EntityMetadata`].
pub trait Entity: Serialize + DeserializeOwned + Send + Sync + 'static {
    fn describe() -> EntityMetadata;
}

/// Per-type metadata cache; the identity/version metadata provider of the
/// template.
#[derive(Debug, Default)]
pub struct MappingContext {
    entities: RwLock<HashMap<TypeId, Arc<EntityMetadata>>>,
}

impl MappingContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn metadata<T: Entity>(&self) -> Result<Arc<EntityMetadata>> {
        let type_id = TypeId::of::<T>();
        let cached = self
            .entities
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(&type_id)
            .cloned();
        if let Some(found) = cached {
            return Ok(found);
        }
        let metadata = T::describe();
        metadata.validate()?;
        let metadata = Arc::new(metadata);
        let mut entities = self
            .entities
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        Ok(entities.entry(type_id).or_insert(metadata).clone())
    }

    pub fn collection_name<T: Entity>(&self) -> Result<String> {
        Ok(self.metadata::<T>()?.collection_name().to_string())
    }
}

//! Property/wire translation of entities, filters, projections, sorts and
//! updates.

use super::metadata::{EntityMetadata, ID_FIELD};
use crate::core::{Document, Result};
use serde_json::Value;

/// Converts between property-level and wire-level documents.
///
/// Implementations must be deterministic and free of side effects; the
/// template calls them inline between driver round-trips.
pub trait DocumentCodec: Send + Sync {
    fn encode(&self, properties: Document, metadata: &EntityMetadata) -> Result<Document>;

    fn decode(&self, document: Document, metadata: &EntityMetadata) -> Result<Document>;

    fn map_filter(&self, filter: &Document, metadata: Option<&EntityMetadata>) -> Result<Document>;

    fn map_fields(&self, fields: &Document, metadata: Option<&EntityMetadata>) -> Document;

    fn map_sort(&self, sort: &Document, metadata: Option<&EntityMetadata>) -> Document;

    fn map_update(&self, update: &Document, metadata: Option<&EntityMetadata>) -> Result<Document>;
}

/// Default codec: renames fields according to [`EntityMetadata`] and leaves
/// values untouched.
#[derive(Debug, Clone, Copy, Default)]
pub struct FieldNameCodec;

fn rename_keys(source: &Document, metadata: Option<&EntityMetadata>) -> Document {
    match metadata {
        Some(metadata) => source
            .iter()
            .map(|(key, value)| (metadata.wire_name(key), value.clone()))
            .collect(),
        None => source.clone(),
    }
}

impl DocumentCodec for FieldNameCodec {
    fn encode(&self, properties: Document, metadata: &EntityMetadata) -> Result<Document> {
        let mut document = Document::new();
        for (property, value) in properties {
            let field = metadata.wire_name(&property);
            // A null identity is left for the store to generate.
            if field == ID_FIELD && value.is_null() {
                continue;
            }
            document.insert(field, value);
        }
        Ok(document)
    }

    fn decode(&self, document: Document, metadata: &EntityMetadata) -> Result<Document> {
        Ok(document
            .into_iter()
            .map(|(field, value)| (metadata.property_name(&field), value))
            .collect())
    }

    fn map_filter(&self, filter: &Document, metadata: Option<&EntityMetadata>) -> Result<Document> {
        let mut mapped = Document::new();
        for (key, value) in filter {
            match key.as_str() {
                "$and" | "$or" | "$nor" => {
                    let clauses = match value {
                        Value::Array(clauses) => clauses
                            .iter()
                            .map(|clause| match clause {
                                Value::Object(clause) => {
                                    self.map_filter(clause, metadata).map(Value::Object)
                                }
                                other => Ok(other.clone()),
                            })
                            .collect::<Result<Vec<_>>>()?,
                        other => {
                            mapped.insert(key.clone(), other.clone());
                            continue;
                        }
                    };
                    mapped.insert(key.clone(), Value::Array(clauses));
                }
                operator if operator.starts_with('$') => {
                    mapped.insert(key.clone(), value.clone());
                }
                property => {
                    let field = match metadata {
                        Some(metadata) => metadata.wire_name(property),
                        None => property.to_string(),
                    };
                    mapped.insert(field, value.clone());
                }
            }
        }
        Ok(mapped)
    }

    fn map_fields(&self, fields: &Document, metadata: Option<&EntityMetadata>) -> Document {
        rename_keys(fields, metadata)
    }

    fn map_sort(&self, sort: &Document, metadata: Option<&EntityMetadata>) -> Document {
        rename_keys(sort, metadata)
    }

    fn map_update(&self, update: &Document, metadata: Option<&EntityMetadata>) -> Result<Document> {
        let is_operator_update = update.keys().all(|key| key.starts_with('$'));
        if !is_operator_update {
            return Ok(rename_keys(update, metadata));
        }
        Ok(update
            .iter()
            .map(|(operator, fields)| {
                let fields = match fields {
                    Value::Object(fields) => Value::Object(rename_keys(fields, metadata)),
                    other => other.clone(),
                };
                (operator.clone(), fields)
            })
            .collect())
    }
}

use super::{DbError, Result};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;

/// Wire-level document: field name to encodable value.
pub type Document = Map<String, Value>;

/// Interprets a JSON value as a document, rejecting anything that is not an object.
pub fn as_document(value: Value, what: &str) -> Result<Document> {
    match value {
        Value::Object(map) => Ok(map),
        Value::Null => Err(DbError::InvalidUsage(format!("{} must not be null", what))),
        other => Err(DbError::InvalidUsage(format!(
            "{} must be a document, got {}",
            what,
            json_type_name(&other)
        ))),
    }
}

pub fn json_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "document",
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ReadPreference {
    #[default]
    Primary,
    PrimaryPreferred,
    Secondary,
    SecondaryPreferred,
    Nearest,
}

impl ReadPreference {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "primary" => Some(Self::Primary),
            "primaryPreferred" => Some(Self::PrimaryPreferred),
            "secondary" => Some(Self::Secondary),
            "secondaryPreferred" => Some(Self::SecondaryPreferred),
            "nearest" => Some(Self::Nearest),
            _ => None,
        }
    }
}

/// How many nodes must acknowledge a write.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Acknowledgment {
    Nodes(u32),
    Majority,
    Tag(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct WriteConcern {
    pub w: Option<Acknowledgment>,
    pub journal: Option<bool>,
    pub w_timeout_ms: Option<u64>,
}

impl WriteConcern {
    pub fn unacknowledged() -> Self {
        Self {
            w: Some(Acknowledgment::Nodes(0)),
            ..Self::default()
        }
    }

    pub fn acknowledged() -> Self {
        Self {
            w: Some(Acknowledgment::Nodes(1)),
            ..Self::default()
        }
    }

    pub fn majority() -> Self {
        Self {
            w: Some(Acknowledgment::Majority),
            ..Self::default()
        }
    }

    pub fn journal(mut self, journal: bool) -> Self {
        self.journal = Some(journal);
        self
    }

    /// `w: 0` without journaling is the only unacknowledged combination.
    pub fn is_acknowledged(&self) -> bool {
        !matches!(self.w, Some(Acknowledgment::Nodes(0))) || self.journal == Some(true)
    }

    pub fn parse(raw: &str) -> Option<Self> {
        let w = match raw {
            "majority" => Acknowledgment::Majority,
            _ => match raw.parse::<u32>() {
                Ok(nodes) => Acknowledgment::Nodes(nodes),
                Err(_) if !raw.is_empty() => Acknowledgment::Tag(raw.to_string()),
                Err(_) => return None,
            },
        };
        Some(Self {
            w: Some(w),
            ..Self::default()
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Collation {
    pub locale: String,
    pub strength: Option<u8>,
}

impl Collation {
    pub fn of(locale: impl Into<String>) -> Self {
        Self {
            locale: locale.into(),
            strength: None,
        }
    }

    pub fn strength(mut self, strength: u8) -> Self {
        self.strength = Some(strength);
        self
    }
}

/// Property-level query: filter, sort, projection and paging.
///
/// Field names are domain property names; the codec translates them to wire
/// names right before the driver call.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Query {
    filter: Document,
    sort: Option<Document>,
    fields: Option<Document>,
    skip: u64,
    limit: Option<u64>,
    collation: Option<Collation>,
    read_preference: Option<ReadPreference>,
}

impl Query {
    pub fn new(filter: Document) -> Self {
        Self {
            filter,
            ..Self::default()
        }
    }

    /// Matches every document.
    pub fn all() -> Self {
        Self::default()
    }

    pub fn parse(filter: Value) -> Result<Self> {
        Ok(Self::new(as_document(filter, "Query")?))
    }

    pub fn by_field(field: impl Into<String>, value: Value) -> Self {
        let mut filter = Document::new();
        filter.insert(field.into(), value);
        Self::new(filter)
    }

    pub fn sort(mut self, sort: Value) -> Result<Self> {
        self.sort = Some(as_document(sort, "Sort")?);
        Ok(self)
    }

    pub fn include(mut self, fields: &[&str]) -> Self {
        let projection = self.fields.get_or_insert_with(Document::new);
        for field in fields {
            projection.insert((*field).to_string(), Value::from(1));
        }
        self
    }

    pub fn skip(mut self, skip: u64) -> Self {
        self.skip = skip;
        self
    }

    pub fn limit(mut self, limit: u64) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn collation(mut self, collation: Collation) -> Self {
        self.collation = Some(collation);
        self
    }

    pub fn read_preference(mut self, read_preference: ReadPreference) -> Self {
        self.read_preference = Some(read_preference);
        self
    }

    pub fn filter(&self) -> &Document {
        &self.filter
    }

    pub fn sort_spec(&self) -> Option<&Document> {
        self.sort.as_ref()
    }

    pub fn fields(&self) -> Option<&Document> {
        self.fields.as_ref()
    }

    pub fn skip_count(&self) -> u64 {
        self.skip
    }

    pub fn limit_count(&self) -> Option<u64> {
        self.limit
    }

    pub fn collation_spec(&self) -> Option<&Collation> {
        self.collation.as_ref()
    }

    pub fn read_preference_override(&self) -> Option<ReadPreference> {
        self.read_preference
    }

    pub(crate) fn restrict_fields(&mut self, fields: Document) {
        self.fields = Some(fields);
    }
}

impl fmt::Display for Query {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", Value::Object(self.filter.clone()))
    }
}

/// Property-level update definition: either operator based (`$set`, `$inc`, ...)
/// or a full replacement document.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Update {
    document: Document,
}

impl Update {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn parse(update: Value) -> Result<Self> {
        let document = as_document(update, "Update")?;
        if document.is_empty() {
            return Err(DbError::InvalidUsage("Update must not be empty".into()));
        }
        Ok(Self { document })
    }

    pub fn set(self, field: impl Into<String>, value: Value) -> Self {
        self.operator("$set", field.into(), value)
    }

    pub fn unset(self, field: impl Into<String>) -> Self {
        self.operator("$unset", field.into(), Value::from(1))
    }

    pub fn inc(self, field: impl Into<String>, by: i64) -> Self {
        self.operator("$inc", field.into(), Value::from(by))
    }

    pub fn set_on_insert(self, field: impl Into<String>, value: Value) -> Self {
        self.operator("$setOnInsert", field.into(), value)
    }

    fn operator(mut self, op: &str, field: String, value: Value) -> Self {
        let entry = self
            .document
            .entry(op.to_string())
            .or_insert_with(|| Value::Object(Document::new()));
        if let Value::Object(fields) = entry {
            fields.insert(field, value);
        }
        self
    }

    /// Whether every top-level key is an update operator.
    pub fn is_operator_update(&self) -> bool {
        !self.document.is_empty() && self.document.keys().all(|key| key.starts_with('$'))
    }

    /// Whether some operator touches `field`.
    pub fn modifies(&self, field: &str) -> bool {
        if !self.is_operator_update() {
            return self.document.contains_key(field);
        }
        self.document.values().any(|fields| match fields {
            Value::Object(fields) => fields.contains_key(field),
            _ => false,
        })
    }

    pub fn document(&self) -> &Document {
        &self.document
    }

    pub fn into_document(self) -> Document {
        self.document
    }
}

//! Entity mapping: metadata, the entity adapter and the document codec.

pub mod adapter;
pub mod codec;
pub mod metadata;

pub use adapter::EntityAdapter;
pub use codec::{DocumentCodec, FieldNameCodec};
pub use metadata::{Entity, EntityMetadata, ID_FIELD, IdGeneration, MappingContext, ShardKey};

/// Closed projection of an entity: a read model restricted to a fixed set of
/// properties of the entity it is read from.
pub trait Projection: serde::de::DeserializeOwned + Send + 'static {
    /// Property names (entity-level) the projection reads.
    fn properties() -> &'static [&'static str];
}

pub mod error;
pub mod types;

pub use error::{CallbackPhase, DbError, Result};
pub use types::{
    Acknowledgment, Collation, Document, Query, ReadPreference, Update, WriteConcern, as_document,
};

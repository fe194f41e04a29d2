//! Boundary to the underlying store driver.
//!
//! The template never talks to the network itself: everything goes through
//! [`StoreDriver`], an asynchronous, session-aware collection API. Dropping a
//! returned future cancels the call; [`DocumentCursor`] is demand driven.
//!
//! `memory` holds an in-process implementation used by the test suites and
//! by applications that want the template semantics without a server.

pub mod matcher;
pub mod memory;

use crate::core::{Collation, Document, ReadPreference, WriteConcern};
use async_trait::async_trait;
use futures::stream::BoxStream;
use serde_json::Value;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;

pub use memory::{InMemoryDriver, OperationKind, RecordedOperation};

pub const DUPLICATE_KEY_CODE: i32 = 11000;
pub const WRITE_CONFLICT_CODE: i32 = 112;
pub const UNAUTHORIZED_CODE: i32 = 13;
pub const TRANSIENT_TRANSACTION_LABEL: &str = "TransientTransactionError";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriverErrorKind {
    /// Server replied with an error code.
    Server,
    /// Write rejected by the server; `code` carries the reason.
    Write,
    Network,
    Timeout,
    /// Session or transaction misuse reported by the driver.
    Session,
    Other,
}

/// Raw failure surfaced by a driver before translation.
#[derive(Error, Debug, Clone, PartialEq)]
#[error("{kind:?} error{}: {message}", code_suffix(.code))]
pub struct DriverError {
    pub kind: DriverErrorKind,
    pub code: Option<i32>,
    pub message: String,
    pub labels: Vec<String>,
}

impl DriverError {
    pub fn new(kind: DriverErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            code: None,
            message: message.into(),
            labels: Vec::new(),
        }
    }

    pub fn with_code(mut self, code: i32) -> Self {
        self.code = Some(code);
        self
    }

    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.labels.push(label.into());
        self
    }

    pub fn duplicate_key(message: impl Into<String>) -> Self {
        Self::new(DriverErrorKind::Write, message).with_code(DUPLICATE_KEY_CODE)
    }

    pub fn has_label(&self, label: &str) -> bool {
        self.labels.iter().any(|l| l == label)
    }
}

fn code_suffix(code: &Option<i32>) -> String {
    code.map(|c| format!(" (code {})", c)).unwrap_or_default()
}

pub type DriverResult<T> = std::result::Result<T, DriverError>;

/// Collection coordinates plus the per-call settings applied before every
/// operation.
#[derive(Debug, Clone, PartialEq)]
pub struct PreparedCollection {
    pub database: String,
    pub name: String,
    pub read_preference: ReadPreference,
    pub write_concern: Option<WriteConcern>,
}

impl PreparedCollection {
    pub fn new(database: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            database: database.into(),
            name: name.into(),
            read_preference: ReadPreference::Primary,
            write_concern: None,
        }
    }

    pub fn with_read_preference(mut self, read_preference: ReadPreference) -> Self {
        self.read_preference = read_preference;
        self
    }

    pub fn with_write_concern(mut self, write_concern: Option<WriteConcern>) -> Self {
        self.write_concern = write_concern;
        self
    }

    pub fn namespace(&self) -> String {
        format!("{}.{}", self.database, self.name)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct InsertOneResult {
    pub inserted_id: Value,
    pub acknowledged: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct InsertManyResult {
    /// Ids in input order.
    pub inserted_ids: Vec<Value>,
    pub acknowledged: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct UpdateResult {
    pub matched_count: u64,
    pub modified_count: u64,
    pub upserted_id: Option<Value>,
    pub acknowledged: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DeleteResult {
    pub deleted_count: u64,
    pub acknowledged: bool,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct UpdateOptions {
    pub upsert: bool,
    pub collation: Option<Collation>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CursorType {
    #[default]
    NonTailable,
    Tailable,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct FindOptions {
    pub projection: Option<Document>,
    pub sort: Option<Document>,
    pub skip: u64,
    pub limit: Option<u64>,
    pub collation: Option<Collation>,
    pub cursor_type: CursorType,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ReturnDocument {
    #[default]
    Before,
    After,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct FindOneAndModifyOptions {
    pub projection: Option<Document>,
    pub sort: Option<Document>,
    pub upsert: bool,
    pub return_document: ReturnDocument,
    pub collation: Option<Collation>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct SessionOptions {
    pub causal_consistency: bool,
    pub default_transaction: TransactionOptions,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct TransactionOptions {
    pub read_preference: Option<ReadPreference>,
    pub write_concern: Option<WriteConcern>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionState {
    None,
    Active,
    Committed,
    Aborted,
}

/// Server-side session, optionally enrolled in a multi-statement transaction.
///
/// A session is not safe for concurrent use by independent pipelines;
/// operations carrying it must be chained.
#[async_trait]
pub trait ClientSession: Send + Sync + fmt::Debug {
    fn id(&self) -> &str;

    fn transaction_state(&self) -> TransactionState;

    fn has_active_transaction(&self) -> bool {
        self.transaction_state() == TransactionState::Active
    }

    async fn start_transaction(&self, options: TransactionOptions) -> DriverResult<()>;

    async fn commit_transaction(&self) -> DriverResult<()>;

    async fn abort_transaction(&self) -> DriverResult<()>;
}

pub type SessionHandle = Arc<dyn ClientSession>;

pub type DocumentCursor = BoxStream<'static, DriverResult<Document>>;

#[async_trait]
pub trait StoreDriver: Send + Sync {
    async fn start_session(&self, options: SessionOptions) -> DriverResult<SessionHandle>;

    async fn insert_one(
        &self,
        collection: &PreparedCollection,
        document: Document,
        session: Option<&SessionHandle>,
    ) -> DriverResult<InsertOneResult>;

    async fn insert_many(
        &self,
        collection: &PreparedCollection,
        documents: Vec<Document>,
        session: Option<&SessionHandle>,
    ) -> DriverResult<InsertManyResult>;

    async fn replace_one(
        &self,
        collection: &PreparedCollection,
        filter: Document,
        replacement: Document,
        options: UpdateOptions,
        session: Option<&SessionHandle>,
    ) -> DriverResult<UpdateResult>;

    async fn update_one(
        &self,
        collection: &PreparedCollection,
        filter: Document,
        update: Document,
        options: UpdateOptions,
        session: Option<&SessionHandle>,
    ) -> DriverResult<UpdateResult>;

    async fn update_many(
        &self,
        collection: &PreparedCollection,
        filter: Document,
        update: Document,
        options: UpdateOptions,
        session: Option<&SessionHandle>,
    ) -> DriverResult<UpdateResult>;

    async fn delete_many(
        &self,
        collection: &PreparedCollection,
        filter: Document,
        session: Option<&SessionHandle>,
    ) -> DriverResult<DeleteResult>;

    async fn find_one_and_update(
        &self,
        collection: &PreparedCollection,
        filter: Document,
        update: Document,
        options: FindOneAndModifyOptions,
        session: Option<&SessionHandle>,
    ) -> DriverResult<Option<Document>>;

    async fn find_one_and_replace(
        &self,
        collection: &PreparedCollection,
        filter: Document,
        replacement: Document,
        options: FindOneAndModifyOptions,
        session: Option<&SessionHandle>,
    ) -> DriverResult<Option<Document>>;

    async fn find_one_and_delete(
        &self,
        collection: &PreparedCollection,
        filter: Document,
        options: FindOneAndModifyOptions,
        session: Option<&SessionHandle>,
    ) -> DriverResult<Option<Document>>;

    async fn count_documents(
        &self,
        collection: &PreparedCollection,
        filter: Document,
        session: Option<&SessionHandle>,
    ) -> DriverResult<u64>;

    /// Lazily executed query; nothing is sent before the first poll.
    fn find(
        &self,
        collection: &PreparedCollection,
        filter: Document,
        options: FindOptions,
        session: Option<SessionHandle>,
    ) -> DocumentCursor;
}

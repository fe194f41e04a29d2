use super::matcher::{
    apply_update, is_update_document, matches, project, replace, seed_from_filter,
    sort_documents,
};
use super::{
    ClientSession, DeleteResult, DocumentCursor, DriverError, DriverErrorKind, DriverResult,
    FindOneAndModifyOptions, FindOptions, InsertManyResult, InsertOneResult, PreparedCollection,
    ReturnDocument, SessionHandle, SessionOptions, StoreDriver, TransactionOptions,
    TRANSIENT_TRANSACTION_LABEL, TransactionState, UpdateOptions, UpdateResult,
    WRITE_CONFLICT_CODE,
};
use crate::core::{Collation, Document, ReadPreference, WriteConcern};
use async_trait::async_trait;
use futures::StreamExt;
use futures::stream;
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OperationKind {
    InsertOne,
    InsertMany,
    ReplaceOne,
    UpdateOne,
    UpdateMany,
    DeleteMany,
    FindOneAndUpdate,
    FindOneAndReplace,
    FindOneAndDelete,
    CountDocuments,
    Find,
    StartSession,
    StartTransaction,
    CommitTransaction,
    AbortTransaction,
}

/// One driver call as seen by the store, for test assertions.
#[derive(Debug, Clone, PartialEq)]
pub struct RecordedOperation {
    pub kind: OperationKind,
    pub namespace: String,
    pub filter: Option<Document>,
    pub session_id: Option<String>,
    pub read_preference: Option<ReadPreference>,
    pub write_concern: Option<WriteConcern>,
    pub collation: Option<Collation>,
}

type Collections = HashMap<String, Vec<Document>>;

#[derive(Default)]
struct StagedTransaction {
    collections: Collections,
    // committed contents of each namespace at first access
    snapshots: Collections,
    touched: HashSet<String>,
}

/// Per-document difference between a staged namespace and its snapshot.
#[derive(Default)]
struct NamespaceChanges {
    deleted: Vec<Value>,
    written: Vec<Document>,
}

impl NamespaceChanges {
    fn between(snapshot: &[Document], staged: Vec<Document>) -> Self {
        let mut changes = NamespaceChanges::default();
        for before in snapshot {
            let id = before.get("_id");
            if !staged.iter().any(|doc| doc.get("_id") == id) {
                changes.deleted.push(id.cloned().unwrap_or(Value::Null));
            }
        }
        for doc in staged {
            let before = snapshot.iter().find(|s| s.get("_id") == doc.get("_id"));
            if before != Some(&doc) {
                changes.written.push(doc);
            }
        }
        changes
    }

    /// True when a document this transaction wrote or deleted was changed
    /// outside of it after the snapshot was taken.
    fn conflicts(&self, snapshot: &[Document], committed: &[Document]) -> bool {
        let find = |docs: &[Document], id: Option<&Value>| {
            docs.iter().find(|doc| doc.get("_id") == id).cloned()
        };
        let touched_ids = self
            .deleted
            .iter()
            .map(Some)
            .chain(self.written.iter().map(|doc| doc.get("_id")));
        for id in touched_ids {
            if find(snapshot, id) != find(committed, id) {
                return true;
            }
        }
        false
    }

    fn apply(self, committed: &mut Vec<Document>) {
        committed.retain(|doc| {
            !self
                .deleted
                .iter()
                .any(|id| doc.get("_id") == Some(id))
        });
        for doc in self.written {
            match committed.iter_mut().find(|c| c.get("_id") == doc.get("_id")) {
                Some(existing) => *existing = doc,
                None => committed.push(doc),
            }
        }
    }
}

#[derive(Default)]
struct StoreInner {
    /// Committed state, keyed by namespace.
    collections: Mutex<Collections>,
    /// Open transactions, keyed by session id.
    staged: Mutex<HashMap<String, StagedTransaction>>,
    operations: Mutex<Vec<RecordedOperation>>,
    failures: Mutex<Vec<(OperationKind, DriverError)>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// In-process document store implementing [`StoreDriver`].
///
/// Writes issued with a session whose transaction is active are staged per
/// session and published to the committed state on commit; abort discards
/// them.
#[derive(Clone, Default)]
pub struct InMemoryDriver {
    inner: Arc<StoreInner>,
}

impl InMemoryDriver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Committed documents of a namespace (`database.collection`).
    pub fn documents(&self, namespace: &str) -> Vec<Document> {
        lock(&self.inner.collections)
            .get(namespace)
            .cloned()
            .unwrap_or_default()
    }

    pub fn seed(&self, namespace: &str, documents: Vec<Document>) {
        lock(&self.inner.collections)
            .entry(namespace.to_string())
            .or_default()
            .extend(documents);
    }

    pub fn operations(&self) -> Vec<RecordedOperation> {
        lock(&self.inner.operations).clone()
    }

    pub fn count_operations(&self, kind: OperationKind) -> usize {
        lock(&self.inner.operations)
            .iter()
            .filter(|op| op.kind == kind)
            .count()
    }

    pub fn clear_operations(&self) {
        lock(&self.inner.operations).clear();
    }

    /// Makes the next call of `kind` fail with `error` instead of executing.
    pub fn fail_next(&self, kind: OperationKind, error: DriverError) {
        lock(&self.inner.failures).push((kind, error));
    }

    fn record(
        &self,
        kind: OperationKind,
        collection: Option<&PreparedCollection>,
        filter: Option<&Document>,
        session: Option<&SessionHandle>,
    ) -> DriverResult<()> {
        self.record_collated(kind, collection, filter, None, session)
    }

    fn record_collated(
        &self,
        kind: OperationKind,
        collection: Option<&PreparedCollection>,
        filter: Option<&Document>,
        collation: Option<&Collation>,
        session: Option<&SessionHandle>,
    ) -> DriverResult<()> {
        lock(&self.inner.operations).push(RecordedOperation {
            kind,
            namespace: collection.map(|c| c.namespace()).unwrap_or_default(),
            filter: filter.cloned(),
            session_id: session.map(|s| s.id().to_string()),
            read_preference: collection.map(|c| c.read_preference),
            write_concern: collection.and_then(|c| c.write_concern.clone()),
            collation: collation.cloned(),
        });
        let mut failures = lock(&self.inner.failures);
        match failures.iter().position(|(k, _)| *k == kind) {
            Some(index) => Err(failures.remove(index).1),
            None => Ok(()),
        }
    }

    fn acknowledged(collection: &PreparedCollection) -> bool {
        collection
            .write_concern
            .as_ref()
            .map(WriteConcern::is_acknowledged)
            .unwrap_or(true)
    }

    /// Runs `op` against the view of the namespace visible to `session`.
    fn with_documents<R>(
        &self,
        collection: &PreparedCollection,
        session: Option<&SessionHandle>,
        writes: bool,
        op: impl FnOnce(&mut Vec<Document>) -> DriverResult<R>,
    ) -> DriverResult<R> {
        let namespace = collection.namespace();
        if let Some(session) = session {
            let mut staged = lock(&self.inner.staged);
            if let Some(tx) = staged.get_mut(session.id()) {
                if !tx.collections.contains_key(&namespace) {
                    let committed = lock(&self.inner.collections)
                        .get(&namespace)
                        .cloned()
                        .unwrap_or_default();
                    tx.snapshots.insert(namespace.clone(), committed.clone());
                    tx.collections.insert(namespace.clone(), committed);
                }
                if writes {
                    tx.touched.insert(namespace.clone());
                }
                let docs = tx.collections.entry(namespace).or_default();
                return op(docs);
            }
        }
        let mut collections = lock(&self.inner.collections);
        let docs = collections.entry(namespace).or_default();
        op(docs)
    }

    fn find_documents(
        &self,
        collection: &PreparedCollection,
        filter: Document,
        options: FindOptions,
        session: Option<&SessionHandle>,
    ) -> DriverResult<Vec<Document>> {
        self.record_collated(
            OperationKind::Find,
            Some(collection),
            Some(&filter),
            options.collation.as_ref(),
            session,
        )?;
        let mut found = self.with_documents(collection, session, false, |docs| {
            docs.iter()
                .filter_map(|doc| match matches(doc, &filter) {
                    Ok(true) => Some(Ok(doc.clone())),
                    Ok(false) => None,
                    Err(err) => Some(Err(err)),
                })
                .collect::<DriverResult<Vec<_>>>()
        })?;
        if let Some(sort) = &options.sort {
            sort_documents(&mut found, sort);
        }
        let limit = options.limit.unwrap_or(u64::MAX);
        Ok(found
            .into_iter()
            .skip(options.skip as usize)
            .take(usize::try_from(limit).unwrap_or(usize::MAX))
            .map(|doc| match &options.projection {
                Some(projection) => project(doc, projection),
                None => doc,
            })
            .collect())
    }

    fn first_match(
        docs: &[Document],
        filter: &Document,
        sort: Option<&Document>,
    ) -> DriverResult<Option<usize>> {
        let mut candidates = Vec::new();
        for (index, doc) in docs.iter().enumerate() {
            if matches(doc, filter)? {
                candidates.push(index);
            }
        }
        if let Some(sort) = sort {
            let mut ordered: Vec<Document> = candidates.iter().map(|i| docs[*i].clone()).collect();
            sort_documents(&mut ordered, sort);
            let Some(first) = ordered.first() else {
                return Ok(None);
            };
            return Ok(candidates
                .into_iter()
                .find(|i| docs[*i].get("_id") == first.get("_id")));
        }
        Ok(candidates.first().copied())
    }

    fn ensure_unique_id(docs: &[Document], namespace: &str, id: &Value) -> DriverResult<()> {
        if docs.iter().any(|doc| doc.get("_id") == Some(id)) {
            return Err(DriverError::duplicate_key(format!(
                "E11000 duplicate key error collection: {} index: _id_ dup key: {{ _id: {} }}",
                namespace, id
            )));
        }
        Ok(())
    }

    fn generate_id() -> Value {
        Value::String(Uuid::new_v4().simple().to_string())
    }

    fn insert_into(docs: &mut Vec<Document>, namespace: &str, mut document: Document) -> DriverResult<Value> {
        let id = match document.get("_id") {
            Some(id) if !id.is_null() => id.clone(),
            _ => {
                let id = Self::generate_id();
                document.insert("_id".to_string(), id.clone());
                id
            }
        };
        Self::ensure_unique_id(docs, namespace, &id)?;
        docs.push(document);
        Ok(id)
    }

    fn upsert_document(
        docs: &mut Vec<Document>,
        namespace: &str,
        filter: &Document,
        body: Document,
        replacement: bool,
    ) -> DriverResult<Value> {
        let seed = seed_from_filter(filter)?;
        let document = if replacement {
            let mut document = body;
            if !document.contains_key("_id") {
                if let Some(id) = seed.get("_id") {
                    document.insert("_id".to_string(), id.clone());
                }
            }
            document
        } else {
            let mut document = seed;
            apply_update(&mut document, &body, true)?;
            document
        };
        Self::insert_into(docs, namespace, document)
    }

    fn require_update_document(update: &Document) -> DriverResult<()> {
        if !is_update_document(update) {
            return Err(DriverError::new(
                DriverErrorKind::Server,
                "Update document requires atomic operators",
            )
            .with_code(9));
        }
        Ok(())
    }

    fn modify(
        &self,
        collection: &PreparedCollection,
        filter: Document,
        body: Document,
        options: UpdateOptions,
        session: Option<&SessionHandle>,
        multi: bool,
        replacement: bool,
    ) -> DriverResult<UpdateResult> {
        let namespace = collection.namespace();
        let acknowledged = Self::acknowledged(collection);
        self.with_documents(collection, session, true, |docs| {
            let mut matched = 0u64;
            let mut modified = 0u64;
            for doc in docs.iter_mut() {
                if !matches(doc, &filter)? {
                    continue;
                }
                matched += 1;
                let before = doc.clone();
                if replacement {
                    replace(doc, body.clone())?;
                } else {
                    apply_update(doc, &body, false)?;
                }
                if *doc != before {
                    modified += 1;
                }
                if !multi {
                    break;
                }
            }
            let upserted_id = if matched == 0 && options.upsert {
                Some(Self::upsert_document(docs, &namespace, &filter, body, replacement)?)
            } else {
                None
            };
            Ok(UpdateResult {
                matched_count: matched,
                modified_count: modified,
                upserted_id,
                acknowledged,
            })
        })
    }

    fn find_and_modify(
        &self,
        collection: &PreparedCollection,
        filter: Document,
        body: Option<Document>,
        replacement: bool,
        options: FindOneAndModifyOptions,
        session: Option<&SessionHandle>,
    ) -> DriverResult<Option<Document>> {
        let namespace = collection.namespace();
        let found = self.with_documents(collection, session, true, |docs| {
            let index = Self::first_match(docs, &filter, options.sort.as_ref())?;
            match (index, body) {
                (Some(index), None) => Ok(Some(docs.remove(index))),
                (Some(index), Some(body)) => {
                    let before = docs[index].clone();
                    if replacement {
                        replace(&mut docs[index], body)?;
                    } else {
                        apply_update(&mut docs[index], &body, false)?;
                    }
                    Ok(Some(match options.return_document {
                        ReturnDocument::Before => before,
                        ReturnDocument::After => docs[index].clone(),
                    }))
                }
                (None, Some(body)) if options.upsert => {
                    let id = Self::upsert_document(docs, &namespace, &filter, body, replacement)?;
                    match options.return_document {
                        ReturnDocument::Before => Ok(None),
                        ReturnDocument::After => {
                            Ok(docs.iter().find(|d| d.get("_id") == Some(&id)).cloned())
                        }
                    }
                }
                (None, _) => Ok(None),
            }
        })?;
        Ok(found.map(|doc| match &options.projection {
            Some(projection) => project(doc, projection),
            None => doc,
        }))
    }
}

#[async_trait]
impl StoreDriver for InMemoryDriver {
    async fn start_session(&self, _options: SessionOptions) -> DriverResult<SessionHandle> {
        self.record(OperationKind::StartSession, None, None, None)?;
        Ok(Arc::new(MemorySession {
            id: Uuid::new_v4().to_string(),
            state: Mutex::new(TransactionState::None),
            driver: self.clone(),
        }))
    }

    async fn insert_one(
        &self,
        collection: &PreparedCollection,
        document: Document,
        session: Option<&SessionHandle>,
    ) -> DriverResult<InsertOneResult> {
        self.record(OperationKind::InsertOne, Some(collection), None, session)?;
        let namespace = collection.namespace();
        let inserted_id = self.with_documents(collection, session, true, |docs| {
            Self::insert_into(docs, &namespace, document)
        })?;
        Ok(InsertOneResult {
            inserted_id,
            acknowledged: Self::acknowledged(collection),
        })
    }

    async fn insert_many(
        &self,
        collection: &PreparedCollection,
        documents: Vec<Document>,
        session: Option<&SessionHandle>,
    ) -> DriverResult<InsertManyResult> {
        self.record(OperationKind::InsertMany, Some(collection), None, session)?;
        let namespace = collection.namespace();
        let inserted_ids = self.with_documents(collection, session, true, |docs| {
            documents
                .into_iter()
                .map(|document| Self::insert_into(docs, &namespace, document))
                .collect::<DriverResult<Vec<_>>>()
        })?;
        Ok(InsertManyResult {
            inserted_ids,
            acknowledged: Self::acknowledged(collection),
        })
    }

    async fn replace_one(
        &self,
        collection: &PreparedCollection,
        filter: Document,
        replacement: Document,
        options: UpdateOptions,
        session: Option<&SessionHandle>,
    ) -> DriverResult<UpdateResult> {
        self.record_collated(
            OperationKind::ReplaceOne,
            Some(collection),
            Some(&filter),
            options.collation.as_ref(),
            session,
        )?;
        self.modify(collection, filter, replacement, options, session, false, true)
    }

    async fn update_one(
        &self,
        collection: &PreparedCollection,
        filter: Document,
        update: Document,
        options: UpdateOptions,
        session: Option<&SessionHandle>,
    ) -> DriverResult<UpdateResult> {
        self.record_collated(
            OperationKind::UpdateOne,
            Some(collection),
            Some(&filter),
            options.collation.as_ref(),
            session,
        )?;
        Self::require_update_document(&update)?;
        self.modify(collection, filter, update, options, session, false, false)
    }

    async fn update_many(
        &self,
        collection: &PreparedCollection,
        filter: Document,
        update: Document,
        options: UpdateOptions,
        session: Option<&SessionHandle>,
    ) -> DriverResult<UpdateResult> {
        self.record_collated(
            OperationKind::UpdateMany,
            Some(collection),
            Some(&filter),
            options.collation.as_ref(),
            session,
        )?;
        Self::require_update_document(&update)?;
        self.modify(collection, filter, update, options, session, true, false)
    }

    async fn delete_many(
        &self,
        collection: &PreparedCollection,
        filter: Document,
        session: Option<&SessionHandle>,
    ) -> DriverResult<DeleteResult> {
        self.record(OperationKind::DeleteMany, Some(collection), Some(&filter), session)?;
        let deleted_count = self.with_documents(collection, session, true, |docs| {
            let before = docs.len();
            let mut kept = Vec::with_capacity(before);
            for doc in docs.drain(..) {
                if !matches(&doc, &filter)? {
                    kept.push(doc);
                }
            }
            *docs = kept;
            Ok((before - docs.len()) as u64)
        })?;
        Ok(DeleteResult {
            deleted_count,
            acknowledged: Self::acknowledged(collection),
        })
    }

    async fn find_one_and_update(
        &self,
        collection: &PreparedCollection,
        filter: Document,
        update: Document,
        options: FindOneAndModifyOptions,
        session: Option<&SessionHandle>,
    ) -> DriverResult<Option<Document>> {
        self.record_collated(
            OperationKind::FindOneAndUpdate,
            Some(collection),
            Some(&filter),
            options.collation.as_ref(),
            session,
        )?;
        Self::require_update_document(&update)?;
        self.find_and_modify(collection, filter, Some(update), false, options, session)
    }

    async fn find_one_and_replace(
        &self,
        collection: &PreparedCollection,
        filter: Document,
        replacement: Document,
        options: FindOneAndModifyOptions,
        session: Option<&SessionHandle>,
    ) -> DriverResult<Option<Document>> {
        self.record_collated(
            OperationKind::FindOneAndReplace,
            Some(collection),
            Some(&filter),
            options.collation.as_ref(),
            session,
        )?;
        self.find_and_modify(collection, filter, Some(replacement), true, options, session)
    }

    async fn find_one_and_delete(
        &self,
        collection: &PreparedCollection,
        filter: Document,
        options: FindOneAndModifyOptions,
        session: Option<&SessionHandle>,
    ) -> DriverResult<Option<Document>> {
        self.record_collated(
            OperationKind::FindOneAndDelete,
            Some(collection),
            Some(&filter),
            options.collation.as_ref(),
            session,
        )?;
        self.find_and_modify(collection, filter, None, false, options, session)
    }

    async fn count_documents(
        &self,
        collection: &PreparedCollection,
        filter: Document,
        session: Option<&SessionHandle>,
    ) -> DriverResult<u64> {
        self.record(OperationKind::CountDocuments, Some(collection), Some(&filter), session)?;
        self.with_documents(collection, session, false, |docs| {
            let mut count = 0u64;
            for doc in docs.iter() {
                if matches(doc, &filter)? {
                    count += 1;
                }
            }
            Ok(count)
        })
    }

    fn find(
        &self,
        collection: &PreparedCollection,
        filter: Document,
        options: FindOptions,
        session: Option<SessionHandle>,
    ) -> DocumentCursor {
        let driver = self.clone();
        let collection = collection.clone();
        let results = stream::once(async move {
            driver.find_documents(&collection, filter, options, session.as_ref())
        });
        Box::pin(
            results
                .map(|outcome| match outcome {
                    Ok(docs) => stream::iter(docs.into_iter().map(Ok::<Document, DriverError>)).left_stream(),
                    Err(err) => stream::iter(std::iter::once(Err(err))).right_stream(),
                })
                .flatten(),
        )
    }
}

#[derive(Debug)]
struct MemorySession {
    id: String,
    state: Mutex<TransactionState>,
    driver: InMemoryDriver,
}

impl std::fmt::Debug for InMemoryDriver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InMemoryDriver").finish_non_exhaustive()
    }
}

fn session_error(message: &str) -> DriverError {
    DriverError::new(DriverErrorKind::Session, message)
}

#[async_trait]
impl ClientSession for MemorySession {
    fn id(&self) -> &str {
        &self.id
    }

    fn transaction_state(&self) -> TransactionState {
        *lock(&self.state)
    }

    async fn start_transaction(&self, _options: TransactionOptions) -> DriverResult<()> {
        self.driver
            .record(OperationKind::StartTransaction, None, None, None)?;
        let mut state = lock(&self.state);
        if *state == TransactionState::Active {
            return Err(session_error("Transaction already in progress"));
        }
        lock(&self.driver.inner.staged).insert(self.id.clone(), StagedTransaction::default());
        *state = TransactionState::Active;
        Ok(())
    }

    async fn commit_transaction(&self) -> DriverResult<()> {
        self.driver
            .record(OperationKind::CommitTransaction, None, None, None)?;
        let mut state = lock(&self.state);
        match *state {
            TransactionState::Active => {}
            TransactionState::Aborted => {
                return Err(session_error(
                    "Cannot call commitTransaction after calling abortTransaction",
                ));
            }
            _ => return Err(session_error("No transaction started")),
        }
        let staged = lock(&self.driver.inner.staged).remove(&self.id);
        if let Some(mut tx) = staged {
            let mut collections = lock(&self.driver.inner.collections);
            let mut pending = Vec::new();
            for namespace in tx.touched {
                let Some(docs) = tx.collections.remove(&namespace) else {
                    continue;
                };
                let snapshot = tx.snapshots.remove(&namespace).unwrap_or_default();
                let changes = NamespaceChanges::between(&snapshot, docs);
                let committed = collections.get(&namespace).map(Vec::as_slice).unwrap_or(&[]);
                if changes.conflicts(&snapshot, committed) {
                    *state = TransactionState::Aborted;
                    return Err(DriverError::new(
                        DriverErrorKind::Server,
                        format!("WriteConflict on {namespace}: document changed outside the transaction"),
                    )
                    .with_code(WRITE_CONFLICT_CODE)
                    .with_label(TRANSIENT_TRANSACTION_LABEL));
                }
                pending.push((namespace, changes));
            }
            for (namespace, changes) in pending {
                changes.apply(collections.entry(namespace).or_default());
            }
        }
        *state = TransactionState::Committed;
        Ok(())
    }

    async fn abort_transaction(&self) -> DriverResult<()> {
        self.driver
            .record(OperationKind::AbortTransaction, None, None, None)?;
        let mut state = lock(&self.state);
        match *state {
            TransactionState::Active => {}
            TransactionState::Committed => {
                return Err(session_error(
                    "Cannot call abortTransaction after calling commitTransaction",
                ));
            }
            TransactionState::Aborted => {
                return Err(session_error("Cannot call abortTransaction twice"));
            }
            TransactionState::None => return Err(session_error("No transaction started")),
        }
        lock(&self.driver.inner.staged).remove(&self.id);
        *state = TransactionState::Aborted;
        Ok(())
    }
}

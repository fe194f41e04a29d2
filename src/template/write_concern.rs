use super::config::WriteResultChecking;
use crate::core::{Document, WriteConcern};
use std::sync::Arc;
use tracing::{Level, event};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteActionKind {
    Insert,
    InsertList,
    Save,
    Update,
    Remove,
}

/// Context handed to a [`WriteConcernResolver`] for one write.
#[derive(Debug, Clone, Copy)]
pub struct WriteAction<'a> {
    pub kind: WriteActionKind,
    pub collection: &'a str,
    pub entity_type: Option<&'a str>,
    pub document: Option<&'a Document>,
    pub query: Option<&'a Document>,
    /// Connection default write concern.
    pub default: Option<&'a WriteConcern>,
}

impl<'a> WriteAction<'a> {
    pub fn new(kind: WriteActionKind, collection: &'a str) -> Self {
        Self {
            kind,
            collection,
            entity_type: None,
            document: None,
            query: None,
            default: None,
        }
    }

    pub fn entity_type(mut self, entity_type: &'a str) -> Self {
        self.entity_type = Some(entity_type);
        self
    }

    pub fn document(mut self, document: &'a Document) -> Self {
        self.document = Some(document);
        self
    }

    pub fn query(mut self, query: &'a Document) -> Self {
        self.query = Some(query);
        self
    }

    pub fn default_concern(mut self, default: Option<&'a WriteConcern>) -> Self {
        self.default = default;
        self
    }
}

pub trait WriteConcernResolver: Send + Sync {
    fn resolve(&self, action: &WriteAction<'_>) -> Option<WriteConcern>;
}

/// Keeps the connection default.
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultWriteConcernResolver;

impl WriteConcernResolver for DefaultWriteConcernResolver {
    fn resolve(&self, action: &WriteAction<'_>) -> Option<WriteConcern> {
        action.default.cloned()
    }
}

impl<F> WriteConcernResolver for F
where
    F: Fn(&WriteAction<'_>) -> Option<WriteConcern> + Send + Sync,
{
    fn resolve(&self, action: &WriteAction<'_>) -> Option<WriteConcern> {
        self(action)
    }
}

/// Per-write concern selection. Pure; performs no I/O.
#[derive(Clone)]
pub struct WriteConcernPolicy {
    resolver: Arc<dyn WriteConcernResolver>,
    checking: WriteResultChecking,
}

impl WriteConcernPolicy {
    pub fn new(resolver: Arc<dyn WriteConcernResolver>, checking: WriteResultChecking) -> Self {
        Self { resolver, checking }
    }

    pub fn checking(&self) -> WriteResultChecking {
        self.checking
    }

    pub fn resolve(&self, action: &WriteAction<'_>) -> Option<WriteConcern> {
        let resolved = self.resolver.resolve(action);
        if self.checking != WriteResultChecking::Exception {
            return resolved;
        }
        match resolved {
            Some(concern) if !concern.is_acknowledged() => {
                event!(
                    Level::DEBUG,
                    collection = action.collection,
                    kind = ?action.kind,
                    "unacknowledged write concern upgraded for strict result checking"
                );
                Some(WriteConcern::acknowledged())
            }
            other => other,
        }
    }
}

impl Default for WriteConcernPolicy {
    fn default() -> Self {
        Self::new(Arc::new(DefaultWriteConcernResolver), WriteResultChecking::None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_resolver_keeps_connection_default() {
        let policy = WriteConcernPolicy::default();
        let majority = WriteConcern::majority();
        let action = WriteAction::new(WriteActionKind::Save, "people").default_concern(Some(&majority));
        assert_eq!(policy.resolve(&action), Some(WriteConcern::majority()));
        assert_eq!(policy.resolve(&WriteAction::new(WriteActionKind::Save, "people")), None);
    }

    #[test]
    fn test_exception_mode_forces_acknowledged() {
        let unacknowledged = WriteConcern::unacknowledged();
        let action = WriteAction::new(WriteActionKind::Insert, "people")
            .default_concern(Some(&unacknowledged));

        let lenient = WriteConcernPolicy::default();
        assert_eq!(lenient.resolve(&action), Some(WriteConcern::unacknowledged()));

        let strict = WriteConcernPolicy::new(
            Arc::new(DefaultWriteConcernResolver),
            WriteResultChecking::Exception,
        );
        assert_eq!(strict.resolve(&action), Some(WriteConcern::acknowledged()));
    }

    fn majority_for_removes(action: &WriteAction<'_>) -> Option<WriteConcern> {
        match action.kind {
            WriteActionKind::Remove => Some(WriteConcern::majority()),
            _ => None,
        }
    }

    #[test]
    fn test_custom_resolver_sees_action() {
        let policy =
            WriteConcernPolicy::new(Arc::new(majority_for_removes), WriteResultChecking::None);
        assert_eq!(
            policy.resolve(&WriteAction::new(WriteActionKind::Remove, "c")),
            Some(WriteConcern::majority())
        );
        assert_eq!(policy.resolve(&WriteAction::new(WriteActionKind::Update, "c")), None);
    }
}

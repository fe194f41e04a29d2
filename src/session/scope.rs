use super::{ScopeState, SessionSource};
use crate::core::Result;
use crate::driver::{SessionHandle, TransactionOptions};
use crate::template::DocumentTemplate;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::OnceCell;
use tracing::{Instrument, Level, debug_span, event, info_span};

type Finalizer = Box<dyn FnOnce(&SessionHandle) + Send>;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

struct ScopeInner {
    template: DocumentTemplate,
    source: SessionSource,
    session: OnceCell<SessionHandle>,
    state: Mutex<ScopeState>,
}

impl ScopeInner {
    fn new(template: DocumentTemplate, source: SessionSource) -> Arc<Self> {
        Arc::new(Self {
            template,
            source,
            session: OnceCell::new(),
            state: Mutex::new(ScopeState::NoSession),
        })
    }

    /// The scope's session, obtained at most once.
    async fn session(&self) -> Result<SessionHandle> {
        let session = self
            .session
            .get_or_try_init(|| self.open_session())
            .await?
            .clone();
        let mut state = lock(&self.state);
        if *state == ScopeState::NoSession {
            *state = ScopeState::SessionBound;
        }
        Ok(session)
    }

    async fn open_session(&self) -> Result<SessionHandle> {
        match &self.source {
            SessionSource::Handle(handle) => Ok(handle.clone()),
            SessionSource::Options(options) => {
                let session = self
                    .template
                    .driver()
                    .start_session(options.clone())
                    .await
                    .map_err(|err| self.template.translate(err))?;
                event!(Level::DEBUG, session_id = session.id(), "session started");
                Ok(session)
            }
        }
    }

    async fn complete_transaction<R>(&self, session: &SessionHandle, outcome: Result<R>) -> Result<R> {
        match outcome {
            Ok(value) => match session.commit_transaction().await {
                Ok(()) => {
                    self.set_state(ScopeState::TransactionCommitted);
                    event!(Level::DEBUG, session_id = session.id(), "transaction committed");
                    Ok(value)
                }
                Err(err) => {
                    event!(Level::ERROR, error = %err, "transaction commit failed");
                    self.abort_open_transaction(session).await;
                    Err(self.template.translate(err))
                }
            },
            Err(err) => {
                event!(Level::WARN, error = %err, "transaction action failed, aborting");
                self.abort_open_transaction(session).await;
                Err(err)
            }
        }
    }

    async fn abort_open_transaction(&self, session: &SessionHandle) {
        if session.has_active_transaction() {
            if let Err(err) = session.abort_transaction().await {
                event!(Level::WARN, error = %err, "transaction abort failed");
            }
        }
        self.set_state(ScopeState::TransactionAborted);
    }

    fn state(&self) -> ScopeState {
        *lock(&self.state)
    }

    fn set_state(&self, state: ScopeState) {
        *lock(&self.state) = state;
    }
}

/// Runs actions against a template bound to one lazily obtained session.
#[derive(Clone)]
pub struct SessionScoped {
    inner: Arc<ScopeInner>,
}

impl SessionScoped {
    pub fn state(&self) -> ScopeState {
        self.inner.state()
    }

    pub async fn session(&self) -> Result<SessionHandle> {
        self.inner.session().await
    }

    pub async fn execute<F, Fut, R>(&self, action: F) -> Result<R>
    where
        F: FnOnce(DocumentTemplate) -> Fut,
        Fut: Future<Output = Result<R>>,
    {
        self.execute_with_finalizer(action, |_| {}).await
    }

    /// `finalizer` runs once the action is done, also when it fails or is cancelled.
    pub async fn execute_with_finalizer<F, Fut, R, Fin>(&self, action: F, finalizer: Fin) -> Result<R>
    where
        F: FnOnce(DocumentTemplate) -> Fut,
        Fut: Future<Output = Result<R>>,
        Fin: FnOnce(&SessionHandle) + Send + 'static,
    {
        let session = self.inner.session().await?;
        let span = debug_span!("session.execute", session_id = session.id());
        let guard = ScopeGuard::new(self.inner.clone(), session.clone(), Box::new(finalizer));
        let outcome = action(self.inner.template.with_session_handle(session))
            .instrument(span)
            .await;
        guard.finish(outcome).await
    }
}

/// Runs actions inside a transaction of the scope's session.
///
/// A transaction already active on the session is joined and left to its
/// owner; otherwise the scope starts one and commits it when the action
/// succeeds or aborts it when the action fails or is cancelled.
#[derive(Clone)]
pub struct TransactionScoped {
    inner: Arc<ScopeInner>,
    options: TransactionOptions,
}

impl TransactionScoped {
    pub fn transaction_options(mut self, options: TransactionOptions) -> Self {
        self.options = options;
        self
    }

    pub fn state(&self) -> ScopeState {
        self.inner.state()
    }

    pub async fn session(&self) -> Result<SessionHandle> {
        self.inner.session().await
    }

    pub async fn execute<F, Fut, R>(&self, action: F) -> Result<R>
    where
        F: FnOnce(DocumentTemplate) -> Fut,
        Fut: Future<Output = Result<R>>,
    {
        self.execute_with_finalizer(action, |_| {}).await
    }

    pub async fn execute_with_finalizer<F, Fut, R, Fin>(&self, action: F, finalizer: Fin) -> Result<R>
    where
        F: FnOnce(DocumentTemplate) -> Fut,
        Fut: Future<Output = Result<R>>,
        Fin: FnOnce(&SessionHandle) + Send + 'static,
    {
        let session = self.inner.session().await?;
        let span = info_span!("session.transaction", session_id = session.id());
        let mut guard = ScopeGuard::new(self.inner.clone(), session.clone(), Box::new(finalizer));

        if !session.has_active_transaction() {
            // owned before the await so a cancelled start still aborts
            guard.owns_transaction = true;
            if let Err(err) = session.start_transaction(self.options.clone()).await {
                event!(Level::ERROR, error = %err, "transaction start failed");
                guard.owns_transaction = false;
                return guard.finish(Err(self.inner.template.translate(err))).await;
            }
            self.inner.set_state(ScopeState::TransactionActive);
            event!(Level::DEBUG, session_id = session.id(), "transaction started");
        }

        let outcome = action(self.inner.template.with_session_handle(session))
            .instrument(span)
            .await;
        guard.finish(outcome).await
    }
}

/// Ends a scope exactly once: on `finish`, or on drop when the scope future
/// is cancelled.
struct ScopeGuard {
    inner: Arc<ScopeInner>,
    session: SessionHandle,
    finalizer: Option<Finalizer>,
    owns_transaction: bool,
}

impl ScopeGuard {
    fn new(inner: Arc<ScopeInner>, session: SessionHandle, finalizer: Finalizer) -> Self {
        Self {
            inner,
            session,
            finalizer: Some(finalizer),
            owns_transaction: false,
        }
    }

    async fn finish<R>(mut self, outcome: Result<R>) -> Result<R> {
        let result = if self.owns_transaction {
            let inner = self.inner.clone();
            let session = self.session.clone();
            inner.complete_transaction(&session, outcome).await
        } else {
            outcome
        };
        self.owns_transaction = false;
        if let Some(finalizer) = self.finalizer.take() {
            finalizer(&self.session);
        }
        result
    }
}

impl Drop for ScopeGuard {
    fn drop(&mut self) {
        let Some(finalizer) = self.finalizer.take() else {
            return;
        };
        if !self.owns_transaction {
            finalizer(&self.session);
            return;
        }

        event!(
            Level::WARN,
            session_id = self.session.id(),
            "scope cancelled with an open transaction, aborting"
        );
        let session = self.session.clone();
        let inner = self.inner.clone();
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                runtime.spawn(async move {
                    inner.abort_open_transaction(&session).await;
                    finalizer(&session);
                });
            }
            Err(_) => {
                event!(
                    Level::ERROR,
                    session_id = self.session.id(),
                    "no runtime available to abort cancelled transaction"
                );
                finalizer(&self.session);
            }
        }
    }
}

impl DocumentTemplate {
    /// Scope whose actions share one session.
    pub fn with_session(&self, source: impl Into<SessionSource>) -> SessionScoped {
        SessionScoped {
            inner: ScopeInner::new(self.clone(), source.into()),
        }
    }

    /// Scope whose actions run in one transaction. Transaction options
    /// default to those of the session options, if given.
    pub fn in_transaction(&self, source: impl Into<SessionSource>) -> TransactionScoped {
        let source = source.into();
        let options = match &source {
            SessionSource::Options(options) => options.default_transaction.clone(),
            SessionSource::Handle(_) => TransactionOptions::default(),
        };
        TransactionScoped {
            inner: ScopeInner::new(self.clone(), source),
            options,
        }
    }
}

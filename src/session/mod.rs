//! Session and transaction scoping.
//!
//! A scope lazily obtains one session (started from options or handed in by
//! the caller), binds it to a derived [`DocumentTemplate`](crate::template::DocumentTemplate)
//! and, for transactional scopes, commits or aborts exactly once when the
//! action finishes.

mod scope;

pub use scope::{SessionScoped, TransactionScoped};

use crate::driver::{SessionHandle, SessionOptions};

/// Where a scope gets its session from.
#[derive(Debug, Clone)]
pub enum SessionSource {
    /// An existing session; the scope does not own its lifetime.
    Handle(SessionHandle),
    /// Start a new session with these options on first use.
    Options(SessionOptions),
}

impl Default for SessionSource {
    fn default() -> Self {
        SessionSource::Options(SessionOptions::default())
    }
}

impl From<SessionHandle> for SessionSource {
    fn from(handle: SessionHandle) -> Self {
        SessionSource::Handle(handle)
    }
}

impl From<SessionOptions> for SessionSource {
    fn from(options: SessionOptions) -> Self {
        SessionSource::Options(options)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScopeState {
    NoSession,
    SessionBound,
    TransactionActive,
    TransactionCommitted,
    TransactionAborted,
}

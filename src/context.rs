//! The execution context shared by journal readers and migration flows.
//!
//! It replaces ambient cancellation/exception mechanisms with an explicit
//! value: `is_running()` for cooperative cancellation checks at loop
//! boundaries, and an error slot that records (rather than throws) the
//! first failure observed.

use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

/// A type-erased, displayable error suitable for storing on a [`Context`]
/// without forcing every caller onto one concrete error enum.
#[derive(Debug, Clone)]
pub struct ContextError(Arc<str>);

impl ContextError {
    pub fn new(msg: impl fmt::Display) -> Self {
        Self(msg.to_string().into())
    }
}

impl fmt::Display for ContextError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::error::Error for ContextError {}

impl<E: std::error::Error> From<&E> for ContextError {
    fn from(e: &E) -> Self {
        ContextError::new(e)
    }
}

/// Shared cooperative-cancellation + first-error context.
#[derive(Clone, Default)]
pub struct Context {
    token: CancellationToken,
    error: Arc<Mutex<Option<ContextError>>>,
}

impl Context {
    pub fn new() -> Self {
        Self {
            token: CancellationToken::new(),
            error: Arc::new(Mutex::new(None)),
        }
    }

    pub fn is_running(&self) -> bool {
        !self.token.is_cancelled()
    }

    /// Stop the context. Idempotent.
    pub fn cancel(&self) {
        self.token.cancel();
    }

    /// Record the first error only; later calls are no-ops so the earliest
    /// failure (usually the most informative) wins.
    pub fn report_error(&self, err: impl fmt::Display) {
        let mut guard = self.error.lock();
        if guard.is_none() {
            *guard = Some(ContextError::new(err));
        }
    }

    pub fn has_error(&self) -> bool {
        self.error.lock().is_some()
    }

    pub fn error(&self) -> Option<ContextError> {
        self.error.lock().clone()
    }

    /// Await cancellation; used by `select!` loops that race a read against
    /// being stopped.
    pub async fn cancelled(&self) {
        self.token.cancelled().await
    }
}

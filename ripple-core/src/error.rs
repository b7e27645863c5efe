//! Error types shared across the crate.
//!
//! Three families:
//!
//! - [`ReactiveError`] for state units, subscribers and the runtime. It is
//!   `Clone` because failures are cached and handed out to every reader and
//!   to every waiter on a pending value.
//! - [`TableError`] for the document table and predicate compilation.
//! - [`BackendError`] for the injected SQL backend.

use std::fmt;
use std::sync::Arc;

use thiserror::Error;

use crate::reactive::UnitId;

// ---------------------------------------------------------------------------
// ReactiveError
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Error)]
pub enum ReactiveError {
    /// A tracked read (`read()`) happened with no subscriber evaluating.
    #[error("unit {0} was read outside of a tracking context; use get() for untracked reads")]
    Untracked(UnitId),

    /// A subscriber (transitively) read itself while evaluating.
    #[error("dependency cycle: unit {0} was read during its own evaluation")]
    Cycle(UnitId),

    /// A pending computation was superseded by a newer one.
    #[error("computation was superseded")]
    Aborted,

    /// The value is still being computed asynchronously.
    #[error("value is still pending")]
    Pending,

    /// Nothing has been computed yet.
    #[error("no value has been computed yet")]
    NoValue,

    #[error("unit {0} was destroyed")]
    Destroyed(UnitId),

    /// Asynchronous work was requested with no tokio runtime to run it on.
    #[error("no async runtime is available to drive this computation")]
    NoRuntime,

    #[error("{0}")]
    Message(Arc<str>),

    #[error(transparent)]
    Computation(Arc<dyn std::error::Error + Send + Sync + 'static>),
}

impl ReactiveError {
    /// A plain message failure, handy inside derivation bodies.
    pub fn msg(message: impl fmt::Display) -> Self {
        Self::Message(Arc::from(message.to_string()))
    }

    /// Wrap an arbitrary error raised by user code.
    pub fn computation<E>(error: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        Self::Computation(Arc::new(error))
    }

    /// True for the cancellation kind that is always swallowed internally.
    pub fn is_abort(&self) -> bool {
        matches!(self, Self::Aborted)
    }
}

impl From<TableError> for ReactiveError {
    fn from(error: TableError) -> Self {
        Self::computation(error)
    }
}

pub type Result<T, E = ReactiveError> = std::result::Result<T, E>;

// ---------------------------------------------------------------------------
// BackendError
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum BackendError {
    /// A uniqueness / primary key / NOT NULL constraint rejected the write.
    #[error("constraint violation: {0}")]
    Constraint(String),

    /// The backend cannot execute this statement form (e.g. `RETURNING`).
    #[error("unsupported statement: {0}")]
    Unsupported(String),

    #[error("backend error: {0}")]
    Other(String),
}

impl BackendError {
    /// Whether a failed single-pass `DELETE … RETURNING` should fall back to
    /// the chunked delete path.
    pub fn is_unsupported_returning(&self) -> bool {
        match self {
            Self::Unsupported(_) => true,
            Self::Other(message) => message.to_ascii_lowercase().contains("returning"),
            Self::Constraint(_) => false,
        }
    }
}

// ---------------------------------------------------------------------------
// TableError
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum TableError {
    #[error("document is missing its key field \"{path}\"")]
    MissingKey { path: String },

    #[error("key field \"{path}\" must be {expected}, found {found}")]
    InvalidKey {
        path: String,
        expected: &'static str,
        found: String,
    },

    #[error("invalid identifier {0:?}: only ASCII letters, digits and '_' are allowed")]
    InvalidIdentifier(String),

    #[error("invalid field path {0:?}")]
    InvalidPath(String),

    #[error("invalid where clause: {0}")]
    InvalidWhere(String),

    #[error("no full-text index is declared for \"{0}\"")]
    UnknownFtsIndex(String),

    #[error("invalid tokenizer option: {0}")]
    InvalidTokenizer(String),

    #[error(transparent)]
    Backend(#[from] BackendError),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

pub type TableResult<T> = std::result::Result<T, TableError>;

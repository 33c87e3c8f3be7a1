//! Store errors with their stable wire codes.

use thiserror::Error;

/// Errors surfaced by the apply status store.
///
/// Each variant maps to a stable `E40xxx` code that is preserved on the wire
/// for compatibility with existing callers.
#[derive(Debug, Error)]
pub enum StoreError {
    /// E40020 -- the requested apply id does not exist.
    #[error("apply id {0} is not found")]
    NotFound(String),

    /// E40010 -- another apply is active; only one may run at a time.
    #[error("another layout apply is currently running")]
    AlreadyRunning,

    /// E40027 -- a suspended apply blocks admission until resumed or failed.
    #[error("suspended layout apply {0} exists; resume or cancel it first")]
    SuspendedExists(String),

    /// E40022 -- the apply already reached a terminal state.
    #[error("apply id {0} has already been executed")]
    AlreadyExecuted(String),

    /// E40024 -- delete refused while the apply is still being processed.
    #[error("apply id {0} cannot be deleted while it is in progress")]
    DeleteConflict(String),

    /// E40018 -- connection-level database failure.
    #[error("database operational error: {0}")]
    Operational(sqlx::Error),

    /// E40019 -- query-level database failure.
    #[error("database query error: {0}")]
    Query(sqlx::Error),
}

impl StoreError {
    /// Stable error code for wire responses and logs.
    pub fn code(&self) -> &'static str {
        match self {
            Self::NotFound(_) => "E40020",
            Self::AlreadyRunning => "E40010",
            Self::SuspendedExists(_) => "E40027",
            Self::AlreadyExecuted(_) => "E40022",
            Self::DeleteConflict(_) => "E40024",
            Self::Operational(_) => "E40018",
            Self::Query(_) => "E40019",
        }
    }
}

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::Io(_)
            | sqlx::Error::Tls(_)
            | sqlx::Error::PoolTimedOut
            | sqlx::Error::PoolClosed
            | sqlx::Error::Protocol(_) => Self::Operational(err),
            other => Self::Query(other),
        }
    }
}

//! Crate-wide error taxonomy.
//!
//! RPC handlers in `src/service` are the only place `SweepError` becomes a
//! `tonic::Status`; everywhere else in the core it propagates as
//! `Result<T, SweepError>` per the propagation policy in `DESIGN.md`.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum SweepError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("daemon already running (pid {0})")]
    AlreadyRunning(u32),

    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("walk error at {path}: {source}")]
    Walk {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("operation cancelled")]
    Cancelled,

    #[error("unavailable: {0}")]
    Unavailable(String),

    #[error("invalid argument: {0}")]
    Invalid(String),
}

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("database error: {0}")]
    Database(#[from] redb::DatabaseError),

    #[error("transaction error: {0}")]
    Transaction(#[from] redb::TransactionError),

    #[error("table error: {0}")]
    Table(#[from] redb::TableError),

    #[error("storage error: {0}")]
    Storage(#[from] redb::StorageError),

    #[error("commit error: {0}")]
    Commit(#[from] redb::CommitError),

    #[error("encoding error: {0}")]
    Encoding(#[from] serde_json::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<SweepError> for tonic::Status {
    fn from(err: SweepError) -> Self {
        match err {
            SweepError::NotFound(msg) => tonic::Status::not_found(msg),
            SweepError::AlreadyRunning(pid) => {
                tonic::Status::already_exists(format!("daemon already running (pid {pid})"))
            }
            SweepError::Storage(e) => tonic::Status::internal(e.to_string()),
            SweepError::Walk { path, source } => {
                tonic::Status::internal(format!("walk error at {path}: {source}"))
            }
            SweepError::Cancelled => tonic::Status::cancelled("operation cancelled"),
            SweepError::Unavailable(msg) => tonic::Status::unavailable(msg),
            SweepError::Invalid(msg) => tonic::Status::invalid_argument(msg),
        }
    }
}

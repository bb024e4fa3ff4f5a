use rusqlite::ErrorCode;
use std::path::PathBuf;
use thiserror::Error;

/// Errors raised by the persistent store.
#[derive(Debug, Error)]
pub enum StoreError {
  #[error("sqlite error: {0}")]
  Sqlite(#[from] rusqlite::Error),

  #[error("failed to prepare data directory {}: {source}", path.display())]
  Io {
    path: PathBuf,
    #[source]
    source: std::io::Error,
  },

  #[error("could not allocate a unique public id in {table}")]
  PublicIdExhausted { table: &'static str },

  #[error("blocking store task failed: {0}")]
  Task(String),
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Outcome of a store write, with concurrent-writer collisions as a normal branch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WriteOutcome {
  Ok,
  /// Another writer already committed conflicting rows
  AlreadyExists,
  TransientError(String),
}

impl StoreError {
  /// Classify a failed write.
  pub fn outcome(&self) -> WriteOutcome {
    match self {
      Self::Sqlite(err) if err.sqlite_error_code() == Some(ErrorCode::ConstraintViolation) => {
        WriteOutcome::AlreadyExists
      }
      other => WriteOutcome::TransientError(other.to_string()),
    }
  }
}


//! SQLite persistent tier.
//!
//! Every call opens its own short-lived connection; no connection outlives the query or
//! transaction it serves. Writers are serialized by SQLite (WAL + busy timeout).

mod books;
mod chapters;
mod error;
mod maintenance;
mod pending;
pub mod schema;

pub use chapters::RefsReport;
pub use error::{StoreError, StoreResult, WriteOutcome};
pub use maintenance::{AuthorCount, BookExport, ChapterExport, DatabaseStats};
pub use pending::QueueCounts;

use rusqlite::{params, Connection, OptionalExtension};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use uuid::Uuid;

/// Length in hex characters of generated public ids.
const PUBLIC_ID_LEN: usize = 12;
const PUBLIC_ID_ATTEMPTS: usize = 8;

/// Handle to the persistent store.
///
/// Cloning is cheap; all clones share the same public-id assignment lock.
#[derive(Debug, Clone)]
pub struct Database {
  path: Arc<PathBuf>,
  busy_timeout: Duration,
  /// Serializes public id assignment so concurrent first writes never collide
  public_id_lock: Arc<Mutex<()>>,
}

impl Database {
  /// Open or create the database at `path` and run migrations.
  pub fn open(path: &Path, busy_timeout: Duration) -> StoreResult<Self> {
    // Ensure parent directory exists
    if let Some(parent) = path.parent() {
      if !parent.as_os_str().is_empty() {
        std::fs::create_dir_all(parent).map_err(|source| StoreError::Io {
          path: parent.to_path_buf(),
          source,
        })?;
      }
    }

    let db = Self {
      path: Arc::new(path.to_path_buf()),
      busy_timeout,
      public_id_lock: Arc::new(Mutex::new(())),
    };
    db.run_migrations()?;

    tracing::info!(path = %path.display(), "Opened store");
    Ok(db)
  }

  /// Get the default database path
  pub fn default_path() -> Option<PathBuf> {
    let data_dir = dirs::data_dir().or_else(|| dirs::home_dir().map(|p| p.join(".local/share")))?;
    Some(data_dir.join("novelcache").join("cache.db"))
  }

  pub fn path(&self) -> &Path {
    &self.path
  }

  /// Run database migrations
  fn run_migrations(&self) -> StoreResult<()> {
    let conn = self.session()?;
    conn.pragma_update(None, "journal_mode", "WAL")?;
    conn.execute_batch(schema::SCHEMA)?;
    Ok(())
  }

  /// Open a short-lived connection for a single call.
  pub fn session(&self) -> StoreResult<Connection> {
    let conn = Connection::open(self.path.as_ref())?;
    conn.busy_timeout(self.busy_timeout)?;
    conn.pragma_update(None, "synchronous", "NORMAL")?;
    Ok(conn)
  }

  /// Run a blocking store call on tokio's blocking pool.
  pub async fn run<T, F>(&self, f: F) -> StoreResult<T>
  where
    T: Send + 'static,
    F: FnOnce(&Database) -> StoreResult<T> + Send + 'static,
  {
    let db = self.clone();
    tokio::task::spawn_blocking(move || f(&db))
      .await
      .map_err(|e| StoreError::Task(e.to_string()))?
  }

  /// Hold the public id lock for the duration of `f`.
  fn with_public_id_lock<T>(&self, f: impl FnOnce() -> StoreResult<T>) -> StoreResult<T> {
    // The guarded value is (), so a poisoned lock carries no broken state
    let _guard = self
      .public_id_lock
      .lock()
      .unwrap_or_else(|poisoned| poisoned.into_inner());
    f()
  }
}

/// Generate a short random token for public urls.
pub(crate) fn new_public_id() -> String {
  let mut id = hex::encode(Uuid::new_v4().as_bytes());
  id.truncate(PUBLIC_ID_LEN);
  id
}

/// Generate a public id not yet used in `table`.
pub(crate) fn fresh_public_id(conn: &Connection, table: &'static str) -> StoreResult<String> {
  let sql = format!("SELECT 1 FROM {} WHERE public_id = ?", table);
  for _ in 0..PUBLIC_ID_ATTEMPTS {
    let candidate = new_public_id();
    let taken: Option<i64> = conn
      .query_row(&sql, params![candidate], |row| row.get(0))
      .optional()?;
    if taken.is_none() {
      return Ok(candidate);
    }
  }
  Err(StoreError::PublicIdExhausted { table })
}

#[cfg(test)]
pub(crate) mod testing {
  use super::Database;
  use std::time::Duration;
  use tempfile::TempDir;

  /// A database in a fresh temporary directory; keep the `TempDir` alive for the test.
  pub fn temp_db() -> (TempDir, Database) {
    let dir = tempfile::tempdir().expect("tempdir");
    let db = Database::open(&dir.path().join("cache.db"), Duration::from_secs(5)).expect("open db");
    (dir, db)
  }
}

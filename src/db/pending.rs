//! Persistent pending-sync queue feeding the daily orchestrator.

use chrono::{DateTime, Utc};
use rusqlite::types::{FromSql, FromSqlError, FromSqlResult, ToSql, ToSqlOutput, ValueRef};
use rusqlite::{params, OptionalExtension, Row, TransactionBehavior};
use serde::Serialize;

use super::{Database, StoreResult};
use crate::types::{PendingEntry, SyncStatus};

/// Priority given to rows created by a user-facing access.
pub const ACCESS_PRIORITY: i32 = 0;

impl ToSql for SyncStatus {
  fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
    Ok(ToSqlOutput::from(self.as_str()))
  }
}

impl FromSql for SyncStatus {
  fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
    value
      .as_str()?
      .parse()
      .map_err(|e: String| FromSqlError::Other(e.into()))
  }
}

/// Row counts per status.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct QueueCounts {
  pub total: u64,
  pub pending: u64,
  pub syncing: u64,
  pub completed: u64,
  pub failed: u64,
}

const ENTRY_COLUMNS: &str =
  "book_id, added_at, accessed_at, access_count, priority, last_sync_attempt, sync_status";

fn entry_from_row(row: &Row<'_>) -> rusqlite::Result<PendingEntry> {
  Ok(PendingEntry {
    book_id: row.get(0)?,
    added_at: row.get(1)?,
    accessed_at: row.get(2)?,
    access_count: row.get(3)?,
    priority: row.get(4)?,
    last_sync_attempt: row.get(5)?,
    status: row.get(6)?,
  })
}

impl Database {
  /// Record a user-facing access to a book.
  ///
  /// Creates the row on first access; otherwise bumps the counter and moves a
  /// completed/failed row back to pending.
  pub fn track_access(&self, book_id: &str) -> StoreResult<()> {
    let conn = self.session()?;
    conn.execute(
      "INSERT INTO pending_sync (book_id, added_at, accessed_at, access_count, priority, sync_status)
       VALUES (?1, ?2, ?2, 1, ?3, 'pending')
       ON CONFLICT(book_id) DO UPDATE SET
         accessed_at = excluded.accessed_at,
         access_count = pending_sync.access_count + 1,
         last_sync_attempt = CASE WHEN pending_sync.sync_status IN ('completed', 'failed')
           THEN NULL ELSE pending_sync.last_sync_attempt END,
         sync_status = CASE WHEN pending_sync.sync_status IN ('completed', 'failed')
           THEN 'pending' ELSE pending_sync.sync_status END",
      params![book_id, Utc::now(), ACCESS_PRIORITY],
    )?;
    Ok(())
  }

  /// Make sure every given book has a pending row with at least `priority`.
  ///
  /// Completed/failed rows go back to pending with a bumped access counter. Returns the number
  /// of rows created.
  pub fn enqueue_pending(&self, book_ids: &[String], priority: i32) -> StoreResult<usize> {
    let mut conn = self.session()?;
    let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
    let now = Utc::now();
    let mut added = 0;

    for book_id in book_ids {
      let status: Option<SyncStatus> = tx
        .query_row(
          "SELECT sync_status FROM pending_sync WHERE book_id = ?",
          params![book_id],
          |row| row.get(0),
        )
        .optional()?;

      match status {
        None => {
          tx.execute(
            "INSERT INTO pending_sync (book_id, added_at, accessed_at, access_count, priority, sync_status)
             VALUES (?1, ?2, ?2, 0, ?3, 'pending')",
            params![book_id, now, priority],
          )?;
          added += 1;
        }
        Some(SyncStatus::Completed) | Some(SyncStatus::Failed) => {
          tx.execute(
            "UPDATE pending_sync SET
               sync_status = 'pending',
               accessed_at = ?2,
               access_count = access_count + 1,
               priority = MAX(priority, ?3)
             WHERE book_id = ?1",
            params![book_id, now, priority],
          )?;
        }
        Some(_) => {
          tx.execute(
            "UPDATE pending_sync SET priority = MAX(priority, ?2) WHERE book_id = ?1",
            params![book_id, priority],
          )?;
        }
      }
    }

    tx.commit()?;
    Ok(added)
  }

  /// Manually put a book back in the queue with the given priority.
  pub fn requeue_pending(&self, book_id: &str, priority: i32) -> StoreResult<()> {
    let conn = self.session()?;
    conn.execute(
      "INSERT INTO pending_sync (book_id, added_at, accessed_at, access_count, priority, sync_status)
       VALUES (?1, ?2, ?2, 0, ?3, 'pending')
       ON CONFLICT(book_id) DO UPDATE SET
         sync_status = 'pending',
         priority = excluded.priority,
         last_sync_attempt = NULL",
      params![book_id, Utc::now(), priority],
    )?;
    Ok(())
  }

  /// Pending rows, highest priority first, then most accessed.
  pub fn pending_entries(&self) -> StoreResult<Vec<PendingEntry>> {
    let conn = self.session()?;
    let mut stmt = conn.prepare(&format!(
      "SELECT {} FROM pending_sync WHERE sync_status = 'pending'
       ORDER BY priority DESC, access_count DESC, added_at ASC, book_id ASC",
      ENTRY_COLUMNS
    ))?;
    let entries = stmt
      .query_map([], entry_from_row)?
      .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(entries)
  }

  pub fn pending_entry(&self, book_id: &str) -> StoreResult<Option<PendingEntry>> {
    let conn = self.session()?;
    let entry = conn
      .query_row(
        &format!("SELECT {} FROM pending_sync WHERE book_id = ?", ENTRY_COLUMNS),
        params![book_id],
        entry_from_row,
      )
      .optional()?;
    Ok(entry)
  }

  /// Mark a row as syncing and stamp the attempt time.
  pub fn mark_syncing(&self, book_id: &str) -> StoreResult<()> {
    let conn = self.session()?;
    conn.execute(
      "UPDATE pending_sync SET sync_status = 'syncing', last_sync_attempt = ?2 WHERE book_id = ?1",
      params![book_id, Utc::now()],
    )?;
    Ok(())
  }

  pub fn set_sync_status(&self, book_id: &str, status: SyncStatus) -> StoreResult<()> {
    let conn = self.session()?;
    conn.execute(
      "UPDATE pending_sync SET sync_status = ?2 WHERE book_id = ?1",
      params![book_id, status],
    )?;
    Ok(())
  }

  /// Move a syncing row to its final status. Returns false if the row was not syncing.
  pub fn resolve_syncing(&self, book_id: &str, status: SyncStatus) -> StoreResult<bool> {
    let conn = self.session()?;
    let changed = conn.execute(
      "UPDATE pending_sync SET sync_status = ?2 WHERE book_id = ?1 AND sync_status = 'syncing'",
      params![book_id, status],
    )?;
    Ok(changed > 0)
  }

  /// Return rows stuck in syncing since before `cutoff` to pending.
  pub fn reset_stale_syncing(&self, cutoff: DateTime<Utc>) -> StoreResult<usize> {
    let conn = self.session()?;
    Ok(conn.execute(
      "UPDATE pending_sync SET sync_status = 'pending'
       WHERE sync_status = 'syncing' AND (last_sync_attempt IS NULL OR last_sync_attempt < ?1)",
      params![cutoff],
    )?)
  }

  /// Delete every completed/failed row.
  pub fn clear_finished_entries(&self) -> StoreResult<usize> {
    let conn = self.session()?;
    Ok(conn.execute(
      "DELETE FROM pending_sync WHERE sync_status IN ('completed', 'failed')",
      [],
    )?)
  }

  /// Delete completed/failed rows last touched before `cutoff`.
  pub fn prune_finished_entries(&self, cutoff: DateTime<Utc>) -> StoreResult<usize> {
    let conn = self.session()?;
    Ok(conn.execute(
      "DELETE FROM pending_sync
       WHERE sync_status IN ('completed', 'failed')
         AND COALESCE(last_sync_attempt, accessed_at) < ?1",
      params![cutoff],
    )?)
  }

  pub fn queue_counts(&self) -> StoreResult<QueueCounts> {
    let conn = self.session()?;
    let mut stmt = conn.prepare("SELECT sync_status, COUNT(*) FROM pending_sync GROUP BY sync_status")?;
    let mut counts = QueueCounts::default();
    let rows = stmt.query_map([], |row| Ok((row.get::<_, SyncStatus>(0)?, row.get::<_, i64>(1)?)))?;
    for row in rows {
      let (status, n) = row?;
      let n = n as u64;
      counts.total += n;
      match status {
        SyncStatus::Pending => counts.pending = n,
        SyncStatus::Syncing => counts.syncing = n,
        SyncStatus::Completed => counts.completed = n,
        SyncStatus::Failed => counts.failed = n,
      }
    }
    Ok(counts)
  }
}

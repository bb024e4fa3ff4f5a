//! Once-a-day catch-up pass over the pending queue.

use chrono::{DateTime, Local, NaiveDate, NaiveTime, Utc};
use serde::Serialize;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};

use super::schedule::is_due;
use super::{lock, UNFINISHED_PRIORITY};
use crate::config::DailySyncConfig;
use crate::db::{Database, QueueCounts};
use crate::jobs::{JobManager, JobOutcome};
use crate::types::SyncStatus;

#[derive(Debug, Clone)]
pub struct DailySettings {
  pub target: NaiveTime,
  /// Pause between two enqueued books
  pub slow_interval: Duration,
  pub check_interval: Duration,
  pub stale_syncing: Duration,
  pub prune_after_days: u32,
  pub finished_status: String,
}

impl DailySettings {
  pub fn from_config(config: &DailySyncConfig, finished_status: &str) -> Self {
    let target = NaiveTime::from_hms_opt(config.hour, config.minute, 0).unwrap_or_else(|| {
      tracing::warn!(hour = config.hour, minute = config.minute, "Invalid daily sync time, using midnight");
      NaiveTime::MIN
    });
    Self {
      target,
      slow_interval: Duration::from_millis(config.slow_rate_limit_ms),
      check_interval: Duration::from_secs(config.check_interval_secs.max(1)),
      stale_syncing: Duration::from_secs(config.stale_syncing_secs),
      prune_after_days: config.prune_after_days,
      finished_status: finished_status.to_string(),
    }
  }
}

/// What one daily pass did.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DailyReport {
  pub pruned: usize,
  pub reset_stale: usize,
  /// Unfinished books newly added to the pending queue
  pub added: usize,
  pub pending: usize,
  /// Books handed to the job manager
  pub queued: usize,
  /// Books the job manager refused (already syncing or synced recently)
  pub skipped: usize,
  pub errors: usize,
  pub interrupted: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DailyQueueStats {
  #[serde(flatten)]
  pub counts: QueueCounts,
  pub last_sync_date: Option<NaiveDate>,
  pub next_sync_time: String,
  pub slow_rate_limit_secs: f64,
  pub running: bool,
}

struct Inner {
  db: Database,
  jobs: JobManager,
  settings: DailySettings,
  last_sync_date: Mutex<Option<NaiveDate>>,
  /// Serializes passes: the scheduler and a manual trigger never overlap
  pass: tokio::sync::Mutex<()>,
  shutdown: watch::Sender<bool>,
  handles: Mutex<Vec<JoinHandle<()>>>,
}

/// Daily orchestrator: at the configured local time, queue every unfinished or requested book
/// slowly, most-requested first.
#[derive(Clone)]
pub struct DailySync {
  inner: Arc<Inner>,
}

impl DailySync {
  pub fn new(db: Database, jobs: JobManager, settings: DailySettings) -> Self {
    tracing::info!(
      sync_time = %settings.target.format("%H:%M"),
      slow_interval_ms = settings.slow_interval.as_millis() as u64,
      "Initialized daily sync"
    );
    let (shutdown, _) = watch::channel(false);
    Self {
      inner: Arc::new(Inner {
        db,
        jobs,
        settings,
        last_sync_date: Mutex::new(None),
        pass: tokio::sync::Mutex::new(()),
        shutdown,
        handles: Mutex::new(Vec::new()),
      }),
    }
  }

  pub fn is_running(&self) -> bool {
    !lock(&self.inner.handles).is_empty()
  }

  /// Spawn the scheduler loop and the job outcome listener.
  pub fn start(&self) {
    if self.is_running() {
      tracing::warn!("Daily sync already running");
      return;
    }
    self.inner.shutdown.send_replace(false);

    let listener = self.spawn_outcome_listener();
    let this = self.clone();
    let shutdown = self.inner.shutdown.subscribe();
    let scheduler = tokio::spawn(async move { this.scheduler_loop(shutdown).await });

    lock(&self.inner.handles).extend([scheduler, listener]);
    tracing::info!("Daily sync scheduler started");
  }

  /// Stop the loops. A pass in progress stops before its next book.
  pub async fn stop(&self, timeout: Duration) {
    tracing::info!("Stopping daily sync scheduler");
    self.inner.shutdown.send_replace(true);

    let handles = std::mem::take(&mut *lock(&self.inner.handles));
    for handle in handles {
      if tokio::time::timeout(timeout, handle).await.is_err() {
        tracing::warn!("Daily sync task did not stop in time, detaching");
      }
    }
    tracing::info!("Daily sync scheduler stopped");
  }

  async fn scheduler_loop(self, mut shutdown: watch::Receiver<bool>) {
    let mut ticker = interval(self.inner.settings.check_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
      tokio::select! {
        _ = ticker.tick() => {
          let now = Local::now().naive_local();
          let last = *lock(&self.inner.last_sync_date);
          if is_due(now, last, self.inner.settings.target) {
            tracing::info!(at = %now, "Starting daily sync");
            let report = self.run_pass().await;
            *lock(&self.inner.last_sync_date) = Some(now.date());
            tracing::info!(?report, "Daily sync finished");
          }
        }
        changed = shutdown.changed() => {
          if changed.is_err() || *shutdown.borrow() {
            break;
          }
        }
      }
    }
  }

  /// Resolve `syncing` rows once the job manager reports the real result.
  pub(crate) fn spawn_outcome_listener(&self) -> JoinHandle<()> {
    let db = self.inner.db.clone();
    let mut outcomes = self.inner.jobs.subscribe();
    let mut shutdown = self.inner.shutdown.subscribe();

    tokio::spawn(async move {
      loop {
        let outcome = tokio::select! {
          received = outcomes.recv() => received,
          changed = shutdown.changed() => {
            if changed.is_err() || *shutdown.borrow() {
              break;
            }
            continue;
          }
        };

        let (book_id, status) = match outcome {
          Ok(JobOutcome::Completed { book_id }) => (book_id, SyncStatus::Completed),
          Ok(JobOutcome::Failed { book_id, .. }) => (book_id, SyncStatus::Failed),
          Err(broadcast::error::RecvError::Lagged(missed)) => {
            // Rows left syncing are reset by the next pass
            tracing::warn!(missed, "Daily sync missed job outcomes");
            continue;
          }
          Err(broadcast::error::RecvError::Closed) => break,
        };

        let id = book_id.clone();
        match db.run(move |db| db.resolve_syncing(&id, status)).await {
          Ok(true) => tracing::debug!(book_id, %status, "Resolved pending sync entry"),
          Ok(false) => {}
          Err(err) => tracing::warn!(book_id, error = %err, "Failed to resolve pending sync entry"),
        }
      }
    })
  }

  /// Record a user-facing read of a book.
  pub async fn track_access(&self, book_id: &str) {
    let id = book_id.to_string();
    if let Err(err) = self.inner.db.run(move |db| db.track_access(&id)).await {
      tracing::warn!(book_id, error = %err, "Failed to track book access");
    }
  }

  /// Run a full pass now, regardless of the schedule.
  pub async fn trigger_now(&self) -> DailyReport {
    tracing::info!("Manual daily sync triggered");
    let report = self.run_pass().await;
    *lock(&self.inner.last_sync_date) = Some(Local::now().date_naive());
    report
  }

  /// Add every unfinished book to the pending queue. Returns the rows created.
  pub async fn enqueue_unfinished(&self) -> usize {
    let finished = self.inner.settings.finished_status.clone();
    let result = self
      .inner
      .db
      .run(move |db| {
        let ids = db.unfinished_book_ids(&finished)?;
        db.enqueue_pending(&ids, UNFINISHED_PRIORITY)
      })
      .await;
    match result {
      Ok(added) => {
        tracing::info!(added, "Enqueued unfinished books for daily sync");
        added
      }
      Err(err) => {
        tracing::error!(error = %err, "Failed to enqueue unfinished books");
        0
      }
    }
  }

  /// Delete completed and failed entries. Returns the rows removed.
  pub async fn clear_completed(&self) -> usize {
    match self.inner.db.run(|db| db.clear_finished_entries()).await {
      Ok(deleted) => {
        tracing::info!(deleted, "Cleared completed pending sync entries");
        deleted
      }
      Err(err) => {
        tracing::error!(error = %err, "Failed to clear pending sync entries");
        0
      }
    }
  }

  /// Put a book back in the pending queue with the given priority.
  pub async fn requeue(&self, book_id: &str, priority: i32) -> bool {
    let id = book_id.to_string();
    match self.inner.db.run(move |db| db.requeue_pending(&id, priority)).await {
      Ok(()) => true,
      Err(err) => {
        tracing::warn!(book_id, error = %err, "Failed to requeue book");
        false
      }
    }
  }

  pub async fn queue_stats(&self) -> DailyQueueStats {
    let counts = self.inner.db.run(|db| db.queue_counts()).await.unwrap_or_else(|err| {
      tracing::warn!(error = %err, "Failed to count pending sync entries");
      QueueCounts::default()
    });
    DailyQueueStats {
      counts,
      last_sync_date: *lock(&self.inner.last_sync_date),
      next_sync_time: self.inner.settings.target.format("%H:%M").to_string(),
      slow_rate_limit_secs: self.inner.settings.slow_interval.as_secs_f64(),
      running: self.is_running(),
    }
  }

  pub async fn run_pass(&self) -> DailyReport {
    let _pass = self.inner.pass.lock().await;
    let mut report = DailyReport::default();
    let settings = &self.inner.settings;

    // Housekeeping
    let now = Utc::now();
    let prune_cutoff = now
      .checked_sub_signed(chrono::Duration::days(i64::from(settings.prune_after_days)))
      .unwrap_or(DateTime::<Utc>::MIN_UTC);
    let stale_cutoff = chrono::Duration::from_std(settings.stale_syncing)
      .ok()
      .and_then(|age| now.checked_sub_signed(age))
      .unwrap_or(DateTime::<Utc>::MIN_UTC);
    match self
      .inner
      .db
      .run(move |db| Ok((db.prune_finished_entries(prune_cutoff)?, db.reset_stale_syncing(stale_cutoff)?)))
      .await
    {
      Ok((pruned, reset)) => {
        report.pruned = pruned;
        report.reset_stale = reset;
      }
      Err(err) => {
        tracing::warn!(error = %err, "Pending queue housekeeping failed");
        report.errors += 1;
      }
    }

    // Step 1: every unfinished book gets a pending row
    report.added = self.enqueue_unfinished().await;

    // Step 2: most important first
    let entries = match self.inner.db.run(|db| db.pending_entries()).await {
      Ok(entries) => entries,
      Err(err) => {
        tracing::error!(error = %err, "Failed to load pending sync entries");
        report.errors += 1;
        return report;
      }
    };
    report.pending = entries.len();
    if entries.is_empty() {
      tracing::info!("No pending books to sync");
      return report;
    }
    tracing::info!(count = entries.len(), "Processing pending sync queue");

    // Step 3: hand each book to the job manager, slowly
    let mut shutdown = self.inner.shutdown.subscribe();
    let total = entries.len();
    for (i, entry) in entries.into_iter().enumerate() {
      if *shutdown.borrow() {
        tracing::info!(remaining = total - i, "Stopping daily sync early");
        report.interrupted = true;
        break;
      }

      tracing::info!(
        book_id = %entry.book_id,
        position = i + 1,
        total,
        access_count = entry.access_count,
        "Syncing book"
      );

      let id = entry.book_id.clone();
      if let Err(err) = self.inner.db.run(move |db| db.mark_syncing(&id)).await {
        tracing::warn!(book_id = %entry.book_id, error = %err, "Failed to mark book syncing");
        report.errors += 1;
        continue;
      }

      if self.inner.jobs.enqueue(&entry.book_id, entry.priority) {
        report.queued += 1;
      } else {
        // Already syncing or synced within the cooldown
        tracing::debug!(book_id = %entry.book_id, "Book already synced or syncing");
        report.skipped += 1;
        let id = entry.book_id.clone();
        if let Err(err) = self
          .inner
          .db
          .run(move |db| db.set_sync_status(&id, SyncStatus::Completed))
          .await
        {
          tracing::warn!(book_id = %entry.book_id, error = %err, "Failed to update pending sync entry");
          report.errors += 1;
        }
      }

      if i + 1 < total && !settings.slow_interval.is_zero() {
        tokio::select! {
          _ = tokio::time::sleep(settings.slow_interval) => {}
          _ = shutdown.wait_for(|stop| *stop) => {}
        }
      }
    }

    report
  }
}

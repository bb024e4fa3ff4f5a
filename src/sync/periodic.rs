//! Fixed-cadence freshness pass over unfinished books.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};

use super::lock;
use crate::config::PeriodicSyncConfig;
use crate::db::Database;
use crate::jobs::JobManager;

#[derive(Debug, Clone)]
pub struct PeriodicSettings {
  pub interval: Duration,
  pub priority: i32,
  pub initial_delay: Duration,
  pub check_interval: Duration,
  pub finished_status: String,
}

impl PeriodicSettings {
  pub fn from_config(config: &PeriodicSyncConfig, finished_status: &str) -> Self {
    Self {
      interval: Duration::from_secs(config.interval_hours.max(1) * 3600),
      priority: config.priority,
      initial_delay: Duration::from_secs(config.initial_delay_secs),
      check_interval: Duration::from_secs(config.check_interval_secs.max(1)),
      finished_status: finished_status.to_string(),
    }
  }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PeriodicReport {
  pub candidates: usize,
  pub queued: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PeriodicStats {
  pub running: bool,
  pub interval_hours: f64,
  pub last_sync: Option<DateTime<Utc>>,
  pub next_sync: Option<DateTime<Utc>>,
  pub priority: i32,
}

#[derive(Debug, Default)]
struct Schedule {
  last_sync: Option<DateTime<Utc>>,
  next_sync: Option<DateTime<Utc>>,
}

struct Inner {
  db: Database,
  jobs: JobManager,
  settings: PeriodicSettings,
  schedule: Mutex<Schedule>,
  shutdown: watch::Sender<bool>,
  handle: Mutex<Option<JoinHandle<()>>>,
}

/// Periodic orchestrator: shortly after start, then every interval, queue every unfinished book
/// at a low priority. Pacing is left to the job manager.
#[derive(Clone)]
pub struct PeriodicSync {
  inner: Arc<Inner>,
}

/// `now + delay`, pinned to the end of the calendar when that overflows.
fn after(now: DateTime<Utc>, delay: Duration) -> DateTime<Utc> {
  chrono::Duration::from_std(delay)
    .ok()
    .and_then(|delay| now.checked_add_signed(delay))
    .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

impl PeriodicSync {
  pub fn new(db: Database, jobs: JobManager, settings: PeriodicSettings) -> Self {
    tracing::info!(
      interval_secs = settings.interval.as_secs(),
      priority = settings.priority,
      "Initialized periodic sync"
    );
    let (shutdown, _) = watch::channel(false);
    Self {
      inner: Arc::new(Inner {
        db,
        jobs,
        settings,
        schedule: Mutex::new(Schedule::default()),
        shutdown,
        handle: Mutex::new(None),
      }),
    }
  }

  pub fn is_running(&self) -> bool {
    lock(&self.inner.handle).is_some()
  }

  pub fn start(&self) {
    let mut handle = lock(&self.inner.handle);
    if handle.is_some() {
      tracing::warn!("Periodic sync already running");
      return;
    }
    self.inner.shutdown.send_replace(false);
    lock(&self.inner.schedule).next_sync = Some(after(Utc::now(), self.inner.settings.initial_delay));

    let this = self.clone();
    let shutdown = self.inner.shutdown.subscribe();
    *handle = Some(tokio::spawn(async move { this.scheduler_loop(shutdown).await }));
    tracing::info!(
      first_run_in_secs = self.inner.settings.initial_delay.as_secs(),
      "Periodic sync scheduler started"
    );
  }

  pub async fn stop(&self, timeout: Duration) {
    tracing::info!("Stopping periodic sync scheduler");
    self.inner.shutdown.send_replace(true);
    let handle = lock(&self.inner.handle).take();
    if let Some(handle) = handle {
      if tokio::time::timeout(timeout, handle).await.is_err() {
        tracing::warn!("Periodic sync task did not stop in time, detaching");
      }
    }
    tracing::info!("Periodic sync scheduler stopped");
  }

  async fn scheduler_loop(self, mut shutdown: watch::Receiver<bool>) {
    let mut ticker = interval(self.inner.settings.check_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
      tokio::select! {
        _ = ticker.tick() => {
          let due = lock(&self.inner.schedule)
            .next_sync
            .is_some_and(|next| Utc::now() >= next);
          if due {
            self.trigger_now().await;
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

  /// Run a pass now and push the next scheduled pass one interval out.
  pub async fn trigger_now(&self) -> PeriodicReport {
    tracing::info!("Starting periodic sync");
    let report = self.run_pass().await;
    let now = Utc::now();
    {
      let mut schedule = lock(&self.inner.schedule);
      schedule.last_sync = Some(now);
      schedule.next_sync = Some(after(now, self.inner.settings.interval));
    }
    tracing::info!(candidates = report.candidates, queued = report.queued, "Periodic sync finished");
    report
  }

  /// Enqueue every unfinished book at the periodic priority.
  pub async fn run_pass(&self) -> PeriodicReport {
    let finished = self.inner.settings.finished_status.clone();
    let ids = match self.inner.db.run(move |db| db.unfinished_book_ids(&finished)).await {
      Ok(ids) => ids,
      Err(err) => {
        tracing::error!(error = %err, "Failed to list unfinished books");
        return PeriodicReport::default();
      }
    };

    PeriodicReport {
      candidates: ids.len(),
      queued: self.inner.jobs.enqueue_batch(&ids, self.inner.settings.priority),
    }
  }

  pub fn stats(&self) -> PeriodicStats {
    let running = self.is_running();
    let schedule = lock(&self.inner.schedule);
    PeriodicStats {
      running,
      interval_hours: self.inner.settings.interval.as_secs_f64() / 3600.0,
      last_sync: schedule.last_sync,
      next_sync: schedule.next_sync,
      priority: self.inner.settings.priority,
    }
  }
}

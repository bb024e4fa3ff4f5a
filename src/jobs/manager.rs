//! Worker pool refreshing books from the origin.

use chrono::{DateTime, Utc};
use futures::FutureExt;
use serde::Serialize;
use std::collections::BTreeMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{broadcast, watch, Notify};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use super::queue::{JobState, SyncJob};
use crate::cache::HybridCache;
use crate::config::JobsConfig;
use crate::origin::{Origin, OriginError};

/// Idle workers re-check the queue at least this often.
const IDLE_POLL: Duration = Duration::from_secs(1);
const OUTCOME_CAPACITY: usize = 256;
/// Stand-in deadline when the configured job timeout overflows the clock.
const FAR_FUTURE: Duration = Duration::from_secs(365 * 24 * 3600);

#[derive(Debug, Clone)]
pub struct JobSettings {
  pub workers: usize,
  pub rate_limit: Duration,
  pub cooldown: Duration,
  pub job_timeout: Duration,
  pub shutdown_timeout: Duration,
}

impl From<&JobsConfig> for JobSettings {
  fn from(config: &JobsConfig) -> Self {
    Self {
      workers: config.workers.max(1),
      rate_limit: Duration::from_millis(config.rate_limit_ms),
      cooldown: Duration::from_secs(config.cooldown_secs),
      job_timeout: Duration::from_secs(config.job_timeout_secs),
      shutdown_timeout: Duration::from_secs(config.shutdown_timeout_secs),
    }
  }
}

#[derive(Debug, Error)]
pub enum JobError {
  #[error(transparent)]
  Origin(#[from] OriginError),

  #[error("timed out after {0:?}")]
  Timeout(Duration),

  #[error("{0} chapter batches failed to commit")]
  Incomplete(usize),

  #[error("job panicked")]
  Panicked,
}

/// Final state of a job, broadcast to subscribers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobOutcome {
  Completed { book_id: String },
  Failed { book_id: String, error: String },
}

impl JobOutcome {
  pub fn book_id(&self) -> &str {
    match self {
      Self::Completed { book_id } | Self::Failed { book_id, .. } => book_id,
    }
  }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FailedJob {
  pub failed_at: DateTime<Utc>,
  pub error: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct JobStats {
  pub queue_size: usize,
  pub active_jobs: usize,
  pub active_job_ids: Vec<String>,
  pub completed_count: usize,
  pub failed_count: usize,
  pub failed_jobs: BTreeMap<String, FailedJob>,
  pub workers: usize,
  pub running: bool,
}

struct Inner {
  state: Mutex<JobState>,
  wake: Notify,
  settings: JobSettings,
  cache: HybridCache,
  origin: Arc<dyn Origin>,
  outcomes: broadcast::Sender<JobOutcome>,
  running: watch::Sender<bool>,
  handles: Mutex<Vec<JoinHandle<()>>>,
}

/// Deduplicated, prioritized, rate-limited refresh queue.
///
/// At most one job per book is ever in flight. Cloning shares the same queue and workers.
#[derive(Clone)]
pub struct JobManager {
  inner: Arc<Inner>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
  mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl JobManager {
  pub fn new(settings: JobSettings, cache: HybridCache, origin: Arc<dyn Origin>) -> Self {
    let (outcomes, _) = broadcast::channel(OUTCOME_CAPACITY);
    let (running, _) = watch::channel(false);
    tracing::info!(
      workers = settings.workers,
      rate_limit_ms = settings.rate_limit.as_millis() as u64,
      "Initialized job manager"
    );
    Self {
      inner: Arc::new(Inner {
        state: Mutex::new(JobState::default()),
        wake: Notify::new(),
        settings,
        cache,
        origin,
        outcomes,
        running,
        handles: Mutex::new(Vec::new()),
      }),
    }
  }

  /// Spawn the workers. Must be called from within a tokio runtime.
  pub fn start(&self) {
    if self.is_running() {
      tracing::warn!("Job manager already running");
      return;
    }
    self.inner.running.send_replace(true);

    let mut handles = lock(&self.inner.handles);
    for worker in 0..self.inner.settings.workers {
      let inner = Arc::clone(&self.inner);
      let running = self.inner.running.subscribe();
      handles.push(tokio::spawn(worker_loop(inner, worker, running)));
    }
    tracing::info!(workers = handles.len(), "Started job workers");
  }

  /// Signal the workers to stop and wait for each, bounded by the shutdown timeout.
  ///
  /// A job already talking to the origin is allowed to finish.
  pub async fn stop(&self) {
    tracing::info!("Stopping job workers");
    self.inner.running.send_replace(false);
    self.inner.wake.notify_waiters();

    let handles = std::mem::take(&mut *lock(&self.inner.handles));
    for (worker, handle) in handles.into_iter().enumerate() {
      match tokio::time::timeout(self.inner.settings.shutdown_timeout, handle).await {
        Ok(Ok(())) => {}
        Ok(Err(err)) => tracing::warn!(worker, error = %err, "Job worker ended abnormally"),
        Err(_) => tracing::warn!(worker, "Job worker did not stop in time, detaching"),
      }
    }
    tracing::info!("All job workers stopped");
  }

  pub fn is_running(&self) -> bool {
    *self.inner.running.borrow()
  }

  /// Queue a refresh. Returns false if the book is active, queued, or completed within the cooldown.
  pub fn enqueue(&self, book_id: &str, priority: i32) -> bool {
    let result = lock(&self.inner.state).try_enqueue(book_id, priority, self.inner.settings.cooldown);
    match result {
      Ok(()) => {
        tracing::info!(book_id, priority, "Queued sync job");
        self.inner.wake.notify_one();
        true
      }
      Err(reason) => {
        tracing::debug!(book_id, ?reason, "Skipped sync job");
        false
      }
    }
  }

  /// Queue several books. Returns how many were accepted.
  pub fn enqueue_batch<S: AsRef<str>>(&self, book_ids: &[S], priority: i32) -> usize {
    book_ids
      .iter()
      .filter(|id| self.enqueue(id.as_ref(), priority))
      .count()
  }

  /// Queue a refresh ignoring the cooldown. Still refused while the book is active.
  pub fn force_resync(&self, book_id: &str, priority: i32) -> bool {
    let result = lock(&self.inner.state).force(book_id, priority);
    match result {
      Ok(()) => {
        tracing::info!(book_id, priority, "Force queued resync");
        self.inner.wake.notify_one();
        true
      }
      Err(reason) => {
        tracing::debug!(book_id, ?reason, "Cannot force resync");
        false
      }
    }
  }

  pub fn subscribe(&self) -> broadcast::Receiver<JobOutcome> {
    self.inner.outcomes.subscribe()
  }

  pub fn is_active(&self, book_id: &str) -> bool {
    lock(&self.inner.state).active.contains(book_id)
  }

  /// Queued book ids in the order they will be processed.
  pub fn queued_ids(&self) -> Vec<String> {
    lock(&self.inner.state).queued_ids()
  }

  pub fn stats(&self) -> JobStats {
    let state = lock(&self.inner.state);
    let mut active_job_ids: Vec<String> = state.active.iter().cloned().collect();
    active_job_ids.sort();

    JobStats {
      queue_size: state.queue_len(),
      active_jobs: state.active.len(),
      active_job_ids,
      completed_count: state.completed.len(),
      failed_count: state.failed.len(),
      failed_jobs: state
        .failed
        .iter()
        .map(|(id, (failed_at, error))| {
          (
            id.clone(),
            FailedJob {
              failed_at: *failed_at,
              error: error.clone(),
            },
          )
        })
        .collect(),
      workers: self.inner.settings.workers,
      running: self.is_running(),
    }
  }

  pub fn clear_history(&self) {
    lock(&self.inner.state).clear_history();
    tracing::info!("Cleared job history");
  }

  /// Drop queued jobs and history. Jobs in flight keep running.
  pub fn clear_all(&self) {
    let drained = {
      let mut state = lock(&self.inner.state);
      state.clear_history();
      state.drain_queue()
    };
    tracing::info!(drained, "Cleared job queue and history");
  }
}

impl Inner {
  fn next_job(&self) -> Option<(SyncJob, Duration)> {
    lock(&self.state).next_job(self.settings.rate_limit)
  }

  /// Await an origin call, giving up once the job's deadline has passed.
  async fn within<T>(&self, deadline: Instant, call: impl Future<Output = T>) -> Result<T, JobError> {
    tokio::time::timeout_at(deadline, call)
      .await
      .map_err(|_| JobError::Timeout(self.settings.job_timeout))
  }

  /// Only the origin calls count against the job timeout. Store writes always run to completion
  /// while the book is still active.
  async fn sync_book(&self, book_id: &str) -> Result<(), JobError> {
    tracing::info!(book_id, "Starting sync");
    let started = Instant::now();
    let deadline = started
      .checked_add(self.settings.job_timeout)
      .unwrap_or_else(|| started + FAR_FUTURE);

    // Metadata is best effort
    match self.within(deadline, self.origin.fetch_metadata(book_id)).await? {
      Ok(meta) => {
        if self.cache.put_item(book_id, meta).await.is_none() {
          tracing::warn!(book_id, "Book info fetched but not stored");
        }
      }
      Err(err) => tracing::warn!(book_id, error = %err, "Failed to fetch book info"),
    }

    let chapters = self.within(deadline, self.origin.fetch_chapter_list(book_id)).await??;
    let count = chapters.len();
    let report = self.cache.put_chapter_refs(book_id, chapters).await;
    if !report.is_clean() {
      return Err(JobError::Incomplete(report.failed_batches));
    }

    tracing::info!(book_id, chapters = count, "Completed sync");
    Ok(())
  }

  async fn run_job(&self, worker: usize, job: &SyncJob) {
    let result = match AssertUnwindSafe(self.sync_book(&job.book_id)).catch_unwind().await {
      Ok(result) => result,
      Err(_) => Err(JobError::Panicked),
    };

    let outcome = match &result {
      Ok(()) => JobOutcome::Completed {
        book_id: job.book_id.clone(),
      },
      Err(err) => {
        tracing::error!(worker, book_id = %job.book_id, error = %err, "Failed to sync book");
        JobOutcome::Failed {
          book_id: job.book_id.clone(),
          error: err.to_string(),
        }
      }
    };

    lock(&self.state).finish(&job.book_id, result.map_err(|e| e.to_string()));
    // Nobody listening is fine
    let _ = self.outcomes.send(outcome);
  }
}

async fn worker_loop(inner: Arc<Inner>, worker: usize, mut running: watch::Receiver<bool>) {
  tracing::info!(worker, "Worker started");

  while *running.borrow() {
    let Some((job, wait)) = inner.next_job() else {
      tokio::select! {
        _ = inner.wake.notified() => {}
        changed = running.changed() => {
          if changed.is_err() {
            break;
          }
        }
        _ = tokio::time::sleep(IDLE_POLL) => {}
      }
      continue;
    };

    if !wait.is_zero() {
      let stopped = tokio::select! {
        _ = tokio::time::sleep(wait) => false,
        _ = running.wait_for(|running| !*running) => true,
      };
      if stopped {
        lock(&inner.state).release(job);
        break;
      }
    }

    inner.run_job(worker, &job).await;
  }

  tracing::info!(worker, "Worker stopped");
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::db::testing::temp_db;
  use crate::origin::testing::StubOrigin;
  use tempfile::TempDir;

  fn settings() -> JobSettings {
    JobSettings {
      workers: 2,
      rate_limit: Duration::ZERO,
      cooldown: Duration::from_secs(300),
      job_timeout: Duration::from_secs(5),
      shutdown_timeout: Duration::from_secs(2),
    }
  }

  fn manager(origin: Arc<StubOrigin>, settings: JobSettings) -> (TempDir, HybridCache, JobManager) {
    let (dir, db) = temp_db();
    let cache = HybridCache::new(db, Duration::from_secs(60), 100, 100);
    let manager = JobManager::new(settings, cache.clone(), origin);
    (dir, cache, manager)
  }

  async fn next_outcome(rx: &mut broadcast::Receiver<JobOutcome>) -> JobOutcome {
    tokio::time::timeout(Duration::from_secs(5), rx.recv())
      .await
      .expect("outcome in time")
      .expect("channel open")
  }

  #[tokio::test]
  async fn test_enqueue_is_deduplicated() {
    let (_dir, _cache, manager) = manager(Arc::new(StubOrigin::default()), settings());
    assert!(manager.enqueue("1", 0));
    assert!(!manager.enqueue("1", 5));
    assert_eq!(manager.enqueue_batch(&["1", "2", "3"], 0), 2);
    assert_eq!(manager.stats().queue_size, 3);
  }

  #[tokio::test]
  async fn test_sync_stores_book_and_chapters() {
    let origin = Arc::new(StubOrigin::default());
    let (_dir, cache, manager) = manager(origin.clone(), settings());
    let mut outcomes = manager.subscribe();
    manager.start();

    assert!(manager.enqueue("42", 0));
    assert_eq!(
      next_outcome(&mut outcomes).await,
      JobOutcome::Completed {
        book_id: "42".to_string()
      }
    );

    assert_eq!(cache.get_item("42").await.unwrap().meta.name, "Book 42");
    assert_eq!(cache.get_chapter_list("42").await.unwrap().len(), 3);
    let stats = manager.stats();
    assert_eq!((stats.completed_count, stats.active_jobs), (1, 0));
    manager.stop().await;
  }

  #[tokio::test]
  async fn test_cooldown_then_force() {
    let origin = Arc::new(StubOrigin::default());
    let (_dir, _cache, manager) = manager(origin.clone(), settings());
    let mut outcomes = manager.subscribe();
    manager.start();

    manager.enqueue("1", 0);
    next_outcome(&mut outcomes).await;

    assert!(!manager.enqueue("1", 0));
    assert!(manager.force_resync("1", 10));
    next_outcome(&mut outcomes).await;
    assert_eq!(origin.calls("1"), 2);
    manager.stop().await;
  }

  #[tokio::test]
  async fn test_force_refused_while_active() {
    let origin = Arc::new(StubOrigin::with_delay(Duration::from_millis(300)));
    let (_dir, _cache, manager) = manager(origin.clone(), settings());
    let mut outcomes = manager.subscribe();
    manager.start();
    manager.enqueue("1", 0);

    for _ in 0..100 {
      if manager.is_active("1") {
        break;
      }
      tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert!(manager.is_active("1"));
    assert!(!manager.force_resync("1", 10));
    assert!(!manager.enqueue("1", 10));

    next_outcome(&mut outcomes).await;
    assert!(!manager.is_active("1"));
    manager.stop().await;
  }

  #[tokio::test]
  async fn test_failure_is_recorded_and_cleared_on_success() {
    let origin = Arc::new(StubOrigin::default());
    origin.fail("7");
    let (_dir, _cache, manager) = manager(origin.clone(), settings());
    let mut outcomes = manager.subscribe();
    manager.start();

    manager.enqueue("7", 0);
    let outcome = next_outcome(&mut outcomes).await;
    assert!(matches!(outcome, JobOutcome::Failed { ref book_id, .. } if book_id == "7"));

    let stats = manager.stats();
    assert_eq!(stats.failed_count, 1);
    assert!(stats.failed_jobs["7"].error.contains("chapters of book 7"));
    assert_eq!(stats.active_jobs, 0);

    // Failures do not block a retry
    origin.recover("7");
    assert!(manager.enqueue("7", 0));
    next_outcome(&mut outcomes).await;
    assert_eq!(manager.stats().failed_count, 0);
    manager.stop().await;
  }

  #[tokio::test]
  async fn test_job_timeout_is_a_failure() {
    let origin = Arc::new(StubOrigin::with_delay(Duration::from_secs(2)));
    let mut settings = settings();
    settings.job_timeout = Duration::from_millis(100);
    let (_dir, _cache, manager) = manager(origin, settings);
    let mut outcomes = manager.subscribe();
    manager.start();

    manager.enqueue("slow", 0);
    match next_outcome(&mut outcomes).await {
      JobOutcome::Failed { error, .. } => assert!(error.contains("timed out")),
      other => panic!("unexpected outcome {:?}", other),
    }
    assert!(!manager.is_active("slow"));
    manager.stop().await;
  }

  #[tokio::test]
  async fn test_timeout_does_not_cut_chapter_store_back() {
    let origin = Arc::new(StubOrigin::with_chapters(20_000));
    let mut settings = settings();
    settings.workers = 1;
    settings.cooldown = Duration::ZERO;
    settings.job_timeout = Duration::from_millis(50);
    let (_dir, db) = temp_db();
    let cache = HybridCache::new(db.clone(), Duration::from_secs(60), 100, 100);
    let manager = JobManager::new(settings, cache, origin.clone());
    let mut outcomes = manager.subscribe();
    manager.start();

    manager.enqueue("big", 0);
    assert_eq!(
      next_outcome(&mut outcomes).await,
      JobOutcome::Completed {
        book_id: "big".to_string()
      }
    );
    // Every row is in before the book leaves the active set
    assert_eq!(db.list_chapters("big").unwrap().len(), 20_000);
    assert!(!manager.is_active("big"));

    // A second run rewrites the same rows without overlapping the first
    assert!(manager.enqueue("big", 0));
    next_outcome(&mut outcomes).await;
    assert_eq!(db.list_chapters("big").unwrap().len(), 20_000);
    assert!(!origin.overlapped());
    manager.stop().await;
  }

  #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
  async fn test_never_two_jobs_for_one_book() {
    let origin = Arc::new(StubOrigin::with_delay(Duration::from_millis(20)));
    let mut settings = settings();
    settings.workers = 4;
    settings.cooldown = Duration::ZERO;
    let (_dir, _cache, manager) = manager(origin.clone(), settings);
    manager.start();

    let mut tasks = Vec::new();
    for i in 0..8 {
      let manager = manager.clone();
      tasks.push(tokio::spawn(async move {
        for _ in 0..20 {
          manager.enqueue("shared", 0);
          if i % 2 == 0 {
            manager.force_resync("shared", 5);
          }
          tokio::time::sleep(Duration::from_millis(3)).await;
        }
      }));
    }
    for task in tasks {
      task.await.unwrap();
    }
    while manager.stats().queue_size > 0 || manager.stats().active_jobs > 0 {
      tokio::time::sleep(Duration::from_millis(10)).await;
    }

    assert!(!origin.overlapped());
    assert!(origin.calls("shared") >= 2);
    manager.stop().await;
  }

  #[tokio::test]
  async fn test_rate_limit_spaces_job_starts() {
    let origin = Arc::new(StubOrigin::default());
    let mut settings = settings();
    settings.rate_limit = Duration::from_millis(150);
    let (_dir, _cache, manager) = manager(origin, settings);
    let mut outcomes = manager.subscribe();

    let started = tokio::time::Instant::now();
    manager.enqueue_batch(&["1", "2", "3"], 0);
    manager.start();
    for _ in 0..3 {
      next_outcome(&mut outcomes).await;
    }
    assert!(started.elapsed() >= Duration::from_millis(300));
    manager.stop().await;
  }

  #[tokio::test]
  async fn test_clear_all_keeps_active_jobs() {
    let origin = Arc::new(StubOrigin::with_delay(Duration::from_millis(200)));
    let mut settings = settings();
    settings.workers = 1;
    let (_dir, _cache, manager) = manager(origin, settings);
    let mut outcomes = manager.subscribe();
    manager.enqueue_batch(&["a", "b", "c"], 0);
    manager.start();

    while !manager.is_active("a") {
      tokio::time::sleep(Duration::from_millis(5)).await;
    }
    manager.clear_all();
    let stats = manager.stats();
    assert_eq!(stats.queue_size, 0);
    assert_eq!(stats.active_job_ids, vec!["a".to_string()]);

    assert_eq!(next_outcome(&mut outcomes).await.book_id(), "a");
    manager.clear_history();
    assert_eq!(manager.stats().completed_count, 0);
    manager.stop().await;
  }

  #[tokio::test]
  async fn test_start_and_stop() {
    let (_dir, _cache, manager) = manager(Arc::new(StubOrigin::default()), settings());
    assert!(!manager.stats().running);
    manager.start();
    manager.start();
    assert!(manager.stats().running);
    manager.stop().await;
    assert!(!manager.stats().running);
    // Queued work waits for the next start
    assert!(manager.enqueue("1", 0));
    assert_eq!(manager.stats().queue_size, 1);
  }
}

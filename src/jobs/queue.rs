//! Job bookkeeping guarded by the manager's single mutex.

use chrono::{DateTime, Utc};
use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap, HashSet};
use std::time::{Duration, Instant};

/// A queued refresh of one book.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncJob {
  pub book_id: String,
  pub priority: i32,
  pub enqueued_at: DateTime<Utc>,
  seq: u64,
}

// Max-heap order: higher priority first, then earlier enqueue
impl Ord for SyncJob {
  fn cmp(&self, other: &Self) -> Ordering {
    self
      .priority
      .cmp(&other.priority)
      .then_with(|| other.seq.cmp(&self.seq))
  }
}

impl PartialOrd for SyncJob {
  fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
    Some(self.cmp(other))
  }
}

/// Why an enqueue was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rejection {
  Active,
  Queued,
  Cooldown,
}

#[derive(Debug, Default)]
pub struct JobState {
  heap: BinaryHeap<SyncJob>,
  /// Live sequence number per queued book; heap entries with another seq are stale
  queued: HashMap<String, u64>,
  pub active: HashSet<String>,
  pub completed: HashMap<String, DateTime<Utc>>,
  pub failed: HashMap<String, (DateTime<Utc>, String)>,
  next_seq: u64,
  /// Start time reserved by the most recent dequeue
  last_start: Option<Instant>,
}

impl JobState {
  fn push(&mut self, book_id: &str, priority: i32) {
    let seq = self.next_seq;
    self.next_seq += 1;
    self.queued.insert(book_id.to_string(), seq);
    self.heap.push(SyncJob {
      book_id: book_id.to_string(),
      priority,
      enqueued_at: Utc::now(),
      seq,
    });
  }

  pub fn try_enqueue(&mut self, book_id: &str, priority: i32, cooldown: Duration) -> Result<(), Rejection> {
    if self.active.contains(book_id) {
      return Err(Rejection::Active);
    }
    if self.queued.contains_key(book_id) {
      return Err(Rejection::Queued);
    }
    if let Some(completed_at) = self.completed.get(book_id) {
      let within = match (Utc::now() - *completed_at).to_std() {
        Ok(elapsed) => elapsed < cooldown,
        // Clock went backwards
        Err(_) => true,
      };
      if within {
        return Err(Rejection::Cooldown);
      }
    }
    self.push(book_id, priority);
    Ok(())
  }

  /// Queue `book_id` regardless of cooldown. A queued book is moved to `priority`.
  pub fn force(&mut self, book_id: &str, priority: i32) -> Result<(), Rejection> {
    if self.active.contains(book_id) {
      return Err(Rejection::Active);
    }
    self.completed.remove(book_id);
    self.failed.remove(book_id);
    self.push(book_id, priority);
    Ok(())
  }

  /// Take the next live job, mark it active and reserve its start time.
  ///
  /// Returns the job with how long to wait before starting it.
  pub fn next_job(&mut self, min_gap: Duration) -> Option<(SyncJob, Duration)> {
    let job = loop {
      let job = self.heap.pop()?;
      if self.queued.get(&job.book_id) == Some(&job.seq) {
        self.queued.remove(&job.book_id);
        break job;
      }
    };
    self.active.insert(job.book_id.clone());

    let now = Instant::now();
    let start = match self.last_start {
      Some(last) => (last + min_gap).max(now),
      None => now,
    };
    self.last_start = Some(start);
    Some((job, start - now))
  }

  /// Put back a job taken by `next_job` that never started.
  pub fn release(&mut self, job: SyncJob) {
    self.active.remove(&job.book_id);
    if !self.queued.contains_key(&job.book_id) {
      self.queued.insert(job.book_id.clone(), job.seq);
      self.heap.push(job);
    }
  }

  pub fn finish(&mut self, book_id: &str, result: Result<(), String>) {
    let now = Utc::now();
    match result {
      Ok(()) => {
        self.completed.insert(book_id.to_string(), now);
        self.failed.remove(book_id);
      }
      Err(error) => {
        self.failed.insert(book_id.to_string(), (now, error));
      }
    }
    self.active.remove(book_id);
  }

  pub fn queue_len(&self) -> usize {
    self.queued.len()
  }

  /// Queued book ids in the order workers will take them.
  pub fn queued_ids(&self) -> Vec<String> {
    let mut live: Vec<&SyncJob> = self
      .heap
      .iter()
      .filter(|job| self.queued.get(&job.book_id) == Some(&job.seq))
      .collect();
    live.sort_by(|a, b| b.cmp(a));
    live.into_iter().map(|job| job.book_id.clone()).collect()
  }

  pub fn clear_history(&mut self) {
    self.completed.clear();
    self.failed.clear();
  }

  /// Drop every queued job. Active jobs are untouched.
  pub fn drain_queue(&mut self) -> usize {
    let drained = self.queued.len();
    self.heap.clear();
    self.queued.clear();
    drained
  }
}

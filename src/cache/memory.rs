//! In-process TTL map with insertion-time eviction.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};

struct Entry<V> {
  value: V,
  inserted_at: Instant,
  /// Tie-breaker for entries inserted within the same clock tick
  seq: u64,
}

struct Inner<V> {
  entries: HashMap<String, Entry<V>>,
  next_seq: u64,
}

/// Bounded key/value map whose entries expire `ttl` after insertion.
///
/// One mutex covers reads, writes and eviction, so the resident count never exceeds the
/// capacity. When full, the entry with the oldest insertion time is evicted; reads do not
/// refresh an entry's age.
pub struct TtlCache<V> {
  inner: Mutex<Inner<V>>,
  ttl: Duration,
  capacity: usize,
}

impl<V: Clone> TtlCache<V> {
  pub fn new(ttl: Duration, capacity: usize) -> Self {
    Self {
      inner: Mutex::new(Inner {
        entries: HashMap::new(),
        next_seq: 0,
      }),
      ttl,
      capacity: capacity.max(1),
    }
  }

  fn lock(&self) -> MutexGuard<'_, Inner<V>> {
    // Entries are replaced whole, so a panic mid-operation cannot leave one half-written
    self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
  }

  pub fn get(&self, key: &str) -> Option<V> {
    self.get_at(key, Instant::now())
  }

  fn get_at(&self, key: &str, now: Instant) -> Option<V> {
    let mut inner = self.lock();
    let expired = match inner.entries.get(key) {
      None => return None,
      Some(entry) => now.duration_since(entry.inserted_at) >= self.ttl,
    };
    if expired {
      inner.entries.remove(key);
      return None;
    }
    inner.entries.get(key).map(|entry| entry.value.clone())
  }

  /// Insert or overwrite `key`, evicting the oldest entry if the map is full.
  pub fn insert(&self, key: impl Into<String>, value: V) {
    let key = key.into();
    let now = Instant::now();
    let mut inner = self.lock();

    if !inner.entries.contains_key(&key) && inner.entries.len() >= self.capacity {
      let ttl = self.ttl;
      inner
        .entries
        .retain(|_, entry| now.duration_since(entry.inserted_at) < ttl);
    }
    if !inner.entries.contains_key(&key) && inner.entries.len() >= self.capacity {
      let oldest = inner
        .entries
        .iter()
        .min_by_key(|(_, entry)| (entry.inserted_at, entry.seq))
        .map(|(k, _)| k.clone());
      if let Some(oldest) = oldest {
        inner.entries.remove(&oldest);
        tracing::trace!(key = %oldest, "Evicted oldest memory entry");
      }
    }

    let seq = inner.next_seq;
    inner.next_seq += 1;
    inner.entries.insert(
      key,
      Entry {
        value,
        inserted_at: now,
        seq,
      },
    );
  }

  /// Remove one entry. Returns whether it was present.
  pub fn invalidate(&self, key: &str) -> bool {
    self.lock().entries.remove(key).is_some()
  }

  /// Remove every entry whose key starts with `prefix`. Returns the number removed.
  pub fn invalidate_prefix(&self, prefix: &str) -> usize {
    let mut inner = self.lock();
    let before = inner.entries.len();
    inner.entries.retain(|key, _| !key.starts_with(prefix));
    before - inner.entries.len()
  }

  pub fn clear(&self) {
    self.lock().entries.clear();
  }

  /// Number of resident entries, expired ones included until they are touched.
  pub fn len(&self) -> usize {
    self.lock().entries.len()
  }

  pub fn is_empty(&self) -> bool {
    self.len() == 0
  }

  pub fn capacity(&self) -> usize {
    self.capacity
  }

  pub fn ttl(&self) -> Duration {
    self.ttl
  }
}

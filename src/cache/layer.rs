//! Hybrid cache: memory tier over the SQLite store, store-first on misses.

use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;

use super::key::{CacheKey, Cached};
use super::memory::TtlCache;
use crate::db::{Database, RefsReport, StoreResult};
use crate::types::{Book, BookMeta, ChapterContent, ChapterDraft, ChapterRef};

/// Snapshot of both tiers.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CacheStats {
  pub books: u64,
  pub chapters: u64,
  pub chapters_with_content: u64,
  pub memory_entries: usize,
  pub memory_capacity: usize,
  pub ttl_secs: u64,
}

/// Serves reads from memory, then the store, and writes through to both.
///
/// Never calls the origin: filling misses is the job manager's work. Store errors are logged
/// and degrade to a miss or no-op.
#[derive(Clone)]
pub struct HybridCache {
  db: Database,
  memory: Arc<TtlCache<Cached>>,
  chapter_batch_size: usize,
}

impl HybridCache {
  pub fn new(db: Database, ttl: Duration, max_items: usize, chapter_batch_size: usize) -> Self {
    Self {
      db,
      memory: Arc::new(TtlCache::new(ttl, max_items)),
      chapter_batch_size: chapter_batch_size.max(1),
    }
  }

  /// Run a store call off the async runtime, logging and swallowing its error.
  async fn store<T, F>(&self, op: &'static str, f: F) -> Option<T>
  where
    T: Send + 'static,
    F: FnOnce(&Database) -> StoreResult<T> + Send + 'static,
  {
    match self.db.run(f).await {
      Ok(value) => Some(value),
      Err(err) => {
        tracing::warn!(op, error = %err, "Store call failed, degrading to miss");
        None
      }
    }
  }

  pub async fn get_item(&self, book_id: &str) -> Option<Book> {
    let key = CacheKey::Book(book_id).to_string();
    if let Some(Cached::Book(book)) = self.memory.get(&key) {
      return Some(book);
    }

    let id = book_id.to_string();
    let book = self
      .store("get_item", move |db| {
        let Some(mut book) = db.get_book(&id)? else {
          return Ok(None);
        };
        if book.public_id.is_none() {
          book.public_id = db.ensure_book_public_id(&id)?;
        }
        Ok(Some(book))
      })
      .await
      .flatten()?;

    self.memory.insert(key, Cached::Book(book.clone()));
    Some(book)
  }

  /// Merge `meta` into the stored book and reflect the merged row in memory.
  pub async fn put_item(&self, book_id: &str, meta: BookMeta) -> Option<Book> {
    let key = CacheKey::Book(book_id).to_string();
    let id = book_id.to_string();
    match self.store("put_item", move |db| db.upsert_book(&id, &meta)).await {
      Some(book) => {
        self.memory.insert(key, Cached::Book(book.clone()));
        Some(book)
      }
      None => {
        self.memory.invalidate(&key);
        None
      }
    }
  }

  pub async fn get_chapter(&self, book_id: &str, number: u32) -> Option<ChapterContent> {
    let key = CacheKey::Chapter(book_id, number).to_string();
    if let Some(Cached::Chapter(chapter)) = self.memory.get(&key) {
      return Some(chapter);
    }

    let id = book_id.to_string();
    let chapter = self
      .store("get_chapter", move |db| db.get_chapter_content(&id, number))
      .await
      .flatten()?;

    self.memory.insert(key, Cached::Chapter(chapter.clone()));
    Some(chapter)
  }

  pub async fn put_chapter(&self, book_id: &str, number: u32, draft: ChapterDraft) -> Option<ChapterContent> {
    let key = CacheKey::Chapter(book_id, number).to_string();
    let id = book_id.to_string();
    let stored = self
      .store("put_chapter", move |db| db.upsert_chapter_content(&id, number, &draft))
      .await;

    self.memory.invalidate(&CacheKey::ChapterList(book_id).to_string());
    match stored {
      Some(chapter) => {
        self.memory.insert(key, Cached::Chapter(chapter.clone()));
        Some(chapter)
      }
      None => {
        self.memory.invalidate(&key);
        None
      }
    }
  }

  /// Chapter references of a book. An empty list is reported as absent.
  pub async fn get_chapter_list(&self, book_id: &str) -> Option<Arc<Vec<ChapterRef>>> {
    let key = CacheKey::ChapterList(book_id).to_string();
    if let Some(Cached::ChapterList(list)) = self.memory.get(&key) {
      return Some(list);
    }

    let id = book_id.to_string();
    let list = self.store("get_chapter_list", move |db| db.list_chapters(&id)).await?;
    if list.is_empty() {
      return None;
    }

    let list = Arc::new(list);
    self.memory.insert(key, Cached::ChapterList(Arc::clone(&list)));
    Some(list)
  }

  pub async fn put_chapter_refs(&self, book_id: &str, refs: Vec<ChapterRef>) -> RefsReport {
    let batch_size = self.chapter_batch_size;
    let batches = refs.len().div_ceil(batch_size);
    let id = book_id.to_string();
    let report = self
      .store("put_chapter_refs", move |db| {
        Ok(db.upsert_chapter_refs(&id, &refs, batch_size))
      })
      .await
      .unwrap_or(RefsReport {
        failed_batches: batches,
        ..Default::default()
      });

    self.memory.invalidate(&CacheKey::ChapterList(book_id).to_string());
    report
  }

  /// Drop the book's memory entry. The store is left untouched.
  pub fn invalidate_item(&self, book_id: &str) -> bool {
    self.memory.invalidate(&CacheKey::Book(book_id).to_string())
  }

  /// Delete every stored chapter of a book for forced re-ingestion. Returns the rows removed.
  pub async fn delete_item_children(&self, book_id: &str) -> usize {
    let id = book_id.to_string();
    let deleted = self
      .store("delete_item_children", move |db| db.delete_chapters(&id))
      .await
      .unwrap_or(0);

    self.invalidate_item(book_id);
    self.memory.invalidate(&CacheKey::ChapterList(book_id).to_string());
    self.memory.invalidate_prefix(&CacheKey::chapter_prefix(book_id));
    tracing::info!(book_id, deleted, "Deleted stored chapters");
    deleted
  }

  pub fn clear_memory(&self) {
    self.memory.clear();
  }

  pub async fn stats(&self) -> CacheStats {
    let mut stats = CacheStats {
      memory_entries: self.memory.len(),
      memory_capacity: self.memory.capacity(),
      ttl_secs: self.memory.ttl().as_secs(),
      ..Default::default()
    };
    if let Some(db_stats) = self.store("stats", |db| db.database_stats()).await {
      stats.books = db_stats.total_books;
      stats.chapters = db_stats.total_chapters;
      stats.chapters_with_content = db_stats.chapters_with_content;
    }
    stats
  }
}

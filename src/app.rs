use color_eyre::Result;
use std::sync::Arc;
use std::time::Duration;

use crate::cache::HybridCache;
use crate::config::Config;
use crate::db::Database;
use crate::jobs::{JobManager, JobSettings};
use crate::origin::Origin;
use crate::ratelimit::RateLimiter;
use crate::sync::{DailySettings, DailySync, PeriodicSettings, PeriodicSync};
use crate::types::{Book, ChapterContent, ChapterDraft};

/// Priority for a book a reader asked for that is not cached yet.
pub const ON_DEMAND_PRIORITY: i32 = 10;

/// Every long-lived service, built once at startup and handed to the route layer.
///
/// Cloning is cheap: each service is a handle over shared state.
#[derive(Clone)]
pub struct AppContext {
  pub config: Arc<Config>,
  pub db: Database,
  pub cache: HybridCache,
  pub jobs: JobManager,
  pub daily: DailySync,
  pub periodic: PeriodicSync,
  pub rate_limiter: Arc<RateLimiter>,
  origin: Arc<dyn Origin>,
}

impl AppContext {
  /// Open the store and wire the services together. Nothing runs until [`AppContext::start`].
  pub fn build(config: Config, origin: Arc<dyn Origin>) -> Result<Self> {
    let db_path = config.store.resolve_path()?;
    let db = Database::open(&db_path, config.store.busy_timeout())?;

    let cache = HybridCache::new(
      db.clone(),
      Duration::from_secs(config.cache.ttl_secs),
      config.cache.max_items,
      config.cache.chapter_batch_size,
    );
    let jobs = JobManager::new(JobSettings::from(&config.jobs), cache.clone(), Arc::clone(&origin));

    let finished = &config.origin.finished_status;
    let daily = DailySync::new(
      db.clone(),
      jobs.clone(),
      DailySettings::from_config(&config.daily_sync, finished),
    );
    let periodic = PeriodicSync::new(
      db.clone(),
      jobs.clone(),
      PeriodicSettings::from_config(&config.periodic_sync, finished),
    );
    let rate_limiter = Arc::new(RateLimiter::new(config.rate_limit.whitelist.clone()));

    Ok(Self {
      config: Arc::new(config),
      db,
      cache,
      jobs,
      daily,
      periodic,
      rate_limiter,
      origin,
    })
  }

  /// Launch the workers and whichever orchestrators are enabled.
  pub fn start(&self) {
    self.jobs.start();
    if self.config.daily_sync.enabled {
      self.daily.start();
    }
    if self.config.periodic_sync.enabled {
      self.periodic.start();
    }
  }

  /// Stop the orchestrators first so nothing new is queued, then drain the workers.
  pub async fn shutdown(&self) {
    let timeout = Duration::from_secs(self.config.jobs.shutdown_timeout_secs);
    self.periodic.stop(timeout).await;
    self.daily.stop(timeout).await;
    self.jobs.stop().await;
    tracing::info!("Shutdown complete");
  }

  /// A reader opened a book: count the access and serve it from cache.
  ///
  /// On a miss the book is queued for an on-demand refresh and `None` is returned.
  pub async fn open_book(&self, book_id: &str) -> Option<Book> {
    self.daily.track_access(book_id).await;
    let book = self.cache.get_item(book_id).await;
    if book.is_none() && self.jobs.enqueue(book_id, ON_DEMAND_PRIORITY) {
      tracing::debug!(book_id, "Queued on-demand refresh for uncached book");
    }
    book
  }

  /// A chapter body, fetched from the origin and stored back when it is not cached.
  pub async fn open_chapter(&self, book_id: &str, number: u32) -> Option<ChapterContent> {
    if let Some(chapter) = self.cache.get_chapter(book_id, number).await {
      return Some(chapter);
    }

    let refs = self.cache.get_chapter_list(book_id).await?;
    let chapter_ref = refs.iter().find(|r| r.number == number)?;
    let text = match self.origin.fetch_content(&chapter_ref.url).await {
      Ok(text) => text,
      Err(err) => {
        tracing::warn!(book_id, number, error = %err, "Failed to fetch chapter content");
        return None;
      }
    };

    let draft = ChapterDraft {
      title: Some(chapter_ref.title.clone()),
      url: chapter_ref.url.clone(),
      text,
    };
    self.cache.put_chapter(book_id, number, draft).await
  }
}

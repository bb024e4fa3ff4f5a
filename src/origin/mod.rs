//! The scraped origin, seen through its fetch contract.
//!
//! Parsing HTML into domain records is left to a caller-supplied [`PageParser`]; this module only
//! owns URLs, HTTP and timeouts.

mod error;
mod http;

pub use error::OriginError;
pub use http::HttpOrigin;

use async_trait::async_trait;
use url::Url;

use crate::types::{BookMeta, ChapterRef};

/// Fetches books from the origin. Every call must finish within a bounded time.
#[async_trait]
pub trait Origin: Send + Sync {
  async fn fetch_metadata(&self, book_id: &str) -> Result<BookMeta, OriginError>;

  async fn fetch_chapter_list(&self, book_id: &str) -> Result<Vec<ChapterRef>, OriginError>;

  /// Body text of the chapter at `chapter_url`.
  async fn fetch_content(&self, chapter_url: &str) -> Result<String, OriginError>;
}

/// Turns origin pages into domain records.
pub trait PageParser: Send + Sync {
  /// Book metadata from a book home page, `None` if the page holds none.
  fn parse_book_info(&self, html: &str, base_url: &Url) -> Option<BookMeta>;

  /// Chapter references listed on a book home page.
  fn parse_chapter_list(&self, html: &str, base_url: &Url) -> Vec<ChapterRef>;

  fn parse_chapter_text(&self, html: &str) -> Option<String>;
}

#[cfg(test)]
pub(crate) mod testing {
  use super::*;
  use std::collections::{HashMap, HashSet};
  use std::sync::atomic::{AtomicBool, Ordering};
  use std::sync::Mutex;
  use std::time::Duration;

  /// In-memory origin that records how it is called.
  #[derive(Default)]
  pub struct StubOrigin {
    pub delay: Duration,
    chapters: Option<u32>,
    failing: Mutex<HashSet<String>>,
    calls: Mutex<HashMap<String, usize>>,
    in_flight: Mutex<HashMap<String, usize>>,
    overlapped: AtomicBool,
  }

  impl StubOrigin {
    pub fn with_delay(delay: Duration) -> Self {
      Self {
        delay,
        ..Default::default()
      }
    }

    /// Serve `count` chapters per book instead of three.
    pub fn with_chapters(count: u32) -> Self {
      Self {
        chapters: Some(count),
        ..Default::default()
      }
    }

    pub fn fail(&self, book_id: &str) {
      self.failing.lock().unwrap().insert(book_id.to_string());
    }

    pub fn recover(&self, book_id: &str) {
      self.failing.lock().unwrap().remove(book_id);
    }

    /// Chapter-list fetches made for `book_id`.
    pub fn calls(&self, book_id: &str) -> usize {
      self.calls.lock().unwrap().get(book_id).copied().unwrap_or(0)
    }

    /// Whether two fetches for the same book ever ran at once.
    pub fn overlapped(&self) -> bool {
      self.overlapped.load(Ordering::SeqCst)
    }
  }

  #[async_trait]
  impl Origin for StubOrigin {
    async fn fetch_metadata(&self, book_id: &str) -> Result<BookMeta, OriginError> {
      Ok(BookMeta {
        name: format!("Book {}", book_id),
        status: Some("連載中".to_string()),
        ..Default::default()
      })
    }

    async fn fetch_chapter_list(&self, book_id: &str) -> Result<Vec<ChapterRef>, OriginError> {
      {
        *self.calls.lock().unwrap().entry(book_id.to_string()).or_default() += 1;
        let mut in_flight = self.in_flight.lock().unwrap();
        let n = in_flight.entry(book_id.to_string()).or_default();
        *n += 1;
        if *n > 1 {
          self.overlapped.store(true, Ordering::SeqCst);
        }
      }

      tokio::time::sleep(self.delay).await;

      if let Some(n) = self.in_flight.lock().unwrap().get_mut(book_id) {
        *n -= 1;
      }
      if self.failing.lock().unwrap().contains(book_id) {
        return Err(OriginError::NotFound {
          what: format!("chapters of book {}", book_id),
        });
      }
      Ok(
        (1..=self.chapters.unwrap_or(3))
          .map(|n| ChapterRef::new(n, format!("Chapter {}", n), format!("/{}/{}.html", book_id, n)))
          .collect(),
      )
    }

    async fn fetch_content(&self, chapter_url: &str) -> Result<String, OriginError> {
      Ok(format!("text of {}", chapter_url))
    }
  }
}

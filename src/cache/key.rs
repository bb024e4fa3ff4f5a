//! Memory-tier keys and values.

use std::fmt;
use std::sync::Arc;

use crate::types::{Book, ChapterContent, ChapterRef};

/// Key of a memory-tier entry.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum CacheKey<'a> {
  Book(&'a str),
  Chapter(&'a str, u32),
  ChapterList(&'a str),
}

impl CacheKey<'_> {
  /// Prefix shared by every chapter entry of a book.
  pub fn chapter_prefix(book_id: &str) -> String {
    format!("chapter:{}:", book_id)
  }
}

impl fmt::Display for CacheKey<'_> {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      Self::Book(id) => write!(f, "book:{}", id),
      Self::Chapter(id, n) => write!(f, "chapter:{}:{}", id, n),
      Self::ChapterList(id) => write!(f, "chapters:{}", id),
    }
  }
}

/// A value held in the memory tier.
#[derive(Debug, Clone)]
pub enum Cached {
  Book(Book),
  Chapter(ChapterContent),
  ChapterList(Arc<Vec<ChapterRef>>),
}

//! Domain records shared by the store, the hybrid cache and the origin adapter.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Pointer to the newest chapter the origin advertises for a book.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LastChapter {
  pub number: Option<u32>,
  pub title: String,
  pub url: String,
}

impl LastChapter {
  pub fn is_empty(&self) -> bool {
    self.number.is_none() && self.title.trim().is_empty() && self.url.trim().is_empty()
  }
}

/// Book metadata as reported by the origin.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BookMeta {
  pub name: String,
  pub author: Option<String>,
  pub category: Option<String>,
  /// Origin status label, e.g. "連載中" or "已完成"
  pub status: Option<String>,
  /// The origin's own "last updated" label, kept verbatim
  pub update_label: Option<String>,
  pub last_chapter: Option<LastChapter>,
  pub source_url: Option<String>,
}

impl BookMeta {
  /// Merge an incoming update over previously stored metadata.
  ///
  /// A field that is empty or absent in `incoming` keeps the stored value; a non-empty field
  /// always wins. The last-chapter pointer is replaced as a unit so title, url and number
  /// never come from two different updates.
  pub fn merge(stored: &BookMeta, incoming: &BookMeta) -> BookMeta {
    let name = if incoming.name.trim().is_empty() {
      stored.name.clone()
    } else {
      incoming.name.clone()
    };

    let last_chapter = match &incoming.last_chapter {
      Some(pointer) if !pointer.is_empty() => Some(pointer.clone()),
      _ => stored.last_chapter.clone(),
    };

    BookMeta {
      name,
      author: backfill(&stored.author, &incoming.author),
      category: backfill(&stored.category, &incoming.category),
      status: backfill(&stored.status, &incoming.status),
      update_label: backfill(&stored.update_label, &incoming.update_label),
      last_chapter,
      source_url: backfill(&stored.source_url, &incoming.source_url),
    }
  }
}

fn backfill(stored: &Option<String>, incoming: &Option<String>) -> Option<String> {
  match incoming.as_deref() {
    Some(value) if !value.trim().is_empty() => incoming.clone(),
    _ => stored.clone(),
  }
}

/// A persisted book.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Book {
  /// Stable origin identifier
  pub id: String,
  /// Opaque external identifier, decoupled from the origin id
  pub public_id: Option<String>,
  pub meta: BookMeta,
  pub created_at: DateTime<Utc>,
  pub last_scraped_at: Option<DateTime<Utc>>,
}

/// A chapter reference from the origin's chapter list (no body).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChapterRef {
  pub number: u32,
  pub title: String,
  pub url: String,
  /// Chapter public id; only set on references read back from the store
  pub public_id: Option<String>,
}

impl ChapterRef {
  pub fn new(number: u32, title: impl Into<String>, url: impl Into<String>) -> Self {
    Self {
      number,
      title: title.into(),
      url: url.into(),
      public_id: None,
    }
  }
}

/// Chapter body fetched from the origin, ready to be stored.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChapterDraft {
  pub title: Option<String>,
  pub url: String,
  pub text: String,
}

/// A stored chapter with its body.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChapterContent {
  pub book_id: String,
  pub number: u32,
  pub title: Option<String>,
  pub url: String,
  pub text: String,
  pub public_id: Option<String>,
}

/// Lifecycle of a row in the pending sync queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncStatus {
  Pending,
  Syncing,
  Completed,
  Failed,
}

impl SyncStatus {
  pub fn as_str(&self) -> &'static str {
    match self {
      Self::Pending => "pending",
      Self::Syncing => "syncing",
      Self::Completed => "completed",
      Self::Failed => "failed",
    }
  }
}

impl fmt::Display for SyncStatus {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

impl FromStr for SyncStatus {
  type Err = String;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    match s {
      "pending" => Ok(Self::Pending),
      "syncing" => Ok(Self::Syncing),
      "completed" => Ok(Self::Completed),
      "failed" => Ok(Self::Failed),
      other => Err(format!("unknown sync status '{}'", other)),
    }
  }
}

/// A row of the persistent queue feeding the daily orchestrator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PendingEntry {
  pub book_id: String,
  pub added_at: DateTime<Utc>,
  pub accessed_at: DateTime<Utc>,
  pub access_count: u32,
  pub priority: i32,
  pub last_sync_attempt: Option<DateTime<Utc>>,
  pub status: SyncStatus,
}

#[cfg(test)]
mod tests {
  use super::*;

  fn stored() -> BookMeta {
    BookMeta {
      name: "Stored Name".to_string(),
      author: Some("Author".to_string()),
      category: Some("Fantasy".to_string()),
      status: Some("連載中".to_string()),
      update_label: Some("2024-01-01".to_string()),
      last_chapter: Some(LastChapter {
        number: Some(10),
        title: "Chapter 10".to_string(),
        url: "https://example.com/1/10.html".to_string(),
      }),
      source_url: Some("https://example.com/1/".to_string()),
    }
  }

  #[test]
  fn test_merge_empty_fields_keep_stored_values() {
    let incoming = BookMeta {
      name: "  ".to_string(),
      author: Some(String::new()),
      category: None,
      status: None,
      update_label: Some(" ".to_string()),
      last_chapter: Some(LastChapter::default()),
      source_url: None,
    };

    let merged = BookMeta::merge(&stored(), &incoming);
    assert_eq!(merged, stored());
  }

  #[test]
  fn test_merge_non_empty_fields_overwrite() {
    let incoming = BookMeta {
      name: "New Name".to_string(),
      author: Some("Other".to_string()),
      status: Some("已完成".to_string()),
      last_chapter: Some(LastChapter {
        number: Some(11),
        title: "Chapter 11".to_string(),
        url: String::new(),
      }),
      ..Default::default()
    };

    let merged = BookMeta::merge(&stored(), &incoming);
    assert_eq!(merged.name, "New Name");
    assert_eq!(merged.author.as_deref(), Some("Other"));
    assert_eq!(merged.category.as_deref(), Some("Fantasy"));
    assert_eq!(merged.status.as_deref(), Some("已完成"));
    // Pointer is replaced as a whole, even the empty url
    let pointer = merged.last_chapter.unwrap();
    assert_eq!(pointer.number, Some(11));
    assert_eq!(pointer.url, "");
  }

  #[test]
  fn test_merge_fills_missing_stored_fields() {
    let merged = BookMeta::merge(
      &BookMeta::default(),
      &BookMeta {
        name: "Fresh".to_string(),
        author: Some("A".to_string()),
        ..Default::default()
      },
    );
    assert_eq!(merged.name, "Fresh");
    assert_eq!(merged.author.as_deref(), Some("A"));
    assert!(merged.last_chapter.is_none());
  }

  #[test]
  fn test_sync_status_roundtrip_strings() {
    for status in [
      SyncStatus::Pending,
      SyncStatus::Syncing,
      SyncStatus::Completed,
      SyncStatus::Failed,
    ] {
      assert_eq!(status.as_str().parse::<SyncStatus>().unwrap(), status);
    }
    assert!("done".parse::<SyncStatus>().is_err());
  }
}

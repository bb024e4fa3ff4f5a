//! Store statistics, housekeeping and export.

use chrono::{DateTime, Duration, Utc};
use rusqlite::params;
use serde::Serialize;

use super::{Database, StoreResult};
use crate::types::Book;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AuthorCount {
  pub author: String,
  pub book_count: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DatabaseStats {
  pub total_books: u64,
  pub total_chapters: u64,
  pub chapters_with_content: u64,
  pub chapters_without_content: u64,
  pub books_scraped_24h: u64,
  pub chapters_fetched_24h: u64,
  pub top_authors: Vec<AuthorCount>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChapterExport {
  pub number: u32,
  pub title: Option<String>,
  pub url: String,
  pub public_id: Option<String>,
  pub word_count: Option<u32>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub text: Option<String>,
}

/// A book with all of its stored chapters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BookExport {
  #[serde(flatten)]
  pub book: Book,
  pub chapters: Vec<ChapterExport>,
}

fn count(conn: &rusqlite::Connection, sql: &str, params: impl rusqlite::Params) -> rusqlite::Result<u64> {
  let n: i64 = conn.query_row(sql, params, |row| row.get(0))?;
  Ok(n as u64)
}

impl Database {
  pub fn database_stats(&self) -> StoreResult<DatabaseStats> {
    let conn = self.session()?;
    let since = Utc::now() - Duration::hours(24);

    let mut stmt = conn.prepare(
      "SELECT author, COUNT(*) AS n FROM books
       WHERE author IS NOT NULL AND author != ''
       GROUP BY author ORDER BY n DESC, author ASC LIMIT 5",
    )?;
    let top_authors = stmt
      .query_map([], |row| {
        Ok(AuthorCount {
          author: row.get(0)?,
          book_count: row.get::<_, i64>(1)? as u64,
        })
      })?
      .collect::<rusqlite::Result<Vec<_>>>()?;

    // One statement, so both counts come from the same snapshot
    let (total_chapters, chapters_with_content) =
      conn.query_row("SELECT COUNT(*), COUNT(text) FROM chapters", [], |row| {
        Ok((row.get::<_, i64>(0)? as u64, row.get::<_, i64>(1)? as u64))
      })?;

    Ok(DatabaseStats {
      total_books: count(&conn, "SELECT COUNT(*) FROM books", [])?,
      total_chapters,
      chapters_with_content,
      chapters_without_content: total_chapters.saturating_sub(chapters_with_content),
      books_scraped_24h: count(
        &conn,
        "SELECT COUNT(*) FROM books WHERE last_scraped_at >= ?",
        params![since],
      )?,
      chapters_fetched_24h: count(
        &conn,
        "SELECT COUNT(*) FROM chapters WHERE fetched_at >= ?",
        params![since],
      )?,
      top_authors,
    })
  }

  /// Delete chapters not updated in the last `days` days. Returns the number removed.
  pub fn cleanup_stale_chapters(&self, days: u32) -> StoreResult<usize> {
    let conn = self.session()?;
    let cutoff = Utc::now()
      .checked_sub_signed(Duration::days(i64::from(days)))
      .unwrap_or(DateTime::<Utc>::MIN_UTC);
    let deleted = conn.execute("DELETE FROM chapters WHERE updated_at < ?", params![cutoff])?;
    tracing::info!(deleted, days, "Removed stale chapters");
    Ok(deleted)
  }

  /// Rebuild the database file to reclaim free pages.
  pub fn vacuum(&self) -> StoreResult<()> {
    let conn = self.session()?;
    conn.execute_batch("VACUUM")?;
    tracing::info!(path = %self.path().display(), "Vacuumed store");
    Ok(())
  }

  pub fn export_book(&self, book_id: &str, include_content: bool) -> StoreResult<Option<BookExport>> {
    let Some(book) = self.get_book(book_id)? else {
      return Ok(None);
    };

    let conn = self.session()?;
    let mut stmt = conn.prepare(
      "SELECT chapter_num, title, url, public_id, word_count, text FROM chapters
       WHERE book_id = ? ORDER BY chapter_num",
    )?;
    let chapters = stmt
      .query_map(params![book_id], |row| {
        Ok(ChapterExport {
          number: row.get(0)?,
          title: row.get(1)?,
          url: row.get(2)?,
          public_id: row.get(3)?,
          word_count: row.get(4)?,
          text: if include_content { row.get(5)? } else { None },
        })
      })?
      .collect::<rusqlite::Result<Vec<_>>>()?;

    Ok(Some(BookExport { book, chapters }))
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::db::testing::temp_db;
  use crate::types::{BookMeta, ChapterDraft, ChapterRef};

  fn seed(db: &Database) {
    for (id, author) in [("1", "Alpha"), ("2", "Alpha"), ("3", "Beta")] {
      db.upsert_book(
        id,
        &BookMeta {
          name: format!("Book {}", id),
          author: Some(author.to_string()),
          ..Default::default()
        },
      )
      .unwrap();
    }
    let refs: Vec<ChapterRef> = (1..=3)
      .map(|n| ChapterRef::new(n, format!("Ch {}", n), format!("https://example.com/1/{}.html", n)))
      .collect();
    db.upsert_chapter_refs("1", &refs, 100);
    db.upsert_chapter_content(
      "1",
      2,
      &ChapterDraft {
        title: None,
        url: String::new(),
        text: "body".to_string(),
      },
    )
    .unwrap();
  }

  #[test]
  fn test_database_stats() {
    let (_dir, db) = temp_db();
    seed(&db);

    let stats = db.database_stats().unwrap();
    assert_eq!(stats.total_books, 3);
    assert_eq!(stats.total_chapters, 3);
    assert_eq!(stats.chapters_with_content, 1);
    assert_eq!(stats.chapters_without_content, 2);
    assert_eq!(stats.books_scraped_24h, 3);
    assert_eq!(stats.chapters_fetched_24h, 3);
    assert_eq!(
      stats.top_authors[0],
      AuthorCount {
        author: "Alpha".to_string(),
        book_count: 2
      }
    );
  }

  #[test]
  fn test_stats_stay_consistent_under_concurrent_writes() {
    let (_dir, db) = temp_db();
    let refs: Vec<ChapterRef> = (1..=200)
      .map(|n| ChapterRef::new(n, format!("Ch {}", n), format!("https://example.com/9/{}.html", n)))
      .collect();
    db.upsert_chapter_refs("9", &refs, 50);

    let writer = {
      let db = db.clone();
      std::thread::spawn(move || {
        for n in 1..=200 {
          db.upsert_chapter_content(
            "9",
            n,
            &ChapterDraft {
              title: None,
              url: String::new(),
              text: format!("body {}", n),
            },
          )
          .unwrap();
        }
      })
    };
    for _ in 0..50 {
      let stats = db.database_stats().unwrap();
      assert_eq!(stats.total_chapters, 200);
      assert_eq!(stats.chapters_with_content + stats.chapters_without_content, 200);
    }
    writer.join().unwrap();
    assert_eq!(db.database_stats().unwrap().chapters_with_content, 200);
  }

  #[test]
  fn test_export_with_and_without_content() {
    let (_dir, db) = temp_db();
    seed(&db);

    let full = db.export_book("1", true).unwrap().unwrap();
    assert_eq!(full.chapters.len(), 3);
    assert_eq!(full.chapters[1].text.as_deref(), Some("body"));
    assert_eq!(full.chapters[1].word_count, Some(4));

    let light = db.export_book("1", false).unwrap().unwrap();
    assert!(light.chapters.iter().all(|c| c.text.is_none()));
    let json = serde_json::to_value(&light).unwrap();
    assert_eq!(json["id"], "1");
    assert!(json["chapters"][1].get("text").is_none());

    assert!(db.export_book("missing", true).unwrap().is_none());
  }

  #[test]
  fn test_cleanup_keeps_recent_chapters_and_vacuum_runs() {
    let (_dir, db) = temp_db();
    seed(&db);
    let conn = db.session().unwrap();
    conn
      .execute(
        "UPDATE chapters SET updated_at = ?1 WHERE chapter_num = 3",
        params![Utc::now() - Duration::days(40)],
      )
      .unwrap();

    assert_eq!(db.cleanup_stale_chapters(30).unwrap(), 1);
    assert_eq!(db.list_chapters("1").unwrap().len(), 2);
    // A cutoff before the calendar begins removes nothing
    assert_eq!(db.cleanup_stale_chapters(u32::MAX).unwrap(), 0);
    assert_eq!(db.list_chapters("1").unwrap().len(), 2);
    db.vacuum().unwrap();
  }
}

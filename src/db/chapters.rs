//! Chapter rows: references (title + url) and, once fetched, their bodies.

use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};
use std::collections::HashMap;

use super::{fresh_public_id, Database, StoreResult, WriteOutcome};
use crate::types::{ChapterContent, ChapterDraft, ChapterRef};

/// Summary of a batched chapter-reference upsert.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RefsReport {
  pub inserted: usize,
  pub updated: usize,
  /// Batches skipped because a concurrent writer already committed them
  pub collided_batches: usize,
  /// Batches that failed for any other reason
  pub failed_batches: usize,
}

impl RefsReport {
  pub fn is_clean(&self) -> bool {
    self.failed_batches == 0
  }
}

fn non_empty(value: &str) -> Option<&str> {
  if value.trim().is_empty() {
    None
  } else {
    Some(value)
  }
}

impl Database {
  /// A stored chapter with its body. Rows without a body are reported as absent.
  pub fn get_chapter_content(&self, book_id: &str, number: u32) -> StoreResult<Option<ChapterContent>> {
    let conn = self.session()?;
    let content = conn
      .query_row(
        "SELECT title, url, text, public_id FROM chapters
         WHERE book_id = ?1 AND chapter_num = ?2 AND text IS NOT NULL",
        params![book_id, number],
        |row| {
          Ok(ChapterContent {
            book_id: book_id.to_string(),
            number,
            title: row.get(0)?,
            url: row.get(1)?,
            text: row.get(2)?,
            public_id: row.get(3)?,
          })
        },
      )
      .optional()?;
    Ok(content)
  }

  /// Store a chapter body, creating the row if needed.
  pub fn upsert_chapter_content(
    &self,
    book_id: &str,
    number: u32,
    draft: &ChapterDraft,
  ) -> StoreResult<ChapterContent> {
    self.with_public_id_lock(|| {
      let mut conn = self.session()?;
      let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
      let now = Utc::now();
      let word_count = draft.text.chars().count() as i64;

      let existing: Option<Option<String>> = tx
        .query_row(
          "SELECT public_id FROM chapters WHERE book_id = ?1 AND chapter_num = ?2",
          params![book_id, number],
          |row| row.get(0),
        )
        .optional()?;

      let public_id = match existing.flatten() {
        Some(id) => id,
        None => fresh_public_id(&tx, "chapters")?,
      };

      tx.execute(
        "INSERT INTO chapters (book_id, chapter_num, public_id, title, url, text, word_count, fetched_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?8)
         ON CONFLICT(book_id, chapter_num) DO UPDATE SET
           public_id = COALESCE(chapters.public_id, excluded.public_id),
           title = COALESCE(excluded.title, chapters.title),
           url = COALESCE(NULLIF(excluded.url, ''), chapters.url),
           text = excluded.text,
           word_count = excluded.word_count,
           updated_at = excluded.updated_at",
        params![
          book_id,
          number,
          public_id,
          draft.title.as_deref().and_then(non_empty),
          draft.url,
          draft.text,
          word_count,
          now,
        ],
      )?;

      let (title, url): (Option<String>, String) = tx.query_row(
        "SELECT title, url FROM chapters WHERE book_id = ?1 AND chapter_num = ?2",
        params![book_id, number],
        |row| Ok((row.get(0)?, row.get(1)?)),
      )?;
      tx.commit()?;

      Ok(ChapterContent {
        book_id: book_id.to_string(),
        number,
        title,
        url,
        text: draft.text.clone(),
        public_id: Some(public_id),
      })
    })
  }

  /// All chapter references for a book, ordered by chapter number.
  pub fn list_chapters(&self, book_id: &str) -> StoreResult<Vec<ChapterRef>> {
    let conn = self.session()?;
    let mut stmt = conn.prepare(
      "SELECT chapter_num, title, url, public_id FROM chapters
       WHERE book_id = ? ORDER BY chapter_num",
    )?;
    let refs = stmt
      .query_map(params![book_id], |row| {
        Ok(ChapterRef {
          number: row.get(0)?,
          title: row.get::<_, Option<String>>(1)?.unwrap_or_default(),
          url: row.get(2)?,
          public_id: row.get(3)?,
        })
      })?
      .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(refs)
  }

  /// Upsert chapter references in fixed-size batches, one transaction per batch.
  ///
  /// Stored bodies are never touched. A batch that collides with rows another writer already
  /// committed is skipped and the loop moves on.
  pub fn upsert_chapter_refs(&self, book_id: &str, refs: &[ChapterRef], batch_size: usize) -> RefsReport {
    let mut report = RefsReport::default();

    for (index, batch) in refs.chunks(batch_size.max(1)).enumerate() {
      let result = self.with_public_id_lock(|| self.write_ref_batch(book_id, batch));
      match result {
        Ok((inserted, updated)) => {
          report.inserted += inserted;
          report.updated += updated;
        }
        Err(err) => match err.outcome() {
          WriteOutcome::AlreadyExists => {
            tracing::debug!(book_id, batch = index, "Chapter batch already written by a concurrent writer");
            report.collided_batches += 1;
          }
          WriteOutcome::TransientError(error) => {
            tracing::warn!(book_id, batch = index, error = %error, "Failed to commit chapter batch");
            report.failed_batches += 1;
          }
          WriteOutcome::Ok => {}
        },
      }
    }

    tracing::info!(
      book_id,
      inserted = report.inserted,
      updated = report.updated,
      collided = report.collided_batches,
      failed = report.failed_batches,
      "Stored chapter references"
    );
    report
  }

  fn write_ref_batch(&self, book_id: &str, batch: &[ChapterRef]) -> StoreResult<(usize, usize)> {
    let mut conn = self.session()?;
    let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
    let mut existing = existing_public_ids(&tx, book_id, batch)?;
    let now = Utc::now();
    let mut inserted = 0;
    let mut updated = 0;

    for chapter in batch {
      match existing.get(&chapter.number).cloned() {
        Some(current_id) => {
          let public_id = match current_id {
            Some(id) => id,
            None => fresh_public_id(&tx, "chapters")?,
          };
          tx.execute(
            "UPDATE chapters SET
               title = COALESCE(?3, title),
               url = COALESCE(?4, url),
               public_id = COALESCE(public_id, ?5)
             WHERE book_id = ?1 AND chapter_num = ?2",
            params![
              book_id,
              chapter.number,
              non_empty(&chapter.title),
              non_empty(&chapter.url),
              public_id,
            ],
          )?;
          updated += 1;
        }
        None => {
          let public_id = fresh_public_id(&tx, "chapters")?;
          tx.execute(
            "INSERT INTO chapters (book_id, chapter_num, public_id, title, url, text, fetched_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, NULL, ?6, ?6)",
            params![
              book_id,
              chapter.number,
              public_id,
              non_empty(&chapter.title),
              chapter.url,
              now,
            ],
          )?;
          existing.insert(chapter.number, Some(public_id));
          inserted += 1;
        }
      }
    }

    tx.commit()?;
    Ok((inserted, updated))
  }

  /// Delete every chapter of a book. Returns the number of rows removed.
  pub fn delete_chapters(&self, book_id: &str) -> StoreResult<usize> {
    let conn = self.session()?;
    Ok(conn.execute("DELETE FROM chapters WHERE book_id = ?", params![book_id])?)
  }
}

fn existing_public_ids(
  conn: &Connection,
  book_id: &str,
  batch: &[ChapterRef],
) -> StoreResult<HashMap<u32, Option<String>>> {
  let (Some(low), Some(high)) = (
    batch.iter().map(|c| c.number).min(),
    batch.iter().map(|c| c.number).max(),
  ) else {
    return Ok(HashMap::new());
  };

  let mut stmt = conn.prepare(
    "SELECT chapter_num, public_id FROM chapters
     WHERE book_id = ?1 AND chapter_num BETWEEN ?2 AND ?3",
  )?;
  let rows = stmt
    .query_map(params![book_id, low, high], |row| Ok((row.get(0)?, row.get(1)?)))?
    .collect::<rusqlite::Result<HashMap<u32, Option<String>>>>()?;
  Ok(rows)
}

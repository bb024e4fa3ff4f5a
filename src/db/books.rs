//! Book rows.

use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension, Row, TransactionBehavior};

use super::{fresh_public_id, Database, StoreResult};
use crate::types::{Book, BookMeta, LastChapter};

const BOOK_COLUMNS: &str = "id, public_id, name, author, category, status, update_label, \
   last_chapter_num, last_chapter_title, last_chapter_url, source_url, created_at, last_scraped_at";

fn book_from_row(row: &Row<'_>) -> rusqlite::Result<Book> {
  let last_num: Option<u32> = row.get(7)?;
  let last_title: Option<String> = row.get(8)?;
  let last_url: Option<String> = row.get(9)?;
  let last_chapter = if last_num.is_none() && last_title.is_none() && last_url.is_none() {
    None
  } else {
    Some(LastChapter {
      number: last_num,
      title: last_title.unwrap_or_default(),
      url: last_url.unwrap_or_default(),
    })
  };

  Ok(Book {
    id: row.get(0)?,
    public_id: row.get(1)?,
    meta: BookMeta {
      name: row.get(2)?,
      author: row.get(3)?,
      category: row.get(4)?,
      status: row.get(5)?,
      update_label: row.get(6)?,
      last_chapter,
      source_url: row.get(10)?,
    },
    created_at: row.get(11)?,
    last_scraped_at: row.get(12)?,
  })
}

fn select_book(conn: &Connection, book_id: &str) -> rusqlite::Result<Option<Book>> {
  conn
    .query_row(
      &format!("SELECT {} FROM books WHERE id = ?", BOOK_COLUMNS),
      params![book_id],
      book_from_row,
    )
    .optional()
}

impl Database {
  pub fn get_book(&self, book_id: &str) -> StoreResult<Option<Book>> {
    let conn = self.session()?;
    Ok(select_book(&conn, book_id)?)
  }

  /// Upsert a book, merging `incoming` over the stored metadata.
  ///
  /// Returns the merged row as persisted. A public id is assigned on first insert.
  pub fn upsert_book(&self, book_id: &str, incoming: &BookMeta) -> StoreResult<Book> {
    self.with_public_id_lock(|| {
      let mut conn = self.session()?;
      let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

      let existing = select_book(&tx, book_id)?;
      let now = Utc::now();
      let book = match existing {
        Some(stored) => Book {
          meta: BookMeta::merge(&stored.meta, incoming),
          public_id: match stored.public_id {
            Some(id) => Some(id),
            None => Some(fresh_public_id(&tx, "books")?),
          },
          last_scraped_at: Some(now),
          ..stored
        },
        None => Book {
          id: book_id.to_string(),
          public_id: Some(fresh_public_id(&tx, "books")?),
          meta: BookMeta::merge(&BookMeta::default(), incoming),
          created_at: now,
          last_scraped_at: Some(now),
        },
      };

      let pointer = book.meta.last_chapter.as_ref();
      tx.execute(
        "INSERT INTO books (id, public_id, name, author, category, status, update_label,
           last_chapter_num, last_chapter_title, last_chapter_url, source_url, created_at, last_scraped_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)
         ON CONFLICT(id) DO UPDATE SET
           public_id = COALESCE(books.public_id, excluded.public_id),
           name = excluded.name,
           author = excluded.author,
           category = excluded.category,
           status = excluded.status,
           update_label = excluded.update_label,
           last_chapter_num = excluded.last_chapter_num,
           last_chapter_title = excluded.last_chapter_title,
           last_chapter_url = excluded.last_chapter_url,
           source_url = excluded.source_url,
           last_scraped_at = excluded.last_scraped_at",
        params![
          book.id,
          book.public_id,
          book.meta.name,
          book.meta.author,
          book.meta.category,
          book.meta.status,
          book.meta.update_label,
          pointer.and_then(|p| p.number),
          pointer.map(|p| p.title.as_str()),
          pointer.map(|p| p.url.as_str()),
          book.meta.source_url,
          book.created_at,
          book.last_scraped_at,
        ],
      )?;
      tx.commit()?;

      Ok(book)
    })
  }

  /// Assign a public id to a book persisted without one. Returns the id in use.
  pub fn ensure_book_public_id(&self, book_id: &str) -> StoreResult<Option<String>> {
    self.with_public_id_lock(|| {
      let conn = self.session()?;
      let current: Option<Option<String>> = conn
        .query_row(
          "SELECT public_id FROM books WHERE id = ?",
          params![book_id],
          |row| row.get(0),
        )
        .optional()?;

      match current {
        None => Ok(None),
        Some(Some(id)) => Ok(Some(id)),
        Some(None) => {
          let id = fresh_public_id(&conn, "books")?;
          conn.execute(
            "UPDATE books SET public_id = ?1 WHERE id = ?2 AND public_id IS NULL",
            params![id, book_id],
          )?;
          Ok(Some(id))
        }
      }
    })
  }

  /// Ids of every book whose status is not the origin's finished label.
  /// Surrounding whitespace on either side is ignored.
  pub fn unfinished_book_ids(&self, finished_status: &str) -> StoreResult<Vec<String>> {
    let conn = self.session()?;
    let mut stmt = conn.prepare(
      "SELECT id FROM books
       WHERE status IS NULL OR TRIM(status, char(32, 9, 10, 13)) != TRIM(?1, char(32, 9, 10, 13))
       ORDER BY id",
    )?;
    let ids = stmt
      .query_map(params![finished_status], |row| row.get(0))?
      .collect::<rusqlite::Result<Vec<String>>>()?;
    Ok(ids)
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::db::testing::temp_db;

  fn meta(name: &str, status: Option<&str>) -> BookMeta {
    BookMeta {
      name: name.to_string(),
      author: Some("Author".to_string()),
      status: status.map(String::from),
      ..Default::default()
    }
  }

  #[test]
  fn test_upsert_assigns_public_id_once() {
    let (_dir, db) = temp_db();
    let first = db.upsert_book("42", &meta("Book", None)).unwrap();
    let public_id = first.public_id.clone().expect("public id assigned");

    let second = db.upsert_book("42", &meta("Book Renamed", None)).unwrap();
    assert_eq!(second.public_id.as_deref(), Some(public_id.as_str()));
    assert_eq!(second.created_at, first.created_at);

    let stored = db.get_book("42").unwrap().unwrap();
    assert_eq!(stored.public_id.as_deref(), Some(public_id.as_str()));
    assert_eq!(stored.meta.name, "Book Renamed");
  }

  #[test]
  fn test_upsert_never_clobbers_with_empty_fields() {
    let (_dir, db) = temp_db();
    db.upsert_book(
      "7",
      &BookMeta {
        name: "Name".to_string(),
        author: Some("Writer".to_string()),
        category: Some("Wuxia".to_string()),
        last_chapter: Some(LastChapter {
          number: Some(3),
          title: "Three".to_string(),
          url: "https://example.com/7/3.html".to_string(),
        }),
        ..Default::default()
      },
    )
    .unwrap();

    let merged = db
      .upsert_book(
        "7",
        &BookMeta {
          name: String::new(),
          author: Some(String::new()),
          status: Some("連載中".to_string()),
          ..Default::default()
        },
      )
      .unwrap();

    let stored = db.get_book("7").unwrap().unwrap();
    assert_eq!(stored.meta, merged.meta);
    assert_eq!(stored.meta.name, "Name");
    assert_eq!(stored.meta.author.as_deref(), Some("Writer"));
    assert_eq!(stored.meta.category.as_deref(), Some("Wuxia"));
    assert_eq!(stored.meta.status.as_deref(), Some("連載中"));
    assert_eq!(stored.meta.last_chapter.unwrap().number, Some(3));
  }

  #[test]
  fn test_ensure_public_id_backfills_legacy_rows() {
    let (_dir, db) = temp_db();
    let conn = db.session().unwrap();
    conn
      .execute(
        "INSERT INTO books (id, name, created_at) VALUES ('legacy', 'Old', ?1)",
        params![Utc::now()],
      )
      .unwrap();

    let assigned = db.ensure_book_public_id("legacy").unwrap().unwrap();
    let again = db.ensure_book_public_id("legacy").unwrap().unwrap();
    assert_eq!(assigned, again);
    assert!(db.ensure_book_public_id("missing").unwrap().is_none());
  }

  #[test]
  fn test_unfinished_book_ids_excludes_finished() {
    let (_dir, db) = temp_db();
    db.upsert_book("1", &meta("A", Some("連載中"))).unwrap();
    db.upsert_book("2", &meta("B", Some("已完成"))).unwrap();
    db.upsert_book("3", &meta("C", None)).unwrap();
    db.upsert_book("4", &meta("D", Some(" 已完成\n"))).unwrap();

    let ids = db.unfinished_book_ids("已完成").unwrap();
    assert_eq!(ids, vec!["1".to_string(), "3".to_string()]);
  }

  #[test]
  fn test_concurrent_first_writes_share_one_public_id() {
    let (_dir, db) = temp_db();
    let handles: Vec<_> = (0..4)
      .map(|i| {
        let db = db.clone();
        std::thread::spawn(move || db.upsert_book("race", &meta(&format!("Name {}", i), None)))
      })
      .collect();

    let ids: Vec<String> = handles
      .into_iter()
      .map(|h| h.join().unwrap().unwrap().public_id.unwrap())
      .collect();
    assert!(ids.windows(2).all(|w| w[0] == w[1]));
  }
}

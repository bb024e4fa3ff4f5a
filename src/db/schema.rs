/// Store schema. Every statement is idempotent so it runs on each open.
pub const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS books (
    id TEXT PRIMARY KEY,
    public_id TEXT UNIQUE,
    name TEXT NOT NULL DEFAULT '',
    author TEXT,
    category TEXT,
    status TEXT,
    update_label TEXT,
    last_chapter_num INTEGER,
    last_chapter_title TEXT,
    last_chapter_url TEXT,
    source_url TEXT,
    created_at TEXT NOT NULL,
    last_scraped_at TEXT
);

CREATE INDEX IF NOT EXISTS idx_books_status ON books(status);

-- Chapter rows may arrive before their book row, so there is no foreign key.
CREATE TABLE IF NOT EXISTS chapters (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    book_id TEXT NOT NULL,
    chapter_num INTEGER NOT NULL,
    public_id TEXT UNIQUE,
    title TEXT,
    url TEXT NOT NULL DEFAULT '',
    text TEXT,
    word_count INTEGER,
    fetched_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

CREATE UNIQUE INDEX IF NOT EXISTS idx_book_chapter ON chapters(book_id, chapter_num);
CREATE INDEX IF NOT EXISTS idx_chapter_url ON chapters(url);
CREATE INDEX IF NOT EXISTS idx_chapter_updated ON chapters(updated_at);

CREATE TABLE IF NOT EXISTS pending_sync (
    book_id TEXT PRIMARY KEY,
    added_at TEXT NOT NULL,
    accessed_at TEXT NOT NULL,
    access_count INTEGER NOT NULL DEFAULT 0,
    priority INTEGER NOT NULL DEFAULT 0,
    last_sync_attempt TEXT,
    sync_status TEXT NOT NULL DEFAULT 'pending'
);

CREATE INDEX IF NOT EXISTS idx_pending_status ON pending_sync(sync_status, priority, access_count);
"#;

use std::cmp;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, TimeZone, Utc};
use parking_lot::{Mutex, MutexGuard};
use rusqlite::{Connection, OpenFlags};
use serde::Serialize;
use tokio::sync::broadcast;
use tracing::{debug, info};

use crate::errors::AppResult;

const DEFAULT_PAGE_SIZE: usize = 50;
const MAX_PAGE_SIZE: usize = 500;
const CHANGE_CHANNEL_CAPACITY: usize = 256;

/// Table groups a live reader can listen on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StoreChange {
    Venues,
    Books,
    Categories,
    Similarity,
    Saved,
    Users,
}

/// Shared handle to the local cache database.
#[derive(Clone)]
pub struct CacheStore {
    db: Arc<Mutex<Connection>>,
    path: Option<PathBuf>,
    changes: broadcast::Sender<StoreChange>,
}

impl CacheStore {
    pub fn open<P: AsRef<Path>>(data_dir: P, database_file: &str) -> AppResult<Self> {
        let data_dir = data_dir.as_ref();
        std::fs::create_dir_all(data_dir)?;
        let db_path = data_dir.join(database_file);
        let flags = OpenFlags::SQLITE_OPEN_READ_WRITE | OpenFlags::SQLITE_OPEN_CREATE;
        let connection = Connection::open_with_flags(&db_path, flags)?;
        connection.execute_batch("PRAGMA journal_mode = WAL;")?;
        let store = Self::from_connection(connection, Some(db_path.clone()))?;
        info!(
            target: "store_bootstrap",
            path = %db_path.display(),
            "cache store ready"
        );
        Ok(store)
    }

    pub fn in_memory() -> AppResult<Self> {
        Self::from_connection(Connection::open_in_memory()?, None)
    }

    fn from_connection(connection: Connection, path: Option<PathBuf>) -> AppResult<Self> {
        connection.execute_batch("PRAGMA foreign_keys = ON;")?;
        run_migrations(&connection)?;
        let (changes, _) = broadcast::channel(CHANGE_CHANNEL_CAPACITY);
        Ok(Self {
            db: Arc::new(Mutex::new(connection)),
            path,
            changes,
        })
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Locks the connection. Keep the guard short-lived; it is never held
    /// across an `.await`.
    pub fn conn(&self) -> MutexGuard<'_, Connection> {
        self.db.lock()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StoreChange> {
        self.changes.subscribe()
    }

    pub fn notify(&self, change: StoreChange) {
        // No receivers is the common case outside a live UI.
        if self.changes.send(change).is_err() {
            debug!(target: "store", ?change, "no live subscribers");
        }
    }
}

fn run_migrations(connection: &Connection) -> AppResult<()> {
    connection.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS categories (
            category_id TEXT PRIMARY KEY,
            name TEXT NOT NULL,
            plural_name TEXT,
            parent_id TEXT,
            icon_url TEXT
        );

        CREATE TABLE IF NOT EXISTS category_closure (
            category_id TEXT NOT NULL,
            ancestor_id TEXT NOT NULL,
            depth INTEGER NOT NULL CHECK (depth >= 0),
            PRIMARY KEY (category_id, ancestor_id)
        );

        CREATE TABLE IF NOT EXISTS venues (
            venue_id TEXT PRIMARY KEY,
            name TEXT NOT NULL,
            lat REAL NOT NULL,
            lng REAL NOT NULL,
            address TEXT,
            postal_code TEXT,
            category_id TEXT NOT NULL,
            distance_meters REAL NOT NULL DEFAULT 0,
            is_recommended INTEGER NOT NULL DEFAULT 0 CHECK (is_recommended IN (0, 1)),
            details_json TEXT,
            created_at INTEGER NOT NULL,
            updated_at INTEGER NOT NULL
        );

        CREATE TABLE IF NOT EXISTS similar_venues (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            owner_id TEXT NOT NULL,
            sibling_id TEXT NOT NULL,
            created_at INTEGER NOT NULL
        );

        CREATE TABLE IF NOT EXISTS books (
            isbn13 TEXT NOT NULL,
            list_name TEXT NOT NULL,
            rank INTEGER NOT NULL,
            title TEXT NOT NULL,
            author TEXT,
            description TEXT,
            image_url TEXT,
            fetched_at INTEGER NOT NULL,
            PRIMARY KEY (isbn13, list_name)
        );

        CREATE TABLE IF NOT EXISTS freshness (
            signature TEXT PRIMARY KEY,
            last_fetched_at INTEGER NOT NULL
        );

        CREATE TABLE IF NOT EXISTS users (
            user_id TEXT PRIMARY KEY,
            display_name TEXT NOT NULL,
            email TEXT,
            lat REAL,
            lng REAL,
            location_updated_at INTEGER,
            created_at INTEGER NOT NULL
        );

        CREATE TABLE IF NOT EXISTS saved_items (
            user_id TEXT NOT NULL,
            item_kind TEXT NOT NULL CHECK (item_kind IN ('venue', 'book')),
            item_id TEXT NOT NULL,
            is_favorite INTEGER NOT NULL DEFAULT 0 CHECK (is_favorite IN (0, 1)),
            saved_at INTEGER NOT NULL,
            PRIMARY KEY (user_id, item_kind, item_id),
            FOREIGN KEY (user_id) REFERENCES users(user_id) ON DELETE CASCADE
        );

        CREATE INDEX IF NOT EXISTS idx_closure_ancestor ON category_closure(ancestor_id, depth);
        CREATE INDEX IF NOT EXISTS idx_venues_category ON venues(category_id);
        CREATE INDEX IF NOT EXISTS idx_venues_distance ON venues(distance_meters);
        CREATE INDEX IF NOT EXISTS idx_similar_owner ON similar_venues(owner_id);
        CREATE INDEX IF NOT EXISTS idx_books_list_rank ON books(list_name, rank);
        "#,
    )?;

    Ok(())
}

pub fn to_millis(at: DateTime<Utc>) -> i64 {
    at.timestamp_millis()
}

pub fn from_millis(millis: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(millis)
        .single()
        .unwrap_or(DateTime::<Utc>::UNIX_EPOCH)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Pagination {
    pub page: usize,
    pub page_size: usize,
}

impl Pagination {
    pub fn new(page: Option<usize>, page_size: Option<usize>) -> Self {
        let sanitized_page_size = page_size
            .unwrap_or(DEFAULT_PAGE_SIZE)
            .clamp(1, MAX_PAGE_SIZE);
        let sanitized_page = page.unwrap_or(1).max(1);
        Self {
            page: sanitized_page,
            page_size: sanitized_page_size,
        }
    }

    pub fn with_total(self, total: usize) -> Self {
        if total == 0 {
            return Self {
                page: 1,
                page_size: self.page_size,
            };
        }
        let pages = total.div_ceil(self.page_size);
        let capped_page = cmp::min(self.page, pages);
        Self {
            page: capped_page.max(1),
            page_size: self.page_size,
        }
    }

    pub fn limit(&self) -> i64 {
        self.page_size as i64
    }

    pub fn offset(&self) -> i64 {
        self.page.saturating_sub(1).saturating_mul(self.page_size) as i64
    }
}

impl Default for Pagination {
    fn default() -> Self {
        Self {
            page: 1,
            page_size: DEFAULT_PAGE_SIZE,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Page<T> {
    pub rows: Vec<T>,
    pub total: usize,
    pub page: usize,
    pub page_size: usize,
}

impl<T> Page<T> {
    pub fn new(rows: Vec<T>, total: usize, pagination: Pagination) -> Self {
        Self {
            rows,
            total,
            page: pagination.page,
            page_size: pagination.page_size,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn runs_migrations_and_creates_tables() {
        let dir = tempdir().unwrap();
        let store = CacheStore::open(dir.path(), "test.db").unwrap();
        let conn = store.conn();

        let mut stmt = conn
            .prepare(
                "SELECT name FROM sqlite_master WHERE type='table' AND name IN
                ('categories','category_closure','venues','similar_venues','books','freshness','users','saved_items')",
            )
            .unwrap();
        let rows = stmt
            .query_map([], |row| row.get::<_, String>(0))
            .unwrap()
            .count();
        assert_eq!(rows, 8);
        assert!(store.path().unwrap().ends_with("test.db"));
        assert!(conn.prepare("SELECT postal_code FROM venues").is_ok());
    }

    #[test]
    fn reopening_is_idempotent() {
        let dir = tempdir().unwrap();
        drop(CacheStore::open(dir.path(), "again.db").unwrap());
        let store = CacheStore::open(dir.path(), "again.db").unwrap();
        let conn = store.conn();
        let freshness_rows: i64 = conn
            .query_row("SELECT COUNT(*) FROM freshness", [], |row| row.get(0))
            .unwrap();
        assert_eq!(freshness_rows, 0);
    }

    #[test]
    fn pagination_clamps_and_caps() {
        let pagination = Pagination::new(Some(0), Some(10_000));
        assert_eq!(pagination.page, 1);
        assert_eq!(pagination.page_size, MAX_PAGE_SIZE);

        let capped = Pagination::new(Some(9), Some(10)).with_total(25);
        assert_eq!(capped.page, 3);
        assert_eq!(capped.offset(), 20);

        let empty = Pagination::new(Some(4), Some(10)).with_total(0);
        assert_eq!(empty.page, 1);
    }

    #[tokio::test]
    async fn subscribers_observe_changes() {
        let store = CacheStore::in_memory().unwrap();
        let mut rx = store.subscribe();
        store.notify(StoreChange::Venues);
        assert_eq!(rx.recv().await.unwrap(), StoreChange::Venues);
    }

    #[test]
    fn millis_round_trip() {
        let now = Utc.timestamp_millis_opt(1_700_000_000_123).unwrap();
        assert_eq!(from_millis(to_millis(now)), now);
    }
}

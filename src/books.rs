use chrono::{DateTime, Utc};
use rusqlite::{named_params, params, Connection, OptionalExtension, Row};
use serde::Serialize;
use tracing::{trace, warn};

use crate::errors::AppResult;
use crate::providers::RawBook;
use crate::store::{from_millis, to_millis, Page, Pagination};
use crate::venues::{escape_like, UpsertOutcome};

/// How many titles "more from this list" shows.
pub const MORE_FROM_LIST_LIMIT: usize = 3;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Book {
    pub isbn13: String,
    pub list_name: String,
    pub rank: u32,
    pub title: String,
    pub author: Option<String>,
    pub description: Option<String>,
    pub image_url: Option<String>,
    pub fetched_at: DateTime<Utc>,
    pub is_favorite: bool,
    pub is_saved: bool,
}

impl Book {
    /// `None` when the provider row has no ISBN-13 to key on.
    pub fn from_raw(raw: &RawBook, list_name: &str, fetched_at: DateTime<Utc>) -> Option<Self> {
        let isbn13 = raw.isbn13.trim();
        if isbn13.is_empty() {
            warn!(target: "upsert", title = %raw.title, list_name, "book has no isbn13; skipping");
            return None;
        }
        Some(Self {
            isbn13: isbn13.to_string(),
            list_name: list_name.to_string(),
            rank: raw.rank,
            title: raw.title.clone(),
            author: raw.author.clone(),
            description: raw.description.clone(),
            image_url: raw.image_url.clone(),
            fetched_at,
            is_favorite: false,
            is_saved: false,
        })
    }
}

pub fn upsert_book(conn: &Connection, book: &Book) -> AppResult<UpsertOutcome> {
    let fetched_at = to_millis(book.fetched_at);
    let inserted = conn.execute(
        "INSERT INTO books (isbn13, list_name, rank, title, author, description, image_url, fetched_at)
        VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
        ON CONFLICT(isbn13, list_name) DO NOTHING",
        params![
            book.isbn13,
            book.list_name,
            book.rank,
            book.title,
            book.author,
            book.description,
            book.image_url,
            fetched_at,
        ],
    )?;
    if inserted == 1 {
        trace!(target: "upsert", isbn13 = %book.isbn13, list_name = %book.list_name, "book created");
        return Ok(UpsertOutcome::Created);
    }

    conn.execute(
        "UPDATE books SET
            rank = ?3,
            title = ?4,
            author = ?5,
            description = ?6,
            image_url = ?7,
            fetched_at = ?8
        WHERE isbn13 = ?1 AND list_name = ?2",
        params![
            book.isbn13,
            book.list_name,
            book.rank,
            book.title,
            book.author,
            book.description,
            book.image_url,
            fetched_at,
        ],
    )?;
    trace!(target: "upsert", isbn13 = %book.isbn13, list_name = %book.list_name, "book updated");
    Ok(UpsertOutcome::Updated)
}

const BOOK_SELECT: &str = "SELECT b.isbn13, b.list_name, b.rank, b.title, b.author,
        b.description, b.image_url, b.fetched_at,
        s.item_id IS NOT NULL, COALESCE(s.is_favorite, 0)
    FROM books b
    LEFT JOIN saved_items s
        ON s.item_kind = 'book' AND s.item_id = b.isbn13 AND s.user_id = :user";

pub fn books_in_list(
    conn: &Connection,
    list_name: &str,
    user_id: Option<&str>,
    pagination: Pagination,
) -> AppResult<Page<Book>> {
    let total: i64 = conn.query_row(
        "SELECT COUNT(*) FROM books WHERE list_name = ?1",
        [list_name],
        |row| row.get(0),
    )?;
    let total = total as usize;
    let pagination = pagination.with_total(total);
    let mut stmt = conn.prepare(&format!(
        "{BOOK_SELECT} WHERE b.list_name = :list
        ORDER BY b.rank ASC, b.isbn13 ASC
        LIMIT :limit OFFSET :offset"
    ))?;
    let rows = stmt
        .query_map(
            named_params! {
                ":user": user_id,
                ":list": list_name,
                ":limit": pagination.limit(),
                ":offset": pagination.offset(),
            },
            parse_book,
        )?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(Page::new(rows, total, pagination))
}

/// The rank-1 title of `list_name`, if the list is cached.
pub fn top_book(conn: &Connection, list_name: &str, user_id: Option<&str>) -> AppResult<Option<Book>> {
    let book = conn
        .query_row(
            &format!(
                "{BOOK_SELECT} WHERE b.list_name = :list
                ORDER BY b.rank ASC, b.isbn13 ASC
                LIMIT 1"
            ),
            named_params! { ":user": user_id, ":list": list_name },
            parse_book,
        )
        .optional()?;
    Ok(book)
}

/// Other titles on the same list, best ranked first.
pub fn list_excluding(
    conn: &Connection,
    isbn13: &str,
    list_name: &str,
    user_id: Option<&str>,
    limit: usize,
) -> AppResult<Vec<Book>> {
    let mut stmt = conn.prepare(&format!(
        "{BOOK_SELECT} WHERE b.list_name = :list AND b.isbn13 <> :isbn
        ORDER BY b.rank ASC, b.isbn13 ASC
        LIMIT :limit"
    ))?;
    let rows = stmt
        .query_map(
            named_params! {
                ":user": user_id,
                ":list": list_name,
                ":isbn": isbn13,
                ":limit": limit as i64,
            },
            parse_book,
        )?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

/// A book by ISBN; when it sits on several lists the best rank wins.
pub fn book(conn: &Connection, isbn13: &str, user_id: Option<&str>) -> AppResult<Option<Book>> {
    let book = conn
        .query_row(
            &format!(
                "{BOOK_SELECT} WHERE b.isbn13 = :isbn
                ORDER BY b.rank ASC, b.list_name ASC
                LIMIT 1"
            ),
            named_params! { ":user": user_id, ":isbn": isbn13 },
            parse_book,
        )
        .optional()?;
    Ok(book)
}

pub fn book_exists(conn: &Connection, isbn13: &str) -> AppResult<bool> {
    let exists = conn.query_row(
        "SELECT EXISTS(SELECT 1 FROM books WHERE isbn13 = ?1)",
        [isbn13],
        |row| row.get(0),
    )?;
    Ok(exists)
}

/// Titles or authors containing `needle`, one row per ISBN.
pub fn search(
    conn: &Connection,
    needle: &str,
    user_id: Option<&str>,
    limit: usize,
) -> AppResult<Vec<Book>> {
    let pattern = format!("%{}%", escape_like(needle.trim()));
    let mut stmt = conn.prepare(&format!(
        "{BOOK_SELECT}
        WHERE (b.title LIKE :pattern ESCAPE '\\' OR b.author LIKE :pattern ESCAPE '\\')
            AND b.rank = (SELECT MIN(rank) FROM books WHERE isbn13 = b.isbn13)
        GROUP BY b.isbn13
        ORDER BY b.rank ASC, b.title ASC
        LIMIT :limit"
    ))?;
    let rows = stmt
        .query_map(
            named_params! { ":user": user_id, ":pattern": pattern, ":limit": limit as i64 },
            parse_book,
        )?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

pub(crate) fn parse_book(row: &Row<'_>) -> rusqlite::Result<Book> {
    Ok(Book {
        isbn13: row.get(0)?,
        list_name: row.get(1)?,
        rank: row.get(2)?,
        title: row.get(3)?,
        author: row.get(4)?,
        description: row.get(5)?,
        image_url: row.get(6)?,
        fetched_at: from_millis(row.get(7)?),
        is_saved: row.get(8)?,
        is_favorite: row.get(9)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::CacheStore;
    use chrono::TimeZone;

    fn fetched() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 6, 2, 9, 30, 0).unwrap()
    }

    fn raw(isbn: &str, rank: u32, title: &str) -> RawBook {
        RawBook {
            isbn13: isbn.into(),
            rank,
            title: title.into(),
            author: Some("Author".into()),
            description: None,
            image_url: None,
        }
    }

    fn seed(conn: &Connection, list: &str, books: &[(&str, u32, &str)]) {
        for (isbn, rank, title) in books {
            let book = Book::from_raw(&raw(isbn, *rank, title), list, fetched()).unwrap();
            upsert_book(conn, &book).unwrap();
        }
    }

    #[test]
    fn upsert_keys_on_isbn_and_list() {
        let store = CacheStore::in_memory().unwrap();
        let conn = store.conn();
        let first = Book::from_raw(&raw("9780000000001", 4, "Old"), "fiction", fetched()).unwrap();
        assert_eq!(upsert_book(&conn, &first).unwrap(), UpsertOutcome::Created);

        let moved = Book::from_raw(&raw("9780000000001", 1, "New"), "fiction", fetched()).unwrap();
        assert_eq!(upsert_book(&conn, &moved).unwrap(), UpsertOutcome::Updated);

        let other_list =
            Book::from_raw(&raw("9780000000001", 7, "New"), "nonfiction", fetched()).unwrap();
        assert_eq!(upsert_book(&conn, &other_list).unwrap(), UpsertOutcome::Created);

        let page = books_in_list(&conn, "fiction", None, Pagination::default()).unwrap();
        assert_eq!(page.total, 1);
        assert_eq!(page.rows[0].rank, 1);
        assert_eq!(page.rows[0].title, "New");
        assert_eq!(page.rows[0].fetched_at, fetched());
    }

    #[test]
    fn update_overwrites_optional_fields() {
        let store = CacheStore::in_memory().unwrap();
        let conn = store.conn();
        let mut first = Book::from_raw(&raw("9780000000001", 1, "Old"), "fiction", fetched()).unwrap();
        first.description = Some("Blurb.".into());
        first.image_url = Some("https://img/1.jpg".into());
        upsert_book(&conn, &first).unwrap();

        let mut second = first.clone();
        second.description = None;
        second.image_url = None;
        assert_eq!(upsert_book(&conn, &second).unwrap(), UpsertOutcome::Updated);

        let stored = book(&conn, "9780000000001", None).unwrap().unwrap();
        assert!(stored.description.is_none());
        assert!(stored.image_url.is_none());
    }

    #[test]
    fn blank_isbn_is_skipped() {
        assert!(Book::from_raw(&raw("  ", 1, "Nameless"), "fiction", fetched()).is_none());
    }

    #[test]
    fn top_book_and_more_from_list() {
        let store = CacheStore::in_memory().unwrap();
        let conn = store.conn();
        seed(
            &conn,
            "fiction",
            &[("b3", 3, "Three"), ("b1", 1, "One"), ("b2", 2, "Two"), ("b5", 5, "Five"), ("b4", 4, "Four")],
        );

        let top = top_book(&conn, "fiction", None).unwrap().unwrap();
        assert_eq!(top.isbn13, "b1");

        let more = list_excluding(&conn, "b1", "fiction", None, MORE_FROM_LIST_LIMIT).unwrap();
        let isbns: Vec<_> = more.iter().map(|b| b.isbn13.as_str()).collect();
        assert_eq!(isbns, vec!["b2", "b3", "b4"]);

        assert!(top_book(&conn, "poetry", None).unwrap().is_none());
    }

    #[test]
    fn search_returns_one_row_per_isbn() {
        let store = CacheStore::in_memory().unwrap();
        let conn = store.conn();
        seed(&conn, "fiction", &[("b1", 2, "The Garden Path")]);
        seed(&conn, "paperback", &[("b1", 1, "The Garden Path"), ("b2", 3, "Other")]);

        let hits = search(&conn, "garden", None, 10).unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].list_name, "paperback");
        assert!(book_exists(&conn, "b2").unwrap());
        assert_eq!(book(&conn, "b1", None).unwrap().unwrap().rank, 1);
    }
}

use rusqlite::{params, Connection};
use serde::Serialize;

use crate::books::{self, Book};
use crate::errors::AppResult;
use crate::saved::{ItemKind, SavedFilter};
use crate::store::{Page, Pagination};
use crate::venues::{self, Venue};

/// One entry of the unified feed. Derived from cached rows, never stored.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Suggestion {
    Venue(Venue),
    Book(Book),
}

impl Suggestion {
    pub fn kind(&self) -> ItemKind {
        match self {
            Suggestion::Venue(_) => ItemKind::Venue,
            Suggestion::Book(_) => ItemKind::Book,
        }
    }

    pub fn id(&self) -> &str {
        match self {
            Suggestion::Venue(venue) => &venue.venue_id,
            Suggestion::Book(book) => &book.isbn13,
        }
    }

    pub fn title(&self) -> &str {
        match self {
            Suggestion::Venue(venue) => &venue.name,
            Suggestion::Book(book) => &book.title,
        }
    }

    pub fn is_favorite(&self) -> bool {
        match self {
            Suggestion::Venue(venue) => venue.is_favorite,
            Suggestion::Book(book) => book.is_favorite,
        }
    }
}

/// The user's saved (or favorite) venues and books, newest first.
pub fn saved_suggestions(
    conn: &Connection,
    user_id: &str,
    filter: SavedFilter,
    pagination: Pagination,
) -> AppResult<Page<Suggestion>> {
    let favorites_only = filter == SavedFilter::FavoritesOnly;
    let total: i64 = conn.query_row(
        "SELECT COUNT(*) FROM saved_items WHERE user_id = ?1 AND (?2 = 0 OR is_favorite = 1)",
        params![user_id, favorites_only],
        |row| row.get(0),
    )?;
    let total = total as usize;
    let pagination = pagination.with_total(total);
    let entries = {
        let mut stmt = conn.prepare(
            "SELECT item_kind, item_id FROM saved_items
            WHERE user_id = ?1 AND (?2 = 0 OR is_favorite = 1)
            ORDER BY saved_at DESC, item_kind ASC, item_id ASC
            LIMIT ?3 OFFSET ?4",
        )?;
        let rows = stmt
            .query_map(
                params![user_id, favorites_only, pagination.limit(), pagination.offset()],
                |row| Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?)),
            )?
            .collect::<Result<Vec<_>, _>>()?;
        rows
    };

    let mut suggestions = Vec::with_capacity(entries.len());
    for (kind, item_id) in entries {
        let suggestion = match kind.as_str() {
            "venue" => venues::venue(conn, &item_id, Some(user_id))?.map(Suggestion::Venue),
            _ => books::book(conn, &item_id, Some(user_id))?.map(Suggestion::Book),
        };
        suggestions.extend(suggestion);
    }
    Ok(Page::new(suggestions, total, pagination))
}

/// Cached venues then books matching `query`. A blank query matches nothing.
pub fn search(
    conn: &Connection,
    query: &str,
    user_id: Option<&str>,
    limit: usize,
) -> AppResult<Vec<Suggestion>> {
    if query.trim().is_empty() || limit == 0 {
        return Ok(Vec::new());
    }
    let mut results: Vec<Suggestion> = venues::search(conn, query, user_id, limit)?
        .into_iter()
        .map(Suggestion::Venue)
        .collect();
    let remaining = limit.saturating_sub(results.len());
    if remaining > 0 {
        results.extend(
            books::search(conn, query, user_id, remaining)?
                .into_iter()
                .map(Suggestion::Book),
        );
    }
    Ok(results)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geo::Position;
    use crate::profile::save_user;
    use crate::providers::{RawBook, RawCategoryRef, RawVenue};
    use crate::saved;
    use crate::store::CacheStore;
    use crate::venues::{enrich, upsert_venue, RecommendedFlag};
    use chrono::{Duration, TimeZone, Utc};

    fn seeded() -> CacheStore {
        let store = CacheStore::in_memory().unwrap();
        let now = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        {
            let conn = store.conn();
            save_user(&conn, "u1", "Ada", None, now).unwrap();
            let raw = RawVenue {
                id: "v1".into(),
                name: "Garden Cafe".into(),
                lat: 0.0,
                lng: 0.0,
                address: None,
                postal_code: None,
                categories: vec![RawCategoryRef {
                    id: "coffee".into(),
                    name: "Coffee".into(),
                }],
                details: None,
            };
            let venue = enrich(&raw, &Position::new(0.0, 0.0)).unwrap();
            upsert_venue(&conn, &venue, RecommendedFlag::Preserve, now).unwrap();
            let book = Book::from_raw(
                &RawBook {
                    isbn13: "9780000000003".into(),
                    rank: 2,
                    title: "The Secret Garden".into(),
                    author: Some("F. H. Burnett".into()),
                    description: None,
                    image_url: None,
                },
                "classics",
                now,
            )
            .unwrap();
            books::upsert_book(&conn, &book).unwrap();

            saved::save(&conn, Some("u1"), ItemKind::Venue, "v1", now).unwrap();
            saved::set_favorite(
                &conn,
                Some("u1"),
                ItemKind::Book,
                "9780000000003",
                true,
                now + Duration::minutes(5),
            )
            .unwrap();
        }
        store
    }

    #[test]
    fn saved_feed_mixes_kinds_newest_first() {
        let store = seeded();
        let conn = store.conn();
        let page = saved_suggestions(&conn, "u1", SavedFilter::All, Pagination::default()).unwrap();
        assert_eq!(page.total, 2);
        let kinds: Vec<_> = page.rows.iter().map(Suggestion::kind).collect();
        assert_eq!(kinds, vec![ItemKind::Book, ItemKind::Venue]);
        assert!(page.rows[0].is_favorite());

        let favorites =
            saved_suggestions(&conn, "u1", SavedFilter::FavoritesOnly, Pagination::default())
                .unwrap();
        assert_eq!(favorites.total, 1);
        assert_eq!(favorites.rows[0].id(), "9780000000003");
    }

    #[test]
    fn search_spans_venues_and_books() {
        let store = seeded();
        let conn = store.conn();
        let hits = search(&conn, "garden", Some("u1"), 10).unwrap();
        let titles: Vec<_> = hits.iter().map(Suggestion::title).collect();
        assert_eq!(titles, vec!["Garden Cafe", "The Secret Garden"]);

        assert!(search(&conn, "   ", None, 10).unwrap().is_empty());
        assert_eq!(search(&conn, "garden", None, 1).unwrap().len(), 1);
    }

    #[test]
    fn suggestions_serialize_with_a_kind_tag() {
        let store = seeded();
        let conn = store.conn();
        let hits = search(&conn, "secret", None, 10).unwrap();
        let json = serde_json::to_value(&hits[0]).unwrap();
        assert_eq!(json["kind"], "book");
        assert_eq!(json["isbn13"], "9780000000003");
    }
}

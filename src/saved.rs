//! Per-user saved and favorite lists.
//!
//! Flags live beside the cache, keyed by user, so a provider refetch of a
//! venue or book never resets them.

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::books;
use crate::errors::{AppError, AppResult};
use crate::profile;
use crate::store::to_millis;
use crate::venues;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemKind {
    Venue,
    Book,
}

impl ItemKind {
    pub fn as_tag(&self) -> &'static str {
        match self {
            ItemKind::Venue => "venue",
            ItemKind::Book => "book",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SavedFilter {
    All,
    FavoritesOnly,
}

pub(crate) fn require_user(user_id: Option<&str>) -> AppResult<&str> {
    user_id.ok_or(AppError::Unauthenticated)
}

fn ensure_target(conn: &Connection, user_id: &str, kind: ItemKind, item_id: &str) -> AppResult<()> {
    if !profile::user_exists(conn, user_id)? {
        return Err(AppError::NotFound(format!("user {user_id}")));
    }
    let cached = match kind {
        ItemKind::Venue => venues::venue_exists(conn, item_id)?,
        ItemKind::Book => books::book_exists(conn, item_id)?,
    };
    if !cached {
        return Err(AppError::NotFound(format!("{} {item_id}", kind.as_tag())));
    }
    Ok(())
}

/// Returns `false` when the item was already saved.
pub fn save(
    conn: &Connection,
    user_id: Option<&str>,
    kind: ItemKind,
    item_id: &str,
    now: DateTime<Utc>,
) -> AppResult<bool> {
    let user_id = require_user(user_id)?;
    ensure_target(conn, user_id, kind, item_id)?;
    let inserted = conn.execute(
        "INSERT INTO saved_items (user_id, item_kind, item_id, is_favorite, saved_at)
        VALUES (?1, ?2, ?3, 0, ?4)
        ON CONFLICT(user_id, item_kind, item_id) DO NOTHING",
        params![user_id, kind.as_tag(), item_id, to_millis(now)],
    )?;
    debug!(target: "saved", user_id, kind = kind.as_tag(), item_id, inserted, "item saved");
    Ok(inserted == 1)
}

/// Favoriting an unsaved item saves it as well.
pub fn set_favorite(
    conn: &Connection,
    user_id: Option<&str>,
    kind: ItemKind,
    item_id: &str,
    favorite: bool,
    now: DateTime<Utc>,
) -> AppResult<bool> {
    let user_id = require_user(user_id)?;
    if !favorite {
        let changed = conn.execute(
            "UPDATE saved_items SET is_favorite = 0
            WHERE user_id = ?1 AND item_kind = ?2 AND item_id = ?3 AND is_favorite = 1",
            params![user_id, kind.as_tag(), item_id],
        )?;
        return Ok(changed == 1);
    }
    ensure_target(conn, user_id, kind, item_id)?;
    let changed = conn.execute(
        "INSERT INTO saved_items (user_id, item_kind, item_id, is_favorite, saved_at)
        VALUES (?1, ?2, ?3, 1, ?4)
        ON CONFLICT(user_id, item_kind, item_id) DO UPDATE SET is_favorite = 1
        WHERE saved_items.is_favorite = 0",
        params![user_id, kind.as_tag(), item_id, to_millis(now)],
    )?;
    debug!(target: "saved", user_id, kind = kind.as_tag(), item_id, "item favorited");
    Ok(changed == 1)
}

pub fn delete(
    conn: &Connection,
    user_id: Option<&str>,
    kind: ItemKind,
    item_id: &str,
) -> AppResult<bool> {
    let user_id = require_user(user_id)?;
    let removed = conn.execute(
        "DELETE FROM saved_items WHERE user_id = ?1 AND item_kind = ?2 AND item_id = ?3",
        params![user_id, kind.as_tag(), item_id],
    )?;
    Ok(removed == 1)
}

/// Item ids for the user, most recently saved first.
pub fn saved_ids(
    conn: &Connection,
    user_id: &str,
    kind: ItemKind,
    filter: SavedFilter,
) -> AppResult<Vec<String>> {
    let favorites_only = filter == SavedFilter::FavoritesOnly;
    let mut stmt = conn.prepare(
        "SELECT item_id FROM saved_items
        WHERE user_id = ?1 AND item_kind = ?2 AND (?3 = 0 OR is_favorite = 1)
        ORDER BY saved_at DESC, item_id ASC",
    )?;
    let ids = stmt
        .query_map(params![user_id, kind.as_tag(), favorites_only], |row| row.get(0))?
        .collect::<Result<Vec<String>, _>>()?;
    Ok(ids)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geo::Position;
    use crate::profile::save_user;
    use crate::providers::{RawBook, RawCategoryRef, RawVenue};
    use crate::store::CacheStore;
    use crate::venues::{enrich, upsert_venue, RecommendedFlag};
    use chrono::TimeZone;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 4, 4, 4, 4, 4).unwrap()
    }

    fn seeded() -> CacheStore {
        let store = CacheStore::in_memory().unwrap();
        {
            let conn = store.conn();
            save_user(&conn, "u1", "Ada", None, now()).unwrap();
            let raw = RawVenue {
                id: "v1".into(),
                name: "Cafe".into(),
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
            upsert_venue(&conn, &venue, RecommendedFlag::Preserve, now()).unwrap();
            let book = books::Book::from_raw(
                &RawBook {
                    isbn13: "9780000000002".into(),
                    rank: 1,
                    title: "Novel".into(),
                    author: None,
                    description: None,
                    image_url: None,
                },
                "fiction",
                now(),
            )
            .unwrap();
            books::upsert_book(&conn, &book).unwrap();
        }
        store
    }

    #[test]
    fn writes_without_a_user_are_rejected() {
        let store = seeded();
        let conn = store.conn();
        let err = save(&conn, None, ItemKind::Venue, "v1", now()).unwrap_err();
        assert!(matches!(err, AppError::Unauthenticated));
        let err = delete(&conn, None, ItemKind::Book, "9780000000002").unwrap_err();
        assert!(matches!(err, AppError::Unauthenticated));
    }

    #[test]
    fn flags_show_up_on_reads_and_survive_upserts() {
        let store = seeded();
        let conn = store.conn();
        assert!(save(&conn, Some("u1"), ItemKind::Venue, "v1", now()).unwrap());
        assert!(!save(&conn, Some("u1"), ItemKind::Venue, "v1", now()).unwrap());
        assert!(set_favorite(&conn, Some("u1"), ItemKind::Venue, "v1", true, now()).unwrap());

        let mut refetched = venues::venue(&conn, "v1", None).unwrap().unwrap();
        refetched.name = "Cafe Renamed".into();
        upsert_venue(&conn, &refetched, RecommendedFlag::Preserve, now()).unwrap();

        let seen = venues::venue(&conn, "v1", Some("u1")).unwrap().unwrap();
        assert!(seen.is_saved);
        assert!(seen.is_favorite);
        let anonymous = venues::venue(&conn, "v1", None).unwrap().unwrap();
        assert!(!anonymous.is_saved);
    }

    #[test]
    fn favorite_saves_and_unfavorite_keeps_saved() {
        let store = seeded();
        let conn = store.conn();
        assert!(set_favorite(&conn, Some("u1"), ItemKind::Book, "9780000000002", true, now()).unwrap());
        assert_eq!(
            saved_ids(&conn, "u1", ItemKind::Book, SavedFilter::FavoritesOnly).unwrap(),
            vec!["9780000000002"]
        );

        assert!(set_favorite(&conn, Some("u1"), ItemKind::Book, "9780000000002", false, now()).unwrap());
        assert!(saved_ids(&conn, "u1", ItemKind::Book, SavedFilter::FavoritesOnly)
            .unwrap()
            .is_empty());
        assert_eq!(
            saved_ids(&conn, "u1", ItemKind::Book, SavedFilter::All).unwrap().len(),
            1
        );

        assert!(delete(&conn, Some("u1"), ItemKind::Book, "9780000000002").unwrap());
        assert!(saved_ids(&conn, "u1", ItemKind::Book, SavedFilter::All)
            .unwrap()
            .is_empty());
    }

    #[test]
    fn unknown_items_are_not_found() {
        let store = seeded();
        let conn = store.conn();
        let err = save(&conn, Some("u1"), ItemKind::Venue, "missing", now()).unwrap_err();
        assert!(matches!(err, AppError::NotFound(_)));
    }
}

//! Directed "similar to" edges between cached venues.
//!
//! Edges are appended unconditionally. The graph is read as a set of pairs,
//! so a repeated fetch that re-records an edge changes nothing observable.

use chrono::{DateTime, Utc};
use rusqlite::{named_params, params, Connection};
use serde::Serialize;
use tracing::trace;

use crate::errors::AppResult;
use crate::store::to_millis;
use crate::venues::{parse_venue, Venue};

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct SimilarityEdge {
    pub owner_id: String,
    pub sibling_id: String,
}

/// The sibling must already be cached; callers upsert it first.
pub fn record_similar(
    conn: &Connection,
    owner_id: &str,
    sibling_id: &str,
    now: DateTime<Utc>,
) -> AppResult<()> {
    conn.execute(
        "INSERT INTO similar_venues (owner_id, sibling_id, created_at) VALUES (?1, ?2, ?3)",
        params![owner_id, sibling_id, to_millis(now)],
    )?;
    trace!(target: "upsert", owner_id, sibling_id, "similarity edge recorded");
    Ok(())
}

/// Distinct `(owner, sibling)` pairs for `owner_id` in first-seen order.
pub fn edges(conn: &Connection, owner_id: &str) -> AppResult<Vec<SimilarityEdge>> {
    let mut stmt = conn.prepare(
        "SELECT owner_id, sibling_id FROM similar_venues
        WHERE owner_id = ?1
        GROUP BY owner_id, sibling_id
        ORDER BY MIN(id) ASC",
    )?;
    let rows = stmt
        .query_map([owner_id], |row| {
            Ok(SimilarityEdge {
                owner_id: row.get(0)?,
                sibling_id: row.get(1)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

/// Cached siblings of `owner_id`, nearest first.
pub fn similar_venues(
    conn: &Connection,
    owner_id: &str,
    user_id: Option<&str>,
) -> AppResult<Vec<Venue>> {
    let mut stmt = conn.prepare(
        "SELECT v.venue_id, v.name, v.lat, v.lng, v.address, v.postal_code,
            v.category_id, c.name, v.distance_meters, v.is_recommended,
            s.item_id IS NOT NULL, COALESCE(s.is_favorite, 0), v.details_json
        FROM venues v
        LEFT JOIN categories c ON c.category_id = v.category_id
        LEFT JOIN saved_items s
            ON s.item_kind = 'venue' AND s.item_id = v.venue_id AND s.user_id = :user
        WHERE v.venue_id IN (SELECT sibling_id FROM similar_venues WHERE owner_id = :owner)
        ORDER BY v.distance_meters ASC, v.venue_id ASC",
    )?;
    let rows = stmt
        .query_map(
            named_params! { ":user": user_id, ":owner": owner_id },
            parse_venue,
        )?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

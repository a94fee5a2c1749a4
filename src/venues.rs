//! Venue cache writes and reads.
//!
//! Writes go through [`upsert_venue`]: insert first, and when the id is
//! already cached fall back to updating the mutable fields. Concurrent
//! fetches that surface the same venue therefore converge without locking;
//! the last writer wins.

use chrono::{DateTime, Utc};
use rusqlite::{named_params, params, Connection, OptionalExtension, Row};
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, trace, warn};

use crate::categories;
use crate::errors::AppResult;
use crate::geo::{distance_meters, Position};
use crate::providers::{RawCategoryRef, RawVenue};
use crate::store::{to_millis, Page, Pagination};

/// How a venue's canonical category is chosen from the provider's list.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CategoryPolicy {
    /// The first listed category wins; the rest are dropped.
    FirstListed,
}

pub const CANONICAL_CATEGORY_POLICY: CategoryPolicy = CategoryPolicy::FirstListed;

impl CategoryPolicy {
    pub fn pick<'a>(&self, categories: &'a [RawCategoryRef]) -> Option<&'a RawCategoryRef> {
        match self {
            CategoryPolicy::FirstListed => categories.first(),
        }
    }
}

/// What an upsert does with `is_recommended`.
///
/// The generic update path never writes the flag, so a plain fetch cannot
/// demote a recommended venue. A recommended fetch inserts with the flag
/// set and, when the venue already exists, flips it explicitly.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecommendedFlag {
    Preserve,
    Promote,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum UpsertOutcome {
    Created,
    Updated,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct UpsertStats {
    pub created: usize,
    pub updated: usize,
    pub skipped: usize,
}

impl UpsertStats {
    pub fn record(&mut self, outcome: UpsertOutcome) {
        match outcome {
            UpsertOutcome::Created => self.created += 1,
            UpsertOutcome::Updated => self.updated += 1,
        }
    }

    pub fn written(&self) -> usize {
        self.created + self.updated
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Venue {
    pub venue_id: String,
    pub name: String,
    pub lat: f64,
    pub lng: f64,
    pub address: Option<String>,
    pub postal_code: Option<String>,
    pub category_id: String,
    pub category_name: Option<String>,
    pub distance_meters: f64,
    pub is_recommended: bool,
    pub is_favorite: bool,
    pub is_saved: bool,
    pub details: Option<Value>,
}

impl Venue {
    pub fn position(&self) -> Position {
        Position::new(self.lat, self.lng)
    }
}

/// Canonical category and distance from `user`. Returns `None` for a raw
/// venue that lists no categories; such venues are never cached.
pub fn enrich(raw: &RawVenue, user: &Position) -> Option<Venue> {
    let Some(category) = CANONICAL_CATEGORY_POLICY.pick(&raw.categories) else {
        warn!(
            target: "upsert",
            venue_id = %raw.id,
            "venue lists no categories; skipping"
        );
        return None;
    };
    let position = Position::new(raw.lat, raw.lng);
    Some(Venue {
        venue_id: raw.id.clone(),
        name: raw.name.clone(),
        lat: raw.lat,
        lng: raw.lng,
        address: raw.address.clone(),
        postal_code: raw.postal_code.clone(),
        category_id: category.id.clone(),
        category_name: Some(category.name.clone()),
        distance_meters: distance_meters(&position, user),
        is_recommended: false,
        is_favorite: false,
        is_saved: false,
        details: raw.details.clone(),
    })
}

/// Once the category table is populated, a venue may only reference a
/// listed category. Before that any category is accepted.
pub fn has_known_category(conn: &Connection, venue: &Venue) -> AppResult<bool> {
    if categories::is_category_table_empty(conn)? {
        return Ok(true);
    }
    let known = categories::category(conn, &venue.category_id)?.is_some();
    if !known {
        warn!(
            target: "upsert",
            venue_id = %venue.venue_id,
            category_id = %venue.category_id,
            "venue category is not in the category table; skipping"
        );
    }
    Ok(known)
}

pub fn upsert_venue(
    conn: &Connection,
    venue: &Venue,
    flag: RecommendedFlag,
    now: DateTime<Utc>,
) -> AppResult<UpsertOutcome> {
    let now = to_millis(now);
    let inserted = conn.execute(
        "INSERT INTO venues (venue_id, name, lat, lng, address, postal_code, category_id,
            distance_meters, is_recommended, details_json, created_at, updated_at)
        VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?11)
        ON CONFLICT(venue_id) DO NOTHING",
        params![
            venue.venue_id,
            venue.name,
            venue.lat,
            venue.lng,
            venue.address,
            venue.postal_code,
            venue.category_id,
            venue.distance_meters,
            flag == RecommendedFlag::Promote,
            venue.details.as_ref().map(Value::to_string),
            now,
        ],
    )?;
    if inserted == 1 {
        trace!(target: "upsert", venue_id = %venue.venue_id, "venue created");
        return Ok(UpsertOutcome::Created);
    }

    conn.execute(
        "UPDATE venues SET
            name = ?2,
            lat = ?3,
            lng = ?4,
            address = ?5,
            postal_code = ?6,
            category_id = ?7,
            distance_meters = ?8,
            updated_at = ?9
        WHERE venue_id = ?1",
        params![
            venue.venue_id,
            venue.name,
            venue.lat,
            venue.lng,
            venue.address,
            venue.postal_code,
            venue.category_id,
            venue.distance_meters,
            now,
        ],
    )?;
    if flag == RecommendedFlag::Promote {
        conn.execute(
            "UPDATE venues SET is_recommended = 1 WHERE venue_id = ?1",
            [&venue.venue_id],
        )?;
    }
    trace!(
        target: "upsert",
        venue_id = %venue.venue_id,
        ?flag,
        "venue existed; updated in place"
    );
    Ok(UpsertOutcome::Updated)
}

/// Stores a lazily fetched detail blob and the refreshed distance.
pub fn update_details(
    conn: &Connection,
    venue_id: &str,
    details: &Value,
    distance: f64,
    now: DateTime<Utc>,
) -> AppResult<bool> {
    let changed = conn.execute(
        "UPDATE venues SET details_json = ?2, distance_meters = ?3, updated_at = ?4
        WHERE venue_id = ?1",
        params![venue_id, details.to_string(), distance, to_millis(now)],
    )?;
    Ok(changed == 1)
}

/// Recomputes `distance_meters` for every cached venue against `user`.
/// No other column is touched.
pub fn update_distance_for_all(conn: &mut Connection, user: &Position) -> AppResult<usize> {
    let tx = conn.transaction()?;
    let rows = {
        let mut stmt = tx.prepare("SELECT venue_id, lat, lng FROM venues")?;
        let rows = stmt
            .query_map([], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    Position::new(row.get(1)?, row.get(2)?),
                ))
            })?
            .collect::<Result<Vec<_>, _>>()?;
        rows
    };
    {
        let mut update =
            tx.prepare("UPDATE venues SET distance_meters = ?2 WHERE venue_id = ?1")?;
        for (venue_id, position) in &rows {
            update.execute(params![venue_id, distance_meters(position, user)])?;
        }
    }
    tx.commit()?;
    debug!(
        target: "upsert",
        venues = rows.len(),
        lat = user.lat,
        lng = user.lng,
        "venue distances recomputed"
    );
    Ok(rows.len())
}

const VENUE_SELECT: &str = "SELECT v.venue_id, v.name, v.lat, v.lng, v.address, v.postal_code,
        v.category_id, c.name, v.distance_meters, v.is_recommended,
        s.item_id IS NOT NULL, COALESCE(s.is_favorite, 0), v.details_json
    FROM venues v
    LEFT JOIN categories c ON c.category_id = v.category_id
    LEFT JOIN saved_items s
        ON s.item_kind = 'venue' AND s.item_id = v.venue_id AND s.user_id = :user";

/// A venue's category or any category below it, via the closure.
const IN_CATEGORY: &str = "(v.category_id = :category OR v.category_id IN
        (SELECT category_id FROM category_closure WHERE ancestor_id = :category))";

pub fn venue(conn: &Connection, venue_id: &str, user_id: Option<&str>) -> AppResult<Option<Venue>> {
    let found = conn
        .query_row(
            &format!("{VENUE_SELECT} WHERE v.venue_id = :venue"),
            named_params! { ":user": user_id, ":venue": venue_id },
            parse_venue,
        )
        .optional()?;
    Ok(found)
}

pub fn venue_exists(conn: &Connection, venue_id: &str) -> AppResult<bool> {
    let exists = conn.query_row(
        "SELECT EXISTS(SELECT 1 FROM venues WHERE venue_id = ?1)",
        [venue_id],
        |row| row.get(0),
    )?;
    Ok(exists)
}

pub fn venue_count(conn: &Connection) -> AppResult<usize> {
    let count: i64 = conn.query_row("SELECT COUNT(*) FROM venues", [], |row| row.get(0))?;
    Ok(count as usize)
}

/// Venues in `category_id` (subcategories included), nearest first.
pub fn venues_in_category(
    conn: &Connection,
    category_id: &str,
    user_id: Option<&str>,
    pagination: Pagination,
) -> AppResult<Page<Venue>> {
    let total: i64 = conn.query_row(
        &format!("SELECT COUNT(*) FROM venues v WHERE {IN_CATEGORY}"),
        named_params! { ":category": category_id },
        |row| row.get(0),
    )?;
    let total = total as usize;
    let pagination = pagination.with_total(total);
    let mut stmt = conn.prepare(&format!(
        "{VENUE_SELECT} WHERE {IN_CATEGORY}
        ORDER BY v.distance_meters ASC, v.venue_id ASC
        LIMIT :limit OFFSET :offset"
    ))?;
    let rows = stmt
        .query_map(
            named_params! {
                ":user": user_id,
                ":category": category_id,
                ":limit": pagination.limit(),
                ":offset": pagination.offset(),
            },
            parse_venue,
        )?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(Page::new(rows, total, pagination))
}

/// Venues in `category_id` within `radius` meters of the user, nearest first.
pub fn nearby_in_category(
    conn: &Connection,
    category_id: &str,
    radius: f64,
    user_id: Option<&str>,
    limit: usize,
) -> AppResult<Vec<Venue>> {
    let mut stmt = conn.prepare(&format!(
        "{VENUE_SELECT} WHERE {IN_CATEGORY} AND v.distance_meters <= :radius
        ORDER BY v.distance_meters ASC, v.venue_id ASC
        LIMIT :limit"
    ))?;
    let rows = stmt
        .query_map(
            named_params! {
                ":user": user_id,
                ":category": category_id,
                ":radius": radius,
                ":limit": limit as i64,
            },
            parse_venue,
        )?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

pub fn recommended_nearby(
    conn: &Connection,
    radius: f64,
    user_id: Option<&str>,
    limit: usize,
) -> AppResult<Vec<Venue>> {
    let mut stmt = conn.prepare(&format!(
        "{VENUE_SELECT} WHERE v.is_recommended = 1 AND v.distance_meters <= :radius
        ORDER BY v.distance_meters ASC, v.venue_id ASC
        LIMIT :limit"
    ))?;
    let rows = stmt
        .query_map(
            named_params! { ":user": user_id, ":radius": radius, ":limit": limit as i64 },
            parse_venue,
        )?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

pub fn recommended_venues(
    conn: &Connection,
    user_id: Option<&str>,
    pagination: Pagination,
) -> AppResult<Page<Venue>> {
    let total: i64 = conn.query_row(
        "SELECT COUNT(*) FROM venues WHERE is_recommended = 1",
        [],
        |row| row.get(0),
    )?;
    let total = total as usize;
    let pagination = pagination.with_total(total);
    let mut stmt = conn.prepare(&format!(
        "{VENUE_SELECT} WHERE v.is_recommended = 1
        ORDER BY v.distance_meters ASC, v.venue_id ASC
        LIMIT :limit OFFSET :offset"
    ))?;
    let rows = stmt
        .query_map(
            named_params! {
                ":user": user_id,
                ":limit": pagination.limit(),
                ":offset": pagination.offset(),
            },
            parse_venue,
        )?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(Page::new(rows, total, pagination))
}

/// Venues whose name, address or category name contains `needle`.
pub fn search(
    conn: &Connection,
    needle: &str,
    user_id: Option<&str>,
    limit: usize,
) -> AppResult<Vec<Venue>> {
    let pattern = format!("%{}%", escape_like(needle.trim()));
    let mut stmt = conn.prepare(&format!(
        "{VENUE_SELECT}
        WHERE v.name LIKE :pattern ESCAPE '\\'
            OR v.address LIKE :pattern ESCAPE '\\'
            OR c.name LIKE :pattern ESCAPE '\\'
        ORDER BY v.distance_meters ASC, v.venue_id ASC
        LIMIT :limit"
    ))?;
    let rows = stmt
        .query_map(
            named_params! { ":user": user_id, ":pattern": pattern, ":limit": limit as i64 },
            parse_venue,
        )?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

pub(crate) fn select_by_ids(
    conn: &Connection,
    ids: &[String],
    user_id: Option<&str>,
) -> AppResult<Vec<Venue>> {
    let mut venues = Vec::with_capacity(ids.len());
    for id in ids {
        if let Some(found) = venue(conn, id, user_id)? {
            venues.push(found);
        }
    }
    Ok(venues)
}

pub(crate) fn escape_like(input: &str) -> String {
    input
        .replace('\\', "\\\\")
        .replace('%', "\\%")
        .replace('_', "\\_")
}

pub(crate) fn parse_venue(row: &Row<'_>) -> rusqlite::Result<Venue> {
    let details: Option<String> = row.get(12)?;
    Ok(Venue {
        venue_id: row.get(0)?,
        name: row.get(1)?,
        lat: row.get(2)?,
        lng: row.get(3)?,
        address: row.get(4)?,
        postal_code: row.get(5)?,
        category_id: row.get(6)?,
        category_name: row.get(7)?,
        distance_meters: row.get(8)?,
        is_recommended: row.get(9)?,
        is_saved: row.get(10)?,
        is_favorite: row.get(11)?,
        details: details.and_then(|text| serde_json::from_str(&text).ok()),
    })
}

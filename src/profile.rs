use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use serde::Serialize;
use tracing::{debug, info};

use crate::errors::{AppError, AppResult};
use crate::geo::Position;
use crate::store::{from_millis, to_millis};
use crate::venues::UpsertOutcome;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UserProfile {
    pub user_id: String,
    pub display_name: String,
    pub email: Option<String>,
    pub location: Option<Position>,
    pub location_updated_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct UserLocation {
    pub position: Position,
    pub updated_at: DateTime<Utc>,
}

/// Creates the profile, or refreshes name and email when it exists.
/// The stored location is left alone.
pub fn save_user(
    conn: &Connection,
    user_id: &str,
    display_name: &str,
    email: Option<&str>,
    now: DateTime<Utc>,
) -> AppResult<UpsertOutcome> {
    let inserted = conn.execute(
        "INSERT INTO users (user_id, display_name, email, created_at) VALUES (?1, ?2, ?3, ?4)
        ON CONFLICT(user_id) DO NOTHING",
        params![user_id, display_name, email, to_millis(now)],
    )?;
    if inserted == 1 {
        info!(target: "profile", user_id, "user profile created");
        return Ok(UpsertOutcome::Created);
    }
    conn.execute(
        "UPDATE users SET display_name = ?2, email = COALESCE(?3, email) WHERE user_id = ?1",
        params![user_id, display_name, email],
    )?;
    Ok(UpsertOutcome::Updated)
}

pub fn user(conn: &Connection, user_id: &str) -> AppResult<Option<UserProfile>> {
    let profile = conn
        .query_row(
            "SELECT user_id, display_name, email, lat, lng, location_updated_at, created_at
            FROM users WHERE user_id = ?1",
            [user_id],
            |row| {
                let lat: Option<f64> = row.get(3)?;
                let lng: Option<f64> = row.get(4)?;
                let updated: Option<i64> = row.get(5)?;
                Ok(UserProfile {
                    user_id: row.get(0)?,
                    display_name: row.get(1)?,
                    email: row.get(2)?,
                    location: lat.zip(lng).map(|(lat, lng)| Position::new(lat, lng)),
                    location_updated_at: updated.map(from_millis),
                    created_at: from_millis(row.get(6)?),
                })
            },
        )
        .optional()?;
    Ok(profile)
}

pub fn user_exists(conn: &Connection, user_id: &str) -> AppResult<bool> {
    let exists = conn.query_row(
        "SELECT EXISTS(SELECT 1 FROM users WHERE user_id = ?1)",
        [user_id],
        |row| row.get(0),
    )?;
    Ok(exists)
}

/// Removes the profile and, through the cascade, its saved items.
pub fn delete_user(conn: &Connection, user_id: &str) -> AppResult<bool> {
    let removed = conn.execute("DELETE FROM users WHERE user_id = ?1", [user_id])?;
    if removed == 1 {
        info!(target: "profile", user_id, "user profile deleted");
    }
    Ok(removed == 1)
}

pub fn update_location(
    conn: &Connection,
    user_id: &str,
    position: &Position,
    now: DateTime<Utc>,
) -> AppResult<()> {
    let changed = conn.execute(
        "UPDATE users SET lat = ?2, lng = ?3, location_updated_at = ?4 WHERE user_id = ?1",
        params![user_id, position.lat, position.lng, to_millis(now)],
    )?;
    if changed == 0 {
        return Err(AppError::NotFound(format!("user {user_id}")));
    }
    debug!(target: "profile", user_id, lat = position.lat, lng = position.lng, "user location stored");
    Ok(())
}

pub fn location(conn: &Connection, user_id: &str) -> AppResult<Option<UserLocation>> {
    let row: Option<(Option<f64>, Option<f64>, Option<i64>)> = conn
        .query_row(
            "SELECT lat, lng, location_updated_at FROM users WHERE user_id = ?1",
            [user_id],
            |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
        )
        .optional()?;
    let Some((Some(lat), Some(lng), Some(updated))) = row else {
        return Ok(None);
    };
    Ok(Some(UserLocation {
        position: Position::new(lat, lng),
        updated_at: from_millis(updated),
    }))
}

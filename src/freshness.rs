//! Freshness decisions for cached query results.
//!
//! Every provider-backed read is keyed by a [`QuerySignature`]. A signature
//! with no record has never been fetched; a record is fresh while
//! `now - last_fetched_at < ttl` for the signature's [`QueryClass`].
//! Nothing here talks to a provider.

use std::fmt;
use std::sync::Arc;

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::{DateTime, Duration, Utc};
use rusqlite::{params, OptionalExtension};
use serde::Serialize;
use sha2::{Digest, Sha256};
use tracing::{debug, trace};

use crate::clock::Clock;
use crate::config::AppConfig;
use crate::errors::AppResult;
use crate::geo::Position;
use crate::store::{from_millis, to_millis, CacheStore};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum QueryClass {
    Categories,
    NearbyVenues,
    RecommendedVenues,
    VenueSearch,
    VenueDetails,
    SimilarVenues,
    Bestsellers,
}

impl QueryClass {
    pub fn as_tag(&self) -> &'static str {
        match self {
            QueryClass::Categories => "categories",
            QueryClass::NearbyVenues => "nearby",
            QueryClass::RecommendedVenues => "recommended",
            QueryClass::VenueSearch => "search",
            QueryClass::VenueDetails => "details",
            QueryClass::SimilarVenues => "similar",
            QueryClass::Bestsellers => "books",
        }
    }
}

/// Stable key for a class of fetch request.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct QuerySignature {
    class: QueryClass,
    key: String,
}

impl QuerySignature {
    pub fn categories() -> Self {
        Self {
            class: QueryClass::Categories,
            key: "all".into(),
        }
    }

    pub fn nearby(category_id: &str, position: &Position, cell_degrees: f64) -> Self {
        Self {
            class: QueryClass::NearbyVenues,
            key: format!("{category_id}:{}", position.geocell(cell_degrees)),
        }
    }

    pub fn recommended(position: &Position, cell_degrees: f64) -> Self {
        Self {
            class: QueryClass::RecommendedVenues,
            key: position.geocell(cell_degrees),
        }
    }

    /// Free-text queries are digested so the key length stays bounded.
    pub fn search(query: &str, position: &Position, cell_degrees: f64) -> Self {
        let normalized = query
            .split_whitespace()
            .collect::<Vec<_>>()
            .join(" ")
            .to_lowercase();
        let digest = Sha256::digest(normalized.as_bytes());
        let encoded = URL_SAFE_NO_PAD.encode(&digest[..12]);
        Self {
            class: QueryClass::VenueSearch,
            key: format!("{encoded}:{}", position.geocell(cell_degrees)),
        }
    }

    pub fn venue_details(venue_id: &str) -> Self {
        Self {
            class: QueryClass::VenueDetails,
            key: venue_id.into(),
        }
    }

    pub fn similar(venue_id: &str) -> Self {
        Self {
            class: QueryClass::SimilarVenues,
            key: venue_id.into(),
        }
    }

    pub fn bestsellers(list_name: &str) -> Self {
        Self {
            class: QueryClass::Bestsellers,
            key: list_name.trim().to_lowercase(),
        }
    }

    pub fn class(&self) -> QueryClass {
        self.class
    }

    pub fn as_key(&self) -> String {
        format!("{}:{}", self.class.as_tag(), self.key)
    }
}

impl fmt::Display for QuerySignature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.class.as_tag(), self.key)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ttl {
    /// Fresh until explicitly invalidated.
    Forever,
    Window(Duration),
}

#[derive(Debug, Clone)]
pub struct TtlPolicy {
    pub venues: Ttl,
    pub details: Ttl,
    pub bestsellers: Ttl,
}

impl TtlPolicy {
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            venues: Ttl::Window(minutes(config.venue_ttl_minutes)),
            details: Ttl::Window(minutes(config.detail_ttl_minutes)),
            bestsellers: Ttl::Window(minutes(config.bestseller_ttl_minutes)),
        }
    }

    pub fn ttl_for(&self, class: QueryClass) -> Ttl {
        match class {
            QueryClass::Categories => Ttl::Forever,
            QueryClass::NearbyVenues | QueryClass::RecommendedVenues | QueryClass::VenueSearch => {
                self.venues
            }
            QueryClass::VenueDetails | QueryClass::SimilarVenues => self.details,
            QueryClass::Bestsellers => self.bestsellers,
        }
    }
}

/// One hundred years; anything longer is treated as this.
const MAX_TTL_MINUTES: u64 = 100 * 365 * 24 * 60;

fn minutes(value: u64) -> Duration {
    Duration::minutes(value.min(MAX_TTL_MINUTES) as i64)
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FreshnessRecord {
    pub signature: String,
    pub last_fetched_at: DateTime<Utc>,
}

#[derive(Clone)]
pub struct FreshnessController {
    store: CacheStore,
    policy: TtlPolicy,
    clock: Arc<dyn Clock>,
}

impl FreshnessController {
    pub fn new(store: CacheStore, policy: TtlPolicy, clock: Arc<dyn Clock>) -> Self {
        Self {
            store,
            policy,
            clock,
        }
    }

    pub fn is_fresh(&self, signature: &QuerySignature) -> AppResult<bool> {
        let Some(record) = self.record(signature)? else {
            trace!(target: "freshness", %signature, "no record");
            return Ok(false);
        };
        let fresh = match self.policy.ttl_for(signature.class()) {
            Ttl::Forever => true,
            Ttl::Window(ttl) => self.clock.now() - record.last_fetched_at < ttl,
        };
        debug!(
            target: "freshness",
            %signature,
            fresh,
            last_fetched_at = %record.last_fetched_at,
            "freshness evaluated"
        );
        Ok(fresh)
    }

    pub fn mark_fetched(&self, signature: &QuerySignature) -> AppResult<()> {
        let now = to_millis(self.clock.now());
        let conn = self.store.conn();
        conn.execute(
            "INSERT INTO freshness (signature, last_fetched_at) VALUES (?1, ?2)
            ON CONFLICT(signature) DO UPDATE SET last_fetched_at = excluded.last_fetched_at",
            params![signature.as_key(), now],
        )?;
        Ok(())
    }

    /// Drops the record so the next access refetches.
    pub fn invalidate(&self, signature: &QuerySignature) -> AppResult<()> {
        let conn = self.store.conn();
        conn.execute(
            "DELETE FROM freshness WHERE signature = ?1",
            [signature.as_key()],
        )?;
        Ok(())
    }

    pub fn record(&self, signature: &QuerySignature) -> AppResult<Option<FreshnessRecord>> {
        let conn = self.store.conn();
        let record = conn
            .query_row(
                "SELECT signature, last_fetched_at FROM freshness WHERE signature = ?1",
                [signature.as_key()],
                |row| {
                    Ok(FreshnessRecord {
                        signature: row.get(0)?,
                        last_fetched_at: from_millis(row.get(1)?),
                    })
                },
            )
            .optional()?;
        Ok(record)
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use chrono::TimeZone;

    fn controller(clock: ManualClock) -> FreshnessController {
        let store = CacheStore::in_memory().unwrap();
        let policy = TtlPolicy {
            venues: Ttl::Window(Duration::hours(6)),
            details: Ttl::Window(Duration::hours(24)),
            bestsellers: Ttl::Window(Duration::hours(24)),
        };
        FreshnessController::new(store, policy, Arc::new(clock))
    }

    fn start() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap()
    }

    #[test]
    fn missing_record_is_not_fresh() {
        let freshness = controller(ManualClock::new(start()));
        let sig = QuerySignature::bestsellers("hardcover-fiction");
        assert!(!freshness.is_fresh(&sig).unwrap());
    }

    #[test]
    fn fresh_until_ttl_elapses() {
        let clock = ManualClock::new(start());
        let freshness = controller(clock.clone());
        let sig = QuerySignature::nearby("cat", &Position::new(40.0, -73.0), 0.01);

        freshness.mark_fetched(&sig).unwrap();
        assert!(freshness.is_fresh(&sig).unwrap());

        clock.advance(Duration::hours(6) - Duration::milliseconds(1));
        assert!(freshness.is_fresh(&sig).unwrap());

        clock.advance(Duration::milliseconds(1));
        assert!(!freshness.is_fresh(&sig).unwrap());
    }

    #[test]
    fn refetch_restarts_the_window() {
        let clock = ManualClock::new(start());
        let freshness = controller(clock.clone());
        let sig = QuerySignature::bestsellers("Hardcover-Fiction ");

        freshness.mark_fetched(&sig).unwrap();
        clock.advance(Duration::hours(25));
        assert!(!freshness.is_fresh(&sig).unwrap());

        freshness.mark_fetched(&sig).unwrap();
        assert!(freshness.is_fresh(&sig).unwrap());
        let record = freshness.record(&sig).unwrap().unwrap();
        assert_eq!(record.last_fetched_at, start() + Duration::hours(25));
        assert_eq!(record.signature, "books:hardcover-fiction");
    }

    #[test]
    fn category_table_stays_fresh_until_invalidated() {
        let clock = ManualClock::new(start());
        let freshness = controller(clock.clone());
        let sig = QuerySignature::categories();

        freshness.mark_fetched(&sig).unwrap();
        clock.advance(Duration::days(3650));
        assert!(freshness.is_fresh(&sig).unwrap());

        freshness.invalidate(&sig).unwrap();
        assert!(!freshness.is_fresh(&sig).unwrap());
    }

    #[test]
    fn signatures_separate_cells_and_categories() {
        let here = Position::new(40.0012, -73.0034);
        let there = Position::new(40.0412, -73.0034);
        assert_ne!(
            QuerySignature::nearby("a", &here, 0.01).as_key(),
            QuerySignature::nearby("a", &there, 0.01).as_key()
        );
        assert_ne!(
            QuerySignature::nearby("a", &here, 0.01).as_key(),
            QuerySignature::nearby("b", &here, 0.01).as_key()
        );
        assert_eq!(
            QuerySignature::search("  Coffee   Shop", &here, 0.01).as_key(),
            QuerySignature::search("coffee shop", &here, 0.01).as_key()
        );
    }
}

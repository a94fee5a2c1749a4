//! The discovery service: one explicitly constructed object that decides,
//! per use case, whether to serve the cache or go to a provider.
//!
//! Every provider-backed use case follows the same steps. Compute the query
//! signature, serve the cache while the signature is fresh, otherwise call
//! the provider, enrich and upsert what it returns, and only then mark the
//! signature fetched. A provider failure returns early, so neither the cache
//! nor the freshness record is touched and the next call retries.

use std::future::Future;
use std::sync::Arc;

use futures_util::future::join_all;
use parking_lot::Mutex;
use rusqlite::Connection;
use serde::Serialize;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::books::{self, Book, MORE_FROM_LIST_LIMIT};
use crate::categories::{self, ClosureStats, RelatedCategory};
use crate::clock::Clock;
use crate::config::AppConfig;
use crate::errors::{AppError, AppResult};
use crate::feed::{self, Suggestion};
use crate::freshness::{FreshnessController, QuerySignature, TtlPolicy};
use crate::geo::Position;
use crate::position::DisplacementFilter;
use crate::preferences::{PreferenceStore, Preferences, PreferencesPatch};
use crate::profile::{self, UserProfile};
use crate::providers::{
    AreaQuery, AutocompletePrediction, BestsellerProvider, GeocodingProvider, RawVenue,
    VenueProvider,
};
use crate::saved::{self, ItemKind, SavedFilter};
use crate::session::SessionProvider;
use crate::similarity;
use crate::store::{CacheStore, Page, Pagination, StoreChange};
use crate::venues::{self, RecommendedFlag, UpsertOutcome, UpsertStats, Venue};

/// Provider clients. A missing client makes its use cases fail with
/// [`AppError::Config`].
#[derive(Clone, Default)]
pub struct ProviderSet {
    pub venues: Option<Arc<dyn VenueProvider>>,
    pub geocoding: Option<Arc<dyn GeocodingProvider>>,
    pub bestsellers: Option<Arc<dyn BestsellerProvider>>,
}

#[derive(Debug, Clone)]
pub struct DiscoverySettings {
    pub radius_meters: u32,
    pub geocell_degrees: f64,
    pub result_limit: u32,
    pub min_displacement_meters: f64,
}

impl DiscoverySettings {
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            radius_meters: config.search_radius_meters,
            geocell_degrees: config.geocell_degrees,
            result_limit: config.venue_result_limit,
            min_displacement_meters: config.position_min_displacement_meters,
        }
    }
}

/// Collaborators handed to [`DiscoveryService::new`].
pub struct ServiceDeps {
    pub store: CacheStore,
    pub providers: ProviderSet,
    pub session: Arc<dyn SessionProvider>,
    pub preferences: PreferenceStore,
    pub clock: Arc<dyn Clock>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FetchSource {
    Cache,
    Provider,
}

/// Result of a provider-backed use case.
#[derive(Debug, Clone, Serialize)]
pub struct Fetched<T> {
    pub source: FetchSource,
    pub stats: UpsertStats,
    pub items: T,
}

impl<T> Fetched<T> {
    fn cached(items: T) -> Self {
        Self {
            source: FetchSource::Cache,
            stats: UpsertStats::default(),
            items,
        }
    }

    fn provided(items: T, stats: UpsertStats) -> Self {
        Self {
            source: FetchSource::Provider,
            stats,
            items,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "section", content = "key", rename_all = "snake_case")]
pub enum FeedSection {
    Nearby(String),
    Recommended,
    Bestsellers(String),
}

#[derive(Debug, Clone, Serialize)]
pub struct SectionSummary {
    pub source: FetchSource,
    pub stats: UpsertStats,
    pub items: usize,
}

impl SectionSummary {
    fn of<T>(fetched: &Fetched<Vec<T>>) -> Self {
        Self {
            source: fetched.source,
            stats: fetched.stats,
            items: fetched.items.len(),
        }
    }
}

#[derive(Debug)]
pub struct SectionReport {
    pub section: FeedSection,
    pub outcome: AppResult<SectionSummary>,
}

#[derive(Debug, Default)]
pub struct HomeFeedReport {
    pub sections: Vec<SectionReport>,
}

impl HomeFeedReport {
    pub fn failures(&self) -> usize {
        self.sections
            .iter()
            .filter(|section| section.outcome.is_err())
            .count()
    }
}

#[derive(Clone)]
pub struct DiscoveryService {
    inner: Arc<Inner>,
}

struct Inner {
    store: CacheStore,
    freshness: FreshnessController,
    providers: ProviderSet,
    session: Arc<dyn SessionProvider>,
    preferences: PreferenceStore,
    clock: Arc<dyn Clock>,
    settings: DiscoverySettings,
    displacement: Mutex<DisplacementFilter>,
}

impl DiscoveryService {
    pub fn new(deps: ServiceDeps, config: &AppConfig) -> Self {
        Self::with_settings(deps, TtlPolicy::from_config(config), DiscoverySettings::from_config(config))
    }

    pub fn with_settings(deps: ServiceDeps, policy: TtlPolicy, settings: DiscoverySettings) -> Self {
        let ServiceDeps {
            store,
            providers,
            session,
            preferences,
            clock,
        } = deps;
        let freshness = FreshnessController::new(store.clone(), policy, Arc::clone(&clock));
        let displacement = DisplacementFilter::seeded(
            settings.min_displacement_meters,
            preferences.last_fetched_position(),
        );
        Self {
            inner: Arc::new(Inner {
                store,
                freshness,
                providers,
                session,
                preferences,
                clock,
                settings,
                displacement: Mutex::new(displacement),
            }),
        }
    }

    pub fn store(&self) -> &CacheStore {
        &self.inner.store
    }

    pub fn freshness(&self) -> &FreshnessController {
        &self.inner.freshness
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StoreChange> {
        self.inner.store.subscribe()
    }

    fn user_id(&self) -> Option<String> {
        self.inner.session.current_user_id()
    }

    fn read<T>(&self, query: impl FnOnce(&Connection) -> AppResult<T>) -> AppResult<T> {
        let conn = self.inner.store.conn();
        query(&conn)
    }

    fn venue_provider(&self) -> AppResult<&Arc<dyn VenueProvider>> {
        self.inner
            .providers
            .venues
            .as_ref()
            .ok_or_else(|| AppError::Config("no venue provider configured".into()))
    }

    fn geocoder(&self) -> AppResult<&Arc<dyn GeocodingProvider>> {
        self.inner
            .providers
            .geocoding
            .as_ref()
            .ok_or_else(|| AppError::Config("no geocoding provider configured".into()))
    }

    fn bestseller_provider(&self) -> AppResult<&Arc<dyn BestsellerProvider>> {
        self.inner
            .providers
            .bestsellers
            .as_ref()
            .ok_or_else(|| AppError::Config("no bestseller provider configured".into()))
    }

    fn area(&self, position: Position) -> AreaQuery {
        AreaQuery {
            position,
            radius_meters: self.inner.settings.radius_meters,
            limit: self.inner.settings.result_limit,
        }
    }

    fn limit(&self) -> usize {
        self.inner.settings.result_limit as usize
    }

    /// Awaits a provider call, logging a failure before handing it back.
    async fn call_provider<T>(
        &self,
        signature: &QuerySignature,
        request: impl Future<Output = AppResult<T>>,
    ) -> AppResult<T> {
        debug!(target: "orchestrator", %signature, "signature stale; calling provider");
        request.await.map_err(|err| {
            warn!(target: "orchestrator", %signature, ?err, "provider fetch failed; cache left untouched");
            err
        })
    }

    /// Enriches and upserts a provider batch in one transaction.
    fn store_venues(
        &self,
        raws: &[RawVenue],
        reference: &Position,
        flag: RecommendedFlag,
    ) -> AppResult<(UpsertStats, Vec<String>)> {
        let now = self.inner.clock.now();
        let mut stats = UpsertStats::default();
        let mut ids: Vec<String> = Vec::with_capacity(raws.len());
        {
            let mut conn = self.inner.store.conn();
            let tx = conn.transaction()?;
            for raw in raws {
                let Some(venue) = venues::enrich(raw, reference) else {
                    stats.skipped += 1;
                    continue;
                };
                if !venues::has_known_category(&tx, &venue)? {
                    stats.skipped += 1;
                    continue;
                }
                stats.record(venues::upsert_venue(&tx, &venue, flag, now)?);
                if !ids.contains(&venue.venue_id) {
                    ids.push(venue.venue_id);
                }
            }
            tx.commit()?;
        }
        debug!(
            target: "upsert",
            created = stats.created,
            updated = stats.updated,
            skipped = stats.skipped,
            ?flag,
            "venue batch stored"
        );
        self.inner.store.notify(StoreChange::Venues);
        Ok((stats, ids))
    }

    /// Last accepted user position, then the one saved in preferences,
    /// then `fallback`.
    fn reference_position(&self, fallback: Position) -> Position {
        self.current_position()
            .or_else(|| self.inner.preferences.last_fetched_position())
            .unwrap_or(fallback)
    }

    pub fn current_position(&self) -> Option<Position> {
        self.inner.displacement.lock().last_accepted()
    }

    /// Loads the provider's category tree when the local table is empty.
    /// Returns `None` when the table was already populated.
    pub async fn ensure_category_table(&self) -> AppResult<Option<ClosureStats>> {
        let signature = QuerySignature::categories();
        let empty = self.read(categories::is_category_table_empty)?;
        if !empty {
            return Ok(None);
        }
        let provider = self.venue_provider()?;
        let tree = self.call_provider(&signature, provider.categories()).await?;
        let stats = {
            let mut conn = self.inner.store.conn();
            categories::rebuild(&mut conn, &tree)?
        };
        self.inner.freshness.mark_fetched(&signature)?;
        self.inner.store.notify(StoreChange::Categories);
        info!(
            target: "orchestrator",
            categories = stats.categories,
            edges = stats.edges,
            skipped = stats.skipped,
            "category table loaded"
        );
        Ok(Some(stats))
    }

    pub async fn nearby_venues(
        &self,
        position: Position,
        category_id: &str,
    ) -> AppResult<Fetched<Vec<Venue>>> {
        let user_id = self.user_id();
        let signature =
            QuerySignature::nearby(category_id, &position, self.inner.settings.geocell_degrees);
        if self.inner.freshness.is_fresh(&signature)? {
            let radius = f64::from(self.inner.settings.radius_meters);
            let cached = self.read(|conn| {
                venues::nearby_in_category(conn, category_id, radius, user_id.as_deref(), self.limit())
            })?;
            return Ok(Fetched::cached(cached));
        }

        let area = self.area(position);
        let provider = self.venue_provider()?;
        let raws = self
            .call_provider(&signature, provider.venues_near(&area, category_id))
            .await?;
        let (stats, ids) = self.store_venues(&raws, &position, RecommendedFlag::Preserve)?;
        self.inner.freshness.mark_fetched(&signature)?;
        let fetched = self.read(|conn| venues::select_by_ids(conn, &ids, user_id.as_deref()))?;
        Ok(Fetched::provided(fetched, stats))
    }

    /// Like [`nearby_venues`](Self::nearby_venues) but every stored venue is
    /// promoted to recommended, including ones already cached as plain.
    pub async fn recommended_venues(&self, position: Position) -> AppResult<Fetched<Vec<Venue>>> {
        let user_id = self.user_id();
        let signature = QuerySignature::recommended(&position, self.inner.settings.geocell_degrees);
        if self.inner.freshness.is_fresh(&signature)? {
            let radius = f64::from(self.inner.settings.radius_meters);
            let cached = self.read(|conn| {
                venues::recommended_nearby(conn, radius, user_id.as_deref(), self.limit())
            })?;
            return Ok(Fetched::cached(cached));
        }

        let area = self.area(position);
        let provider = self.venue_provider()?;
        let raws = self
            .call_provider(&signature, provider.recommended_near(&area))
            .await?;
        let (stats, ids) = self.store_venues(&raws, &position, RecommendedFlag::Promote)?;
        self.inner.freshness.mark_fetched(&signature)?;
        let fetched = self.read(|conn| venues::select_by_ids(conn, &ids, user_id.as_deref()))?;
        Ok(Fetched::provided(fetched, stats))
    }

    pub async fn search_venues(
        &self,
        position: Position,
        query: &str,
    ) -> AppResult<Fetched<Vec<Venue>>> {
        let user_id = self.user_id();
        if query.trim().is_empty() {
            return Ok(Fetched::cached(Vec::new()));
        }
        let signature =
            QuerySignature::search(query, &position, self.inner.settings.geocell_degrees);
        if self.inner.freshness.is_fresh(&signature)? {
            let cached =
                self.read(|conn| venues::search(conn, query, user_id.as_deref(), self.limit()))?;
            return Ok(Fetched::cached(cached));
        }

        let area = self.area(position);
        let provider = self.venue_provider()?;
        let raws = self
            .call_provider(&signature, provider.search(&area, query))
            .await?;
        let (stats, ids) = self.store_venues(&raws, &position, RecommendedFlag::Preserve)?;
        self.inner.freshness.mark_fetched(&signature)?;
        let fetched = self.read(|conn| venues::select_by_ids(conn, &ids, user_id.as_deref()))?;
        Ok(Fetched::provided(fetched, stats))
    }

    /// Lazily loads a venue's detail blob. Other flags are left as they are.
    pub async fn venue_details(&self, venue_id: &str) -> AppResult<Fetched<Venue>> {
        let user_id = self.user_id();
        let signature = QuerySignature::venue_details(venue_id);
        if self.inner.freshness.is_fresh(&signature)? {
            if let Some(cached) = self.read(|conn| venues::venue(conn, venue_id, user_id.as_deref()))? {
                return Ok(Fetched::cached(cached));
            }
        }

        let provider = self.venue_provider()?;
        let raw = self
            .call_provider(&signature, provider.venue_details(venue_id))
            .await?;
        let reference = self.reference_position(Position::new(raw.lat, raw.lng));
        let Some(enriched) = venues::enrich(&raw, &reference) else {
            return Err(AppError::NotFound(format!("venue {venue_id} has no category")));
        };
        let now = self.inner.clock.now();
        let outcome = {
            let conn = self.inner.store.conn();
            if !venues::has_known_category(&conn, &enriched)? {
                return Err(AppError::NotFound(format!(
                    "category {} of venue {venue_id}",
                    enriched.category_id
                )));
            }
            let outcome = venues::upsert_venue(&conn, &enriched, RecommendedFlag::Preserve, now)?;
            if let Some(details) = &raw.details {
                venues::update_details(&conn, venue_id, details, enriched.distance_meters, now)?;
            }
            outcome
        };
        self.inner.freshness.mark_fetched(&signature)?;
        self.inner.store.notify(StoreChange::Venues);

        let mut stats = UpsertStats::default();
        stats.record(outcome);
        let stored = self
            .read(|conn| venues::venue(conn, venue_id, user_id.as_deref()))?
            .ok_or_else(|| AppError::NotFound(format!("venue {venue_id}")))?;
        Ok(Fetched::provided(stored, stats))
    }

    /// Fetches venues similar to `owner_id`, caching each sibling before
    /// recording its edge.
    pub async fn similar_venues(&self, owner_id: &str) -> AppResult<Fetched<Vec<Venue>>> {
        let user_id = self.user_id();
        let signature = QuerySignature::similar(owner_id);
        if self.inner.freshness.is_fresh(&signature)? {
            let cached =
                self.read(|conn| similarity::similar_venues(conn, owner_id, user_id.as_deref()))?;
            return Ok(Fetched::cached(cached));
        }

        let provider = self.venue_provider()?;
        let raws = self
            .call_provider(&signature, provider.similar_venues(owner_id))
            .await?;
        let owner_position = self
            .read(|conn| venues::venue(conn, owner_id, None))?
            .map(|owner| owner.position());
        let fallback = owner_position
            .or_else(|| raws.first().map(|raw| Position::new(raw.lat, raw.lng)))
            .unwrap_or(Position::new(0.0, 0.0));
        let reference = self.reference_position(fallback);

        let (stats, sibling_ids) = self.store_venues(&raws, &reference, RecommendedFlag::Preserve)?;
        {
            let now = self.inner.clock.now();
            let mut conn = self.inner.store.conn();
            let tx = conn.transaction()?;
            for sibling_id in &sibling_ids {
                similarity::record_similar(&tx, owner_id, sibling_id, now)?;
            }
            tx.commit()?;
        }
        self.inner.freshness.mark_fetched(&signature)?;
        self.inner.store.notify(StoreChange::Similarity);

        let siblings =
            self.read(|conn| similarity::similar_venues(conn, owner_id, user_id.as_deref()))?;
        Ok(Fetched::provided(siblings, stats))
    }

    pub async fn bestsellers(&self, list_name: &str) -> AppResult<Fetched<Vec<Book>>> {
        let user_id = self.user_id();
        let signature = QuerySignature::bestsellers(list_name);
        let list_key = list_name.trim().to_lowercase();
        let read_list = |conn: &Connection| {
            books::books_in_list(conn, &list_key, user_id.as_deref(), Pagination::default())
                .map(|page| page.rows)
        };
        if self.inner.freshness.is_fresh(&signature)? {
            return Ok(Fetched::cached(self.read(read_list)?));
        }

        let provider = self.bestseller_provider()?;
        let raws = self
            .call_provider(&signature, provider.list(list_name))
            .await?;
        let now = self.inner.clock.now();
        let mut stats = UpsertStats::default();
        {
            let mut conn = self.inner.store.conn();
            let tx = conn.transaction()?;
            for raw in &raws {
                let Some(book) = Book::from_raw(raw, &list_key, now) else {
                    stats.skipped += 1;
                    continue;
                };
                stats.record(books::upsert_book(&tx, &book)?);
            }
            tx.commit()?;
        }
        self.inner.freshness.mark_fetched(&signature)?;
        self.inner.store.notify(StoreChange::Books);
        debug!(
            target: "orchestrator",
            list = %list_key,
            created = stats.created,
            updated = stats.updated,
            skipped = stats.skipped,
            "bestseller list stored"
        );
        Ok(Fetched::provided(self.read(read_list)?, stats))
    }

    /// Runs every home-feed section concurrently. One failing section never
    /// affects the others; each outcome is reported on its own.
    pub async fn refresh_home_feed(
        &self,
        position: Position,
        category_ids: &[String],
        list_names: &[String],
    ) -> HomeFeedReport {
        let nearby = join_all(category_ids.iter().map(|category_id| async move {
            SectionReport {
                section: FeedSection::Nearby(category_id.clone()),
                outcome: self
                    .nearby_venues(position, category_id)
                    .await
                    .map(|fetched| SectionSummary::of(&fetched)),
            }
        }));
        let recommended = async {
            SectionReport {
                section: FeedSection::Recommended,
                outcome: self
                    .recommended_venues(position)
                    .await
                    .map(|fetched| SectionSummary::of(&fetched)),
            }
        };
        let lists = join_all(list_names.iter().map(|list_name| async move {
            SectionReport {
                section: FeedSection::Bestsellers(list_name.clone()),
                outcome: self
                    .bestsellers(list_name)
                    .await
                    .map(|fetched| SectionSummary::of(&fetched)),
            }
        }));

        let (nearby, recommended, lists) = tokio::join!(nearby, recommended, lists);
        let mut sections = nearby;
        sections.push(recommended);
        sections.extend(lists);
        let report = HomeFeedReport { sections };
        info!(
            target: "orchestrator",
            sections = report.sections.len(),
            failures = report.failures(),
            "home feed refreshed"
        );
        report
    }

    /// Never cached.
    pub async fn autocomplete(&self, input: &str) -> AppResult<Vec<AutocompletePrediction>> {
        let near = self.current_position();
        self.geocoder()?.autocomplete(input, near.as_ref()).await
    }

    /// Geocodes `address` and applies it as the user's position. Returns
    /// `false` when the address resolves to nothing.
    pub async fn set_location_from_address(&self, address: &str) -> AppResult<bool> {
        let Some(place) = self.geocoder()?.geocode(address).await? else {
            return Ok(false);
        };
        self.apply_position(place.position)?;
        Ok(true)
    }

    /// Handles a position update. Moves shorter than the configured minimum
    /// are ignored; an accepted one stores the user's location, remembers it
    /// in preferences and recomputes every cached distance.
    pub fn accept_position(&self, position: Position) -> AppResult<bool> {
        if !position.is_valid() {
            return Ok(false);
        }
        if !self.inner.displacement.lock().would_accept(&position) {
            debug!(target: "orchestrator", lat = position.lat, lng = position.lng, "position change below threshold");
            return Ok(false);
        }
        // The filter moves only after every write succeeded.
        let swept = self.persist_position(position)?;
        self.commit_position(position, swept);
        Ok(true)
    }

    fn apply_position(&self, position: Position) -> AppResult<()> {
        let swept = self.persist_position(position)?;
        self.commit_position(position, swept);
        Ok(())
    }

    /// Writes the user location, the distance sweep and the preferences.
    /// Returns the number of venues swept.
    fn persist_position(&self, position: Position) -> AppResult<usize> {
        let now = self.inner.clock.now();
        let swept = {
            let mut conn = self.inner.store.conn();
            if let Some(user_id) = self.user_id() {
                if profile::user_exists(&conn, &user_id)? {
                    profile::update_location(&conn, &user_id, &position, now)?;
                    self.inner.store.notify(StoreChange::Users);
                } else {
                    debug!(target: "orchestrator", %user_id, "no profile yet; location not stored");
                }
            }
            venues::update_distance_for_all(&mut conn, &position)?
        };
        self.inner.preferences.set_last_fetched_position(position)?;
        Ok(swept)
    }

    fn commit_position(&self, position: Position, swept: usize) {
        self.inner.displacement.lock().commit(position);
        self.inner.store.notify(StoreChange::Venues);
        info!(
            target: "orchestrator",
            lat = position.lat,
            lng = position.lng,
            venues = swept,
            "position accepted"
        );
    }

    /// Follows a position source until its sender is dropped. Abort the
    /// handle to stop early. Each update runs on the blocking pool, since the
    /// distance sweep and the preferences write are synchronous.
    pub fn spawn_position_listener(
        &self,
        mut positions: watch::Receiver<Option<Position>>,
    ) -> JoinHandle<()> {
        let service = self.clone();
        tokio::spawn(async move {
            loop {
                let latest = *positions.borrow_and_update();
                if let Some(position) = latest {
                    let worker = service.clone();
                    match tokio::task::spawn_blocking(move || worker.accept_position(position)).await {
                        Ok(Ok(_)) => {}
                        Ok(Err(err)) => {
                            warn!(target: "orchestrator", ?err, "failed to apply position update");
                        }
                        Err(err) => {
                            warn!(target: "orchestrator", ?err, "position update task panicked");
                        }
                    }
                }
                if positions.changed().await.is_err() {
                    debug!(target: "orchestrator", "position source closed");
                    break;
                }
            }
        })
    }

    pub fn venue(&self, venue_id: &str) -> AppResult<Option<Venue>> {
        let user_id = self.user_id();
        self.read(|conn| venues::venue(conn, venue_id, user_id.as_deref()))
    }

    pub fn venues_in_category(&self, category_id: &str, pagination: Pagination) -> AppResult<Page<Venue>> {
        let user_id = self.user_id();
        self.read(|conn| venues::venues_in_category(conn, category_id, user_id.as_deref(), pagination))
    }

    pub fn recommended_page(&self, pagination: Pagination) -> AppResult<Page<Venue>> {
        let user_id = self.user_id();
        self.read(|conn| venues::recommended_venues(conn, user_id.as_deref(), pagination))
    }

    pub fn related_categories(
        &self,
        category_id: &str,
        pagination: Pagination,
    ) -> AppResult<Page<RelatedCategory>> {
        self.read(|conn| categories::related_categories(conn, category_id, pagination))
    }

    pub fn books_in_list(&self, list_name: &str, pagination: Pagination) -> AppResult<Page<Book>> {
        let user_id = self.user_id();
        let list_key = list_name.trim().to_lowercase();
        self.read(|conn| books::books_in_list(conn, &list_key, user_id.as_deref(), pagination))
    }

    pub fn top_book(&self, list_name: &str) -> AppResult<Option<Book>> {
        let user_id = self.user_id();
        let list_key = list_name.trim().to_lowercase();
        self.read(|conn| books::top_book(conn, &list_key, user_id.as_deref()))
    }

    pub fn more_from_list(&self, isbn13: &str, list_name: &str) -> AppResult<Vec<Book>> {
        let user_id = self.user_id();
        let list_key = list_name.trim().to_lowercase();
        self.read(|conn| {
            books::list_excluding(conn, isbn13, &list_key, user_id.as_deref(), MORE_FROM_LIST_LIMIT)
        })
    }

    pub fn search_feed(&self, query: &str) -> AppResult<Vec<Suggestion>> {
        let user_id = self.user_id();
        self.read(|conn| feed::search(conn, query, user_id.as_deref(), self.limit()))
    }

    pub fn saved_feed(&self, filter: SavedFilter, pagination: Pagination) -> AppResult<Page<Suggestion>> {
        let user_id = self.user_id().ok_or(AppError::Unauthenticated)?;
        self.read(|conn| feed::saved_suggestions(conn, &user_id, filter, pagination))
    }

    pub fn save_item(&self, kind: ItemKind, item_id: &str) -> AppResult<bool> {
        let user_id = self.user_id();
        let now = self.inner.clock.now();
        let changed = self.read(|conn| saved::save(conn, user_id.as_deref(), kind, item_id, now))?;
        self.inner.store.notify(StoreChange::Saved);
        Ok(changed)
    }

    pub fn set_favorite(&self, kind: ItemKind, item_id: &str, favorite: bool) -> AppResult<bool> {
        let user_id = self.user_id();
        let now = self.inner.clock.now();
        let changed = self.read(|conn| {
            saved::set_favorite(conn, user_id.as_deref(), kind, item_id, favorite, now)
        })?;
        self.inner.store.notify(StoreChange::Saved);
        Ok(changed)
    }

    pub fn delete_saved(&self, kind: ItemKind, item_id: &str) -> AppResult<bool> {
        let user_id = self.user_id();
        let removed = self.read(|conn| saved::delete(conn, user_id.as_deref(), kind, item_id))?;
        self.inner.store.notify(StoreChange::Saved);
        Ok(removed)
    }

    /// Creates or refreshes the profile of the signed-in user.
    pub fn register_user(&self, display_name: &str, email: Option<&str>) -> AppResult<UpsertOutcome> {
        let user_id = self.user_id().ok_or(AppError::Unauthenticated)?;
        let now = self.inner.clock.now();
        let outcome = self.read(|conn| profile::save_user(conn, &user_id, display_name, email, now))?;
        self.inner.store.notify(StoreChange::Users);
        Ok(outcome)
    }

    pub fn current_profile(&self) -> AppResult<Option<UserProfile>> {
        let Some(user_id) = self.user_id() else {
            return Ok(None);
        };
        self.read(|conn| profile::user(conn, &user_id))
    }

    pub fn delete_current_user(&self) -> AppResult<bool> {
        let user_id = self.user_id().ok_or(AppError::Unauthenticated)?;
        let removed = self.read(|conn| profile::delete_user(conn, &user_id))?;
        self.inner.store.notify(StoreChange::Users);
        Ok(removed)
    }

    pub fn preferences(&self) -> Preferences {
        self.inner.preferences.get()
    }

    pub fn update_preferences(&self, patch: &PreferencesPatch) -> AppResult<Preferences> {
        self.inner.preferences.update(patch)
    }
}

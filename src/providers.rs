//! Content provider seams and the request gate every HTTP client goes
//! through (rate limit, then bounded retry with jittered backoff).

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use rand::{rngs::StdRng, Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex as AsyncMutex;
use tokio::time::{sleep, Instant};
use tracing::{trace, warn};

use crate::categories::CategoryNode;
use crate::errors::AppResult;
use crate::geo::Position;

const MAX_ATTEMPTS: u32 = 4;
const BASE_BACKOFF_MS: u64 = 250;
const MIN_INTERVAL_MS: u64 = 50;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawCategoryRef {
    pub id: String,
    pub name: String,
}

/// A venue as a provider returns it, before enrichment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawVenue {
    pub id: String,
    pub name: String,
    pub lat: f64,
    pub lng: f64,
    pub address: Option<String>,
    pub postal_code: Option<String>,
    pub categories: Vec<RawCategoryRef>,
    pub details: Option<serde_json::Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawBook {
    pub isbn13: String,
    pub rank: u32,
    pub title: String,
    pub author: Option<String>,
    pub description: Option<String>,
    pub image_url: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GeocodedPlace {
    pub formatted_address: String,
    pub position: Position,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AutocompletePrediction {
    pub description: String,
    pub place_id: String,
}

/// Area parameters shared by the nearby, recommended and search calls.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AreaQuery {
    pub position: Position,
    pub radius_meters: u32,
    pub limit: u32,
}

#[async_trait]
pub trait VenueProvider: Send + Sync {
    async fn categories(&self) -> AppResult<Vec<CategoryNode>>;

    async fn venues_near(&self, area: &AreaQuery, category_id: &str) -> AppResult<Vec<RawVenue>>;

    async fn recommended_near(&self, area: &AreaQuery) -> AppResult<Vec<RawVenue>>;

    async fn search(&self, area: &AreaQuery, query: &str) -> AppResult<Vec<RawVenue>>;

    async fn venue_details(&self, venue_id: &str) -> AppResult<RawVenue>;

    async fn similar_venues(&self, venue_id: &str) -> AppResult<Vec<RawVenue>>;
}

#[async_trait]
pub trait GeocodingProvider: Send + Sync {
    async fn autocomplete(
        &self,
        input: &str,
        near: Option<&Position>,
    ) -> AppResult<Vec<AutocompletePrediction>>;

    /// `Ok(None)` when the address resolves to nothing.
    async fn geocode(&self, address: &str) -> AppResult<Option<GeocodedPlace>>;
}

#[async_trait]
pub trait BestsellerProvider: Send + Sync {
    async fn list(&self, list_name: &str) -> AppResult<Vec<RawBook>>;
}

/// Spaces consecutive requests at least `1 / qps` apart.
pub struct RateLimiter {
    min_interval_ms: AtomicU64,
    last_tick: AsyncMutex<Option<Instant>>,
}

impl RateLimiter {
    pub fn new(qps: u32) -> Self {
        Self {
            min_interval_ms: AtomicU64::new(Self::interval_ms(qps)),
            last_tick: AsyncMutex::new(None),
        }
    }

    pub fn set_qps(&self, qps: u32) {
        self.min_interval_ms
            .store(Self::interval_ms(qps), Ordering::SeqCst);
    }

    pub fn qps(&self) -> u32 {
        let interval = self.min_interval_ms.load(Ordering::SeqCst).max(1);
        ((1000_f64 / interval as f64).round() as u32).max(1)
    }

    fn interval_ms(qps: u32) -> u64 {
        let interval_ms = (1000_f64 / qps.max(1) as f64).ceil() as u64;
        interval_ms.max(MIN_INTERVAL_MS)
    }

    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.min_interval_ms.load(Ordering::SeqCst))
    }

    pub async fn wait(&self) {
        let interval = self.interval();
        let mut guard = self.last_tick.lock().await;
        if let Some(prev) = *guard {
            let elapsed = prev.elapsed();
            if elapsed < interval {
                sleep(interval - elapsed).await;
            }
        }
        *guard = Some(Instant::now());
    }
}

pub struct Backoff {
    max_attempts: u32,
    base_ms: u64,
    rng: Mutex<StdRng>,
}

impl Backoff {
    pub fn new() -> Self {
        Self::with_rng(MAX_ATTEMPTS, BASE_BACKOFF_MS, StdRng::from_entropy())
    }

    pub fn with_rng(max_attempts: u32, base_ms: u64, rng: StdRng) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_ms: base_ms.max(1),
            rng: Mutex::new(rng),
        }
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Exponential in `attempt` (1-based) plus up to one base step of jitter.
    pub fn delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(6);
        let base = Duration::from_millis(self.base_ms * (1 << exponent));
        let jitter_ms = self.rng.lock().gen_range(0..self.base_ms);
        base + Duration::from_millis(jitter_ms)
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new()
    }
}

/// Rate limit plus retry for one provider client.
#[derive(Clone)]
pub struct ProviderGate {
    provider: &'static str,
    limiter: Arc<RateLimiter>,
    backoff: Arc<Backoff>,
}

impl ProviderGate {
    pub fn new(provider: &'static str, qps: u32) -> Self {
        Self::with_backoff(provider, qps, Backoff::new())
    }

    pub fn with_backoff(provider: &'static str, qps: u32, backoff: Backoff) -> Self {
        Self {
            provider,
            limiter: Arc::new(RateLimiter::new(qps)),
            backoff: Arc::new(backoff),
        }
    }

    pub fn provider(&self) -> &'static str {
        self.provider
    }

    pub fn limiter(&self) -> &RateLimiter {
        &self.limiter
    }

    /// Runs `request` until it succeeds, fails with a non-retryable error,
    /// or the attempt budget is spent.
    pub async fn run<T, F, Fut>(&self, operation: &'static str, mut request: F) -> AppResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = AppResult<T>>,
    {
        let mut attempt = 0;
        loop {
            attempt += 1;
            self.limiter.wait().await;
            match request().await {
                Ok(value) => {
                    trace!(target: "providers", provider = self.provider, operation, attempt, "request succeeded");
                    return Ok(value);
                }
                Err(err) if err.is_retryable() && attempt < self.backoff.max_attempts() => {
                    let delay = self.backoff.delay(attempt);
                    warn!(
                        target: "providers",
                        provider = self.provider,
                        operation,
                        attempt,
                        ?err,
                        "request failed; retrying after {:?}",
                        delay
                    );
                    sleep(delay).await;
                }
                Err(err) => return Err(err),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::AppError;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn interval_follows_qps_with_a_floor() {
        let limiter = RateLimiter::new(4);
        assert_eq!(limiter.interval(), Duration::from_millis(250));
        limiter.set_qps(1_000);
        assert_eq!(limiter.interval(), Duration::from_millis(MIN_INTERVAL_MS));
        assert_eq!(limiter.qps(), 20);
        limiter.set_qps(0);
        assert_eq!(limiter.qps(), 1);
    }

    #[test]
    fn backoff_doubles_and_stays_within_jitter() {
        let backoff = Backoff::with_rng(5, 100, StdRng::seed_from_u64(7));
        for attempt in 1..=4 {
            let delay = backoff.delay(attempt).as_millis() as u64;
            let floor = 100 * (1 << (attempt - 1));
            assert!(delay >= floor && delay < floor + 100, "attempt {attempt}: {delay}");
        }
    }

    #[tokio::test]
    async fn rate_limiter_spaces_requests() {
        let limiter = RateLimiter::new(10);
        let start = Instant::now();
        limiter.wait().await;
        limiter.wait().await;
        limiter.wait().await;
        assert!(start.elapsed() >= Duration::from_millis(200));
    }

    #[tokio::test]
    async fn non_retryable_errors_fail_fast() {
        let gate = ProviderGate::with_backoff("test", 50, Backoff::with_rng(4, 1, StdRng::seed_from_u64(1)));
        let calls = AtomicUsize::new(0);
        let result: AppResult<()> = gate
            .run("op", || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(AppError::provider("test", "bad payload")) }
            })
            .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}

pub mod bestsellers;
pub mod books;
pub mod categories;
pub mod clock;
pub mod config;
pub mod errors;
pub mod feed;
pub mod foursquare;
pub mod freshness;
pub mod geo;
pub mod geocoding;
pub mod orchestrator;
pub mod position;
pub mod preferences;
pub mod profile;
pub mod providers;
pub mod saved;
pub mod session;
pub mod similarity;
pub mod store;
pub mod venues;

use std::path::Path;
use std::sync::Arc;

use once_cell::sync::OnceCell;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::bestsellers::NytBestsellerClient;
use crate::clock::{Clock, SystemClock};
use crate::foursquare::FoursquareClient;
use crate::geocoding::GoogleGeocodingClient;
use crate::preferences::{preferences_path, PreferenceStore};
use crate::providers::{BestsellerProvider, GeocodingProvider, VenueProvider};

pub use crate::config::AppConfig;
pub use crate::errors::{AppError, AppResult};
pub use crate::geo::Position;
pub use crate::orchestrator::{DiscoveryService, Fetched, FetchSource, ProviderSet, ServiceDeps};
pub use crate::session::{SessionProvider, StaticSession};
pub use crate::store::{CacheStore, Page, Pagination, StoreChange};

/// Builds the provider clients whose credentials are configured.
pub fn providers_from_config(config: &AppConfig) -> AppResult<ProviderSet> {
    let venues = FoursquareClient::from_config(config)?
        .map(|client| Arc::new(client) as Arc<dyn VenueProvider>);
    let geocoding = GoogleGeocodingClient::from_config(config)?
        .map(|client| Arc::new(client) as Arc<dyn GeocodingProvider>);
    let bestsellers = NytBestsellerClient::from_config(config)?
        .map(|client| Arc::new(client) as Arc<dyn BestsellerProvider>);

    for (name, configured) in [
        ("foursquare", venues.is_some()),
        ("google_maps", geocoding.is_some()),
        ("nyt_books", bestsellers.is_some()),
    ] {
        if !configured {
            warn!(target: "providers", provider = name, "credentials missing; provider disabled");
        }
    }
    Ok(ProviderSet {
        venues,
        geocoding,
        bestsellers,
    })
}

/// Opens the cache and preferences under `data_dir` and wires a
/// [`DiscoveryService`] with the configured providers.
pub fn open_service(
    data_dir: &Path,
    config: &AppConfig,
    session: Arc<dyn SessionProvider>,
) -> AppResult<DiscoveryService> {
    let store = CacheStore::open(data_dir, &config.database_file_name)?;
    let preferences = PreferenceStore::open(preferences_path(data_dir))?;
    let providers = providers_from_config(config)?;
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);

    info!(
        target: "store_bootstrap",
        data_dir = %data_dir.display(),
        database = %config.database_file_name,
        "discovery service ready"
    );
    Ok(DiscoveryService::new(
        ServiceDeps {
            store,
            providers,
            session,
            preferences,
            clock,
        },
        config,
    ))
}

pub fn init_tracing() {
    static INIT: OnceCell<()> = OnceCell::new();
    let _ = INIT.get_or_init(|| {
        let filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new("info,nearfeed=debug"));
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
            .init();
    });
}

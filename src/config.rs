use std::{env, io};

use secrecy::SecretString;
use serde::Serialize;
use tracing::debug;

const DEFAULT_FOURSQUARE_BASE_URL: &str = "https://api.foursquare.com/v2";
const DEFAULT_GOOGLE_MAPS_BASE_URL: &str = "https://maps.googleapis.com/maps/api";
const DEFAULT_NYT_BASE_URL: &str = "https://api.nytimes.com/svc/books/v3";
const DEFAULT_VENUE_TTL_MINUTES: u64 = 6 * 60;
const DEFAULT_DAILY_TTL_MINUTES: u64 = 24 * 60;

#[derive(Clone, Debug)]
pub struct AppConfig {
    pub database_file_name: String,
    pub foursquare_base_url: String,
    pub foursquare_client_id: Option<SecretString>,
    pub foursquare_client_secret: Option<SecretString>,
    pub google_maps_base_url: String,
    pub google_maps_api_key: Option<SecretString>,
    pub nyt_base_url: String,
    pub nyt_api_key: Option<SecretString>,
    pub provider_rate_limit_qps: u32,
    pub venue_ttl_minutes: u64,
    pub detail_ttl_minutes: u64,
    pub bestseller_ttl_minutes: u64,
    pub search_radius_meters: u32,
    pub geocell_degrees: f64,
    pub position_min_displacement_meters: f64,
    pub venue_result_limit: u32,
}

#[derive(Clone, Debug, Serialize)]
pub struct PublicAppConfig {
    pub database_file_name: String,
    pub foursquare_base_url: String,
    pub google_maps_base_url: String,
    pub nyt_base_url: String,
    pub provider_rate_limit_qps: u32,
    pub venue_ttl_minutes: u64,
    pub detail_ttl_minutes: u64,
    pub bestseller_ttl_minutes: u64,
    pub search_radius_meters: u32,
    pub geocell_degrees: f64,
    pub position_min_displacement_meters: f64,
    pub venue_result_limit: u32,
    pub has_foursquare_credentials: bool,
    pub has_google_maps_key: bool,
    pub has_nyt_key: bool,
}

impl AppConfig {
    pub fn from_env() -> Self {
        load_dotenv_if_applicable();
        Self {
            database_file_name: env::var("DATABASE_FILE_NAME")
                .unwrap_or_else(|_| "nearfeed.db".to_string()),
            foursquare_base_url: parse_string("FOURSQUARE_BASE_URL", DEFAULT_FOURSQUARE_BASE_URL),
            foursquare_client_id: parse_secret("FOURSQUARE_CLIENT_ID"),
            foursquare_client_secret: parse_secret("FOURSQUARE_CLIENT_SECRET"),
            google_maps_base_url: parse_string(
                "GOOGLE_MAPS_BASE_URL",
                DEFAULT_GOOGLE_MAPS_BASE_URL,
            ),
            google_maps_api_key: parse_secret("GOOGLE_MAPS_API_KEY"),
            nyt_base_url: parse_string("NYT_BASE_URL", DEFAULT_NYT_BASE_URL),
            nyt_api_key: parse_secret("NYT_API_KEY"),
            provider_rate_limit_qps: parse_u32("PROVIDER_RATE_LIMIT_QPS", 3).max(1),
            venue_ttl_minutes: parse_u64("VENUE_TTL_MINUTES", DEFAULT_VENUE_TTL_MINUTES),
            detail_ttl_minutes: parse_u64("DETAIL_TTL_MINUTES", DEFAULT_DAILY_TTL_MINUTES),
            bestseller_ttl_minutes: parse_u64("BESTSELLER_TTL_MINUTES", DEFAULT_DAILY_TTL_MINUTES),
            search_radius_meters: parse_u32("SEARCH_RADIUS_METERS", 5_000),
            geocell_degrees: parse_f64("GEOCELL_DEGREES", 0.01).max(0.0001),
            position_min_displacement_meters: parse_f64("POSITION_MIN_DISPLACEMENT_METERS", 25.0)
                .max(0.0),
            venue_result_limit: parse_u32("VENUE_RESULT_LIMIT", 50).clamp(1, 50),
        }
    }

    pub fn public_profile(&self) -> PublicAppConfig {
        PublicAppConfig {
            database_file_name: self.database_file_name.clone(),
            foursquare_base_url: self.foursquare_base_url.clone(),
            google_maps_base_url: self.google_maps_base_url.clone(),
            nyt_base_url: self.nyt_base_url.clone(),
            provider_rate_limit_qps: self.provider_rate_limit_qps,
            venue_ttl_minutes: self.venue_ttl_minutes,
            detail_ttl_minutes: self.detail_ttl_minutes,
            bestseller_ttl_minutes: self.bestseller_ttl_minutes,
            search_radius_meters: self.search_radius_meters,
            geocell_degrees: self.geocell_degrees,
            position_min_displacement_meters: self.position_min_displacement_meters,
            venue_result_limit: self.venue_result_limit,
            has_foursquare_credentials: self.foursquare_client_id.is_some()
                && self.foursquare_client_secret.is_some(),
            has_google_maps_key: self.google_maps_api_key.is_some(),
            has_nyt_key: self.nyt_api_key.is_some(),
        }
    }
}

impl Default for AppConfig {
    /// Defaults with no credentials, matching an empty environment.
    fn default() -> Self {
        Self {
            database_file_name: "nearfeed.db".to_string(),
            foursquare_base_url: DEFAULT_FOURSQUARE_BASE_URL.to_string(),
            foursquare_client_id: None,
            foursquare_client_secret: None,
            google_maps_base_url: DEFAULT_GOOGLE_MAPS_BASE_URL.to_string(),
            google_maps_api_key: None,
            nyt_base_url: DEFAULT_NYT_BASE_URL.to_string(),
            nyt_api_key: None,
            provider_rate_limit_qps: 3,
            venue_ttl_minutes: DEFAULT_VENUE_TTL_MINUTES,
            detail_ttl_minutes: DEFAULT_DAILY_TTL_MINUTES,
            bestseller_ttl_minutes: DEFAULT_DAILY_TTL_MINUTES,
            search_radius_meters: 5_000,
            geocell_degrees: 0.01,
            position_min_displacement_meters: 25.0,
            venue_result_limit: 50,
        }
    }
}

fn load_dotenv_if_applicable() {
    if !should_load_dotenv() {
        debug!("skipping .env load outside dev mode");
        return;
    }

    if let Err(err) = dotenvy::dotenv() {
        match &err {
            dotenvy::Error::Io(io_err) if io_err.kind() == io::ErrorKind::NotFound => {}
            _ => debug!(?err, "unable to load .env file"),
        }
    }
}

fn should_load_dotenv() -> bool {
    cfg!(debug_assertions) || parse_bool("ALLOW_DOTENV", false)
}

fn parse_bool(key: &str, default: bool) -> bool {
    env::var(key)
        .map(|v| matches!(v.trim(), "1" | "true" | "TRUE" | "True"))
        .unwrap_or(default)
}

fn parse_string(key: &str, default: &str) -> String {
    env::var(key)
        .ok()
        .map(|v| v.trim().trim_end_matches('/').to_string())
        .filter(|v| !v.is_empty())
        .unwrap_or_else(|| default.to_string())
}

fn parse_secret(key: &str) -> Option<SecretString> {
    env::var(key)
        .ok()
        .filter(|v| !v.trim().is_empty())
        .map(SecretString::from)
}

fn parse_u64(key: &str, default: u64) -> u64 {
    env::var(key)
        .ok()
        .and_then(|v| v.trim().parse::<u64>().ok())
        .unwrap_or(default)
}

fn parse_u32(key: &str, default: u32) -> u32 {
    env::var(key)
        .ok()
        .and_then(|v| v.trim().parse::<u32>().ok())
        .unwrap_or(default)
}

fn parse_f64(key: &str, default: f64) -> f64 {
    env::var(key)
        .ok()
        .and_then(|v| v.trim().parse::<f64>().ok())
        .filter(|v| v.is_finite())
        .unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builds_public_profile_without_secrets() {
        env::set_var("NYT_API_KEY", "secret");
        env::set_var("GOOGLE_MAPS_API_KEY", "secret");
        env::set_var("DATABASE_FILE_NAME", "custom.db");
        env::set_var("VENUE_TTL_MINUTES", "90");
        env::set_var("FOURSQUARE_BASE_URL", "http://localhost:9000/v2/");

        let config = AppConfig::from_env();
        let public = config.public_profile();

        assert_eq!(public.database_file_name, "custom.db");
        assert_eq!(public.venue_ttl_minutes, 90);
        assert_eq!(public.foursquare_base_url, "http://localhost:9000/v2");
        assert!(public.has_nyt_key);
        assert!(public.has_google_maps_key);
        assert!(config.nyt_api_key.is_some());
        assert_eq!(public.bestseller_ttl_minutes, DEFAULT_DAILY_TTL_MINUTES);

        let serialized = serde_json::to_string(&public).unwrap();
        assert!(!serialized.contains("secret"));
    }

    #[test]
    fn default_profile_has_no_credentials() {
        let public = AppConfig::default().public_profile();
        assert!(!public.has_foursquare_credentials);
        assert!(!public.has_google_maps_key);
        assert!(!public.has_nyt_key);
        assert_eq!(public.search_radius_meters, 5_000);
    }
}

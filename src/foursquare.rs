use std::time::Duration;

use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::Value;

use crate::categories::CategoryNode;
use crate::config::AppConfig;
use crate::errors::{AppError, AppResult};
use crate::providers::{AreaQuery, ProviderGate, RawCategoryRef, RawVenue, VenueProvider};

const PROVIDER: &str = "foursquare";
const API_VERSION: &str = "20210601";
const ICON_SIZE: &str = "88";

pub struct FoursquareClient {
    http: reqwest::Client,
    base_url: String,
    client_id: SecretString,
    client_secret: SecretString,
    gate: ProviderGate,
}

impl FoursquareClient {
    pub fn new(
        base_url: impl Into<String>,
        client_id: SecretString,
        client_secret: SecretString,
        gate: ProviderGate,
    ) -> AppResult<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()?;
        Ok(Self {
            http,
            base_url: base_url.into(),
            client_id,
            client_secret,
            gate,
        })
    }

    /// `None` unless both credentials are configured.
    pub fn from_config(config: &AppConfig) -> AppResult<Option<Self>> {
        let (Some(id), Some(secret)) = (
            config.foursquare_client_id.clone(),
            config.foursquare_client_secret.clone(),
        ) else {
            return Ok(None);
        };
        let gate = ProviderGate::new(PROVIDER, config.provider_rate_limit_qps);
        Self::new(config.foursquare_base_url.clone(), id, secret, gate).map(Some)
    }

    async fn get<T: DeserializeOwned>(
        &self,
        operation: &'static str,
        path: &str,
        params: &[(&str, String)],
    ) -> AppResult<T> {
        let url = format!("{}{}", self.base_url, path);
        let url = url.as_str();
        let envelope: Envelope<T> = self
            .gate
            .run(operation, move || self.send::<Envelope<T>>(url, params))
            .await?;
        Ok(envelope.response)
    }

    async fn send<T: DeserializeOwned>(&self, url: &str, params: &[(&str, String)]) -> AppResult<T> {
        let response = self
            .http
            .get(url)
            .query(&[
                ("client_id", self.client_id.expose_secret()),
                ("client_secret", self.client_secret.expose_secret()),
                ("v", API_VERSION),
            ])
            .query(params)
            .send()
            .await?
            .error_for_status()?;
        Ok(response.json().await?)
    }
}

fn area_params(area: &AreaQuery) -> Vec<(&'static str, String)> {
    vec![
        ("ll", format!("{},{}", area.position.lat, area.position.lng)),
        ("radius", area.radius_meters.to_string()),
        ("limit", area.limit.to_string()),
    ]
}

#[async_trait]
impl VenueProvider for FoursquareClient {
    async fn categories(&self) -> AppResult<Vec<CategoryNode>> {
        let body: CategoriesResponse = self.get("categories", "/venues/categories", &[]).await?;
        Ok(body.categories.into_iter().map(FsCategory::into_node).collect())
    }

    async fn venues_near(&self, area: &AreaQuery, category_id: &str) -> AppResult<Vec<RawVenue>> {
        let mut params = area_params(area);
        params.push(("categoryId", category_id.to_string()));
        params.push(("intent", "browse".to_string()));
        let body: SearchResponse = self.get("venues_near", "/venues/search", &params).await?;
        Ok(body.venues.into_iter().map(FsVenue::into_raw).collect())
    }

    async fn recommended_near(&self, area: &AreaQuery) -> AppResult<Vec<RawVenue>> {
        let params = area_params(area);
        let body: ExploreResponse = self.get("recommended_near", "/venues/explore", &params).await?;
        Ok(body
            .groups
            .into_iter()
            .flat_map(|group| group.items)
            .map(|item| item.venue.into_raw())
            .collect())
    }

    async fn search(&self, area: &AreaQuery, query: &str) -> AppResult<Vec<RawVenue>> {
        let mut params = area_params(area);
        params.push(("query", query.trim().to_string()));
        let body: SearchResponse = self.get("search", "/venues/search", &params).await?;
        Ok(body.venues.into_iter().map(FsVenue::into_raw).collect())
    }

    async fn venue_details(&self, venue_id: &str) -> AppResult<RawVenue> {
        let path = format!("/venues/{venue_id}");
        let mut body: Value = self.get("venue_details", &path, &[]).await?;
        let payload = body
            .get_mut("venue")
            .map(Value::take)
            .ok_or_else(|| AppError::provider(PROVIDER, format!("no venue in details for {venue_id}")))?;
        let venue: FsVenue = serde_json::from_value(payload.clone())?;
        let mut raw = venue.into_raw();
        raw.details = Some(payload);
        Ok(raw)
    }

    async fn similar_venues(&self, venue_id: &str) -> AppResult<Vec<RawVenue>> {
        let path = format!("/venues/{venue_id}/similar");
        let body: SimilarResponse = self.get("similar_venues", &path, &[]).await?;
        Ok(body
            .similar_venues
            .items
            .into_iter()
            .map(FsVenue::into_raw)
            .collect())
    }
}

#[derive(Deserialize)]
struct Envelope<T> {
    response: T,
}

#[derive(Deserialize)]
struct CategoriesResponse {
    #[serde(default)]
    categories: Vec<FsCategory>,
}

#[derive(Deserialize)]
struct FsCategory {
    id: String,
    name: String,
    #[serde(rename = "pluralName")]
    plural_name: Option<String>,
    icon: Option<FsIcon>,
    #[serde(default)]
    categories: Vec<FsCategory>,
}

impl FsCategory {
    fn into_node(self) -> CategoryNode {
        CategoryNode {
            id: self.id,
            name: self.name,
            plural_name: self.plural_name,
            icon_url: self
                .icon
                .map(|icon| format!("{}{ICON_SIZE}{}", icon.prefix, icon.suffix)),
            children: self.categories.into_iter().map(FsCategory::into_node).collect(),
        }
    }
}

#[derive(Deserialize)]
struct FsIcon {
    prefix: String,
    suffix: String,
}

#[derive(Deserialize)]
struct SearchResponse {
    #[serde(default)]
    venues: Vec<FsVenue>,
}

#[derive(Deserialize)]
struct ExploreResponse {
    #[serde(default)]
    groups: Vec<ExploreGroup>,
}

#[derive(Deserialize)]
struct ExploreGroup {
    #[serde(default)]
    items: Vec<ExploreItem>,
}

#[derive(Deserialize)]
struct ExploreItem {
    venue: FsVenue,
}

#[derive(Deserialize)]
struct SimilarResponse {
    #[serde(rename = "similarVenues")]
    similar_venues: SimilarItems,
}

#[derive(Deserialize)]
struct SimilarItems {
    #[serde(default)]
    items: Vec<FsVenue>,
}

#[derive(Deserialize)]
struct FsVenue {
    id: String,
    name: String,
    location: FsLocation,
    #[serde(default)]
    categories: Vec<FsVenueCategory>,
}

#[derive(Deserialize)]
struct FsLocation {
    lat: f64,
    lng: f64,
    address: Option<String>,
    #[serde(rename = "postalCode")]
    postal_code: Option<String>,
}

#[derive(Deserialize)]
struct FsVenueCategory {
    id: String,
    name: String,
}

impl FsVenue {
    fn into_raw(self) -> RawVenue {
        RawVenue {
            id: self.id,
            name: self.name,
            lat: self.location.lat,
            lng: self.location.lng,
            address: self.location.address,
            postal_code: self.location.postal_code,
            categories: self
                .categories
                .into_iter()
                .map(|category| RawCategoryRef {
                    id: category.id,
                    name: category.name,
                })
                .collect(),
            details: None,
        }
    }
}

use std::time::Duration;

use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use tracing::debug;

use crate::config::AppConfig;
use crate::errors::{AppError, AppResult};
use crate::geo::Position;
use crate::providers::{AutocompletePrediction, GeocodedPlace, GeocodingProvider, ProviderGate};

const PROVIDER: &str = "google_maps";
const AUTOCOMPLETE_BIAS_RADIUS_METERS: u32 = 50_000;

pub struct GoogleGeocodingClient {
    http: reqwest::Client,
    base_url: String,
    api_key: SecretString,
    gate: ProviderGate,
}

impl GoogleGeocodingClient {
    pub fn new(base_url: impl Into<String>, api_key: SecretString, gate: ProviderGate) -> AppResult<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()?;
        Ok(Self {
            http,
            base_url: base_url.into(),
            api_key,
            gate,
        })
    }

    pub fn from_config(config: &AppConfig) -> AppResult<Option<Self>> {
        let Some(key) = config.google_maps_api_key.clone() else {
            return Ok(None);
        };
        let gate = ProviderGate::new(PROVIDER, config.provider_rate_limit_qps);
        Self::new(config.google_maps_base_url.clone(), key, gate).map(Some)
    }

    async fn get<T: DeserializeOwned>(
        &self,
        operation: &'static str,
        path: &str,
        params: &[(&str, String)],
    ) -> AppResult<T> {
        let url = format!("{}{}", self.base_url, path);
        let url = url.as_str();
        self.gate
            .run(operation, move || async move {
                let response = self
                    .http
                    .get(url)
                    .query(&[("key", self.api_key.expose_secret())])
                    .query(params)
                    .send()
                    .await?
                    .error_for_status()?;
                Ok(response.json::<T>().await?)
            })
            .await
    }
}

/// Google reports failures in a `status` field of a 200 response.
fn check_status(status: &str, error_message: Option<&str>) -> AppResult<bool> {
    match status {
        "OK" => Ok(true),
        "ZERO_RESULTS" => Ok(false),
        other => Err(AppError::provider(
            PROVIDER,
            match error_message {
                Some(message) => format!("{other}: {message}"),
                None => other.to_string(),
            },
        )),
    }
}

#[async_trait]
impl GeocodingProvider for GoogleGeocodingClient {
    async fn autocomplete(
        &self,
        input: &str,
        near: Option<&Position>,
    ) -> AppResult<Vec<AutocompletePrediction>> {
        let input = input.trim();
        if input.is_empty() {
            return Ok(Vec::new());
        }
        let mut params = vec![("input", input.to_string())];
        if let Some(position) = near {
            params.push(("location", format!("{},{}", position.lat, position.lng)));
            params.push(("radius", AUTOCOMPLETE_BIAS_RADIUS_METERS.to_string()));
        }
        let body: AutocompleteResponse = self
            .get("autocomplete", "/place/autocomplete/json", &params)
            .await?;
        if !check_status(&body.status, body.error_message.as_deref())? {
            return Ok(Vec::new());
        }
        Ok(body
            .predictions
            .into_iter()
            .map(|prediction| AutocompletePrediction {
                description: prediction.description,
                place_id: prediction.place_id,
            })
            .collect())
    }

    async fn geocode(&self, address: &str) -> AppResult<Option<GeocodedPlace>> {
        let params = [("address", address.trim().to_string())];
        let body: GeocodeResponse = self.get("geocode", "/geocode/json", &params).await?;
        if !check_status(&body.status, body.error_message.as_deref())? {
            debug!(target: "providers", provider = PROVIDER, address, "address resolved to nothing");
            return Ok(None);
        }
        Ok(body.results.into_iter().next().map(|result| GeocodedPlace {
            formatted_address: result.formatted_address,
            position: Position::new(result.geometry.location.lat, result.geometry.location.lng),
        }))
    }
}

#[derive(Deserialize)]
struct AutocompleteResponse {
    status: String,
    error_message: Option<String>,
    #[serde(default)]
    predictions: Vec<Prediction>,
}

#[derive(Deserialize)]
struct Prediction {
    description: String,
    place_id: String,
}

#[derive(Deserialize)]
struct GeocodeResponse {
    status: String,
    error_message: Option<String>,
    #[serde(default)]
    results: Vec<GeocodeResult>,
}

#[derive(Deserialize)]
struct GeocodeResult {
    formatted_address: String,
    geometry: Geometry,
}

#[derive(Deserialize)]
struct Geometry {
    location: LatLng,
}

#[derive(Deserialize)]
struct LatLng {
    lat: f64,
    lng: f64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use httptest::matchers::{all_of, contains, request, url_decoded};
    use httptest::responders::json_encoded;
    use httptest::{Expectation, Server};
    use serde_json::json;

    fn client(server: &Server) -> GoogleGeocodingClient {
        GoogleGeocodingClient::new(
            server.url_str("").trim_end_matches('/').to_string(),
            SecretString::from("maps-key".to_string()),
            ProviderGate::new(PROVIDER, 20),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn geocodes_the_first_result() {
        let server = Server::run();
        server.expect(
            Expectation::matching(all_of![
                request::method_path("GET", "/geocode/json"),
                request::query(url_decoded(contains(("address", "350 5th Ave, New York")))),
                request::query(url_decoded(contains(("key", "maps-key"))))
            ])
            .respond_with(json_encoded(json!({
                "status": "OK",
                "results": [{
                    "formatted_address": "350 5th Ave, New York, NY 10118, USA",
                    "geometry": {"location": {"lat": 40.7484, "lng": -73.9857}}
                }]
            }))),
        );

        let place = client(&server)
            .geocode(" 350 5th Ave, New York ")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(place.position, Position::new(40.7484, -73.9857));
        assert!(place.formatted_address.starts_with("350 5th Ave"));
    }

    #[tokio::test]
    async fn zero_results_is_none_and_denied_is_an_error() {
        let server = Server::run();
        server.expect(
            Expectation::matching(all_of![
                request::method_path("GET", "/geocode/json"),
                request::query(url_decoded(contains(("address", "nowhere"))))
            ])
            .respond_with(json_encoded(json!({"status": "ZERO_RESULTS", "results": []}))),
        );
        server.expect(
            Expectation::matching(all_of![
                request::method_path("GET", "/geocode/json"),
                request::query(url_decoded(contains(("address", "denied"))))
            ])
            .respond_with(json_encoded(json!({
                "status": "REQUEST_DENIED",
                "error_message": "The provided API key is invalid."
            }))),
        );

        let geocoder = client(&server);
        assert!(geocoder.geocode("nowhere").await.unwrap().is_none());
        let err = geocoder.geocode("denied").await.unwrap_err();
        assert!(matches!(err, AppError::Provider { provider: PROVIDER, .. }));
    }

    #[tokio::test]
    async fn autocomplete_biases_toward_the_user() {
        let server = Server::run();
        server.expect(
            Expectation::matching(all_of![
                request::method_path("GET", "/place/autocomplete/json"),
                request::query(url_decoded(contains(("input", "brookl")))),
                request::query(url_decoded(contains(("location", "40,-73"))))
            ])
            .respond_with(json_encoded(json!({
                "status": "OK",
                "predictions": [
                    {"description": "Brooklyn, NY, USA", "place_id": "p1"},
                    {"description": "Brookline, MA, USA", "place_id": "p2"}
                ]
            }))),
        );

        let predictions = client(&server)
            .autocomplete("brookl", Some(&Position::new(40.0, -73.0)))
            .await
            .unwrap();
        assert_eq!(predictions.len(), 2);
        assert_eq!(predictions[0].place_id, "p1");

        assert!(client(&server).autocomplete("  ", None).await.unwrap().is_empty());
    }
}

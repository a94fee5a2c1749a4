use std::time::Duration;

use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;

use crate::config::AppConfig;
use crate::errors::{AppError, AppResult};
use crate::providers::{BestsellerProvider, ProviderGate, RawBook};

const PROVIDER: &str = "nyt_books";

pub struct NytBestsellerClient {
    http: reqwest::Client,
    base_url: String,
    api_key: SecretString,
    gate: ProviderGate,
}

impl NytBestsellerClient {
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
        let Some(key) = config.nyt_api_key.clone() else {
            return Ok(None);
        };
        let gate = ProviderGate::new(PROVIDER, config.provider_rate_limit_qps);
        Self::new(config.nyt_base_url.clone(), key, gate).map(Some)
    }
}

#[async_trait]
impl BestsellerProvider for NytBestsellerClient {
    async fn list(&self, list_name: &str) -> AppResult<Vec<RawBook>> {
        let list_name = list_name.trim();
        if list_name.is_empty() || list_name.contains('/') {
            return Err(AppError::provider(PROVIDER, format!("invalid list name {list_name:?}")));
        }
        let url = format!("{}/lists/current/{list_name}.json", self.base_url);
        let url = url.as_str();
        let body: ListResponse = self
            .gate
            .run("list", move || async move {
                let response = self
                    .http
                    .get(url)
                    .query(&[("api-key", self.api_key.expose_secret())])
                    .send()
                    .await?
                    .error_for_status()?;
                Ok(response.json::<ListResponse>().await?)
            })
            .await?;
        if body.status != "OK" {
            return Err(AppError::provider(PROVIDER, format!("status {}", body.status)));
        }
        Ok(body
            .results
            .books
            .into_iter()
            .map(|book| RawBook {
                isbn13: book.primary_isbn13,
                rank: book.rank,
                title: book.title,
                author: book.author.filter(|author| !author.is_empty()),
                description: book.description.filter(|text| !text.is_empty()),
                image_url: book.book_image,
            })
            .collect())
    }
}

#[derive(Deserialize)]
struct ListResponse {
    status: String,
    results: ListResults,
}

#[derive(Deserialize)]
struct ListResults {
    #[serde(default)]
    books: Vec<NytBook>,
}

#[derive(Deserialize)]
struct NytBook {
    rank: u32,
    #[serde(default)]
    primary_isbn13: String,
    title: String,
    author: Option<String>,
    description: Option<String>,
    book_image: Option<String>,
}

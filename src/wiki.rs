use moka::future::Cache as MokaCache;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;
use tracing::debug;

use crate::config::WikiConfig;
use crate::error::{LocateError, Result};
use crate::metrics;

const SERVICE: &str = "wikipedia";

/// Lead image of the encyclopedia article best matching a query
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlaceImage {
    pub title: Option<String>,
    pub image_url: Option<String>,
    pub page_url: Option<String>,
}

/// Search, then page summary. Successful lookups (including "nothing found")
/// are cached by normalized query.
pub struct WikiClient {
    http: reqwest::Client,
    config: WikiConfig,
    cache: MokaCache<String, PlaceImage>,
}

impl WikiClient {
    pub fn new(http: reqwest::Client, config: WikiConfig) -> Self {
        let cache = MokaCache::builder()
            .max_capacity(2_000)
            .time_to_live(Duration::from_secs(config.cache_ttl_secs))
            .build();
        Self { http, config, cache }
    }

    fn timeout(&self) -> Duration {
        Duration::from_millis(self.config.timeout_ms)
    }

    async fn get_json(&self, url: reqwest::Url) -> Result<Option<Value>> {
        let response = self
            .http
            .get(url)
            .timeout(self.timeout())
            .send()
            .await
            .map_err(|e| LocateError::from_reqwest(SERVICE, self.config.timeout_ms, e))?;

        let status = response.status();
        if status == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(LocateError::upstream_status(SERVICE, status.as_u16(), &body));
        }
        response
            .json::<Value>()
            .await
            .map(Some)
            .map_err(|e| LocateError::from_reqwest(SERVICE, self.config.timeout_ms, e))
    }

    fn url(&self, segments: &[&str]) -> Result<reqwest::Url> {
        let mut url = reqwest::Url::parse(&self.config.base_url)
            .map_err(|e| LocateError::Internal(format!("invalid WIKI_BASE_URL: {}", e)))?;
        url.path_segments_mut()
            .map_err(|_| LocateError::Internal("WIKI_BASE_URL cannot be a base".to_string()))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    async fn search_title(&self, query: &str) -> Result<Option<String>> {
        let mut url = self.url(&["w", "api.php"])?;
        url.query_pairs_mut()
            .append_pair("action", "query")
            .append_pair("list", "search")
            .append_pair("srsearch", query)
            .append_pair("srlimit", "1")
            .append_pair("format", "json");

        Ok(self.get_json(url).await?.and_then(|body| {
            body.pointer("/query/search/0/title")
                .and_then(|t| t.as_str())
                .map(|t| t.to_string())
        }))
    }

    async fn summary(&self, title: &str) -> Result<PlaceImage> {
        let url = self.url(&["api", "rest_v1", "page", "summary", title])?;
        let Some(body) = self.get_json(url).await? else {
            return Ok(PlaceImage::default());
        };
        Ok(parse_summary(&body))
    }

    pub async fn lookup(&self, query: &str) -> Result<PlaceImage> {
        let key = query.trim().to_lowercase();
        if key.is_empty() {
            return Err(LocateError::InvalidInput("Missing q".to_string()));
        }
        if let Some(hit) = self.cache.get(&key) {
            return Ok(hit);
        }

        let result = async {
            match self.search_title(query.trim()).await? {
                Some(title) => self.summary(&title).await,
                None => Ok(PlaceImage::default()),
            }
        }
        .await
        .inspect_err(|e| metrics::record_upstream_failure(SERVICE, e))?;

        debug!(query = %key, found = result.title.is_some(), "Place image lookup");
        self.cache.insert(key, result.clone()).await;
        Ok(result)
    }
}

pub fn parse_summary(body: &Value) -> PlaceImage {
    let text = |ptr: &str| body.pointer(ptr).and_then(|v| v.as_str()).map(|s| s.to_string());
    PlaceImage {
        title: text("/title"),
        image_url: text("/thumbnail/source").or_else(|| text("/originalimage/source")),
        page_url: text("/content_urls/desktop/page"),
    }
}

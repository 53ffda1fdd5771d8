use async_trait::async_trait;
use serde_json::{Map, Value};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use super::ReverseGeoResult;
use crate::error::{LocateError, Result};
use crate::metrics::{self, Timer};
use crate::retry::{try_in_order, with_timeout};

/// Address granularities consulted for `city`, most specific first
const CITY_FIELDS: &[&str] = &["city", "town", "village", "municipality", "county"];

/// One reverse-geocoding backend
#[async_trait]
pub trait GeocodeProvider: Send + Sync {
    fn name(&self) -> &str;
    fn timeout(&self) -> Duration;
    async fn reverse(&self, lat: f64, lon: f64) -> Result<ReverseGeoResult>;
}

/// Reverse lookup over one or more providers.
#[async_trait]
pub trait ReverseLookup: Send + Sync {
    /// First provider that answers, or the last failure.
    async fn try_resolve(&self, lat: f64, lon: f64) -> Result<ReverseGeoResult>;

    /// Never fails: total failure degrades to an all-null result.
    async fn resolve(&self, lat: f64, lon: f64) -> ReverseGeoResult {
        self.try_resolve(lat, lon).await.unwrap_or_default()
    }
}

fn non_empty(value: Option<&Value>) -> Option<String> {
    value
        .and_then(|v| v.as_str())
        .map(|s| s.trim())
        .filter(|s| !s.is_empty())
        .map(|s| s.to_string())
}

pub(crate) fn pick_city(address: &Map<String, Value>) -> Option<String> {
    CITY_FIELDS
        .iter()
        .find_map(|field| non_empty(address.get(*field)))
}

async fn fetch_json(
    http: &reqwest::Client,
    service: &str,
    url: &str,
    query: &[(&str, String)],
    timeout: Duration,
) -> Result<Value> {
    let timeout_ms = timeout.as_millis() as u64;
    let response = http
        .get(url)
        .query(query)
        .timeout(timeout)
        .send()
        .await
        .map_err(|e| LocateError::from_reqwest(service, timeout_ms, e))?;

    let status = response.status();
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        return Err(LocateError::upstream_status(service, status.as_u16(), &body));
    }

    response
        .json::<Value>()
        .await
        .map_err(|e| LocateError::from_reqwest(service, timeout_ms, e))
}

/// OpenStreetMap Nominatim `/reverse`
pub struct NominatimProvider {
    http: reqwest::Client,
    url: String,
    timeout: Duration,
}

impl NominatimProvider {
    pub fn new(http: reqwest::Client, url: impl Into<String>, timeout: Duration) -> Self {
        Self {
            http,
            url: url.into(),
            timeout,
        }
    }

    pub(crate) fn parse(body: &Value) -> Result<ReverseGeoResult> {
        if let Some(err) = non_empty(body.get("error")) {
            return Err(LocateError::upstream("nominatim", err));
        }
        let empty = Map::new();
        let address = body.get("address").and_then(|a| a.as_object()).unwrap_or(&empty);

        Ok(ReverseGeoResult {
            display_name: non_empty(body.get("display_name")),
            city: pick_city(address),
            state: non_empty(address.get("state")),
            country: non_empty(address.get("country")),
        })
    }
}

#[async_trait]
impl GeocodeProvider for NominatimProvider {
    fn name(&self) -> &str {
        "nominatim"
    }

    fn timeout(&self) -> Duration {
        self.timeout
    }

    async fn reverse(&self, lat: f64, lon: f64) -> Result<ReverseGeoResult> {
        let query = [
            ("format", "jsonv2".to_string()),
            ("lat", lat.to_string()),
            ("lon", lon.to_string()),
            ("zoom", "18".to_string()),
            ("addressdetails", "1".to_string()),
        ];
        let body = fetch_json(&self.http, self.name(), &self.url, &query, self.timeout).await?;
        Self::parse(&body)
    }
}

/// Komoot Photon `/reverse`, used when Nominatim is unavailable
pub struct PhotonProvider {
    http: reqwest::Client,
    url: String,
    timeout: Duration,
}

impl PhotonProvider {
    pub fn new(http: reqwest::Client, url: impl Into<String>, timeout: Duration) -> Self {
        Self {
            http,
            url: url.into(),
            timeout,
        }
    }

    pub(crate) fn parse(body: &Value) -> Result<ReverseGeoResult> {
        let props = body
            .get("features")
            .and_then(|f| f.as_array())
            .and_then(|features| features.first())
            .and_then(|feature| feature.get("properties"))
            .and_then(|p| p.as_object())
            .ok_or_else(|| LocateError::upstream("photon", "no features in response"))?;

        let city = pick_city(props);
        let state = non_empty(props.get("state"));
        let country = non_empty(props.get("country"));

        let mut parts: Vec<String> = Vec::new();
        for part in [
            non_empty(props.get("name")),
            non_empty(props.get("street")),
            city.clone(),
            state.clone(),
            country.clone(),
        ]
        .into_iter()
        .flatten()
        {
            if !parts.contains(&part) {
                parts.push(part);
            }
        }

        Ok(ReverseGeoResult {
            display_name: if parts.is_empty() { None } else { Some(parts.join(", ")) },
            city,
            state,
            country,
        })
    }
}

#[async_trait]
impl GeocodeProvider for PhotonProvider {
    fn name(&self) -> &str {
        "photon"
    }

    fn timeout(&self) -> Duration {
        self.timeout
    }

    async fn reverse(&self, lat: f64, lon: f64) -> Result<ReverseGeoResult> {
        let query = [("lat", lat.to_string()), ("lon", lon.to_string())];
        let body = fetch_json(&self.http, self.name(), &self.url, &query, self.timeout).await?;
        Self::parse(&body)
    }
}

/// Primary/secondary reverse geocoding chain
pub struct ReverseGeocoder {
    providers: Vec<Arc<dyn GeocodeProvider>>,
}

impl ReverseGeocoder {
    pub fn new(providers: Vec<Arc<dyn GeocodeProvider>>) -> Self {
        Self { providers }
    }

    pub fn providers(&self) -> &[Arc<dyn GeocodeProvider>] {
        &self.providers
    }
}

#[async_trait]
impl ReverseLookup for ReverseGeocoder {
    async fn try_resolve(&self, lat: f64, lon: f64) -> Result<ReverseGeoResult> {
        let timer = Timer::new();
        let result = try_in_order(&self.providers, |provider| async move {
            let result = with_timeout(provider.name(), provider.timeout(), provider.reverse(lat, lon)).await;
            if let Err(ref e) = result {
                metrics::record_upstream_failure(provider.name(), e);
            }
            result
        })
        .await;
        match &result {
            Ok(_) => debug!(elapsed_ms = timer.elapsed_ms(), "Reverse geocode resolved"),
            Err(e) => warn!(
                elapsed_ms = timer.elapsed_ms(),
                "Reverse geocode failed on every provider: {}",
                e.detail()
            ),
        }
        result
    }
}

use async_trait::async_trait;
use serde::Deserialize;
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

use super::{haversine_m, Poi};
use crate::error::{LocateError, Result};
use crate::metrics::{self, Timer};
use crate::retry::{try_in_order, with_timeout};

/// Tag allowlist, in classification priority order. `None` matches any value.
/// A POI's `type` is the key of the first rule it matches (`amenity`, not
/// `place_of_worship`); the value stays visible in the hint.
const TAG_RULES: &[(&str, Option<&str>)] = &[
    ("tourism", None),
    ("historic", None),
    ("amenity", Some("place_of_worship")),
    ("building", Some("temple")),
    ("man_made", None),
    ("leisure", Some("park")),
];

const MAX_HINT_TAGS: usize = 3;

/// One spatial tag index endpoint
#[async_trait]
pub trait PoiProvider: Send + Sync {
    fn name(&self) -> &str;
    fn timeout(&self) -> Duration;
    async fn elements(&self, lat: f64, lon: f64, radius_m: u32) -> Result<Vec<OsmElement>>;
}

/// Component-level contract: normalized, ranked POIs or the last endpoint error.
#[async_trait]
pub trait PoiSearch: Send + Sync {
    async fn search(&self, lat: f64, lon: f64, radius_m: u32) -> Result<Vec<Poi>>;
}

#[derive(Debug, Clone, Copy, Deserialize, PartialEq)]
pub struct LatLon {
    pub lat: f64,
    pub lon: f64,
}

#[derive(Debug, Clone, Copy, Deserialize, PartialEq)]
pub struct Bounds {
    pub minlat: f64,
    pub minlon: f64,
    pub maxlat: f64,
    pub maxlon: f64,
}

/// Raw element as returned by an Overpass `out center tags` query
#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
pub struct OsmElement {
    #[serde(rename = "type", default)]
    pub kind: String,
    #[serde(default)]
    pub lat: Option<f64>,
    #[serde(default)]
    pub lon: Option<f64>,
    #[serde(default)]
    pub center: Option<LatLon>,
    #[serde(default)]
    pub bounds: Option<Bounds>,
    #[serde(default)]
    pub geometry: Option<Vec<LatLon>>,
    #[serde(default)]
    pub tags: BTreeMap<String, String>,
}

impl OsmElement {
    /// Node position, or the centroid of a way/relation.
    pub fn position(&self) -> Option<(f64, f64)> {
        if let (Some(lat), Some(lon)) = (self.lat, self.lon) {
            return Some((lat, lon));
        }
        if let Some(c) = self.center {
            return Some((c.lat, c.lon));
        }
        if let Some(b) = self.bounds {
            return Some(((b.minlat + b.maxlat) / 2.0, (b.minlon + b.maxlon) / 2.0));
        }
        match self.geometry.as_deref() {
            Some(points) if !points.is_empty() => {
                let n = points.len() as f64;
                let lat = points.iter().map(|p| p.lat).sum::<f64>() / n;
                let lon = points.iter().map(|p| p.lon).sum::<f64>() / n;
                Some((lat, lon))
            }
            _ => None,
        }
    }

    fn name(&self) -> Option<&str> {
        self.tags
            .get("name")
            .map(|n| n.trim())
            .filter(|n| !n.is_empty())
    }
}

#[derive(Debug, Deserialize)]
struct OverpassResponse {
    #[serde(default)]
    elements: Vec<OsmElement>,
}

fn matched_tags(tags: &BTreeMap<String, String>) -> Vec<(&'static str, &str)> {
    TAG_RULES
        .iter()
        .filter_map(|(key, wanted)| {
            let value = tags.get(*key)?;
            match wanted {
                Some(w) if value != w => None,
                _ => Some((*key, value.as_str())),
            }
        })
        .collect()
}

/// Classify by the first matching allowlist rule; `"poi"` when none match.
pub fn classify(tags: &BTreeMap<String, String>) -> (String, String) {
    let matched = matched_tags(tags);
    let kind = matched
        .first()
        .map(|(key, _)| key.to_string())
        .unwrap_or_else(|| "poi".to_string());
    let hint = matched
        .iter()
        .take(MAX_HINT_TAGS)
        .map(|(key, value)| format!("{}={}", key, value))
        .collect::<Vec<_>>()
        .join("; ");
    (kind, hint)
}

/// Drop unnamed or unplaced elements, rank by distance, dedupe by name and cap.
pub fn normalize_elements(lat: f64, lon: f64, elements: &[OsmElement], cap: usize) -> Vec<Poi> {
    let mut pois: Vec<Poi> = elements
        .iter()
        .filter_map(|element| {
            let name = element.name()?;
            let (plat, plon) = element.position()?;
            let (kind, hint) = classify(&element.tags);
            Some(Poi {
                name: name.to_string(),
                kind,
                distance_m: haversine_m(lat, lon, plat, plon).round() as u32,
                hint,
            })
        })
        .collect();

    // Stable sort, so equal distances keep response order
    pois.sort_by_key(|p| p.distance_m);

    let mut seen = HashSet::new();
    pois.retain(|p| seen.insert(p.name.to_lowercase()));
    pois.truncate(cap);
    pois
}

/// Overpass QL for every named allowlisted element within `radius_m`.
pub fn build_query(lat: f64, lon: f64, radius_m: u32, timeout_secs: u64) -> String {
    let around = format!("(around:{},{},{})", radius_m, lat, lon);
    let selectors: String = TAG_RULES
        .iter()
        .map(|(key, value)| match value {
            Some(v) => format!("  nwr{}[\"name\"][\"{}\"=\"{}\"];\n", around, key, v),
            None => format!("  nwr{}[\"name\"][\"{}\"];\n", around, key),
        })
        .collect();
    format!(
        "[out:json][timeout:{}];\n(\n{});\nout center tags;",
        timeout_secs.max(1),
        selectors
    )
}

/// Single Overpass interpreter endpoint
pub struct OverpassEndpoint {
    http: reqwest::Client,
    url: String,
    timeout: Duration,
}

impl OverpassEndpoint {
    pub fn new(http: reqwest::Client, url: impl Into<String>, timeout: Duration) -> Self {
        Self {
            http,
            url: url.into(),
            timeout,
        }
    }
}

#[async_trait]
impl PoiProvider for OverpassEndpoint {
    fn name(&self) -> &str {
        &self.url
    }

    fn timeout(&self) -> Duration {
        self.timeout
    }

    async fn elements(&self, lat: f64, lon: f64, radius_m: u32) -> Result<Vec<OsmElement>> {
        let timeout_ms = self.timeout.as_millis() as u64;
        let query = build_query(lat, lon, radius_m, self.timeout.as_secs());

        let response = self
            .http
            .post(&self.url)
            .form(&[("data", query)])
            .timeout(self.timeout)
            .send()
            .await
            .map_err(|e| LocateError::from_reqwest("overpass", timeout_ms, e))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(LocateError::upstream_status("overpass", status.as_u16(), &body));
        }

        let parsed: OverpassResponse = response
            .json()
            .await
            .map_err(|e| LocateError::from_reqwest("overpass", timeout_ms, e))?;
        Ok(parsed.elements)
    }
}

/// Ordered endpoint list with first-success-wins fallback
pub struct PoiLocator {
    endpoints: Vec<Arc<dyn PoiProvider>>,
    cap: usize,
}

impl PoiLocator {
    pub fn new(endpoints: Vec<Arc<dyn PoiProvider>>, cap: usize) -> Self {
        Self { endpoints, cap }
    }

    pub fn endpoints(&self) -> &[Arc<dyn PoiProvider>] {
        &self.endpoints
    }
}

#[async_trait]
impl PoiSearch for PoiLocator {
    async fn search(&self, lat: f64, lon: f64, radius_m: u32) -> Result<Vec<Poi>> {
        let timer = Timer::new();
        let elements = try_in_order(&self.endpoints, |endpoint| async move {
            let result = with_timeout(
                "overpass",
                endpoint.timeout(),
                endpoint.elements(lat, lon, radius_m),
            )
            .await;
            if let Err(ref e) = result {
                metrics::record_upstream_failure("overpass", e);
                debug!(endpoint = %endpoint.name(), "Overpass endpoint failed");
            }
            result
        })
        .await?;

        let pois = normalize_elements(lat, lon, &elements, self.cap);
        info!(
            radius_m,
            raw = elements.len(),
            pois = pois.len(),
            elapsed_ms = timer.elapsed_ms(),
            "POI search complete"
        );
        Ok(pois)
    }
}

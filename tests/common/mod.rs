#![allow(dead_code)]

use async_trait::async_trait;
use serde_json::json;
use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Semaphore;

use photo_locator::clock::{ManualClock, SharedClock};
use photo_locator::config::{Config, GeoConfig, JobConfig, LocateMode, OpenAiConfig, WikiConfig};
use photo_locator::error::{LocateError, Result};
use photo_locator::geo::poi::OsmElement;
use photo_locator::geo::{GeocodeProvider, Poi, PoiProvider, PoiSearch, ReverseGeoResult, ReverseLookup};
use photo_locator::jobs::{JobStatus, JobView};
use photo_locator::state_manager::{AppState, Collaborators};
use photo_locator::vision::{ModelRequest, VisionModel};

pub fn test_config(mode: LocateMode) -> Config {
    Config {
        api_host: "127.0.0.1".into(),
        api_port: 0,
        locate_mode: mode,
        max_image_bytes: 1024 * 1024,
        max_concurrent_jobs: 4,
        geo_config: GeoConfig::default(),
        openai_config: OpenAiConfig {
            api_key: None,
            base_url: "http://127.0.0.1:1".into(),
            model: "stub".into(),
            timeout_ms: 1_000,
            max_attempts: 1,
        },
        wiki_config: WikiConfig {
            base_url: "http://127.0.0.1:1".into(),
            timeout_ms: 200,
            cache_ttl_secs: 60,
        },
        job_config: JobConfig::default(),
        photo_context_ttl_secs: 900,
        sweep_interval_secs: 60,
        debug_token: None,
    }
}

// ============================================================================
// Geo stubs
// ============================================================================

pub struct StubGeocoder {
    pub result: Option<ReverseGeoResult>,
    pub calls: AtomicUsize,
    /// Calls that fail before `result` is served
    pub outage_calls: usize,
}

impl StubGeocoder {
    pub fn new(result: Option<ReverseGeoResult>) -> Arc<Self> {
        Arc::new(Self {
            result,
            calls: AtomicUsize::new(0),
            outage_calls: 0,
        })
    }

    /// Fails the first `outage_calls` lookups, then recovers.
    pub fn recovering(outage_calls: usize, result: ReverseGeoResult) -> Arc<Self> {
        Arc::new(Self {
            result: Some(result),
            calls: AtomicUsize::new(0),
            outage_calls,
        })
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl GeocodeProvider for StubGeocoder {
    fn name(&self) -> &str {
        "stub-geocoder"
    }
    fn timeout(&self) -> Duration {
        Duration::from_millis(500)
    }
    async fn reverse(&self, _lat: f64, _lon: f64) -> Result<ReverseGeoResult> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        if call < self.outage_calls {
            return Err(LocateError::upstream_status("stub-geocoder", 503, "down"));
        }
        self.result
            .clone()
            .ok_or_else(|| LocateError::upstream_status("stub-geocoder", 503, "down"))
    }
}

#[async_trait]
impl ReverseLookup for StubGeocoder {
    async fn try_resolve(&self, lat: f64, lon: f64) -> Result<ReverseGeoResult> {
        self.reverse(lat, lon).await
    }
}

/// Spatial index stub returning a fixed element list
pub struct StubPoiEndpoint {
    pub elements: Option<Vec<OsmElement>>,
    pub calls: AtomicUsize,
}

impl StubPoiEndpoint {
    pub fn new(elements: Option<Vec<OsmElement>>) -> Arc<Self> {
        Arc::new(Self {
            elements,
            calls: AtomicUsize::new(0),
        })
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl PoiProvider for StubPoiEndpoint {
    fn name(&self) -> &str {
        "stub-overpass"
    }
    fn timeout(&self) -> Duration {
        Duration::from_millis(500)
    }
    async fn elements(&self, _lat: f64, _lon: f64, _radius_m: u32) -> Result<Vec<OsmElement>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.elements
            .clone()
            .ok_or_else(|| LocateError::upstream_status("stub-overpass", 504, "gateway timeout"))
    }
}

pub fn osm_node(name: &str, lat: f64, lon: f64, tags: &[(&str, &str)]) -> OsmElement {
    let mut map: BTreeMap<String, String> = tags
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();
    map.insert("name".into(), name.into());
    serde_json::from_value(json!({
        "type": "node",
        "lat": lat,
        "lon": lon,
        "tags": map,
    }))
    .expect("element")
}

pub fn poi(name: &str, distance_m: u32) -> Poi {
    Poi {
        name: name.into(),
        kind: "tourism".into(),
        distance_m,
        hint: "tourism=attraction".into(),
    }
}

/// POI search stub whose answer depends on the radius asked for.
/// `None` from the script means the search fails at that radius.
pub struct ScriptedPoiSearch {
    pub script: Box<dyn Fn(u32) -> Option<Vec<Poi>> + Send + Sync>,
    pub delay: Duration,
    pub radii: Mutex<Vec<u32>>,
}

impl ScriptedPoiSearch {
    pub fn new(script: impl Fn(u32) -> Option<Vec<Poi>> + Send + Sync + 'static) -> Arc<Self> {
        Arc::new(Self {
            script: Box::new(script),
            delay: Duration::ZERO,
            radii: Mutex::new(Vec::new()),
        })
    }

    pub fn slow(delay: Duration, script: impl Fn(u32) -> Option<Vec<Poi>> + Send + Sync + 'static) -> Arc<Self> {
        Arc::new(Self {
            script: Box::new(script),
            delay,
            radii: Mutex::new(Vec::new()),
        })
    }

    pub fn radii(&self) -> Vec<u32> {
        self.radii.lock().expect("lock").clone()
    }
}

#[async_trait]
impl PoiSearch for ScriptedPoiSearch {
    async fn search(&self, _lat: f64, _lon: f64, radius_m: u32) -> Result<Vec<Poi>> {
        self.radii.lock().expect("lock").push(radius_m);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        (self.script)(radius_m).ok_or_else(|| LocateError::upstream("overpass", "all endpoints failed"))
    }
}

// ============================================================================
// Model stub
// ============================================================================

/// Replays scripted answers in order and records every request.
pub struct StubModel {
    answers: Mutex<VecDeque<Result<String>>>,
    pub requests: Mutex<Vec<ModelRequest>>,
    /// When set, each call waits for a permit before answering
    pub gate: Option<Arc<Semaphore>>,
}

impl StubModel {
    pub fn new(answers: Vec<Result<String>>) -> Arc<Self> {
        Arc::new(Self {
            answers: Mutex::new(answers.into()),
            requests: Mutex::new(Vec::new()),
            gate: None,
        })
    }

    pub fn gated(answers: Vec<Result<String>>, gate: Arc<Semaphore>) -> Arc<Self> {
        Arc::new(Self {
            answers: Mutex::new(answers.into()),
            requests: Mutex::new(Vec::new()),
            gate: Some(gate),
        })
    }

    pub fn calls(&self) -> usize {
        self.requests.lock().expect("lock").len()
    }

    pub fn prompts(&self) -> Vec<String> {
        self.requests
            .lock()
            .expect("lock")
            .iter()
            .map(|r| r.prompt.clone())
            .collect()
    }

    pub fn purposes(&self) -> Vec<&'static str> {
        self.requests.lock().expect("lock").iter().map(|r| r.purpose).collect()
    }
}

#[async_trait]
impl VisionModel for StubModel {
    async fn generate(&self, request: ModelRequest) -> Result<String> {
        self.requests.lock().expect("lock").push(request);
        if let Some(gate) = &self.gate {
            let permit = gate.acquire().await.expect("gate");
            permit.forget();
        }
        self.answers
            .lock()
            .expect("lock")
            .pop_front()
            .unwrap_or_else(|| Err(LocateError::Internal("no scripted answer left".into())))
    }
}

pub fn answer(names: &[(&str, f64)], why: &str) -> String {
    let candidates: Vec<_> = names
        .iter()
        .map(|(name, confidence)| {
            json!({"name": name, "why": why, "confidence": confidence, "searchQuery": name})
        })
        .collect();
    json!({"photoContext": "Wrought-iron lattice tower over a park", "candidates": candidates}).to_string()
}

// ============================================================================
// Application state
// ============================================================================

pub fn app_state(
    config: &Config,
    geocoder: Arc<StubGeocoder>,
    endpoint: Arc<StubPoiEndpoint>,
    model: Arc<StubModel>,
    clock: Arc<ManualClock>,
) -> AppState {
    let collaborators = Collaborators {
        geocoders: vec![geocoder as Arc<dyn GeocodeProvider>],
        poi_endpoints: vec![endpoint as Arc<dyn PoiProvider>],
        model: model as Arc<dyn VisionModel>,
    };
    let clock: SharedClock = clock;
    AppState::new(config, collaborators, reqwest::Client::new(), clock)
}

/// Poll until the job status satisfies `done`, failing the test after 5 seconds.
pub async fn wait_for(state: &AppState, job_id: &str, done: impl Fn(JobStatus) -> bool) -> JobView {
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            let view = state.jobs.view(job_id).expect("job exists");
            if done(view.status()) {
                return view;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("job did not reach the expected status")
}

//! Application state
//!
//! Every cache, store and upstream client is an explicitly owned object held
//! here and handed to the HTTP layer, so tests can build the same state around
//! stub providers and a manual clock.

use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;

use crate::chat::ChatService;
use crate::clock::SharedClock;
use crate::config::{Config, LocateMode};
use crate::geo::{
    GeoContextBuilder, GeocodeProvider, NominatimProvider, OverpassEndpoint, PhotonProvider,
    PoiLocator, PoiProvider, ReverseGeocoder,
};
use crate::jobs::{JobScheduler, JobStore};
use crate::photo_context::PhotoContextCache;
use crate::pipeline::LocatePipeline;
use crate::resource_manager::{ResourceLimits, ResourceManager};
use crate::vision::{OpenAiClient, VisionEngine, VisionModel};
use crate::wiki::WikiClient;

/// Upstream capabilities, substitutable in tests
#[derive(Clone)]
pub struct Collaborators {
    pub geocoders: Vec<Arc<dyn GeocodeProvider>>,
    pub poi_endpoints: Vec<Arc<dyn PoiProvider>>,
    pub model: Arc<dyn VisionModel>,
}

impl Collaborators {
    pub fn from_config(config: &Config, http: &reqwest::Client) -> Self {
        let geo = &config.geo_config;
        let mut geocoders: Vec<Arc<dyn GeocodeProvider>> = vec![Arc::new(NominatimProvider::new(
            http.clone(),
            geo.nominatim_url.clone(),
            Duration::from_millis(geo.nominatim_timeout_ms),
        ))];
        if geo.reverse_fallback_enabled {
            geocoders.push(Arc::new(PhotonProvider::new(
                http.clone(),
                geo.photon_url.clone(),
                Duration::from_millis(geo.photon_timeout_ms),
            )));
        }

        let poi_timeout = Duration::from_millis(geo.overpass_timeout_ms);
        let poi_endpoints = geo
            .overpass_endpoints
            .iter()
            .map(|url| {
                Arc::new(OverpassEndpoint::new(http.clone(), url.clone(), poi_timeout))
                    as Arc<dyn PoiProvider>
            })
            .collect();

        Self {
            geocoders,
            poi_endpoints,
            model: Arc::new(OpenAiClient::new(http.clone(), config.openai_config.clone())),
        }
    }
}

#[derive(Clone)]
pub struct AppState {
    pub locate_mode: LocateMode,
    pub debug_token: Option<String>,
    pub resources: Arc<ResourceManager>,
    pub pipeline: Arc<LocatePipeline>,
    pub scheduler: Arc<JobScheduler>,
    pub jobs: Arc<JobStore>,
    pub photo_contexts: Arc<PhotoContextCache>,
    pub chat: Arc<ChatService>,
    pub wiki: Arc<WikiClient>,
    /// Raw providers, probed individually by the debug endpoints
    pub collaborators: Collaborators,
    pub clock: SharedClock,
}

impl AppState {
    pub fn new(
        config: &Config,
        collaborators: Collaborators,
        http: reqwest::Client,
        clock: SharedClock,
    ) -> Self {
        let geo_config = config.geo_config.clone();

        let reverse = Arc::new(ReverseGeocoder::new(collaborators.geocoders.clone()));
        let pois = Arc::new(PoiLocator::new(
            collaborators.poi_endpoints.clone(),
            geo_config.poi_cap,
        ));
        let geo = Arc::new(GeoContextBuilder::new(geo_config, reverse, pois, clock.clone()));
        let engine = Arc::new(VisionEngine::new(collaborators.model.clone()));
        let pipeline = Arc::new(LocatePipeline::new(geo, engine));

        let resources = Arc::new(ResourceManager::new(ResourceLimits {
            max_image_bytes: config.max_image_bytes,
            max_concurrent_jobs: config.max_concurrent_jobs,
        }));
        let jobs = Arc::new(JobStore::new(config.job_config.clone(), clock.clone()));
        let photo_contexts = Arc::new(PhotoContextCache::new(
            Duration::from_secs(config.photo_context_ttl_secs),
            clock.clone(),
        ));
        let scheduler = Arc::new(JobScheduler::new(
            jobs.clone(),
            pipeline.clone(),
            resources.clone(),
            photo_contexts.clone(),
        ));

        Self {
            locate_mode: config.locate_mode,
            debug_token: config.debug_token.clone(),
            resources,
            pipeline,
            scheduler,
            jobs,
            photo_contexts,
            chat: Arc::new(ChatService::new(collaborators.model.clone())),
            wiki: Arc::new(WikiClient::new(http, config.wiki_config.clone())),
            collaborators,
            clock,
        }
    }

    /// Drop expired geo contexts, photo contexts and jobs.
    pub fn sweep(&self) -> SweepReport {
        let report = SweepReport {
            geo_contexts: self.pipeline.geo_builder().sweep(),
            photo_contexts: self.photo_contexts.sweep(),
            jobs: self.jobs.sweep(),
        };
        if report.total() > 0 {
            tracing::debug!(
                geo = report.geo_contexts,
                photo = report.photo_contexts,
                jobs = report.jobs,
                "Sweep removed expired entries"
            );
        }
        report
    }

    pub fn snapshot(&self) -> StateSnapshot {
        StateSnapshot {
            locate_mode: match self.locate_mode {
                LocateMode::Sync => "sync",
                LocateMode::Job => "job",
            },
            live_jobs: self.jobs.len(),
            geo_cache_entries: self.pipeline.geo_builder().cache().len(),
            geo_cache_hit_rate: crate::metrics::geo_cache_hit_rate(),
            photo_context_entries: self.photo_contexts.len(),
            pipelines_in_flight: self.resources.get_stats().pipelines_in_flight,
            timestamp: self.clock.now_ms(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    pub geo_contexts: usize,
    pub photo_contexts: usize,
    pub jobs: usize,
}

impl SweepReport {
    pub fn total(&self) -> usize {
        self.geo_contexts + self.photo_contexts + self.jobs
    }
}

/// Point-in-time view for the debug endpoints
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StateSnapshot {
    pub locate_mode: &'static str,
    pub live_jobs: usize,
    pub geo_cache_entries: usize,
    pub geo_cache_hit_rate: f64,
    pub photo_context_entries: usize,
    pub pipelines_in_flight: usize,
    pub timestamp: i64,
}

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::env;
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub api_host: String,
    pub api_port: u16,
    pub locate_mode: LocateMode,
    pub max_image_bytes: usize,
    pub max_concurrent_jobs: usize,
    pub geo_config: GeoConfig,
    pub openai_config: OpenAiConfig,
    pub wiki_config: WikiConfig,
    pub job_config: JobConfig,
    pub photo_context_ttl_secs: u64,
    pub sweep_interval_secs: u64,
    pub debug_token: Option<String>,
}

/// Whether `POST /api/locate` answers inline or hands back a job id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LocateMode {
    Sync,
    Job,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GeoStrategy {
    /// Reverse geocode first, then POIs at r, 2r, 4r... until enough are found.
    Widening,
    /// Reverse geocode and POIs concurrently under one wall-clock budget.
    Budgeted,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeoConfig {
    pub strategy: GeoStrategy,
    pub radius_m: u32,
    pub max_escalations: u32,
    pub min_pois: usize,
    pub total_budget_ms: u64,
    pub cache_ttl_secs: u64,
    pub poi_cap: usize,
    pub user_agent: String,
    pub nominatim_url: String,
    pub nominatim_timeout_ms: u64,
    pub photon_url: String,
    pub photon_timeout_ms: u64,
    pub reverse_fallback_enabled: bool,
    pub overpass_endpoints: Vec<String>,
    pub overpass_timeout_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OpenAiConfig {
    pub api_key: Option<String>,
    pub base_url: String,
    pub model: String,
    pub timeout_ms: u64,
    pub max_attempts: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WikiConfig {
    pub base_url: String,
    pub timeout_ms: u64,
    pub cache_ttl_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobConfig {
    pub ttl_secs: u64,
    pub trace_limit: usize,
}

impl GeoConfig {
    pub fn total_budget(&self) -> Duration {
        Duration::from_millis(self.total_budget_ms)
    }

    pub fn cache_ttl(&self) -> Duration {
        Duration::from_secs(self.cache_ttl_secs)
    }
}

impl Default for GeoConfig {
    fn default() -> Self {
        Self {
            strategy: GeoStrategy::Widening,
            radius_m: 250,
            max_escalations: 2,
            min_pois: 5,
            total_budget_ms: 6_000,
            cache_ttl_secs: 600,
            poi_cap: 25,
            user_agent: default_user_agent(),
            nominatim_url: "https://nominatim.openstreetmap.org/reverse".to_string(),
            nominatim_timeout_ms: 2_500,
            photon_url: "https://photon.komoot.io/reverse".to_string(),
            photon_timeout_ms: 2_500,
            reverse_fallback_enabled: true,
            overpass_endpoints: default_overpass_endpoints(),
            overpass_timeout_ms: 4_000,
        }
    }
}

impl Default for JobConfig {
    fn default() -> Self {
        Self {
            ttl_secs: 900,
            trace_limit: 50,
        }
    }
}

fn default_user_agent() -> String {
    format!("photo-locator/{}", env!("CARGO_PKG_VERSION"))
}

fn default_overpass_endpoints() -> Vec<String> {
    vec![
        "https://overpass-api.de/api/interpreter".to_string(),
        "https://overpass.kumi.systems/api/interpreter".to_string(),
        "https://overpass.private.coffee/api/interpreter".to_string(),
    ]
}

fn env_or(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}

fn env_opt(key: &str) -> Option<String> {
    env::var(key)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

impl Config {
    pub fn load() -> Result<Self> {
        let api_host = env_or("API_HOST", "0.0.0.0");
        let api_port = env_parse("API_PORT", 8080);

        let locate_mode = match env_or("LOCATE_MODE", "job").to_lowercase().as_str() {
            "sync" => LocateMode::Sync,
            _ => LocateMode::Job,
        };

        let defaults = GeoConfig::default();
        let strategy = match env_or("GEO_STRATEGY", "widening").to_lowercase().as_str() {
            "budgeted" => GeoStrategy::Budgeted,
            _ => GeoStrategy::Widening,
        };

        // Comma separated, tried in the listed order
        let overpass_endpoints: Vec<String> = env::var("OVERPASS_ENDPOINTS")
            .unwrap_or_default()
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect();

        let geo_config = GeoConfig {
            strategy,
            radius_m: env_parse("GEO_RADIUS_M", defaults.radius_m),
            max_escalations: env_parse("GEO_MAX_ESCALATIONS", defaults.max_escalations),
            min_pois: env_parse("GEO_MIN_POIS", defaults.min_pois),
            total_budget_ms: env_parse("GEO_TOTAL_BUDGET_MS", defaults.total_budget_ms),
            cache_ttl_secs: env_parse("GEO_CACHE_TTL_SECS", defaults.cache_ttl_secs),
            poi_cap: env_parse("POI_CAP", defaults.poi_cap),
            user_agent: env_or("GEO_USER_AGENT", &defaults.user_agent),
            nominatim_url: env_or("NOMINATIM_URL", &defaults.nominatim_url),
            nominatim_timeout_ms: env_parse("NOMINATIM_TIMEOUT_MS", defaults.nominatim_timeout_ms),
            photon_url: env_or("PHOTON_URL", &defaults.photon_url),
            photon_timeout_ms: env_parse("PHOTON_TIMEOUT_MS", defaults.photon_timeout_ms),
            reverse_fallback_enabled: env_parse(
                "REVERSE_FALLBACK_ENABLED",
                defaults.reverse_fallback_enabled,
            ),
            overpass_endpoints: if overpass_endpoints.is_empty() {
                defaults.overpass_endpoints
            } else {
                overpass_endpoints
            },
            overpass_timeout_ms: env_parse("OVERPASS_TIMEOUT_MS", defaults.overpass_timeout_ms),
        };

        let openai_config = OpenAiConfig {
            api_key: env_opt("OPENAI_API_KEY"),
            base_url: env_or("OPENAI_BASE_URL", "https://api.openai.com/v1"),
            model: env_or("OPENAI_MODEL", "gpt-4o-mini"),
            timeout_ms: env_parse("OPENAI_TIMEOUT_MS", 45_000),
            max_attempts: env_parse("OPENAI_MAX_ATTEMPTS", 2u32).max(1),
        };

        if openai_config.api_key.is_none() {
            tracing::warn!("OPENAI_API_KEY is not set; locate and chat requests will fail");
        }

        let wiki_config = WikiConfig {
            base_url: env_or("WIKI_BASE_URL", "https://en.wikipedia.org"),
            timeout_ms: env_parse("WIKI_TIMEOUT_MS", 4_000),
            cache_ttl_secs: env_parse("WIKI_CACHE_TTL_SECS", 3_600),
        };

        let job_defaults = JobConfig::default();
        let job_config = JobConfig {
            ttl_secs: env_parse("JOB_TTL_SECS", job_defaults.ttl_secs),
            trace_limit: env_parse("JOB_TRACE_LIMIT", job_defaults.trace_limit),
        };

        Ok(Self {
            api_host,
            api_port,
            locate_mode,
            max_image_bytes: env_parse("MAX_IMAGE_BYTES", 10 * 1024 * 1024),
            max_concurrent_jobs: env_parse("MAX_CONCURRENT_JOBS", 16usize).max(1),
            geo_config,
            openai_config,
            wiki_config,
            job_config,
            photo_context_ttl_secs: env_parse("PHOTO_CONTEXT_TTL_SECS", 900),
            sweep_interval_secs: env_parse("SWEEP_INTERVAL_SECS", 60u64).max(1),
            debug_token: env_opt("DEBUG_TOKEN"),
        })
    }
}

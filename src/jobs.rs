//! Locate jobs
//!
//! The store owns every job record from creation until the TTL sweep removes
//! it. The scheduler runs the locate pipeline on its own task so the creating
//! request returns before any upstream call begins; clients poll for status.

use dashmap::DashMap;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

use crate::clock::SharedClock;
use crate::config::JobConfig;
use crate::error::{LocateError, Result};
use crate::geo::{GeoContext, GeoEvent, GeoObserver, GeoPoint};
use crate::vision::{Candidate, Identification, ImageInput, RepairOutcome};

pub use scheduler::JobScheduler;

// ============================================================================
// Job Records
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Pending,
    Geo,
    Openai,
    Done,
    Error,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Done | JobStatus::Error)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Geo => "geo",
            JobStatus::Openai => "openai",
            JobStatus::Done => "done",
            JobStatus::Error => "error",
        }
    }

    /// Forward-only: pending → geo → openai → done, any non-terminal → error.
    fn can_advance_to(&self, next: JobStatus) -> bool {
        match (self, next) {
            (from, _) if from.is_terminal() => false,
            (_, JobStatus::Error) => true,
            (JobStatus::Pending, JobStatus::Geo) => true,
            (JobStatus::Geo, JobStatus::Openai) => true,
            (JobStatus::Openai, JobStatus::Done) => true,
            _ => false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TraceEntry {
    pub ts: i64,
    pub step: String,
    pub detail: String,
}

/// Partial progress published while the geo stage runs
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JobProgress {
    pub reverse: Option<String>,
    pub pois_count: usize,
}

#[derive(Debug, Clone)]
pub struct LocateJob {
    pub job_id: String,
    pub status: JobStatus,
    pub created_at: i64,
    pub point: Option<GeoPoint>,
    pub user_text: String,
    /// Cleared once the model stage consumes it or the job ends
    pub image: Option<ImageInput>,
    /// Photo-context affinity key of the submitting client
    pub client_key: Option<String>,
    pub progress: JobProgress,
    pub geo_context: Option<GeoContext>,
    pub result: Option<Identification>,
    pub error: Option<String>,
    pub trace: Vec<TraceEntry>,
}

/// Poll response body
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum JobView {
    Running {
        status: JobStatus,
        reverse: Option<String>,
        #[serde(rename = "poisCount")]
        pois_count: usize,
    },
    Failed {
        status: JobStatus,
        error: String,
    },
    Done {
        status: JobStatus,
        #[serde(rename = "photoContext")]
        photo_context: String,
        candidates: Vec<Candidate>,
    },
}

impl JobView {
    pub fn status(&self) -> JobStatus {
        match self {
            JobView::Running { status, .. }
            | JobView::Failed { status, .. }
            | JobView::Done { status, .. } => *status,
        }
    }
}

impl LocateJob {
    pub fn view(&self) -> JobView {
        match (self.status, &self.result) {
            (JobStatus::Done, Some(result)) => JobView::Done {
                status: JobStatus::Done,
                photo_context: result.photo_context.clone(),
                candidates: result.candidates.clone(),
            },
            (JobStatus::Error, _) | (JobStatus::Done, None) => JobView::Failed {
                status: JobStatus::Error,
                error: self
                    .error
                    .clone()
                    .unwrap_or_else(|| "job failed".to_string()),
            },
            (status, _) => JobView::Running {
                status,
                reverse: self.progress.reverse.clone(),
                pois_count: self.progress.pois_count,
            },
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JobSummary {
    pub job_id: String,
    pub status: JobStatus,
    pub created_at: i64,
    pub age_ms: i64,
    pub has_image: bool,
    pub trace_len: usize,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JobDebugView {
    pub job_id: String,
    pub status: JobStatus,
    pub created_at: i64,
    pub lat: Option<f64>,
    pub lon: Option<f64>,
    pub acc: Option<f64>,
    pub user_text: String,
    pub has_image: bool,
    pub geo_context: Option<GeoContext>,
    pub result: Option<Identification>,
    pub error: Option<String>,
    pub trace: Vec<TraceEntry>,
}

// ============================================================================
// Job Store
// ============================================================================

pub struct JobStore {
    jobs: DashMap<String, LocateJob>,
    config: JobConfig,
    clock: SharedClock,
}

impl JobStore {
    pub fn new(config: JobConfig, clock: SharedClock) -> Self {
        Self {
            jobs: DashMap::new(),
            config,
            clock,
        }
    }

    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.config.ttl_secs)
    }

    /// Insert a new pending job and return its id. No upstream work happens here.
    pub fn create(
        &self,
        image: ImageInput,
        point: Option<GeoPoint>,
        user_text: String,
        client_key: Option<String>,
    ) -> String {
        let job_id = uuid::Uuid::new_v4().to_string();
        let now = self.clock.now_ms();
        let detail = match point {
            Some(p) => format!("lat={:.5} lon={:.5} image_bytes={}", p.lat, p.lon, image.bytes.len()),
            None => format!("no coordinates image_bytes={}", image.bytes.len()),
        };

        let job = LocateJob {
            job_id: job_id.clone(),
            status: JobStatus::Pending,
            created_at: now,
            point,
            user_text,
            image: Some(image),
            client_key,
            progress: JobProgress::default(),
            geo_context: None,
            result: None,
            error: None,
            trace: vec![TraceEntry {
                ts: now,
                step: "created".to_string(),
                detail,
            }],
        };

        self.jobs.insert(job_id.clone(), job);
        crate::metrics::JOBS_CREATED.inc();
        crate::metrics::JOBS_LIVE.set(self.jobs.len() as i64);
        debug!(job_id = %job_id, "Created locate job");
        job_id
    }

    /// Snapshot of the whole record
    pub fn get(&self, job_id: &str) -> Option<LocateJob> {
        self.jobs.get(job_id).map(|job| job.clone())
    }

    pub fn view(&self, job_id: &str) -> Result<JobView> {
        self.jobs
            .get(job_id)
            .map(|job| job.view())
            .ok_or_else(|| LocateError::UnknownJob(job_id.to_string()))
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }

    fn push_trace(&self, job: &mut LocateJob, step: &str, detail: String) {
        job.trace.push(TraceEntry {
            ts: self.clock.now_ms(),
            step: step.to_string(),
            detail: crate::error::truncate(&detail, crate::error::MAX_ERROR_DETAIL_CHARS),
        });
    }

    pub fn trace(&self, job_id: &str, step: &str, detail: impl Into<String>) {
        if let Some(mut job) = self.jobs.get_mut(job_id) {
            self.push_trace(&mut job, step, detail.into());
        }
    }

    /// Move a job forward. Returns false for unknown jobs and illegal transitions.
    pub fn advance(&self, job_id: &str, next: JobStatus) -> bool {
        let Some(mut job) = self.jobs.get_mut(job_id) else {
            return false;
        };
        if !job.status.can_advance_to(next) {
            warn!(job_id = %job_id, from = job.status.as_str(), to = next.as_str(), "Rejected job transition");
            return false;
        }
        job.status = next;
        self.push_trace(&mut job, next.as_str(), "stage started".to_string());
        true
    }

    pub fn update_progress(&self, job_id: &str, update: impl FnOnce(&mut JobProgress)) {
        if let Some(mut job) = self.jobs.get_mut(job_id) {
            update(&mut job.progress);
        }
    }

    pub fn set_geo_context(&self, job_id: &str, geo: Option<GeoContext>) {
        if let Some(mut job) = self.jobs.get_mut(job_id) {
            if let Some(ctx) = &geo {
                job.progress.reverse = ctx.reverse.display_name.clone();
                job.progress.pois_count = ctx.pois.len();
            }
            job.geo_context = geo;
        }
    }

    /// Hand the image to the model stage; the record keeps no copy.
    pub fn take_image(&self, job_id: &str) -> Option<ImageInput> {
        self.jobs.get_mut(job_id).and_then(|mut job| job.image.take())
    }

    pub fn complete(&self, job_id: &str, result: Identification) -> bool {
        let Some(mut job) = self.jobs.get_mut(job_id) else {
            return false;
        };
        if !job.status.can_advance_to(JobStatus::Done) {
            return false;
        }
        let top = result
            .candidates
            .first()
            .map(|c| format!("top={} confidence={:.2}", c.name, c.confidence))
            .unwrap_or_default();
        job.status = JobStatus::Done;
        job.image = None;
        job.result = Some(result);
        self.push_trace(&mut job, "done", top);
        crate::metrics::JOBS_COMPLETED.inc();
        true
    }

    pub fn fail(&self, job_id: &str, err: &LocateError) -> bool {
        let Some(mut job) = self.jobs.get_mut(job_id) else {
            return false;
        };
        if job.status.is_terminal() {
            return false;
        }
        let stage = job.status.as_str();
        let detail = err.detail();
        job.status = JobStatus::Error;
        job.image = None;
        job.error = Some(detail.clone());
        self.push_trace(&mut job, "error", format!("{}: {}", stage, detail));
        crate::metrics::JOBS_FAILED.inc();
        true
    }

    /// Remove jobs older than the TTL whatever their state.
    pub fn sweep(&self) -> usize {
        let cutoff = self.clock.now_ms() - self.ttl().as_millis() as i64;
        let before = self.jobs.len();
        self.jobs.retain(|_, job| job.created_at > cutoff);
        let removed = before.saturating_sub(self.jobs.len());

        crate::metrics::JOBS_LIVE.set(self.jobs.len() as i64);
        if removed > 0 {
            crate::metrics::JOBS_EXPIRED.inc_by(removed as u64);
            info!(removed, remaining = self.jobs.len(), "Swept expired locate jobs");
        }
        removed
    }

    pub fn summaries(&self) -> Vec<JobSummary> {
        let now = self.clock.now_ms();
        let mut out: Vec<JobSummary> = self
            .jobs
            .iter()
            .map(|job| JobSummary {
                job_id: job.job_id.clone(),
                status: job.status,
                created_at: job.created_at,
                age_ms: now - job.created_at,
                has_image: job.image.is_some(),
                trace_len: job.trace.len(),
            })
            .collect();
        out.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        out
    }

    /// Full record with only the most recent trace entries.
    pub fn debug_view(&self, job_id: &str) -> Result<JobDebugView> {
        let job = self
            .jobs
            .get(job_id)
            .ok_or_else(|| LocateError::UnknownJob(job_id.to_string()))?;
        let skip = job.trace.len().saturating_sub(self.config.trace_limit);

        Ok(JobDebugView {
            job_id: job.job_id.clone(),
            status: job.status,
            created_at: job.created_at,
            lat: job.point.map(|p| p.lat),
            lon: job.point.map(|p| p.lon),
            acc: job.point.and_then(|p| p.accuracy_meters),
            user_text: job.user_text.clone(),
            has_image: job.image.is_some(),
            geo_context: job.geo_context.clone(),
            result: job.result.clone(),
            error: job.error.clone(),
            trace: job.trace[skip..].to_vec(),
        })
    }
}

/// Publishes geo stage progress into a job record
struct JobGeoObserver {
    store: Arc<JobStore>,
    job_id: String,
}

impl GeoObserver for JobGeoObserver {
    fn on_event(&self, event: &GeoEvent) {
        match event {
            GeoEvent::CacheHit { radius_m, pois } => {
                self.store.update_progress(&self.job_id, |p| p.pois_count = *pois);
                self.store
                    .trace(&self.job_id, "geo_cache", format!("hit radius={} pois={}", radius_m, pois));
            }
            GeoEvent::Reverse(reverse) => {
                let name = reverse.display_name.clone();
                let detail = name.clone().unwrap_or_else(|| "no result".to_string());
                self.store.update_progress(&self.job_id, |p| p.reverse = name);
                self.store.trace(&self.job_id, "reverse", detail);
            }
            GeoEvent::Pois { radius_m, count } => {
                self.store.update_progress(&self.job_id, |p| p.pois_count = *count);
                self.store
                    .trace(&self.job_id, "pois", format!("radius={} count={}", radius_m, count));
            }
            GeoEvent::ReverseFailed { error } => {
                self.store.trace(&self.job_id, "reverse_failed", error.clone());
            }
            GeoEvent::PoiFailed { radius_m, error } => {
                self.store
                    .trace(&self.job_id, "pois_failed", format!("radius={} {}", radius_m, error));
            }
            GeoEvent::BudgetExceeded { elapsed_ms } => {
                self.store
                    .trace(&self.job_id, "geo_budget", format!("exceeded after {}ms", elapsed_ms));
            }
        }
    }
}

// ============================================================================
// Scheduler
// ============================================================================

pub mod scheduler {
    use super::*;
    use crate::metrics::{self, Timer};
    use crate::photo_context::PhotoContextCache;
    use crate::pipeline::LocatePipeline;
    use crate::resource_manager::ResourceManager;

    /// Runs each job's pipeline on its own tokio task
    pub struct JobScheduler {
        store: Arc<JobStore>,
        pipeline: Arc<LocatePipeline>,
        resources: Arc<ResourceManager>,
        photo_contexts: Arc<PhotoContextCache>,
    }

    impl JobScheduler {
        pub fn new(
            store: Arc<JobStore>,
            pipeline: Arc<LocatePipeline>,
            resources: Arc<ResourceManager>,
            photo_contexts: Arc<PhotoContextCache>,
        ) -> Self {
            Self {
                store,
                pipeline,
                resources,
                photo_contexts,
            }
        }

        pub fn store(&self) -> &Arc<JobStore> {
            &self.store
        }

        /// Create the job and schedule it. Returns as soon as the record exists.
        pub fn submit(
            &self,
            image: ImageInput,
            point: Option<GeoPoint>,
            user_text: String,
            client_key: Option<String>,
        ) -> String {
            let job_id = self.store.create(image, point, user_text, client_key);

            let runner = JobRunner {
                store: self.store.clone(),
                pipeline: self.pipeline.clone(),
                resources: self.resources.clone(),
                photo_contexts: self.photo_contexts.clone(),
                job_id: job_id.clone(),
            };
            tokio::spawn(runner.run());

            info!(job_id = %job_id, "Locate job scheduled");
            job_id
        }
    }

    struct JobRunner {
        store: Arc<JobStore>,
        pipeline: Arc<LocatePipeline>,
        resources: Arc<ResourceManager>,
        photo_contexts: Arc<PhotoContextCache>,
        job_id: String,
    }

    impl JobRunner {
        async fn run(self) {
            let timer = Timer::new();
            match self.execute().await {
                Ok(result) => {
                    if let Some(key) = self.store.get(&self.job_id).and_then(|j| j.client_key) {
                        self.photo_contexts.set(&key, &result.photo_context);
                    }
                    self.store.complete(&self.job_id, result);
                    timer.observe_duration_seconds(&metrics::PIPELINE_LATENCY);
                    info!(job_id = %self.job_id, elapsed_ms = timer.elapsed_ms(), "Locate job done");
                }
                Err(e) => {
                    self.store.fail(&self.job_id, &e);
                    error!(
                        job_id = %self.job_id,
                        elapsed_ms = timer.elapsed_ms(),
                        "Locate job failed: {}",
                        e.detail()
                    );
                }
            }
        }

        async fn execute(&self) -> Result<Identification> {
            let _slot = self.resources.acquire_pipeline_slot().await?;
            let job = self
                .store
                .get(&self.job_id)
                .ok_or_else(|| LocateError::UnknownJob(self.job_id.clone()))?;

            self.store.advance(&self.job_id, JobStatus::Geo);
            let observer = JobGeoObserver {
                store: self.store.clone(),
                job_id: self.job_id.clone(),
            };
            let geo = self.pipeline.resolve_geo(job.point, &observer).await;
            if geo.is_none() {
                self.store.trace(&self.job_id, "geo", "skipped, no coordinates");
            }
            self.store.set_geo_context(&self.job_id, geo.clone());

            self.store.advance(&self.job_id, JobStatus::Openai);
            let image = self
                .store
                .take_image(&self.job_id)
                .ok_or_else(|| LocateError::Internal("image payload already consumed".to_string()))?;

            let outcome = self
                .pipeline
                .engine()
                .identify_detailed(&image, &job.user_text, geo.as_ref())
                .await?;
            match &outcome.repair {
                Some(RepairOutcome::Applied) => {
                    self.store.trace(&self.job_id, "openai_repair", "applied");
                }
                Some(RepairOutcome::Fallback(error)) => {
                    self.store
                        .trace(&self.job_id, "openai_repair", format!("kept first answer: {}", error));
                }
                None => {}
            }
            Ok(outcome.identification)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::vision::Candidate;

    fn store() -> (Arc<ManualClock>, JobStore) {
        let clock = Arc::new(ManualClock::default());
        let store = JobStore::new(
            JobConfig {
                ttl_secs: 900,
                trace_limit: 3,
            },
            clock.clone(),
        );
        (clock, store)
    }

    fn identification() -> Identification {
        Identification {
            photo_context: "stone arch".into(),
            candidates: (0..3)
                .map(|i| Candidate {
                    name: format!("Place {}", i),
                    why: "arch".into(),
                    confidence: 0.5,
                    search_query: "arch".into(),
                })
                .collect(),
        }
    }

    #[test]
    fn test_transitions_are_forward_only() {
        let (_, store) = store();
        let id = store.create(ImageInput::new(vec![1], "image/jpeg"), None, String::new(), None);

        assert!(!store.advance(&id, JobStatus::Openai));
        assert!(store.advance(&id, JobStatus::Geo));
        assert!(store.advance(&id, JobStatus::Openai));
        assert!(store.take_image(&id).is_some());
        assert!(store.take_image(&id).is_none());
        assert!(store.complete(&id, identification()));

        // Terminal states are final
        assert!(!store.advance(&id, JobStatus::Geo));
        assert!(!store.fail(&id, &LocateError::Internal("late".into())));
        assert_eq!(store.view(&id).unwrap().status(), JobStatus::Done);
    }

    #[test]
    fn test_failure_clears_image_and_reports_error() {
        let (_, store) = store();
        let id = store.create(ImageInput::new(vec![1, 2], "image/jpeg"), None, String::new(), None);
        store.advance(&id, JobStatus::Geo);
        store.fail(&id, &LocateError::ModelContractViolation("2 candidates".into()));

        let job = store.get(&id).unwrap();
        assert!(job.image.is_none());
        match store.view(&id).unwrap() {
            JobView::Failed { status, error } => {
                assert_eq!(status, JobStatus::Error);
                assert!(error.contains("2 candidates"));
            }
            other => panic!("unexpected view {:?}", other),
        }
    }

    #[test]
    fn test_view_wire_shapes() {
        let (_, store) = store();
        let id = store.create(ImageInput::new(vec![1], "image/jpeg"), None, String::new(), None);
        store.update_progress(&id, |p| {
            p.reverse = Some("Paris".into());
            p.pois_count = 4;
        });
        let json = serde_json::to_value(store.view(&id).unwrap()).unwrap();
        assert_eq!(json, serde_json::json!({"status": "pending", "reverse": "Paris", "poisCount": 4}));

        store.advance(&id, JobStatus::Geo);
        store.advance(&id, JobStatus::Openai);
        store.complete(&id, identification());
        let json = serde_json::to_value(store.view(&id).unwrap()).unwrap();
        assert_eq!(json["status"], "done");
        assert_eq!(json["photoContext"], "stone arch");
        assert_eq!(json["candidates"].as_array().unwrap().len(), 3);
    }

    #[test]
    fn test_sweep_and_debug_trace_limit() {
        let (clock, store) = store();
        let old = store.create(ImageInput::new(vec![1], "image/jpeg"), None, String::new(), None);
        for i in 0..5 {
            store.trace(&old, "step", format!("{}", i));
        }
        let debug = store.debug_view(&old).unwrap();
        assert_eq!(debug.trace.len(), 3);
        assert_eq!(debug.trace[2].detail, "4");

        clock.advance(Duration::from_secs(600));
        let fresh = store.create(ImageInput::new(vec![1], "image/jpeg"), None, String::new(), None);
        clock.advance(Duration::from_secs(301));

        assert_eq!(store.sweep(), 1);
        assert!(matches!(store.view(&old), Err(LocateError::UnknownJob(_))));
        assert!(store.view(&fresh).is_ok());
    }
}

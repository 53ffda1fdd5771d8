//! Resource Management Module
//!
//! Explicit limits for the two resources a locate request can inflate:
//! upload size and the number of pipelines talking to the model at once.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use crate::error::{LocateError, Result};

/// Process-wide resource limits
#[derive(Debug, Clone)]
pub struct ResourceLimits {
    /// Maximum accepted image upload in bytes
    pub max_image_bytes: usize,
    /// Maximum number of locate pipelines executing concurrently
    pub max_concurrent_jobs: usize,
}

impl Default for ResourceLimits {
    fn default() -> Self {
        Self {
            max_image_bytes: 10 * 1024 * 1024, // 10MB
            max_concurrent_jobs: 16,
        }
    }
}

#[derive(Debug, Default)]
struct ResourceMetrics {
    pipelines_in_flight: AtomicUsize,
}

/// Resource manager with automatic enforcement of limits
pub struct ResourceManager {
    limits: ResourceLimits,
    metrics: Arc<ResourceMetrics>,
    pipeline_semaphore: Arc<Semaphore>,
}

impl ResourceManager {
    pub fn new(limits: ResourceLimits) -> Self {
        let pipeline_semaphore = Arc::new(Semaphore::new(limits.max_concurrent_jobs.max(1)));

        Self {
            limits,
            metrics: Arc::new(ResourceMetrics::default()),
            pipeline_semaphore,
        }
    }

    pub fn limits(&self) -> &ResourceLimits {
        &self.limits
    }

    /// Wait for a pipeline slot. The guard is `'static` so it can move into a spawned task.
    pub async fn acquire_pipeline_slot(&self) -> Result<PipelineGuard> {
        let permit = Arc::clone(&self.pipeline_semaphore)
            .acquire_owned()
            .await
            .map_err(|e| LocateError::Internal(format!("Failed to acquire pipeline slot: {}", e)))?;

        self.metrics.pipelines_in_flight.fetch_add(1, Ordering::Relaxed);

        Ok(PipelineGuard {
            _permit: permit,
            metrics: self.metrics.clone(),
        })
    }

    /// Reject empty or oversized uploads
    pub fn check_image_size(&self, size: usize) -> Result<()> {
        if size == 0 {
            return Err(LocateError::InvalidInput("image is empty".to_string()));
        }
        if size > self.limits.max_image_bytes {
            return Err(LocateError::InvalidInput(format!(
                "image of {} bytes exceeds limit of {} bytes",
                size, self.limits.max_image_bytes
            )));
        }
        Ok(())
    }

    pub fn get_stats(&self) -> ResourceStats {
        ResourceStats {
            pipelines_in_flight: self.metrics.pipelines_in_flight.load(Ordering::Relaxed),
        }
    }
}

/// RAII guard that releases the pipeline slot on drop
pub struct PipelineGuard {
    _permit: OwnedSemaphorePermit,
    metrics: Arc<ResourceMetrics>,
}

impl Drop for PipelineGuard {
    fn drop(&mut self) {
        self.metrics.pipelines_in_flight.fetch_sub(1, Ordering::Relaxed);
    }
}

#[derive(Debug, Clone)]
pub struct ResourceStats {
    pub pipelines_in_flight: usize,
}

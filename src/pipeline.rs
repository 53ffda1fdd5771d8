//! Locate pipeline shared by the synchronous endpoint and the job runner
//!
//! Geo resolution always finishes, successfully or degraded, before the model
//! is invoked. Without coordinates no geo collaborator is touched.

use std::sync::Arc;
use tracing::info;

use crate::error::Result;
use crate::geo::{GeoContext, GeoContextBuilder, GeoObserver, GeoPoint, NoopObserver};
use crate::metrics::{self, Timer};
use crate::vision::{Identification, ImageInput, VisionEngine};

#[derive(Debug, Clone)]
pub struct LocateRequest {
    pub image: ImageInput,
    pub point: Option<GeoPoint>,
    pub user_text: String,
}

#[derive(Debug, Clone)]
pub struct LocateOutcome {
    pub geo: Option<GeoContext>,
    pub identification: Identification,
}

pub struct LocatePipeline {
    geo: Arc<GeoContextBuilder>,
    engine: Arc<VisionEngine>,
}

impl LocatePipeline {
    pub fn new(geo: Arc<GeoContextBuilder>, engine: Arc<VisionEngine>) -> Self {
        Self { geo, engine }
    }

    pub fn geo_builder(&self) -> &Arc<GeoContextBuilder> {
        &self.geo
    }

    pub fn engine(&self) -> &Arc<VisionEngine> {
        &self.engine
    }

    pub async fn resolve_geo(
        &self,
        point: Option<GeoPoint>,
        observer: &dyn GeoObserver,
    ) -> Option<GeoContext> {
        match point {
            Some(p) => Some(self.geo.build_with_observer(p.lat, p.lon, observer).await),
            None => None,
        }
    }

    pub async fn identify(
        &self,
        image: &ImageInput,
        user_text: &str,
        geo: Option<&GeoContext>,
    ) -> Result<Identification> {
        self.engine.identify(image, user_text, geo).await
    }

    /// Run both stages inline.
    pub async fn run(&self, request: &LocateRequest) -> Result<LocateOutcome> {
        let timer = Timer::new();
        let geo = self.resolve_geo(request.point, &NoopObserver).await;
        let geo_ms = timer.elapsed_ms();

        let identification = self
            .identify(&request.image, &request.user_text, geo.as_ref())
            .await?;
        timer.observe_duration_seconds(&metrics::PIPELINE_LATENCY);

        info!(
            geo_ms,
            elapsed_ms = timer.elapsed_ms(),
            with_location = geo.is_some(),
            "Locate pipeline complete"
        );
        Ok(LocateOutcome {
            geo,
            identification,
        })
    }
}

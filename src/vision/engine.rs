use std::sync::Arc;
use tracing::{info, warn};

use super::prompt::{identify_prompt, repair_prompt};
use super::schema::{identification_schema, parse_identification};
use super::{Candidate, Identification, ImageInput, ModelRequest, VisionModel};
use crate::error::Result;
use crate::geo::GeoContext;
use crate::metrics::{self, Timer};

/// Phrase a candidate's `why` must carry when it overrides the nearby places list
pub const CONFLICT_SENTINEL: &str = "coordinate conflict";

/// What became of the single repair call
#[derive(Debug, Clone, PartialEq)]
pub enum RepairOutcome {
    Applied,
    /// Repair failed; the first answer was kept. Carries the error detail.
    Fallback(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct IdentifyOutcome {
    pub identification: Identification,
    /// `None` when no repair was needed
    pub repair: Option<RepairOutcome>,
}

fn names_overlap(a: &str, b: &str) -> bool {
    let a = a.trim().to_lowercase();
    let b = b.trim().to_lowercase();
    if a.is_empty() || b.is_empty() {
        return false;
    }
    a.contains(&b) || b.contains(&a)
}

/// True when POIs were supplied and the answer neither uses one of them nor
/// declares a coordinate conflict.
pub fn needs_repair(geo: Option<&GeoContext>, candidates: &[Candidate]) -> bool {
    let pois = match geo {
        Some(geo) if geo.has_pois() => &geo.pois,
        _ => return false,
    };

    let grounded = candidates
        .iter()
        .any(|c| pois.iter().any(|p| names_overlap(&c.name, &p.name)));
    let conflict = candidates
        .iter()
        .any(|c| c.why.to_lowercase().contains(CONFLICT_SENTINEL));

    !grounded && !conflict
}

pub struct VisionEngine {
    model: Arc<dyn VisionModel>,
}

impl VisionEngine {
    pub fn new(model: Arc<dyn VisionModel>) -> Self {
        Self { model }
    }

    pub fn model(&self) -> &Arc<dyn VisionModel> {
        &self.model
    }

    async fn invoke(&self, purpose: &'static str, prompt: String, image: &ImageInput) -> Result<Identification> {
        metrics::MODEL_CALLS.with_label_values(&[purpose]).inc();
        let raw = self
            .model
            .generate(ModelRequest {
                purpose,
                prompt,
                image: Some(image.clone()),
                schema: Some(identification_schema()),
            })
            .await?;
        parse_identification(&raw)
    }

    /// Identify the place in `image`, re-querying once if the answer ignored the POIs.
    pub async fn identify(
        &self,
        image: &ImageInput,
        user_text: &str,
        geo: Option<&GeoContext>,
    ) -> Result<Identification> {
        self.identify_detailed(image, user_text, geo)
            .await
            .map(|outcome| outcome.identification)
    }

    /// Like `identify`, also reporting whether a repair was issued and how it ended.
    pub async fn identify_detailed(
        &self,
        image: &ImageInput,
        user_text: &str,
        geo: Option<&GeoContext>,
    ) -> Result<IdentifyOutcome> {
        let timer = Timer::new();
        let first = self
            .invoke("identify", identify_prompt(user_text, geo), image)
            .await?;

        let geo = match geo {
            Some(geo) if needs_repair(Some(geo), &first.candidates) => geo,
            _ => {
                info!(elapsed_ms = timer.elapsed_ms(), "Identification complete");
                return Ok(IdentifyOutcome {
                    identification: first,
                    repair: None,
                });
            }
        };

        warn!(
            pois = geo.pois.len(),
            "Answer ignored nearby places, issuing one repair call"
        );
        match self
            .invoke("repair", repair_prompt(user_text, geo), image)
            .await
        {
            Ok(repaired) => {
                metrics::MODEL_REPAIRS.with_label_values(&["applied"]).inc();
                info!(elapsed_ms = timer.elapsed_ms(), "Repair answer applied");
                Ok(IdentifyOutcome {
                    identification: repaired,
                    repair: Some(RepairOutcome::Applied),
                })
            }
            Err(e) => {
                metrics::MODEL_REPAIRS.with_label_values(&["fallback"]).inc();
                warn!(
                    elapsed_ms = timer.elapsed_ms(),
                    "Repair call failed, keeping original answer: {}",
                    e.detail()
                );
                Ok(IdentifyOutcome {
                    identification: first,
                    repair: Some(RepairOutcome::Fallback(e.detail())),
                })
            }
        }
    }
}

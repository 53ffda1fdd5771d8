//! Vision identification
//!
//! Grounded prompts, the structured-output model capability, answer validation
//! and the single evidence repair re-query.

pub mod engine;
pub mod openai;
pub mod prompt;
pub mod schema;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;

use crate::error::Result;

pub use engine::{needs_repair, IdentifyOutcome, RepairOutcome, VisionEngine, CONFLICT_SENTINEL};
pub use openai::OpenAiClient;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Candidate {
    pub name: String,
    pub why: String,
    pub confidence: f64,
    pub search_query: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Identification {
    pub photo_context: String,
    pub candidates: Vec<Candidate>,
}

/// Uploaded photo, shared between the primary and repair invocations
#[derive(Debug, Clone)]
pub struct ImageInput {
    pub bytes: Arc<Vec<u8>>,
    pub mime_type: String,
}

impl ImageInput {
    pub fn new(bytes: Vec<u8>, mime_type: impl Into<String>) -> Self {
        Self {
            bytes: Arc::new(bytes),
            mime_type: mime_type.into(),
        }
    }

    /// `data:` URL as accepted by the model's image input
    pub fn data_url(&self) -> String {
        use base64::Engine as _;
        format!(
            "data:{};base64,{}",
            self.mime_type,
            base64::engine::general_purpose::STANDARD.encode(self.bytes.as_slice())
        )
    }
}

/// Named JSON schema the answer must conform to
#[derive(Debug, Clone)]
pub struct OutputSchema {
    pub name: String,
    pub schema: Value,
}

#[derive(Debug, Clone)]
pub struct ModelRequest {
    /// Metric label: identify, repair, chat
    pub purpose: &'static str,
    pub prompt: String,
    pub image: Option<ImageInput>,
    pub schema: Option<OutputSchema>,
}

/// Vision-and-text generation capability: prompt, optional image and optional
/// output schema in, raw text (schema-conformant JSON when a schema is given) out.
#[async_trait]
pub trait VisionModel: Send + Sync {
    async fn generate(&self, request: ModelRequest) -> Result<String>;
}

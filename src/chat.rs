//! Follow-up chat about an identified place

use serde::Deserialize;
use std::sync::Arc;
use tracing::info;

use crate::error::{LocateError, Result};
use crate::metrics::{self, Timer};
use crate::vision::{ModelRequest, VisionModel};

const FACTS_KEYWORDS: &[&str] = &["facts", "guide", "history"];

const DEFAULT_FACTS_INSTRUCTION: &str = "Write a short visitor guide as bullet points:\n\
- What it is (one line)\n\
- History: 2-3 key facts with dates\n\
- Why it is worth visiting\n\
- One practical tip (best time, tickets or access)\n\
Keep it under 150 words and do not invent details you are unsure of.";

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatRequest {
    #[serde(default)]
    pub place: String,
    pub message: Option<String>,
    pub photo_context: Option<String>,
    pub facts_instruction: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChatMode {
    Facts,
    Question,
}

impl ChatMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChatMode::Facts => "facts",
            ChatMode::Question => "qa",
        }
    }
}

/// Absent, blank or a facts keyword (any case) selects facts mode.
pub fn chat_mode(message: Option<&str>) -> ChatMode {
    let message = message.map(str::trim).unwrap_or_default();
    if message.is_empty()
        || FACTS_KEYWORDS
            .iter()
            .any(|k| message.eq_ignore_ascii_case(k))
    {
        ChatMode::Facts
    } else {
        ChatMode::Question
    }
}

pub fn build_prompt(request: &ChatRequest, photo_context: Option<&str>) -> (ChatMode, String) {
    let place = request.place.trim();
    let mode = chat_mode(request.message.as_deref());

    let mut prompt = format!("Place: {}\n", place);
    if let Some(ctx) = photo_context.map(str::trim).filter(|c| !c.is_empty()) {
        prompt.push_str(&format!("What the user's photo shows: {}\n", ctx));
    }
    prompt.push('\n');

    match mode {
        ChatMode::Facts => {
            let instruction = request
                .facts_instruction
                .as_deref()
                .map(str::trim)
                .filter(|i| !i.is_empty())
                .unwrap_or(DEFAULT_FACTS_INSTRUCTION);
            prompt.push_str(instruction);
        }
        ChatMode::Question => {
            prompt.push_str("Answer the user's question about this place concisely and accurately. ");
            prompt.push_str("If you are not sure, say so.\n\nQuestion: ");
            prompt.push_str(request.message.as_deref().unwrap_or_default().trim());
        }
    }
    (mode, prompt)
}

pub struct ChatService {
    model: Arc<dyn VisionModel>,
}

impl ChatService {
    pub fn new(model: Arc<dyn VisionModel>) -> Self {
        Self { model }
    }

    /// `remembered_context` is used when the request itself carries no photo context.
    pub async fn reply(&self, request: &ChatRequest, remembered_context: Option<String>) -> Result<String> {
        if request.place.trim().is_empty() {
            return Err(LocateError::InvalidInput("Missing place".to_string()));
        }

        let photo_context = request
            .photo_context
            .clone()
            .filter(|c| !c.trim().is_empty())
            .or(remembered_context);
        let (mode, prompt) = build_prompt(request, photo_context.as_deref());
        metrics::CHAT_REQUESTS.with_label_values(&[mode.as_str()]).inc();
        metrics::MODEL_CALLS.with_label_values(&["chat"]).inc();

        let timer = Timer::new();
        let text = self
            .model
            .generate(ModelRequest {
                purpose: "chat",
                prompt,
                image: None,
                schema: None,
            })
            .await?;

        info!(
            mode = mode.as_str(),
            with_photo_context = photo_context.is_some(),
            elapsed_ms = timer.elapsed_ms(),
            "Chat reply generated"
        );
        Ok(text.trim().to_string())
    }
}

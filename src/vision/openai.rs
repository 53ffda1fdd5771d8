use async_trait::async_trait;
use serde_json::{json, Value};
use std::time::Duration;
use tracing::debug;

use super::{ModelRequest, VisionModel};
use crate::config::OpenAiConfig;
use crate::error::{LocateError, Result};
use crate::metrics::{self, Timer};
use crate::retry::{Backoff, RetryExecutor};

const SERVICE: &str = "openai";

/// Responses API client
pub struct OpenAiClient {
    http: reqwest::Client,
    config: OpenAiConfig,
    retry: RetryExecutor,
}

impl OpenAiClient {
    pub fn new(http: reqwest::Client, config: OpenAiConfig) -> Self {
        let retry = RetryExecutor::new(Backoff {
            max_attempts: config.max_attempts,
            base_delay_ms: 500,
            max_delay_ms: 4_000,
        });
        Self { http, config, retry }
    }

    fn request_body(&self, request: &ModelRequest) -> Value {
        let mut content = vec![json!({"type": "input_text", "text": request.prompt})];
        if let Some(image) = &request.image {
            content.push(json!({"type": "input_image", "image_url": image.data_url()}));
        }

        let mut body = json!({
            "model": self.config.model,
            "input": [{"role": "user", "content": content}],
        });
        if let Some(schema) = &request.schema {
            body["text"] = json!({
                "format": {
                    "type": "json_schema",
                    "name": schema.name,
                    "schema": schema.schema,
                    "strict": true
                }
            });
        }
        body
    }

    async fn send_once(&self, api_key: &str, body: &Value) -> Result<Value> {
        let url = format!("{}/responses", self.config.base_url.trim_end_matches('/'));
        let response = self
            .http
            .post(&url)
            .bearer_auth(api_key)
            .json(body)
            .timeout(Duration::from_millis(self.config.timeout_ms))
            .send()
            .await
            .map_err(|e| LocateError::from_reqwest(SERVICE, self.config.timeout_ms, e))?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(LocateError::upstream_status(SERVICE, status.as_u16(), &text));
        }
        response
            .json::<Value>()
            .await
            .map_err(|e| LocateError::from_reqwest(SERVICE, self.config.timeout_ms, e))
    }
}

/// Concatenate every `output_text` part of a Responses API payload.
pub fn extract_output_text(response: &Value) -> Result<String> {
    if let Some(text) = response.get("output_text").and_then(|t| t.as_str()) {
        return Ok(text.to_string());
    }

    let mut text = String::new();
    let mut refusal = None;
    let items = response
        .get("output")
        .and_then(|o| o.as_array())
        .map(|v| v.as_slice())
        .unwrap_or_default();
    for part in items
        .iter()
        .filter_map(|item| item.get("content").and_then(|c| c.as_array()))
        .flatten()
    {
        match part.get("type").and_then(|t| t.as_str()) {
            Some("output_text") => {
                if let Some(t) = part.get("text").and_then(|t| t.as_str()) {
                    text.push_str(t);
                }
            }
            Some("refusal") => {
                refusal = part.get("refusal").and_then(|r| r.as_str()).map(|s| s.to_string());
            }
            _ => {}
        }
    }

    if !text.is_empty() {
        return Ok(text);
    }
    match refusal {
        Some(reason) => Err(LocateError::ModelContractViolation(format!("model refused: {}", reason))),
        None => Err(LocateError::ModelContractViolation("model returned no output text".to_string())),
    }
}

#[async_trait]
impl VisionModel for OpenAiClient {
    async fn generate(&self, request: ModelRequest) -> Result<String> {
        let api_key = self
            .config
            .api_key
            .as_deref()
            .ok_or_else(|| LocateError::Internal("OPENAI_API_KEY is not configured".to_string()))?;

        let body = self.request_body(&request);
        let timer = Timer::new();
        let response = self
            .retry
            .execute(|| self.send_once(api_key, &body))
            .await
            .inspect_err(|e| metrics::record_upstream_failure(SERVICE, e))?;

        debug!(
            purpose = request.purpose,
            model = %self.config.model,
            elapsed_ms = timer.elapsed_ms(),
            "Model call complete"
        );
        extract_output_text(&response)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vision::{ImageInput, OutputSchema};

    fn client() -> OpenAiClient {
        OpenAiClient::new(
            reqwest::Client::new(),
            OpenAiConfig {
                api_key: Some("sk-test".into()),
                base_url: "http://localhost:1".into(),
                model: "gpt-4o-mini".into(),
                timeout_ms: 1_000,
                max_attempts: 1,
            },
        )
    }

    #[test]
    fn test_request_body_shape() {
        let request = ModelRequest {
            purpose: "identify",
            prompt: "where?".into(),
            image: Some(ImageInput::new(vec![1, 2, 3], "image/png")),
            schema: Some(OutputSchema {
                name: "s".into(),
                schema: json!({"type": "object"}),
            }),
        };
        let body = client().request_body(&request);
        assert_eq!(body["model"], "gpt-4o-mini");
        assert_eq!(body["input"][0]["content"][1]["image_url"], "data:image/png;base64,AQID");
        assert_eq!(body["text"]["format"]["strict"], true);
    }

    #[test]
    fn test_extract_output_text() {
        let response = json!({"output": [
            {"type": "reasoning", "summary": []},
            {"type": "message", "content": [{"type": "output_text", "text": "{\"a\":1}"}]}
        ]});
        assert_eq!(extract_output_text(&response).unwrap(), "{\"a\":1}");

        let refused = json!({"output": [{"content": [{"type": "refusal", "refusal": "no"}]}]});
        assert!(matches!(
            extract_output_text(&refused),
            Err(LocateError::ModelContractViolation(_))
        ));
    }
}

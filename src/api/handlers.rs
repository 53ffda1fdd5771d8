use axum::extract::{ConnectInfo, FromRequestParts, Multipart, State};
use axum::http::header::{CONTENT_TYPE, USER_AGENT};
use axum::http::request::Parts;
use axum::response::IntoResponse;
use axum::Json;
use serde::Deserialize;
use serde_json::{json, Value};
use std::convert::Infallible;
use std::net::SocketAddr;
use tracing::{info, warn};

use super::extract::{ApiJson, ApiMultipart, ApiQuery};
use super::ApiError;
use crate::chat::ChatRequest;
use crate::config::LocateMode;
use crate::geo::GeoPoint;
use crate::jobs::JobView;
use crate::metrics::{self, Timer};
use crate::photo_context::fingerprint;
use crate::pipeline::LocateRequest;
use crate::state_manager::AppState;
use crate::vision::ImageInput;
use crate::wiki::PlaceImage;

const DEFAULT_IMAGE_MIME: &str = "image/jpeg";

/// Best-effort client fingerprint for photo-context affinity
#[derive(Debug, Clone)]
pub struct ClientKey(pub String);

impl<S: Send + Sync> FromRequestParts<S> for ClientKey {
    type Rejection = Infallible;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let forwarded = parts
            .headers
            .get("x-forwarded-for")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.split(',').next())
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty());
        let addr = forwarded
            .or_else(|| {
                parts
                    .extensions
                    .get::<ConnectInfo<SocketAddr>>()
                    .map(|ConnectInfo(addr)| addr.ip().to_string())
            })
            .unwrap_or_else(|| "unknown".to_string());
        let user_agent = parts
            .headers
            .get(USER_AGENT)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default();

        Ok(ClientKey(fingerprint(&addr, user_agent)))
    }
}

#[derive(Debug, Default)]
struct LocateForm {
    image: Option<(Vec<u8>, String)>,
    message: String,
    lat: Option<String>,
    lon: Option<String>,
    accuracy_meters: Option<String>,
}

fn non_blank(value: String) -> Option<String> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

async fn read_form(mut multipart: Multipart) -> Result<LocateForm, ApiError> {
    let mut form = LocateForm::default();
    let bad = |e: axum::extract::multipart::MultipartError| {
        ApiError::BadRequest(format!("invalid multipart body: {}", e))
    };

    while let Some(field) = multipart.next_field().await.map_err(bad)? {
        let name = field.name().unwrap_or_default().to_string();
        match name.as_str() {
            "image" => {
                let mime = field
                    .content_type()
                    .filter(|m| m.starts_with("image/"))
                    .unwrap_or(DEFAULT_IMAGE_MIME)
                    .to_string();
                let bytes = field.bytes().await.map_err(bad)?;
                form.image = Some((bytes.to_vec(), mime));
            }
            "message" => form.message = field.text().await.map_err(bad)?,
            "lat" => form.lat = non_blank(field.text().await.map_err(bad)?),
            "lon" => form.lon = non_blank(field.text().await.map_err(bad)?),
            "accuracyMeters" => form.accuracy_meters = non_blank(field.text().await.map_err(bad)?),
            _ => {}
        }
    }
    Ok(form)
}

fn parse_point(form: &LocateForm) -> Result<Option<GeoPoint>, ApiError> {
    let parse = |field: &str, raw: &str| -> Result<f64, ApiError> {
        raw.parse::<f64>()
            .map_err(|_| ApiError::BadRequest(format!("invalid {}: {}", field, raw)))
    };
    match (&form.lat, &form.lon) {
        (None, None) => Ok(None),
        (Some(lat), Some(lon)) => {
            let accuracy = form
                .accuracy_meters
                .as_deref()
                .and_then(|a| a.parse::<f64>().ok());
            let point = GeoPoint::new(parse("lat", lat)?, parse("lon", lon)?, accuracy)?;
            Ok(Some(point))
        }
        _ => Err(ApiError::BadRequest("lat and lon must be supplied together".to_string())),
    }
}

/// `POST /api/locate`
pub async fn locate(
    State(state): State<AppState>,
    ClientKey(client_key): ClientKey,
    ApiMultipart(multipart): ApiMultipart,
) -> Result<Json<Value>, ApiError> {
    let form = read_form(multipart).await?;
    let point = parse_point(&form)?;
    let (bytes, mime) = form
        .image
        .ok_or_else(|| ApiError::BadRequest("Missing image".to_string()))?;
    state.resources.check_image_size(bytes.len())?;

    let image = ImageInput::new(bytes, mime);
    let user_text = form.message.trim().to_string();

    match state.locate_mode {
        LocateMode::Job => {
            metrics::LOCATE_REQUESTS.with_label_values(&["job"]).inc();
            let job_id = state
                .scheduler
                .submit(image, point, user_text, Some(client_key));
            Ok(Json(json!({ "jobId": job_id })))
        }
        LocateMode::Sync => {
            metrics::LOCATE_REQUESTS.with_label_values(&["sync"]).inc();
            let timer = Timer::new();
            let _slot = state
                .resources
                .acquire_pipeline_slot()
                .await
                .map_err(ApiError::pipeline)?;

            let request = LocateRequest {
                image,
                point,
                user_text,
            };
            let outcome = state.pipeline.run(&request).await.map_err(|e| {
                warn!(elapsed_ms = timer.elapsed_ms(), "Sync locate failed: {}", e.detail());
                ApiError::pipeline(e)
            })?;

            state
                .photo_contexts
                .set(&client_key, &outcome.identification.photo_context);
            Ok(Json(json!({ "candidates": outcome.identification.candidates })))
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct JobQuery {
    #[serde(rename = "jobId")]
    pub job_id: Option<String>,
}

/// `GET /api/locate_result?jobId=`
pub async fn locate_result(
    State(state): State<AppState>,
    ApiQuery(query): ApiQuery<JobQuery>,
) -> Result<Json<JobView>, ApiError> {
    let job_id = query
        .job_id
        .filter(|id| !id.trim().is_empty())
        .ok_or_else(|| ApiError::BadRequest("Missing jobId".to_string()))?;
    Ok(Json(state.jobs.view(job_id.trim())?))
}

/// `POST /api/chat`
pub async fn chat(
    State(state): State<AppState>,
    ClientKey(client_key): ClientKey,
    ApiJson(request): ApiJson<ChatRequest>,
) -> Result<Json<Value>, ApiError> {
    let remembered = state.photo_contexts.get(&client_key);
    let text = state
        .chat
        .reply(&request, remembered)
        .await
        .map_err(ApiError::pipeline)?;
    Ok(Json(json!({ "text": text })))
}

#[derive(Debug, Deserialize)]
pub struct PlaceImageQuery {
    pub q: Option<String>,
}

/// `GET /api/place_image?q=`
pub async fn place_image(
    State(state): State<AppState>,
    ApiQuery(query): ApiQuery<PlaceImageQuery>,
) -> Result<Json<PlaceImage>, ApiError> {
    let q = query.q.unwrap_or_default();
    let image = state.wiki.lookup(&q).await?;
    info!(query = %q.trim(), found = image.image_url.is_some(), "Place image served");
    Ok(Json(image))
}

/// `GET /health`
pub async fn health(State(state): State<AppState>) -> Json<Value> {
    Json(json!({ "ok": true, "ts": state.clock.now_ms() }))
}

/// `GET /metrics`
pub async fn metrics_handler() -> impl IntoResponse {
    (
        [(CONTENT_TYPE, "text/plain; version=0.0.4")],
        metrics::export_metrics(),
    )
}

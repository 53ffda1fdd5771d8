//! Operational endpoints, enabled only when `DEBUG_TOKEN` is configured
//! and the request carries it in `x-debug-token`.

use axum::extract::State;
use axum::http::HeaderMap;
use axum::Json;
use futures::future::join_all;
use serde::Deserialize;
use serde_json::{json, Value};

use super::extract::ApiQuery;
use super::ApiError;
use crate::geo::poi::normalize_elements;
use crate::geo::GeoPoint;
use crate::jobs::JobDebugView;
use crate::metrics::Timer;
use crate::retry::with_timeout;
use crate::state_manager::AppState;

pub const DEBUG_TOKEN_HEADER: &str = "x-debug-token";

fn tokens_match(expected: &str, given: &str) -> bool {
    expected.len() == given.len()
        && expected
            .bytes()
            .zip(given.bytes())
            .fold(0u8, |acc, (a, b)| acc | (a ^ b))
            == 0
}

fn authorize(state: &AppState, headers: &HeaderMap) -> Result<(), ApiError> {
    // Routes look absent unless a token is configured
    let Some(expected) = state.debug_token.as_deref() else {
        return Err(ApiError::NotFound("Not found".to_string()));
    };
    let given = headers
        .get(DEBUG_TOKEN_HEADER)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default();
    if tokens_match(expected, given) {
        Ok(())
    } else {
        Err(ApiError::Unauthorized)
    }
}

#[derive(Debug, Deserialize)]
pub struct GeoProbeQuery {
    pub lat: Option<f64>,
    pub lon: Option<f64>,
}

/// `GET /api/debug/geo?lat&lon`: call every provider directly, bypassing the cache.
pub async fn geo_probe(
    State(state): State<AppState>,
    headers: HeaderMap,
    query: Result<ApiQuery<GeoProbeQuery>, ApiError>,
) -> Result<Json<Value>, ApiError> {
    authorize(&state, &headers)?;
    let ApiQuery(query) = query?;
    let (lat, lon) = match (query.lat, query.lon) {
        (Some(lat), Some(lon)) => (lat, lon),
        _ => return Err(ApiError::BadRequest("lat and lon are required".to_string())),
    };
    let point = GeoPoint::new(lat, lon, None)?;
    let geo_config = state.pipeline.geo_builder().config();

    // Providers are probed concurrently, each under its own timeout
    let reverse = join_all(state.collaborators.geocoders.iter().map(|provider| async move {
        let timer = Timer::new();
        let result = with_timeout(provider.name(), provider.timeout(), provider.reverse(point.lat, point.lon)).await;
        match result {
            Ok(r) => json!({"provider": provider.name(), "ok": true, "ms": timer.elapsed_ms(), "result": r}),
            Err(e) => json!({"provider": provider.name(), "ok": false, "ms": timer.elapsed_ms(), "error": e.detail()}),
        }
    }))
    .await;

    let pois = join_all(state.collaborators.poi_endpoints.iter().map(|endpoint| async move {
        let timer = Timer::new();
        let result = with_timeout(
            endpoint.name(),
            endpoint.timeout(),
            endpoint.elements(point.lat, point.lon, geo_config.radius_m),
        )
        .await;
        match result {
            Ok(elements) => {
                let normalized = normalize_elements(point.lat, point.lon, &elements, geo_config.poi_cap);
                json!({
                    "endpoint": endpoint.name(),
                    "ok": true,
                    "ms": timer.elapsed_ms(),
                    "raw": elements.len(),
                    "pois": normalized,
                })
            }
            Err(e) => json!({"endpoint": endpoint.name(), "ok": false, "ms": timer.elapsed_ms(), "error": e.detail()}),
        }
    }))
    .await;

    Ok(Json(json!({
        "lat": point.lat,
        "lon": point.lon,
        "radiusM": geo_config.radius_m,
        "reverse": reverse,
        "overpass": pois,
    })))
}

/// `GET /api/debug/jobs`
pub async fn jobs(State(state): State<AppState>, headers: HeaderMap) -> Result<Json<Value>, ApiError> {
    authorize(&state, &headers)?;
    Ok(Json(json!({
        "state": state.snapshot(),
        "jobs": state.jobs.summaries(),
    })))
}

#[derive(Debug, Deserialize)]
pub struct DebugJobQuery {
    #[serde(rename = "jobId")]
    pub job_id: Option<String>,
}

/// `GET /api/debug/job?jobId=`
pub async fn job(
    State(state): State<AppState>,
    headers: HeaderMap,
    query: Result<ApiQuery<DebugJobQuery>, ApiError>,
) -> Result<Json<JobDebugView>, ApiError> {
    authorize(&state, &headers)?;
    let ApiQuery(query) = query?;
    let job_id = query
        .job_id
        .ok_or_else(|| ApiError::BadRequest("Missing jobId".to_string()))?;
    Ok(Json(state.jobs.debug_view(job_id.trim())?))
}

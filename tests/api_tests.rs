mod common;

use axum::body::Body;
use axum::http::header::{CONTENT_TYPE, USER_AGENT};
use axum::http::{Request, StatusCode};
use axum::Router;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tower::ServiceExt;

use common::{answer, app_state, osm_node, test_config, StubGeocoder, StubModel, StubPoiEndpoint};
use photo_locator::api::router;
use photo_locator::clock::{Clock, ManualClock};
use photo_locator::config::{Config, LocateMode};
use photo_locator::error::LocateError;
use photo_locator::geo::ReverseGeoResult;

const BOUNDARY: &str = "photo-locator-test-boundary";
const CLIENT_ADDR: &str = "203.0.113.7";
const CLIENT_UA: &str = "Mozilla/5.0 (test)";
const JPEG: &[u8] = &[0xff, 0xd8, 0xff, 0xe0, 0x00, 0x10, 0x4a, 0x46, 0x49, 0x46];

struct Harness {
    app: Router,
    geocoder: Arc<StubGeocoder>,
    endpoint: Arc<StubPoiEndpoint>,
    model: Arc<StubModel>,
    clock: Arc<ManualClock>,
}

fn harness(config: Config, answers: Vec<photo_locator::Result<String>>) -> Harness {
    let geocoder = StubGeocoder::new(Some(ReverseGeoResult {
        display_name: Some("Champ de Mars, Paris, France".into()),
        city: Some("Paris".into()),
        state: None,
        country: Some("France".into()),
    }));
    let endpoint = StubPoiEndpoint::new(Some(vec![
        osm_node("Eiffel Tower", 48.8583, 2.2944, &[("tourism", "attraction")]),
        osm_node("Champ de Mars", 48.8556, 2.2986, &[("leisure", "park")]),
    ]));
    let model = StubModel::new(answers);
    let clock = Arc::new(ManualClock::default());
    let state = app_state(&config, geocoder.clone(), endpoint.clone(), model.clone(), clock.clone());
    Harness {
        app: router(state),
        geocoder,
        endpoint,
        model,
        clock,
    }
}

fn eiffel_answer() -> String {
    answer(
        &[("Eiffel Tower", 0.92), ("Tokyo Tower", 0.04), ("Blackpool Tower", 0.04)],
        "wrought-iron lattice tower",
    )
}

fn multipart(fields: &[(&str, &str)], image: Option<&[u8]>) -> Vec<u8> {
    let mut body = Vec::new();
    for (name, value) in fields {
        body.extend_from_slice(
            format!(
                "--{}\r\nContent-Disposition: form-data; name=\"{}\"\r\n\r\n{}\r\n",
                BOUNDARY, name, value
            )
            .as_bytes(),
        );
    }
    if let Some(bytes) = image {
        body.extend_from_slice(
            format!(
                "--{}\r\nContent-Disposition: form-data; name=\"image\"; filename=\"photo.jpg\"\r\nContent-Type: image/jpeg\r\n\r\n",
                BOUNDARY
            )
            .as_bytes(),
        );
        body.extend_from_slice(bytes);
        body.extend_from_slice(b"\r\n");
    }
    body.extend_from_slice(format!("--{}--\r\n", BOUNDARY).as_bytes());
    body
}

fn locate_request(fields: &[(&str, &str)], image: Option<&[u8]>) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri("/api/locate")
        .header(CONTENT_TYPE, format!("multipart/form-data; boundary={}", BOUNDARY))
        .header("x-forwarded-for", CLIENT_ADDR)
        .header(USER_AGENT, CLIENT_UA)
        .body(Body::from(multipart(fields, image)))
        .unwrap()
}

fn chat_request(body: Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri("/api/chat")
        .header(CONTENT_TYPE, "application/json")
        .header("x-forwarded-for", CLIENT_ADDR)
        .header(USER_AGENT, CLIENT_UA)
        .body(Body::from(body.to_string()))
        .unwrap()
}

fn get(uri: &str) -> Request<Body> {
    Request::builder().uri(uri).body(Body::empty()).unwrap()
}

async fn send(app: &Router, request: Request<Body>) -> (StatusCode, Value) {
    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let body = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap_or(Value::Null)
    };
    (status, body)
}

// ============================================================================
// Health
// ============================================================================

#[tokio::test]
async fn test_health_reports_clock_time() {
    let h = harness(test_config(LocateMode::Sync), vec![]);
    let (status, body) = send(&h.app, get("/health")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, json!({"ok": true, "ts": h.clock.now_ms()}));
}

#[tokio::test]
async fn test_metrics_exposes_prometheus_text() {
    photo_locator::metrics::init_metrics();
    let h = harness(test_config(LocateMode::Sync), vec![]);

    let response = h.app.clone().oneshot(get("/metrics")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert!(response.headers()[CONTENT_TYPE]
        .to_str()
        .unwrap()
        .starts_with("text/plain"));
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let text = String::from_utf8(bytes.to_vec()).unwrap();
    assert!(text.contains("geo_cache_hits_total"));
}

// ============================================================================
// Sync locate and chat
// ============================================================================

#[tokio::test]
async fn test_sync_locate_eiffel_then_chat_facts() {
    let h = harness(
        test_config(LocateMode::Sync),
        vec![
            Ok(eiffel_answer()),
            Ok("- Built for the 1889 World's Fair\n- 330 m tall".to_string()),
        ],
    );

    let (status, body) = send(
        &h.app,
        locate_request(
            &[("lat", "48.8584"), ("lon", "2.2945"), ("accuracyMeters", "12"), ("message", "")],
            Some(JPEG),
        ),
    )
    .await;

    assert_eq!(status, StatusCode::OK, "{}", body);
    let candidates = body["candidates"].as_array().unwrap();
    assert_eq!(candidates.len(), 3);
    assert_eq!(candidates[0]["name"], "Eiffel Tower");
    assert_eq!(candidates[0]["searchQuery"], "Eiffel Tower");
    assert!(body.get("photoContext").is_none());

    let prompt = &h.model.prompts()[0];
    assert!(prompt.contains("Eiffel Tower"));
    assert!(prompt.contains("Champ de Mars, Paris, France"));
    assert_eq!(h.geocoder.calls(), 1);

    // Facts mode, photo context remembered from the locate call
    let (status, body) = send(&h.app, chat_request(json!({"place": "Eiffel Tower"}))).await;
    assert_eq!(status, StatusCode::OK, "{}", body);
    assert_eq!(body["text"], "- Built for the 1889 World's Fair\n- 330 m tall");

    let chat_prompt = &h.model.prompts()[1];
    assert!(chat_prompt.contains("Place: Eiffel Tower"));
    assert!(chat_prompt.contains("Wrought-iron lattice tower over a park"));
    assert!(chat_prompt.contains("visitor guide"));
    assert_eq!(h.model.purposes(), vec!["identify", "chat"]);
}

#[tokio::test]
async fn test_sync_locate_without_coordinates_makes_no_geo_calls() {
    let h = harness(test_config(LocateMode::Sync), vec![Ok(eiffel_answer())]);

    let (status, _) = send(&h.app, locate_request(&[("message", "on holiday")], Some(JPEG))).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!((h.geocoder.calls(), h.endpoint.calls()), (0, 0));
    let prompt = &h.model.prompts()[0];
    assert!(prompt.contains("No location is available"));
    assert!(prompt.contains("User note: on holiday"));
}

#[tokio::test]
async fn test_locate_rejects_bad_input() {
    let h = harness(test_config(LocateMode::Sync), vec![]);

    let (status, body) = send(&h.app, locate_request(&[("lat", "48.8")], None)).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body["error"].is_string());

    let (status, body) = send(&h.app, locate_request(&[("message", "hi")], None)).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body, json!({"error": "Missing image"}));

    let (status, _) = send(&h.app, locate_request(&[("lat", "123"), ("lon", "2.3")], Some(JPEG))).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, _) = send(&h.app, locate_request(&[("lat", "north"), ("lon", "2.3")], Some(JPEG))).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, _) = send(&h.app, locate_request(&[], Some(&[]))).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    // Nothing reached an upstream
    assert_eq!(h.model.calls(), 0);
    assert_eq!(h.geocoder.calls(), 0);
}

fn raw_post(uri: &str, content_type: &str, body: &'static str) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header(CONTENT_TYPE, content_type)
        .body(Body::from(body))
        .unwrap()
}

#[tokio::test]
async fn test_malformed_bodies_get_json_error_envelope() {
    let h = harness(test_config(LocateMode::Sync), vec![]);

    let cases = [
        raw_post("/api/chat", "application/json", "not json"),
        raw_post("/api/chat", "text/plain", r#"{"place":"Eiffel Tower"}"#),
        raw_post("/api/chat", "application/json", r#"{"place":5}"#),
        raw_post("/api/locate", "application/json", r#"{"lat":48.8}"#),
    ];
    for request in cases {
        let uri = request.uri().to_string();
        let (status, body) = send(&h.app, request).await;
        assert_eq!(status, StatusCode::BAD_REQUEST, "{}", uri);
        assert!(body["error"].is_string(), "{} -> {}", uri, body);
    }

    let (status, body) = send(&h.app, get("/api/locate_result?jobId=a&jobId=b")).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body["error"].is_string());

    assert_eq!(h.model.calls(), 0);
}

#[tokio::test]
async fn test_sync_locate_model_failure_is_500() {
    let h = harness(
        test_config(LocateMode::Sync),
        vec![Err(LocateError::upstream_status("openai", 503, "overloaded"))],
    );

    let (status, body) = send(&h.app, locate_request(&[], Some(JPEG))).await;
    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    assert!(body["error"].as_str().unwrap().contains("openai"));
}

#[tokio::test]
async fn test_chat_validation_and_question_mode() {
    let h = harness(test_config(LocateMode::Sync), vec![Ok("About 330 metres.".to_string())]);

    let (status, body) = send(&h.app, chat_request(json!({"place": "  "}))).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body, json!({"error": "Missing place"}));

    let (status, body) = send(
        &h.app,
        chat_request(json!({
            "place": "Eiffel Tower",
            "message": "How tall is it?",
            "photoContext": "tower at night"
        })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["text"], "About 330 metres.");
    let prompt = &h.model.prompts()[0];
    assert!(prompt.contains("Question: How tall is it?"));
    assert!(prompt.contains("tower at night"));
}

// ============================================================================
// Job mode
// ============================================================================

#[tokio::test]
async fn test_job_mode_locate_and_poll() {
    let h = harness(test_config(LocateMode::Job), vec![Ok(eiffel_answer())]);

    let (status, body) = send(
        &h.app,
        locate_request(&[("lat", "48.8584"), ("lon", "2.2945")], Some(JPEG)),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let job_id = body["jobId"].as_str().unwrap().to_string();

    let uri = format!("/api/locate_result?jobId={}", job_id);
    let done = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            let (status, body) = send(&h.app, get(&uri)).await;
            assert_eq!(status, StatusCode::OK);
            if body["status"] == "done" || body["status"] == "error" {
                return body;
            }
            assert!(body.get("poisCount").is_some(), "{}", body);
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("job finished");

    assert_eq!(done["status"], "done");
    assert_eq!(done["photoContext"], "Wrought-iron lattice tower over a park");
    assert_eq!(done["candidates"][0]["name"], "Eiffel Tower");
}

#[tokio::test]
async fn test_locate_result_errors() {
    let h = harness(test_config(LocateMode::Job), vec![]);

    let (status, body) = send(&h.app, get("/api/locate_result?jobId=nope")).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body, json!({"error": "Unknown jobId: nope"}));

    let (status, body) = send(&h.app, get("/api/locate_result")).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body, json!({"error": "Missing jobId"}));
}

// ============================================================================
// Place image
// ============================================================================

#[tokio::test]
async fn test_place_image_requires_query() {
    let h = harness(test_config(LocateMode::Sync), vec![]);
    let (status, body) = send(&h.app, get("/api/place_image?q=%20")).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body, json!({"error": "Missing q"}));
}

// ============================================================================
// Debug endpoints
// ============================================================================

#[tokio::test]
async fn test_debug_routes_hidden_without_token() {
    let h = harness(test_config(LocateMode::Job), vec![]);
    let (status, _) = send(&h.app, get("/api/debug/jobs")).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    let (status, _) = send(&h.app, get("/api/debug/geo?lat=north")).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_debug_routes_require_matching_token() {
    let mut config = test_config(LocateMode::Job);
    config.debug_token = Some("letmein".into());
    let h = harness(config, vec![Ok(eiffel_answer())]);

    let (status, _) = send(&h.app, get("/api/debug/jobs")).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    // Authorization is checked before the query is parsed
    let (status, _) = send(&h.app, get("/api/debug/geo?lat=north")).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    let wrong = Request::builder()
        .uri("/api/debug/jobs")
        .header("x-debug-token", "letmeout")
        .body(Body::empty())
        .unwrap();
    let (status, _) = send(&h.app, wrong).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    let (_, body) = send(&h.app, locate_request(&[], Some(JPEG))).await;
    let job_id = body["jobId"].as_str().unwrap().to_string();

    let authed = |uri: String| {
        Request::builder()
            .uri(uri)
            .header("x-debug-token", "letmein")
            .body(Body::empty())
            .unwrap()
    };

    let (status, body) = send(&h.app, authed("/api/debug/jobs".into())).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["state"]["locateMode"], "job");
    assert_eq!(body["jobs"][0]["jobId"], job_id.as_str());

    let (status, body) = send(&h.app, authed(format!("/api/debug/job?jobId={}", job_id))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["jobId"], job_id.as_str());
    assert!(body["trace"].as_array().is_some_and(|t| !t.is_empty()));

    let (status, body) = send(&h.app, authed("/api/debug/geo?lat=48.8584&lon=2.2945".into())).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["reverse"][0]["ok"], true);
    assert_eq!(body["overpass"][0]["pois"][0]["name"], "Eiffel Tower");
    // Provider calls bypass the geo cache
    assert_eq!(h.geocoder.calls(), 1);

    let (status, body) = send(&h.app, authed("/api/debug/geo?lat=north&lon=2.2945".into())).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body["error"].is_string());
}

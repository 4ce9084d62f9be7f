//! Integration tests for the broker
//!
//! These tests drive the full router (middleware included) with stubbed
//! rate, duration and dispatch collaborators: provider registration,
//! workload submission, failure mapping and access control.

use async_trait::async_trait;
use axum::{
    Router,
    body::{Body, to_bytes},
    http::{Request, StatusCode, header},
};
use serde_json::{Value, json};
use std::sync::Arc;
use tower::ServiceExt;
use uuid::Uuid;

use sidecompute::api::{MiddlewareConfig, create_router};
use sidecompute::broker::{InMemoryTaskStore, SelectorConfig};
use sidecompute::{
    BrokerApiState, BrokerService, ComputeProvider, DispatchError, DispatchReceipt, DispatchStage,
    Dispatcher, DurationEstimator, ProviderRegistry, RateLookup, SecurityState, Selector, TaskId,
    TaskStore, UpstreamError, WorkloadStore, build_app,
};

// ============================================================================
// Test Helpers
// ============================================================================

const BOUNDARY: &str = "sidecompute-test-boundary";

/// Rates keyed by postal code; 0 has no known location
struct ZipRates;

#[async_trait]
impl RateLookup for ZipRates {
    async fn rate(&self, postal_code: u32) -> Result<f64, UpstreamError> {
        match postal_code {
            2139 => Ok(0.10),
            94103 => Ok(0.30),
            other => Err(UpstreamError::UnknownLocation(other)),
        }
    }
}

/// Slower GPUs need two hours, faster ones one
struct ThroughputHours;

#[async_trait]
impl DurationEstimator for ThroughputHours {
    async fn estimate(&self, _: &str, throughput_flops: f64, _: u32) -> Result<f64, UpstreamError> {
        Ok(if throughput_flops < 2.0e13 { 2.0 } else { 1.0 })
    }
}

struct StubDispatcher {
    fail: bool,
}

#[async_trait]
impl Dispatcher for StubDispatcher {
    async fn dispatch(
        &self,
        provider: &ComputeProvider,
        task_id: &TaskId,
        _: &str,
    ) -> Result<DispatchReceipt, DispatchError> {
        if self.fail {
            return Err(DispatchError {
                provider_id: provider.id.to_string(),
                stage: DispatchStage::OpenSession,
                source: UpstreamError::Unreachable {
                    service: "provider",
                    message: "connection refused".to_string(),
                },
            });
        }
        Ok(DispatchReceipt {
            session_id: format!("sess-{}", task_id),
            run_id: "run-42".to_string(),
        })
    }
}

struct TestApp {
    router: Router,
    tasks: Arc<InMemoryTaskStore>,
}

async fn test_service(dispatch_fails: bool) -> (Arc<BrokerService>, Arc<InMemoryTaskStore>) {
    let tasks = Arc::new(InMemoryTaskStore::new());
    let workloads = WorkloadStore::open(
        std::env::temp_dir().join(format!("sidecompute-it-{}", Uuid::new_v4())),
    )
    .await
    .unwrap();

    let service = BrokerService::new(
        Arc::new(ProviderRegistry::new()),
        tasks.clone(),
        Selector::new(
            Arc::new(ZipRates),
            Arc::new(ThroughputHours),
            SelectorConfig::default(),
        ),
        Arc::new(StubDispatcher {
            fail: dispatch_fails,
        }),
        workloads,
    );

    (Arc::new(service), tasks)
}

async fn test_app(dispatch_fails: bool, security: MiddlewareConfig) -> TestApp {
    let (service, tasks) = test_service(dispatch_fails).await;
    TestApp {
        router: build_app(service, SecurityState::new(security)),
        tasks,
    }
}

async fn default_app() -> TestApp {
    test_app(false, MiddlewareConfig::default()).await
}

async fn send(router: &Router, request: Request<Body>) -> (StatusCode, Value) {
    let response = router.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let body = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap_or(Value::Null)
    };
    (status, body)
}

fn post_json(uri: &str, body: Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

fn get(uri: &str) -> Request<Body> {
    Request::builder().uri(uri).body(Body::empty()).unwrap()
}

fn submission(workload: &str, latest_time: &str, max_rate: Option<&str>) -> Request<Body> {
    let mut body = String::new();
    body.push_str(&format!(
        "--{BOUNDARY}\r\nContent-Disposition: form-data; name=\"file\"; filename=\"job.py\"\r\n\
         Content-Type: text/x-python\r\n\r\n{workload}\r\n"
    ));
    body.push_str(&format!(
        "--{BOUNDARY}\r\nContent-Disposition: form-data; name=\"latest-time\"\r\n\r\n{latest_time}\r\n"
    ));
    if let Some(rate) = max_rate {
        body.push_str(&format!(
            "--{BOUNDARY}\r\nContent-Disposition: form-data; name=\"max-rate\"\r\n\r\n{rate}\r\n"
        ));
    }
    body.push_str(&format!("--{BOUNDARY}--\r\n"));

    Request::builder()
        .method("POST")
        .uri("/api/task/add")
        .header(
            header::CONTENT_TYPE,
            format!("multipart/form-data; boundary={BOUNDARY}"),
        )
        .body(Body::from(body))
        .unwrap()
}

async fn register_provider(router: &Router, id: &str, flops: f64, power: u32, zip: u32) {
    let (status, _) = send(
        router,
        post_json(
            "/gpu_info",
            json!({
                "uuid": id,
                "host": format!("{}.example.com:8443", id),
                "auth": "provider-token",
                "flops": flops,
                "power": power,
            }),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    let (status, _) = send(
        router,
        post_json(
            "/api/compute/add",
            json!({ "uuid": id, "rpm": 0.01, "zip": zip }),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
}

// ============================================================================
// Registration
// ============================================================================

#[tokio::test]
async fn test_register_capability() {
    let app = default_app().await;

    let (status, body) = send(
        &app.router,
        post_json(
            "/gpu_info",
            json!({
                "uuid": "gpu-a",
                "host": "gpu-a.example.com:8443",
                "auth": "secret-token",
                "flops": "35.6e12",
                "power": 350,
            }),
        ),
    )
    .await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["success"], true);
    assert_eq!(body["provider"]["id"], "gpu-a");
    assert_eq!(body["provider"]["endpoint"], "https://gpu-a.example.com:8443");
    assert!(body["provider"].get("credential").is_none());
    assert!(body["provider"]["economics"].is_null());
}

#[tokio::test]
async fn test_register_missing_fields() {
    let app = default_app().await;

    let (status, body) = send(
        &app.router,
        post_json("/gpu_info", json!({ "uuid": "gpu-a", "host": "gpu-a.example.com" })),
    )
    .await;

    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["success"], false);
    let message = body["message"].as_str().unwrap();
    assert!(message.contains("Missing fields"));
    assert!(message.contains("auth"));
    assert!(message.contains("power"));
}

#[tokio::test]
async fn test_register_trailing_slash_route() {
    let app = default_app().await;

    let (status, _) = send(
        &app.router,
        post_json(
            "/gpu_info/",
            json!({
                "uuid": "gpu-a",
                "host": "gpu-a.example.com",
                "auth": "t",
                "flops": 1.0e13,
                "power": 300,
            }),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    let (status, body) = send(
        &app.router,
        post_json("/api/compute/add/", json!({ "uuid": "gpu-a", "rpm": "0.02", "zip": "02139" })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["provider"]["economics"]["postal_code"], 2139);
}

#[tokio::test]
async fn test_economics_for_unknown_provider_creates_nothing() {
    let app = default_app().await;

    let (status, body) = send(
        &app.router,
        post_json("/api/compute/add", json!({ "uuid": "ghost", "rpm": 0.01, "zip": 2139 })),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body["message"].as_str().unwrap().contains("ghost"));

    let (status, body) = send(&app.router, get("/api/compute")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["count"], 0);
}

#[tokio::test]
async fn test_get_unknown_provider_is_not_found() {
    let app = default_app().await;

    let (status, body) = send(&app.router, get("/api/compute/nope")).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["success"], false);
}

// ============================================================================
// Submission
// ============================================================================

#[tokio::test]
async fn test_submit_selects_cheapest_provider() {
    let app = default_app().await;
    // 300 W for 2 h at $0.10/kWh = $0.06
    register_provider(&app.router, "gpu-a", 1.0e13, 300, 2139).await;
    // 300 W for 1 h at $0.30/kWh = $0.09
    register_provider(&app.router, "gpu-b", 3.0e13, 300, 94103).await;

    let (status, body) = send(
        &app.router,
        submission("print('hello')", "2026-10-15T12:00:00Z", None),
    )
    .await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["success"], true);
    assert_eq!(body["provider_id"], "gpu-a");
    assert_eq!(body["run_id"], "run-42");
    assert_eq!(body["candidates_evaluated"], 2);
    let cost = body["estimate"]["cost"].as_f64().unwrap();
    assert!((cost - 0.06).abs() < 1e-9);

    let task_id = body["task_id"].as_str().unwrap().to_string();
    let (status, body) = send(&app.router, get(&format!("/api/task/{}", task_id))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["task"]["status"]["state"], "dispatched");
    assert_eq!(body["task"]["scheduled_time"], 0);
    assert_eq!(body["task"]["provider_id"], "gpu-a");
}

#[tokio::test]
async fn test_bare_router_accepts_submissions() {
    let (service, tasks) = test_service(false).await;
    let router = create_router(BrokerApiState { service });
    register_provider(&router, "gpu-a", 1.0e13, 300, 2139).await;

    let (status, body) = send(
        &router,
        submission("print('hello')", "2026-10-15T12:00:00Z", None),
    )
    .await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["provider_id"], "gpu-a");
    assert_eq!(tasks.count().await.unwrap(), 1);
}

#[tokio::test]
async fn test_submit_skips_failing_candidate() {
    let app = default_app().await;
    register_provider(&app.router, "nowhere", 1.0e13, 100, 0).await;
    register_provider(&app.router, "gpu-b", 3.0e13, 300, 94103).await;

    let (status, body) = send(
        &app.router,
        submission("print('hello')", "1792065600", None),
    )
    .await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["provider_id"], "gpu-b");
    assert_eq!(body["skipped"].as_array().unwrap().len(), 1);
    assert_eq!(body["skipped"][0]["provider_id"], "nowhere");
}

#[tokio::test]
async fn test_submit_with_no_eligible_provider() {
    let app = default_app().await;
    register_provider(&app.router, "nowhere", 1.0e13, 300, 0).await;

    let (status, body) = send(
        &app.router,
        submission("print('hello')", "2026-10-15T12:00:00Z", None),
    )
    .await;

    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(body["success"], false);
    assert_eq!(body["failures"][0]["provider_id"], "nowhere");
    assert_eq!(app.tasks.count().await.unwrap(), 0);
}

#[tokio::test]
async fn test_submit_with_empty_registry() {
    let app = default_app().await;

    let (status, _) = send(
        &app.router,
        submission("print('hello')", "2026-10-15T12:00:00Z", None),
    )
    .await;

    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(app.tasks.count().await.unwrap(), 0);
}

#[tokio::test]
async fn test_submit_respects_max_rate() {
    let app = default_app().await;
    register_provider(&app.router, "gpu-a", 1.0e13, 300, 2139).await;

    // Every provider asks 0.01/min, above the submitter's cap
    let (status, _) = send(
        &app.router,
        submission("print('hello')", "2026-10-15T12:00:00Z", Some("0.001")),
    )
    .await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
}

#[tokio::test]
async fn test_submit_dispatch_failure() {
    let app = test_app(true, MiddlewareConfig::default()).await;
    register_provider(&app.router, "gpu-a", 1.0e13, 300, 2139).await;

    let (status, body) = send(
        &app.router,
        submission("print('hello')", "2026-10-15T12:00:00Z", None),
    )
    .await;

    assert_eq!(status, StatusCode::BAD_GATEWAY);
    assert!(body["message"].as_str().unwrap().contains("gpu-a"));
    // The task is kept as failed, not discarded
    assert_eq!(app.tasks.count().await.unwrap(), 1);
}

#[tokio::test]
async fn test_submit_missing_latest_time() {
    let app = default_app().await;

    let body = format!(
        "--{BOUNDARY}\r\nContent-Disposition: form-data; name=\"file\"; filename=\"job.py\"\r\n\r\n\
         print(1)\r\n--{BOUNDARY}--\r\n"
    );
    let request = Request::builder()
        .method("POST")
        .uri("/api/task/add/")
        .header(
            header::CONTENT_TYPE,
            format!("multipart/form-data; boundary={BOUNDARY}"),
        )
        .body(Body::from(body))
        .unwrap();

    let (status, body) = send(&app.router, request).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body["message"].as_str().unwrap().contains("latest-time"));
}

#[tokio::test]
async fn test_get_task_with_bad_id() {
    let app = default_app().await;

    let (status, _) = send(&app.router, get("/api/task/not-a-uuid")).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, _) = send(&app.router, get(&format!("/api/task/{}", Uuid::new_v4()))).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

// ============================================================================
// Middleware
// ============================================================================

fn auth_config() -> MiddlewareConfig {
    MiddlewareConfig {
        enable_auth: true,
        api_keys: vec!["broker-key-123".to_string()],
        ..Default::default()
    }
}

#[tokio::test]
async fn test_health_is_public() {
    let app = test_app(false, auth_config()).await;

    let (status, body) = send(&app.router, get("/health")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ok");
}

#[tokio::test]
async fn test_auth_required_for_api() {
    let app = test_app(false, auth_config()).await;

    let (status, _) = send(&app.router, get("/api/compute")).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    let request = Request::builder()
        .uri("/api/compute")
        .header("x-api-key", "wrong")
        .body(Body::empty())
        .unwrap();
    let (status, _) = send(&app.router, request).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    let request = Request::builder()
        .uri("/api/compute")
        .header(header::AUTHORIZATION, "Bearer broker-key-123")
        .body(Body::empty())
        .unwrap();
    let (status, _) = send(&app.router, request).await;
    assert_eq!(status, StatusCode::OK);
}

#[tokio::test]
async fn test_rate_limit_and_security_headers() {
    let app = test_app(
        false,
        MiddlewareConfig {
            rate_limit_per_minute: 2,
            ..Default::default()
        },
    )
    .await;

    let response = app.router.clone().oneshot(get("/health")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.headers()["x-frame-options"], "DENY");
    assert_eq!(response.headers()["x-ratelimit-remaining"], "1");

    let (status, _) = send(&app.router, get("/health")).await;
    assert_eq!(status, StatusCode::OK);

    let response = app.router.clone().oneshot(get("/health")).await.unwrap();
    assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
    assert!(response.headers().contains_key("retry-after"));
}

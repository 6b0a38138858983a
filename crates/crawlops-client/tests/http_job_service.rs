use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use crawlops_client::{ApiError, BackoffPolicy, HttpClientConfig, HttpJobService, JobService};
use crawlops_core::{JobFilter, JobId, JobKind, JobSpec, JobStatus};
use serde_json::{json, Value};

#[derive(Clone, Default)]
struct MockState {
    hits: Arc<AtomicUsize>,
}

fn job_json(id: &str, status: &str) -> Value {
    json!({
        "id": id,
        "kind": "search",
        "status": status,
        "target": "12 Main St",
        "progress": 25.0,
        "current_step": "cache_check",
        "steps": [
            {"label": "input_analysis", "status": "done", "detail": "address"},
            {"label": "cache_check", "status": "running"}
        ],
        "created_at": "2026-02-24T12:00:00Z"
    })
}

async fn get_job(Path(id): Path<String>) -> Response {
    if id == "00000000-0000-0000-0000-000000000000" {
        return (StatusCode::NOT_FOUND, "no such job").into_response();
    }
    Json(job_json(&id, "running")).into_response()
}

async fn flaky_job(State(state): State<MockState>, Path(id): Path<String>) -> Response {
    if state.hits.fetch_add(1, Ordering::SeqCst) < 2 {
        return StatusCode::SERVICE_UNAVAILABLE.into_response();
    }
    Json(job_json(&id, "completed")).into_response()
}

async fn flaky_list(State(state): State<MockState>) -> Response {
    if state.hits.fetch_add(1, Ordering::SeqCst) < 2 {
        return StatusCode::SERVICE_UNAVAILABLE.into_response();
    }
    Json(json!([])).into_response()
}

async fn cancel_unavailable(State(state): State<MockState>) -> Response {
    state.hits.fetch_add(1, Ordering::SeqCst);
    StatusCode::BAD_GATEWAY.into_response()
}

async fn create_job(headers: HeaderMap, Json(spec): Json<JobSpec>) -> Response {
    let authorized = headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .map(|v| v == "Bearer secret-token")
        .unwrap_or(false);
    if !authorized {
        return StatusCode::UNAUTHORIZED.into_response();
    }
    if spec.job_type != JobKind::Crawl || spec.year != Some(2025) {
        return (StatusCode::UNPROCESSABLE_ENTITY, "unexpected spec").into_response();
    }
    Json(json!({"id": "7a1a3e44-77f4-4a55-9d1c-3f4f0a1d2b33"})).into_response()
}

async fn list_jobs(Query(params): Query<HashMap<String, String>>) -> Json<Value> {
    let status = params.get("status").cloned().unwrap_or_else(|| "pending".to_string());
    let limit: usize = params.get("limit").and_then(|v| v.parse().ok()).unwrap_or(1);
    let rows: Vec<Value> = (0..limit)
        .map(|i| {
            json!({
                "id": format!("7a1a3e44-77f4-4a55-9d1c-3f4f0a1d2b3{i}"),
                "kind": "crawl",
                "status": status,
                "target": "springfield",
                "created_at": "2026-02-24T12:00:00Z"
            })
        })
        .collect();
    Json(Value::Array(rows))
}

async fn spawn_mock(state: MockState) -> String {
    let app = Router::new()
        .route("/api/jobs", get(list_jobs).post(create_job))
        .route("/api/jobs/{id}", get(get_job))
        .route("/api/flaky/jobs", get(flaky_list))
        .route("/api/flaky/jobs/{id}", get(flaky_job))
        .route("/api/flaky/jobs/{id}/cancel", post(cancel_unavailable))
        .with_state(state);
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind mock server");
    let addr = listener.local_addr().expect("local addr");
    tokio::spawn(async move {
        axum::serve(listener, app).await.expect("mock server");
    });
    format!("http://{addr}/api")
}

fn client(base_url: String) -> HttpJobService {
    HttpJobService::new(HttpClientConfig {
        base_url,
        timeout: Duration::from_secs(5),
        user_agent: Some("crawlops-test".to_string()),
        api_token: Some("secret-token".to_string()),
        backoff: BackoffPolicy {
            max_retries: 2,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(5),
        },
    })
    .expect("client")
}

#[tokio::test]
async fn get_job_decodes_state_and_step_history() {
    let base = spawn_mock(MockState::default()).await;
    let id: JobId = "3f2b1c4d-0000-4000-8000-000000000001".parse().unwrap();
    let job = client(base).get_job(id).await.expect("job");
    assert_eq!(job.id, id);
    assert_eq!(job.status, JobStatus::Running);
    assert_eq!(job.steps.len(), 2);
    assert_eq!(job.steps[1].detail, "");
}

#[tokio::test]
async fn unknown_job_is_not_found() {
    let base = spawn_mock(MockState::default()).await;
    let err = client(base).get_job(JobId::nil()).await.unwrap_err();
    assert!(err.is_not_found(), "got {err:?}");
}

#[tokio::test]
async fn list_reads_are_retried_through_transient_failures() {
    let state = MockState::default();
    let base = spawn_mock(state.clone()).await;
    let svc = client(format!("{base}/flaky"));
    let rows = svc
        .list_jobs(&JobFilter::default())
        .await
        .expect("third attempt succeeds");
    assert!(rows.is_empty());
    assert_eq!(state.hits.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn polled_job_reads_surface_the_first_transient_failure() {
    let state = MockState::default();
    let base = spawn_mock(state.clone()).await;
    let svc = client(format!("{base}/flaky"));
    let id = JobId::new_v4();

    let err = svc.get_job(id).await.unwrap_err();
    assert!(err.is_transient(), "got {err:?}");
    assert_eq!(state.hits.load(Ordering::SeqCst), 1);

    svc.get_job(id).await.unwrap_err();
    let job = svc.get_job(id).await.expect("backend recovered");
    assert_eq!(job.status, JobStatus::Completed);
    assert_eq!(state.hits.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn mutations_are_sent_exactly_once() {
    let state = MockState::default();
    let base = spawn_mock(state.clone()).await;
    let svc = client(format!("{base}/flaky"));
    let err = svc.cancel_job(JobId::new_v4()).await.unwrap_err();
    assert!(matches!(err, ApiError::Transient(_)), "got {err:?}");
    assert_eq!(state.hits.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn create_job_forwards_spec_and_token() {
    let base = spawn_mock(MockState::default()).await;
    let spec = JobSpec {
        target: "springfield".to_string(),
        year: Some(2025),
        data_type: None,
        job_type: JobKind::Crawl,
        priority: Default::default(),
        source_file: None,
    };
    let id = client(base.clone()).create_job(&spec).await.expect("created");
    assert_eq!(id.to_string(), "7a1a3e44-77f4-4a55-9d1c-3f4f0a1d2b33");

    let anonymous = HttpJobService::new(HttpClientConfig {
        base_url: base,
        ..Default::default()
    })
    .unwrap();
    let err = anonymous.create_job(&spec).await.unwrap_err();
    assert!(err.is_not_found(), "unauthorized maps to not found, got {err:?}");
}

#[tokio::test]
async fn list_jobs_sends_filter_as_query() {
    let base = spawn_mock(MockState::default()).await;
    let rows = client(base)
        .list_jobs(&JobFilter {
            status: Some(JobStatus::Failed),
            kind: None,
            limit: Some(3),
        })
        .await
        .expect("rows");
    assert_eq!(rows.len(), 3);
    assert!(rows.iter().all(|r| r.status == JobStatus::Failed));
}

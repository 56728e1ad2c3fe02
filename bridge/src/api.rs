use crate::orchestrator::{ExceptionSource, Orchestrator, Summary};
use axum::extract::{Request, State};
use axum::http::{HeaderValue, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Serialize;
use std::sync::Arc;
use tokio::net::TcpListener;

#[derive(thiserror::Error, Debug)]
pub enum ApiError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Clone)]
pub struct AppState {
    pub orchestrator: Arc<Orchestrator>,
    pub source: Arc<dyn ExceptionSource>,
}

pub async fn serve(state: AppState, port: u16) -> Result<(), ApiError> {
    let app = router(state);
    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    tracing::info!(port, "listening");
    axum::serve(listener, app).await?;
    Ok(())
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/appget", get(appget))
        .route("/trigger", post(trigger))
        .fallback(not_found)
        .layer(middleware::from_fn(security_headers))
        .layer(middleware::from_fn(log_request))
        .with_state(state)
}

async fn log_request(request: Request, next: Next) -> Response {
    tracing::info!(
        method = %request.method(),
        path = request.uri().path(),
        "incoming request"
    );
    next.run(request).await
}

async fn security_headers(request: Request, next: Next) -> Response {
    let mut response = next.run(request).await;
    let headers = response.headers_mut();
    headers.insert("x-content-type-options", HeaderValue::from_static("nosniff"));
    headers.insert("x-frame-options", HeaderValue::from_static("DENY"));
    headers.insert("x-xss-protection", HeaderValue::from_static("1; mode=block"));
    headers.insert(
        "strict-transport-security",
        HeaderValue::from_static("max-age=31536000; includeSubDomains"),
    );
    response
}

fn now() -> String {
    chrono::Utc::now().to_rfc3339()
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
}

async fn health() -> Json<HealthResponse> {
    Json(HealthResponse { status: "healthy" })
}

#[derive(Serialize)]
struct ExceptionDetails {
    r#type: String,
    message: String,
    #[serde(rename = "customDimensions")]
    custom_dimensions: serde_json::Value,
}

#[derive(Serialize)]
struct ExceptionView {
    timestamp: String,
    #[serde(rename = "problemId")]
    problem_id: String,
    details: ExceptionDetails,
}

#[derive(Serialize)]
struct AppGetResponse {
    count: usize,
    exceptions: Vec<ExceptionView>,
    query_time: String,
}

#[derive(Serialize)]
struct AppGetError {
    error: String,
    count: usize,
    exceptions: Vec<ExceptionView>,
    query_time: String,
}

impl IntoResponse for AppGetError {
    fn into_response(self) -> Response {
        (StatusCode::INTERNAL_SERVER_ERROR, Json(self)).into_response()
    }
}

/// Run the telemetry query only. The query itself is fail-open, so the
/// error shape is reserved for the handler blowing up unexpectedly.
async fn appget(State(state): State<AppState>) -> Result<Json<AppGetResponse>, AppGetError> {
    let source = state.source.clone();
    let records = tokio::spawn(async move { source.recent_exceptions().await })
        .await
        .map_err(|err| {
            tracing::error!(error = %err, "appget handler failed");
            AppGetError {
                error: err.to_string(),
                count: 0,
                exceptions: Vec::new(),
                query_time: now(),
            }
        })?;

    let exceptions: Vec<ExceptionView> = records
        .into_iter()
        .map(|record| ExceptionView {
            timestamp: record.timestamp,
            problem_id: record.problem_id,
            details: ExceptionDetails {
                r#type: record.exception_type,
                message: record.message,
                custom_dimensions: record.custom_dimensions,
            },
        })
        .collect();

    Ok(Json(AppGetResponse {
        count: exceptions.len(),
        exceptions,
        query_time: now(),
    }))
}

#[derive(Serialize)]
struct TriggerResponse {
    status: &'static str,
    summary: Summary,
}

#[derive(Serialize)]
struct TriggerError {
    status: &'static str,
    error: String,
}

impl IntoResponse for TriggerError {
    fn into_response(self) -> Response {
        (StatusCode::INTERNAL_SERVER_ERROR, Json(self)).into_response()
    }
}

/// Run one full pass. Per-record failures are contained inside the pass;
/// only a pass that dies outright produces the error shape.
async fn trigger(State(state): State<AppState>) -> Result<Json<TriggerResponse>, TriggerError> {
    let orchestrator = state.orchestrator.clone();
    let summary = tokio::spawn(async move { orchestrator.run_pass().await })
        .await
        .map_err(|err| {
            tracing::error!(error = %err, "trigger pass failed");
            TriggerError {
                status: "error",
                error: err.to_string(),
            }
        })?;

    Ok(Json(TriggerResponse {
        status: "completed",
        summary,
    }))
}

#[derive(Serialize)]
struct NotFoundResponse {
    error: &'static str,
    timestamp: String,
}

async fn not_found() -> impl IntoResponse {
    (
        StatusCode::NOT_FOUND,
        Json(NotFoundResponse {
            error: "Endpoint not found",
            timestamp: now(),
        }),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::orchestrator::testutils::{FakeLedger, FakeSource, FakeTickets, record};
    use crate::telemetry::ExceptionRecord;
    use async_trait::async_trait;

    fn test_state(records: Vec<ExceptionRecord>) -> AppState {
        let source = Arc::new(FakeSource { records });
        AppState {
            orchestrator: Arc::new(Orchestrator::new(
                source.clone(),
                Arc::new(FakeTickets::default()),
                Arc::new(FakeLedger::default()),
            )),
            source,
        }
    }

    async fn spawn_server(state: AppState) -> String {
        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind test listener");
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router(state)).await.unwrap();
        });
        format!("http://{addr}")
    }

    #[tokio::test]
    async fn health_reports_healthy_with_security_headers() {
        let base = spawn_server(test_state(Vec::new())).await;

        let response = reqwest::get(format!("{base}/health")).await.unwrap();
        assert_eq!(response.status(), 200);
        assert_eq!(
            response.headers()["x-content-type-options"],
            "nosniff"
        );
        assert_eq!(response.headers()["x-frame-options"], "DENY");
        assert_eq!(
            response.headers()["strict-transport-security"],
            "max-age=31536000; includeSubDomains"
        );

        let body: serde_json::Value = response.json().await.unwrap();
        assert_eq!(body, serde_json::json!({"status": "healthy"}));
    }

    #[tokio::test]
    async fn appget_returns_projected_exceptions() {
        let base = spawn_server(test_state(vec![record("P1", "2024-01-01T00:00:00Z")])).await;

        let response = reqwest::get(format!("{base}/appget")).await.unwrap();
        assert_eq!(response.status(), 200);

        let body: serde_json::Value = response.json().await.unwrap();
        assert_eq!(body["count"], 1);
        assert_eq!(body["exceptions"][0]["problemId"], "P1");
        assert_eq!(body["exceptions"][0]["timestamp"], "2024-01-01T00:00:00Z");
        assert_eq!(
            body["exceptions"][0]["details"]["type"],
            "NullReferenceException"
        );
        assert_eq!(
            body["exceptions"][0]["details"]["customDimensions"]["environment"],
            "prod"
        );
        assert!(body["query_time"].is_string());
    }

    #[tokio::test]
    async fn trigger_runs_a_pass_and_reports_the_summary() {
        let base = spawn_server(test_state(vec![record("P1", "2024-01-01T00:00:00Z")])).await;
        let client = reqwest::Client::new();

        let response = client
            .post(format!("{base}/trigger"))
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), 200);

        let body: serde_json::Value = response.json().await.unwrap();
        assert_eq!(body["status"], "completed");
        assert_eq!(body["summary"]["total_exceptions"], 1);
        assert_eq!(body["summary"]["tickets_created"], 1);
        assert_eq!(body["summary"]["skipped"], 0);

        // Same pass again: the marker makes it a skip.
        let body: serde_json::Value = client
            .post(format!("{base}/trigger"))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(body["summary"]["tickets_created"], 0);
        assert_eq!(body["summary"]["skipped"], 1);
    }

    #[tokio::test]
    async fn unmatched_paths_get_the_not_found_shape() {
        let base = spawn_server(test_state(Vec::new())).await;

        let response = reqwest::get(format!("{base}/nope")).await.unwrap();
        assert_eq!(response.status(), 404);
        assert_eq!(response.headers()["x-frame-options"], "DENY");

        let body: serde_json::Value = response.json().await.unwrap();
        assert_eq!(body["error"], "Endpoint not found");
        assert!(body["timestamp"].is_string());
    }

    struct PanickingSource;

    #[async_trait]
    impl ExceptionSource for PanickingSource {
        async fn recent_exceptions(&self) -> Vec<ExceptionRecord> {
            panic!("handler blew up");
        }
    }

    #[tokio::test]
    async fn handler_panic_becomes_a_generic_500() {
        let source = Arc::new(PanickingSource);
        let state = AppState {
            orchestrator: Arc::new(Orchestrator::new(
                source.clone(),
                Arc::new(FakeTickets::default()),
                Arc::new(FakeLedger::default()),
            )),
            source,
        };
        let base = spawn_server(state).await;

        let response = reqwest::get(format!("{base}/appget")).await.unwrap();
        assert_eq!(response.status(), 500);
        let body: serde_json::Value = response.json().await.unwrap();
        assert_eq!(body["count"], 0);
        assert!(body["error"].is_string());

        let response = reqwest::Client::new()
            .post(format!("{base}/trigger"))
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), 500);
        let body: serde_json::Value = response.json().await.unwrap();
        assert_eq!(body["status"], "error");
    }
}

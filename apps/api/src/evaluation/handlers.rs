//! Axum route handlers for the Evaluation API.

use std::time::Duration;

use axum::{
    extract::{Query, State},
    http::header,
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::errors::AppError;
use crate::evaluation::models::EvaluationRequest;
use crate::evaluation::pipeline::{cancel_pair, CancelToken, RunFailure, RunStage};
use crate::evaluation::prompt_builder::TemplateId;
use crate::evaluation::report::{self, EvaluationRecord, OutputFormat};
use crate::state::AppState;

// ────────────────────────────────────────────────────────────────────────────
// Request / Response types
// ────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct EvaluateBody {
    #[serde(flatten)]
    pub request: EvaluationRequest,
    /// Overrides the template implied by the request.
    #[serde(default)]
    pub template: Option<TemplateId>,
}

#[derive(Debug, Deserialize)]
pub struct FormatQuery {
    pub format: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct BatchBody {
    pub requests: Vec<EvaluationRequest>,
}

#[derive(Debug, Serialize)]
pub struct FailureSummary {
    pub candidate_id: String,
    pub stage: RunStage,
    pub code: &'static str,
    pub message: String,
    pub completion_attempts: u32,
    pub parse_attempts: u32,
}

impl From<&RunFailure> for FailureSummary {
    fn from(f: &RunFailure) -> Self {
        Self {
            candidate_id: f.candidate_id.clone(),
            stage: f.stage,
            code: f.reason.code(),
            message: f.reason.to_string(),
            completion_attempts: f.completion_attempts,
            parse_attempts: f.parse_attempts,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct BatchResponse {
    pub records: Vec<EvaluationRecord>,
    pub failures: Vec<FailureSummary>,
    /// Markdown comparison of the batch, ranked by composite score.
    pub summary: String,
}

// ────────────────────────────────────────────────────────────────────────────
// Handlers
// ────────────────────────────────────────────────────────────────────────────

/// POST /api/v1/evaluations?format=json|markdown
///
/// Runs one candidate through the pipeline and returns the structured record
/// (json, default) or the human-readable document (markdown).
pub async fn handle_evaluate(
    State(state): State<AppState>,
    Query(query): Query<FormatQuery>,
    Json(body): Json<EvaluateBody>,
) -> Result<Response, AppError> {
    let format: OutputFormat = match query.format.as_deref() {
        Some(raw) => raw.parse()?,
        None => OutputFormat::default(),
    };
    validate_request(&body.request)?;

    let deadline = Deadline::start(state.config.run_timeout);
    let run = match body.template {
        Some(template) => {
            state
                .pipeline
                .run_with_template(&body.request, template, deadline.token())
                .await?
        }
        None => state.pipeline.run(&body.request, deadline.token()).await?,
    };

    let rendered = report::render(&run.result, format)?;
    Ok(([(header::CONTENT_TYPE, rendered.content_type)], rendered.body).into_response())
}

/// POST /api/v1/evaluations/batch
///
/// Evaluates several candidates concurrently. Individual failures do not fail
/// the batch; they are listed alongside the records.
pub async fn handle_evaluate_batch(
    State(state): State<AppState>,
    Json(body): Json<BatchBody>,
) -> Result<Json<BatchResponse>, AppError> {
    if body.requests.is_empty() {
        return Err(AppError::Validation("requests cannot be empty".to_string()));
    }
    for request in &body.requests {
        validate_request(request)?;
    }

    let deadline = Deadline::start(state.config.run_timeout);
    let outcomes = state
        .pipeline
        .run_batch(body.requests, deadline.token())
        .await;

    let (completed, failed): (Vec<_>, Vec<_>) = outcomes.into_iter().partition(Result::is_ok);
    let completed: Vec<_> = completed.into_iter().filter_map(Result::ok).collect();
    let failed: Vec<RunFailure> = failed.into_iter().filter_map(Result::err).collect();

    let results: Vec<_> = completed.iter().map(|run| &run.result).collect();
    let failure_refs: Vec<&RunFailure> = failed.iter().collect();
    let summary = report::batch_summary(&results, &failure_refs)?;
    info!(
        "Batch finished: {} evaluated, {} failed",
        completed.len(),
        failed.len()
    );

    Ok(Json(BatchResponse {
        records: completed.into_iter().map(|run| run.record).collect(),
        failures: failed.iter().map(FailureSummary::from).collect(),
        summary,
    }))
}

fn validate_request(request: &EvaluationRequest) -> Result<(), AppError> {
    if request.candidate_id.trim().is_empty() {
        return Err(AppError::Validation(
            "candidate_id cannot be empty".to_string(),
        ));
    }
    Ok(())
}

/// Cancels the run if it outlives `after`. The timer is stopped on drop.
struct Deadline {
    token: CancelToken,
    timer: JoinHandle<()>,
}

impl Deadline {
    fn start(after: Duration) -> Self {
        let (handle, token) = cancel_pair();
        let timer = tokio::spawn(async move {
            tokio::time::sleep(after).await;
            warn!("Evaluation exceeded {}s, cancelling", after.as_secs());
            handle.cancel();
        });
        Self { token, timer }
    }

    fn token(&self) -> &CancelToken {
        &self.token
    }
}

impl Drop for Deadline {
    fn drop(&mut self) {
        self.timer.abort();
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use tower::ServiceExt;

    use super::*;
    use crate::config::Config;
    use crate::evaluation::pipeline::{EvaluationSettings, Pipeline};
    use crate::llm_client::testing::{fast_retry, FixedBackend};
    use crate::llm_client::{BackendHandle, CompletionBackend, CompletionClient, CompletionStatus};
    use crate::routes::build_router;

    const REPLY: &str = r#"{"criteria": {
        "technical_skill": {"score": 90, "rationale": "Deep Rust knowledge."},
        "experience": {"score": 80, "rationale": "Eight years in backend roles."}
    }}"#;

    fn app(backend: Arc<dyn CompletionBackend>) -> axum::Router {
        let settings = EvaluationSettings {
            model_order: vec![backend.model_id().to_string()],
            retry: fast_retry(),
            ..EvaluationSettings::default()
        };
        let client = CompletionClient::new(vec![backend], settings.retry.clone(), BackendHandle::new(2));
        let pipeline = Pipeline::new(client, settings);
        build_router(AppState::new(pipeline, Config::default()))
    }

    fn post(uri: &str, body: serde_json::Value) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    async fn body_string(response: Response) -> String {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    fn candidate(id: &str) -> serde_json::Value {
        serde_json::json!({
            "candidate_id": id,
            "cv_text": "Rust engineer",
            "job_requirements": "Async Rust"
        })
    }

    #[tokio::test]
    async fn test_evaluate_returns_record() {
        let app = app(FixedBackend::new("primary", CompletionStatus::Ok, REPLY));
        let response = app
            .oneshot(post("/api/v1/evaluations", candidate("cand-1")))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()[header::CONTENT_TYPE], "application/json");

        let value: serde_json::Value = serde_json::from_str(&body_string(response).await).unwrap();
        assert_eq!(value["candidate_id"], "cand-1");
        assert_eq!(value["model_used"], "primary");
        assert_eq!(value["recommendation"], "strong-fit");
    }

    #[tokio::test]
    async fn test_evaluate_markdown() {
        let app = app(FixedBackend::new("primary", CompletionStatus::Ok, REPLY));
        let response = app
            .oneshot(post("/api/v1/evaluations?format=markdown", candidate("cand-2")))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let content_type = response.headers()[header::CONTENT_TYPE].to_str().unwrap().to_string();
        assert!(content_type.starts_with("text/markdown"));
        assert!(body_string(response)
            .await
            .contains("# Candidate Evaluation Report: cand-2"));
    }

    #[tokio::test]
    async fn test_unsupported_format_is_bad_request() {
        let backend = FixedBackend::new("primary", CompletionStatus::Ok, REPLY);
        let app = app(backend.clone());
        let response = app
            .oneshot(post("/api/v1/evaluations?format=pdf", candidate("cand-3")))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(backend.calls(), 0);
    }

    #[tokio::test]
    async fn test_exhausted_backends_map_to_bad_gateway() {
        let app = app(FixedBackend::new("primary", CompletionStatus::Refused, ""));
        let response = app
            .oneshot(post("/api/v1/evaluations", candidate("cand-4")))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
        let value: serde_json::Value = serde_json::from_str(&body_string(response).await).unwrap();
        assert_eq!(value["error"]["code"], "BACKEND_EXHAUSTED");
        assert_eq!(value["error"]["stage"], "requested");
    }

    #[tokio::test]
    async fn test_batch_lists_records_and_failures() {
        let app = app(FixedBackend::new("primary", CompletionStatus::Ok, REPLY));
        let body = serde_json::json!({
            "requests": [
                candidate("good"),
                {"candidate_id": "empty-cv", "cv_text": "", "job_requirements": "Async Rust"}
            ]
        });
        let response = app
            .oneshot(post("/api/v1/evaluations/batch", body))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let value: serde_json::Value = serde_json::from_str(&body_string(response).await).unwrap();
        assert_eq!(value["records"].as_array().unwrap().len(), 1);
        assert_eq!(value["records"][0]["candidate_id"], "good");
        assert_eq!(value["failures"][0]["candidate_id"], "empty-cv");
        assert_eq!(value["failures"][0]["code"], "TEMPLATE_ERROR");
        assert!(value["summary"].as_str().unwrap().contains("| 1 | good |"));
    }

    #[tokio::test]
    async fn test_empty_batch_is_rejected() {
        let app = app(FixedBackend::new("primary", CompletionStatus::Ok, REPLY));
        let response = app
            .oneshot(post(
                "/api/v1/evaluations/batch",
                serde_json::json!({"requests": []}),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_health() {
        let app = app(FixedBackend::new("primary", CompletionStatus::Ok, REPLY));
        let response = app
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let value: serde_json::Value = serde_json::from_str(&body_string(response).await).unwrap();
        assert_eq!(value["service"], "candidate-eval-api");
        assert_eq!(value["models"][0], "primary");
    }
}

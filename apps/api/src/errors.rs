use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

use crate::evaluation::pipeline::{FailureReason, RunFailure};
use crate::evaluation::report::ReportError;

/// Application-level error type.
/// Implements `IntoResponse` so Axum handlers can return `Result<T, AppError>`.
#[derive(Debug, Error)]
pub enum AppError {
    #[error("Validation error: {0}")]
    Validation(String),

    #[error(transparent)]
    Run(#[from] RunFailure),

    #[error(transparent)]
    Report(#[from] ReportError),
}

impl AppError {
    pub fn status(&self) -> StatusCode {
        match self {
            AppError::Validation(_) | AppError::Report(ReportError::UnsupportedFormat(_)) => {
                StatusCode::BAD_REQUEST
            }
            AppError::Report(_) => StatusCode::INTERNAL_SERVER_ERROR,
            AppError::Run(failure) => status_for_failure(&failure.reason),
        }
    }

    fn code(&self) -> &'static str {
        match self {
            AppError::Validation(_) => "VALIDATION_ERROR",
            AppError::Report(_) => "REPORT_ERROR",
            AppError::Run(failure) => failure.reason.code(),
        }
    }
}

pub fn status_for_failure(reason: &FailureReason) -> StatusCode {
    match reason {
        FailureReason::Template(_) => StatusCode::BAD_REQUEST,
        FailureReason::Unparseable(_) | FailureReason::InsufficientCriteria(_) => {
            StatusCode::UNPROCESSABLE_ENTITY
        }
        FailureReason::BackendExhausted(_) => StatusCode::BAD_GATEWAY,
        FailureReason::Cancelled => StatusCode::SERVICE_UNAVAILABLE,
        FailureReason::Aborted(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::error!("{self}");
        }

        let mut error = json!({
            "code": self.code(),
            "message": self.to_string(),
        });
        // The run's last-known state, so callers can decide whether to resubmit.
        if let AppError::Run(failure) = &self {
            error["candidate_id"] = json!(failure.candidate_id);
            error["stage"] = json!(failure.stage);
            error["completion_attempts"] = json!(failure.completion_attempts);
            error["parse_attempts"] = json!(failure.parse_attempts);
        }

        (status, Json(json!({ "error": error }))).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::evaluation::parser::ParseFailure;
    use crate::evaluation::pipeline::RunStage;

    fn run_failure(reason: FailureReason) -> AppError {
        AppError::Run(RunFailure {
            candidate_id: "cand".to_string(),
            stage: RunStage::Requested,
            reason,
            completion_attempts: 2,
            parse_attempts: 1,
        })
    }

    #[test]
    fn test_status_mapping() {
        assert_eq!(
            AppError::Validation("x".into()).status(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            run_failure(FailureReason::Cancelled).status(),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(
            run_failure(FailureReason::Unparseable(ParseFailure {
                missing: vec!["experience".into()]
            }))
            .status(),
            StatusCode::UNPROCESSABLE_ENTITY
        );
        assert_eq!(
            AppError::Report(ReportError::UnsupportedFormat("pdf".into())).status(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            AppError::Report(ReportError::Write(std::fmt::Error)).status(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[tokio::test]
    async fn test_envelope_carries_run_state() {
        let response = run_failure(FailureReason::Cancelled).into_response();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);

        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let value: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(value["error"]["code"], "CANCELLED");
        assert_eq!(value["error"]["stage"], "requested");
        assert_eq!(value["error"]["completion_attempts"], 2);
        assert!(value["error"]["message"]
            .as_str()
            .unwrap()
            .contains("run cancelled"));
    }
}

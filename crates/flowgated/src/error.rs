use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use flowgate_controlplane::OrchestratorError;

/// Request rejected before it reached the orchestrator
#[derive(Debug, thiserror::Error)]
#[error("{0}")]
struct BadRequest(String);

/// Error type of every handler
#[derive(Debug)]
pub struct AppError(pub anyhow::Error);

impl AppError {
    pub fn bad_request(msg: impl Into<String>) -> Self {
        Self(BadRequest(msg.into()).into())
    }
}

fn status_of(err: &OrchestratorError) -> StatusCode {
    match err {
        OrchestratorError::Conflict { .. } | OrchestratorError::TaskExecuting { .. } => {
            StatusCode::CONFLICT
        }
        OrchestratorError::InvalidState(_) => StatusCode::UNPROCESSABLE_ENTITY,
        OrchestratorError::NotFound(_) => StatusCode::NOT_FOUND,
        OrchestratorError::UnsupportedKind(_)
        | OrchestratorError::DependencyNotFound { .. }
        | OrchestratorError::ConstructionFailed(_)
        | OrchestratorError::Validation(_) => StatusCode::BAD_REQUEST,
        OrchestratorError::Store(_) | OrchestratorError::Engine(_) => {
            StatusCode::INTERNAL_SERVER_ERROR
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        if let Some(b) = self.0.downcast_ref::<BadRequest>() {
            let body = serde_json::json!({ "code": "bad_request", "message": b.0.clone() });
            return (StatusCode::BAD_REQUEST, axum::Json(body)).into_response();
        }

        let (status, body) = match self.0.downcast_ref::<OrchestratorError>() {
            Some(e) => {
                let mut body = serde_json::json!({
                    "code": e.error_code(),
                    "message": e.to_string(),
                });
                if let Some(owner) = e.owner_flow_id() {
                    body["owner_flow_id"] = serde_json::json!(owner);
                }
                (status_of(e), body)
            }
            None => (
                StatusCode::INTERNAL_SERVER_ERROR,
                serde_json::json!({ "code": "internal", "message": self.0.to_string() }),
            ),
        };

        if status.is_server_error() {
            tracing::error!(error = %self.0, "request failed");
        }
        (status, axum::Json(body)).into_response()
    }
}

impl<E> From<E> for AppError
where
    E: Into<anyhow::Error>,
{
    fn from(err: E) -> Self {
        Self(err.into())
    }
}

use axum::{Json, extract::State};
use flowgate_controlplane::ResourceStore;
use serde_json::Value;

use crate::error::AppError;
use crate::state::AppState;

/// GET /health
pub async fn health(State(app): State<AppState>) -> Result<Json<Value>, AppError> {
    let locks = app.store.list_locks().await?.len();
    Ok(Json(serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "locks": locks,
    })))
}

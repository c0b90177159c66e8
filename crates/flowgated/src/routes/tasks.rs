use axum::{
    Json,
    extract::{Path, State},
};
use flowgate_controlplane::TaskProgress;
use flowgate_core::TaskManagementId;

use crate::error::AppError;
use crate::state::AppState;

/// GET /tasks/{task_management_id}
pub async fn get_progress(
    State(app): State<AppState>,
    Path(task_management_id): Path<String>,
) -> Result<Json<TaskProgress>, AppError> {
    let progress = app
        .orchestrator
        .task_progress(&TaskManagementId::new(task_management_id))
        .await?;
    Ok(Json(progress))
}

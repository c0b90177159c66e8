pub mod flows;
pub mod health;
pub mod tasks;

use axum::{
    Router,
    routing::{get, post},
};

use crate::state::AppState;

/// HTTP surface of the orchestrator
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health::health))
        .route(
            "/resources/{res_type}/{res_id}/flows",
            post(flows::build_and_arm),
        )
        .route(
            "/resources/{res_type}/{res_id}/flows/{flow_id}",
            get(flows::get_relation),
        )
        .route(
            "/resources/{res_type}/{res_id}/flows/{flow_id}/terminate",
            post(flows::terminate),
        )
        .route(
            "/resources/{res_type}/{res_id}/flows/{flow_id}/actions/{action_id}/retry",
            post(flows::retry_action),
        )
        .route(
            "/resources/{res_type}/{res_id}/flows/{flow_id}/clone",
            post(flows::clone_flow),
        )
        .route(
            "/resources/{res_type}/{res_id}/unlock",
            post(flows::force_unlock),
        )
        .route("/tasks/{task_management_id}", get(tasks::get_progress))
        .with_state(state)
}

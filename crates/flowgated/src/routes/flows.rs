use axum::{
    Json,
    body::Bytes,
    extract::{Path, State},
    http::StatusCode,
};
use flowgate_controlplane::{
    ArmedFlow, BuildRequest, FlowRelationView, ForceUnlockOutcome, Phase,
};
use flowgate_core::{ActionId, FlowId, ResourceRef, ShareData, SubResources, TaskSource};
use serde::Deserialize;
use serde_json::Value;

use crate::error::AppError;
use crate::state::AppState;

// ---------------------------------------------------------------------------
// Build and arm
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct BuildBody {
    pub task_kind: String,
    #[serde(default)]
    pub scope: String,
    #[serde(default)]
    pub source: TaskSource,
    #[serde(default)]
    pub sub_resources: SubResources,
    pub phases: Vec<Phase>,
    #[serde(default)]
    pub settled_items: Vec<Value>,
    #[serde(default)]
    pub share_data: ShareData,
}

impl BuildBody {
    fn into_request(self, resource: ResourceRef) -> BuildRequest {
        let mut request = BuildRequest::new(resource, self.task_kind.as_str(), self.scope)
            .with_source(self.source)
            .with_sub_resources(self.sub_resources)
            .with_settled_items(self.settled_items);
        request.phases = self.phases;
        request.share_data = self.share_data;
        request
    }
}

/// POST /resources/{res_type}/{res_id}/flows
pub async fn build_and_arm(
    State(app): State<AppState>,
    Path((res_type, res_id)): Path<(String, String)>,
    Json(body): Json<BuildBody>,
) -> Result<(StatusCode, Json<ArmedFlow>), AppError> {
    if body.task_kind.is_empty() {
        return Err(AppError::bad_request("task_kind is required"));
    }
    let request = body.into_request(ResourceRef::new(res_id, res_type));
    let armed = app.orchestrator.build_and_arm_flow(request).await?;
    Ok((StatusCode::CREATED, Json(armed)))
}

// ---------------------------------------------------------------------------
// Relation
// ---------------------------------------------------------------------------

/// GET /resources/{res_type}/{res_id}/flows/{flow_id}
pub async fn get_relation(
    State(app): State<AppState>,
    Path((res_type, res_id, flow_id)): Path<(String, String, String)>,
) -> Result<Json<FlowRelationView>, AppError> {
    let view = app
        .orchestrator
        .get_flow_relation(&ResourceRef::new(res_id, res_type), &FlowId::new(flow_id))
        .await?;
    Ok(Json(view))
}

// ---------------------------------------------------------------------------
// Terminate / retry
// ---------------------------------------------------------------------------

/// POST /resources/{res_type}/{res_id}/flows/{flow_id}/terminate
pub async fn terminate(
    State(app): State<AppState>,
    Path((res_type, res_id, flow_id)): Path<(String, String, String)>,
) -> Result<(StatusCode, Json<Value>), AppError> {
    let flow_id = FlowId::new(flow_id);
    app.orchestrator
        .terminate_flow(&ResourceRef::new(res_id, res_type), &flow_id)
        .await?;
    Ok((
        StatusCode::ACCEPTED,
        Json(serde_json::json!({ "flow_id": flow_id, "requested": "terminate" })),
    ))
}

/// POST /resources/{res_type}/{res_id}/flows/{flow_id}/actions/{action_id}/retry
pub async fn retry_action(
    State(app): State<AppState>,
    Path((res_type, res_id, flow_id, action_id)): Path<(String, String, String, String)>,
) -> Result<(StatusCode, Json<Value>), AppError> {
    let flow_id = FlowId::new(flow_id);
    let action_id = ActionId::new(action_id);
    app.orchestrator
        .retry_sub_task(&ResourceRef::new(res_id, res_type), &flow_id, &action_id)
        .await?;
    Ok((
        StatusCode::ACCEPTED,
        Json(serde_json::json!({
            "flow_id": flow_id,
            "action_id": action_id,
            "requested": "retry",
        })),
    ))
}

// ---------------------------------------------------------------------------
// Clone
// ---------------------------------------------------------------------------

#[derive(Debug, Default, Deserialize)]
pub struct CloneBody {
    #[serde(default)]
    pub memo: Option<String>,
}

/// POST /resources/{res_type}/{res_id}/flows/{flow_id}/clone
///
/// The body is optional.
pub async fn clone_flow(
    State(app): State<AppState>,
    Path((res_type, res_id, flow_id)): Path<(String, String, String)>,
    body: Bytes,
) -> Result<(StatusCode, Json<ArmedFlow>), AppError> {
    let body: CloneBody = if body.is_empty() {
        CloneBody::default()
    } else {
        serde_json::from_slice(&body)
            .map_err(|e| AppError::bad_request(format!("invalid clone body: {e}")))?
    };
    let flow_id = FlowId::new(flow_id);

    // Clone only flows that belong to the addressed resource
    app.orchestrator
        .get_flow_relation(&ResourceRef::new(res_id, res_type), &flow_id)
        .await?;
    let armed = app.orchestrator.clone_flow(&flow_id, body.memo).await?;
    Ok((StatusCode::CREATED, Json(armed)))
}

// ---------------------------------------------------------------------------
// Force unlock
// ---------------------------------------------------------------------------

/// POST /resources/{res_type}/{res_id}/unlock
pub async fn force_unlock(
    State(app): State<AppState>,
    Path((res_type, res_id)): Path<(String, String)>,
) -> Result<Json<ForceUnlockOutcome>, AppError> {
    let outcome = app
        .orchestrator
        .force_unlock(&ResourceRef::new(res_id, res_type))
        .await?;
    Ok(Json(outcome))
}

//! Watcher flows
//!
//! Every armed flow gets a one-action watch flow. Its executor waits for the
//! primary flow's terminal state, then releases the resource lock, records the
//! relation status and settles the task. If the watcher cannot observe a
//! terminal state it fails and the lock stays held.

use crate::lock::ResourceLockManager;
use crate::task::TaskTracker;
use async_trait::async_trait;
use flowgate_core::{
    FlowId, RelationStatus, ResourceRef, RetryPolicy, ShareData, SubResources, TaskKind,
    TaskManagementId,
};
use flowgate_engine::{
    ActionContext, ActionExecutor, ActionOutcome, EngineError, ExecutorError, TemplateFlowSpec,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

/// Action kind of the watch template
pub const WATCH_ACTION_KIND: &str = "res_flow_watch";

/// Extra time the watch flow gets beyond its maximum wait
const WATCH_FLOW_MARGIN: Duration = Duration::from_secs(60);

/// Parameters of a watch action
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WatchParams {
    pub flow_id: FlowId,
    pub res_id: String,
    pub res_type: String,
    #[serde(default)]
    pub sub_res_ids: Vec<String>,
    #[serde(default)]
    pub sub_res_type: String,
    pub task_kind: TaskKind,
    pub task_management_id: TaskManagementId,
}

impl WatchParams {
    pub fn new(
        flow_id: FlowId,
        resource: &ResourceRef,
        sub_resources: &SubResources,
        task_kind: TaskKind,
        task_management_id: TaskManagementId,
    ) -> Self {
        Self {
            flow_id,
            res_id: resource.res_id.clone(),
            res_type: resource.res_type.clone(),
            sub_res_ids: sub_resources.ids.clone(),
            sub_res_type: sub_resources.res_type.clone(),
            task_kind,
            task_management_id,
        }
    }

    pub fn resource(&self) -> ResourceRef {
        ResourceRef::new(self.res_id.clone(), self.res_type.clone())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WatchOptions {
    pub poll_interval: Duration,
    /// Longest time a watcher waits for its flow
    pub max_wait: Duration,
    /// Retry policy of the release step
    pub retry: RetryPolicy,
}

impl Default for WatchOptions {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(500),
            max_wait: Duration::from_secs(24 * 60 * 60),
            retry: RetryPolicy::default(),
        }
    }
}

/// Template flow request for watching `params.flow_id`
pub fn watch_flow_spec(
    params: &WatchParams,
    options: &WatchOptions,
) -> Result<TemplateFlowSpec, serde_json::Error> {
    let mut share_data = ShareData::new();
    share_data.insert("watched_flow_id".into(), params.flow_id.to_string());
    share_data.insert("task_management_id".into(), params.task_management_id.to_string());

    Ok(TemplateFlowSpec {
        name: WATCH_ACTION_KIND.to_string(),
        share_data,
        kind: WATCH_ACTION_KIND.into(),
        params: serde_json::to_value(params)?,
        retry: options.retry,
        timeout: Some(options.max_wait.saturating_add(WATCH_FLOW_MARGIN)),
    })
}

/// Executor behind [`WATCH_ACTION_KIND`]
pub struct WatcherExecutor {
    locks: Arc<ResourceLockManager>,
    tasks: TaskTracker,
    options: WatchOptions,
}

impl WatcherExecutor {
    pub fn new(locks: Arc<ResourceLockManager>, tasks: TaskTracker, options: WatchOptions) -> Self {
        Self {
            locks,
            tasks,
            options,
        }
    }
}

#[async_trait]
impl ActionExecutor for WatcherExecutor {
    async fn execute(
        &self,
        ctx: &ActionContext,
        params: &serde_json::Value,
    ) -> Result<serde_json::Value, ExecutorError> {
        let params: WatchParams = serde_json::from_value(params.clone())
            .map_err(|e| ExecutorError::fatal(format!("invalid watch params: {e}")))?;

        tracing::debug!(
            flow_id = %params.flow_id,
            watch_flow_id = %ctx.flow_id,
            attempt = ctx.attempt,
            "watching flow"
        );
        let state = ctx
            .flows
            .wait_terminal(&params.flow_id, self.options.poll_interval, self.options.max_wait)
            .await
            .map_err(|e| match e {
                EngineError::WaitTimeout(_) | EngineError::FlowNotFound(_) => {
                    ExecutorError::fatal(e.to_string())
                }
                other => ExecutorError::retryable(other.to_string()),
            })?;

        let status = RelationStatus::from_terminal(state).ok_or_else(|| {
            ExecutorError::fatal(format!("flow {} reported non-terminal {state}", params.flow_id))
        })?;
        let resource = params.resource();

        let released = self
            .locks
            .release(&resource, &params.flow_id, status)
            .await
            .map_err(|e| ExecutorError::retryable(e.to_string()))?;
        self.tasks
            .finish_flow(&params.task_management_id, &params.flow_id, state)
            .await
            .map_err(|e| ExecutorError::retryable(e.to_string()))?;

        tracing::info!(
            flow_id = %params.flow_id,
            res_id = %params.res_id,
            res_type = %params.res_type,
            task_management_id = %params.task_management_id,
            state = %state,
            released,
            "watched flow finished"
        );
        Ok(serde_json::json!({
            "flow_id": params.flow_id,
            "state": state,
            "released": released,
        }))
    }

    async fn on_settled(&self, ctx: &ActionContext, outcome: &ActionOutcome) {
        if let ActionOutcome::Failed(error) = outcome {
            tracing::error!(
                watch_flow_id = %ctx.flow_id,
                error = %error,
                "watcher failed, resource lock kept until force-unlock or lookback expiry"
            );
        }
    }
}

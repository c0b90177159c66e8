//! Task management and task detail tracking

use crate::error::Result;
use crate::store::{ResourceStore, TaskDetailFilter, TaskDetailUpdate, TaskManagementUpdate};
use flowgate_core::{
    ActionId, FlowId, FlowState, TaskDetail, TaskDetailId, TaskDetailState, TaskKind,
    TaskManagement, TaskManagementId, TaskManagementState, TaskSource,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Counts of a task's detail rows by state
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskProgress {
    pub task_management_id: TaskManagementId,
    pub state: TaskManagementState,
    pub flow_ids: Vec<FlowId>,
    pub total: usize,
    pub init: usize,
    pub running: usize,
    pub success: usize,
    pub failed: usize,
}

/// Business-level progress ledger
#[derive(Clone)]
pub struct TaskTracker {
    store: Arc<dyn ResourceStore>,
}

impl TaskTracker {
    pub fn new(store: Arc<dyn ResourceStore>) -> Self {
        Self { store }
    }

    pub async fn create_management(
        &self,
        scope: &str,
        source: TaskSource,
        resource_type: &str,
        task_kind: &TaskKind,
    ) -> Result<TaskManagement> {
        let task = TaskManagement::new(scope, source, resource_type, task_kind.clone());
        self.store.create_task_management(task.clone()).await?;
        tracing::debug!(task_management_id = %task.id, scope, "task created");
        Ok(task)
    }

    /// One `Init` detail per unit of work, in input order
    pub async fn create_details(
        &self,
        task_management_id: &TaskManagementId,
        params: &[serde_json::Value],
    ) -> Result<Vec<TaskDetail>> {
        self.insert_details(task_management_id, params, TaskDetailState::Init)
            .await
    }

    /// Details for work that is already satisfied and never becomes an action
    pub async fn record_settled(
        &self,
        task_management_id: &TaskManagementId,
        params: &[serde_json::Value],
    ) -> Result<Vec<TaskDetail>> {
        self.insert_details(task_management_id, params, TaskDetailState::Success)
            .await
    }

    async fn insert_details(
        &self,
        task_management_id: &TaskManagementId,
        params: &[serde_json::Value],
        state: TaskDetailState,
    ) -> Result<Vec<TaskDetail>> {
        if params.is_empty() {
            return Ok(Vec::new());
        }
        let details: Vec<_> = params
            .iter()
            .map(|p| TaskDetail::new(task_management_id.clone(), p.clone()).with_state(state))
            .collect();
        self.store.create_task_details(details.clone()).await?;
        Ok(details)
    }

    /// Attach details to the flow and action that execute them and list the flow on the task
    pub async fn bind_flow(
        &self,
        task_management_id: &TaskManagementId,
        flow_id: &FlowId,
        assignments: Vec<(TaskDetailId, ActionId)>,
    ) -> Result<()> {
        let updates = assignments
            .into_iter()
            .map(|(detail, action)| {
                TaskDetailUpdate::new(detail).bind(flow_id.clone(), Some(action))
            })
            .collect();
        self.store.update_task_details(updates).await?;
        self.store
            .update_task_management(
                task_management_id,
                TaskManagementUpdate {
                    state: None,
                    add_flow_ids: vec![flow_id.clone()],
                },
            )
            .await?;
        Ok(())
    }

    /// Rollback: fail the task and every listed detail with `reason`
    pub async fn fail_construction(
        &self,
        task_management_id: &TaskManagementId,
        details: &[TaskDetailId],
        reason: &str,
    ) -> Result<()> {
        let updates = details
            .iter()
            .map(|id| {
                TaskDetailUpdate::new(id.clone())
                    .state(TaskDetailState::Failed)
                    .reason(reason)
            })
            .collect();
        let failed = self.store.update_task_details(updates).await?;
        self.set_state(task_management_id, TaskManagementState::Failed)
            .await?;
        tracing::warn!(
            task_management_id = %task_management_id,
            details = failed,
            reason,
            "task construction rolled back"
        );
        Ok(())
    }

    /// Move the details executed by an action to `Running`
    pub async fn mark_running(&self, flow_id: &FlowId, action_id: &ActionId) -> Result<usize> {
        self.advance_action(flow_id, action_id, TaskDetailState::Running, None)
            .await
    }

    /// Record an action's final outcome on its details
    pub async fn settle_action(
        &self,
        flow_id: &FlowId,
        action_id: &ActionId,
        outcome: std::result::Result<(), String>,
    ) -> Result<usize> {
        match outcome {
            Ok(()) => {
                self.advance_action(flow_id, action_id, TaskDetailState::Success, None)
                    .await
            }
            Err(reason) => {
                self.advance_action(flow_id, action_id, TaskDetailState::Failed, Some(reason))
                    .await
            }
        }
    }

    async fn advance_action(
        &self,
        flow_id: &FlowId,
        action_id: &ActionId,
        state: TaskDetailState,
        reason: Option<String>,
    ) -> Result<usize> {
        let details = self
            .store
            .list_task_details(&TaskDetailFilter {
                flow_id: Some(flow_id.clone()),
                action_id: Some(action_id.clone()),
                unsettled_only: true,
                ..Default::default()
            })
            .await?;
        let updates = details
            .into_iter()
            .map(|d| {
                let update = TaskDetailUpdate::new(d.id).state(state);
                match &reason {
                    Some(reason) => update.reason(reason.clone()),
                    None => update,
                }
            })
            .collect();
        let changed = self.store.update_task_details(updates).await?;
        tracing::debug!(
            flow_id = %flow_id,
            action_id = %action_id,
            state = %state,
            details = changed,
            "task details advanced"
        );
        Ok(changed)
    }

    /// Settle the task once its flow is terminal
    ///
    /// Details of the flow that never reached a final state are failed with a
    /// reason naming the flow's terminal state.
    pub async fn finish_flow(
        &self,
        task_management_id: &TaskManagementId,
        flow_id: &FlowId,
        state: FlowState,
    ) -> Result<()> {
        let leftovers = self
            .store
            .list_task_details(&TaskDetailFilter {
                flow_id: Some(flow_id.clone()),
                unsettled_only: true,
                ..Default::default()
            })
            .await?;
        if !leftovers.is_empty() {
            let reason = format!("flow {flow_id} ended {state} before this item completed");
            let updates = leftovers
                .into_iter()
                .map(|d| {
                    TaskDetailUpdate::new(d.id)
                        .state(TaskDetailState::Failed)
                        .reason(reason.clone())
                })
                .collect();
            self.store.update_task_details(updates).await?;
        }

        let task_state = if state == FlowState::Success {
            TaskManagementState::Success
        } else {
            TaskManagementState::Failed
        };
        self.set_state(task_management_id, task_state).await?;
        tracing::info!(
            task_management_id = %task_management_id,
            flow_id = %flow_id,
            state = %task_state,
            "task finished"
        );
        Ok(())
    }

    /// Copy the details of `source_flow` into `target` as fresh `Init` rows
    ///
    /// Each copy keeps its action id so it can be bound to the cloned flow.
    pub async fn clone_details(
        &self,
        source_flow: &FlowId,
        target: &TaskManagementId,
    ) -> Result<Vec<(TaskDetail, ActionId)>> {
        let source = self
            .store
            .list_task_details(&TaskDetailFilter {
                flow_id: Some(source_flow.clone()),
                ..Default::default()
            })
            .await?;

        let copies: Vec<_> = source
            .into_iter()
            .filter_map(|d| {
                let action_id = d.action_id?;
                Some((TaskDetail::new(target.clone(), d.param), action_id))
            })
            .collect();
        self.store
            .create_task_details(copies.iter().map(|(d, _)| d.clone()).collect())
            .await?;
        Ok(copies)
    }

    pub async fn get(&self, task_management_id: &TaskManagementId) -> Result<TaskManagement> {
        Ok(self.store.get_task_management(task_management_id).await?)
    }

    pub async fn find_by_flow(&self, flow_id: &FlowId) -> Result<Option<TaskManagement>> {
        Ok(self.store.find_task_management(flow_id).await?)
    }

    pub async fn details(&self, task_management_id: &TaskManagementId) -> Result<Vec<TaskDetail>> {
        Ok(self
            .store
            .list_task_details(&TaskDetailFilter {
                task_management_id: Some(task_management_id.clone()),
                ..Default::default()
            })
            .await?)
    }

    pub async fn progress(&self, task_management_id: &TaskManagementId) -> Result<TaskProgress> {
        let task = self.get(task_management_id).await?;
        let details = self.details(task_management_id).await?;

        let count = |state: TaskDetailState| details.iter().filter(|d| d.state == state).count();
        Ok(TaskProgress {
            task_management_id: task.id,
            state: task.state,
            flow_ids: task.flow_ids,
            total: details.len(),
            init: count(TaskDetailState::Init),
            running: count(TaskDetailState::Running),
            success: count(TaskDetailState::Success),
            failed: count(TaskDetailState::Failed),
        })
    }

    async fn set_state(
        &self,
        task_management_id: &TaskManagementId,
        state: TaskManagementState,
    ) -> Result<()> {
        self.store
            .update_task_management(
                task_management_id,
                TaskManagementUpdate {
                    state: Some(state),
                    add_flow_ids: Vec::new(),
                },
            )
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use serde_json::json;

    fn tracker() -> TaskTracker {
        TaskTracker::new(Arc::new(MemoryStore::new()))
    }

    #[tokio::test]
    async fn test_detail_lifecycle_and_progress() {
        let tasks = tracker();
        let tm = tasks
            .create_management("biz-1", TaskSource::Api, "LB", &TaskKind::new("add_rs"))
            .await
            .unwrap();
        let details = tasks
            .create_details(&tm.id, &[json!("rs-1"), json!("rs-2"), json!("rs-3")])
            .await
            .unwrap();
        tasks
            .record_settled(&tm.id, &[json!("rs-0")])
            .await
            .unwrap();

        let flow = FlowId::new("f1");
        tasks
            .bind_flow(
                &tm.id,
                &flow,
                vec![
                    (details[0].id.clone(), ActionId::new("a1")),
                    (details[1].id.clone(), ActionId::new("a1")),
                    (details[2].id.clone(), ActionId::new("a2")),
                ],
            )
            .await
            .unwrap();

        assert_eq!(tasks.mark_running(&flow, &ActionId::new("a1")).await.unwrap(), 2);
        tasks
            .settle_action(&flow, &ActionId::new("a1"), Ok(()))
            .await
            .unwrap();

        let progress = tasks.progress(&tm.id).await.unwrap();
        assert_eq!(progress.total, 4);
        assert_eq!(progress.success, 3);
        assert_eq!(progress.init, 1);
        assert_eq!(progress.flow_ids, vec![flow.clone()]);

        tasks
            .finish_flow(&tm.id, &flow, FlowState::Cancelled)
            .await
            .unwrap();
        let progress = tasks.progress(&tm.id).await.unwrap();
        assert_eq!(progress.state, TaskManagementState::Failed);
        assert_eq!(progress.failed, 1);

        let leftover = tasks
            .details(&tm.id)
            .await
            .unwrap()
            .into_iter()
            .find(|d| d.id == details[2].id)
            .unwrap();
        assert!(leftover.reason.unwrap().contains("cancelled"));
    }

    #[tokio::test]
    async fn test_fail_construction_marks_everything_failed() {
        let tasks = tracker();
        let tm = tasks
            .create_management("biz-1", TaskSource::Excel, "LB", &TaskKind::new("add_rs"))
            .await
            .unwrap();
        let details = tasks
            .create_details(&tm.id, &[json!(1), json!(2)])
            .await
            .unwrap();
        let ids: Vec<_> = details.iter().map(|d| d.id.clone()).collect();

        tasks
            .fail_construction(&tm.id, &ids, "payload rejected")
            .await
            .unwrap();

        let rows = tasks.details(&tm.id).await.unwrap();
        assert!(rows.iter().all(|d| d.state == TaskDetailState::Failed));
        assert!(rows.iter().all(|d| d.reason.as_deref() == Some("payload rejected")));
        assert_eq!(tasks.get(&tm.id).await.unwrap().state, TaskManagementState::Failed);
    }

    #[tokio::test]
    async fn test_clone_details_keeps_action_binding() {
        let tasks = tracker();
        let kind = TaskKind::new("add_rs");
        let source = tasks
            .create_management("biz-1", TaskSource::Api, "LB", &kind)
            .await
            .unwrap();
        let details = tasks.create_details(&source.id, &[json!("rs-1")]).await.unwrap();
        let flow = FlowId::new("f1");
        tasks
            .bind_flow(&source.id, &flow, vec![(details[0].id.clone(), ActionId::new("a1"))])
            .await
            .unwrap();

        let target = tasks
            .create_management("biz-1", TaskSource::Clone, "LB", &kind)
            .await
            .unwrap();
        let copies = tasks.clone_details(&flow, &target.id).await.unwrap();

        assert_eq!(copies.len(), 1);
        assert_eq!(copies[0].1, ActionId::new("a1"));
        assert_eq!(copies[0].0.state, TaskDetailState::Init);
        assert_eq!(copies[0].0.param, json!("rs-1"));
    }
}

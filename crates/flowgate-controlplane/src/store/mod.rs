//! Resource data store boundary
//!
//! The control plane persists locks, relations and task records through
//! [`ResourceStore`]. [`MemoryStore`] is the bundled implementation; it can
//! be snapshotted to a JSON state file with [`SnapshotFile`].

mod memory;
mod snapshot;

pub use memory::{MemoryStore, Tables};
pub use snapshot::SnapshotFile;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use flowgate_core::{
    ActionId, FlowId, RelationStatus, ResourceFlowLock, ResourceFlowRelation, ResourceRef,
    TaskDetail, TaskDetailId, TaskDetailState, TaskManagement, TaskManagementId,
    TaskManagementState,
};
use thiserror::Error;

/// Data store errors
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Resource {resource} is locked by flow {owner}")]
    LockHeld { resource: ResourceRef, owner: FlowId },

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("State file version {found} is newer than supported version {supported}")]
    VersionTooNew { found: u32, supported: u32 },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, StoreError>;

/// Relation query; unset fields match everything
#[derive(Debug, Clone, Default)]
pub struct RelationFilter {
    pub resource: Option<ResourceRef>,
    pub flow_id: Option<FlowId>,
    pub status: Option<RelationStatus>,
    pub created_after: Option<DateTime<Utc>>,
}

impl RelationFilter {
    pub fn matches(&self, relation: &ResourceFlowRelation) -> bool {
        self.resource.as_ref().is_none_or(|r| r == &relation.resource)
            && self.flow_id.as_ref().is_none_or(|f| f == &relation.flow_id)
            && self.status.is_none_or(|s| s == relation.status)
            && self.created_after.is_none_or(|t| relation.created_at >= t)
    }
}

#[derive(Debug, Clone, Default)]
pub struct TaskManagementUpdate {
    pub state: Option<TaskManagementState>,
    pub add_flow_ids: Vec<FlowId>,
}

/// Partial update of one detail row
#[derive(Debug, Clone)]
pub struct TaskDetailUpdate {
    pub id: TaskDetailId,
    pub flow_id: Option<FlowId>,
    pub action_id: Option<ActionId>,
    pub state: Option<TaskDetailState>,
    pub reason: Option<String>,
}

impl TaskDetailUpdate {
    pub fn new(id: TaskDetailId) -> Self {
        Self {
            id,
            flow_id: None,
            action_id: None,
            state: None,
            reason: None,
        }
    }

    pub fn bind(mut self, flow_id: FlowId, action_id: Option<ActionId>) -> Self {
        self.flow_id = Some(flow_id);
        self.action_id = action_id;
        self
    }

    pub fn state(mut self, state: TaskDetailState) -> Self {
        self.state = Some(state);
        self
    }

    pub fn reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }
}

#[derive(Debug, Clone, Default)]
pub struct TaskDetailFilter {
    pub task_management_id: Option<TaskManagementId>,
    pub flow_id: Option<FlowId>,
    pub action_id: Option<ActionId>,
    /// Only rows that are not yet `Success` or `Failed`
    pub unsettled_only: bool,
}

impl TaskDetailFilter {
    pub fn matches(&self, detail: &TaskDetail) -> bool {
        self.task_management_id
            .as_ref()
            .is_none_or(|id| id == &detail.task_management_id)
            && self
                .flow_id
                .as_ref()
                .is_none_or(|f| detail.flow_id.as_ref() == Some(f))
            && self
                .action_id
                .as_ref()
                .is_none_or(|a| detail.action_id.as_ref() == Some(a))
            && (!self.unsettled_only || !detail.state.is_terminal())
    }
}

/// Persistence consumed by the control plane
#[async_trait]
pub trait ResourceStore: Send + Sync {
    /// Insert the lock row and its `Executing` relation row in one step
    ///
    /// Fails with [`StoreError::LockHeld`] when the resource already has a lock.
    async fn lock_resource(&self, lock: ResourceFlowLock) -> Result<()>;

    async fn get_lock(&self, resource: &ResourceRef) -> Result<Option<ResourceFlowLock>>;

    /// Delete the lock if `owner` holds it and set `owner`'s relation to `status`
    ///
    /// Returns whether a lock row was deleted.
    async fn unlock_resource(
        &self,
        resource: &ResourceRef,
        owner: &FlowId,
        status: RelationStatus,
    ) -> Result<bool>;

    async fn list_locks(&self) -> Result<Vec<ResourceFlowLock>>;

    /// Matching relations, newest first
    async fn list_relations(&self, filter: &RelationFilter) -> Result<Vec<ResourceFlowRelation>>;

    async fn update_relation_status(
        &self,
        resource: &ResourceRef,
        flow_id: &FlowId,
        status: RelationStatus,
    ) -> Result<bool>;

    async fn create_task_management(&self, task: TaskManagement) -> Result<()>;

    async fn get_task_management(&self, id: &TaskManagementId) -> Result<TaskManagement>;

    /// Task that lists `flow_id` among its flows
    async fn find_task_management(&self, flow_id: &FlowId) -> Result<Option<TaskManagement>>;

    /// Apply `update`; a terminal task keeps its state
    async fn update_task_management(
        &self,
        id: &TaskManagementId,
        update: TaskManagementUpdate,
    ) -> Result<TaskManagement>;

    async fn create_task_details(&self, details: Vec<TaskDetail>) -> Result<()>;

    /// Apply updates, skipping state changes that would move a row backwards
    ///
    /// Returns the number of rows changed.
    async fn update_task_details(&self, updates: Vec<TaskDetailUpdate>) -> Result<usize>;

    async fn list_task_details(&self, filter: &TaskDetailFilter) -> Result<Vec<TaskDetail>>;
}

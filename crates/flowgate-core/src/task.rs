//! Business-level task records
//!
//! A [`TaskManagement`] is "the user asked for operation X". Its
//! [`TaskDetail`] rows are the individual units of work, each pointing at the
//! action that executes it. Both only move forward through their states.

use crate::ids::{ActionId, FlowId, TaskDetailId, TaskManagementId};
use crate::resource::TaskKind;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskManagementState {
    Running,
    Success,
    Failed,
}

impl TaskManagementState {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, TaskManagementState::Running)
    }
}

impl std::fmt::Display for TaskManagementState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TaskManagementState::Running => write!(f, "running"),
            TaskManagementState::Success => write!(f, "success"),
            TaskManagementState::Failed => write!(f, "failed"),
        }
    }
}

/// Where a task came from
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskSource {
    #[default]
    Api,
    /// Bulk upload
    Excel,
    Clone,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskManagement {
    pub id: TaskManagementId,
    /// Owning tenant or business unit
    pub scope: String,
    pub source: TaskSource,
    pub resource_type: String,
    pub task_kind: TaskKind,
    pub state: TaskManagementState,
    #[serde(default)]
    pub flow_ids: Vec<FlowId>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl TaskManagement {
    pub fn new(
        scope: impl Into<String>,
        source: TaskSource,
        resource_type: impl Into<String>,
        task_kind: TaskKind,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: TaskManagementId::generate(),
            scope: scope.into(),
            source,
            resource_type: resource_type.into(),
            task_kind,
            state: TaskManagementState::Running,
            flow_ids: Vec::new(),
            created_at: now,
            updated_at: now,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskDetailState {
    Init,
    Running,
    Success,
    Failed,
}

impl TaskDetailState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskDetailState::Success | TaskDetailState::Failed)
    }

    /// Forward-only ordering: `Init → Running → {Success | Failed}`
    pub fn can_advance_to(&self, target: TaskDetailState) -> bool {
        match self {
            TaskDetailState::Init => target != TaskDetailState::Init,
            TaskDetailState::Running => target.is_terminal(),
            TaskDetailState::Success | TaskDetailState::Failed => false,
        }
    }
}

impl std::fmt::Display for TaskDetailState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TaskDetailState::Init => write!(f, "init"),
            TaskDetailState::Running => write!(f, "running"),
            TaskDetailState::Success => write!(f, "success"),
            TaskDetailState::Failed => write!(f, "failed"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskDetail {
    pub id: TaskDetailId,
    pub task_management_id: TaskManagementId,
    #[serde(default)]
    pub flow_id: Option<FlowId>,
    #[serde(default)]
    pub action_id: Option<ActionId>,
    pub state: TaskDetailState,
    /// Parameter snapshot of the unit of work
    pub param: serde_json::Value,
    #[serde(default)]
    pub reason: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl TaskDetail {
    pub fn new(task_management_id: TaskManagementId, param: serde_json::Value) -> Self {
        let now = Utc::now();
        Self {
            id: TaskDetailId::generate(),
            task_management_id,
            flow_id: None,
            action_id: None,
            state: TaskDetailState::Init,
            param,
            reason: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn with_state(mut self, state: TaskDetailState) -> Self {
        self.state = state;
        self
    }
}

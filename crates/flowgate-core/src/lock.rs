//! Resource flow lock and relation records

use crate::flow::FlowState;
use crate::ids::FlowId;
use crate::resource::{ResourceRef, TaskKind};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Status stored on locks and relations
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RelationStatus {
    Executing,
    Success,
    Failed,
    Cancelled,
    TimedOut,
}

impl RelationStatus {
    /// Relation status mirroring a terminal flow state
    pub fn from_terminal(state: FlowState) -> Option<Self> {
        match state {
            FlowState::Success => Some(RelationStatus::Success),
            FlowState::Failed => Some(RelationStatus::Failed),
            FlowState::Cancelled => Some(RelationStatus::Cancelled),
            FlowState::TimedOut => Some(RelationStatus::TimedOut),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, RelationStatus::Executing)
    }

    /// Statuses a flow may be cloned from
    pub fn is_cloneable(&self) -> bool {
        matches!(
            self,
            RelationStatus::Success | RelationStatus::Cancelled | RelationStatus::TimedOut
        )
    }
}

impl std::fmt::Display for RelationStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RelationStatus::Executing => write!(f, "executing"),
            RelationStatus::Success => write!(f, "success"),
            RelationStatus::Failed => write!(f, "failed"),
            RelationStatus::Cancelled => write!(f, "cancelled"),
            RelationStatus::TimedOut => write!(f, "timed_out"),
        }
    }
}

/// The single live lock on a resource
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceFlowLock {
    pub resource: ResourceRef,
    /// Flow currently owning the resource
    pub owner: FlowId,
    pub task_kind: TaskKind,
    pub status: RelationStatus,
    pub created_at: DateTime<Utc>,
}

impl ResourceFlowLock {
    pub fn new(resource: ResourceRef, owner: FlowId, task_kind: TaskKind) -> Self {
        Self {
            resource,
            owner,
            task_kind,
            status: RelationStatus::Executing,
            created_at: Utc::now(),
        }
    }

    /// The relation row written together with this lock
    pub fn relation(&self) -> ResourceFlowRelation {
        ResourceFlowRelation {
            resource: self.resource.clone(),
            flow_id: self.owner.clone(),
            task_kind: self.task_kind.clone(),
            status: RelationStatus::Executing,
            created_at: self.created_at,
            updated_at: self.created_at,
        }
    }
}

/// Historical record of a flow touching a resource
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceFlowRelation {
    pub resource: ResourceRef,
    pub flow_id: FlowId,
    pub task_kind: TaskKind,
    pub status: RelationStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_terminal() {
        assert_eq!(
            RelationStatus::from_terminal(FlowState::TimedOut),
            Some(RelationStatus::TimedOut)
        );
        assert_eq!(RelationStatus::from_terminal(FlowState::Pending), None);
    }

    #[test]
    fn test_lock_relation_matches() {
        let lock = ResourceFlowLock::new(
            ResourceRef::new("lb-1", "LB"),
            FlowId::new("f1"),
            TaskKind::new("add_rs"),
        );
        let relation = lock.relation();
        assert_eq!(relation.flow_id, lock.owner);
        assert_eq!(relation.status, RelationStatus::Executing);
    }
}

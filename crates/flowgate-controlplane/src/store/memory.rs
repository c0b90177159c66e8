//! In-memory store

use super::{
    RelationFilter, ResourceStore, Result, StoreError, TaskDetailFilter, TaskDetailUpdate,
    TaskManagementUpdate,
};
use async_trait::async_trait;
use chrono::Utc;
use flowgate_core::{
    FlowId, RelationStatus, ResourceFlowLock, ResourceFlowRelation, ResourceRef, TaskDetail,
    TaskManagement, TaskManagementId,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tokio::sync::RwLock;

/// Every table held by [`MemoryStore`]
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Tables {
    /// Locks indexed by `res_type:res_id`
    #[serde(default)]
    pub locks: BTreeMap<String, ResourceFlowLock>,

    /// Append-only, oldest first
    #[serde(default)]
    pub relations: Vec<ResourceFlowRelation>,

    #[serde(default)]
    pub task_managements: BTreeMap<String, TaskManagement>,

    #[serde(default)]
    pub task_details: BTreeMap<String, TaskDetail>,
}

/// [`ResourceStore`] keeping every table behind one async lock
#[derive(Debug, Default)]
pub struct MemoryStore {
    tables: RwLock<Tables>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_tables(tables: Tables) -> Self {
        Self {
            tables: RwLock::new(tables),
        }
    }

    /// Copy of every table
    pub async fn snapshot(&self) -> Tables {
        self.tables.read().await.clone()
    }
}

#[async_trait]
impl ResourceStore for MemoryStore {
    async fn lock_resource(&self, lock: ResourceFlowLock) -> Result<()> {
        let key = lock.resource.key();
        let mut tables = self.tables.write().await;
        if let Some(existing) = tables.locks.get(&key) {
            return Err(StoreError::LockHeld {
                resource: lock.resource.clone(),
                owner: existing.owner.clone(),
            });
        }
        tables.relations.push(lock.relation());
        tables.locks.insert(key, lock);
        Ok(())
    }

    async fn get_lock(&self, resource: &ResourceRef) -> Result<Option<ResourceFlowLock>> {
        Ok(self.tables.read().await.locks.get(&resource.key()).cloned())
    }

    async fn unlock_resource(
        &self,
        resource: &ResourceRef,
        owner: &FlowId,
        status: RelationStatus,
    ) -> Result<bool> {
        let key = resource.key();
        let mut tables = self.tables.write().await;

        let owned = tables
            .locks
            .get(&key)
            .is_some_and(|lock| &lock.owner == owner);
        if owned {
            tables.locks.remove(&key);
        }

        let now = Utc::now();
        for relation in tables
            .relations
            .iter_mut()
            .filter(|r| &r.resource == resource && &r.flow_id == owner)
        {
            relation.status = status;
            relation.updated_at = now;
        }
        Ok(owned)
    }

    async fn list_locks(&self) -> Result<Vec<ResourceFlowLock>> {
        Ok(self.tables.read().await.locks.values().cloned().collect())
    }

    async fn list_relations(&self, filter: &RelationFilter) -> Result<Vec<ResourceFlowRelation>> {
        Ok(self
            .tables
            .read()
            .await
            .relations
            .iter()
            .rev()
            .filter(|r| filter.matches(r))
            .cloned()
            .collect())
    }

    async fn update_relation_status(
        &self,
        resource: &ResourceRef,
        flow_id: &FlowId,
        status: RelationStatus,
    ) -> Result<bool> {
        let mut tables = self.tables.write().await;
        let now = Utc::now();
        let mut updated = false;
        for relation in tables
            .relations
            .iter_mut()
            .filter(|r| &r.resource == resource && &r.flow_id == flow_id)
        {
            relation.status = status;
            relation.updated_at = now;
            updated = true;
        }
        Ok(updated)
    }

    async fn create_task_management(&self, task: TaskManagement) -> Result<()> {
        self.tables
            .write()
            .await
            .task_managements
            .insert(task.id.as_str().to_string(), task);
        Ok(())
    }

    async fn get_task_management(&self, id: &TaskManagementId) -> Result<TaskManagement> {
        self.tables
            .read()
            .await
            .task_managements
            .get(id.as_str())
            .cloned()
            .ok_or_else(|| StoreError::NotFound(format!("task management {id}")))
    }

    async fn find_task_management(&self, flow_id: &FlowId) -> Result<Option<TaskManagement>> {
        Ok(self
            .tables
            .read()
            .await
            .task_managements
            .values()
            .find(|tm| tm.flow_ids.contains(flow_id))
            .cloned())
    }

    async fn update_task_management(
        &self,
        id: &TaskManagementId,
        update: TaskManagementUpdate,
    ) -> Result<TaskManagement> {
        let mut tables = self.tables.write().await;
        let task = tables
            .task_managements
            .get_mut(id.as_str())
            .ok_or_else(|| StoreError::NotFound(format!("task management {id}")))?;

        if let Some(state) = update.state {
            if task.state.is_terminal() {
                tracing::debug!(
                    task_management_id = %id,
                    current = %task.state,
                    requested = %state,
                    "task already settled, state kept"
                );
            } else {
                task.state = state;
            }
        }
        for flow_id in update.add_flow_ids {
            if !task.flow_ids.contains(&flow_id) {
                task.flow_ids.push(flow_id);
            }
        }
        task.updated_at = Utc::now();
        Ok(task.clone())
    }

    async fn create_task_details(&self, details: Vec<TaskDetail>) -> Result<()> {
        let mut tables = self.tables.write().await;
        for detail in details {
            tables
                .task_details
                .insert(detail.id.as_str().to_string(), detail);
        }
        Ok(())
    }

    async fn update_task_details(&self, updates: Vec<TaskDetailUpdate>) -> Result<usize> {
        let mut tables = self.tables.write().await;
        let now = Utc::now();
        let mut changed = 0;

        for update in updates {
            let Some(detail) = tables.task_details.get_mut(update.id.as_str()) else {
                continue;
            };
            let mut touched = false;

            if let Some(flow_id) = update.flow_id {
                detail.flow_id = Some(flow_id);
                detail.action_id = update.action_id;
                touched = true;
            }
            if let Some(state) = update.state {
                if detail.state.can_advance_to(state) {
                    detail.state = state;
                    if update.reason.is_some() {
                        detail.reason = update.reason;
                    }
                    touched = true;
                }
            }
            if touched {
                detail.updated_at = now;
                changed += 1;
            }
        }
        Ok(changed)
    }

    async fn list_task_details(&self, filter: &TaskDetailFilter) -> Result<Vec<TaskDetail>> {
        let mut details: Vec<_> = self
            .tables
            .read()
            .await
            .task_details
            .values()
            .filter(|d| filter.matches(d))
            .cloned()
            .collect();
        details.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        Ok(details)
    }
}

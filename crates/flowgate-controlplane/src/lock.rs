//! Resource lock manager
//!
//! Owns "at most one active flow per resource". A lock is acquired together
//! with an `Executing` relation row and released by the flow's watcher. An
//! operator force-unlock or the end of the lookback window frees it otherwise.
//! Recent `Executing` relations act as a second guard after the lock row is
//! gone.

use crate::error::{OrchestratorError, Result};
use crate::store::{RelationFilter, ResourceStore};
use chrono::Utc;
use flowgate_core::{
    FlowId, FlowState, RelationStatus, ResourceFlowLock, ResourceFlowRelation, ResourceRef,
    TaskKind,
};
use flowgate_engine::FlowEngine;
use std::sync::Arc;
use std::time::Duration;

/// Default relation lookback window
pub const DEFAULT_LOOKBACK: Duration = Duration::from_secs(7 * 24 * 60 * 60);

/// Evidence that a flow holds its resource lock
///
/// Only [`ResourceLockManager::acquire`] creates one, and arming a flow
/// consumes it, so a flow can only become runnable after its lock exists.
#[derive(Debug)]
pub struct LockProof {
    resource: ResourceRef,
    owner: FlowId,
}

impl LockProof {
    pub fn resource(&self) -> &ResourceRef {
        &self.resource
    }

    pub fn owner(&self) -> &FlowId {
        &self.owner
    }

    /// Make the locked flow runnable (`Init → Pending`)
    pub async fn arm(self, engine: &dyn FlowEngine) -> Result<FlowId> {
        engine
            .update_flow_state(&self.owner, FlowState::Init, FlowState::Pending)
            .await?;
        tracing::info!(
            flow_id = %self.owner,
            res_id = %self.resource.res_id,
            res_type = %self.resource.res_type,
            "flow armed"
        );
        Ok(self.owner)
    }
}

pub struct ResourceLockManager {
    store: Arc<dyn ResourceStore>,
    lookback: Duration,
}

impl ResourceLockManager {
    pub fn new(store: Arc<dyn ResourceStore>, lookback: Duration) -> Self {
        Self { store, lookback }
    }

    pub fn store(&self) -> &Arc<dyn ResourceStore> {
        &self.store
    }

    fn window_start(&self) -> chrono::DateTime<Utc> {
        let lookback = chrono::Duration::from_std(self.lookback).unwrap_or(chrono::Duration::MAX);
        Utc::now()
            .checked_sub_signed(lookback)
            .unwrap_or(chrono::DateTime::<Utc>::MIN_UTC)
    }

    /// Fail if the resource is locked or recently had an executing flow
    ///
    /// A live lock row yields `Conflict`; an `Executing` relation inside the
    /// lookback window without a lock row yields `TaskExecuting`. Both name
    /// the owning flow. A lock older than the lookback window has expired and
    /// is released as `Failed`.
    pub async fn check_conflict(&self, resource: &ResourceRef) -> Result<()> {
        let window_start = self.window_start();

        if let Some(lock) = self.store.get_lock(resource).await? {
            if lock.created_at < window_start {
                tracing::warn!(
                    flow_id = %lock.owner,
                    res_id = %resource.res_id,
                    res_type = %resource.res_type,
                    locked_at = %lock.created_at,
                    "lock outlived the lookback window, releasing"
                );
                self.release(resource, &lock.owner, RelationStatus::Failed)
                    .await?;
            } else {
                tracing::debug!(
                    res_id = %resource.res_id,
                    res_type = %resource.res_type,
                    flow_id = %lock.owner,
                    "resource is locked"
                );
                return Err(OrchestratorError::Conflict {
                    resource: resource.clone(),
                    owner: lock.owner,
                });
            }
        }

        let executing = self
            .store
            .list_relations(&RelationFilter {
                resource: Some(resource.clone()),
                status: Some(RelationStatus::Executing),
                created_after: Some(window_start),
                ..Default::default()
            })
            .await?;
        if let Some(relation) = executing.into_iter().next() {
            tracing::debug!(
                res_id = %resource.res_id,
                res_type = %resource.res_type,
                flow_id = %relation.flow_id,
                "resource has an executing relation"
            );
            return Err(OrchestratorError::TaskExecuting {
                resource: resource.clone(),
                owner: relation.flow_id,
            });
        }
        Ok(())
    }

    /// Take the lock for `flow_id`, writing its `Executing` relation
    pub async fn acquire(
        &self,
        resource: &ResourceRef,
        flow_id: &FlowId,
        task_kind: &TaskKind,
    ) -> Result<LockProof> {
        self.store
            .lock_resource(ResourceFlowLock::new(
                resource.clone(),
                flow_id.clone(),
                task_kind.clone(),
            ))
            .await?;
        tracing::info!(
            flow_id = %flow_id,
            res_id = %resource.res_id,
            res_type = %resource.res_type,
            task_kind = %task_kind,
            "resource locked"
        );
        Ok(LockProof {
            resource: resource.clone(),
            owner: flow_id.clone(),
        })
    }

    /// Drop the lock held by `owner` and record its final status
    pub async fn release(
        &self,
        resource: &ResourceRef,
        owner: &FlowId,
        status: RelationStatus,
    ) -> Result<bool> {
        let released = self.store.unlock_resource(resource, owner, status).await?;
        if released {
            tracing::info!(
                flow_id = %owner,
                res_id = %resource.res_id,
                res_type = %resource.res_type,
                status = %status,
                "resource unlocked"
            );
        } else {
            tracing::debug!(
                flow_id = %owner,
                res_id = %resource.res_id,
                "no lock held by flow, relation updated"
            );
        }
        Ok(released)
    }

    pub async fn current_lock(&self, resource: &ResourceRef) -> Result<Option<ResourceFlowLock>> {
        Ok(self.store.get_lock(resource).await?)
    }

    /// Newest relation of `flow_id` inside the lookback window, optionally
    /// restricted to `resource`
    pub async fn relation(
        &self,
        resource: Option<&ResourceRef>,
        flow_id: &FlowId,
    ) -> Result<Option<ResourceFlowRelation>> {
        let relations = self
            .store
            .list_relations(&RelationFilter {
                resource: resource.cloned(),
                flow_id: Some(flow_id.clone()),
                created_after: Some(self.window_start()),
                ..Default::default()
            })
            .await?;
        Ok(relations.into_iter().next())
    }
}

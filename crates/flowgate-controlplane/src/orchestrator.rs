//! Orchestrator façade
//!
//! Composes the lock manager, task tracker, flow engine and watcher into the
//! build-lock-arm-watch protocol:
//!
//! 1. pre-flight conflict check
//! 2. create the task
//! 3. create task details and build the action graph
//! 4. create the flow in `Init` and bind the details to it
//! 5. acquire the lock, create the watcher, arm the flow with the lock proof
//!
//! Any failure in steps 2 to 5 fails the task and its details, releases a lock
//! that was already taken, and leaves the flow in `Init`, where it never runs.

use crate::error::{OrchestratorError, Result};
use crate::lock::{DEFAULT_LOOKBACK, ResourceLockManager};
use crate::store::ResourceStore;
use crate::task::{TaskProgress, TaskTracker};
use crate::tracking::TrackedExecutor;
use crate::watcher::{
    WATCH_ACTION_KIND, WatchOptions, WatchParams, WatcherExecutor, watch_flow_spec,
};
use flowgate_core::{
    ActionId, ActionIdSeq, ActionKind, FlowId, FlowState, RelationStatus, ResourceFlowRelation,
    ResourceRef, RetryPolicy, ShareData, SubResources, TaskDetailId, TaskKind, TaskManagementId,
    TaskSource, build_chain, concat_phases,
};
use flowgate_engine::{CustomFlowSpec, EngineError, ExecutorRegistry, FlowEngine};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

/// Chunk size used when neither the request nor the configuration names one
pub const DEFAULT_CHUNK_SIZE: usize = 100;

const SHARE_RES_ID: &str = "res_id";
const SHARE_RES_TYPE: &str = "res_type";
const SHARE_TASK_KIND: &str = "task_kind";
const SHARE_SUB_RES_TYPE: &str = "sub_res_type";
/// JSON array of the sub-resource ids
const SHARE_SUB_RES_IDS: &str = "sub_res_ids";

#[derive(Debug, Clone)]
pub struct OrchestratorOptions {
    /// Relation lookback window for conflict checks and relation lookups
    pub lookback: Duration,
    pub default_chunk_size: usize,
    /// Chunk size per action kind
    pub chunk_sizes: HashMap<ActionKind, usize>,
    pub default_retry: RetryPolicy,
    pub watch: WatchOptions,
}

impl Default for OrchestratorOptions {
    fn default() -> Self {
        Self {
            lookback: DEFAULT_LOOKBACK,
            default_chunk_size: DEFAULT_CHUNK_SIZE,
            chunk_sizes: HashMap::new(),
            default_retry: RetryPolicy::default(),
            watch: WatchOptions::default(),
        }
    }
}

impl OrchestratorOptions {
    pub fn chunk_size_for(&self, kind: &ActionKind) -> usize {
        self.chunk_sizes
            .get(kind)
            .copied()
            .unwrap_or(self.default_chunk_size)
    }
}

/// One independently chunked part of a request
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Phase {
    pub action_kind: ActionKind,
    pub items: Vec<Value>,
    #[serde(default)]
    pub chunk_size: Option<usize>,
    #[serde(default)]
    pub retry: Option<RetryPolicy>,
}

impl Phase {
    pub fn new(action_kind: impl Into<ActionKind>, items: Vec<Value>) -> Self {
        Self {
            action_kind: action_kind.into(),
            items,
            chunk_size: None,
            retry: None,
        }
    }

    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = Some(chunk_size);
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = Some(retry);
        self
    }
}

/// Input of [`Orchestrator::build_and_arm_flow`]
#[derive(Debug, Clone)]
pub struct BuildRequest {
    pub resource: ResourceRef,
    pub task_kind: TaskKind,
    /// Owning tenant or business unit
    pub scope: String,
    pub source: TaskSource,
    pub sub_resources: SubResources,
    /// Chunked in order and joined into one chain
    pub phases: Vec<Phase>,
    /// Items already satisfied; recorded as successful details only
    pub settled_items: Vec<Value>,
    pub share_data: ShareData,
}

impl BuildRequest {
    pub fn new(
        resource: ResourceRef,
        task_kind: impl Into<TaskKind>,
        scope: impl Into<String>,
    ) -> Self {
        Self {
            resource,
            task_kind: task_kind.into(),
            scope: scope.into(),
            source: TaskSource::Api,
            sub_resources: SubResources::default(),
            phases: Vec::new(),
            settled_items: Vec::new(),
            share_data: ShareData::new(),
        }
    }

    pub fn phase(mut self, phase: Phase) -> Self {
        self.phases.push(phase);
        self
    }

    pub fn with_source(mut self, source: TaskSource) -> Self {
        self.source = source;
        self
    }

    pub fn with_sub_resources(mut self, sub_resources: SubResources) -> Self {
        self.sub_resources = sub_resources;
        self
    }

    pub fn with_settled_items(mut self, items: Vec<Value>) -> Self {
        self.settled_items = items;
        self
    }
}

/// Result of arming a flow
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArmedFlow {
    pub flow_id: FlowId,
    pub task_management_id: TaskManagementId,
    pub watch_flow_id: FlowId,
    pub action_ids: Vec<ActionId>,
}

/// Answer of [`Orchestrator::get_flow_relation`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlowRelationView {
    pub resource: ResourceRef,
    pub flow_id: FlowId,
    pub status: RelationStatus,
    pub task_kind: TaskKind,
    /// Current lock owner of the resource, if any
    pub owner: Option<FlowId>,
    /// Whether `flow_id` itself holds the lock
    pub locked: bool,
    /// State reported by the flow engine
    pub flow_state: Option<FlowState>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ForceUnlockOutcome {
    pub resource: ResourceRef,
    pub owner: FlowId,
    pub status: RelationStatus,
}

/// Work done so far by a build, undone on failure
#[derive(Default)]
struct Construction {
    details: Vec<TaskDetailId>,
    locked: Option<(ResourceRef, FlowId)>,
    watch_flow: Option<FlowId>,
}

/// Wrap `vendor` executors with task tracking and add the watcher executor
pub fn control_plane_registry(
    vendor: &ExecutorRegistry,
    store: Arc<dyn ResourceStore>,
    options: &OrchestratorOptions,
) -> ExecutorRegistry {
    let tasks = TaskTracker::new(store.clone());
    let locks = Arc::new(ResourceLockManager::new(store, options.lookback));

    let mut builder = ExecutorRegistry::builder();
    for (kind, executor) in vendor.iter() {
        if kind.as_str() == WATCH_ACTION_KIND {
            continue;
        }
        builder = builder.register(
            kind.clone(),
            Arc::new(TrackedExecutor::new(executor.clone(), tasks.clone())),
        );
    }
    builder
        .register(
            WATCH_ACTION_KIND,
            Arc::new(WatcherExecutor::new(locks, tasks, options.watch)),
        )
        .build()
}

/// Entry point for business logic
pub struct Orchestrator {
    engine: Arc<dyn FlowEngine>,
    registry: ExecutorRegistry,
    locks: Arc<ResourceLockManager>,
    tasks: TaskTracker,
    options: OrchestratorOptions,
}

impl Orchestrator {
    /// `registry` must be the one the engine was built with
    pub fn new(
        engine: Arc<dyn FlowEngine>,
        registry: ExecutorRegistry,
        store: Arc<dyn ResourceStore>,
        options: OrchestratorOptions,
    ) -> Self {
        Self {
            engine,
            registry,
            locks: Arc::new(ResourceLockManager::new(store.clone(), options.lookback)),
            tasks: TaskTracker::new(store),
            options,
        }
    }

    pub fn options(&self) -> &OrchestratorOptions {
        &self.options
    }

    pub fn engine(&self) -> &Arc<dyn FlowEngine> {
        &self.engine
    }

    /// Build a flow for `request`, lock the resource and make the flow runnable
    ///
    /// Each chunk action receives `{"res_id", "res_type", "items"}`.
    pub async fn build_and_arm_flow(&self, request: BuildRequest) -> Result<ArmedFlow> {
        let res_id = request.resource.res_id.clone();
        let res_type = request.resource.res_type.clone();
        self.build_and_arm_flow_with(request, move |_, _, chunk| {
            Ok(serde_json::json!({
                "res_id": res_id,
                "res_type": res_type,
                "items": chunk,
            }))
        })
        .await
    }

    /// Like [`build_and_arm_flow`](Self::build_and_arm_flow) with a custom chunk payload
    pub async fn build_and_arm_flow_with<F>(
        &self,
        request: BuildRequest,
        params_fn: F,
    ) -> Result<ArmedFlow>
    where
        F: FnMut(&Phase, &ActionId, &[Value]) -> flowgate_core::Result<Value> + Send,
    {
        self.validate(&request)?;
        self.locks.check_conflict(&request.resource).await?;

        let task = self
            .tasks
            .create_management(
                &request.scope,
                request.source,
                &request.resource.res_type,
                &request.task_kind,
            )
            .await?;

        let mut construction = Construction::default();
        match self
            .construct(&request, &task.id, &mut construction, params_fn)
            .await
        {
            Ok(armed) => {
                tracing::info!(
                    flow_id = %armed.flow_id,
                    res_id = %request.resource.res_id,
                    res_type = %request.resource.res_type,
                    task_management_id = %armed.task_management_id,
                    actions = armed.action_ids.len(),
                    "flow built and armed"
                );
                Ok(armed)
            }
            Err(err) => {
                self.rollback(&task.id, construction, &err).await;
                Err(err)
            }
        }
    }

    fn validate(&self, request: &BuildRequest) -> Result<()> {
        if request.resource.res_id.is_empty() || request.resource.res_type.is_empty() {
            return Err(OrchestratorError::Validation(
                "resource id and type are required".into(),
            ));
        }
        if request.phases.iter().all(|p| p.items.is_empty()) {
            return Err(OrchestratorError::Validation(
                "request contains no items to execute".into(),
            ));
        }
        for phase in &request.phases {
            if phase.action_kind.as_str() == WATCH_ACTION_KIND
                || !self.registry.contains(&phase.action_kind)
            {
                return Err(OrchestratorError::UnsupportedKind(
                    phase.action_kind.to_string(),
                ));
            }
            if phase.chunk_size == Some(0) {
                return Err(OrchestratorError::Validation(format!(
                    "chunk size of phase {} must be greater than zero",
                    phase.action_kind
                )));
            }
            if let Some(retry) = &phase.retry {
                retry.validate()?;
            }
        }
        Ok(())
    }

    async fn construct<F>(
        &self,
        request: &BuildRequest,
        task_id: &TaskManagementId,
        construction: &mut Construction,
        mut params_fn: F,
    ) -> Result<ArmedFlow>
    where
        F: FnMut(&Phase, &ActionId, &[Value]) -> flowgate_core::Result<Value> + Send,
    {
        self.tasks
            .record_settled(task_id, &request.settled_items)
            .await?;

        let mut phase_details = Vec::with_capacity(request.phases.len());
        for phase in &request.phases {
            let details = self.tasks.create_details(task_id, &phase.items).await?;
            construction
                .details
                .extend(details.iter().map(|d| d.id.clone()));
            phase_details.push(details);
        }

        let mut phase_actions = Vec::with_capacity(request.phases.len());
        let mut phase_spans = Vec::with_capacity(request.phases.len());
        for phase in &request.phases {
            let chunk_size = phase
                .chunk_size
                .unwrap_or_else(|| self.options.chunk_size_for(&phase.action_kind));
            let retry = phase.retry.unwrap_or(self.options.default_retry);
            let (actions, spans, _) = build_chain(
                &phase.items,
                chunk_size,
                &phase.action_kind,
                retry,
                ActionIdSeq::new(),
                |id, chunk| params_fn(phase, id, chunk),
            )?;
            phase_actions.push(actions);
            phase_spans.push(spans);
        }
        let chain = concat_phases(phase_actions, ActionIdSeq::new())?;

        let mut assignments = Vec::with_capacity(construction.details.len());
        for (index, spans) in phase_spans.iter().enumerate() {
            for span in spans {
                let action_id = chain.renames[index].get(&span.action_id).ok_or_else(|| {
                    OrchestratorError::ConstructionFailed(format!(
                        "chunk action {} lost during concatenation",
                        span.action_id
                    ))
                })?;
                for detail in &phase_details[index][span.range.clone()] {
                    assignments.push((detail.id.clone(), action_id.clone()));
                }
            }
        }
        let action_ids: Vec<_> = chain.actions.iter().map(|a| a.id.clone()).collect();

        let mut share_data = request.share_data.clone();
        share_data.insert(SHARE_RES_ID.into(), request.resource.res_id.clone());
        share_data.insert(SHARE_RES_TYPE.into(), request.resource.res_type.clone());
        share_data.insert(SHARE_TASK_KIND.into(), request.task_kind.to_string());
        share_data.insert(
            SHARE_SUB_RES_TYPE.into(),
            request.sub_resources.res_type.clone(),
        );
        let sub_res_ids = serde_json::to_string(&request.sub_resources.ids)
            .map_err(|e| OrchestratorError::ConstructionFailed(e.to_string()))?;
        share_data.insert(SHARE_SUB_RES_IDS.into(), sub_res_ids);

        let flow_id = self
            .engine
            .create_custom_flow(
                CustomFlowSpec::new(request.task_kind.to_string(), chain.actions)
                    .with_share_data(share_data),
            )
            .await?;
        self.tasks.bind_flow(task_id, &flow_id, assignments).await?;

        let watch_flow_id = self
            .lock_and_arm(
                &request.resource,
                &request.task_kind,
                &request.sub_resources,
                &flow_id,
                task_id,
                construction,
            )
            .await?;

        Ok(ArmedFlow {
            flow_id,
            task_management_id: task_id.clone(),
            watch_flow_id,
            action_ids,
        })
    }

    /// Step 5: lock, watch, arm
    async fn lock_and_arm(
        &self,
        resource: &ResourceRef,
        task_kind: &TaskKind,
        sub_resources: &SubResources,
        flow_id: &FlowId,
        task_id: &TaskManagementId,
        construction: &mut Construction,
    ) -> Result<FlowId> {
        let proof = self.locks.acquire(resource, flow_id, task_kind).await?;
        construction.locked = Some((resource.clone(), flow_id.clone()));

        let params = WatchParams::new(
            flow_id.clone(),
            resource,
            sub_resources,
            task_kind.clone(),
            task_id.clone(),
        );
        let spec = watch_flow_spec(&params, &self.options.watch)
            .map_err(|e| OrchestratorError::ConstructionFailed(e.to_string()))?;
        let watch_flow_id = self.engine.create_template_flow(spec).await?;
        construction.watch_flow = Some(watch_flow_id.clone());
        tracing::debug!(
            flow_id = %flow_id,
            watch_flow_id = %watch_flow_id,
            "watcher created"
        );

        proof.arm(self.engine.as_ref()).await?;
        Ok(watch_flow_id)
    }

    async fn rollback(
        &self,
        task_id: &TaskManagementId,
        construction: Construction,
        err: &OrchestratorError,
    ) {
        let reason = err.to_string();

        if let Some(watch_flow) = &construction.watch_flow {
            self.cancel_watcher(watch_flow).await;
        }
        if let Some((resource, owner)) = &construction.locked {
            if let Err(e) = self.locks.release(resource, owner, RelationStatus::Failed).await {
                tracing::error!(
                    flow_id = %owner,
                    res_id = %resource.res_id,
                    error = %e,
                    "rollback could not release lock"
                );
            }
        }
        if let Err(e) = self
            .tasks
            .fail_construction(task_id, &construction.details, &reason)
            .await
        {
            tracing::error!(
                task_management_id = %task_id,
                error = %e,
                "rollback could not fail task"
            );
        }
    }

    /// Cancel a watcher whose flow was never armed
    async fn cancel_watcher(&self, watch_flow: &FlowId) {
        for _ in 0..50 {
            match self.engine.cancel_flow(watch_flow).await {
                Ok(()) => return,
                Err(EngineError::InvalidState {
                    state: FlowState::Pending,
                    ..
                }) => tokio::time::sleep(Duration::from_millis(20)).await,
                Err(e) => {
                    tracing::debug!(
                        watch_flow_id = %watch_flow,
                        error = %e,
                        "watcher not cancelled"
                    );
                    return;
                }
            }
        }
        tracing::warn!(watch_flow_id = %watch_flow, "watcher never started, left to time out");
    }

    async fn require_relation(
        &self,
        resource: Option<&ResourceRef>,
        flow_id: &FlowId,
    ) -> Result<ResourceFlowRelation> {
        self.locks
            .relation(resource, flow_id)
            .await?
            .ok_or_else(|| OrchestratorError::NotFound(format!("relation of flow {flow_id}")))
    }

    /// Cancel an executing flow; the watcher releases the lock afterwards
    pub async fn terminate_flow(&self, resource: &ResourceRef, flow_id: &FlowId) -> Result<()> {
        let relation = self.require_relation(Some(resource), flow_id).await?;
        if relation.status != RelationStatus::Executing {
            return Err(OrchestratorError::InvalidState(format!(
                "flow {flow_id} is {}, terminate requires executing",
                relation.status
            )));
        }
        self.engine.cancel_flow(flow_id).await?;
        tracing::info!(
            flow_id = %flow_id,
            res_id = %resource.res_id,
            res_type = %resource.res_type,
            "flow termination requested"
        );
        Ok(())
    }

    /// Re-run a failed action of an executing flow
    pub async fn retry_sub_task(
        &self,
        resource: &ResourceRef,
        flow_id: &FlowId,
        action_id: &ActionId,
    ) -> Result<()> {
        let relation = self.require_relation(Some(resource), flow_id).await?;
        if relation.status != RelationStatus::Executing {
            return Err(OrchestratorError::InvalidState(format!(
                "flow {flow_id} is {}, retry requires executing",
                relation.status
            )));
        }
        self.engine.retry_action(flow_id, action_id).await?;
        tracing::info!(
            flow_id = %flow_id,
            action_id = %action_id,
            res_id = %resource.res_id,
            "sub-task retry requested"
        );
        Ok(())
    }

    /// Re-run a finished flow under a new task, lock and watcher
    pub async fn clone_flow(&self, flow_id: &FlowId, memo: Option<String>) -> Result<ArmedFlow> {
        let relation = self.require_relation(None, flow_id).await?;
        if !relation.status.is_cloneable() {
            return Err(OrchestratorError::InvalidState(format!(
                "flow {flow_id} is {}, clone requires success, cancelled or timed_out",
                relation.status
            )));
        }
        let resource = relation.resource.clone();
        self.locks.check_conflict(&resource).await?;

        let source_task = self
            .tasks
            .find_by_flow(flow_id)
            .await?
            .ok_or_else(|| OrchestratorError::NotFound(format!("task of flow {flow_id}")))?;
        let source_flow = self.engine.get_flow(flow_id).await?;
        let sub_resources = sub_resources_from(&source_flow.flow.share_data);

        let task = self
            .tasks
            .create_management(
                &source_task.scope,
                TaskSource::Clone,
                &resource.res_type,
                &relation.task_kind,
            )
            .await?;

        let mut construction = Construction::default();
        let result = async {
            let new_flow = self.engine.clone_flow(flow_id, memo).await?;
            let copies = self.tasks.clone_details(flow_id, &task.id).await?;
            construction
                .details
                .extend(copies.iter().map(|(d, _)| d.id.clone()));
            let assignments = copies
                .into_iter()
                .map(|(d, action)| (d.id, action))
                .collect();
            self.tasks.bind_flow(&task.id, &new_flow, assignments).await?;

            let watch_flow_id = self
                .lock_and_arm(
                    &resource,
                    &relation.task_kind,
                    &sub_resources,
                    &new_flow,
                    &task.id,
                    &mut construction,
                )
                .await?;
            let action_ids = self
                .engine
                .get_flow(&new_flow)
                .await?
                .flow
                .actions
                .into_iter()
                .map(|a| a.id)
                .collect();
            Ok::<_, OrchestratorError>(ArmedFlow {
                flow_id: new_flow,
                task_management_id: task.id.clone(),
                watch_flow_id,
                action_ids,
            })
        }
        .await;

        match result {
            Ok(armed) => {
                tracing::info!(
                    flow_id = %armed.flow_id,
                    source_flow_id = %flow_id,
                    res_id = %resource.res_id,
                    task_management_id = %armed.task_management_id,
                    "flow cloned and armed"
                );
                Ok(armed)
            }
            Err(err) => {
                self.rollback(&task.id, construction, &err).await;
                Err(err)
            }
        }
    }

    /// Relation of `flow_id` to `resource` inside the lookback window
    pub async fn get_flow_relation(
        &self,
        resource: &ResourceRef,
        flow_id: &FlowId,
    ) -> Result<FlowRelationView> {
        let relation = self.require_relation(Some(resource), flow_id).await?;
        let owner = self.locks.current_lock(resource).await?.map(|l| l.owner);
        let flow_state = match self.engine.flow_state(flow_id).await {
            Ok(state) => Some(state),
            Err(EngineError::FlowNotFound(_)) => None,
            Err(e) => return Err(e.into()),
        };

        Ok(FlowRelationView {
            locked: owner.as_ref() == Some(flow_id),
            resource: relation.resource,
            flow_id: relation.flow_id,
            status: relation.status,
            task_kind: relation.task_kind,
            owner,
            flow_state,
        })
    }

    /// Operator release of a lock whose flow is no longer running
    ///
    /// Refused while the owning flow is still non-terminal in the engine.
    pub async fn force_unlock(&self, resource: &ResourceRef) -> Result<ForceUnlockOutcome> {
        let lock = self
            .locks
            .current_lock(resource)
            .await?
            .ok_or_else(|| OrchestratorError::NotFound(format!("lock on {resource}")))?;
        let owner = lock.owner;

        let observed = match self.engine.flow_state(&owner).await {
            Ok(state) if state.is_terminal() => state,
            Ok(state) => {
                return Err(OrchestratorError::InvalidState(format!(
                    "flow {owner} holding {resource} is still {state}"
                )));
            }
            Err(EngineError::FlowNotFound(_)) => FlowState::Failed,
            Err(e) => return Err(e.into()),
        };
        let status = RelationStatus::from_terminal(observed).unwrap_or(RelationStatus::Failed);

        self.locks.release(resource, &owner, status).await?;
        if let Some(task) = self.tasks.find_by_flow(&owner).await? {
            self.tasks.finish_flow(&task.id, &owner, observed).await?;
        }
        tracing::warn!(
            flow_id = %owner,
            res_id = %resource.res_id,
            res_type = %resource.res_type,
            status = %status,
            "resource lock force-released"
        );

        Ok(ForceUnlockOutcome {
            resource: resource.clone(),
            owner,
            status,
        })
    }

    pub async fn task_progress(
        &self,
        task_management_id: &TaskManagementId,
    ) -> Result<TaskProgress> {
        self.tasks.progress(task_management_id).await
    }
}

fn sub_resources_from(share_data: &ShareData) -> SubResources {
    let res_type = share_data
        .get(SHARE_SUB_RES_TYPE)
        .cloned()
        .unwrap_or_default();
    let ids = share_data
        .get(SHARE_SUB_RES_IDS)
        .and_then(|ids| match serde_json::from_str::<Vec<String>>(ids) {
            Ok(ids) => Some(ids),
            Err(e) => {
                tracing::warn!(error = %e, "unreadable sub-resource ids in share data");
                None
            }
        })
        .unwrap_or_default();
    SubResources::new(res_type, ids)
}

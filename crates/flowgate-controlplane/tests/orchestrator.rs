mod common;

use async_trait::async_trait;
use common::{Harness, POLL, lb, targets, watch_options};
use flowgate_controlplane::{
    BuildRequest, OrchestratorError, Phase, RelationFilter, ResourceStore, TaskDetailFilter,
    WatchOptions,
};
use flowgate_core::{
    ActionId, ActionState, CoreError, FlowId, FlowState, RelationStatus, ResourceFlowLock,
    RetryPolicy, SubResources, TaskDetailState, TaskKind, TaskManagementState, TaskSource,
};
use flowgate_engine::{
    CustomFlowSpec, EngineError, EngineOptions, FlowEngine, FlowSnapshot, FlowStateReader,
    LocalFlowEngine, TemplateFlowSpec,
};
use futures_util::future::join_all;
use serde_json::json;
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Local engine that refuses to arm flows and remembers the watchers it created
struct RefusingArm {
    inner: LocalFlowEngine,
    watchers: Mutex<Vec<FlowId>>,
}

#[async_trait]
impl FlowStateReader for RefusingArm {
    async fn flow_state(&self, flow_id: &FlowId) -> flowgate_engine::Result<FlowState> {
        self.inner.flow_state(flow_id).await
    }
}

#[async_trait]
impl FlowEngine for RefusingArm {
    fn name(&self) -> &str {
        "refusing"
    }

    async fn create_custom_flow(&self, spec: CustomFlowSpec) -> flowgate_engine::Result<FlowId> {
        self.inner.create_custom_flow(spec).await
    }

    async fn create_template_flow(
        &self,
        spec: TemplateFlowSpec,
    ) -> flowgate_engine::Result<FlowId> {
        let id = self.inner.create_template_flow(spec).await?;
        self.watchers.lock().unwrap().push(id.clone());
        Ok(id)
    }

    async fn update_flow_state(
        &self,
        flow_id: &FlowId,
        source: FlowState,
        _target: FlowState,
    ) -> flowgate_engine::Result<()> {
        Err(EngineError::StateMismatch {
            flow_id: flow_id.clone(),
            expected: source,
            actual: FlowState::Cancelled,
        })
    }

    async fn cancel_flow(&self, flow_id: &FlowId) -> flowgate_engine::Result<()> {
        self.inner.cancel_flow(flow_id).await
    }

    async fn retry_action(
        &self,
        flow_id: &FlowId,
        action_id: &ActionId,
    ) -> flowgate_engine::Result<()> {
        self.inner.retry_action(flow_id, action_id).await
    }

    async fn clone_flow(
        &self,
        flow_id: &FlowId,
        memo: Option<String>,
    ) -> flowgate_engine::Result<FlowId> {
        self.inner.clone_flow(flow_id, memo).await
    }

    async fn get_flow(&self, flow_id: &FlowId) -> flowgate_engine::Result<FlowSnapshot> {
        self.inner.get_flow(flow_id).await
    }
}

fn add_targets(kind: &str, n: usize) -> BuildRequest {
    BuildRequest::new(lb(), "add_rs", "biz-1")
        .with_sub_resources(SubResources::new("RS", vec!["rs-0".into(), "rs-1".into()]))
        .phase(Phase::new(kind, targets(n)).with_chunk_size(100))
}

#[tokio::test]
async fn test_add_250_targets_end_to_end() {
    let h = Harness::new();

    let armed = h
        .orchestrator
        .build_and_arm_flow(add_targets("gated_rs", 250))
        .await
        .unwrap();
    assert_eq!(
        armed.action_ids,
        vec![ActionId::new("a1"), ActionId::new("a2"), ActionId::new("a3")]
    );

    let snapshot = h.engine.get_flow(&armed.flow_id).await.unwrap();
    let deps: Vec<Vec<&str>> = snapshot
        .flow
        .actions
        .iter()
        .map(|a| a.depends_on.iter().map(|d| d.as_str()).collect())
        .collect();
    assert_eq!(deps, vec![vec![], vec!["a1"], vec!["a2"]]);
    assert_eq!(snapshot.flow.actions[2].params["items"].as_array().unwrap().len(), 50);

    let view = h
        .orchestrator
        .get_flow_relation(&lb(), &armed.flow_id)
        .await
        .unwrap();
    assert_eq!(view.status, RelationStatus::Executing);
    assert!(view.locked);
    assert!(matches!(
        view.flow_state,
        Some(FlowState::Pending) | Some(FlowState::Executing)
    ));

    h.gate.open();
    assert_eq!(h.wait_flow(&armed.flow_id).await, FlowState::Success);
    h.wait_unlocked(&lb()).await;
    assert_eq!(h.wait_flow(&armed.watch_flow_id).await, FlowState::Success);

    let view = h
        .orchestrator
        .get_flow_relation(&lb(), &armed.flow_id)
        .await
        .unwrap();
    assert_eq!(view.status, RelationStatus::Success);
    assert_eq!(view.owner, None);
    assert!(!view.locked);

    let progress = h
        .orchestrator
        .task_progress(&armed.task_management_id)
        .await
        .unwrap();
    assert_eq!(progress.state, TaskManagementState::Success);
    assert_eq!(progress.total, 250);
    assert_eq!(progress.success, 250);
    assert_eq!(progress.flow_ids, vec![armed.flow_id.clone()]);
}

#[tokio::test]
async fn test_concurrent_builds_single_winner() {
    let h = Harness::new();

    let attempts = (0..8).map(|_| {
        let orchestrator = h.orchestrator.clone();
        async move {
            orchestrator
                .build_and_arm_flow(add_targets("gated_rs", 10))
                .await
        }
    });
    let results = join_all(attempts).await;

    let winners: Vec<_> = results.iter().filter_map(|r| r.as_ref().ok()).collect();
    assert_eq!(winners.len(), 1);
    let winner = winners[0].flow_id.clone();

    for result in &results {
        if let Err(err) = result {
            assert!(
                matches!(err, OrchestratorError::Conflict { .. }),
                "unexpected error: {err}"
            );
            assert_eq!(err.owner_flow_id(), Some(&winner));
        }
    }
    assert_eq!(h.store.list_locks().await.unwrap().len(), 1);

    let tables = h.store.snapshot().await;
    let failed = tables
        .task_managements
        .values()
        .filter(|t| t.state == TaskManagementState::Failed)
        .count();
    let total = tables.task_managements.len();
    assert_eq!(failed + 1, total);

    h.gate.open();
    h.wait_flow(&winner).await;
}

#[tokio::test]
async fn test_second_build_names_first_flow() {
    let h = Harness::new();
    let first = h
        .orchestrator
        .build_and_arm_flow(add_targets("gated_rs", 5))
        .await
        .unwrap();

    let err = h
        .orchestrator
        .build_and_arm_flow(add_targets("add_rs", 5))
        .await
        .unwrap_err();
    match &err {
        OrchestratorError::Conflict { resource, owner } => {
            assert_eq!(resource, &lb());
            assert_eq!(owner, &first.flow_id);
        }
        other => panic!("expected conflict, got {other}"),
    }

    h.gate.open();
    h.wait_flow(&first.flow_id).await;
    h.wait_unlocked(&lb()).await;

    h.orchestrator
        .build_and_arm_flow(add_targets("add_rs", 5))
        .await
        .unwrap();
}

#[tokio::test]
async fn test_construction_failure_rolls_back() {
    let h = Harness::new();
    let request = add_targets("add_rs", 30).phase(Phase::new("create_listener", targets(1)));

    let err = h
        .orchestrator
        .build_and_arm_flow_with(request.clone(), |phase, id, chunk| {
            if phase.action_kind.as_str() == "create_listener" {
                return Err(CoreError::Payload(format!("listener {id} has no port")));
            }
            Ok(json!({ "items": chunk }))
        })
        .await
        .unwrap_err();
    assert_eq!(err.error_code(), "construction_failed");

    let tables = h.store.snapshot().await;
    let task = tables.task_managements.values().next().unwrap();
    assert_eq!(task.state, TaskManagementState::Failed);
    assert_eq!(tables.task_details.len(), 31);
    for detail in tables.task_details.values() {
        assert_eq!(detail.state, TaskDetailState::Failed);
        assert!(!detail.reason.as_deref().unwrap_or_default().is_empty());
    }

    assert!(h.store.list_locks().await.unwrap().is_empty());
    assert_eq!(h.engine.flow_count().await, 0);
}

#[tokio::test]
async fn test_arm_failure_cancels_watcher_and_releases_lock() {
    let mut refusing = None;
    let h = Harness::with_engine(watch_options(), EngineOptions::default(), |engine| {
        let wrapper = Arc::new(RefusingArm {
            inner: engine,
            watchers: Mutex::new(Vec::new()),
        });
        refusing = Some(wrapper.clone());
        wrapper as Arc<dyn FlowEngine>
    });
    let refusing = refusing.unwrap();

    let err = h
        .orchestrator
        .build_and_arm_flow(add_targets("add_rs", 3))
        .await
        .unwrap_err();
    assert_eq!(err.error_code(), "invalid_state");

    assert!(h.store.list_locks().await.unwrap().is_empty());
    let relations = h.store.list_relations(&RelationFilter::default()).await.unwrap();
    assert_eq!(relations.len(), 1);
    assert_eq!(relations[0].status, RelationStatus::Failed);

    let tables = h.store.snapshot().await;
    let task = tables.task_managements.values().next().unwrap();
    assert_eq!(task.state, TaskManagementState::Failed);
    assert_eq!(tables.task_details.len(), 3);
    assert!(
        tables
            .task_details
            .values()
            .all(|d| d.state == TaskDetailState::Failed)
    );

    let watchers = refusing.watchers.lock().unwrap().clone();
    assert_eq!(watchers.len(), 1);
    assert_eq!(h.wait_flow(&watchers[0]).await, FlowState::Cancelled);
}

#[tokio::test]
async fn test_failed_flow_releases_lock_and_fails_task() {
    let h = Harness::with_options(
        watch_options(),
        EngineOptions {
            failure_grace: Duration::from_millis(5),
            ..EngineOptions::default()
        },
    );
    let request = BuildRequest::new(lb(), "add_rs", "biz-1").phase(
        Phase::new("broken_rs", targets(4))
            .with_chunk_size(2)
            .with_retry(RetryPolicy::disabled()),
    );
    let armed = h.orchestrator.build_and_arm_flow(request).await.unwrap();

    assert_eq!(h.wait_flow(&armed.flow_id).await, FlowState::Failed);
    assert_eq!(h.wait_flow(&armed.watch_flow_id).await, FlowState::Success);
    assert!(h.store.get_lock(&lb()).await.unwrap().is_none());

    let view = h
        .orchestrator
        .get_flow_relation(&lb(), &armed.flow_id)
        .await
        .unwrap();
    assert_eq!(view.status, RelationStatus::Failed);
    assert!(!view.locked);

    let task = h
        .store
        .get_task_management(&armed.task_management_id)
        .await
        .unwrap();
    assert_eq!(task.state, TaskManagementState::Failed);

    let details = h
        .store
        .list_task_details(&TaskDetailFilter {
            task_management_id: Some(armed.task_management_id.clone()),
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(details.len(), 4);
    for detail in &details {
        assert_eq!(detail.state, TaskDetailState::Failed);
        let reason = detail.reason.as_deref().unwrap_or_default();
        if detail.action_id == Some(ActionId::new("a1")) {
            assert!(reason.contains("backend unreachable"), "{reason}");
        } else {
            assert_eq!(detail.action_id, Some(ActionId::new("a2")));
            assert!(reason.contains("before this item completed"), "{reason}");
        }
    }
}

#[tokio::test]
async fn test_clone_keeps_sub_resource_ids() {
    let h = Harness::new();
    let request = BuildRequest::new(lb(), "add_rs", "biz-1")
        .with_sub_resources(SubResources::new("RS", vec!["rs-0".into(), "pool=a,b".into()]))
        .phase(Phase::new("add_rs", targets(2)));
    let armed = h.orchestrator.build_and_arm_flow(request).await.unwrap();
    assert_eq!(h.wait_flow(&armed.flow_id).await, FlowState::Success);
    h.wait_unlocked(&lb()).await;
    h.wait_flow(&armed.watch_flow_id).await;

    let cloned = h
        .orchestrator
        .clone_flow(&armed.flow_id, None)
        .await
        .unwrap();
    let watch = h.engine.get_flow(&cloned.watch_flow_id).await.unwrap();
    let ids = &watch.flow.actions[0].params["sub_res_ids"];
    assert_eq!(ids, &json!(["rs-0", "pool=a,b"]));

    h.wait_flow(&cloned.flow_id).await;
    h.wait_unlocked(&lb()).await;
    h.wait_flow(&cloned.watch_flow_id).await;
}

#[tokio::test]
async fn test_unsupported_kind_fails_before_task() {
    let h = Harness::new();
    let err = h
        .orchestrator
        .build_and_arm_flow(add_targets("vendor_x_rs", 3))
        .await
        .unwrap_err();

    assert!(matches!(err, OrchestratorError::UnsupportedKind(ref k) if k == "vendor_x_rs"));
    assert!(h.store.snapshot().await.task_managements.is_empty());
}

#[tokio::test]
async fn test_empty_request_rejected() {
    let h = Harness::new();
    let err = h
        .orchestrator
        .build_and_arm_flow(BuildRequest::new(lb(), "add_rs", "biz-1"))
        .await
        .unwrap_err();
    assert_eq!(err.error_code(), "validation");
}

#[tokio::test]
async fn test_settled_items_and_phases() {
    let h = Harness::new();
    let request = BuildRequest::new(lb(), "add_listener", "biz-1")
        .phase(Phase::new("create_listener", targets(1)))
        .phase(Phase::new("add_rs", targets(5)).with_chunk_size(2))
        .with_settled_items(targets(2));

    let armed = h.orchestrator.build_and_arm_flow(request).await.unwrap();
    assert_eq!(armed.action_ids.len(), 4);

    let snapshot = h.engine.get_flow(&armed.flow_id).await.unwrap();
    assert_eq!(snapshot.flow.actions[0].kind.as_str(), "create_listener");
    assert_eq!(snapshot.flow.actions[1].depends_on, vec![ActionId::new("a1")]);

    assert_eq!(h.wait_flow(&armed.flow_id).await, FlowState::Success);
    h.wait_unlocked(&lb()).await;
    h.wait_flow(&armed.watch_flow_id).await;

    let details = h
        .store
        .list_task_details(&flowgate_controlplane::TaskDetailFilter {
            task_management_id: Some(armed.task_management_id.clone()),
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(details.len(), 8);
    assert_eq!(details.iter().filter(|d| d.action_id.is_none()).count(), 2);
    let on_a4: Vec<_> = details
        .iter()
        .filter(|d| d.action_id == Some(ActionId::new("a4")))
        .collect();
    assert_eq!(on_a4.len(), 1);
    assert!(details.iter().all(|d| d.state == TaskDetailState::Success));
}

#[tokio::test]
async fn test_init_flow_rejects_terminate_and_retry() {
    let h = Harness::new();
    let flow_id = h
        .engine
        .create_custom_flow(CustomFlowSpec::new(
            "add_rs",
            vec![flowgate_core::Action::new(ActionId::new("a1"), "add_rs")],
        ))
        .await
        .unwrap();
    // Relation says executing, engine still has the flow in init
    h.store
        .lock_resource(ResourceFlowLock::new(lb(), flow_id.clone(), TaskKind::new("add_rs")))
        .await
        .unwrap();

    let err = h.orchestrator.terminate_flow(&lb(), &flow_id).await.unwrap_err();
    assert_eq!(err.error_code(), "invalid_state");

    let err = h
        .orchestrator
        .retry_sub_task(&lb(), &flow_id, &ActionId::new("a1"))
        .await
        .unwrap_err();
    assert_eq!(err.error_code(), "invalid_state");
    assert_eq!(h.engine.flow_state(&flow_id).await.unwrap(), FlowState::Init);
}

#[tokio::test]
async fn test_terminate_then_clone() {
    let h = Harness::new();
    let armed = h
        .orchestrator
        .build_and_arm_flow(add_targets("gated_rs", 120))
        .await
        .unwrap();
    h.wait_state(&armed.flow_id, FlowState::Executing).await;

    let err = h
        .orchestrator
        .clone_flow(&armed.flow_id, None)
        .await
        .unwrap_err();
    assert_eq!(err.error_code(), "invalid_state");

    h.orchestrator
        .terminate_flow(&lb(), &armed.flow_id)
        .await
        .unwrap();
    assert_eq!(h.wait_flow(&armed.flow_id).await, FlowState::Cancelled);
    h.wait_unlocked(&lb()).await;
    h.wait_flow(&armed.watch_flow_id).await;

    let view = h
        .orchestrator
        .get_flow_relation(&lb(), &armed.flow_id)
        .await
        .unwrap();
    assert_eq!(view.status, RelationStatus::Cancelled);

    let err = h
        .orchestrator
        .terminate_flow(&lb(), &armed.flow_id)
        .await
        .unwrap_err();
    assert_eq!(err.error_code(), "invalid_state");

    let progress = h
        .orchestrator
        .task_progress(&armed.task_management_id)
        .await
        .unwrap();
    assert_eq!(progress.state, TaskManagementState::Failed);
    assert_eq!(progress.failed, 120);

    h.gate.open();
    let cloned = h
        .orchestrator
        .clone_flow(&armed.flow_id, Some("re-run after cancel".into()))
        .await
        .unwrap();
    assert_ne!(cloned.flow_id, armed.flow_id);
    assert_eq!(cloned.action_ids.len(), 2);

    let snapshot = h.engine.get_flow(&cloned.flow_id).await.unwrap();
    assert_eq!(snapshot.flow.memo.as_deref(), Some("re-run after cancel"));
    assert_eq!(snapshot.flow.cloned_from.as_ref(), Some(&armed.flow_id));

    assert_eq!(h.wait_flow(&cloned.flow_id).await, FlowState::Success);
    h.wait_unlocked(&lb()).await;
    h.wait_flow(&cloned.watch_flow_id).await;

    let task = h
        .store
        .get_task_management(&cloned.task_management_id)
        .await
        .unwrap();
    assert_eq!(task.source, TaskSource::Clone);
    assert_eq!(task.state, TaskManagementState::Success);
    let progress = h
        .orchestrator
        .task_progress(&cloned.task_management_id)
        .await
        .unwrap();
    assert_eq!(progress.success, 120);
}

#[tokio::test]
async fn test_retry_sub_task_revives_flow() {
    let h = Harness::new();
    let request = BuildRequest::new(lb(), "add_rs", "biz-1")
        .phase(Phase::new("flaky_rs", targets(3)).with_retry(RetryPolicy::disabled()));
    let armed = h.orchestrator.build_and_arm_flow(request).await.unwrap();

    h.wait_run(&armed.flow_id, 0, ActionState::Failed).await;
    assert_eq!(
        h.engine.flow_state(&armed.flow_id).await.unwrap(),
        FlowState::Executing
    );

    h.orchestrator
        .retry_sub_task(&lb(), &armed.flow_id, &ActionId::new("a1"))
        .await
        .unwrap();
    assert_eq!(h.wait_flow(&armed.flow_id).await, FlowState::Success);
    h.wait_unlocked(&lb()).await;
    h.wait_flow(&armed.watch_flow_id).await;

    let progress = h
        .orchestrator
        .task_progress(&armed.task_management_id)
        .await
        .unwrap();
    assert_eq!(progress.success, 3);
    assert_eq!(progress.state, TaskManagementState::Success);
}

#[tokio::test]
async fn test_watcher_failure_keeps_lock_until_force_unlock() {
    let h = Harness::with_watch(WatchOptions {
        poll_interval: POLL,
        max_wait: Duration::from_millis(50),
        retry: RetryPolicy::disabled(),
    });
    let armed = h
        .orchestrator
        .build_and_arm_flow(add_targets("gated_rs", 3))
        .await
        .unwrap();

    // Watch action gives up; its flow waits out the failure grace
    h.wait_run(&armed.watch_flow_id, 0, ActionState::Failed).await;
    assert!(h.store.get_lock(&lb()).await.unwrap().is_some());

    let err = h.orchestrator.force_unlock(&lb()).await.unwrap_err();
    assert_eq!(err.error_code(), "invalid_state");

    h.gate.open();
    assert_eq!(h.wait_flow(&armed.flow_id).await, FlowState::Success);
    let err = h
        .orchestrator
        .build_and_arm_flow(add_targets("add_rs", 1))
        .await
        .unwrap_err();
    assert_eq!(err.owner_flow_id(), Some(&armed.flow_id));

    let outcome = h.orchestrator.force_unlock(&lb()).await.unwrap();
    assert_eq!(outcome.owner, armed.flow_id);
    assert_eq!(outcome.status, RelationStatus::Success);
    assert!(h.store.get_lock(&lb()).await.unwrap().is_none());

    let relations = h
        .store
        .list_relations(&RelationFilter {
            flow_id: Some(armed.flow_id.clone()),
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(relations[0].status, RelationStatus::Success);
    let task = h
        .store
        .get_task_management(&armed.task_management_id)
        .await
        .unwrap();
    assert_eq!(task.state, TaskManagementState::Success);

    let err = h.orchestrator.force_unlock(&lb()).await.unwrap_err();
    assert_eq!(err.error_code(), "not_found");
}

#[tokio::test]
async fn test_unknown_flow_relation_not_found() {
    let h = Harness::new();
    let err = h
        .orchestrator
        .get_flow_relation(&lb(), &flowgate_core::FlowId::new("nope"))
        .await
        .unwrap_err();
    assert_eq!(err.error_code(), "not_found");
}

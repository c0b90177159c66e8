#![allow(dead_code)]

use async_trait::async_trait;
use flowgate_controlplane::{
    MemoryStore, Orchestrator, OrchestratorOptions, ResourceStore, WatchOptions,
    control_plane_registry,
};
use flowgate_core::{ActionState, FlowId, FlowState, ResourceRef, RetryPolicy};
use flowgate_engine::{
    ActionContext, ActionExecutor, EngineOptions, ExecutorError, ExecutorRegistry, FlowEngine,
    FlowStateReader, LocalFlowEngine, NoopExecutor,
};
use serde_json::Value;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;
use tokio::sync::watch;

pub const WAIT: Duration = Duration::from_secs(30);
pub const POLL: Duration = Duration::from_millis(10);

/// Holds every action until opened
pub struct Gate {
    open: watch::Sender<bool>,
}

impl Gate {
    pub fn new() -> Self {
        let (open, _) = watch::channel(false);
        Self { open }
    }

    pub fn open(&self) {
        self.open.send_replace(true);
    }
}

#[async_trait]
impl ActionExecutor for Gate {
    async fn execute(&self, _ctx: &ActionContext, params: &Value) -> Result<Value, ExecutorError> {
        let mut rx = self.open.subscribe();
        loop {
            let open = *rx.borrow_and_update();
            if open {
                return Ok(params.clone());
            }
            if rx.changed().await.is_err() {
                return Err(ExecutorError::fatal("gate dropped"));
            }
        }
    }
}

/// Fails fatally on its first call, then succeeds
#[derive(Default)]
pub struct FailOnce {
    calls: AtomicU32,
}

#[async_trait]
impl ActionExecutor for FailOnce {
    async fn execute(&self, _ctx: &ActionContext, params: &Value) -> Result<Value, ExecutorError> {
        if self.calls.fetch_add(1, Ordering::SeqCst) == 0 {
            return Err(ExecutorError::fatal("backend rejected target"));
        }
        Ok(params.clone())
    }
}

/// Fails fatally on every call
pub struct AlwaysFail;

#[async_trait]
impl ActionExecutor for AlwaysFail {
    async fn execute(&self, _ctx: &ActionContext, _params: &Value) -> Result<Value, ExecutorError> {
        Err(ExecutorError::fatal("backend unreachable"))
    }
}

pub struct Harness {
    pub store: Arc<MemoryStore>,
    pub engine: LocalFlowEngine,
    pub orchestrator: Arc<Orchestrator>,
    pub gate: Arc<Gate>,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_watch(watch_options())
    }

    pub fn with_watch(watch: WatchOptions) -> Self {
        Self::with_options(watch, EngineOptions::default())
    }

    pub fn with_options(watch: WatchOptions, engine_options: EngineOptions) -> Self {
        Self::with_engine(watch, engine_options, |engine| Arc::new(engine))
    }

    /// The orchestrator talks to whatever `wrap` builds around the local engine
    pub fn with_engine<F>(watch: WatchOptions, engine_options: EngineOptions, wrap: F) -> Self
    where
        F: FnOnce(LocalFlowEngine) -> Arc<dyn FlowEngine>,
    {
        let store = Arc::new(MemoryStore::new());
        let gate = Arc::new(Gate::new());
        let vendor = ExecutorRegistry::builder()
            .register("add_rs", Arc::new(NoopExecutor))
            .register("create_listener", Arc::new(NoopExecutor))
            .register("gated_rs", gate.clone())
            .register("flaky_rs", Arc::new(FailOnce::default()))
            .register("broken_rs", Arc::new(AlwaysFail))
            .build();

        let options = OrchestratorOptions {
            watch,
            ..OrchestratorOptions::default()
        };
        let dyn_store: Arc<dyn ResourceStore> = store.clone();
        let registry = control_plane_registry(&vendor, dyn_store.clone(), &options);
        let engine = LocalFlowEngine::new(registry.clone(), engine_options);
        let orchestrator = Arc::new(Orchestrator::new(
            wrap(engine.clone()),
            registry,
            dyn_store,
            options,
        ));

        Self {
            store,
            engine,
            orchestrator,
            gate,
        }
    }

    pub async fn wait_flow(&self, flow_id: &FlowId) -> FlowState {
        self.engine.wait_terminal(flow_id, POLL, WAIT).await.unwrap()
    }

    pub async fn wait_unlocked(&self, resource: &ResourceRef) {
        for _ in 0..3000 {
            if self.store.get_lock(resource).await.unwrap().is_none() {
                return;
            }
            tokio::time::sleep(POLL).await;
        }
        panic!("{resource} never unlocked");
    }

    pub async fn wait_state(&self, flow_id: &FlowId, state: FlowState) {
        for _ in 0..3000 {
            if self.engine.flow_state(flow_id).await.unwrap() == state {
                return;
            }
            tokio::time::sleep(POLL).await;
        }
        panic!("flow {flow_id} never reached {state}");
    }

    /// Wait until the action at `index` reports `state`
    pub async fn wait_run(&self, flow_id: &FlowId, index: usize, state: ActionState) {
        for _ in 0..3000 {
            let snapshot = self.engine.get_flow(flow_id).await.unwrap();
            if snapshot.runs[index].state == state {
                return;
            }
            tokio::time::sleep(POLL).await;
        }
        panic!("action {index} of flow {flow_id} never reached {state}");
    }
}

pub fn watch_options() -> WatchOptions {
    WatchOptions {
        poll_interval: POLL,
        max_wait: Duration::from_secs(60),
        retry: RetryPolicy::new(3, 10, 20).unwrap(),
    }
}

pub fn lb() -> ResourceRef {
    ResourceRef::new("lb-1", "LB")
}

pub fn targets(n: usize) -> Vec<Value> {
    (0..n)
        .map(|i| serde_json::json!({ "rs_id": format!("rs-{i}"), "port": 8080 }))
        .collect()
}

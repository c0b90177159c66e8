use flowgate_config::FlowgateConfig;
use flowgate_controlplane::{
    MemoryStore, Orchestrator, ResourceStore, Tables, control_plane_registry,
};
use flowgate_engine::{ExecutorRegistry, LocalFlowEngine, NoopExecutor};
use std::sync::Arc;

/// Action kind served by the built-in executor
pub const NOOP_KIND: &str = "noop";

/// Shared application state passed to all route handlers.
#[derive(Clone)]
pub struct AppState {
    pub orchestrator: Arc<Orchestrator>,
    pub store: Arc<MemoryStore>,
}

impl AppState {
    /// Wire store, engine and orchestrator from `config` on top of `tables`
    pub fn build(config: &FlowgateConfig, tables: Tables) -> Self {
        let store = Arc::new(MemoryStore::from_tables(tables));
        let dyn_store: Arc<dyn ResourceStore> = store.clone();
        let options = config.orchestrator_options();

        let vendor = ExecutorRegistry::builder()
            .register(NOOP_KIND, Arc::new(NoopExecutor))
            .build();
        let registry = control_plane_registry(&vendor, dyn_store.clone(), &options);
        let engine = LocalFlowEngine::new(registry.clone(), config.engine_options());
        let orchestrator = Orchestrator::new(Arc::new(engine), registry, dyn_store, options);

        Self {
            orchestrator: Arc::new(orchestrator),
            store,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flowgate_controlplane::SnapshotFile;
    use flowgate_core::{FlowId, ResourceFlowLock, ResourceRef, TaskKind};

    #[tokio::test]
    async fn restored_state_keeps_locks() {
        let temp_dir = tempfile::tempdir().unwrap();
        let file = SnapshotFile::new(temp_dir.path().join("state.json"));
        let config = FlowgateConfig::default();

        let first = AppState::build(&config, file.load().await.unwrap());
        first
            .store
            .lock_resource(ResourceFlowLock::new(
                ResourceRef::new("lb-1", "LB"),
                FlowId::new("flow-1"),
                TaskKind::new("add_rs"),
            ))
            .await
            .unwrap();
        file.save(&first.store.snapshot().await).await.unwrap();

        let second = AppState::build(&config, file.load().await.unwrap());
        let lock = second
            .store
            .get_lock(&ResourceRef::new("lb-1", "LB"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(lock.owner, FlowId::new("flow-1"));

        let outcome = second
            .orchestrator
            .force_unlock(&ResourceRef::new("lb-1", "LB"))
            .await
            .unwrap();
        assert_eq!(outcome.owner, FlowId::new("flow-1"));
    }
}

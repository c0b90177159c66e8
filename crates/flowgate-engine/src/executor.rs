//! Action executors and the kind registry

use crate::contract::FlowStateReader;
use crate::error::{EngineError, Result};
use async_trait::async_trait;
use flowgate_core::{ActionId, ActionKind, FlowId, ShareData};
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;

/// Failure of a single attempt
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ExecutorError {
    /// Retried according to the action's retry policy
    #[error("{0}")]
    Retryable(String),

    /// Fails the action immediately
    #[error("{0}")]
    Fatal(String),
}

impl ExecutorError {
    pub fn retryable(message: impl Into<String>) -> Self {
        Self::Retryable(message.into())
    }

    pub fn fatal(message: impl Into<String>) -> Self {
        Self::Fatal(message.into())
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Retryable(_))
    }
}

/// What an executor sees while running an action
#[derive(Clone)]
pub struct ActionContext {
    pub flow_id: FlowId,
    pub action_id: ActionId,
    pub kind: ActionKind,
    /// 1-based attempt number
    pub attempt: u32,
    pub share_data: ShareData,
    /// Read-only access to every flow known to the engine
    pub flows: Arc<dyn FlowStateReader>,
}

impl std::fmt::Debug for ActionContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ActionContext")
            .field("flow_id", &self.flow_id)
            .field("action_id", &self.action_id)
            .field("kind", &self.kind)
            .field("attempt", &self.attempt)
            .finish_non_exhaustive()
    }
}

/// Final result of an action
#[derive(Debug, Clone, PartialEq)]
pub enum ActionOutcome {
    Succeeded(serde_json::Value),
    /// The flow settled as failed with this action failed
    Failed(String),
}

/// Logic behind an action kind
#[async_trait]
pub trait ActionExecutor: Send + Sync {
    /// Run one attempt
    async fn execute(
        &self,
        ctx: &ActionContext,
        params: &serde_json::Value,
    ) -> std::result::Result<serde_json::Value, ExecutorError>;

    /// Called once the action's outcome is final
    async fn on_settled(&self, _ctx: &ActionContext, _outcome: &ActionOutcome) {}
}

/// Executor that succeeds immediately and echoes its params
pub struct NoopExecutor;

#[async_trait]
impl ActionExecutor for NoopExecutor {
    async fn execute(
        &self,
        ctx: &ActionContext,
        params: &serde_json::Value,
    ) -> std::result::Result<serde_json::Value, ExecutorError> {
        tracing::debug!(flow_id = %ctx.flow_id, action_id = %ctx.action_id, "noop action");
        Ok(params.clone())
    }
}

/// Immutable mapping from action kind to executor, resolved once at startup
#[derive(Clone, Default)]
pub struct ExecutorRegistry {
    executors: Arc<HashMap<ActionKind, Arc<dyn ActionExecutor>>>,
}

impl ExecutorRegistry {
    pub fn builder() -> ExecutorRegistryBuilder {
        ExecutorRegistryBuilder::default()
    }

    pub fn resolve(&self, kind: &ActionKind) -> Result<Arc<dyn ActionExecutor>> {
        self.executors
            .get(kind)
            .cloned()
            .ok_or_else(|| EngineError::UnsupportedKind(kind.clone()))
    }

    pub fn contains(&self, kind: &ActionKind) -> bool {
        self.executors.contains_key(kind)
    }

    /// Registered kinds, sorted
    pub fn kinds(&self) -> Vec<ActionKind> {
        let mut kinds: Vec<_> = self.executors.keys().cloned().collect();
        kinds.sort();
        kinds
    }

    pub fn iter(&self) -> impl Iterator<Item = (&ActionKind, &Arc<dyn ActionExecutor>)> {
        self.executors.iter()
    }

    pub fn len(&self) -> usize {
        self.executors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.executors.is_empty()
    }
}

impl std::fmt::Debug for ExecutorRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutorRegistry")
            .field("kinds", &self.kinds())
            .finish()
    }
}

#[derive(Default)]
pub struct ExecutorRegistryBuilder {
    executors: HashMap<ActionKind, Arc<dyn ActionExecutor>>,
}

impl ExecutorRegistryBuilder {
    /// Register `executor` for `kind`, replacing any previous registration
    pub fn register(
        mut self,
        kind: impl Into<ActionKind>,
        executor: Arc<dyn ActionExecutor>,
    ) -> Self {
        self.executors.insert(kind.into(), executor);
        self
    }

    pub fn build(self) -> ExecutorRegistry {
        ExecutorRegistry {
            executors: Arc::new(self.executors),
        }
    }
}

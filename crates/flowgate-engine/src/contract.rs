//! Flow engine contract
//!
//! The orchestrator talks to the engine only through these traits, so a
//! remote engine can replace [`LocalFlowEngine`](crate::LocalFlowEngine)
//! without touching the control plane.

use crate::error::{EngineError, Result};
use async_trait::async_trait;
use flowgate_core::{Action, ActionId, ActionKind, ActionState, Flow, FlowId, FlowState, ShareData};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Read-only view of flow states
#[async_trait]
pub trait FlowStateReader: Send + Sync {
    /// Current state of a flow
    async fn flow_state(&self, flow_id: &FlowId) -> Result<FlowState>;

    /// Wait until the flow reaches a terminal state
    ///
    /// The default implementation polls [`flow_state`](Self::flow_state)
    /// every `poll_interval`.
    async fn wait_terminal(
        &self,
        flow_id: &FlowId,
        poll_interval: Duration,
        max_wait: Duration,
    ) -> Result<FlowState> {
        // None: the wait is too long to represent and never expires
        let deadline = tokio::time::Instant::now().checked_add(max_wait);
        loop {
            let state = self.flow_state(flow_id).await?;
            if state.is_terminal() {
                return Ok(state);
            }
            let next_poll = tokio::time::Instant::now().checked_add(poll_interval);
            let expired = match (deadline, next_poll) {
                (Some(deadline), Some(next_poll)) => next_poll > deadline,
                (Some(_), None) => true,
                (None, _) => false,
            };
            if expired {
                return Err(EngineError::WaitTimeout(flow_id.clone()));
            }
            tokio::time::sleep(poll_interval).await;
        }
    }
}

/// Request to create a flow from an explicit action list
#[derive(Debug, Clone)]
pub struct CustomFlowSpec {
    pub name: String,
    pub share_data: ShareData,
    pub actions: Vec<Action>,
    /// Create the flow in `Init` (not runnable) instead of `Pending`
    pub init_state: bool,
    /// Overrides the engine's default flow timeout
    pub timeout: Option<Duration>,
}

impl CustomFlowSpec {
    pub fn new(name: impl Into<String>, actions: Vec<Action>) -> Self {
        Self {
            name: name.into(),
            share_data: ShareData::new(),
            actions,
            init_state: true,
            timeout: None,
        }
    }

    pub fn with_share_data(mut self, share_data: ShareData) -> Self {
        self.share_data = share_data;
        self
    }

    pub fn runnable(mut self) -> Self {
        self.init_state = false;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

/// Request to create a single-action flow from a registered template
///
/// Template flows are always created runnable.
#[derive(Debug, Clone)]
pub struct TemplateFlowSpec {
    pub name: String,
    pub share_data: ShareData,
    pub kind: ActionKind,
    pub params: serde_json::Value,
    pub retry: flowgate_core::RetryPolicy,
    pub timeout: Option<Duration>,
}

/// Run bookkeeping for one action
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionRun {
    pub action_id: ActionId,
    pub kind: ActionKind,
    pub state: ActionState,
    pub attempts: u32,
    pub last_error: Option<String>,
    pub output: Option<serde_json::Value>,
}

impl ActionRun {
    pub fn pending(action: &Action) -> Self {
        Self {
            action_id: action.id.clone(),
            kind: action.kind.clone(),
            state: ActionState::Pending,
            attempts: 0,
            last_error: None,
            output: None,
        }
    }
}

/// A flow together with its per-action run state
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlowSnapshot {
    pub flow: Flow,
    pub runs: Vec<ActionRun>,
}

impl FlowSnapshot {
    pub fn run(&self, action_id: &ActionId) -> Option<&ActionRun> {
        self.runs.iter().find(|r| &r.action_id == action_id)
    }
}

/// Operations the control plane consumes from a flow engine
#[async_trait]
pub trait FlowEngine: FlowStateReader {
    /// Engine name for logs
    fn name(&self) -> &str;

    async fn create_custom_flow(&self, spec: CustomFlowSpec) -> Result<FlowId>;

    async fn create_template_flow(&self, spec: TemplateFlowSpec) -> Result<FlowId>;

    /// Move a flow from `source` to `target`
    ///
    /// Callers may only arm a flow (`Init → Pending`); every other transition
    /// is owned by the engine.
    async fn update_flow_state(
        &self,
        flow_id: &FlowId,
        source: FlowState,
        target: FlowState,
    ) -> Result<()>;

    /// Cancel an `Executing` flow
    async fn cancel_flow(&self, flow_id: &FlowId) -> Result<()>;

    /// Re-run a failed action of an `Executing` flow
    async fn retry_action(&self, flow_id: &FlowId, action_id: &ActionId) -> Result<()>;

    /// Copy a `Success`, `Cancelled` or `TimedOut` flow into a new `Init` flow
    async fn clone_flow(&self, flow_id: &FlowId, memo: Option<String>) -> Result<FlowId>;

    async fn get_flow(&self, flow_id: &FlowId) -> Result<FlowSnapshot>;
}

//! Actions: the executable units of a flow

use crate::ids::ActionId;
use crate::retry::RetryPolicy;
use serde::{Deserialize, Serialize};

/// Names the executor logic that runs an action (`add_rs`, `res_flow_watch`, ...)
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ActionKind(String);

impl ActionKind {
    pub fn new(kind: impl Into<String>) -> Self {
        Self(kind.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for ActionKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ActionKind {
    fn from(kind: &str) -> Self {
        Self(kind.to_string())
    }
}

/// One unit of executable work inside a flow
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Action {
    /// Identifier, unique within the flow
    pub id: ActionId,

    /// Executor to invoke
    pub kind: ActionKind,

    /// Opaque executor payload
    #[serde(default)]
    pub params: serde_json::Value,

    /// Predecessors that must succeed before this action runs
    #[serde(default)]
    pub depends_on: Vec<ActionId>,

    #[serde(default)]
    pub retry: RetryPolicy,
}

impl Action {
    pub fn new(id: ActionId, kind: impl Into<ActionKind>) -> Self {
        Self {
            id,
            kind: kind.into(),
            params: serde_json::Value::Null,
            depends_on: Vec::new(),
            retry: RetryPolicy::default(),
        }
    }

    pub fn with_params(mut self, params: serde_json::Value) -> Self {
        self.params = params;
        self
    }

    pub fn with_depends_on(mut self, depends_on: Vec<ActionId>) -> Self {
        self.depends_on = depends_on;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }
}

/// Execution state of a single action
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionState {
    Pending,
    Running,
    Success,
    Failed,
    Cancelled,
}

impl ActionState {
    pub fn is_settled(&self) -> bool {
        matches!(
            self,
            ActionState::Success | ActionState::Failed | ActionState::Cancelled
        )
    }
}

impl std::fmt::Display for ActionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ActionState::Pending => write!(f, "pending"),
            ActionState::Running => write!(f, "running"),
            ActionState::Success => write!(f, "success"),
            ActionState::Failed => write!(f, "failed"),
            ActionState::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// Explicit source of action identifiers
///
/// The sequence is a plain value: taking an id returns the id together with
/// the advanced sequence, so graph construction never touches shared state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ActionIdSeq {
    next: u64,
}

impl Default for ActionIdSeq {
    fn default() -> Self {
        Self { next: 1 }
    }
}

impl ActionIdSeq {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start issuing ids at `next` (`a{next}`)
    pub fn starting_at(next: u64) -> Self {
        Self { next: next.max(1) }
    }

    pub fn peek(&self) -> ActionId {
        ActionId::new(format!("a{}", self.next))
    }

    #[must_use]
    pub fn take(self) -> (ActionId, Self) {
        (self.peek(), Self { next: self.next + 1 })
    }
}

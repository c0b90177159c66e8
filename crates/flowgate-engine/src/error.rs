//! Flow engine error types

use flowgate_core::{ActionId, ActionKind, CoreError, FlowId, FlowState};
use thiserror::Error;

/// Flow engine errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EngineError {
    #[error("Flow not found: {0}")]
    FlowNotFound(FlowId),

    #[error("Action {action_id} not found in flow {flow_id}")]
    ActionNotFound { flow_id: FlowId, action_id: ActionId },

    #[error("Cannot {operation} flow {flow_id} in state {state}")]
    InvalidState {
        flow_id: FlowId,
        operation: &'static str,
        state: FlowState,
    },

    #[error("Action {action_id} of flow {flow_id} is {state} and cannot be retried")]
    ActionNotRetryable {
        flow_id: FlowId,
        action_id: ActionId,
        state: String,
    },

    #[error("Unsupported action kind: {0}")]
    UnsupportedKind(ActionKind),

    #[error("Flow {flow_id} is {actual}, expected {expected}")]
    StateMismatch {
        flow_id: FlowId,
        expected: FlowState,
        actual: FlowState,
    },

    #[error("Transition {from} -> {to} is not available to callers")]
    TransitionNotAllowed { from: FlowState, to: FlowState },

    #[error("Timed out waiting for flow {0} to finish")]
    WaitTimeout(FlowId),

    #[error("Invalid action graph: {0}")]
    Graph(#[from] CoreError),
}

pub type Result<T> = std::result::Result<T, EngineError>;

//! Control plane error types

use crate::store::StoreError;
use flowgate_core::{CoreError, FlowId, ResourceRef};
use flowgate_engine::EngineError;
use thiserror::Error;

/// Errors returned by the orchestrator and its components
#[derive(Error, Debug)]
pub enum OrchestratorError {
    /// The resource lock is held by another flow
    #[error("Resource {resource} is locked by flow {owner}")]
    Conflict { resource: ResourceRef, owner: FlowId },

    /// A recent relation still shows a flow executing against the resource
    #[error("Flow {owner} is still executing against {resource}")]
    TaskExecuting { resource: ResourceRef, owner: FlowId },

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Flow construction failed: {0}")]
    ConstructionFailed(String),

    #[error("Action {action} depends on unknown action {missing}")]
    DependencyNotFound { action: String, missing: String },

    #[error("Unsupported action kind: {0}")]
    UnsupportedKind(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid request: {0}")]
    Validation(String),

    #[error("Store error: {0}")]
    Store(StoreError),

    #[error("Flow engine error: {0}")]
    Engine(EngineError),
}

impl OrchestratorError {
    /// Stable machine-readable code
    pub fn error_code(&self) -> &'static str {
        match self {
            OrchestratorError::Conflict { .. } => "conflict",
            OrchestratorError::TaskExecuting { .. } => "task_executing",
            OrchestratorError::InvalidState(_) => "invalid_state",
            OrchestratorError::ConstructionFailed(_) => "construction_failed",
            OrchestratorError::DependencyNotFound { .. } => "dependency_not_found",
            OrchestratorError::UnsupportedKind(_) => "unsupported_kind",
            OrchestratorError::NotFound(_) => "not_found",
            OrchestratorError::Validation(_) => "validation",
            OrchestratorError::Store(_) => "store",
            OrchestratorError::Engine(_) => "engine",
        }
    }

    /// Flow holding the resource, for conflict errors
    pub fn owner_flow_id(&self) -> Option<&FlowId> {
        match self {
            OrchestratorError::Conflict { owner, .. }
            | OrchestratorError::TaskExecuting { owner, .. } => Some(owner),
            _ => None,
        }
    }
}

impl From<StoreError> for OrchestratorError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::LockHeld { resource, owner } => {
                OrchestratorError::Conflict { resource, owner }
            }
            StoreError::NotFound(what) => OrchestratorError::NotFound(what),
            other => OrchestratorError::Store(other),
        }
    }
}

impl From<CoreError> for OrchestratorError {
    fn from(err: CoreError) -> Self {
        match err {
            CoreError::DependencyNotFound { action, missing } => {
                OrchestratorError::DependencyNotFound { action, missing }
            }
            other => OrchestratorError::ConstructionFailed(other.to_string()),
        }
    }
}

impl From<EngineError> for OrchestratorError {
    fn from(err: EngineError) -> Self {
        match err {
            EngineError::FlowNotFound(_) | EngineError::ActionNotFound { .. } => {
                OrchestratorError::NotFound(err.to_string())
            }
            EngineError::InvalidState { .. }
            | EngineError::ActionNotRetryable { .. }
            | EngineError::StateMismatch { .. }
            | EngineError::TransitionNotAllowed { .. } => {
                OrchestratorError::InvalidState(err.to_string())
            }
            EngineError::UnsupportedKind(kind) => {
                OrchestratorError::UnsupportedKind(kind.to_string())
            }
            EngineError::Graph(core) => core.into(),
            EngineError::WaitTimeout(_) => OrchestratorError::Engine(err),
        }
    }
}

pub type Result<T> = std::result::Result<T, OrchestratorError>;

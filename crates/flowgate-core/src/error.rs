//! Core error types

use crate::flow::FlowState;
use thiserror::Error;

/// Errors raised while building or validating flowgate records
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CoreError {
    #[error("Chunk size must be greater than zero")]
    InvalidChunkSize,

    #[error("Action {action} depends on unknown action {missing}")]
    DependencyNotFound { action: String, missing: String },

    #[error("Action {action} references {dependency} before it is assigned")]
    ForwardReference { action: String, dependency: String },

    #[error("Duplicate action id: {0}")]
    DuplicateActionId(String),

    #[error("Dependency cycle detected at action {0}")]
    CycleDetected(String),

    #[error("Invalid retry policy: {0}")]
    InvalidRetryPolicy(String),

    #[error("Invalid flow state transition: {from} -> {to}")]
    InvalidTransition { from: FlowState, to: FlowState },

    #[error("Unknown {kind}: {value}")]
    UnknownVariant { kind: &'static str, value: String },

    #[error("Action payload error: {0}")]
    Payload(String),
}

pub type Result<T> = std::result::Result<T, CoreError>;

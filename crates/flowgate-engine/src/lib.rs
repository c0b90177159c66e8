//! flowgate flow engine
//!
//! Defines the contract the control plane uses to run action graphs
//! ([`FlowEngine`]) and ships [`LocalFlowEngine`], which runs flows as tokio
//! tasks in the current process.
//!
//! Action kinds are bound to executors through an [`ExecutorRegistry`] built
//! once at startup. A flow referencing a kind that is not registered is
//! rejected when it is created, never while it runs.

pub mod contract;
pub mod error;
pub mod executor;
pub mod local;

// Re-exports
pub use contract::{
    ActionRun, CustomFlowSpec, FlowEngine, FlowSnapshot, FlowStateReader, TemplateFlowSpec,
};
pub use error::{EngineError, Result};
pub use executor::{
    ActionContext, ActionExecutor, ActionOutcome, ExecutorError, ExecutorRegistry,
    ExecutorRegistryBuilder, NoopExecutor,
};
pub use local::{EngineOptions, LocalFlowEngine};

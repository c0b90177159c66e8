//! flowgate core model
//!
//! This crate holds the pure, I/O-free half of flowgate: the records that
//! describe a resource-locked workflow and the algorithms that build them.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────┐
//! │               flowgate-controlplane              │
//! │   (lock manager / watcher / task tracker)        │
//! └─────────────────┬───────────────────────────────┘
//!                   │
//! ┌─────────────────▼───────────────────────────────┐
//! │                 flowgate-core                    │
//! │  ┌──────────────┐  ┌──────────────┐              │
//! │  │ RetryPolicy  │  │ Graph builder│              │
//! │  └──────────────┘  └──────────────┘              │
//! │  ┌──────────────────────────────────────────┐   │
//! │  │ Flow / Action / Lock / Relation / Task    │   │
//! │  └──────────────────────────────────────────┘   │
//! └─────────────────────────────────────────────────┘
//! ```

pub mod action;
pub mod error;
pub mod flow;
pub mod graph;
pub mod ids;
pub mod lock;
pub mod resource;
pub mod retry;
pub mod task;

// Re-exports
pub use action::{Action, ActionIdSeq, ActionKind, ActionState};
pub use error::{CoreError, Result};
pub use flow::{Flow, FlowState, ShareData};
pub use graph::{
    ActionGraphBuilder, ChunkSpan, PhaseChain, build_chain, concat_phases, validate_graph,
};
pub use ids::{ActionId, FlowId, TaskDetailId, TaskManagementId};
pub use lock::{RelationStatus, ResourceFlowLock, ResourceFlowRelation};
pub use resource::{ResourceRef, SubResources, TaskKind};
pub use retry::RetryPolicy;
pub use task::{
    TaskDetail, TaskDetailState, TaskManagement, TaskManagementState, TaskSource,
};

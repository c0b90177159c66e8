//! flowgate control plane
//!
//! Turns business operations into resource-locked flows.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────┐
//! │                  Orchestrator                    │
//! │        build → lock → watch → arm protocol       │
//! └───────┬──────────────┬──────────────┬───────────┘
//!         │              │              │
//! ┌───────▼──────┐ ┌─────▼──────┐ ┌─────▼──────────┐
//! │ Lock manager │ │ Task       │ │ Flow engine    │
//! │ (locks +     │ │ tracker    │ │ (+ watcher and │
//! │  relations)  │ │            │ │  tracked exec) │
//! └───────┬──────┘ └─────┬──────┘ └────────────────┘
//!         │              │
//! ┌───────▼──────────────▼──────┐
//! │     ResourceStore (trait)    │
//! │  MemoryStore + SnapshotFile  │
//! └──────────────────────────────┘
//! ```

pub mod error;
pub mod lock;
pub mod orchestrator;
pub mod store;
pub mod task;
pub mod tracking;
pub mod watcher;

// Re-exports
pub use error::{OrchestratorError, Result};
pub use lock::{DEFAULT_LOOKBACK, LockProof, ResourceLockManager};
pub use orchestrator::{
    ArmedFlow, BuildRequest, DEFAULT_CHUNK_SIZE, FlowRelationView, ForceUnlockOutcome,
    Orchestrator, OrchestratorOptions, Phase, control_plane_registry,
};
pub use store::{
    MemoryStore, RelationFilter, ResourceStore, SnapshotFile, StoreError, Tables,
    TaskDetailFilter, TaskDetailUpdate, TaskManagementUpdate,
};
pub use task::{TaskProgress, TaskTracker};
pub use tracking::TrackedExecutor;
pub use watcher::{WATCH_ACTION_KIND, WatchOptions, WatchParams, WatcherExecutor, watch_flow_spec};

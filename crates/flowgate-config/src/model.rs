//! Daemon configuration model

use flowgate_controlplane::{DEFAULT_CHUNK_SIZE, OrchestratorOptions, WatchOptions};
use flowgate_core::{ActionKind, RetryPolicy};
use flowgate_engine::EngineOptions;
use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

pub const DEFAULT_LISTEN: &str = "127.0.0.1:7420";
pub const DEFAULT_LOOKBACK_DAYS: u64 = 7;

#[derive(Debug, Clone, PartialEq)]
pub struct FlowgateConfig {
    /// HTTP listen address
    pub listen: SocketAddr,
    pub lookback_days: u64,
    /// JSON snapshot of the resource store, restored on start
    pub state_file: Option<PathBuf>,
    pub watcher: WatcherConfig,
    pub engine: EngineConfig,
    pub retry: RetryPolicy,
    pub default_chunk_size: usize,
    /// Chunk size per action kind
    pub chunk_sizes: BTreeMap<String, usize>,
}

impl Default for FlowgateConfig {
    fn default() -> Self {
        Self {
            listen: SocketAddr::from(([127, 0, 0, 1], 7420)),
            lookback_days: DEFAULT_LOOKBACK_DAYS,
            state_file: None,
            watcher: WatcherConfig::default(),
            engine: EngineConfig::default(),
            retry: RetryPolicy::default(),
            default_chunk_size: DEFAULT_CHUNK_SIZE,
            chunk_sizes: BTreeMap::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WatcherConfig {
    pub poll_interval_ms: u64,
    pub max_wait_secs: u64,
}

impl Default for WatcherConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 500,
            max_wait_secs: 24 * 60 * 60,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EngineConfig {
    pub flow_timeout_secs: u64,
    pub failure_grace_secs: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            flow_timeout_secs: 3600,
            failure_grace_secs: 300,
        }
    }
}

impl FlowgateConfig {
    pub fn lookback(&self) -> Duration {
        Duration::from_secs(self.lookback_days.saturating_mul(24 * 60 * 60))
    }

    pub fn orchestrator_options(&self) -> OrchestratorOptions {
        OrchestratorOptions {
            lookback: self.lookback(),
            default_chunk_size: self.default_chunk_size,
            chunk_sizes: self
                .chunk_sizes
                .iter()
                .map(|(kind, size)| (ActionKind::new(kind.clone()), *size))
                .collect(),
            default_retry: self.retry,
            watch: WatchOptions {
                poll_interval: Duration::from_millis(self.watcher.poll_interval_ms),
                max_wait: Duration::from_secs(self.watcher.max_wait_secs),
                retry: self.retry,
            },
        }
    }

    pub fn engine_options(&self) -> EngineOptions {
        EngineOptions {
            flow_timeout: Duration::from_secs(self.engine.flow_timeout_secs),
            failure_grace: Duration::from_secs(self.engine.failure_grace_secs),
        }
    }
}

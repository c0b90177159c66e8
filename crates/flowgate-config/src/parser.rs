//! KDL parsing of `flowgate.kdl`

use crate::error::{ConfigError, Result};
use crate::model::{EngineConfig, FlowgateConfig, WatcherConfig};
use flowgate_core::RetryPolicy;
use kdl::{KdlDocument, KdlNode};
use std::net::SocketAddr;
use std::path::PathBuf;

const MAX_LOOKBACK_DAYS: u64 = 36_500;
const MAX_DURATION_SECS: u64 = 10 * 365 * 24 * 60 * 60;
const MAX_POLL_INTERVAL_MS: u64 = 60 * 60 * 1000;

/// Parse a configuration document; absent nodes keep their defaults
pub fn parse_config(content: &str) -> Result<FlowgateConfig> {
    let doc: KdlDocument = content.parse()?;
    let mut config = FlowgateConfig::default();

    for node in doc.nodes() {
        match node.name().value() {
            "listen" => {
                let addr = string_arg(node)?;
                config.listen = addr.parse::<SocketAddr>().map_err(|e| {
                    ConfigError::Invalid(format!("listen address '{addr}': {e}"))
                })?;
            }
            "lookback-days" | "lookback_days" => {
                let value = positive(node, int_arg(node, 0)?)?;
                config.lookback_days = bounded(node, value, MAX_LOOKBACK_DAYS)?;
            }
            "state-file" | "state_file" => {
                config.state_file = Some(PathBuf::from(string_arg(node)?));
            }
            "watcher" => config.watcher = parse_watcher(node)?,
            "engine" => config.engine = parse_engine(node)?,
            "retry" => config.retry = parse_retry(node)?,
            "chunk-size" | "chunk_size" => parse_chunk_size(node, &mut config)?,
            other => {
                tracing::warn!(node = other, "unknown configuration node ignored");
            }
        }
    }

    Ok(config)
}

fn parse_watcher(node: &KdlNode) -> Result<WatcherConfig> {
    let mut watcher = WatcherConfig::default();
    for child in children(node) {
        match child.name().value() {
            "poll-interval-ms" | "poll_interval_ms" => {
                let value = positive(child, int_arg(child, 0)?)?;
                watcher.poll_interval_ms = bounded(child, value, MAX_POLL_INTERVAL_MS)?;
            }
            "max-wait-secs" | "max_wait_secs" => {
                let value = positive(child, int_arg(child, 0)?)?;
                watcher.max_wait_secs = bounded(child, value, MAX_DURATION_SECS)?;
            }
            other => tracing::warn!(node = other, "unknown watcher setting ignored"),
        }
    }
    Ok(watcher)
}

fn parse_engine(node: &KdlNode) -> Result<EngineConfig> {
    let mut engine = EngineConfig::default();
    for child in children(node) {
        match child.name().value() {
            "flow-timeout-secs" | "flow_timeout_secs" => {
                let value = positive(child, int_arg(child, 0)?)?;
                engine.flow_timeout_secs = bounded(child, value, MAX_DURATION_SECS)?;
            }
            "failure-grace-secs" | "failure_grace_secs" => {
                engine.failure_grace_secs = bounded(child, int_arg(child, 0)?, MAX_DURATION_SECS)?;
            }
            other => tracing::warn!(node = other, "unknown engine setting ignored"),
        }
    }
    Ok(engine)
}

fn parse_retry(node: &KdlNode) -> Result<RetryPolicy> {
    let mut retry = RetryPolicy::default();
    for child in children(node) {
        match child.name().value() {
            "enabled" => {
                retry.enabled = child
                    .entries()
                    .first()
                    .and_then(|e| e.value().as_bool())
                    .ok_or_else(|| {
                        ConfigError::Invalid("retry enabled expects #true or #false".into())
                    })?;
            }
            "max-retries" | "max_retries" => {
                retry.max_retries = u32::try_from(int_arg(child, 0)?).map_err(|_| {
                    ConfigError::Invalid("retry max-retries is out of range".into())
                })?;
            }
            "min-backoff-ms" | "min_backoff_ms" => retry.min_backoff_ms = int_arg(child, 0)?,
            "max-backoff-ms" | "max_backoff_ms" => retry.max_backoff_ms = int_arg(child, 0)?,
            other => tracing::warn!(node = other, "unknown retry setting ignored"),
        }
    }
    retry
        .validate()
        .map_err(|e| ConfigError::Invalid(e.to_string()))?;
    Ok(retry)
}

/// `chunk-size 100` sets the default, `chunk-size "add_rs" 20` one kind
fn parse_chunk_size(node: &KdlNode, config: &mut FlowgateConfig) -> Result<()> {
    let kind = node
        .entries()
        .first()
        .and_then(|e| e.value().as_string())
        .map(str::to_string);

    match kind {
        Some(kind) => {
            let size = to_chunk_size(node, int_arg(node, 1)?)?;
            config.chunk_sizes.insert(kind, size);
        }
        None => config.default_chunk_size = to_chunk_size(node, int_arg(node, 0)?)?,
    }
    Ok(())
}

fn children(node: &KdlNode) -> impl Iterator<Item = &KdlNode> {
    node.children().into_iter().flat_map(|doc| doc.nodes())
}

fn string_arg(node: &KdlNode) -> Result<String> {
    node.entries()
        .first()
        .and_then(|e| e.value().as_string())
        .map(str::to_string)
        .ok_or_else(|| {
            ConfigError::Invalid(format!("{} requires a string value", node.name().value()))
        })
}

fn int_arg(node: &KdlNode, index: usize) -> Result<u64> {
    let value = node
        .entries()
        .get(index)
        .and_then(|e| e.value().as_integer())
        .ok_or_else(|| {
            ConfigError::Invalid(format!("{} requires an integer value", node.name().value()))
        })?;
    u64::try_from(value).map_err(|_| {
        ConfigError::Invalid(format!(
            "{} must be a non-negative integer, got {value}",
            node.name().value()
        ))
    })
}

fn positive(node: &KdlNode, value: u64) -> Result<u64> {
    if value == 0 {
        return Err(ConfigError::Invalid(format!(
            "{} must be greater than zero",
            node.name().value()
        )));
    }
    Ok(value)
}

fn bounded(node: &KdlNode, value: u64, max: u64) -> Result<u64> {
    if value > max {
        return Err(ConfigError::Invalid(format!(
            "{} must be at most {max}, got {value}",
            node.name().value()
        )));
    }
    Ok(value)
}

fn to_chunk_size(node: &KdlNode, value: u64) -> Result<usize> {
    let value = positive(node, value)?;
    usize::try_from(value)
        .map_err(|_| ConfigError::Invalid(format!("chunk size {value} is out of range")))
}

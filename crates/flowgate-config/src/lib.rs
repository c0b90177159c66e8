//! flowgate configuration
//!
//! Discovers `flowgate.kdl`, parses it and turns it into the runtime options of
//! the engine and the orchestrator.

pub mod error;
pub mod model;
pub mod parser;

pub use error::*;
pub use model::{EngineConfig, FlowgateConfig, WatcherConfig};
pub use parser::parse_config;

use std::path::{Path, PathBuf};

/// Environment variable naming the configuration file directly
pub const CONFIG_ENV: &str = "FLOWGATE_CONFIG";

const CANDIDATES: [&str; 2] = ["flowgate.local.kdl", "flowgate.kdl"];

/// Directory holding the global configuration
pub fn get_config_dir() -> Result<PathBuf> {
    let config_dir = dirs::config_dir()
        .ok_or(ConfigError::ConfigDirNotFound)?
        .join("flowgate");
    Ok(config_dir)
}

/// Locate the configuration file
///
/// Search order:
/// 1. `FLOWGATE_CONFIG` (direct path)
/// 2. current directory: `flowgate.local.kdl`, `flowgate.kdl`
/// 3. `./.flowgate/` with the same names
/// 4. `~/.config/flowgate/flowgate.kdl`
pub fn find_config_file() -> Result<PathBuf> {
    if let Ok(config_path) = std::env::var(CONFIG_ENV) {
        let path = PathBuf::from(config_path);
        if path.exists() {
            return Ok(path);
        }
        tracing::warn!(path = %path.display(), "{CONFIG_ENV} points to a missing file");
    }

    let current_dir = std::env::current_dir()?;
    for filename in &CANDIDATES {
        let path = current_dir.join(filename);
        if path.exists() {
            return Ok(path);
        }
    }

    let local_dir = current_dir.join(".flowgate");
    if local_dir.is_dir() {
        for filename in &CANDIDATES {
            let path = local_dir.join(filename);
            if path.exists() {
                return Ok(path);
            }
        }
    }

    if let Ok(config_dir) = get_config_dir() {
        let global_config = config_dir.join("flowgate.kdl");
        if global_config.exists() {
            return Ok(global_config);
        }
    }

    Err(ConfigError::NotFound)
}

/// Read and parse the file at `path`
pub fn load(path: &Path) -> Result<FlowgateConfig> {
    let content = std::fs::read_to_string(path)?;
    let config = parse_config(&content)?;
    tracing::debug!(path = %path.display(), "configuration loaded");
    Ok(config)
}

/// Load `explicit` if given, otherwise the discovered file, otherwise defaults
///
/// An explicit path that cannot be read is an error. Returns the path the
/// configuration came from, if any.
pub fn load_or_default(explicit: Option<&Path>) -> Result<(Option<PathBuf>, FlowgateConfig)> {
    if let Some(path) = explicit {
        return Ok((Some(path.to_path_buf()), load(path)?));
    }
    match find_config_file() {
        Ok(path) => {
            let config = load(&path)?;
            Ok((Some(path), config))
        }
        Err(ConfigError::NotFound) => {
            tracing::debug!("no configuration file found, using defaults");
            Ok((None, FlowgateConfig::default()))
        }
        Err(e) => Err(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use std::fs;

    struct CwdGuard(PathBuf);

    impl CwdGuard {
        fn enter(dir: &Path) -> Self {
            let original = std::env::current_dir().unwrap();
            std::env::set_current_dir(dir).unwrap();
            Self(original)
        }
    }

    impl Drop for CwdGuard {
        fn drop(&mut self) {
            let _ = std::env::set_current_dir(&self.0);
        }
    }

    #[test]
    fn test_get_config_dir() {
        if let Ok(dir) = get_config_dir() {
            assert!(dir.ends_with("flowgate"));
        }
    }

    #[test]
    #[serial]
    fn test_find_in_current_dir() {
        let temp_dir = tempfile::tempdir().unwrap();
        fs::write(temp_dir.path().join("flowgate.kdl"), "// test").unwrap();
        let _cwd = CwdGuard::enter(temp_dir.path());

        let found = find_config_file().unwrap();
        assert!(found.ends_with("flowgate.kdl"));
    }

    #[test]
    #[serial]
    fn test_local_file_wins() {
        let temp_dir = tempfile::tempdir().unwrap();
        fs::write(temp_dir.path().join("flowgate.kdl"), "// shared").unwrap();
        fs::write(temp_dir.path().join("flowgate.local.kdl"), "// local").unwrap();
        let _cwd = CwdGuard::enter(temp_dir.path());

        assert!(find_config_file().unwrap().ends_with("flowgate.local.kdl"));
    }

    #[test]
    #[serial]
    fn test_find_in_dot_dir() {
        let temp_dir = tempfile::tempdir().unwrap();
        let dot_dir = temp_dir.path().join(".flowgate");
        fs::create_dir(&dot_dir).unwrap();
        fs::write(dot_dir.join("flowgate.kdl"), "// nested").unwrap();
        let _cwd = CwdGuard::enter(temp_dir.path());

        assert!(find_config_file().unwrap().ends_with(".flowgate/flowgate.kdl"));
    }

    #[test]
    #[serial]
    fn test_env_var_wins() {
        let temp_dir = tempfile::tempdir().unwrap();
        let config_path = temp_dir.path().join("custom.kdl");
        fs::write(&config_path, "lookback-days 2").unwrap();
        fs::write(temp_dir.path().join("flowgate.kdl"), "// ignored").unwrap();
        let _cwd = CwdGuard::enter(temp_dir.path());

        unsafe {
            std::env::set_var(CONFIG_ENV, &config_path);
        }
        let found = find_config_file();
        let loaded = load_or_default(None);
        unsafe {
            std::env::remove_var(CONFIG_ENV);
        }

        assert_eq!(found.unwrap(), config_path);
        let (path, config) = loaded.unwrap();
        assert_eq!(path, Some(config_path));
        assert_eq!(config.lookback_days, 2);
    }

    #[test]
    #[serial]
    fn test_load_or_default_without_file() {
        let temp_dir = tempfile::tempdir().unwrap();
        let _cwd = CwdGuard::enter(temp_dir.path());

        // A global config on the test machine would be picked up instead
        if find_config_file().is_ok() {
            return;
        }
        let (path, config) = load_or_default(None).unwrap();
        assert_eq!(path, None);
        assert_eq!(config, FlowgateConfig::default());
    }

    #[test]
    fn test_explicit_missing_path_is_error() {
        let temp_dir = tempfile::tempdir().unwrap();
        let missing = temp_dir.path().join("absent.kdl");
        assert!(matches!(
            load_or_default(Some(&missing)),
            Err(ConfigError::Io(_))
        ));
    }

    #[test]
    fn test_load_rejects_invalid_values() {
        let temp_dir = tempfile::tempdir().unwrap();
        let path = temp_dir.path().join("flowgate.kdl");
        fs::write(&path, r#"chunk-size 0"#).unwrap();
        assert!(matches!(load(&path), Err(ConfigError::Invalid(_))));
    }
}

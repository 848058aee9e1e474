/// Configuration module for ProxyTray.
///
/// This module provides functionality for managing application configuration,
/// including:
/// - Where the engine binary, its assets and its config file live
/// - Control API address and secret
/// - Supervision tuning (early-failure threshold, reachability retries)
/// - Persisting configuration to disk as JSON
///
/// The configuration is saved to and loaded from a `config.json` file located
/// in the platform-specific application data directory
/// (%APPDATA%/ProxyTray/ on Windows).
///
/// # Example
///
/// ```rust,no_run
/// use proxy_tray_core::config::{load_config, save_config};
///
/// let mut config = load_config();
/// config.controller_address = "127.0.0.1:9091".to_string();
/// save_config(&config).expect("Failed to save config");
/// ```
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

use crate::launch_spec::LaunchSpec;
use crate::process::SupervisorConfig;
use crate::startup::ReachabilityPolicy;

/// Name of the persisted settings file
pub const CONFIG_FILE_NAME: &str = "config.json";

/// Directory under the data directory holding engine config files
pub const ENGINE_CONFIG_DIR_NAME: &str = "Config";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to determine user data directory")]
    NoDataDirectory,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid config JSON: {0}")]
    Json(#[from] serde_json::Error),
}

/// Application configuration
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct AppConfig {
    /// Engine executable, resolved next to the running executable
    pub engine_exe_name: String,
    /// Engine config file; `None` means `<data>/Config/config.yaml`
    pub config_file: Option<PathBuf>,
    /// Control API address passed to the engine and used by the client
    pub controller_address: String,
    pub controller_secret: String,
    /// Dashboard directory inside the assets directory
    pub dashboard_dir_name: String,
    /// Engine home directory next to the running executable
    pub assets_dir_name: String,
    /// Lifetimes below this are early failures
    pub early_failure_threshold_ms: u64,
    pub reachability_attempts: u32,
    pub reachability_delay_ms: u64,
    /// Restart the engine after a runtime crash
    pub auto_restart_on_crash: bool,
}

impl Default for AppConfig {
    fn default() -> Self {
        AppConfig {
            engine_exe_name: "clash.exe".to_string(),
            config_file: None,
            controller_address: "127.0.0.1:9090".to_string(),
            controller_secret: String::new(),
            dashboard_dir_name: "dashboard".to_string(),
            assets_dir_name: "assets".to_string(),
            early_failure_threshold_ms: 3000,
            reachability_attempts: 3,
            reachability_delay_ms: 1000,
            auto_restart_on_crash: true,
        }
    }
}

impl AppConfig {
    /// Launch parameters for an engine shipped next to `exe_dir`
    pub fn launch_spec(&self, exe_dir: &Path, data_dir: &Path) -> LaunchSpec {
        let assets_dir = exe_dir.join(&self.assets_dir_name);
        LaunchSpec {
            engine_path: exe_dir.join(&self.engine_exe_name),
            ui_dir: assets_dir.join(&self.dashboard_dir_name),
            home_dir: assets_dir,
            config_file: self.engine_config_file(data_dir),
            control_address: self.controller_address.clone(),
            control_secret: self.controller_secret.clone(),
        }
    }

    pub fn engine_config_file(&self, data_dir: &Path) -> PathBuf {
        self.config_file
            .clone()
            .unwrap_or_else(|| data_dir.join(ENGINE_CONFIG_DIR_NAME).join("config.yaml"))
    }

    pub fn supervisor_config(&self) -> SupervisorConfig {
        SupervisorConfig {
            early_failure_threshold: Duration::from_millis(self.early_failure_threshold_ms),
        }
    }

    pub fn reachability_policy(&self) -> ReachabilityPolicy {
        ReachabilityPolicy {
            attempts: self.reachability_attempts,
            delay: Duration::from_millis(self.reachability_delay_ms),
        }
    }
}

/// Get the application's data directory
/// Returns %APPDATA%/ProxyTray/ on Windows
/// Creates directory if it doesn't exist
pub fn get_data_directory() -> Result<PathBuf, ConfigError> {
    let project_dirs =
        ProjectDirs::from("", "", "ProxyTray").ok_or(ConfigError::NoDataDirectory)?;

    let data_dir = project_dirs.data_dir();
    fs::create_dir_all(data_dir)?;

    Ok(data_dir.to_path_buf())
}

/// Create `<data>/Config` so the user has somewhere to put engine configs
pub fn ensure_engine_config_dir(data_dir: &Path) -> Result<PathBuf, ConfigError> {
    let dir = data_dir.join(ENGINE_CONFIG_DIR_NAME);
    fs::create_dir_all(&dir)?;
    Ok(dir)
}

/// Load application configuration from config.json
/// Returns default config if file doesn't exist or on error
pub fn load_config() -> AppConfig {
    let Ok(data_dir) = get_data_directory() else {
        return AppConfig::default();
    };

    load_config_from(&data_dir.join(CONFIG_FILE_NAME))
}

pub fn load_config_from(path: &Path) -> AppConfig {
    if !path.exists() {
        return AppConfig::default();
    }

    let Ok(contents) = fs::read_to_string(path) else {
        return AppConfig::default();
    };

    match serde_json::from_str(&contents) {
        Ok(config) => config,
        Err(e) => {
            tracing::warn!("Ignoring invalid {}: {}", path.display(), e);
            AppConfig::default()
        }
    }
}

/// Save application configuration to config.json
pub fn save_config(config: &AppConfig) -> Result<(), ConfigError> {
    let data_dir = get_data_directory()?;
    save_config_to(config, &data_dir.join(CONFIG_FILE_NAME))
}

pub fn save_config_to(config: &AppConfig, path: &Path) -> Result<(), ConfigError> {
    let json = serde_json::to_string_pretty(config)?;
    fs::write(path, json)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = AppConfig::default();
        assert_eq!(config.engine_exe_name, "clash.exe");
        assert_eq!(config.controller_address, "127.0.0.1:9090");
        assert_eq!(config.early_failure_threshold_ms, 3000);
        assert_eq!(config.reachability_attempts, 3);
        assert!(config.auto_restart_on_crash);
    }

    #[test]
    fn test_save_and_load_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(CONFIG_FILE_NAME);

        let config = AppConfig {
            controller_secret: "hunter2".to_string(),
            auto_restart_on_crash: false,
            ..Default::default()
        };
        save_config_to(&config, &path).unwrap();

        assert_eq!(load_config_from(&path), config);
    }

    #[test]
    fn test_missing_or_broken_file_gives_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(CONFIG_FILE_NAME);
        assert_eq!(load_config_from(&path), AppConfig::default());

        fs::write(&path, "{ not json").unwrap();
        assert_eq!(load_config_from(&path), AppConfig::default());
    }

    #[test]
    fn test_partial_file_fills_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(CONFIG_FILE_NAME);
        fs::write(&path, r#"{ "reachability_attempts": 5 }"#).unwrap();

        let config = load_config_from(&path);
        assert_eq!(config.reachability_attempts, 5);
        assert_eq!(config.engine_exe_name, "clash.exe");
    }

    #[test]
    fn test_launch_spec_layout() {
        let config = AppConfig::default();
        let spec = config.launch_spec(Path::new("/app"), Path::new("/data"));

        assert_eq!(spec.engine_path, Path::new("/app/clash.exe"));
        assert_eq!(spec.home_dir, Path::new("/app/assets"));
        assert_eq!(spec.ui_dir, Path::new("/app/assets/dashboard"));
        assert_eq!(spec.config_file, Path::new("/data/Config/config.yaml"));
        assert_eq!(spec.control_address, "127.0.0.1:9090");
    }

    #[test]
    fn test_derived_policies() {
        let config = AppConfig {
            early_failure_threshold_ms: 5000,
            reachability_attempts: 4,
            reachability_delay_ms: 250,
            ..Default::default()
        };
        assert_eq!(
            config.supervisor_config().early_failure_threshold,
            Duration::from_secs(5)
        );
        let policy = config.reachability_policy();
        assert_eq!(policy.attempts, 4);
        assert_eq!(policy.delay, Duration::from_millis(250));
    }

    #[test]
    fn test_ensure_engine_config_dir() {
        let dir = tempfile::tempdir().unwrap();
        let created = ensure_engine_config_dir(dir.path()).unwrap();
        assert!(created.is_dir());
        assert!(created.ends_with(ENGINE_CONFIG_DIR_NAME));
    }
}

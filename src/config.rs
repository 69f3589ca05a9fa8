//! Daemon configuration.
//!
//! Loaded from a TOML file via `toml` + `dirs` with CLI overrides layered
//! on top and an env-var precedence for the config path itself.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Default large-file threshold when unset or zero: 10 MiB.
pub const DEFAULT_MIN_LARGE_FILE_SIZE: i64 = 10 * 1024 * 1024;

/// Daemon-wide configuration, loadable from a TOML file with CLI overrides
/// layered on top.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaemonConfig {
    #[serde(default)]
    pub daemon: CoreConfig,

    #[serde(default)]
    pub telemetry: TelemetryConfig,
}

/// The daemon's core startup inputs, plus the tuning knobs it carries
/// (exclude patterns for the watcher, default roots to index on startup).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoreConfig {
    /// Directory holding `index.db/`, `sweep.pid`, `sweep.sock`, `sweep.status`.
    #[serde(default = "default_data_dir")]
    pub data_dir: String,

    /// 0 means "use the default" (10 MiB).
    #[serde(default)]
    pub min_large_file_size: i64,

    /// Glob patterns excluded from both indexing and watching.
    #[serde(default = "default_exclude_patterns")]
    pub exclude_patterns: Vec<String>,

    /// Roots to index automatically at startup (empty: wait for `TriggerIndex`).
    #[serde(default)]
    pub startup_roots: Vec<String>,
}

/// Telemetry/logging knobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelemetryConfig {
    #[serde(default = "default_log_level")]
    pub log_level: String,

    #[serde(default)]
    pub otlp_enabled: bool,

    #[serde(default = "default_otlp_endpoint")]
    pub otlp_endpoint: String,
}

fn default_data_dir() -> String {
    dirs::data_local_dir()
        .map(|d| d.join("sweep").to_string_lossy().to_string())
        .unwrap_or_else(|| "/var/lib/sweep".to_string())
}

fn default_exclude_patterns() -> Vec<String> {
    vec![
        "**/.git/**".to_string(),
        "**/node_modules/**".to_string(),
        "**/target/**".to_string(),
    ]
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_otlp_endpoint() -> String {
    "http://localhost:4317".to_string()
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            min_large_file_size: 0,
            exclude_patterns: default_exclude_patterns(),
            startup_roots: Vec::new(),
        }
    }
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            otlp_enabled: false,
            otlp_endpoint: default_otlp_endpoint(),
        }
    }
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            daemon: CoreConfig::default(),
            telemetry: TelemetryConfig::default(),
        }
    }
}

impl DaemonConfig {
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file: {}", path.display()))?;
        let config: DaemonConfig = toml::from_str(&content)
            .with_context(|| format!("failed to parse config file: {}", path.display()))?;
        Ok(config)
    }

    /// Search order: `SWEEP_CONFIG` env var, `./sweep.toml`, then
    /// `~/.config/sweep/config.toml`.
    pub fn from_default_locations() -> Result<Option<(Self, PathBuf)>> {
        if let Ok(env_path) = std::env::var("SWEEP_CONFIG") {
            let path = PathBuf::from(&env_path);
            if path.exists() {
                let config = Self::from_file(&path)?;
                return Ok(Some((config, path)));
            }
        }

        let local_path = PathBuf::from("sweep.toml");
        if local_path.exists() {
            let config = Self::from_file(&local_path)?;
            return Ok(Some((config, local_path)));
        }

        if let Some(config_dir) = dirs::config_dir() {
            let user_path = config_dir.join("sweep").join("config.toml");
            if user_path.exists() {
                let config = Self::from_file(&user_path)?;
                return Ok(Some((config, user_path)));
            }
        }

        Ok(None)
    }

    /// Returns the effective large-file threshold: `0` in config means "use
    /// the default".
    pub fn min_large_file_size(&self) -> i64 {
        if self.daemon.min_large_file_size > 0 {
            self.daemon.min_large_file_size
        } else {
            DEFAULT_MIN_LARGE_FILE_SIZE
        }
    }

    /// Merges CLI overrides on top of the loaded (or default) configuration.
    pub fn with_overrides(
        mut self,
        data_dir: Option<String>,
        min_large_file_size: Option<i64>,
    ) -> Self {
        if let Some(dir) = data_dir {
            self.daemon.data_dir = dir;
        }
        if let Some(min_size) = min_large_file_size {
            self.daemon.min_large_file_size = min_size;
        }
        self
    }

    pub fn generate_template() -> String {
        r#"# sweep daemon configuration

[daemon]
# Directory holding index.db/, sweep.pid, sweep.sock, sweep.status
data_dir = "~/.local/share/sweep"

# 0 means "use the built-in default" (10 MiB)
min_large_file_size = 0

exclude_patterns = [
    "**/.git/**",
    "**/node_modules/**",
    "**/target/**",
]

# Roots to index automatically at startup
startup_roots = []

[telemetry]
log_level = "info"
otlp_enabled = false
otlp_endpoint = "http://localhost:4317"
"#
        .to_string()
    }

    pub fn write_template(path: &Path) -> Result<()> {
        let template = Self::generate_template();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("failed to create config directory: {}", parent.display()))?;
        }
        std::fs::write(path, template)
            .with_context(|| format!("failed to write config file: {}", path.display()))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_min_large_file_size_is_10mib() {
        let config = DaemonConfig::default();
        assert_eq!(config.min_large_file_size(), 10 * 1024 * 1024);
    }

    #[test]
    fn explicit_min_large_file_size_is_honored() {
        let mut config = DaemonConfig::default();
        config.daemon.min_large_file_size = 4096;
        assert_eq!(config.min_large_file_size(), 4096);
    }

    #[test]
    fn parse_minimal_config() {
        let toml = r#"
[daemon]
data_dir = "/tmp/sweep-data"
min_large_file_size = 1048576
"#;
        let config: DaemonConfig = toml::from_str(toml).unwrap();
        assert_eq!(config.daemon.data_dir, "/tmp/sweep-data");
        assert_eq!(config.min_large_file_size(), 1_048_576);
    }

    #[test]
    fn cli_overrides_apply_on_top_of_defaults() {
        let config = DaemonConfig::default()
            .with_overrides(Some("/tmp/override".to_string()), Some(2048));
        assert_eq!(config.daemon.data_dir, "/tmp/override");
        assert_eq!(config.min_large_file_size(), 2048);
    }

    #[test]
    fn generate_template_contains_expected_sections() {
        let template = DaemonConfig::generate_template();
        assert!(template.contains("[daemon]"));
        assert!(template.contains("[telemetry]"));
        assert!(template.contains("data_dir"));
    }
}

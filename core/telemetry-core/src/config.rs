//! Runtime configuration loaded from `<root>/config/registry.toml`.
//!
//! Every field has a default so a missing file (the common case) yields a
//! working configuration for the standard Loki + Grafana installation.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::error::{Result, TelemetryError};

const DEFAULT_SERVER_URL: &str = "http://localhost:3100";
const DEFAULT_DISCOVERY_MAX_DEPTH: usize = 6;

/// Which of the two managed services a value refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ServiceKind {
    LogServer,
    DashboardServer,
}

impl ServiceKind {
    pub const ALL: [ServiceKind; 2] = [ServiceKind::LogServer, ServiceKind::DashboardServer];

    pub fn label(self) -> &'static str {
        match self {
            ServiceKind::LogServer => "log server",
            ServiceKind::DashboardServer => "dashboard server",
        }
    }
}

/// How to recognise, locate and launch one managed service.
///
/// Overriding a service in `registry.toml` replaces the whole table, so
/// every field without a serde default must be given.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ServiceSpec {
    /// Short name, used for log files.
    pub name: String,
    /// Binary path, relative to the installation root unless absolute.
    pub binary: String,
    /// Regex matched against the process name and the basename of argv[0].
    pub process_pattern: String,
    /// Flag carrying the config file, e.g. `-config.file` or `--config`.
    pub config_flag: String,
    /// Subcommand that must appear on the command line, e.g. `server`.
    #[serde(default)]
    pub subcommand: Option<String>,
    /// Config file path, relative to the installation root unless absolute.
    pub config_file: String,
    /// Extra launch arguments; `{root}` is replaced by the installation root.
    #[serde(default)]
    pub extra_args: Vec<String>,
}

impl ServiceSpec {
    pub fn log_server() -> Self {
        Self {
            name: "loki".to_string(),
            binary: "bin/loki".to_string(),
            process_pattern: r"^loki".to_string(),
            config_flag: "-config.file".to_string(),
            subcommand: None,
            config_file: "config/loki/loki-config.yaml".to_string(),
            extra_args: Vec::new(),
        }
    }

    pub fn dashboard_server() -> Self {
        Self {
            name: "grafana".to_string(),
            binary: "bin/grafana".to_string(),
            process_pattern: r"^grafana".to_string(),
            config_flag: "--config".to_string(),
            subcommand: Some("server".to_string()),
            config_file: "config/grafana/grafana.ini".to_string(),
            extra_args: vec!["--homepath".to_string(), "{root}/grafana".to_string()],
        }
    }
}

/// Relative locations of the per-project markers written on connection.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ProjectLayout {
    pub hook_file: String,
    pub settings_file: String,
    pub enabled_marker: String,
}

impl Default for ProjectLayout {
    fn default() -> Self {
        Self {
            hook_file: ".claude/hooks/telemetry-hook.sh".to_string(),
            settings_file: ".claude/settings.json".to_string(),
            enabled_marker: ".claude/.telemetry-enabled".to_string(),
        }
    }
}

impl ProjectLayout {
    /// File name the settings file must mention for the hook to be wired up.
    pub fn hook_file_name(&self) -> &str {
        self.hook_file
            .rsplit('/')
            .next()
            .unwrap_or(self.hook_file.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct TelemetryConfig {
    /// Event ingestion endpoint rendered into project hooks.
    pub server_url: String,
    /// Roots scanned for configured projects. Empty means the home directory.
    pub search_roots: Vec<String>,
    pub discovery_max_depth: usize,
    pub project_layout: ProjectLayout,
    #[serde(default = "ServiceSpec::log_server")]
    pub log_server: ServiceSpec,
    #[serde(default = "ServiceSpec::dashboard_server")]
    pub dashboard_server: ServiceSpec,
    pub stop_poll_interval_secs: u64,
    pub stop_max_polls: u32,
    pub start_settle_secs: u64,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            server_url: DEFAULT_SERVER_URL.to_string(),
            search_roots: Vec::new(),
            discovery_max_depth: DEFAULT_DISCOVERY_MAX_DEPTH,
            project_layout: ProjectLayout::default(),
            log_server: ServiceSpec::log_server(),
            dashboard_server: ServiceSpec::dashboard_server(),
            stop_poll_interval_secs: 1,
            stop_max_polls: 30,
            start_settle_secs: 3,
        }
    }
}

impl TelemetryConfig {
    pub fn service(&self, kind: ServiceKind) -> &ServiceSpec {
        match kind {
            ServiceKind::LogServer => &self.log_server,
            ServiceKind::DashboardServer => &self.dashboard_server,
        }
    }

    pub fn stop_poll_interval(&self) -> Duration {
        Duration::from_secs(self.stop_poll_interval_secs)
    }

    pub fn start_settle(&self) -> Duration {
        Duration::from_secs(self.start_settle_secs)
    }
}

/// Loads the config, returning defaults if the file doesn't exist.
pub fn load_config(path: &Path) -> Result<TelemetryConfig> {
    if !path.exists() {
        return Ok(TelemetryConfig::default());
    }

    let content = fs_err::read_to_string(path)
        .map_err(|e| TelemetryError::io(format!("reading {}", path.display()), e))?;

    toml::from_str::<TelemetryConfig>(&content).map_err(|err| TelemetryError::ConfigMalformed {
        path: path.to_path_buf(),
        details: err.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn load_config_defaults_when_file_missing() {
        let temp_dir = tempfile::tempdir().expect("temp dir");
        let config = load_config(&temp_dir.path().join("missing.toml")).expect("load config");
        assert_eq!(config, TelemetryConfig::default());
        assert_eq!(config.stop_max_polls, 30);
        assert_eq!(config.server_url, "http://localhost:3100");
    }

    #[test]
    fn load_config_merges_partial_overrides() {
        let temp_dir = tempfile::tempdir().expect("temp dir");
        let path = temp_dir.path().join("registry.toml");
        fs_err::write(
            &path,
            r#"
server_url = "http://127.0.0.1:9999"
search_roots = ["/srv/projects"]

[project_layout]
hook_file = ".agent/hooks/hook.sh"

[dashboard_server]
name = "grafana"
binary = "/usr/sbin/grafana"
process_pattern = "^grafana"
config_flag = "--config"
subcommand = "server"
config_file = "config/grafana/custom.ini"
"#,
        )
        .expect("write config");

        let config = load_config(&path).expect("load config");
        assert_eq!(config.server_url, "http://127.0.0.1:9999");
        assert_eq!(config.search_roots, vec!["/srv/projects".to_string()]);
        assert_eq!(config.project_layout.hook_file, ".agent/hooks/hook.sh");
        assert_eq!(config.project_layout.hook_file_name(), "hook.sh");
        assert_eq!(
            config.project_layout.settings_file,
            ".claude/settings.json"
        );
        assert_eq!(config.dashboard_server.binary, "/usr/sbin/grafana");
        assert!(config.dashboard_server.extra_args.is_empty());
        assert_eq!(config.log_server, ServiceSpec::log_server());
        assert_eq!(config.stop_max_polls, 30);
    }

    #[test]
    fn load_config_rejects_malformed_toml() {
        let temp_dir = tempfile::tempdir().expect("temp dir");
        let path = temp_dir.path().join("registry.toml");
        fs_err::write(&path, "server_url = [").expect("write config");

        let err = load_config(&path).unwrap_err();
        assert!(matches!(err, TelemetryError::ConfigMalformed { .. }));
    }
}

//! Storage paths for a telemetry installation.
//!
//! Every file this crate reads or writes is derived from one canonical root.
//! The root is resolved once at the entry point and threaded through every
//! component; nothing caches it process-wide.
//!
//! ## Layout
//!
//! ```text
//! <root>/
//! ├── bin/                          # service binaries
//! ├── config/
//! │   ├── registry.toml             # optional TelemetryConfig overrides
//! │   ├── loki/loki-config.yaml     # log server config
//! │   └── grafana/grafana.ini       # dashboard server config
//! ├── data/
//! │   ├── connected-projects.txt    # the registry
//! │   └── logs/
//! └── templates/telemetry-hook.sh.template
//! ```

use std::io::Write;
use std::path::{Path, PathBuf};

use tempfile::NamedTempFile;

use crate::error::{Result, TelemetryError};

/// Environment variable consulted when no explicit root is given.
pub const ROOT_ENV_VAR: &str = "AGENT_TELEMETRY_ROOT";

const REGISTRY_FILE_NAME: &str = "connected-projects.txt";
const DEFAULT_ROOT_DIR: &str = ".agent-telemetry";

/// Normalize a path for consistent hashing and comparison.
/// Strips trailing slashes except for root "/".
pub fn normalize_path(path: &str) -> String {
    let trimmed = path.trim_end_matches('/');
    if trimmed.is_empty() && path.starts_with('/') {
        "/".to_string()
    } else {
        trimmed.to_string()
    }
}

/// All paths below one canonical installation root.
///
/// Production code builds this from the resolved root; tests use
/// `StoragePaths::with_root(temp_dir)` for isolation.
#[derive(Debug, Clone)]
pub struct StoragePaths {
    root: PathBuf,
}

impl StoragePaths {
    pub fn with_root(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// The canonical installation root.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// The canonical root as a normalized string, the form stored in the registry.
    pub fn root_str(&self) -> String {
        normalize_path(&self.root.to_string_lossy())
    }

    // ─────────────────────────────────────────────────────────────────────────────
    // Registry Files
    // ─────────────────────────────────────────────────────────────────────────────

    pub fn data_dir(&self) -> PathBuf {
        self.root.join("data")
    }

    pub fn registry_file(&self) -> PathBuf {
        self.data_dir().join(REGISTRY_FILE_NAME)
    }

    /// Corrupt registry lines are moved here when the registry is rewritten.
    pub fn registry_quarantine_file(&self) -> PathBuf {
        self.data_dir().join(format!("{}.corrupt", REGISTRY_FILE_NAME))
    }

    pub fn logs_dir(&self) -> PathBuf {
        self.data_dir().join("logs")
    }

    /// Output log for a managed service started by the cleanup orchestrator.
    pub fn service_log_file(&self, service_name: &str) -> PathBuf {
        self.logs_dir().join(format!("{}.log", service_name))
    }

    // ─────────────────────────────────────────────────────────────────────────────
    // Configuration
    // ─────────────────────────────────────────────────────────────────────────────

    pub fn config_dir(&self) -> PathBuf {
        self.root.join("config")
    }

    /// Optional overrides for [`crate::config::TelemetryConfig`].
    pub fn settings_file(&self) -> PathBuf {
        self.config_dir().join("registry.toml")
    }

    pub fn hook_template(&self) -> PathBuf {
        self.root
            .join("templates")
            .join("telemetry-hook.sh.template")
    }

    /// Resolves a path from the config (relative to the root unless absolute).
    pub fn resolve(&self, relative: &str) -> PathBuf {
        let candidate = Path::new(relative);
        if candidate.is_absolute() {
            candidate.to_path_buf()
        } else {
            self.root.join(candidate)
        }
    }

    /// Ensures the data and log directories exist.
    ///
    /// Failing here is one of the few fatal conditions: nothing can be
    /// recorded without a registry directory.
    pub fn ensure_dirs(&self) -> Result<()> {
        for dir in [self.data_dir(), self.logs_dir()] {
            fs_err::create_dir_all(&dir)
                .map_err(|e| TelemetryError::io(format!("creating {}", dir.display()), e))?;
        }
        Ok(())
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Atomic Writes
// ─────────────────────────────────────────────────────────────────────────────

/// Writes content to a file atomically using temp file + rename.
///
/// The temp file lives in the destination directory so the rename stays on
/// one filesystem. Readers see either the old or the new content.
pub fn atomic_write(path: &Path, contents: &str) -> Result<()> {
    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    fs_err::create_dir_all(dir)
        .map_err(|e| TelemetryError::io(format!("creating {}", dir.display()), e))?;

    let mut tmp = NamedTempFile::new_in(dir).map_err(|e| {
        TelemetryError::io(format!("creating temp file in {}", dir.display()), e)
    })?;

    tmp.write_all(contents.as_bytes())
        .map_err(|e| TelemetryError::io(format!("writing temp file for {}", path.display()), e))?;

    tmp.flush()
        .map_err(|e| TelemetryError::io(format!("flushing temp file for {}", path.display()), e))?;

    tmp.persist(path).map_err(|e| {
        TelemetryError::io(format!("persisting temp file to {}", path.display()), e.error)
    })?;

    Ok(())
}

// ─────────────────────────────────────────────────────────────────────────────
// Root Resolution
// ─────────────────────────────────────────────────────────────────────────────

/// Returns true if `dir` looks like a telemetry installation root.
pub fn is_installation_root(dir: &Path) -> bool {
    dir.join("config").join("registry.toml").is_file() || dir.join("config").join("loki").is_dir()
}

/// Resolves the canonical root.
///
/// Order: explicit path (must exist), `AGENT_TELEMETRY_ROOT`, the nearest
/// ancestor of `start` that looks like an installation, `~/.agent-telemetry`.
pub fn resolve_root(explicit: Option<&Path>, start: Option<&Path>) -> Result<PathBuf> {
    if let Some(path) = explicit {
        if !path.is_dir() {
            return Err(TelemetryError::InvalidPath {
                path: path.to_path_buf(),
                reason: "installation root does not exist".to_string(),
            });
        }
        return Ok(path.to_path_buf());
    }

    if let Ok(value) = std::env::var(ROOT_ENV_VAR) {
        if !value.trim().is_empty() {
            let path = PathBuf::from(value.trim());
            if !path.is_dir() {
                return Err(TelemetryError::InvalidPath {
                    path,
                    reason: format!("{} points at a missing directory", ROOT_ENV_VAR),
                });
            }
            return Ok(path);
        }
    }

    if let Some(start) = start {
        if let Some(found) = start.ancestors().find(|dir| is_installation_root(dir)) {
            return Ok(found.to_path_buf());
        }
    }

    dirs::home_dir()
        .map(|home| home.join(DEFAULT_ROOT_DIR))
        .ok_or_else(|| TelemetryError::ConfigurationMissing(PathBuf::from("~")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn normalize_strips_trailing_slashes() {
        assert_eq!(normalize_path("/opt/telemetry/"), "/opt/telemetry");
        assert_eq!(normalize_path("/opt/telemetry"), "/opt/telemetry");
        assert_eq!(normalize_path("///"), "/");
        assert_eq!(normalize_path("/"), "/");
    }

    #[test]
    fn registry_paths_live_under_data() {
        let paths = StoragePaths::with_root("/opt/telemetry");
        assert_eq!(
            paths.registry_file(),
            PathBuf::from("/opt/telemetry/data/connected-projects.txt")
        );
        assert_eq!(
            paths.registry_quarantine_file(),
            PathBuf::from("/opt/telemetry/data/connected-projects.txt.corrupt")
        );
    }

    #[test]
    fn resolve_keeps_absolute_paths() {
        let paths = StoragePaths::with_root("/opt/telemetry");
        assert_eq!(paths.resolve("/usr/bin/loki"), PathBuf::from("/usr/bin/loki"));
        assert_eq!(
            paths.resolve("bin/loki"),
            PathBuf::from("/opt/telemetry/bin/loki")
        );
    }

    #[test]
    fn atomic_write_creates_parent_and_replaces_content() {
        let temp = TempDir::new().unwrap();
        let target = temp.path().join("nested/dir/file.txt");
        atomic_write(&target, "first").unwrap();
        atomic_write(&target, "second").unwrap();
        assert_eq!(std::fs::read_to_string(&target).unwrap(), "second");
        let leftovers = std::fs::read_dir(target.parent().unwrap()).unwrap().count();
        assert_eq!(leftovers, 1);
    }

    #[test]
    fn explicit_root_must_exist() {
        let err = resolve_root(Some(Path::new("/definitely/not/here")), None).unwrap_err();
        assert!(matches!(err, TelemetryError::InvalidPath { .. }));
    }

    #[test]
    fn explicit_root_wins() {
        let temp = TempDir::new().unwrap();
        let resolved = resolve_root(Some(temp.path()), None).unwrap();
        assert_eq!(resolved, temp.path());
    }

    #[test]
    fn ancestor_with_loki_config_is_found() {
        let temp = TempDir::new().unwrap();
        std::fs::create_dir_all(temp.path().join("config/loki")).unwrap();
        let nested = temp.path().join("scripts/lib");
        std::fs::create_dir_all(&nested).unwrap();

        assert!(is_installation_root(temp.path()));
        assert!(!is_installation_root(&nested));
        if std::env::var(ROOT_ENV_VAR).is_err() {
            let resolved = resolve_root(None, Some(&nested)).unwrap();
            assert_eq!(resolved, temp.path());
        }
    }
}

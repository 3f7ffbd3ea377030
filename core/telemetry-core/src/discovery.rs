//! Finding projects configured for telemetry on disk.
//!
//! Discovery walks the search roots looking for the hook script at its
//! layout path (`<project>/.claude/hooks/telemetry-hook.sh` by default).
//! Each hit is validated and only complete configurations are yielded.
//!
//! The walk is lazy: nothing is read until the iterator is pulled, and a
//! consumed iterator cannot be restarted.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use tracing::debug;
use walkdir::{DirEntry, WalkDir};

use crate::config::{ProjectLayout, TelemetryConfig};
use crate::storage::normalize_path;
use crate::validation::validate;

/// Directories never descended into.
const PRUNED_DIRS: &[&str] = &[
    "node_modules",
    ".git",
    "target",
    ".venv",
    "venv",
    "__pycache__",
    ".cache",
    "Library",
    ".Trash",
];

/// A configured project found by the scan.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveredProject {
    pub path: String,
    pub name: String,
}

impl DiscoveredProject {
    /// Builds from a directory; the name is its final component.
    pub fn from_dir(dir: &Path) -> Self {
        let path = normalize_path(&dir.to_string_lossy());
        let name = dir
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| path.clone());
        Self { path, name }
    }
}

/// The configured search roots, or the home directory when none are set.
pub fn search_roots(config: &TelemetryConfig) -> Vec<PathBuf> {
    if config.search_roots.is_empty() {
        return dirs::home_dir().into_iter().collect();
    }
    config.search_roots.iter().map(PathBuf::from).collect()
}

fn is_pruned(entry: &DirEntry) -> bool {
    entry.depth() > 0
        && entry.file_type().is_dir()
        && entry
            .file_name()
            .to_str()
            .is_some_and(|name| PRUNED_DIRS.contains(&name))
}

/// Project directory owning `hook`, or `None` if `hook` isn't at the layout path.
fn project_dir_for_hook<'a>(hook: &'a Path, layout: &ProjectLayout) -> Option<&'a Path> {
    let relative = Path::new(&layout.hook_file);
    if !hook.ends_with(relative) {
        return None;
    }
    hook.ancestors().nth(relative.components().count())
}

/// Lazily yields every valid configured project under `roots`.
///
/// `max_depth` bounds how deep a project directory may sit below its root.
/// Projects reachable from several roots are yielded once.
pub fn discover_configured_projects<'a>(
    roots: &'a [PathBuf],
    layout: &'a ProjectLayout,
    max_depth: usize,
) -> impl Iterator<Item = DiscoveredProject> + 'a {
    let hook_name = layout.hook_file_name().to_string();
    let hook_depth = Path::new(&layout.hook_file).components().count();
    let mut seen: HashSet<String> = HashSet::new();

    roots
        .iter()
        .filter(|root| root.is_dir())
        .flat_map(move |root| {
            WalkDir::new(root)
                .follow_links(false)
                .max_depth(max_depth + hook_depth)
                .into_iter()
                .filter_entry(|e| !is_pruned(e))
                .filter_map(|e| e.ok())
        })
        .filter(move |entry| {
            entry.file_type().is_file() && entry.file_name().to_str() == Some(hook_name.as_str())
        })
        .filter_map(move |entry| {
            let dir = project_dir_for_hook(entry.path(), layout)?;
            let outcome = validate(dir, layout);
            if !outcome.is_valid() {
                debug!(
                    project = %dir.display(),
                    reasons = %outcome.describe(),
                    "Skipping incomplete project configuration"
                );
                return None;
            }
            Some(DiscoveredProject::from_dir(dir))
        })
        .filter(move |project| seen.insert(project.path.clone()))
}

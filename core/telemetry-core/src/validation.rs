//! Checks that a project's on-disk telemetry configuration is complete.
//!
//! A connected project carries three markers (paths from [`ProjectLayout`]):
//!
//! - the hook script,
//! - a settings file that mentions the hook by file name,
//! - the enabled marker.
//!
//! Validation only looks at existence and content; it never runs the hook.

use serde::Serialize;
use std::collections::BTreeSet;
use std::fmt;
use std::path::Path;

use crate::config::ProjectLayout;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum InvalidReason {
    DirectoryMissing,
    HookMissing,
    SettingsMissing,
    SettingsNotConfigured,
    NotEnabled,
}

impl InvalidReason {
    pub fn as_str(self) -> &'static str {
        match self {
            InvalidReason::DirectoryMissing => "directory_missing",
            InvalidReason::HookMissing => "hook_missing",
            InvalidReason::SettingsMissing => "settings_missing",
            InvalidReason::SettingsNotConfigured => "settings_not_configured",
            InvalidReason::NotEnabled => "not_enabled",
        }
    }
}

impl fmt::Display for InvalidReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "result", content = "reasons", rename_all = "snake_case")]
pub enum ValidationOutcome {
    Valid,
    Invalid(BTreeSet<InvalidReason>),
}

impl ValidationOutcome {
    pub fn is_valid(&self) -> bool {
        matches!(self, ValidationOutcome::Valid)
    }

    pub fn reasons(&self) -> Vec<InvalidReason> {
        match self {
            ValidationOutcome::Valid => Vec::new(),
            ValidationOutcome::Invalid(reasons) => reasons.iter().copied().collect(),
        }
    }

    /// Comma-separated reasons, for log lines.
    pub fn describe(&self) -> String {
        self.reasons()
            .iter()
            .map(|r| r.as_str())
            .collect::<Vec<_>>()
            .join(", ")
    }
}

/// The enabled marker counts unless it explicitly says `false` or `0`.
fn marker_enabled(path: &Path) -> bool {
    if !path.is_file() {
        return false;
    }
    match fs_err::read_to_string(path) {
        Ok(content) => !matches!(content.trim(), "false" | "0"),
        Err(_) => false,
    }
}

/// Validates the project at `project_path`.
///
/// A missing directory reports only `DirectoryMissing`; every other reason
/// is collected independently.
pub fn validate(project_path: &Path, layout: &ProjectLayout) -> ValidationOutcome {
    if !project_path.is_dir() {
        return ValidationOutcome::Invalid(BTreeSet::from([InvalidReason::DirectoryMissing]));
    }

    let mut reasons = BTreeSet::new();

    if !project_path.join(&layout.hook_file).is_file() {
        reasons.insert(InvalidReason::HookMissing);
    }

    let settings = project_path.join(&layout.settings_file);
    if settings.is_file() {
        let configured = fs_err::read_to_string(&settings)
            .map(|content| content.contains(layout.hook_file_name()))
            .unwrap_or(false);
        if !configured {
            reasons.insert(InvalidReason::SettingsNotConfigured);
        }
    } else {
        reasons.insert(InvalidReason::SettingsMissing);
    }

    if !marker_enabled(&project_path.join(&layout.enabled_marker)) {
        reasons.insert(InvalidReason::NotEnabled);
    }

    if reasons.is_empty() {
        ValidationOutcome::Valid
    } else {
        ValidationOutcome::Invalid(reasons)
    }
}

/// Test helper that lays out a fully configured project.
#[cfg(test)]
pub(crate) fn write_configured_project(dir: &Path, layout: &ProjectLayout) {
    let hook = dir.join(&layout.hook_file);
    fs_err::create_dir_all(hook.parent().unwrap()).unwrap();
    fs_err::write(&hook, "#!/bin/sh\n").unwrap();
    fs_err::write(
        dir.join(&layout.settings_file),
        format!(
            r#"{{"hooks":{{"PostToolUse":[{{"command":"{}"}}]}}}}"#,
            hook.display()
        ),
    )
    .unwrap();
    fs_err::write(dir.join(&layout.enabled_marker), "true\n").unwrap();
}

//! Re-rendering per-project hook scripts from the installation template.
//!
//! The template is plain text with three placeholders:
//!
//! | Placeholder        | Replaced with                   |
//! |--------------------|---------------------------------|
//! | `{{PROJECT_NAME}}` | the registry's project name     |
//! | `{{PROJECT_PATH}}` | the absolute project path       |
//! | `{{SERVER_URL}}`   | the event ingestion endpoint    |

use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use tracing::debug;

use crate::config::ProjectLayout;
use crate::error::{Result, TelemetryError};
use crate::storage::atomic_write;

pub const PLACEHOLDER_PROJECT_NAME: &str = "{{PROJECT_NAME}}";
pub const PLACEHOLDER_PROJECT_PATH: &str = "{{PROJECT_PATH}}";
pub const PLACEHOLDER_SERVER_URL: &str = "{{SERVER_URL}}";

const HOOK_MODE: u32 = 0o755;

/// Loaded hook template.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HookTemplate {
    content: String,
}

impl HookTemplate {
    /// Reads the template. A missing file is `TemplateMissing`.
    pub fn load(path: &Path) -> Result<Self> {
        match fs_err::read_to_string(path) {
            Ok(content) => Ok(Self { content }),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                Err(TelemetryError::TemplateMissing(path.to_path_buf()))
            }
            Err(err) => Err(TelemetryError::io(
                format!("reading {}", path.display()),
                err,
            )),
        }
    }

    pub fn from_content(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
        }
    }

    pub fn render(&self, project_name: &str, project_path: &str, server_url: &str) -> String {
        render_hook(&self.content, project_name, project_path, server_url)
    }
}

pub fn render_hook(
    template: &str,
    project_name: &str,
    project_path: &str,
    server_url: &str,
) -> String {
    template
        .replace(PLACEHOLDER_PROJECT_NAME, project_name)
        .replace(PLACEHOLDER_PROJECT_PATH, project_path)
        .replace(PLACEHOLDER_SERVER_URL, server_url)
}

/// Absolute location of a project's hook script.
pub fn hook_path(project_path: &str, layout: &ProjectLayout) -> PathBuf {
    Path::new(project_path).join(&layout.hook_file)
}

/// Overwrites the project's hook with a fresh render and marks it executable.
pub fn rewrite_project_hook(
    template: &HookTemplate,
    project_path: &str,
    project_name: &str,
    layout: &ProjectLayout,
    server_url: &str,
) -> Result<PathBuf> {
    let target = hook_path(project_path, layout);
    let rendered = template.render(project_name, project_path, server_url);
    atomic_write(&target, &rendered)?;
    fs_err::set_permissions(&target, std::fs::Permissions::from_mode(HOOK_MODE))
        .map_err(|e| TelemetryError::io(format!("setting mode on {}", target.display()), e))?;
    debug!(hook = %target.display(), "Hook re-rendered");
    Ok(target)
}

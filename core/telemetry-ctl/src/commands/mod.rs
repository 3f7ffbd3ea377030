//! Subcommand implementations. Each takes the opened engine and its parsed
//! arguments, prints its report to stdout and returns `Err` only for
//! failures that should end the process with a non-zero code.

pub mod cleanup;
pub mod migrate;
pub mod repair;
pub mod status;

use std::io::{self, BufRead, Write};
use std::path::Path;

use telemetry_core::{MigrationOutcome, Registry, TelemetryEngine, TelemetryError};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum CliError {
    #[error(transparent)]
    Telemetry(#[from] TelemetryError),

    #[error("Failed to read confirmation: {0}")]
    Prompt(#[from] io::Error),

    #[error("Failed to encode JSON output: {0}")]
    Json(#[from] serde_json::Error),
}

pub type CliResult<T = ()> = std::result::Result<T, CliError>;

/// Asks a yes/no question on stdin. Anything but `y`/`yes` is a no,
/// including a closed stdin.
pub fn confirm(question: &str) -> CliResult<bool> {
    print!("{} [y/N] ", question);
    io::stdout().flush()?;

    let mut answer = String::new();
    io::stdin().lock().read_line(&mut answer)?;
    Ok(matches!(
        answer.trim().to_ascii_lowercase().as_str(),
        "y" | "yes"
    ))
}

/// Runs the schema migration if the registry still needs it, and says so.
pub fn ensure_schema(engine: &TelemetryEngine) -> CliResult {
    if let Some(outcome) = engine.ensure_migrated()? {
        tracing::info!("Registry schema upgraded before running command");
        migrate::print_outcome(&outcome);
        if let MigrationOutcome::Migrated { .. } = outcome {
            println!();
        }
    }
    Ok(())
}

/// For dry runs: the registry as it would read after migration, built in
/// memory. `None` when the file already uses the current schema.
pub fn preview_schema(engine: &TelemetryEngine) -> CliResult<Option<Registry>> {
    let preview = engine.migration().preview()?;
    if preview.is_some() {
        println!("Dry run: the registry would first be upgraded to the current schema");
        println!();
    }
    Ok(preview)
}

/// Shortens paths under the home directory to `~/...` for display.
pub fn display_path(path: &str) -> String {
    match dirs::home_dir() {
        Some(home) => match Path::new(path).strip_prefix(&home) {
            Ok(rest) if rest.as_os_str().is_empty() => "~".to_string(),
            Ok(rest) => format!("~/{}", rest.display()),
            Err(_) => path.to_string(),
        },
        None => path.to_string(),
    }
}

/// Renders a stored RFC 3339 timestamp in local time; anything that doesn't
/// parse is shown verbatim.
pub fn display_timestamp(raw: &str) -> String {
    match chrono::DateTime::parse_from_rfc3339(raw) {
        Ok(ts) => ts
            .with_timezone(&chrono::Local)
            .format("%Y-%m-%d %H:%M")
            .to_string(),
        Err(_) => raw.to_string(),
    }
}

use telemetry_core::{MigrationOutcome, TelemetryEngine};

use super::{display_path, CliResult};

pub fn run(engine: &TelemetryEngine) -> CliResult {
    match engine.ensure_migrated()? {
        Some(outcome) => print_outcome(&outcome),
        None => print_outcome(&MigrationOutcome::AlreadyCurrent),
    }
    Ok(())
}

pub fn print_outcome(outcome: &MigrationOutcome) {
    match outcome {
        MigrationOutcome::CreatedEmpty => {
            println!("Created empty registry (no projects connected yet)");
        }
        MigrationOutcome::AlreadyCurrent => {
            println!("Registry already uses the current schema; nothing to do");
        }
        MigrationOutcome::Migrated {
            upgraded,
            carried_over,
            backup,
        } => {
            println!(
                "Migrated registry: {} record(s) upgraded, {} already current",
                upgraded, carried_over
            );
            println!("Backup: {}", display_path(&backup.to_string_lossy()));
        }
    }
}

use clap::Args;
use std::path::PathBuf;

use telemetry_core::{
    ReconcileAction, ReconcileReport, Registry, TelemetryEngine, TelemetryError,
};

use super::{confirm, display_path, CliResult};

#[derive(Args, Debug, Default)]
pub struct RepairArgs {
    /// Show what would change without writing the registry
    #[arg(long)]
    pub dry_run: bool,

    /// Remove stale entries without asking
    #[arg(long)]
    pub force: bool,

    /// Scan this directory for configured projects instead of the
    /// configured search roots (repeatable)
    #[arg(long = "search-root", value_name = "DIR")]
    pub search_roots: Vec<PathBuf>,
}

/// `preview` is the migrated registry for a dry run against a legacy file.
pub fn run(
    engine: &TelemetryEngine,
    args: &RepairArgs,
    preview: Option<Registry>,
    verbose: bool,
) -> CliResult {
    for root in &args.search_roots {
        if !root.is_dir() {
            return Err(TelemetryError::InvalidPath {
                path: root.clone(),
                reason: "search root does not exist".to_string(),
            }
            .into());
        }
    }

    let discovered = engine.discover(&args.search_roots);
    tracing::debug!(count = discovered.len(), "Discovered configured projects");
    let probe = engine.detect_running_services();
    let reconciler = engine.reconciler();
    let dry_run = args.dry_run || preview.is_some();
    let (registry, mut report) = match preview {
        Some(registry) => reconciler.plan_with(registry, discovered, &probe),
        None => reconciler.plan(discovered, &probe)?,
    };
    report.dry_run = dry_run;

    if dry_run {
        print_report(&report, verbose);
        println!();
        println!("Dry run: registry not modified");
        return Ok(());
    }

    if report.removed > 0 && !args.force {
        println!("Stale registry entries:");
        for record in report.removals() {
            println!("  {} ({})", record.project_name, display_path(&record.project_path));
        }
        let question = format!("Remove {} stale registry entry(s)?", report.removed);
        if !confirm(&question)? {
            println!("Aborted; registry not modified");
            return Ok(());
        }
    }

    reconciler.apply(registry, &report)?;
    print_report(&report, verbose);
    if report.has_changes() || !report.corrupt_lines.is_empty() {
        println!("Registry updated");
    } else {
        println!("Registry already consistent");
    }
    Ok(())
}

fn print_report(report: &ReconcileReport, verbose: bool) {
    let (add, update, remove) = if report.dry_run {
        ("Would add", "update", "remove")
    } else {
        ("Added", "updated", "removed")
    };
    println!(
        "{} {}, {} {}, {} {}; {} unchanged",
        add, report.added, update, report.updated, remove, report.removed, report.unchanged
    );

    for action in &report.actions {
        match action {
            ReconcileAction::Add { record } => {
                println!("  + {} ({})", record.project_name, display_path(&record.project_path));
            }
            ReconcileAction::Remove { record, reasons } => {
                let reasons: Vec<&str> = reasons.iter().map(|r| r.as_str()).collect();
                println!(
                    "  - {} ({}): {}",
                    record.project_name,
                    display_path(&record.project_path),
                    reasons.join(", ")
                );
            }
            ReconcileAction::Update {
                before,
                after,
                invalid,
            } => {
                if !verbose {
                    continue;
                }
                println!("  ~ {} ({})", after.project_name, display_path(&after.project_path));
                if before.installation_path != after.installation_path {
                    println!(
                        "      installation {} -> {}",
                        display_path(&before.installation_path),
                        display_path(&after.installation_path)
                    );
                }
                if before.session_id != after.session_id {
                    println!("      session {} -> {}", before.session_id, after.session_id);
                }
                if before.log_server_pids != after.log_server_pids
                    || before.dashboard_server_pids != after.dashboard_server_pids
                {
                    println!(
                        "      pids {}/{} -> {}/{}",
                        before.log_server_pids,
                        before.dashboard_server_pids,
                        after.log_server_pids,
                        after.dashboard_server_pids
                    );
                }
                if !invalid.is_empty() {
                    let reasons: Vec<&str> = invalid.iter().map(|r| r.as_str()).collect();
                    println!("      incomplete configuration: {}", reasons.join(", "));
                }
            }
        }
    }

    if !report.violations_before.is_empty() {
        println!(
            "Session consistency problems found: {}",
            report.violations_before.len()
        );
    }
    if !report.corrupt_lines.is_empty() {
        println!(
            "Unreadable registry lines: {} (moved to the quarantine file on write)",
            report.corrupt_lines.len()
        );
        if verbose {
            for line in &report.corrupt_lines {
                println!("  line {}: {} ({})", line.line_number, line.content, line.reason);
            }
        }
    }
    if !report.ambiguous_installations.is_empty() {
        println!("Services are running from more than one installation; using the first:");
        for path in &report.ambiguous_installations {
            println!("  {}", display_path(path));
        }
    }
}

use clap::Args;

use telemetry_core::{
    CleanupOptions, CleanupReport, Registry, Session, StopOutcome, TelemetryEngine,
};

use super::{confirm, display_path, CliResult};

#[derive(Args, Debug, Default)]
pub struct CleanupArgs {
    /// Show what would happen without stopping, rewriting or starting anything
    #[arg(long)]
    pub dry_run: bool,

    /// Don't ask before cleaning up each session
    #[arg(long)]
    pub force: bool,

    /// Never delete an orphaned installation directory
    #[arg(long)]
    pub keep_data: bool,
}

impl From<&CleanupArgs> for CleanupOptions {
    fn from(args: &CleanupArgs) -> Self {
        CleanupOptions {
            dry_run: args.dry_run,
            force: args.force,
            keep_data: args.keep_data,
        }
    }
}

fn confirm_session(session: &Session, removes: Option<&str>) -> bool {
    println!();
    println!(
        "Orphaned session {} at {}:",
        session.id,
        display_path(&session.installation_path)
    );
    for member in &session.members {
        println!(
            "  {} ({})",
            member.project_name,
            display_path(&member.project_path)
        );
    }
    let question = match removes {
        Some(path) => format!(
            "Move these projects to the canonical installation and delete {}?",
            display_path(path)
        ),
        None => "Move these projects to the canonical installation?".to_string(),
    };
    match confirm(&question) {
        Ok(answer) => answer,
        Err(e) => {
            tracing::warn!(error = %e, "Could not read confirmation; skipping session");
            false
        }
    }
}

/// `preview` is the migrated registry for a dry run against a legacy file.
pub fn run(engine: &TelemetryEngine, args: &CleanupArgs, preview: Option<Registry>) -> CliResult {
    let options = CleanupOptions::from(args);
    let mut cleanup = engine.orphan_cleanup();
    if let Some(registry) = preview {
        cleanup = cleanup.with_registry_preview(registry);
    }
    let mut ask = |session: &Session| {
        confirm_session(session, cleanup.data_removal_target(session, &options).as_deref())
    };
    let reports = cleanup.cleanup_all_orphaned(&options, &mut ask)?;

    if reports.is_empty() {
        println!("No orphaned sessions");
        return Ok(());
    }
    for report in &reports {
        print_report(report);
    }

    let cleaned = reports.iter().filter(|r| !r.declined).count();
    println!();
    if reports.iter().any(|r| r.dry_run) {
        println!(
            "Dry run: {} orphaned session(s) would be moved to {}",
            cleaned,
            display_path(&engine.canonical_root())
        );
    } else {
        println!(
            "Moved {} of {} orphaned session(s) to {}",
            cleaned,
            reports.len(),
            display_path(&engine.canonical_root())
        );
    }
    Ok(())
}

fn describe_stop(outcome: &StopOutcome) -> String {
    match outcome {
        StopOutcome::AlreadyStopped => "already stopped".to_string(),
        StopOutcome::Stopped => "stopped".to_string(),
        StopOutcome::Killed => "killed".to_string(),
        StopOutcome::SignalFailed(reason) => format!("signal failed: {}", reason),
        StopOutcome::Unresponsive => "still running".to_string(),
    }
}

fn join_pids(pids: &[u32]) -> String {
    let pids: Vec<String> = pids.iter().map(u32::to_string).collect();
    pids.join(" ")
}

fn print_report(report: &CleanupReport) {
    println!();
    println!(
        "Session {} ({}) -> {}",
        report.session_id,
        display_path(&report.installation_path),
        report.new_session_id
    );
    if report.declined {
        println!("  skipped");
        return;
    }

    if report.dry_run {
        if !report.pids_to_stop.is_empty() {
            println!("  would stop PIDs {}", join_pids(&report.pids_to_stop));
        }
        for member in &report.members {
            println!("  would move {}", member.project_name);
        }
    } else {
        for stop in &report.stops {
            println!("  PID {}: {}", stop.pid, describe_stop(&stop.outcome));
        }
        println!("  moved {} project record(s)", report.records_moved);
    }

    if !report.pids_skipped.is_empty() {
        println!(
            "  left running (PID reused by another program): {}",
            join_pids(&report.pids_skipped)
        );
    }

    if !report.hooks_rewritten.is_empty() {
        println!(
            "  hooks {}: {}",
            if report.dry_run { "to rewrite" } else { "rewritten" },
            report.hooks_rewritten.len()
        );
    }
    for project in &report.hooks_skipped {
        println!("  hook left unchanged: {}", display_path(project));
    }
    for service in &report.services_started {
        println!(
            "  {} {}",
            if report.dry_run { "would start" } else { "started" },
            service
        );
    }
    if let Some(path) = &report.data_removed {
        println!(
            "  {} {}",
            if report.dry_run { "would remove" } else { "removed" },
            display_path(path)
        );
    }
    for warning in &report.warnings {
        println!("  warning: {}", warning);
    }
}

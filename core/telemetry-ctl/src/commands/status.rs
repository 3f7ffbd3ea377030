use clap::Args;
use serde::Serialize;

use telemetry_core::{
    consistency_violations, ConsistencyViolation, SessionHealth, SessionSummary, TelemetryEngine,
};

use super::{display_path, display_timestamp, CliResult};

#[derive(Args, Debug, Default)]
pub struct StatusArgs {
    /// Only list sessions running from a non-canonical installation
    #[arg(long)]
    pub orphaned: bool,

    /// Include failed sessions that have no active projects
    #[arg(long)]
    pub all: bool,

    /// Print machine-readable JSON instead of text
    #[arg(long)]
    pub json: bool,
}

#[derive(Serialize)]
struct StatusReport<'a> {
    canonical_root: &'a str,
    sessions: Vec<&'a SessionSummary>,
    ambiguous_installations: Vec<String>,
    violations: Vec<ConsistencyViolation>,
}

/// Sessions hidden by default: failed and with nobody relying on them.
fn is_dormant(summary: &SessionSummary) -> bool {
    summary.health == SessionHealth::Failed
        && summary
            .projects
            .iter()
            .all(|p| p.status != telemetry_core::RecordStatus::Active)
}

pub fn select<'a>(summaries: &'a [SessionSummary], args: &StatusArgs) -> Vec<&'a SessionSummary> {
    summaries
        .iter()
        .filter(|s| !args.orphaned || s.orphaned)
        .filter(|s| args.all || !is_dormant(s))
        .collect()
}

pub fn run(engine: &TelemetryEngine, args: &StatusArgs, verbose: bool) -> CliResult {
    let canonical = engine.canonical_root();
    let summaries = engine.session_summaries()?;
    let registry = engine.store().load_or_empty()?;
    let probe = engine.detect_running_services();

    let report = StatusReport {
        canonical_root: &canonical,
        sessions: select(&summaries, args),
        ambiguous_installations: if probe.is_ambiguous() {
            probe.candidate_installations()
        } else {
            Vec::new()
        },
        violations: consistency_violations(registry.records()),
    };

    if args.json {
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }

    println!("Canonical installation: {}", display_path(&canonical));
    if report.sessions.is_empty() {
        if summaries.is_empty() {
            println!("No connected projects");
        } else {
            println!("No sessions match (use --all to include dormant sessions)");
        }
    }

    for summary in &report.sessions {
        print_session(summary, verbose);
    }

    if !report.ambiguous_installations.is_empty() {
        println!();
        println!("Warning: services are running from more than one installation:");
        for path in &report.ambiguous_installations {
            println!("  {}", display_path(path));
        }
    }
    if !report.violations.is_empty() {
        println!();
        println!(
            "Warning: {} session consistency problem(s); run `telemetry-ctl repair`",
            report.violations.len()
        );
    }
    if registry.has_corrupt_lines() {
        println!(
            "Warning: {} unreadable registry line(s); run `telemetry-ctl repair`",
            registry.corrupt_lines().len()
        );
    }
    Ok(())
}

fn print_session(summary: &SessionSummary, verbose: bool) {
    println!();
    let mut line = format!(
        "{}  {}  {}",
        summary.session_id,
        summary.health.as_str(),
        display_path(&summary.installation_path)
    );
    if summary.orphaned {
        line.push_str(&format!("  [orphaned: {}]", summary.orphan_reasons.join(", ")));
    }
    if summary.inconsistent {
        line.push_str("  [inconsistent]");
    }
    println!("{}", line);
    println!(
        "  log server: {}  dashboard server: {}",
        summary.log_server_pids, summary.dashboard_server_pids
    );

    for project in &summary.projects {
        if verbose {
            println!(
                "  - {} ({}, {}, connected {})",
                project.project_name,
                display_path(&project.project_path),
                project.status,
                display_timestamp(&project.connected_at)
            );
        } else {
            println!("  - {}", project.project_name);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use telemetry_core::sessions::SessionMember;
    use telemetry_core::{PidSet, RecordStatus, SessionId};

    fn summary(health: SessionHealth, orphaned: bool, status: RecordStatus) -> SessionSummary {
        SessionSummary {
            session_id: SessionId::for_installation("/x"),
            installation_path: "/x".to_string(),
            health,
            orphaned,
            orphan_reasons: Vec::new(),
            inconsistent: false,
            log_server_pids: PidSet::empty(),
            dashboard_server_pids: PidSet::empty(),
            projects: vec![SessionMember {
                project_path: "/p".to_string(),
                project_name: "p".to_string(),
                connected_at: "2025-01-01T00:00:00Z".to_string(),
                status,
            }],
        }
    }

    #[test]
    fn dormant_sessions_need_all() {
        let summaries = vec![
            summary(SessionHealth::Failed, false, RecordStatus::Inactive),
            summary(SessionHealth::Failed, false, RecordStatus::Active),
        ];
        assert_eq!(select(&summaries, &StatusArgs::default()).len(), 1);
        let all = StatusArgs {
            all: true,
            ..Default::default()
        };
        assert_eq!(select(&summaries, &all).len(), 2);
    }

    #[test]
    fn orphaned_filter_keeps_only_orphans() {
        let summaries = vec![
            summary(SessionHealth::Healthy, false, RecordStatus::Active),
            summary(SessionHealth::Degraded, true, RecordStatus::Active),
        ];
        let args = StatusArgs {
            orphaned: true,
            ..Default::default()
        };
        let selected = select(&summaries, &args);
        assert_eq!(selected.len(), 1);
        assert!(selected[0].orphaned);
    }
}

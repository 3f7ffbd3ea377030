//! telemetry-ctl: inspect and repair the agent telemetry project registry.
//!
//! ## Subcommands
//!
//! - `status`: sessions, their health and orphan flags
//! - `repair`: reconcile the registry with configured projects and live services
//! - `cleanup`: move orphaned sessions onto the canonical installation
//! - `migrate`: upgrade a legacy registry file (idempotent)
//!
//! Every subcommand except `migrate` upgrades a legacy registry first. Dry
//! runs plan against the upgraded registry in memory and leave the file as
//! it is.

mod commands;
mod logging;

use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};

use commands::cleanup::CleanupArgs;
use commands::repair::RepairArgs;
use commands::status::StatusArgs;
use commands::CliResult;
use telemetry_core::{resolve_root, StoragePaths, TelemetryEngine};

#[derive(Parser)]
#[command(name = "telemetry-ctl")]
#[command(about = "Agent telemetry project registry")]
#[command(version)]
struct Cli {
    /// Canonical installation root
    #[arg(long, global = true, env = "AGENT_TELEMETRY_ROOT", value_name = "DIR")]
    root: Option<PathBuf>,

    /// Show per-project detail and debug logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List sessions and their health
    Status(StatusArgs),

    /// Reconcile the registry with configured projects and running services
    Repair(RepairArgs),

    /// Move orphaned sessions to the canonical installation
    Cleanup(CleanupArgs),

    /// Upgrade the registry to the current schema
    Migrate,
}

impl Commands {
    fn name(&self) -> &'static str {
        match self {
            Commands::Status(_) => "status",
            Commands::Repair(_) => "repair",
            Commands::Cleanup(_) => "cleanup",
            Commands::Migrate => "migrate",
        }
    }

    fn dry_run(&self) -> bool {
        match self {
            Commands::Repair(args) => args.dry_run,
            Commands::Cleanup(args) => args.dry_run,
            Commands::Status(_) | Commands::Migrate => false,
        }
    }
}

fn run(root: &Path, command: &Commands, verbose: bool) -> CliResult {
    let engine = TelemetryEngine::open(root)?;
    tracing::debug!(root = %root.display(), command = command.name(), "Opened installation");

    let preview = if command.dry_run() {
        commands::preview_schema(&engine)?
    } else {
        if !matches!(command, Commands::Migrate) {
            commands::ensure_schema(&engine)?;
        }
        None
    };

    match command {
        Commands::Status(args) => commands::status::run(&engine, args, verbose),
        Commands::Repair(args) => commands::repair::run(&engine, args, preview, verbose),
        Commands::Cleanup(args) => commands::cleanup::run(&engine, args, preview),
        Commands::Migrate => commands::migrate::run(&engine),
    }
}

fn main() {
    let cli = Cli::parse();
    let cwd = std::env::current_dir().ok();
    let root = resolve_root(cli.root.as_deref(), cwd.as_deref());

    let logs_dir = root
        .as_ref()
        .ok()
        .map(|root| StoragePaths::with_root(root).logs_dir());
    let _logging_guard = logging::init(logs_dir.as_deref(), cli.verbose);

    let root = match root {
        Ok(root) => root,
        Err(e) => {
            tracing::error!(error = %e, "Could not resolve the telemetry installation root");
            std::process::exit(1);
        }
    };

    if let Err(e) = run(&root, &cli.command, cli.verbose) {
        tracing::error!(error = %e, "telemetry-ctl {} failed", cli.command.name());
        std::process::exit(1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn verbose_is_accepted_after_the_subcommand() {
        let cli = Cli::try_parse_from(["telemetry-ctl", "status", "--verbose", "--orphaned"])
            .unwrap();
        assert!(cli.verbose);
        let Commands::Status(args) = cli.command else {
            panic!("expected status");
        };
        assert!(args.orphaned);
        assert!(!args.all);
    }

    #[test]
    fn repair_collects_repeated_search_roots() {
        let cli = Cli::try_parse_from([
            "telemetry-ctl",
            "repair",
            "--dry-run",
            "--search-root",
            "/a",
            "--search-root",
            "/b",
        ])
        .unwrap();
        let Commands::Repair(args) = cli.command else {
            panic!("expected repair");
        };
        assert!(args.dry_run);
        assert_eq!(args.search_roots, vec![PathBuf::from("/a"), PathBuf::from("/b")]);
    }

    #[test]
    fn migrate_runs_against_a_fresh_root() {
        let temp = tempfile::TempDir::new().unwrap();
        run(temp.path(), &Commands::Migrate, false).unwrap();
        let registry = StoragePaths::with_root(temp.path()).registry_file();
        assert!(registry.exists());
    }

    const LEGACY: &str = "/p/api|api|2025-01-01T00:00:00Z\n";

    fn legacy_root() -> (tempfile::TempDir, PathBuf) {
        let temp = tempfile::TempDir::new().unwrap();
        let registry = StoragePaths::with_root(temp.path()).registry_file();
        fs_err::create_dir_all(registry.parent().unwrap()).unwrap();
        fs_err::write(&registry, LEGACY).unwrap();
        (temp, registry)
    }

    #[test]
    fn dry_run_repair_leaves_a_legacy_registry_alone() {
        let (temp, registry) = legacy_root();
        let args = RepairArgs {
            dry_run: true,
            search_roots: vec![temp.path().to_path_buf()],
            ..Default::default()
        };
        run(temp.path(), &Commands::Repair(args), false).unwrap();
        assert_eq!(fs_err::read_to_string(&registry).unwrap(), LEGACY);
    }

    #[test]
    fn dry_run_cleanup_leaves_a_legacy_registry_alone() {
        let (temp, registry) = legacy_root();
        let args = CleanupArgs {
            dry_run: true,
            ..Default::default()
        };
        run(temp.path(), &Commands::Cleanup(args), false).unwrap();
        assert_eq!(fs_err::read_to_string(&registry).unwrap(), LEGACY);
    }

    #[test]
    fn status_upgrades_a_legacy_registry() {
        let (temp, registry) = legacy_root();
        run(temp.path(), &Commands::Status(StatusArgs::default()), false).unwrap();
        assert_ne!(fs_err::read_to_string(&registry).unwrap(), LEGACY);
    }

    #[test]
    fn explicit_missing_root_is_an_error() {
        let temp = tempfile::TempDir::new().unwrap();
        let missing = temp.path().join("nope");
        assert!(resolve_root(Some(&missing), None).is_err());
    }
}

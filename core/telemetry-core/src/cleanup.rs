//! Moving orphaned sessions onto the canonical installation.
//!
//! For each orphaned session:
//!
//! 1. List member projects
//! 2. Ask for confirmation (skipped with `force` or `dry_run`)
//! 3. Stop the session's processes (SIGTERM, poll, SIGKILL)
//! 4. Derive the canonical session id
//! 5. Re-render member hooks and point member records at the canonical root
//! 6. Start canonical services that aren't running
//! 7. After a settle delay, re-probe and record the new PIDs
//!
//! Cleanup is best-effort and forward-only. A step that fails is recorded
//! as a warning on the [`CleanupReport`] and later steps still run; nothing
//! is rolled back.
//!
//! Only PIDs the probe sees running the session's service from the
//! session's installation are signalled. A stored PID that now belongs to
//! something else is reported in `pids_skipped` and left alone.

use serde::Serialize;
use std::path::Path;
use std::time::Duration;

use tracing::{info, warn};

use crate::config::{ServiceKind, TelemetryConfig};
use crate::error::{Result, TelemetryError};
use crate::hooks::{hook_path, rewrite_project_hook, HookTemplate};
use crate::probe::{ProbeResult, ProcessProbe};
use crate::registry::{PidSet, Registry, RegistryStore, SessionId};
use crate::services::{stop_process, ServiceControl, StopOutcome, StopPolicy};
use crate::sessions::{group_by_session, OrphanFlags, Session, SessionMember};
use crate::storage::{normalize_path, StoragePaths};

#[derive(Debug, Clone, Copy, Default)]
pub struct CleanupOptions {
    pub dry_run: bool,
    pub force: bool,
    /// Never delete the orphaned installation directory.
    pub keep_data: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PidStop {
    pub pid: u32,
    pub outcome: StopOutcome,
}

#[derive(Debug, Clone, Serialize)]
pub struct CleanupReport {
    pub session_id: SessionId,
    pub installation_path: String,
    pub orphan_flags: OrphanFlags,
    pub dry_run: bool,
    /// The operator answered no; nothing else was done.
    pub declined: bool,
    pub members: Vec<SessionMember>,
    /// Stored PIDs still running the session's services.
    pub pids_to_stop: Vec<u32>,
    /// Stored PIDs that are alive but no longer this session's services.
    pub pids_skipped: Vec<u32>,
    pub stops: Vec<PidStop>,
    pub new_session_id: SessionId,
    pub hooks_rewritten: Vec<String>,
    pub hooks_skipped: Vec<String>,
    pub records_moved: usize,
    pub services_started: Vec<String>,
    /// Directory deleted, or in a dry run the directory that would be.
    pub data_removed: Option<String>,
    pub warnings: Vec<String>,
}

impl CleanupReport {
    fn new(session: &Session, flags: OrphanFlags, canonical_root: &str, dry_run: bool) -> Self {
        Self {
            session_id: session.id.clone(),
            installation_path: session.installation_path.clone(),
            orphan_flags: flags,
            dry_run,
            declined: false,
            members: session
                .members
                .iter()
                .map(|m| SessionMember {
                    project_path: m.project_path.clone(),
                    project_name: m.project_name.clone(),
                    connected_at: m.connected_at.clone(),
                    status: m.status,
                })
                .collect(),
            pids_to_stop: Vec::new(),
            pids_skipped: Vec::new(),
            stops: Vec::new(),
            new_session_id: SessionId::for_installation(canonical_root),
            hooks_rewritten: Vec::new(),
            hooks_skipped: Vec::new(),
            records_moved: 0,
            services_started: Vec::new(),
            data_removed: None,
            warnings: Vec::new(),
        }
    }

    fn warn(&mut self, message: String) {
        warn!("{}", message);
        self.warnings.push(message);
    }

    /// Every stop succeeded and no step warned.
    pub fn is_clean(&self) -> bool {
        self.warnings.is_empty() && self.stops.iter().all(|s| s.outcome.is_success())
    }
}

pub struct OrphanCleanup<'a> {
    store: &'a RegistryStore,
    paths: &'a StoragePaths,
    config: &'a TelemetryConfig,
    probe: &'a dyn ProcessProbe,
    control: &'a dyn ServiceControl,
    policy: StopPolicy,
    settle: Duration,
    preview: Option<Registry>,
}

impl<'a> OrphanCleanup<'a> {
    pub fn new(
        store: &'a RegistryStore,
        paths: &'a StoragePaths,
        config: &'a TelemetryConfig,
        probe: &'a dyn ProcessProbe,
        control: &'a dyn ServiceControl,
    ) -> Self {
        Self {
            store,
            paths,
            config,
            probe,
            control,
            policy: StopPolicy::from_config(config),
            settle: config.start_settle(),
            preview: None,
        }
    }

    pub fn with_stop_policy(mut self, policy: StopPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_settle(mut self, settle: Duration) -> Self {
        self.settle = settle;
        self
    }

    /// Plans against `registry` instead of the file on disk, such as a
    /// migration that hasn't been written yet. Every run is then a dry run.
    pub fn with_registry_preview(mut self, registry: Registry) -> Self {
        self.preview = Some(registry);
        self
    }

    fn canonical_root(&self) -> String {
        self.paths.root_str()
    }

    fn load_registry(&self) -> Result<Registry> {
        match &self.preview {
            Some(registry) => Ok(registry.clone()),
            None => self.store.load_or_empty(),
        }
    }

    /// Sessions in the registry whose installation is not the canonical root.
    pub fn orphaned_sessions(&self) -> Result<Vec<Session>> {
        let canonical = self.canonical_root();
        let registry = self.load_registry()?;
        Ok(group_by_session(registry.records())
            .into_iter()
            .filter(|s| s.is_orphaned(&canonical))
            .collect())
    }

    /// Runs [`OrphanCleanup::cleanup_session`] for every orphaned session.
    pub fn cleanup_all_orphaned(
        &self,
        options: &CleanupOptions,
        confirm: &mut dyn FnMut(&Session) -> bool,
    ) -> Result<Vec<CleanupReport>> {
        let sessions = self.orphaned_sessions()?;
        if sessions.is_empty() {
            info!("No orphaned sessions");
        }
        sessions
            .iter()
            .map(|session| self.cleanup_session(session, options, confirm))
            .collect()
    }

    pub fn cleanup_session(
        &self,
        session: &Session,
        options: &CleanupOptions,
        confirm: &mut dyn FnMut(&Session) -> bool,
    ) -> Result<CleanupReport> {
        let options = &CleanupOptions {
            dry_run: options.dry_run || self.preview.is_some(),
            ..*options
        };
        let canonical = self.canonical_root();
        let flags = session.orphan_flags(&canonical);
        let mut report = CleanupReport::new(session, flags, &canonical, options.dry_run);

        info!(
            session = %session.id,
            installation = %session.installation_path,
            members = session.members.len(),
            reasons = ?flags.describe(),
            dry_run = options.dry_run,
            "Cleaning up orphaned session"
        );

        if !options.force && !options.dry_run && !confirm(session) {
            info!(session = %session.id, "Cleanup declined");
            report.declined = true;
            return Ok(report);
        }

        self.stop_session_processes(session, options, &mut report);
        self.rewrite_hooks(session, options, &mut report);
        self.move_records(session, options, &mut report)?;

        let started = self.start_canonical_services(options, &mut report);
        if !options.dry_run && report.records_moved > 0 {
            if started {
                std::thread::sleep(self.settle);
            }
            let probe = self.probe.detect_running_services();
            self.record_new_pids(session, &probe, &mut report)?;
        }

        self.remove_orphan_data(session, options, &mut report);

        info!(
            session = %session.id,
            moved = report.records_moved,
            warnings = report.warnings.len(),
            "Session cleanup finished"
        );
        Ok(report)
    }

    /// The orphaned installation directory cleanup would delete, if any.
    ///
    /// Only temp or test installs are deleted, never a directory holding the
    /// canonical root, the home directory or a member project. The same
    /// answer is given for dry runs, so callers can show it before asking.
    pub fn data_removal_target(
        &self,
        session: &Session,
        options: &CleanupOptions,
    ) -> Option<String> {
        if options.keep_data {
            return None;
        }
        let orphan = normalize_path(&session.installation_path);
        if !session.orphan_flags(&self.canonical_root()).is_disposable() {
            info!(installation = %orphan, "Orphaned installation kept; not a temp or test path");
            return None;
        }

        let contains = |path: &str| {
            let path = normalize_path(path);
            orphan == "/" || path == orphan || path.starts_with(&format!("{}/", orphan))
        };
        let home = dirs::home_dir().map(|h| h.to_string_lossy().into_owned());
        if contains(&self.canonical_root()) || home.as_deref().is_some_and(&contains) {
            return None;
        }
        if let Some(member) = session.members.iter().find(|m| contains(&m.project_path)) {
            warn!(
                installation = %orphan,
                project = %member.project_path,
                "Orphaned installation kept; a project lives inside it"
            );
            return None;
        }
        if !Path::new(&orphan).is_dir() {
            return None;
        }
        Some(orphan)
    }

    // ─────────────────────────────────────────────────────────────────────────────
    // Steps
    // ─────────────────────────────────────────────────────────────────────────────

    fn stop_session_processes(
        &self,
        session: &Session,
        options: &CleanupOptions,
        report: &mut CleanupReport,
    ) {
        let running = self.probe.detect_running_services();
        let stored = [
            (ServiceKind::LogServer, &session.log_server_pids),
            (ServiceKind::DashboardServer, &session.dashboard_server_pids),
        ];
        for (kind, pids) in stored {
            for pid in pids.iter() {
                if running.service(kind).serves(pid, &session.installation_path) {
                    report.pids_to_stop.push(pid);
                } else if self.probe.is_alive(pid) {
                    info!(
                        pid,
                        service = kind.label(),
                        "PID now belongs to another process; not stopping it"
                    );
                    report.pids_skipped.push(pid);
                }
            }
        }
        if options.dry_run {
            return;
        }

        for &pid in &report.pids_to_stop.clone() {
            let outcome = stop_process(pid, self.probe, self.control, &self.policy);
            match &outcome {
                StopOutcome::SignalFailed(reason) => {
                    report.warn(format!("could not signal process {}: {}", pid, reason))
                }
                StopOutcome::Unresponsive => report.warn(
                    TelemetryError::ProcessUnresponsive {
                        pid,
                        waited_secs: self.policy.poll_interval.as_secs()
                            * u64::from(self.policy.max_polls),
                    }
                    .to_string(),
                ),
                _ => {}
            }
            report.stops.push(PidStop { pid, outcome });
        }
    }

    fn rewrite_hooks(&self, session: &Session, options: &CleanupOptions, report: &mut CleanupReport) {
        let layout = &self.config.project_layout;
        let template = match HookTemplate::load(&self.paths.hook_template()) {
            Ok(template) => Some(template),
            Err(err) => {
                report.warn(format!("{}; hooks left unchanged", err));
                None
            }
        };

        for member in &session.members {
            let target = hook_path(&member.project_path, layout).display().to_string();
            let Some(template) = &template else {
                report.hooks_skipped.push(target);
                continue;
            };
            if !Path::new(&member.project_path).is_dir() {
                report.warn(format!(
                    "project {} no longer exists; hook not rewritten",
                    member.project_path
                ));
                report.hooks_skipped.push(target);
                continue;
            }
            if options.dry_run {
                report.hooks_rewritten.push(target);
                continue;
            }
            match rewrite_project_hook(
                template,
                &member.project_path,
                &member.project_name,
                layout,
                &self.config.server_url,
            ) {
                Ok(_) => report.hooks_rewritten.push(target),
                Err(err) => {
                    report.warn(format!("hook for {} not rewritten: {}", member.project_path, err));
                    report.hooks_skipped.push(target);
                }
            }
        }
    }

    fn move_records(
        &self,
        session: &Session,
        options: &CleanupOptions,
        report: &mut CleanupReport,
    ) -> Result<()> {
        let canonical = self.canonical_root();
        let mut registry = self.load_registry()?;

        for member in &session.members {
            let Some(existing) = registry.get(&member.project_path) else {
                report.warn(format!("{} left the registry during cleanup", member.project_path));
                continue;
            };
            let mut record = existing.clone();
            record.assign_installation(&canonical);
            record.log_server_pids = PidSet::empty();
            record.dashboard_server_pids = PidSet::empty();
            registry.upsert(record);
            report.records_moved += 1;
        }

        if !options.dry_run && report.records_moved > 0 {
            self.store.save(&mut registry)?;
        }
        Ok(())
    }

    /// Returns true if anything was launched.
    fn start_canonical_services(&self, options: &CleanupOptions, report: &mut CleanupReport) -> bool {
        let canonical = self.canonical_root();
        let running = self.probe.detect_running_services();
        let mut started = false;

        for kind in ServiceKind::ALL {
            if running.service(kind).runs_from(&canonical) {
                continue;
            }
            let spec = self.config.service(kind);
            if options.dry_run {
                report.services_started.push(spec.name.clone());
                continue;
            }
            match self.control.start(spec, self.paths) {
                Ok(pid) => {
                    info!(service = %spec.name, pid, "Started canonical service");
                    report.services_started.push(spec.name.clone());
                    started = true;
                }
                Err(err) => report.warn(format!("{} did not start: {}", kind.label(), err)),
            }
        }
        started
    }

    fn record_new_pids(
        &self,
        session: &Session,
        probe: &ProbeResult,
        report: &mut CleanupReport,
    ) -> Result<()> {
        let canonical = self.canonical_root();
        let pids_for = |kind: ServiceKind| {
            let handle = probe.service(kind);
            if handle.runs_from(&canonical) {
                handle.pids.clone()
            } else {
                PidSet::empty()
            }
        };
        let log_pids = pids_for(ServiceKind::LogServer);
        let dashboard_pids = pids_for(ServiceKind::DashboardServer);
        if log_pids.is_empty() || dashboard_pids.is_empty() {
            report.warn("canonical services not both running after settle delay".to_string());
        }

        let mut registry = self.store.load_or_empty()?;
        let mut changed = false;
        for member in &session.members {
            let Some(existing) = registry.get(&member.project_path) else {
                continue;
            };
            if existing.installation_path != canonical {
                continue;
            }
            let mut record = existing.clone();
            record.log_server_pids = log_pids.clone();
            record.dashboard_server_pids = dashboard_pids.clone();
            registry.upsert(record);
            changed = true;
        }
        if changed {
            self.store.save(&mut registry)?;
        }
        Ok(())
    }

    fn remove_orphan_data(
        &self,
        session: &Session,
        options: &CleanupOptions,
        report: &mut CleanupReport,
    ) {
        let Some(orphan) = self.data_removal_target(session, options) else {
            return;
        };
        if let Some(stop) = report.stops.iter().find(|s| !s.outcome.is_success()) {
            report.warn(format!(
                "{} kept: process {} may still be running from it",
                orphan, stop.pid
            ));
            return;
        }
        if options.dry_run {
            report.data_removed = Some(orphan);
            return;
        }

        match fs_err::remove_dir_all(&orphan) {
            Ok(()) => {
                info!(installation = %orphan, "Removed orphaned installation");
                report.data_removed = Some(orphan);
            }
            Err(err) => report.warn(format!("could not remove {}: {}", orphan, err)),
        }
    }
}

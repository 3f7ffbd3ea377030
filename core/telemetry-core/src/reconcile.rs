//! Aligns the registry with on-disk configuration and live processes.
//!
//! Scenarios, per project:
//!
//! 1. Discovered, not registered      -> add (active, probe PIDs/installation)
//! 2. Discovered, registered          -> refresh PIDs/installation/session,
//!    keeping `connected_at`; invalid configuration is only logged
//! 3. Registered, not discovered, invalid -> remove (the only automatic delete)
//! 4. Registered, not discovered, valid   -> keep; a session id that isn't the
//!    hash of the installation path is regenerated
//!
//! Planning is pure: the registry, the discovered projects, the probe result
//! and a validator go in, a [`ReconcileReport`] comes out. A dry run plans
//! exactly like a live run and then skips the write.

use serde::Serialize;
use std::collections::HashSet;
use std::path::Path;

use tracing::{debug, info, warn};

use crate::config::ProjectLayout;
use crate::discovery::DiscoveredProject;
use crate::error::Result;
use crate::probe::ProbeResult;
use crate::registry::{
    now_timestamp, CorruptLine, RecordStatus, Registry, RegistryRecord, RegistryStore,
};
use crate::sessions::{consistency_violations, ConsistencyViolation};
use crate::storage::normalize_path;
use crate::validation::{validate, InvalidReason, ValidationOutcome};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum ReconcileAction {
    Add {
        record: RegistryRecord,
    },
    Update {
        before: RegistryRecord,
        after: RegistryRecord,
        /// Validation reasons seen while refreshing; logged, not acted on.
        invalid: Vec<InvalidReason>,
    },
    Remove {
        record: RegistryRecord,
        reasons: Vec<InvalidReason>,
    },
}

impl ReconcileAction {
    pub fn project_path(&self) -> &str {
        match self {
            ReconcileAction::Add { record } | ReconcileAction::Remove { record, .. } => {
                &record.project_path
            }
            ReconcileAction::Update { after, .. } => &after.project_path,
        }
    }
}

/// What reconciliation did (or, in a dry run, would do).
#[derive(Debug, Clone, Default, Serialize)]
pub struct ReconcileReport {
    pub dry_run: bool,
    pub added: usize,
    /// Records whose stored fields change.
    pub updated: usize,
    pub removed: usize,
    /// Records examined and left byte-identical.
    pub unchanged: usize,
    pub actions: Vec<ReconcileAction>,
    pub corrupt_lines: Vec<CorruptLine>,
    /// Violations present before reconciliation.
    pub violations_before: Vec<ConsistencyViolation>,
    /// Distinct installations the probe saw, when more than one.
    pub ambiguous_installations: Vec<String>,
}

impl ReconcileReport {
    pub fn has_changes(&self) -> bool {
        self.added + self.updated + self.removed > 0
    }

    pub fn removals(&self) -> impl Iterator<Item = &RegistryRecord> {
        self.actions.iter().filter_map(|action| match action {
            ReconcileAction::Remove { record, .. } => Some(record),
            _ => None,
        })
    }

    fn push(&mut self, action: ReconcileAction) {
        match &action {
            ReconcileAction::Add { .. } => self.added += 1,
            ReconcileAction::Update { .. } => self.updated += 1,
            ReconcileAction::Remove { .. } => self.removed += 1,
        }
        self.actions.push(action);
    }

    /// Applies the planned actions to `registry`.
    pub fn apply_to(&self, registry: &mut Registry) {
        for action in &self.actions {
            match action {
                ReconcileAction::Add { record } => {
                    registry.upsert(record.clone());
                }
                ReconcileAction::Update { after, .. } => {
                    registry.upsert(after.clone());
                }
                ReconcileAction::Remove { record, .. } => {
                    registry.remove(&record.project_path);
                }
            }
        }
    }
}

/// Refreshes `record` with the probe's view: PIDs, installation, session id
/// and active status. `connected_at` and the name are kept.
fn refreshed(record: &RegistryRecord, probe: &ProbeResult, installation: &str) -> RegistryRecord {
    let mut after = record.clone();
    after.log_server_pids = probe.log_server.pids.clone();
    after.dashboard_server_pids = probe.dashboard_server.pids.clone();
    after.assign_installation(installation);
    after.status = RecordStatus::Active;
    after
}

/// Computes every action without touching the filesystem (the validator
/// is injected).
pub fn plan_reconciliation(
    registry: &Registry,
    discovered: impl IntoIterator<Item = DiscoveredProject>,
    probe: &ProbeResult,
    canonical_root: &str,
    connected_at: &str,
    validator: impl Fn(&str) -> ValidationOutcome,
) -> ReconcileReport {
    let mut report = ReconcileReport {
        corrupt_lines: registry.corrupt_lines().to_vec(),
        violations_before: consistency_violations(registry.records()),
        ..Default::default()
    };
    if probe.is_ambiguous() {
        report.ambiguous_installations = probe.candidate_installations();
    }
    let installation = probe.installation_or(canonical_root);

    let mut seen: HashSet<String> = HashSet::new();
    for project in discovered {
        let path = normalize_path(&project.path);
        if !seen.insert(path.clone()) {
            continue;
        }

        match registry.get(&path) {
            None => {
                let record = RegistryRecord::new(
                    &path,
                    &project.name,
                    connected_at,
                    probe.log_server.pids.clone(),
                    probe.dashboard_server.pids.clone(),
                    &installation,
                );
                report.push(ReconcileAction::Add { record });
            }
            Some(existing) => {
                let outcome = validator(&path);
                if !outcome.is_valid() {
                    warn!(
                        project = %path,
                        reasons = %outcome.describe(),
                        "Registered project has incomplete configuration; refreshing anyway"
                    );
                }
                let after = refreshed(existing, probe, &installation);
                if after == *existing {
                    report.unchanged += 1;
                } else {
                    report.push(ReconcileAction::Update {
                        before: existing.clone(),
                        after,
                        invalid: outcome.reasons(),
                    });
                }
            }
        }
    }

    for record in registry.records() {
        if seen.contains(&record.project_path) {
            continue;
        }
        let outcome = validator(&record.project_path);
        if !outcome.is_valid() {
            report.push(ReconcileAction::Remove {
                record: record.clone(),
                reasons: outcome.reasons(),
            });
            continue;
        }
        if record.session_id_consistent() {
            report.unchanged += 1;
        } else {
            let mut after = record.clone();
            after.assign_installation(&record.installation_path);
            report.push(ReconcileAction::Update {
                before: record.clone(),
                after,
                invalid: Vec::new(),
            });
        }
    }

    report
}

/// Reconciliation against a registry file.
pub struct Reconciler<'a> {
    store: &'a RegistryStore,
    canonical_root: String,
    layout: &'a ProjectLayout,
}

impl<'a> Reconciler<'a> {
    pub fn new(store: &'a RegistryStore, canonical_root: &str, layout: &'a ProjectLayout) -> Self {
        Self {
            store,
            canonical_root: normalize_path(canonical_root),
            layout,
        }
    }

    /// Loads the registry and plans against it. Nothing is written.
    pub fn plan(
        &self,
        discovered: impl IntoIterator<Item = DiscoveredProject>,
        probe: &ProbeResult,
    ) -> Result<(Registry, ReconcileReport)> {
        let registry = self.store.load_or_empty()?;
        Ok(self.plan_with(registry, discovered, probe))
    }

    /// Plans against an already-loaded registry, such as a migration preview.
    pub fn plan_with(
        &self,
        registry: Registry,
        discovered: impl IntoIterator<Item = DiscoveredProject>,
        probe: &ProbeResult,
    ) -> (Registry, ReconcileReport) {
        let report = plan_reconciliation(
            &registry,
            discovered,
            probe,
            &self.canonical_root,
            &now_timestamp(),
            |path| validate(Path::new(path), self.layout),
        );
        (registry, report)
    }

    /// Writes a plan produced by [`Reconciler::plan`]. Corrupt lines are
    /// quarantined as part of the rewrite.
    pub fn apply(&self, mut registry: Registry, report: &ReconcileReport) -> Result<()> {
        if !report.has_changes() && !registry.has_corrupt_lines() {
            debug!("Registry already consistent; nothing to write");
            return Ok(());
        }
        report.apply_to(&mut registry);
        self.store.save(&mut registry)?;
        info!(
            added = report.added,
            updated = report.updated,
            removed = report.removed,
            "Registry reconciled"
        );
        Ok(())
    }

    pub fn reconcile(
        &self,
        discovered: impl IntoIterator<Item = DiscoveredProject>,
        probe: &ProbeResult,
        dry_run: bool,
    ) -> Result<ReconcileReport> {
        let (registry, mut report) = self.plan(discovered, probe)?;
        report.dry_run = dry_run;
        if !dry_run {
            self.apply(registry, &report)?;
        }
        Ok(report)
    }
}

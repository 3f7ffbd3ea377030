//! One-time upgrade from the 3-field legacy registry to the 8-field schema.
//!
//! Legacy rows (`project_path|project_name|connected_date`) predate
//! sessions, so the only evidence of which installation serves them is what
//! is running right now. The process table is probed once and every legacy
//! row is attributed to that installation, or to the canonical root when
//! nothing runs.
//!
//! The existing file is always copied to a timestamped backup before it is
//! rewritten. That copy is the only rollback.

use std::path::PathBuf;

use chrono::Local;
use tracing::{info, warn};

use crate::error::{Result, TelemetryError};
use crate::probe::ProcessProbe;
use crate::registry::{
    record::{field_count, is_comment, MIGRATED_MIN_FIELDS},
    Registry, RegistryRecord, RegistryStore,
};
use crate::storage::{atomic_write, normalize_path};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MigrationOutcome {
    /// No registry existed; an empty one with headers was written.
    CreatedEmpty,
    /// Already in the enhanced schema; nothing written.
    AlreadyCurrent,
    Migrated {
        upgraded: usize,
        /// Enhanced rows that were already present and carried over.
        carried_over: usize,
        backup: PathBuf,
    },
}

pub struct MigrationEngine<'a> {
    store: &'a RegistryStore,
    canonical_root: String,
    probe: &'a dyn ProcessProbe,
}

impl<'a> MigrationEngine<'a> {
    pub fn new(store: &'a RegistryStore, canonical_root: &str, probe: &'a dyn ProcessProbe) -> Self {
        Self {
            store,
            canonical_root: normalize_path(canonical_root),
            probe,
        }
    }

    /// True if the registry is missing, or its first data line has fewer
    /// than seven fields. A file with only comments is current.
    pub fn needs_migration(&self) -> Result<bool> {
        let content = match self.store.read_raw() {
            Ok(content) => content,
            Err(TelemetryError::RegistryMissing(_)) => return Ok(true),
            Err(err) => return Err(err),
        };
        let first_data_line = content
            .lines()
            .find(|line| !line.trim().is_empty() && !is_comment(line));
        Ok(first_data_line.is_some_and(|line| field_count(line) < MIGRATED_MIN_FIELDS))
    }

    pub fn migrate(&self) -> Result<MigrationOutcome> {
        if !self.store.exists() {
            atomic_write(self.store.path(), &Registry::new().render())?;
            info!(registry = %self.store.path().display(), "Created empty registry");
            return Ok(MigrationOutcome::CreatedEmpty);
        }

        if !self.needs_migration()? {
            return Ok(MigrationOutcome::AlreadyCurrent);
        }

        let backup = self.backup()?;
        let content = self.store.read_raw()?;
        let (mut registry, upgraded, installation) = self.upgrade(&content);
        let carried_over = registry.len().saturating_sub(upgraded);

        self.store.save(&mut registry)?;
        info!(
            upgraded,
            carried_over,
            installation = %installation,
            backup = %backup.display(),
            "Registry migrated"
        );

        Ok(MigrationOutcome::Migrated {
            upgraded,
            carried_over,
            backup,
        })
    }

    /// The registry [`MigrationEngine::migrate`] would write, built in
    /// memory. `None` when no migration is needed. Nothing is written.
    pub fn preview(&self) -> Result<Option<Registry>> {
        if !self.needs_migration()? {
            return Ok(None);
        }
        if !self.store.exists() {
            return Ok(Some(Registry::new()));
        }
        let content = self.store.read_raw()?;
        let (registry, upgraded, installation) = self.upgrade(&content);
        info!(upgraded, installation = %installation, "Previewed registry migration");
        Ok(Some(registry))
    }

    /// Probes once and upgrades every legacy line of `content`. Returns the
    /// registry, the number of upgraded lines and the installation used.
    fn upgrade(&self, content: &str) -> (Registry, usize, String) {
        let probe = self.probe.detect_running_services();
        if probe.is_ambiguous() {
            warn!(
                candidates = ?probe.candidate_installations(),
                "Several installations running; legacy projects go to the first match"
            );
        }
        let installation = probe.installation_or(&self.canonical_root);

        let mut upgraded = 0;
        let registry = Registry::parse_with(content, |legacy| {
            upgraded += 1;
            Some(RegistryRecord::new(
                &legacy.project_path,
                &legacy.project_name,
                &legacy.connected_date,
                probe.log_server.pids.clone(),
                probe.dashboard_server.pids.clone(),
                &installation,
            ))
        });
        (registry, upgraded, installation)
    }

    /// Runs [`MigrationEngine::migrate`] only when needed.
    pub fn ensure_migrated(&self) -> Result<Option<MigrationOutcome>> {
        if self.needs_migration()? {
            self.migrate().map(Some)
        } else {
            Ok(None)
        }
    }

    fn backup(&self) -> Result<PathBuf> {
        let stamp = Local::now().format("%Y%m%d_%H%M%S").to_string();
        let mut backup = self.store.backup_path(&stamp);
        let mut suffix = 1;
        while backup.exists() {
            backup = self.store.backup_path(&format!("{}_{}", stamp, suffix));
            suffix += 1;
        }
        fs_err::copy(self.store.path(), &backup)
            .map_err(|e| TelemetryError::io("backing up registry before migration", e))?;
        Ok(backup)
    }
}

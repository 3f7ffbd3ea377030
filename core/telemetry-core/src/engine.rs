//! TelemetryEngine - one canonical installation and its collaborators.
//!
//! The engine owns the resolved paths, the loaded config, the registry store
//! and the OS seams (process probe, service control). Every component is
//! built from it on demand; nothing is cached between calls.
//!
//! ```rust,ignore
//! use telemetry_core::TelemetryEngine;
//!
//! let engine = TelemetryEngine::open(&root)?;
//! engine.ensure_migrated()?;
//! for summary in engine.session_summaries()? {
//!     println!("{} {}", summary.session_id, summary.health.as_str());
//! }
//! ```

use std::path::{Path, PathBuf};

use crate::cleanup::OrphanCleanup;
use crate::config::{load_config, TelemetryConfig};
use crate::discovery::{discover_configured_projects, search_roots, DiscoveredProject};
use crate::error::Result;
use crate::migration::{MigrationEngine, MigrationOutcome};
use crate::probe::{ProbeResult, ProcessProbe, SystemProbe};
use crate::reconcile::Reconciler;
use crate::registry::RegistryStore;
use crate::services::{ServiceControl, SystemServiceControl};
use crate::sessions::{group_by_session, Session, SessionSummary};
use crate::storage::StoragePaths;

pub struct TelemetryEngine {
    paths: StoragePaths,
    config: TelemetryConfig,
    store: RegistryStore,
    probe: Box<dyn ProcessProbe>,
    control: Box<dyn ServiceControl>,
}

impl TelemetryEngine {
    /// Opens the installation at `root` with the real OS seams.
    ///
    /// Fails if the data directories can't be created or the config file is
    /// malformed.
    pub fn open(root: &Path) -> Result<Self> {
        let paths = StoragePaths::with_root(root);
        paths.ensure_dirs()?;
        let config = load_config(&paths.settings_file())?;
        let probe = SystemProbe::new(&config);
        Ok(Self::with_parts(
            paths,
            config,
            Box::new(probe),
            Box::new(SystemServiceControl),
        ))
    }

    /// Assembles an engine from explicit parts. Used by tests with fakes.
    pub fn with_parts(
        paths: StoragePaths,
        config: TelemetryConfig,
        probe: Box<dyn ProcessProbe>,
        control: Box<dyn ServiceControl>,
    ) -> Self {
        let store = RegistryStore::new(&paths);
        Self {
            paths,
            config,
            store,
            probe,
            control,
        }
    }

    pub fn paths(&self) -> &StoragePaths {
        &self.paths
    }

    pub fn config(&self) -> &TelemetryConfig {
        &self.config
    }

    pub fn store(&self) -> &RegistryStore {
        &self.store
    }

    pub fn canonical_root(&self) -> String {
        self.paths.root_str()
    }

    // ─────────────────────────────────────────────────────────────────────────────
    // Migration
    // ─────────────────────────────────────────────────────────────────────────────

    pub fn migration(&self) -> MigrationEngine<'_> {
        MigrationEngine::new(&self.store, &self.canonical_root(), self.probe.as_ref())
    }

    pub fn ensure_migrated(&self) -> Result<Option<MigrationOutcome>> {
        self.migration().ensure_migrated()
    }

    // ─────────────────────────────────────────────────────────────────────────────
    // Sessions
    // ─────────────────────────────────────────────────────────────────────────────

    pub fn detect_running_services(&self) -> ProbeResult {
        self.probe.detect_running_services()
    }

    pub fn sessions(&self) -> Result<Vec<Session>> {
        let registry = self.store.load_or_empty()?;
        Ok(group_by_session(registry.records()))
    }

    /// Summaries for every session against a single probe of the process table.
    pub fn session_summaries(&self) -> Result<Vec<SessionSummary>> {
        let canonical = self.canonical_root();
        let probe = self.detect_running_services();
        Ok(self
            .sessions()?
            .iter()
            .map(|session| SessionSummary::build(session, &canonical, &probe))
            .collect())
    }

    // ─────────────────────────────────────────────────────────────────────────────
    // Reconciliation & Cleanup
    // ─────────────────────────────────────────────────────────────────────────────

    /// Scans `roots_override` when given, else the configured search roots.
    pub fn discover(&self, roots_override: &[PathBuf]) -> Vec<DiscoveredProject> {
        let roots = if roots_override.is_empty() {
            search_roots(&self.config)
        } else {
            roots_override.to_vec()
        };
        discover_configured_projects(
            &roots,
            &self.config.project_layout,
            self.config.discovery_max_depth,
        )
        .collect()
    }

    pub fn reconciler(&self) -> Reconciler<'_> {
        Reconciler::new(
            &self.store,
            &self.canonical_root(),
            &self.config.project_layout,
        )
    }

    pub fn orphan_cleanup(&self) -> OrphanCleanup<'_> {
        OrphanCleanup::new(
            &self.store,
            &self.paths,
            &self.config,
            self.probe.as_ref(),
            self.control.as_ref(),
        )
    }
}

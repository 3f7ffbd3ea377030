//! # telemetry-core
//!
//! Project/session registry for an agent telemetry installation: which
//! projects are connected, which log-server and dashboard-server processes
//! serve them, and how to repair the registry when several installations
//! have been used on one machine.
//!
//! ## Design Principles
//!
//! - **Synchronous**: No async runtime. Every operation runs to completion.
//! - **Explicit root**: The canonical installation root is resolved once by
//!   the caller and passed in; nothing caches it process-wide.
//! - **Failures as data**: Validation failures, dead PIDs and failed signals
//!   come back in report types. `Err` is reserved for unrecoverable I/O.
//! - **Injectable OS**: Process inspection and service control sit behind
//!   the [`ProcessProbe`] and [`ServiceControl`] traits.
//!
//! ## Components
//!
//! | Module        | Role                                                  |
//! |---------------|-------------------------------------------------------|
//! | [`registry`]  | Pipe-delimited registry file and typed records        |
//! | [`probe`]     | Finding running services and their installation       |
//! | [`sessions`]  | Grouping records into sessions, health, orphans       |
//! | [`migration`] | Legacy 3-field schema to the 8-field schema           |
//! | [`reconcile`] | Registry vs. on-disk configuration vs. processes      |
//! | [`cleanup`]   | Moving orphaned sessions to the canonical root        |

pub mod cleanup;
pub mod config;
pub mod discovery;
pub mod engine;
pub mod error;
pub mod hooks;
pub mod migration;
pub mod patterns;
pub mod probe;
pub mod reconcile;
pub mod registry;
pub mod services;
pub mod sessions;
pub mod storage;
pub mod validation;

pub use cleanup::{CleanupOptions, CleanupReport, OrphanCleanup, PidStop};
pub use config::{load_config, ProjectLayout, ServiceKind, ServiceSpec, TelemetryConfig};
pub use discovery::{discover_configured_projects, DiscoveredProject};
pub use engine::TelemetryEngine;
pub use error::{Result, TelemetryError};
pub use hooks::{render_hook, HookTemplate};
pub use migration::{MigrationEngine, MigrationOutcome};
pub use probe::{ProbeResult, ProcessProbe, ServiceHandle, ServiceInstance, SystemProbe};
pub use reconcile::{plan_reconciliation, ReconcileAction, ReconcileReport, Reconciler};
pub use registry::{
    CorruptLine, PidSet, RecordStatus, Registry, RegistryRecord, RegistryStore, SessionId,
};
pub use services::{
    stop_process, ServiceControl, Signal, SignalResult, StopOutcome, StopPolicy,
    SystemServiceControl,
};
pub use sessions::{
    classify_health, consistency_violations, group_by_session, is_orphaned, orphan_flags,
    ConsistencyViolation, OrphanFlags, Session, SessionHealth, SessionSummary,
};
pub use storage::{resolve_root, StoragePaths};
pub use validation::{validate, InvalidReason, ValidationOutcome};

//! Error types for telemetry-core operations.
//!
//! Only unrecoverable conditions travel through `TelemetryError`. Validation
//! failures, dead PIDs and failed signals are reported as data by the
//! operations that encounter them.

use std::path::PathBuf;

/// All errors that can occur in telemetry-core operations.
#[derive(Debug, thiserror::Error)]
pub enum TelemetryError {
    // ─────────────────────────────────────────────────────────────────────
    // Configuration Errors
    // ─────────────────────────────────────────────────────────────────────
    #[error("Required configuration missing: {0}")]
    ConfigurationMissing(PathBuf),

    #[error("Configuration file malformed: {path}: {details}")]
    ConfigMalformed { path: PathBuf, details: String },

    #[error("Invalid path: {path}: {reason}")]
    InvalidPath { path: PathBuf, reason: String },

    // ─────────────────────────────────────────────────────────────────────
    // Registry Errors
    // ─────────────────────────────────────────────────────────────────────
    #[error("Registry file not found: {0}")]
    RegistryMissing(PathBuf),

    // ─────────────────────────────────────────────────────────────────────
    // Process Errors
    // ─────────────────────────────────────────────────────────────────────
    #[error("Process {pid} did not exit after {waited_secs}s")]
    ProcessUnresponsive { pid: u32, waited_secs: u64 },

    #[error("Command execution failed: {command}: {details}")]
    CommandFailed { command: String, details: String },

    // ─────────────────────────────────────────────────────────────────────
    // Template Errors
    // ─────────────────────────────────────────────────────────────────────
    #[error("Hook template not found: {0}")]
    TemplateMissing(PathBuf),

    // ─────────────────────────────────────────────────────────────────────
    // I/O Errors
    // ─────────────────────────────────────────────────────────────────────
    #[error("I/O error: {context}: {source}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },
}

impl TelemetryError {
    pub fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        TelemetryError::Io {
            context: context.into(),
            source,
        }
    }
}

/// Convenience type alias for Results using TelemetryError.
pub type Result<T> = std::result::Result<T, TelemetryError>;

//! File-backed registry persistence.
//!
//! # File Format
//!
//! ```text
//! # <free-form header comment>
//! # project_path|project_name|connected_date|log_server_pids|dashboard_server_pids|installation_path|session_id|status
//! /abs/path/proj1|proj1|2025-08-17T10:00:00-04:00|12345|12346|/abs/telemetry/root|session_ab12cd34|active
//! ```
//!
//! # Corrupt Lines
//!
//! Lines that do not parse are kept on the in-memory [`Registry`] as
//! [`CorruptLine`]s so callers can report them. When the registry is
//! rewritten they are appended to the quarantine file and dropped from the
//! main file.
//!
//! # Atomic Writes
//!
//! Every write goes through temp file + rename. There is no locking: two
//! concurrent writers race and the last rename wins.

use std::io::Write;
use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use super::record::{
    field_count, is_comment, now_timestamp, CorruptLine, LegacyRecord, RegistryRecord,
    LEGACY_FIELD_COUNT,
};
use crate::error::{Result, TelemetryError};
use crate::storage::{atomic_write, normalize_path, StoragePaths};

pub const DEFAULT_HEADER: &str = "# Agent telemetry connected projects registry";
pub const COLUMN_HEADER: &str = "# project_path|project_name|connected_date|log_server_pids|dashboard_server_pids|installation_path|session_id|status";

/// In-memory registry contents.
///
/// Records are unique by `project_path`; inserting an existing path replaces
/// the earlier record in place.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Registry {
    header: Option<String>,
    records: Vec<RegistryRecord>,
    corrupt: Vec<CorruptLine>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_records(records: impl IntoIterator<Item = RegistryRecord>) -> Self {
        let mut registry = Registry::new();
        for record in records {
            registry.upsert(record);
        }
        registry
    }

    /// Parses file content. Never fails: bad lines become [`CorruptLine`]s.
    pub fn parse(content: &str) -> Self {
        Self::parse_with(content, |_| None)
    }

    /// Like [`Registry::parse`], but offers every 3-field legacy line to
    /// `upgrade`. Lines it declines are reported as corrupt.
    pub fn parse_with(
        content: &str,
        mut upgrade: impl FnMut(LegacyRecord) -> Option<RegistryRecord>,
    ) -> Self {
        let mut registry = Registry::new();

        for (index, line) in content.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            if is_comment(line) {
                // The column header is regenerated on save; only the
                // free-form comment is carried over.
                if registry.header.is_none() && !line.contains('|') {
                    registry.header = Some(line.to_string());
                }
                continue;
            }

            match RegistryRecord::parse(line) {
                Ok(record) => {
                    if let Some(previous) = registry.upsert(record) {
                        debug!(
                            project = %previous.project_path,
                            line = index + 1,
                            "Duplicate registry entry; later line wins"
                        );
                    }
                }
                Err(reason) => {
                    let legacy = (field_count(line) == LEGACY_FIELD_COUNT)
                        .then(|| LegacyRecord::parse(line).ok())
                        .flatten();
                    if let Some(record) = legacy.and_then(&mut upgrade) {
                        registry.upsert(record);
                        continue;
                    }
                    let reason = if field_count(line) == LEGACY_FIELD_COUNT {
                        format!("{} (legacy schema, run migrate)", reason)
                    } else {
                        reason
                    };
                    registry.corrupt.push(CorruptLine {
                        line_number: index + 1,
                        content: line.to_string(),
                        reason,
                    });
                }
            }
        }

        registry
    }

    /// Serializes to file content: header, column header, one line per record.
    pub fn render(&self) -> String {
        let mut out = String::new();
        out.push_str(self.header.as_deref().unwrap_or(DEFAULT_HEADER));
        out.push('\n');
        out.push_str(COLUMN_HEADER);
        out.push('\n');
        for record in &self.records {
            out.push_str(&record.to_line());
            out.push('\n');
        }
        out
    }

    pub fn records(&self) -> &[RegistryRecord] {
        &self.records
    }

    pub fn into_records(self) -> Vec<RegistryRecord> {
        self.records
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn get(&self, project_path: &str) -> Option<&RegistryRecord> {
        let key = normalize_path(project_path);
        self.records.iter().find(|r| r.project_path == key)
    }

    pub fn contains(&self, project_path: &str) -> bool {
        self.get(project_path).is_some()
    }

    /// Inserts or replaces by `project_path`. Returns the replaced record.
    pub fn upsert(&mut self, record: RegistryRecord) -> Option<RegistryRecord> {
        match self
            .records
            .iter_mut()
            .find(|r| r.project_path == record.project_path)
        {
            Some(existing) => Some(std::mem::replace(existing, record)),
            None => {
                self.records.push(record);
                None
            }
        }
    }

    /// Removes by `project_path`. Absent paths are not an error.
    pub fn remove(&mut self, project_path: &str) -> Option<RegistryRecord> {
        let key = normalize_path(project_path);
        let index = self.records.iter().position(|r| r.project_path == key)?;
        Some(self.records.remove(index))
    }

    pub fn corrupt_lines(&self) -> &[CorruptLine] {
        &self.corrupt
    }

    pub fn has_corrupt_lines(&self) -> bool {
        !self.corrupt.is_empty()
    }

    fn take_corrupt_lines(&mut self) -> Vec<CorruptLine> {
        std::mem::take(&mut self.corrupt)
    }
}

/// Reads and writes the registry file.
#[derive(Debug, Clone)]
pub struct RegistryStore {
    path: PathBuf,
    quarantine_path: PathBuf,
}

impl RegistryStore {
    pub fn new(paths: &StoragePaths) -> Self {
        Self {
            path: paths.registry_file(),
            quarantine_path: paths.registry_quarantine_file(),
        }
    }

    /// Store at an explicit location. The quarantine file sits beside it.
    pub fn at(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let mut quarantine = path.clone().into_os_string();
        quarantine.push(".corrupt");
        Self {
            path,
            quarantine_path: PathBuf::from(quarantine),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn quarantine_path(&self) -> &Path {
        &self.quarantine_path
    }

    /// Timestamped copy taken before migration rewrites the registry.
    pub fn backup_path(&self, stamp: &str) -> PathBuf {
        let mut backup = self.path.clone().into_os_string();
        backup.push(format!(".backup.{}", stamp));
        PathBuf::from(backup)
    }

    pub fn exists(&self) -> bool {
        self.path.is_file()
    }

    /// Raw file content. Fails with `RegistryMissing` if the file doesn't exist.
    pub fn read_raw(&self) -> Result<String> {
        match fs_err::read_to_string(&self.path) {
            Ok(content) => Ok(content),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                Err(TelemetryError::RegistryMissing(self.path.clone()))
            }
            Err(err) => Err(TelemetryError::io(
                format!("reading {}", self.path.display()),
                err,
            )),
        }
    }

    /// Loads the registry. Fails with `RegistryMissing` if the file doesn't exist.
    pub fn load(&self) -> Result<Registry> {
        let registry = Registry::parse(&self.read_raw()?);
        for corrupt in registry.corrupt_lines() {
            warn!(
                line = corrupt.line_number,
                reason = %corrupt.reason,
                "Corrupt registry line"
            );
        }
        Ok(registry)
    }

    /// Loads the registry, treating a missing file as no projects connected.
    pub fn load_or_empty(&self) -> Result<Registry> {
        match self.load() {
            Ok(registry) => Ok(registry),
            Err(TelemetryError::RegistryMissing(_)) => Ok(Registry::new()),
            Err(err) => Err(err),
        }
    }

    /// Writes the registry atomically, quarantining any corrupt lines first.
    pub fn save(&self, registry: &mut Registry) -> Result<()> {
        let corrupt = registry.take_corrupt_lines();
        if !corrupt.is_empty() {
            self.quarantine(&corrupt)?;
        }
        atomic_write(&self.path, &registry.render())
    }

    /// Replaces any existing record with the same `project_path`.
    pub fn upsert(&self, record: RegistryRecord) -> Result<()> {
        let mut registry = self.load_or_empty()?;
        registry.upsert(record);
        self.save(&mut registry)
    }

    /// Deletes the record for `project_path`. Returns false if it was absent.
    pub fn remove(&self, project_path: &str) -> Result<bool> {
        let mut registry = match self.load() {
            Ok(registry) => registry,
            Err(TelemetryError::RegistryMissing(_)) => return Ok(false),
            Err(err) => return Err(err),
        };
        if registry.remove(project_path).is_none() {
            return Ok(false);
        }
        self.save(&mut registry)?;
        Ok(true)
    }

    /// Every record; a missing file yields an empty list.
    pub fn all(&self) -> Result<Vec<RegistryRecord>> {
        Ok(self.load_or_empty()?.into_records())
    }

    fn quarantine(&self, lines: &[CorruptLine]) -> Result<()> {
        let stamp = now_timestamp();
        let mut file = fs_err::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.quarantine_path)
            .map_err(|e| TelemetryError::io("opening registry quarantine file", e))?;

        for line in lines {
            warn!(
                line = line.line_number,
                quarantine = %self.quarantine_path.display(),
                "Moving corrupt registry line to quarantine"
            );
            writeln!(file, "# {} line {}: {}", stamp, line.line_number, line.reason)
                .and_then(|_| writeln!(file, "{}", line.content))
                .map_err(|e| TelemetryError::io("writing registry quarantine file", e))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::record::{PidSet, RecordStatus};
    use tempfile::TempDir;

    fn record(path: &str, install: &str) -> RegistryRecord {
        RegistryRecord::new(
            path,
            path.rsplit('/').next().unwrap(),
            "2025-08-17T10:00:00-04:00",
            PidSet::new([100]),
            PidSet::empty(),
            install,
        )
    }

    fn store(temp: &TempDir) -> RegistryStore {
        RegistryStore::new(&StoragePaths::with_root(temp.path()))
    }

    #[test]
    fn load_missing_file_is_registry_missing() {
        let temp = TempDir::new().unwrap();
        let err = store(&temp).load().unwrap_err();
        assert!(matches!(err, TelemetryError::RegistryMissing(_)));
        assert!(store(&temp).load_or_empty().unwrap().is_empty());
        assert!(store(&temp).all().unwrap().is_empty());
    }

    #[test]
    fn upsert_replaces_same_project_path() {
        let temp = TempDir::new().unwrap();
        let store = store(&temp);
        store.upsert(record("/p/one", "/opt/a")).unwrap();
        store.upsert(record("/p/two", "/opt/a")).unwrap();
        store.upsert(record("/p/one/", "/opt/b")).unwrap();

        let all = store.all().unwrap();
        assert_eq!(all.len(), 2);
        let one = all.iter().find(|r| r.project_path == "/p/one").unwrap();
        assert_eq!(one.installation_path, "/opt/b");
    }

    #[test]
    fn remove_is_noop_when_absent() {
        let temp = TempDir::new().unwrap();
        let store = store(&temp);
        assert!(!store.remove("/p/none").unwrap());
        store.upsert(record("/p/one", "/opt/a")).unwrap();
        assert!(!store.remove("/p/none").unwrap());
        assert!(store.remove("/p/one").unwrap());
        assert!(store.all().unwrap().is_empty());
    }

    #[test]
    fn parse_skips_comments_and_collects_corrupt_lines() {
        let content = format!(
            "# my header\n{}\n{}\n/p/legacy|legacy|2025-01-01T00:00:00Z\n\n/p/bad|x\n",
            COLUMN_HEADER,
            record("/p/ok", "/opt/a").to_line()
        );
        let registry = Registry::parse(&content);
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.corrupt_lines().len(), 2);
        assert_eq!(registry.corrupt_lines()[0].line_number, 4);
        assert!(registry.corrupt_lines()[0].reason.contains("legacy"));
        assert_eq!(registry.corrupt_lines()[1].line_number, 6);
    }

    #[test]
    fn parse_with_upgrades_legacy_lines() {
        let content = "# old header\n/p/legacy|legacy|2025-01-01T00:00:00Z\n/p/bad|x\n";
        let registry = Registry::parse_with(content, |legacy| {
            Some(RegistryRecord::new(
                &legacy.project_path,
                &legacy.project_name,
                &legacy.connected_date,
                PidSet::empty(),
                PidSet::empty(),
                "/opt/a",
            ))
        });
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.records()[0].connected_at, "2025-01-01T00:00:00Z");
        assert_eq!(registry.corrupt_lines().len(), 1);
        assert!(registry.render().starts_with("# old header\n"));
    }

    #[test]
    fn duplicate_lines_last_wins() {
        let mut first = record("/p/dup", "/opt/a");
        first.status = RecordStatus::Inactive;
        let second = record("/p/dup", "/opt/b");
        let content = format!("{}\n{}\n", first.to_line(), second.to_line());

        let registry = Registry::parse(&content);
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.records()[0], second);
    }

    #[test]
    fn load_then_save_reproduces_file() {
        let temp = TempDir::new().unwrap();
        let store = store(&temp);
        let content = format!(
            "# Custom header kept verbatim\n{}\n{}\n{}\n",
            COLUMN_HEADER,
            record("/p/one", "/opt/a").to_line(),
            record("/p/two", "/opt/b").to_line()
        );
        fs_err::create_dir_all(store.path().parent().unwrap()).unwrap();
        fs_err::write(store.path(), &content).unwrap();

        let mut registry = store.load().unwrap();
        store.save(&mut registry).unwrap();
        assert_eq!(fs_err::read_to_string(store.path()).unwrap(), content);

        // Upserting every loaded record back is also a no-op.
        for r in store.all().unwrap() {
            store.upsert(r).unwrap();
        }
        assert_eq!(fs_err::read_to_string(store.path()).unwrap(), content);
    }

    #[test]
    fn save_quarantines_corrupt_lines() {
        let temp = TempDir::new().unwrap();
        let store = store(&temp);
        let content = format!(
            "{}\n{}\n/p/bad|only|four|fields\n",
            DEFAULT_HEADER,
            record("/p/ok", "/opt/a").to_line()
        );
        fs_err::create_dir_all(store.path().parent().unwrap()).unwrap();
        fs_err::write(store.path(), &content).unwrap();

        let mut registry = store.load().unwrap();
        assert!(registry.has_corrupt_lines());
        store.save(&mut registry).unwrap();

        let rewritten = fs_err::read_to_string(store.path()).unwrap();
        assert!(!rewritten.contains("/p/bad"));
        let quarantined = fs_err::read_to_string(store.quarantine_path()).unwrap();
        assert!(quarantined.contains("/p/bad|only|four|fields"));
        assert!(store.load().unwrap().corrupt_lines().is_empty());
    }

    #[test]
    fn store_at_places_quarantine_beside_file() {
        let store = RegistryStore::at("/x/registry.txt");
        assert_eq!(store.quarantine_path(), Path::new("/x/registry.txt.corrupt"));
        assert_eq!(
            store.backup_path("20250101_000000"),
            Path::new("/x/registry.txt.backup.20250101_000000")
        );
    }
}

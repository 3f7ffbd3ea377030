//! Typed registry rows and their pipe-delimited encoding.
//!
//! ```text
//! project_path|project_name|connected_date|log_server_pids|dashboard_server_pids|installation_path|session_id|status
//! ```
//!
//! Lines are split into fields at the boundary and validated immediately.
//! A line with the wrong field count or an unparseable field is a
//! [`CorruptLine`], never a half-filled record.

use serde::Serialize;
use std::fmt;
use std::str::FromStr;

use crate::patterns::{RE_PID, RE_SESSION_ID};
use crate::storage::normalize_path;

pub const FIELD_SEPARATOR: char = '|';
pub const ENHANCED_FIELD_COUNT: usize = 8;
pub const LEGACY_FIELD_COUNT: usize = 3;
/// A data line with fewer fields than this is still in the legacy schema.
pub const MIGRATED_MIN_FIELDS: usize = 7;

const NO_PIDS: &str = "none";

// ─────────────────────────────────────────────────────────────────────────────
// PidSet
// ─────────────────────────────────────────────────────────────────────────────

/// Space-separated PID list; `none` or empty on disk means no PIDs.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize)]
#[serde(transparent)]
pub struct PidSet(Vec<u32>);

impl PidSet {
    pub fn new(pids: impl IntoIterator<Item = u32>) -> Self {
        let mut set = PidSet::default();
        for pid in pids {
            set.insert(pid);
        }
        set
    }

    pub fn empty() -> Self {
        PidSet::default()
    }

    pub fn insert(&mut self, pid: u32) {
        if !self.0.contains(&pid) {
            self.0.push(pid);
        }
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = u32> + '_ {
        self.0.iter().copied()
    }

    pub fn contains(&self, pid: u32) -> bool {
        self.0.contains(&pid)
    }
}

impl fmt::Display for PidSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0.is_empty() {
            return f.write_str(NO_PIDS);
        }
        let joined = self
            .0
            .iter()
            .map(|pid| pid.to_string())
            .collect::<Vec<_>>()
            .join(" ");
        f.write_str(&joined)
    }
}

impl FromStr for PidSet {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let trimmed = value.trim();
        if trimmed.is_empty() || trimmed == NO_PIDS {
            return Ok(PidSet::empty());
        }
        let mut set = PidSet::empty();
        for token in trimmed.split_whitespace() {
            if !RE_PID.is_match(token) {
                return Err(format!("invalid pid '{}'", token));
            }
            let pid = token
                .parse::<u32>()
                .map_err(|_| format!("invalid pid '{}'", token))?;
            set.insert(pid);
        }
        Ok(set)
    }
}

impl FromIterator<u32> for PidSet {
    fn from_iter<I: IntoIterator<Item = u32>>(iter: I) -> Self {
        PidSet::new(iter)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// SessionId
// ─────────────────────────────────────────────────────────────────────────────

/// `session_` + the first 8 hex chars of the MD5 of the normalized
/// installation path.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct SessionId(String);

impl SessionId {
    pub fn for_installation(installation_path: &str) -> Self {
        let normalized = normalize_path(installation_path);
        let digest = format!("{:x}", md5::compute(normalized.as_bytes()));
        SessionId(format!("session_{}", &digest[..8]))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// True if this id is the one `installation_path` hashes to.
    pub fn matches_installation(&self, installation_path: &str) -> bool {
        *self == SessionId::for_installation(installation_path)
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for SessionId {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let trimmed = value.trim();
        if RE_SESSION_ID.is_match(trimmed) {
            Ok(SessionId(trimmed.to_string()))
        } else {
            Err(format!("invalid session id '{}'", trimmed))
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// RecordStatus
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RecordStatus {
    Active,
    Inactive,
}

impl RecordStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            RecordStatus::Active => "active",
            RecordStatus::Inactive => "inactive",
        }
    }
}

impl fmt::Display for RecordStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RecordStatus {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim() {
            "active" => Ok(RecordStatus::Active),
            "inactive" => Ok(RecordStatus::Inactive),
            other => Err(format!("unknown status '{}'", other)),
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Records
// ─────────────────────────────────────────────────────────────────────────────

/// One project's connection to telemetry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RegistryRecord {
    pub project_path: String,
    pub project_name: String,
    /// Kept verbatim from first connection; never regenerated.
    pub connected_at: String,
    pub log_server_pids: PidSet,
    pub dashboard_server_pids: PidSet,
    pub installation_path: String,
    pub session_id: SessionId,
    pub status: RecordStatus,
}

impl RegistryRecord {
    /// Builds an active record whose session id is derived from `installation_path`.
    pub fn new(
        project_path: &str,
        project_name: &str,
        connected_at: &str,
        log_server_pids: PidSet,
        dashboard_server_pids: PidSet,
        installation_path: &str,
    ) -> Self {
        let installation_path = normalize_path(installation_path);
        Self {
            project_path: normalize_path(project_path),
            project_name: project_name.to_string(),
            connected_at: connected_at.to_string(),
            log_server_pids,
            dashboard_server_pids,
            session_id: SessionId::for_installation(&installation_path),
            installation_path,
            status: RecordStatus::Active,
        }
    }

    /// Parses an 8-field data line.
    pub fn parse(line: &str) -> Result<Self, String> {
        let fields: Vec<&str> = line.split(FIELD_SEPARATOR).collect();
        if fields.len() != ENHANCED_FIELD_COUNT {
            return Err(format!(
                "expected {} fields, found {}",
                ENHANCED_FIELD_COUNT,
                fields.len()
            ));
        }
        let project_path = fields[0].trim();
        if !project_path.starts_with('/') {
            return Err(format!("project path '{}' is not absolute", project_path));
        }
        let installation_path = fields[5].trim();
        if installation_path.is_empty() {
            return Err("installation path is empty".to_string());
        }

        Ok(Self {
            project_path: normalize_path(project_path),
            project_name: fields[1].to_string(),
            connected_at: fields[2].to_string(),
            log_server_pids: fields[3].parse()?,
            dashboard_server_pids: fields[4].parse()?,
            installation_path: normalize_path(installation_path),
            session_id: fields[6].parse()?,
            status: fields[7].parse()?,
        })
    }

    pub fn to_line(&self) -> String {
        [
            self.project_path.clone(),
            self.project_name.clone(),
            self.connected_at.clone(),
            self.log_server_pids.to_string(),
            self.dashboard_server_pids.to_string(),
            self.installation_path.clone(),
            self.session_id.to_string(),
            self.status.to_string(),
        ]
        .join("|")
    }

    /// Points the record at `installation_path` and regenerates its session id.
    pub fn assign_installation(&mut self, installation_path: &str) {
        self.installation_path = normalize_path(installation_path);
        self.session_id = SessionId::for_installation(&self.installation_path);
    }

    /// True if the stored session id is the hash of the stored installation path.
    pub fn session_id_consistent(&self) -> bool {
        self.session_id.matches_installation(&self.installation_path)
    }
}

/// Timestamp format used for `connected_at` on new records.
pub fn now_timestamp() -> String {
    chrono::Local::now().to_rfc3339_opts(chrono::SecondsFormat::Secs, false)
}

/// A row in the pre-session 3-field schema.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LegacyRecord {
    pub project_path: String,
    pub project_name: String,
    pub connected_date: String,
}

impl LegacyRecord {
    pub fn parse(line: &str) -> Result<Self, String> {
        let fields: Vec<&str> = line.split(FIELD_SEPARATOR).collect();
        if fields.len() != LEGACY_FIELD_COUNT {
            return Err(format!(
                "expected {} legacy fields, found {}",
                LEGACY_FIELD_COUNT,
                fields.len()
            ));
        }
        let project_path = fields[0].trim();
        if !project_path.starts_with('/') {
            return Err(format!("project path '{}' is not absolute", project_path));
        }
        Ok(Self {
            project_path: normalize_path(project_path),
            project_name: fields[1].to_string(),
            connected_date: fields[2].to_string(),
        })
    }
}

/// A data line that could not be parsed into a record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CorruptLine {
    /// 1-based line number in the registry file.
    pub line_number: usize,
    pub content: String,
    pub reason: String,
}

/// Returns true for header/comment lines, which are never parsed as data.
pub fn is_comment(line: &str) -> bool {
    line.trim_start().starts_with('#')
}

/// Number of `|`-separated fields in a data line.
pub fn field_count(line: &str) -> usize {
    line.split(FIELD_SEPARATOR).count()
}

#[cfg(test)]
mod tests {
    use super::*;

    const LINE: &str = "/abs/path/proj1|proj1|2025-08-17T10:00:00-04:00|12345|12346|/abs/telemetry/root|session_ab12cd34|active";

    #[test]
    fn parses_enhanced_line() {
        let record = RegistryRecord::parse(LINE).unwrap();
        assert_eq!(record.project_path, "/abs/path/proj1");
        assert_eq!(record.project_name, "proj1");
        assert_eq!(record.connected_at, "2025-08-17T10:00:00-04:00");
        assert_eq!(record.log_server_pids, PidSet::new([12345]));
        assert_eq!(record.dashboard_server_pids, PidSet::new([12346]));
        assert_eq!(record.installation_path, "/abs/telemetry/root");
        assert_eq!(record.session_id.as_str(), "session_ab12cd34");
        assert_eq!(record.status, RecordStatus::Active);
    }

    #[test]
    fn line_encoding_is_stable() {
        let record = RegistryRecord::parse(LINE).unwrap();
        assert_eq!(record.to_line(), LINE);
    }

    #[test]
    fn wrong_field_count_is_rejected() {
        let err = RegistryRecord::parse("/p|name|2025-01-01T00:00:00Z").unwrap_err();
        assert!(err.contains("expected 8 fields"));
    }

    #[test]
    fn pipe_in_project_name_shifts_fields_and_is_rejected() {
        let line = "/p|my|name|2025|none|none|/root|session_ab12cd34|active";
        assert!(RegistryRecord::parse(line).is_err());
    }

    #[test]
    fn bad_status_is_rejected() {
        let line = LINE.replace("|active", "|zombie");
        assert!(RegistryRecord::parse(&line)
            .unwrap_err()
            .contains("unknown status"));
    }

    #[test]
    fn pid_set_accepts_none_and_empty() {
        assert!("none".parse::<PidSet>().unwrap().is_empty());
        assert!("".parse::<PidSet>().unwrap().is_empty());
        let pids: PidSet = "10 20 10".parse().unwrap();
        assert_eq!(pids.len(), 2);
        assert_eq!(pids.to_string(), "10 20");
        assert_eq!(PidSet::empty().to_string(), "none");
        assert!("12a".parse::<PidSet>().is_err());
        assert!("0".parse::<PidSet>().is_err());
    }

    #[test]
    fn session_id_is_deterministic_and_shaped() {
        let a = SessionId::for_installation("/opt/telemetry");
        let b = SessionId::for_installation("/opt/telemetry/");
        let c = SessionId::for_installation("/tmp/test-telemetry");
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert!(RE_SESSION_ID.is_match(a.as_str()));
        assert_eq!(
            a,
            format!(
                "session_{}",
                &format!("{:x}", md5::compute("/opt/telemetry"))[..8]
            )
            .parse()
            .unwrap()
        );
    }

    #[test]
    fn assign_installation_regenerates_session() {
        let mut record = RegistryRecord::parse(LINE).unwrap();
        assert!(!record.session_id_consistent());
        record.assign_installation("/opt/telemetry");
        assert_eq!(record.installation_path, "/opt/telemetry");
        assert!(record.session_id_consistent());
    }

    #[test]
    fn legacy_line_parses() {
        let legacy = LegacyRecord::parse("/p|name|2025-01-01T00:00:00Z").unwrap();
        assert_eq!(legacy.project_path, "/p");
        assert_eq!(legacy.project_name, "name");
        assert_eq!(legacy.connected_date, "2025-01-01T00:00:00Z");
    }

    #[test]
    fn comments_are_detected() {
        assert!(is_comment("# header"));
        assert!(is_comment("  # indented"));
        assert!(!is_comment("/p|name|date"));
        assert_eq!(field_count(LINE), 8);
    }
}

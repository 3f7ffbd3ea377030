//! Session grouping and health classification.
//!
//! A session is every registry record that shares one `session_id`, which
//! is the hash of the installation serving those projects. Sessions are
//! never persisted; they are derived from the registry at read time.
//!
//! All functions here are pure: liveness comes in through a closure or a
//! [`ProbeResult`], so the state machine is testable without real
//! processes.

use serde::Serialize;
use std::collections::BTreeMap;

use crate::config::ServiceKind;
use crate::patterns::{RE_TEMP_PATH, RE_TEST_FIXTURE_PATH};
use crate::probe::ProbeResult;
use crate::registry::{PidSet, RecordStatus, RegistryRecord, SessionId};
use crate::storage::normalize_path;

/// Health of one session's pair of services.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SessionHealth {
    /// Both services alive, running from the canonical root.
    Healthy,
    /// One service alive, or both alive but orphaned/inconsistent.
    Degraded,
    /// Neither service alive.
    Failed,
}

impl SessionHealth {
    pub fn as_str(self) -> &'static str {
        match self {
            SessionHealth::Healthy => "HEALTHY",
            SessionHealth::Degraded => "DEGRADED",
            SessionHealth::Failed => "FAILED",
        }
    }
}

/// Why an installation path counts as orphaned. Kept as separate signals;
/// any one of them makes the path orphaned.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct OrphanFlags {
    pub non_canonical: bool,
    pub temp_dir: bool,
    pub test_fixture: bool,
}

impl OrphanFlags {
    pub fn is_orphaned(&self) -> bool {
        self.non_canonical || self.temp_dir || self.test_fixture
    }

    /// Orphans that look disposable (temp or test installs).
    pub fn is_disposable(&self) -> bool {
        self.temp_dir || self.test_fixture
    }

    pub fn describe(&self) -> Vec<&'static str> {
        let mut reasons = Vec::new();
        if self.non_canonical {
            reasons.push("non_canonical");
        }
        if self.temp_dir {
            reasons.push("temp_dir");
        }
        if self.test_fixture {
            reasons.push("test_fixture");
        }
        reasons
    }
}

/// Computes each orphan signal for `installation_path` separately.
///
/// The canonical root itself is never orphaned, even when it lives under a
/// temp directory.
pub fn orphan_flags(installation_path: &str, canonical_root: &str) -> OrphanFlags {
    let path = normalize_path(installation_path);
    let canonical = normalize_path(canonical_root);
    if path == canonical {
        return OrphanFlags::default();
    }

    let system_temp = normalize_path(&std::env::temp_dir().to_string_lossy());
    let under_system_temp =
        system_temp != "/" && (path == system_temp || path.starts_with(&format!("{}/", system_temp)));

    OrphanFlags {
        non_canonical: true,
        temp_dir: RE_TEMP_PATH.is_match(&path) || under_system_temp,
        test_fixture: RE_TEST_FIXTURE_PATH.is_match(&path),
    }
}

/// True if the path is anything other than the single canonical root, or
/// looks like a temp/test install.
pub fn is_orphaned(installation_path: &str, canonical_root: &str) -> bool {
    orphan_flags(installation_path, canonical_root).is_orphaned()
}

/// All registry records sharing one `session_id`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Session {
    pub id: SessionId,
    pub installation_path: String,
    pub log_server_pids: PidSet,
    pub dashboard_server_pids: PidSet,
    pub members: Vec<RegistryRecord>,
    /// Members disagree on installation path, or the id isn't the path's hash.
    pub inconsistent: bool,
}

impl Session {
    fn from_members(id: SessionId, members: Vec<RegistryRecord>) -> Self {
        let first = &members[0];
        let installation_path = first.installation_path.clone();

        // Any member with PIDs describes the same service instances.
        let log_server_pids = members
            .iter()
            .map(|m| &m.log_server_pids)
            .find(|p| !p.is_empty())
            .cloned()
            .unwrap_or_default();
        let dashboard_server_pids = members
            .iter()
            .map(|m| &m.dashboard_server_pids)
            .find(|p| !p.is_empty())
            .cloned()
            .unwrap_or_default();

        let inconsistent = members
            .iter()
            .any(|m| m.installation_path != installation_path)
            || !id.matches_installation(&installation_path);

        Self {
            id,
            installation_path,
            log_server_pids,
            dashboard_server_pids,
            members,
            inconsistent,
        }
    }

    pub fn orphan_flags(&self, canonical_root: &str) -> OrphanFlags {
        orphan_flags(&self.installation_path, canonical_root)
    }

    pub fn is_orphaned(&self, canonical_root: &str) -> bool {
        self.orphan_flags(canonical_root).is_orphaned()
    }
}

/// Partitions records by `session_id`, one session per distinct id, sorted by id.
pub fn group_by_session(records: &[RegistryRecord]) -> Vec<Session> {
    let mut groups: BTreeMap<SessionId, Vec<RegistryRecord>> = BTreeMap::new();
    for record in records {
        groups
            .entry(record.session_id.clone())
            .or_default()
            .push(record.clone());
    }
    groups
        .into_iter()
        .map(|(id, members)| Session::from_members(id, members))
        .collect()
}

/// The state machine, independent of how liveness was measured.
pub fn health_from(log_alive: bool, dashboard_alive: bool, flagged: bool) -> SessionHealth {
    match (log_alive, dashboard_alive) {
        (false, false) => SessionHealth::Failed,
        (true, true) if !flagged => SessionHealth::Healthy,
        _ => SessionHealth::Degraded,
    }
}

/// Classifies with an injected liveness check.
///
/// A service is alive when every stored PID is alive *as that service*;
/// an empty set is dead.
pub fn classify_health_with(
    session: &Session,
    canonical_root: &str,
    is_alive: impl Fn(ServiceKind, u32) -> bool,
) -> SessionHealth {
    let set_alive = |kind: ServiceKind, pids: &PidSet| {
        !pids.is_empty() && pids.iter().all(|pid| is_alive(kind, pid))
    };
    let flagged = session.is_orphaned(canonical_root) || session.inconsistent;
    health_from(
        set_alive(ServiceKind::LogServer, &session.log_server_pids),
        set_alive(ServiceKind::DashboardServer, &session.dashboard_server_pids),
        flagged,
    )
}

/// Classifies against one probe of the process table. A stored PID only
/// counts if the probe saw it running the right service from the session's
/// installation, so a reused PID reads as dead.
pub fn classify_health(
    session: &Session,
    canonical_root: &str,
    probe: &ProbeResult,
) -> SessionHealth {
    classify_health_with(session, canonical_root, |kind, pid| {
        probe.service(kind).serves(pid, &session.installation_path)
    })
}

/// A broken link between installation paths and session ids.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ConsistencyViolation {
    /// Records on one installation carry different session ids.
    SplitInstallation {
        installation_path: String,
        session_ids: Vec<SessionId>,
    },
    /// One session id is shared by different installation paths.
    SharedSessionId {
        session_id: SessionId,
        installation_paths: Vec<String>,
    },
    /// The stored id is not the hash of the record's installation path.
    StaleSessionId {
        project_path: String,
        session_id: SessionId,
        expected: SessionId,
    },
}

/// Checks `installation_path == installation_path ⇔ session_id == session_id`
/// across all record pairs, plus id-is-hash-of-path per record.
pub fn consistency_violations(records: &[RegistryRecord]) -> Vec<ConsistencyViolation> {
    let mut by_path: BTreeMap<&str, Vec<SessionId>> = BTreeMap::new();
    let mut by_id: BTreeMap<&SessionId, Vec<String>> = BTreeMap::new();
    let mut violations = Vec::new();

    for record in records {
        let ids = by_path.entry(record.installation_path.as_str()).or_default();
        if !ids.contains(&record.session_id) {
            ids.push(record.session_id.clone());
        }
        let paths = by_id.entry(&record.session_id).or_default();
        if !paths.contains(&record.installation_path) {
            paths.push(record.installation_path.clone());
        }
    }

    for (path, ids) in by_path {
        if ids.len() > 1 {
            violations.push(ConsistencyViolation::SplitInstallation {
                installation_path: path.to_string(),
                session_ids: ids,
            });
        }
    }
    for (id, paths) in by_id {
        if paths.len() > 1 {
            violations.push(ConsistencyViolation::SharedSessionId {
                session_id: id.clone(),
                installation_paths: paths,
            });
        }
    }
    for record in records {
        if !record.session_id_consistent() {
            violations.push(ConsistencyViolation::StaleSessionId {
                project_path: record.project_path.clone(),
                session_id: record.session_id.clone(),
                expected: SessionId::for_installation(&record.installation_path),
            });
        }
    }

    violations
}

/// Display/JSON view of one session.
#[derive(Debug, Clone, Serialize)]
pub struct SessionSummary {
    pub session_id: SessionId,
    pub installation_path: String,
    pub health: SessionHealth,
    pub orphaned: bool,
    pub orphan_reasons: Vec<&'static str>,
    pub inconsistent: bool,
    pub log_server_pids: PidSet,
    pub dashboard_server_pids: PidSet,
    pub projects: Vec<SessionMember>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SessionMember {
    pub project_path: String,
    pub project_name: String,
    pub connected_at: String,
    pub status: RecordStatus,
}

impl SessionSummary {
    pub fn build(session: &Session, canonical_root: &str, probe: &ProbeResult) -> Self {
        let flags = session.orphan_flags(canonical_root);
        Self {
            session_id: session.id.clone(),
            installation_path: session.installation_path.clone(),
            health: classify_health(session, canonical_root, probe),
            orphaned: flags.is_orphaned(),
            orphan_reasons: flags.describe(),
            inconsistent: session.inconsistent,
            log_server_pids: session.log_server_pids.clone(),
            dashboard_server_pids: session.dashboard_server_pids.clone(),
            projects: session
                .members
                .iter()
                .map(|m| SessionMember {
                    project_path: m.project_path.clone(),
                    project_name: m.project_name.clone(),
                    connected_at: m.connected_at.clone(),
                    status: m.status,
                })
                .collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const CANONICAL: &str = "/opt/agent-telemetry";

    fn record(path: &str, install: &str, log: &[u32], dash: &[u32]) -> RegistryRecord {
        RegistryRecord::new(
            path,
            "p",
            "2025-01-01T00:00:00Z",
            PidSet::new(log.iter().copied()),
            PidSet::new(dash.iter().copied()),
            install,
        )
    }

    fn single(install: &str, log: &[u32], dash: &[u32]) -> Session {
        group_by_session(&[record("/p/a", install, log, dash)])
            .into_iter()
            .next()
            .unwrap()
    }

    #[test]
    fn groups_records_sharing_installation() {
        let records = vec![
            record("/p/a", CANONICAL, &[1], &[2]),
            record("/p/b", CANONICAL, &[], &[]),
            record("/p/c", "/tmp/test-telemetry", &[3], &[4]),
        ];
        let sessions = group_by_session(&records);
        assert_eq!(sessions.len(), 2);
        let canonical = sessions
            .iter()
            .find(|s| s.installation_path == CANONICAL)
            .unwrap();
        assert_eq!(canonical.members.len(), 2);
        assert_eq!(canonical.log_server_pids, PidSet::new([1]));
        assert!(!canonical.inconsistent);
    }

    #[test]
    fn both_empty_is_failed() {
        let session = single(CANONICAL, &[], &[]);
        assert_eq!(
            classify_health_with(&session, CANONICAL, |_, _| true),
            SessionHealth::Failed
        );
    }

    #[test]
    fn one_alive_is_degraded() {
        let session = single(CANONICAL, &[10], &[]);
        assert_eq!(
            classify_health_with(&session, CANONICAL, |_, _| true),
            SessionHealth::Degraded
        );
        let session = single(CANONICAL, &[10], &[20]);
        assert_eq!(
            classify_health_with(&session, CANONICAL, |_, pid| pid == 20),
            SessionHealth::Degraded
        );
    }

    #[test]
    fn both_alive_canonical_is_healthy() {
        let session = single(CANONICAL, &[10], &[20]);
        assert_eq!(
            classify_health_with(&session, CANONICAL, |_, _| true),
            SessionHealth::Healthy
        );
    }

    #[test]
    fn both_alive_orphaned_is_degraded() {
        let session = single("/tmp/test-telemetry", &[10], &[20]);
        assert_eq!(
            classify_health_with(&session, CANONICAL, |_, _| true),
            SessionHealth::Degraded
        );
    }

    #[test]
    fn partially_dead_pid_set_is_not_alive() {
        let session = single(CANONICAL, &[10, 11], &[20]);
        assert_eq!(
            classify_health_with(&session, CANONICAL, |_, pid| pid != 11),
            SessionHealth::Degraded
        );
    }

    #[test]
    fn orphan_detection_signals() {
        let temp = orphan_flags("/tmp/test-telemetry", CANONICAL);
        assert!(temp.is_orphaned());
        assert!(temp.non_canonical && temp.temp_dir && temp.test_fixture);
        assert!(temp.is_disposable());

        let canonical = orphan_flags("/opt/agent-telemetry/", CANONICAL);
        assert!(!canonical.is_orphaned());
        assert!(!is_orphaned(CANONICAL, CANONICAL));
        assert!(!is_orphaned("/tmp/test-root", "/tmp/test-root/"));

        let other = orphan_flags("/home/me/old-telemetry", CANONICAL);
        assert!(other.is_orphaned());
        assert!(!other.is_disposable());
        assert_eq!(other.describe(), vec!["non_canonical"]);

        assert!(orphan_flags("/home/me/work/tests/telemetry", CANONICAL).test_fixture);
        assert!(!orphan_flags("/home/me/latest/telemetry", CANONICAL).test_fixture);
        assert!(orphan_flags("/var/folders/xy/T/t", CANONICAL).temp_dir);
    }

    #[test]
    fn consistency_holds_for_derived_ids() {
        let records = vec![
            record("/p/a", CANONICAL, &[], &[]),
            record("/p/b", CANONICAL, &[], &[]),
            record("/p/c", "/other", &[], &[]),
        ];
        assert!(consistency_violations(&records).is_empty());
    }

    #[test]
    fn consistency_detects_split_and_shared_ids() {
        let mut b = record("/p/b", CANONICAL, &[], &[]);
        b.session_id = SessionId::for_installation("/other");
        let records = vec![
            record("/p/a", CANONICAL, &[], &[]),
            b,
            record("/p/c", "/other", &[], &[]),
        ];
        let violations = consistency_violations(&records);
        assert!(violations
            .iter()
            .any(|v| matches!(v, ConsistencyViolation::SplitInstallation { .. })));
        assert!(violations
            .iter()
            .any(|v| matches!(v, ConsistencyViolation::SharedSessionId { .. })));
        assert!(violations.iter().any(|v| matches!(
            v,
            ConsistencyViolation::StaleSessionId { project_path, .. } if project_path == "/p/b"
        )));

        let sessions = group_by_session(&records);
        assert!(sessions.iter().any(|s| s.inconsistent));
    }

    #[test]
    fn reused_pid_is_not_a_live_service() {
        let session = single(CANONICAL, &[10], &[20]);
        let mut probe = ProbeResult::empty();
        probe.log_server.record(10, Some(CANONICAL.to_string()));
        probe.dashboard_server.record(20, Some(CANONICAL.to_string()));
        assert_eq!(classify_health(&session, CANONICAL, &probe), SessionHealth::Healthy);

        // PID 20 is alive but now belongs to some other program.
        let mut reused = ProbeResult::empty();
        reused.log_server.record(10, Some(CANONICAL.to_string()));
        assert_eq!(classify_health(&session, CANONICAL, &reused), SessionHealth::Degraded);

        // Right service, wrong installation.
        let mut elsewhere = ProbeResult::empty();
        elsewhere.log_server.record(10, Some("/srv/other".to_string()));
        elsewhere.dashboard_server.record(20, Some("/srv/other".to_string()));
        assert_eq!(classify_health(&session, CANONICAL, &elsewhere), SessionHealth::Failed);
    }

    #[test]
    fn summary_serializes_for_json_output() {
        let mut probe = ProbeResult::empty();
        probe.log_server.record(10, Some("/tmp/test-telemetry".to_string()));

        let session = single("/tmp/test-telemetry", &[10], &[]);
        let summary = SessionSummary::build(&session, CANONICAL, &probe);
        let json = serde_json::to_value(&summary).unwrap();
        assert_eq!(json["health"], "DEGRADED");
        assert_eq!(json["orphaned"], true);
        assert_eq!(json["log_server_pids"], serde_json::json!([10]));
        assert_eq!(json["projects"][0]["status"], "active");
        assert_eq!(
            json["orphan_reasons"],
            serde_json::json!(["non_canonical", "temp_dir", "test_fixture"])
        );
    }
}

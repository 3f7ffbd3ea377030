//! Process table inspection for the two managed services.
//!
//! The probe answers one question: which processes currently run the log
//! server and the dashboard server, and from which installation?
//!
//! # Installation Inference
//!
//! Each service is launched with a config-file argument that lives two
//! levels below the installation root:
//!
//! ```text
//! loki -config.file=/opt/telemetry/config/loki/loki-config.yaml
//!                   └─ root ─────┘
//! ```
//!
//! The root is the grandparent of the config file's directory. Relative
//! config paths are resolved against the process cwd when it is known.
//!
//! # Races
//!
//! A process can exit between listing and signalling. A PID that no longer
//! exists is always treated as "not running", never as an error.

use serde::Serialize;
use std::path::{Path, PathBuf};
use sysinfo::{ProcessRefreshKind, System, UpdateKind};
use tracing::{debug, warn};

use crate::config::{ServiceKind, ServiceSpec, TelemetryConfig};
use crate::registry::PidSet;
use crate::storage::normalize_path;

/// What the rest of the crate needs from the OS process table.
pub trait ProcessProbe {
    fn detect_running_services(&self) -> ProbeResult;

    /// Zero-cost existence check (signal 0). Says nothing about what the
    /// PID runs; use [`ServiceHandle::serves`] for identity.
    fn is_alive(&self, pid: u32) -> bool;
}

/// One row of the process table, reduced to what matching needs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessSnapshot {
    pub pid: u32,
    pub name: String,
    pub cmd: Vec<String>,
    pub cwd: Option<PathBuf>,
}

/// One matched process and the installation it was launched from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ServiceInstance {
    pub pid: u32,
    pub installation_path: Option<String>,
}

/// Processes found for one service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ServiceHandle {
    pub kind: ServiceKind,
    pub pids: PidSet,
    /// Installation of the first matching process (lowest PID).
    pub installation_path: Option<String>,
    /// Every distinct installation seen, in PID order.
    pub candidates: Vec<String>,
    pub instances: Vec<ServiceInstance>,
}

impl ServiceHandle {
    pub fn not_running(kind: ServiceKind) -> Self {
        Self {
            kind,
            pids: PidSet::empty(),
            installation_path: None,
            candidates: Vec::new(),
            instances: Vec::new(),
        }
    }

    /// Adds one matched process. The first installation seen becomes the
    /// handle's attribution.
    pub fn record(&mut self, pid: u32, installation: Option<String>) {
        self.pids.insert(pid);
        if let Some(path) = &installation {
            if self.installation_path.is_none() {
                self.installation_path = Some(path.clone());
            }
            if !self.candidates.contains(path) {
                self.candidates.push(path.clone());
            }
        }
        self.instances.push(ServiceInstance {
            pid,
            installation_path: installation,
        });
    }

    /// True if `pid` is one of this service's processes and was launched
    /// from `installation_path`. A PID reused by an unrelated process, or
    /// whose installation can't be located, doesn't serve.
    pub fn serves(&self, pid: u32, installation_path: &str) -> bool {
        let wanted = normalize_path(installation_path);
        self.instances
            .iter()
            .any(|i| i.pid == pid && i.installation_path.as_deref() == Some(wanted.as_str()))
    }

    pub fn is_running(&self) -> bool {
        !self.pids.is_empty()
    }

    /// More than one installation runs this service; attribution used the first.
    pub fn is_ambiguous(&self) -> bool {
        self.candidates.len() > 1
    }

    /// True if some instance runs from `installation_path`.
    pub fn runs_from(&self, installation_path: &str) -> bool {
        let wanted = normalize_path(installation_path);
        self.candidates.iter().any(|c| *c == wanted)
    }
}

/// Result of one probe of both services.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProbeResult {
    pub log_server: ServiceHandle,
    pub dashboard_server: ServiceHandle,
}

impl ProbeResult {
    pub fn empty() -> Self {
        Self {
            log_server: ServiceHandle::not_running(ServiceKind::LogServer),
            dashboard_server: ServiceHandle::not_running(ServiceKind::DashboardServer),
        }
    }

    pub fn service(&self, kind: ServiceKind) -> &ServiceHandle {
        match kind {
            ServiceKind::LogServer => &self.log_server,
            ServiceKind::DashboardServer => &self.dashboard_server,
        }
    }

    /// Best-effort installation: the log server's, else the dashboard's.
    pub fn installation_path(&self) -> Option<&str> {
        self.log_server
            .installation_path
            .as_deref()
            .or(self.dashboard_server.installation_path.as_deref())
    }

    /// The probed installation, or `fallback` when nothing is running.
    pub fn installation_or(&self, fallback: &str) -> String {
        self.installation_path()
            .map(str::to_string)
            .unwrap_or_else(|| normalize_path(fallback))
    }

    /// Every distinct installation seen across both services.
    pub fn candidate_installations(&self) -> Vec<String> {
        let mut all: Vec<String> = Vec::new();
        for candidate in self
            .log_server
            .candidates
            .iter()
            .chain(self.dashboard_server.candidates.iter())
        {
            if !all.contains(candidate) {
                all.push(candidate.clone());
            }
        }
        all
    }

    /// True when the probe saw more than one installation, so first-match
    /// attribution may be wrong.
    pub fn is_ambiguous(&self) -> bool {
        self.candidate_installations().len() > 1
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Command-Line Matching
// ─────────────────────────────────────────────────────────────────────────────

/// Matches a process name against a service's pattern.
///
/// Invalid regexes fall back to substring matching.
#[derive(Debug, Clone)]
pub enum NameMatcher {
    Regex(regex::Regex),
    Literal(String),
}

impl NameMatcher {
    pub fn new(pattern: &str) -> Self {
        match regex::Regex::new(pattern) {
            Ok(re) => NameMatcher::Regex(re),
            Err(err) => {
                warn!(pattern, error = %err, "Invalid process pattern; using substring match");
                NameMatcher::Literal(pattern.to_string())
            }
        }
    }

    pub fn is_match(&self, value: &str) -> bool {
        match self {
            NameMatcher::Regex(re) => re.is_match(value),
            NameMatcher::Literal(needle) => value.contains(needle.as_str()),
        }
    }
}

/// Extracts the value of `flag` from `args` (`-flag=value`, `--flag=value`,
/// or `-flag value`). Leading dashes are not significant.
pub fn config_argument(args: &[String], flag: &str) -> Option<String> {
    let key = flag.trim_start_matches('-');
    let prefixed = format!("{}=", key);
    let mut iter = args.iter();
    while let Some(arg) = iter.next() {
        if !arg.starts_with('-') {
            continue;
        }
        let stripped = arg.trim_start_matches('-');
        if stripped == key {
            return iter.next().cloned();
        }
        if let Some(value) = stripped.strip_prefix(&prefixed) {
            return Some(value.to_string());
        }
    }
    None
}

/// Installation root for a config file at `<root>/config/<service>/<file>`.
pub fn installation_from_config(config_path: &Path) -> Option<String> {
    let root = config_path.parent()?.parent()?.parent()?;
    if root.as_os_str().is_empty() {
        return None;
    }
    Some(normalize_path(&root.to_string_lossy()))
}

fn basename(value: &str) -> &str {
    value.rsplit('/').next().unwrap_or(value)
}

/// Returns `Some(installation)` if the process runs this service.
/// The inner option is `None` when no config argument could be located.
pub fn match_service(
    spec: &ServiceSpec,
    matcher: &NameMatcher,
    process: &ProcessSnapshot,
) -> Option<Option<String>> {
    let argv0 = process.cmd.first().map(|a| basename(a)).unwrap_or("");
    if !matcher.is_match(&process.name) && !matcher.is_match(argv0) {
        return None;
    }

    let args = process.cmd.get(1..).unwrap_or(&[]);
    let config = config_argument(args, &spec.config_flag);

    match &spec.subcommand {
        Some(sub) => {
            if !args.iter().any(|a| a == sub) {
                return None;
            }
        }
        None => {
            config.as_ref()?;
        }
    }

    let installation = config.and_then(|value| {
        let path = PathBuf::from(&value);
        let absolute = if path.is_absolute() {
            path
        } else {
            process.cwd.as_ref()?.join(path)
        };
        installation_from_config(&absolute)
    });

    Some(installation)
}

/// Collects every process matching `spec` into a [`ServiceHandle`].
pub fn classify_processes(
    kind: ServiceKind,
    spec: &ServiceSpec,
    matcher: &NameMatcher,
    processes: &[ProcessSnapshot],
) -> ServiceHandle {
    let mut ordered: Vec<&ProcessSnapshot> = processes.iter().collect();
    ordered.sort_by_key(|p| p.pid);

    let mut handle = ServiceHandle::not_running(kind);
    for process in ordered {
        let Some(installation) = match_service(spec, matcher, process) else {
            continue;
        };
        handle.record(process.pid, installation);
    }

    if handle.is_ambiguous() {
        warn!(
            service = kind.label(),
            candidates = ?handle.candidates,
            chosen = ?handle.installation_path,
            "Multiple installations running; attributing to first match"
        );
    }
    handle
}

// ─────────────────────────────────────────────────────────────────────────────
// System Implementation
// ─────────────────────────────────────────────────────────────────────────────

pub fn is_pid_alive(pid: u32) -> bool {
    if pid == 0 || pid > i32::MAX as u32 {
        return false;
    }
    #[cfg(unix)]
    {
        // SAFETY: kill(pid, 0) sends no signal; it only checks existence.
        #[allow(unsafe_code)]
        let result = unsafe { libc::kill(pid as i32, 0) };
        if result == 0 {
            return true;
        }
        // EPERM: the process exists but belongs to another user.
        std::io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
    }
    #[cfg(not(unix))]
    {
        false
    }
}

/// Probe backed by `sysinfo` (process table) and `kill(pid, 0)` (liveness).
pub struct SystemProbe {
    log_server: (ServiceSpec, NameMatcher),
    dashboard_server: (ServiceSpec, NameMatcher),
}

impl SystemProbe {
    pub fn new(config: &TelemetryConfig) -> Self {
        let entry = |spec: &ServiceSpec| (spec.clone(), NameMatcher::new(&spec.process_pattern));
        Self {
            log_server: entry(&config.log_server),
            dashboard_server: entry(&config.dashboard_server),
        }
    }

    fn snapshot() -> Vec<ProcessSnapshot> {
        let mut sys = System::new();
        sys.refresh_processes_specifics(
            ProcessRefreshKind::new()
                .with_cmd(UpdateKind::Always)
                .with_cwd(UpdateKind::Always),
        );

        sys.processes()
            .iter()
            .map(|(pid, process)| {
                let cwd = process.cwd().filter(|c| !c.as_os_str().is_empty());
                ProcessSnapshot {
                    pid: pid.as_u32(),
                    name: process.name().to_string(),
                    cmd: process.cmd().to_vec(),
                    cwd: cwd.map(Path::to_path_buf),
                }
            })
            .collect()
    }
}

impl ProcessProbe for SystemProbe {
    fn detect_running_services(&self) -> ProbeResult {
        let processes = Self::snapshot();
        debug!(count = processes.len(), "Sampled process table");

        ProbeResult {
            log_server: classify_processes(
                ServiceKind::LogServer,
                &self.log_server.0,
                &self.log_server.1,
                &processes,
            ),
            dashboard_server: classify_processes(
                ServiceKind::DashboardServer,
                &self.dashboard_server.0,
                &self.dashboard_server.1,
                &processes,
            ),
        }
    }

    fn is_alive(&self, pid: u32) -> bool {
        is_pid_alive(pid)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn proc(pid: u32, cmd: &[&str]) -> ProcessSnapshot {
        ProcessSnapshot {
            pid,
            name: basename(cmd[0]).to_string(),
            cmd: cmd.iter().map(|s| s.to_string()).collect(),
            cwd: None,
        }
    }

    fn loki() -> (ServiceSpec, NameMatcher) {
        let spec = ServiceSpec::log_server();
        let matcher = NameMatcher::new(&spec.process_pattern);
        (spec, matcher)
    }

    fn grafana() -> (ServiceSpec, NameMatcher) {
        let spec = ServiceSpec::dashboard_server();
        let matcher = NameMatcher::new(&spec.process_pattern);
        (spec, matcher)
    }

    #[test]
    fn config_argument_forms() {
        let args = |v: &[&str]| v.iter().map(|s| s.to_string()).collect::<Vec<_>>();
        assert_eq!(
            config_argument(&args(&["-config.file=/a/b.yaml"]), "-config.file"),
            Some("/a/b.yaml".to_string())
        );
        assert_eq!(
            config_argument(&args(&["--config.file", "/a/b.yaml"]), "-config.file"),
            Some("/a/b.yaml".to_string())
        );
        assert_eq!(
            config_argument(&args(&["server", "--config=/g.ini"]), "--config"),
            Some("/g.ini".to_string())
        );
        assert_eq!(config_argument(&args(&["--configx=/g.ini"]), "--config"), None);
        assert_eq!(config_argument(&args(&["config=/g.ini"]), "--config"), None);
    }

    #[test]
    fn installation_is_grandparent_of_config_dir() {
        assert_eq!(
            installation_from_config(Path::new("/opt/telemetry/config/loki/loki-config.yaml")),
            Some("/opt/telemetry".to_string())
        );
        assert_eq!(installation_from_config(Path::new("/loki.yaml")), None);
    }

    #[test]
    fn log_server_requires_config_flag() {
        let (spec, matcher) = loki();
        let with_config = proc(
            10,
            &["/opt/t/bin/loki", "-config.file=/opt/t/config/loki/loki-config.yaml"],
        );
        let without = proc(11, &["/opt/t/bin/loki", "-version"]);
        assert_eq!(
            match_service(&spec, &matcher, &with_config),
            Some(Some("/opt/t".to_string()))
        );
        assert_eq!(match_service(&spec, &matcher, &without), None);
    }

    #[test]
    fn dashboard_requires_server_subcommand() {
        let (spec, matcher) = grafana();
        let server = proc(
            20,
            &["grafana", "server", "--config=/opt/t/config/grafana/grafana.ini"],
        );
        let cli = proc(21, &["grafana", "cli", "plugins", "ls"]);
        let no_config = proc(22, &["grafana", "server"]);
        assert_eq!(
            match_service(&spec, &matcher, &server),
            Some(Some("/opt/t".to_string()))
        );
        assert_eq!(match_service(&spec, &matcher, &cli), None);
        assert_eq!(match_service(&spec, &matcher, &no_config), Some(None));
    }

    #[test]
    fn relative_config_resolves_against_cwd() {
        let (spec, matcher) = loki();
        let mut process = proc(30, &["loki", "-config.file=config/loki/loki.yaml"]);
        assert_eq!(match_service(&spec, &matcher, &process), Some(None));
        process.cwd = Some(PathBuf::from("/srv/telemetry"));
        assert_eq!(
            match_service(&spec, &matcher, &process),
            Some(Some("/srv/telemetry".to_string()))
        );
    }

    #[test]
    fn unrelated_processes_are_ignored() {
        let (spec, matcher) = loki();
        let process = proc(40, &["/usr/bin/vim", "-config.file=/x/config/loki/a.yaml"]);
        assert_eq!(match_service(&spec, &matcher, &process), None);
    }

    #[test]
    fn classify_takes_first_match_and_records_candidates() {
        let (spec, matcher) = loki();
        let processes = vec![
            proc(
                300,
                &["loki", "-config.file=/tmp/test-telemetry/config/loki/l.yaml"],
            ),
            proc(200, &["loki", "-config.file=/opt/t/config/loki/l.yaml"]),
            proc(250, &["bash"]),
        ];
        let handle = classify_processes(ServiceKind::LogServer, &spec, &matcher, &processes);
        assert_eq!(handle.pids, PidSet::new([200, 300]));
        assert_eq!(handle.installation_path.as_deref(), Some("/opt/t"));
        assert!(handle.is_ambiguous());
        assert!(handle.runs_from("/tmp/test-telemetry/"));
        assert!(handle.serves(300, "/tmp/test-telemetry"));
        assert!(!handle.serves(300, "/opt/t"));
        assert!(!handle.serves(250, "/opt/t"));
    }

    #[test]
    fn unlocated_instance_serves_no_installation() {
        let mut handle = ServiceHandle::not_running(ServiceKind::DashboardServer);
        handle.record(42, None);
        assert!(handle.is_running());
        assert_eq!(handle.installation_path, None);
        assert!(!handle.serves(42, "/opt/t"));
    }

    #[test]
    fn system_snapshot_sees_this_process() {
        let own = std::process::id();
        let processes = SystemProbe::snapshot();
        let me = processes.iter().find(|p| p.pid == own).unwrap();
        assert!(me.cwd.as_ref().map_or(true, |cwd| cwd.is_absolute()));
        assert!(SystemProbe::new(&TelemetryConfig::default()).is_alive(own));
    }

    #[test]
    fn empty_probe_falls_back() {
        let probe = ProbeResult::empty();
        assert!(!probe.log_server.is_running());
        assert_eq!(probe.installation_path(), None);
        assert_eq!(probe.installation_or("/opt/t/"), "/opt/t");
        assert!(!probe.is_ambiguous());
    }

    #[test]
    fn probe_installation_prefers_log_server() {
        let mut probe = ProbeResult::empty();
        probe.dashboard_server.installation_path = Some("/b".to_string());
        probe.dashboard_server.candidates = vec!["/b".to_string()];
        assert_eq!(probe.installation_path(), Some("/b"));
        probe.log_server.installation_path = Some("/a".to_string());
        probe.log_server.candidates = vec!["/a".to_string()];
        assert_eq!(probe.installation_path(), Some("/a"));
        assert!(probe.is_ambiguous());
    }

    #[test]
    fn literal_matcher_for_invalid_regex() {
        let matcher = NameMatcher::new("loki(");
        assert!(matcher.is_match("my-loki(-build"));
        assert!(!matcher.is_match("loki"));
    }

    #[test]
    fn pid_zero_is_never_alive() {
        assert!(!is_pid_alive(0));
        assert!(is_pid_alive(std::process::id()));
    }
}

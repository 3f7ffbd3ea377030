//! Starting and stopping the managed services.
//!
//! Stopping escalates: SIGTERM, poll for exit, then SIGKILL. A process that
//! disappears at any point counts as stopped. Nothing here returns `Err` for
//! a process that refuses to die; that outcome is reported as data so
//! cleanup can carry on with the rest of a session.

use std::os::unix::process::CommandExt;
use std::process::{Command, Stdio};
use std::time::Duration;

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::config::{ServiceSpec, TelemetryConfig};
use crate::error::{Result, TelemetryError};
use crate::probe::ProcessProbe;
use crate::storage::StoragePaths;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signal {
    /// SIGTERM
    Terminate,
    /// SIGKILL
    Kill,
}

impl Signal {
    fn as_raw(self) -> libc::c_int {
        match self {
            Signal::Terminate => libc::SIGTERM,
            Signal::Kill => libc::SIGKILL,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SignalResult {
    Delivered,
    /// ESRCH: the process is already gone.
    NoSuchProcess,
    Failed(String),
}

/// Process lifecycle operations, separated from [`ProcessProbe`] so tests
/// can drive cleanup against a fake process table.
pub trait ServiceControl {
    fn signal(&self, pid: u32, signal: Signal) -> SignalResult;

    /// Launches `spec` from the installation at `paths`, returning its PID.
    fn start(&self, spec: &ServiceSpec, paths: &StoragePaths) -> Result<u32>;
}

/// How a single PID left the process table (or didn't).
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", content = "detail", rename_all = "snake_case")]
pub enum StopOutcome {
    AlreadyStopped,
    /// Exited after SIGTERM.
    Stopped,
    /// Needed SIGKILL.
    Killed,
    /// The signal could not be delivered at all.
    SignalFailed(String),
    /// Still alive after SIGKILL.
    Unresponsive,
}

impl StopOutcome {
    pub fn is_success(&self) -> bool {
        matches!(
            self,
            StopOutcome::AlreadyStopped | StopOutcome::Stopped | StopOutcome::Killed
        )
    }
}

/// Bounded wait between SIGTERM and SIGKILL.
#[derive(Debug, Clone, Copy)]
pub struct StopPolicy {
    pub poll_interval: Duration,
    pub max_polls: u32,
}

impl StopPolicy {
    pub fn from_config(config: &TelemetryConfig) -> Self {
        Self {
            poll_interval: config.stop_poll_interval(),
            max_polls: config.stop_max_polls,
        }
    }

    /// No waiting; for tests against a fake process table.
    pub fn immediate() -> Self {
        Self {
            poll_interval: Duration::ZERO,
            max_polls: 3,
        }
    }
}

impl Default for StopPolicy {
    fn default() -> Self {
        Self::from_config(&TelemetryConfig::default())
    }
}

fn wait_for_exit(pid: u32, probe: &dyn ProcessProbe, policy: &StopPolicy) -> bool {
    for _ in 0..policy.max_polls {
        if !probe.is_alive(pid) {
            return true;
        }
        std::thread::sleep(policy.poll_interval);
    }
    !probe.is_alive(pid)
}

/// Stops `pid` with SIGTERM, escalating to SIGKILL after the policy's polls.
pub fn stop_process(
    pid: u32,
    probe: &dyn ProcessProbe,
    control: &dyn ServiceControl,
    policy: &StopPolicy,
) -> StopOutcome {
    if !probe.is_alive(pid) {
        debug!(pid, "Process already stopped");
        return StopOutcome::AlreadyStopped;
    }

    match control.signal(pid, Signal::Terminate) {
        SignalResult::Delivered => {}
        SignalResult::NoSuchProcess => return StopOutcome::AlreadyStopped,
        SignalResult::Failed(reason) => {
            warn!(pid, %reason, "Failed to send SIGTERM");
            return StopOutcome::SignalFailed(reason);
        }
    }

    if wait_for_exit(pid, probe, policy) {
        info!(pid, "Process stopped");
        return StopOutcome::Stopped;
    }

    warn!(pid, polls = policy.max_polls, "Process ignored SIGTERM; sending SIGKILL");
    match control.signal(pid, Signal::Kill) {
        SignalResult::Delivered => {}
        SignalResult::NoSuchProcess => return StopOutcome::Stopped,
        SignalResult::Failed(reason) => {
            warn!(pid, %reason, "Failed to send SIGKILL");
            return StopOutcome::SignalFailed(reason);
        }
    }

    std::thread::sleep(policy.poll_interval);
    if probe.is_alive(pid) {
        let err = TelemetryError::ProcessUnresponsive {
            pid,
            waited_secs: policy.poll_interval.as_secs() * u64::from(policy.max_polls),
        };
        warn!(error = %err, "Process survived SIGKILL");
        StopOutcome::Unresponsive
    } else {
        info!(pid, "Process killed");
        StopOutcome::Killed
    }
}

/// Launch arguments for `spec` rooted at `paths`.
///
/// Subcommand first, then `<flag>=<config path>`, then the extra args with
/// `{root}` substituted.
pub fn launch_args(spec: &ServiceSpec, paths: &StoragePaths) -> Vec<String> {
    let root = paths.root_str();
    let mut args = Vec::new();
    if let Some(sub) = &spec.subcommand {
        args.push(sub.clone());
    }
    args.push(format!(
        "{}={}",
        spec.config_flag,
        paths.resolve(&spec.config_file).display()
    ));
    args.extend(spec.extra_args.iter().map(|a| a.replace("{root}", &root)));
    args
}

/// `libc::kill` for signals, detached `Command` spawns for starts.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemServiceControl;

impl ServiceControl for SystemServiceControl {
    fn signal(&self, pid: u32, signal: Signal) -> SignalResult {
        if pid == 0 || pid > i32::MAX as u32 {
            return SignalResult::NoSuchProcess;
        }
        // SAFETY: plain POSIX signal delivery to a positive PID.
        #[allow(unsafe_code)]
        let result = unsafe { libc::kill(pid as i32, signal.as_raw()) };
        if result == 0 {
            return SignalResult::Delivered;
        }
        let err = std::io::Error::last_os_error();
        if err.raw_os_error() == Some(libc::ESRCH) {
            SignalResult::NoSuchProcess
        } else {
            SignalResult::Failed(err.to_string())
        }
    }

    fn start(&self, spec: &ServiceSpec, paths: &StoragePaths) -> Result<u32> {
        let binary = paths.resolve(&spec.binary);
        if !binary.is_file() {
            return Err(TelemetryError::CommandFailed {
                command: binary.display().to_string(),
                details: "service binary not found".to_string(),
            });
        }

        let log_path = paths.service_log_file(&spec.name);
        if let Some(dir) = log_path.parent() {
            fs_err::create_dir_all(dir)
                .map_err(|e| TelemetryError::io(format!("creating {}", dir.display()), e))?;
        }
        let (log, _) = fs_err::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&log_path)
            .map_err(|e| TelemetryError::io(format!("opening {}", log_path.display()), e))?
            .into_parts();
        let log_err = log
            .try_clone()
            .map_err(|e| TelemetryError::io("duplicating service log handle", e))?;

        let args = launch_args(spec, paths);
        debug!(binary = %binary.display(), ?args, "Starting service");

        // Own process group so the service outlives this invocation.
        let child = Command::new(&binary)
            .args(&args)
            .current_dir(paths.root())
            .stdin(Stdio::null())
            .stdout(Stdio::from(log))
            .stderr(Stdio::from(log_err))
            .process_group(0)
            .spawn()
            .map_err(|e| TelemetryError::CommandFailed {
                command: binary.display().to_string(),
                details: e.to_string(),
            })?;

        info!(service = %spec.name, pid = child.id(), log = %log_path.display(), "Service started");
        Ok(child.id())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::probe::ProbeResult;
    use std::cell::RefCell;
    use std::collections::BTreeSet;

    /// Fake process table; a process listed in `stubborn` ignores SIGTERM.
    #[derive(Default)]
    struct FakeProcesses {
        alive: RefCell<BTreeSet<u32>>,
        stubborn: BTreeSet<u32>,
        unkillable: BTreeSet<u32>,
        signals: RefCell<Vec<(u32, Signal)>>,
    }

    impl ProcessProbe for FakeProcesses {
        fn detect_running_services(&self) -> ProbeResult {
            ProbeResult::empty()
        }

        fn is_alive(&self, pid: u32) -> bool {
            self.alive.borrow().contains(&pid)
        }
    }

    impl ServiceControl for FakeProcesses {
        fn signal(&self, pid: u32, signal: Signal) -> SignalResult {
            self.signals.borrow_mut().push((pid, signal));
            if !self.alive.borrow().contains(&pid) {
                return SignalResult::NoSuchProcess;
            }
            let dies = match signal {
                Signal::Terminate => !self.stubborn.contains(&pid),
                Signal::Kill => !self.unkillable.contains(&pid),
            };
            if dies {
                self.alive.borrow_mut().remove(&pid);
            }
            SignalResult::Delivered
        }

        fn start(&self, _spec: &ServiceSpec, _paths: &StoragePaths) -> Result<u32> {
            Ok(1)
        }
    }

    fn fake(alive: &[u32]) -> FakeProcesses {
        FakeProcesses {
            alive: RefCell::new(alive.iter().copied().collect()),
            ..Default::default()
        }
    }

    #[test]
    fn dead_process_is_already_stopped() {
        let procs = fake(&[]);
        let outcome = stop_process(42, &procs, &procs, &StopPolicy::immediate());
        assert_eq!(outcome, StopOutcome::AlreadyStopped);
        assert!(procs.signals.borrow().is_empty());
    }

    #[test]
    fn sigterm_is_enough_for_cooperative_process() {
        let procs = fake(&[42]);
        let outcome = stop_process(42, &procs, &procs, &StopPolicy::immediate());
        assert_eq!(outcome, StopOutcome::Stopped);
        assert_eq!(*procs.signals.borrow(), vec![(42, Signal::Terminate)]);
    }

    #[test]
    fn stubborn_process_is_killed() {
        let mut procs = fake(&[42]);
        procs.stubborn.insert(42);
        let outcome = stop_process(42, &procs, &procs, &StopPolicy::immediate());
        assert_eq!(outcome, StopOutcome::Killed);
        assert!(outcome.is_success());
        assert_eq!(
            *procs.signals.borrow(),
            vec![(42, Signal::Terminate), (42, Signal::Kill)]
        );
    }

    #[test]
    fn unkillable_process_is_reported_not_fatal() {
        let mut procs = fake(&[42]);
        procs.stubborn.insert(42);
        procs.unkillable.insert(42);
        let outcome = stop_process(42, &procs, &procs, &StopPolicy::immediate());
        assert_eq!(outcome, StopOutcome::Unresponsive);
        assert!(!outcome.is_success());
    }

    #[test]
    fn launch_args_for_default_specs() {
        let paths = StoragePaths::with_root("/opt/t");
        assert_eq!(
            launch_args(&ServiceSpec::log_server(), &paths),
            vec!["-config.file=/opt/t/config/loki/loki-config.yaml".to_string()]
        );
        assert_eq!(
            launch_args(&ServiceSpec::dashboard_server(), &paths),
            vec![
                "server".to_string(),
                "--config=/opt/t/config/grafana/grafana.ini".to_string(),
                "--homepath".to_string(),
                "/opt/t/grafana".to_string(),
            ]
        );
    }

    #[test]
    fn start_without_binary_fails() {
        let temp = tempfile::TempDir::new().unwrap();
        let paths = StoragePaths::with_root(temp.path());
        let err = SystemServiceControl
            .start(&ServiceSpec::log_server(), &paths)
            .unwrap_err();
        assert!(matches!(err, TelemetryError::CommandFailed { .. }));
    }

    #[test]
    fn signalling_pid_zero_is_no_such_process() {
        assert_eq!(
            SystemServiceControl.signal(0, Signal::Terminate),
            SignalResult::NoSuchProcess
        );
    }
}

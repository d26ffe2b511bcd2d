//! Process liveness and termination
//!
//! Agents are tracked by the pid recorded at launch time. Liveness is a
//! `kill(pid, 0)` probe; nothing here inspects process arguments.

use chrono::{DateTime, Utc};
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use crate::store::{DataDir, LaunchRegistry};

/// OS process operations
pub trait ProcessProbe: Send + Sync {
    /// Whether a process with this pid exists
    fn is_alive(&self, pid: u32) -> bool;

    /// Send SIGTERM, or SIGKILL when `force` is set. Returns whether the
    /// signal was delivered.
    fn signal(&self, pid: u32, force: bool) -> bool;
}

/// Signal-based probe using `nix`
pub struct SignalProbe;

#[cfg(unix)]
impl ProcessProbe for SignalProbe {
    fn is_alive(&self, pid: u32) -> bool {
        use nix::errno::Errno;
        use nix::sys::signal::kill;
        use nix::unistd::Pid;

        if pid == 0 {
            return false;
        }
        match kill(Pid::from_raw(pid as i32), None) {
            Ok(()) => true,
            // Exists but owned by someone else
            Err(Errno::EPERM) => true,
            Err(_) => false,
        }
    }

    fn signal(&self, pid: u32, force: bool) -> bool {
        use nix::sys::signal::{kill, Signal};
        use nix::unistd::Pid;

        if pid == 0 {
            return false;
        }
        let sig = if force { Signal::SIGKILL } else { Signal::SIGTERM };
        match kill(Pid::from_raw(pid as i32), sig) {
            Ok(()) => true,
            Err(e) => {
                debug!("Failed to send {:?} to {}: {}", sig, pid, e);
                false
            }
        }
    }
}

#[cfg(not(unix))]
impl ProcessProbe for SignalProbe {
    fn is_alive(&self, _pid: u32) -> bool {
        false
    }

    fn signal(&self, _pid: u32, _force: bool) -> bool {
        false
    }
}

/// SIGTERM, wait up to `grace`, then SIGKILL. Returns whether the process is gone.
pub async fn terminate(probe: &dyn ProcessProbe, pid: u32, grace: Duration) -> bool {
    if !probe.is_alive(pid) {
        return true;
    }

    probe.signal(pid, false);
    let step = Duration::from_millis(100);
    let mut waited = Duration::ZERO;
    while waited < grace {
        if !probe.is_alive(pid) {
            return true;
        }
        tokio::time::sleep(step).await;
        waited += step;
    }

    warn!("Process {} ignored SIGTERM, sending SIGKILL", pid);
    probe.signal(pid, true);
    tokio::time::sleep(Duration::from_millis(200)).await;
    !probe.is_alive(pid)
}

/// What is currently known about an issue's agent process
pub trait Liveness: Send + Sync {
    /// Pid of a live agent process for the issue
    fn running_pid(&self, issue: &str) -> Option<u32>;

    /// Modification time of the issue's newest agent log
    fn last_log_activity(&self, issue: &str) -> Option<DateTime<Utc>>;
}

/// Liveness from the launch registry, a process probe and the log directory
pub struct AgentActivity {
    registry: LaunchRegistry,
    probe: Arc<dyn ProcessProbe>,
    data: DataDir,
}

impl AgentActivity {
    pub fn new(registry: LaunchRegistry, probe: Arc<dyn ProcessProbe>, data: DataDir) -> Self {
        Self {
            registry,
            probe,
            data,
        }
    }

    /// Newest log file written for the issue
    pub fn latest_log(&self, issue: &str) -> Option<PathBuf> {
        latest_log_file(&self.data.issue_logs_dir(issue))
    }
}

impl Liveness for AgentActivity {
    fn running_pid(&self, issue: &str) -> Option<u32> {
        let entry = self.registry.get(issue)?;
        self.probe.is_alive(entry.pid).then_some(entry.pid)
    }

    fn last_log_activity(&self, issue: &str) -> Option<DateTime<Utc>> {
        self.latest_log(issue).and_then(|p| file_mtime(&p))
    }
}

/// Last modification time of a file
pub fn file_mtime(path: &Path) -> Option<DateTime<Utc>> {
    std::fs::metadata(path)
        .and_then(|m| m.modified())
        .ok()
        .map(DateTime::<Utc>::from)
}

/// Most recently modified `*.log` file in a directory
pub fn latest_log_file(dir: &Path) -> Option<PathBuf> {
    std::fs::read_dir(dir)
        .ok()?
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .filter(|p| p.extension().is_some_and(|ext| ext == "log"))
        .filter_map(|p| file_mtime(&p).map(|t| (t, p)))
        .max_by_key(|(t, _)| *t)
        .map(|(_, p)| p)
}

/// Last `max_bytes` of a file as lossy UTF-8
pub fn read_tail(path: &Path, max_bytes: u64) -> Option<String> {
    let mut file = std::fs::File::open(path).ok()?;
    let len = file.metadata().ok()?.len();
    if len > max_bytes {
        file.seek(SeekFrom::Start(len - max_bytes)).ok()?;
    }
    let mut buf = Vec::new();
    file.read_to_end(&mut buf).ok()?;
    Some(String::from_utf8_lossy(&buf).into_owned())
}

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// One line of `adb devices -l`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DeviceSummary {
    pub serial: String,
    pub state: String,
    pub model: Option<String>,
    pub transport_id: Option<String>,
}

impl DeviceSummary {
    /// Only devices in the `device` state accept shell and sync commands.
    pub fn is_reachable(&self) -> bool {
        self.state == "device"
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum SessionState {
    Unknown,
    NotRunning,
    Starting,
    Running,
    Stopping,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TracingSession {
    pub pid: u32,
    pub remote_path: Option<String>,
    /// Trace config used for the launch; `None` when the session was found already running.
    pub config_source: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProbeResult {
    /// Non-empty, in the order the device reported them.
    Running(Vec<u32>),
    NotRunning,
}

impl ProbeResult {
    pub fn primary_pid(&self) -> Option<u32> {
        match self {
            ProbeResult::Running(pids) => pids.first().copied(),
            ProbeResult::NotRunning => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StartOutcome {
    /// A session was already live; nothing was launched.
    AlreadyRunning { pid: u32 },
    Started(TracingSession),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StopOutcome {
    NotRunning,
    Stopped { pids: Vec<u32>, polls: u32 },
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct PulledTrace {
    pub remote_path: String,
    pub local_path: PathBuf,
    pub remote_deleted: bool,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct TraceFailure {
    pub remote_path: String,
    pub error: String,
}

#[derive(Debug, Clone, Serialize, Default, PartialEq, Eq)]
pub struct CollectReport {
    pub serial: String,
    pub local_dir: PathBuf,
    pub pulled: Vec<PulledTrace>,
    pub failed: Vec<TraceFailure>,
    /// Pulled successfully but the remote copy could not be removed.
    pub delete_failed: Vec<TraceFailure>,
}

impl CollectReport {
    pub fn is_clean(&self) -> bool {
        self.failed.is_empty() && self.delete_failed.is_empty()
    }
}

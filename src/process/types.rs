use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::process::ExitStatus;
use std::time::Duration;

/// How a child process terminated
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExitInfo {
    /// Exit code, present when the process exited on its own
    pub code: Option<i32>,
    /// Signal number, present when the process was killed by a signal
    pub signal: Option<i32>,
}

impl ExitInfo {
    pub fn from_status(status: ExitStatus) -> Self {
        #[cfg(unix)]
        let signal = {
            use std::os::unix::process::ExitStatusExt;
            status.signal()
        };
        #[cfg(not(unix))]
        let signal = None;

        Self {
            code: status.code(),
            signal,
        }
    }

    /// Exit whose cause could not be observed (wait itself failed)
    pub fn unknown() -> Self {
        Self {
            code: None,
            signal: None,
        }
    }

    pub fn success(&self) -> bool {
        self.code == Some(0)
    }
}

impl fmt::Display for ExitInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.code, self.signal) {
            (Some(code), _) => write!(f, "exit code {}", code),
            (None, Some(signal)) => write!(f, "killed by signal {}", signal),
            (None, None) => write!(f, "unknown exit status"),
        }
    }
}

/// Lifecycle status of one instance slot
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum InstanceStatus {
    Pending,
    Starting,
    Running,
    Stopping,
    Stopped,
    Restarting,
    Failed,
}

impl InstanceStatus {
    /// Whether a start command may launch the slot from this status
    pub fn is_startable(&self) -> bool {
        matches!(
            self,
            InstanceStatus::Pending | InstanceStatus::Stopped | InstanceStatus::Failed
        )
    }
}

impl fmt::Display for InstanceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InstanceStatus::Pending => write!(f, "pending"),
            InstanceStatus::Starting => write!(f, "starting"),
            InstanceStatus::Running => write!(f, "running"),
            InstanceStatus::Stopping => write!(f, "stopping"),
            InstanceStatus::Stopped => write!(f, "stopped"),
            InstanceStatus::Restarting => write!(f, "restarting"),
            InstanceStatus::Failed => write!(f, "failed"),
        }
    }
}

/// Point-in-time view of one slot, kept across restarts of that slot
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceState {
    pub slot: usize,
    /// Present while the slot owns a live process
    pub pid: Option<u32>,
    pub status: InstanceStatus,
    pub consecutive_failures: u32,
    pub last_exit: Option<ExitInfo>,
    pub last_started_at: Option<DateTime<Utc>>,
    pub restarts: usize,
    /// Last resident memory sample in bytes
    pub memory_usage: Option<u64>,
    /// The restart policy gave up on this slot; survives a later stop and
    /// is cleared by the next start
    pub failed_permanently: bool,
}

impl InstanceState {
    pub fn new(slot: usize) -> Self {
        Self {
            slot,
            pid: None,
            status: InstanceStatus::Pending,
            consecutive_failures: 0,
            last_exit: None,
            last_started_at: None,
            restarts: 0,
            memory_usage: None,
            failed_permanently: false,
        }
    }

    /// Time since the current process started, if one is running
    pub fn uptime(&self) -> Option<Duration> {
        if self.status != InstanceStatus::Running {
            return None;
        }
        self.last_started_at
            .and_then(|at| (Utc::now() - at).to_std().ok())
    }
}

/// What happened to a slot
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum EventKind {
    Started { pid: u32 },
    Exited(ExitInfo),
    MemoryExceeded { rss: u64, limit: u64 },
    Restarting { delay: Duration },
    Starting,
    Stopping,
    Stopped,
    FailedPermanently,
}

impl EventKind {
    /// Short kebab-case label, stable for display and matching
    pub fn label(&self) -> &'static str {
        match self {
            EventKind::Started { .. } => "started",
            EventKind::Exited(_) => "exited",
            EventKind::MemoryExceeded { .. } => "memory-exceeded",
            EventKind::Restarting { .. } => "restarting",
            EventKind::Starting => "starting",
            EventKind::Stopping => "stopping",
            EventKind::Stopped => "stopped",
            EventKind::FailedPermanently => "failed-permanently",
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LifecycleEvent {
    pub slot: usize,
    pub timestamp: DateTime<Utc>,
    pub kind: EventKind,
    pub detail: String,
}

impl LifecycleEvent {
    pub fn new(slot: usize, kind: EventKind, detail: impl Into<String>) -> Self {
        Self {
            slot,
            timestamp: Utc::now(),
            kind,
            detail: detail.into(),
        }
    }
}

impl fmt::Display for LifecycleEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{}] slot {} {}",
            self.timestamp.format("%Y-%m-%d %H:%M:%S%.3f"),
            self.slot,
            self.kind
        )?;
        if !self.detail.is_empty() {
            write!(f, ": {}", self.detail)?;
        }
        Ok(())
    }
}

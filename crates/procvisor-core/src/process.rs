use anyhow::Result;
use std::fmt;

/// Unique identifier for a process
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ProcessId(pub u32);

impl From<u32> for ProcessId {
    fn from(pid: u32) -> Self {
        ProcessId(pid)
    }
}

impl fmt::Display for ProcessId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Observed lifecycle state of a supervised child
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessState {
    /// Process is currently running
    Running,
    /// Process exited on its own with the given exit code
    Exited(i32),
    /// Process was force-killed by its supervisor
    Killed,
}

impl ProcessState {
    pub fn is_running(&self) -> bool {
        matches!(self, ProcessState::Running)
    }

    pub fn exit_code(&self) -> Option<i32> {
        match self {
            ProcessState::Exited(code) => Some(*code),
            _ => None,
        }
    }
}

impl fmt::Display for ProcessState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProcessState::Running => write!(f, "running"),
            ProcessState::Exited(code) => write!(f, "exited({code})"),
            ProcessState::Killed => write!(f, "killed"),
        }
    }
}

/// Result of a process termination operation
#[derive(Debug, Clone, PartialEq)]
pub enum TerminationResult {
    /// Signal was delivered
    Success,
    /// Process was not found (already exited)
    ProcessNotFound,
    /// Permission denied (insufficient privileges)
    AccessDenied,
    /// The platform has no way to perform this operation
    Unsupported,
    /// Operation failed with specific error message
    Failed(String),
}

impl TerminationResult {
    /// The process is gone afterwards, whoever ended it
    pub fn is_gone(&self) -> bool {
        matches!(
            self,
            TerminationResult::Success | TerminationResult::ProcessNotFound
        )
    }
}

/// Platform seam for signalling processes by PID.
///
/// Every method is synchronous so it can be used from `Drop`, from signal
/// handler threads and from outside a runtime.
pub trait ProcessTermination: Send + Sync {
    /// Terminate a single process gracefully (SIGTERM on Unix)
    fn terminate_gracefully(&self, pid: ProcessId) -> TerminationResult;

    /// Force kill a single process (SIGKILL on Unix)
    fn force_kill(&self, pid: ProcessId) -> TerminationResult;

    /// Force kill every member of the process group led by `pid`
    fn kill_process_group(&self, pid: ProcessId) -> TerminationResult;

    /// Find all descendants of a process, deepest first
    fn find_descendants(&self, pid: ProcessId) -> Result<Vec<ProcessId>>;

    /// Get the platform name for logging and debugging
    fn platform_name(&self) -> &'static str;
}

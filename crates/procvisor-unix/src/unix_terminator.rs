use anyhow::Result;
use procvisor_core::{ProcessId, ProcessTermination, TerminationResult};

#[cfg(unix)]
mod unix_impl {
    use super::*;
    use nix::errno::Errno;
    use nix::sys::signal::{self, Signal};
    use nix::unistd::Pid as NixPid;
    use sysinfo::System;
    use tracing::{debug, info, warn};

    /// Unix signal-based process terminator with process tree discovery
    pub struct UnixProcessTerminator {
        system: std::sync::Mutex<System>,
    }

    impl Default for UnixProcessTerminator {
        fn default() -> Self {
            Self::new()
        }
    }

    impl UnixProcessTerminator {
        pub fn new() -> Self {
            debug!("Initializing Unix process terminator");
            Self {
                system: std::sync::Mutex::new(System::new()),
            }
        }

        fn send(&self, pid: ProcessId, sig: Signal) -> TerminationResult {
            let nix_pid = NixPid::from_raw(pid.0 as i32);
            match signal::kill(nix_pid, sig) {
                Ok(()) => {
                    debug!("Sent {} to process {}", sig, pid);
                    TerminationResult::Success
                }
                Err(e) => classify(pid, sig, e),
            }
        }

        /// Recursively find all child processes
        fn find_children_recursive(system: &System, parent_pid: u32, result: &mut Vec<u32>) {
            for (pid, process) in system.processes() {
                #[allow(clippy::collapsible_if)]
                if let Some(ppid) = process.parent() {
                    if ppid.as_u32() == parent_pid {
                        let child_pid = pid.as_u32();
                        // Grandchildren go first so they are killed before their parent
                        Self::find_children_recursive(system, child_pid, result);
                        result.push(child_pid);
                    }
                }
            }
        }
    }

    fn classify(pid: ProcessId, sig: Signal, e: Errno) -> TerminationResult {
        match e {
            Errno::ESRCH => {
                debug!("Process {} not found (already terminated)", pid);
                TerminationResult::ProcessNotFound
            }
            Errno::EPERM => {
                warn!("Permission denied sending {} to process {}", sig, pid);
                TerminationResult::AccessDenied
            }
            e => {
                warn!("Failed to send {} to process {}: {}", sig, pid, e);
                TerminationResult::Failed(format!("{sig} failed: {e}"))
            }
        }
    }

    impl ProcessTermination for UnixProcessTerminator {
        fn terminate_gracefully(&self, pid: ProcessId) -> TerminationResult {
            self.send(pid, Signal::SIGTERM)
        }

        fn force_kill(&self, pid: ProcessId) -> TerminationResult {
            self.send(pid, Signal::SIGKILL)
        }

        fn kill_process_group(&self, pid: ProcessId) -> TerminationResult {
            let pgid = NixPid::from_raw(pid.0 as i32);
            match signal::killpg(pgid, Signal::SIGKILL) {
                Ok(()) => {
                    info!("Sent SIGKILL to process group {}", pid);
                    TerminationResult::Success
                }
                Err(e) => classify(pid, Signal::SIGKILL, e),
            }
        }

        fn find_descendants(&self, pid: ProcessId) -> Result<Vec<ProcessId>> {
            let mut system = self
                .system
                .lock()
                .map_err(|_| anyhow::anyhow!("process table lock poisoned"))?;
            system.refresh_processes_specifics(
                sysinfo::ProcessesToUpdate::All,
                true,
                sysinfo::ProcessRefreshKind::default(),
            );

            let mut children = Vec::new();
            Self::find_children_recursive(&system, pid.0, &mut children);

            Ok(children.into_iter().map(ProcessId::from).collect())
        }

        fn platform_name(&self) -> &'static str {
            "unix"
        }
    }
}

#[cfg(unix)]
pub use unix_impl::UnixProcessTerminator;

// Provide a stub implementation for non-Unix systems
#[cfg(not(unix))]
#[derive(Default)]
pub struct UnixProcessTerminator;

#[cfg(not(unix))]
impl UnixProcessTerminator {
    pub fn new() -> Self {
        Self
    }
}

#[cfg(not(unix))]
impl ProcessTermination for UnixProcessTerminator {
    fn terminate_gracefully(&self, _pid: ProcessId) -> TerminationResult {
        TerminationResult::Unsupported
    }

    fn force_kill(&self, _pid: ProcessId) -> TerminationResult {
        TerminationResult::Unsupported
    }

    fn kill_process_group(&self, _pid: ProcessId) -> TerminationResult {
        TerminationResult::Unsupported
    }

    fn find_descendants(&self, _pid: ProcessId) -> Result<Vec<ProcessId>> {
        Ok(Vec::new())
    }

    fn platform_name(&self) -> &'static str {
        "unsupported"
    }
}

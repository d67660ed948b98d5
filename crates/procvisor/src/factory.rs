use procvisor_core::ProcessTermination;
use std::sync::Arc;

/// Platform-independent factory that selects the terminator at compile time
pub struct PlatformTerminatorFactory;

impl PlatformTerminatorFactory {
    pub fn create_terminator() -> Arc<dyn ProcessTermination> {
        #[cfg(unix)]
        return Arc::new(procvisor_unix::UnixProcessTerminatorFactory::create_terminator());

        #[cfg(not(unix))]
        return Arc::new(fallback::RuntimeOnlyTerminator);
    }
}

#[cfg(not(unix))]
mod fallback {
    use anyhow::Result;
    use procvisor_core::{ProcessId, ProcessTermination, TerminationResult};

    /// No signal support: handles are killed by their reaper task instead
    pub struct RuntimeOnlyTerminator;

    impl ProcessTermination for RuntimeOnlyTerminator {
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
            "runtime-only"
        }
    }
}

use crate::exit_hook::ExitHook;
use crate::handle::{KillMode, ProcessHandle};
use procvisor_core::{ProcessState, ProcessTermination};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tracing::{debug, info};

/// State shared between a supervisor, its stoppers and its exit hook
pub(crate) struct Shared {
    pub name: String,
    pub mode: KillMode,
    pub terminator: Arc<dyn ProcessTermination>,
    handles: Mutex<Vec<ProcessHandle>>,
}

impl Shared {
    pub fn new(name: String, mode: KillMode, terminator: Arc<dyn ProcessTermination>) -> Self {
        Self {
            name,
            mode,
            terminator,
            handles: Mutex::new(Vec::new()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Vec<ProcessHandle>> {
        self.handles.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn push(&self, handle: ProcessHandle) {
        self.lock().push(handle);
    }

    /// Copy of the handle list in spawn order
    pub fn snapshot(&self) -> Vec<ProcessHandle> {
        self.lock().clone()
    }

    pub fn kill(&self, handle: &ProcessHandle) -> bool {
        handle.force_stop(self.terminator.as_ref(), self.mode)
    }

    /// Force-kill every running handle in spawn order
    pub fn stop_all(&self) {
        let handles = self.snapshot();
        let killed = handles.iter().filter(|h| self.kill(h)).count();
        if killed > 0 {
            info!(supervisor = %self.name, killed, "Stopped processes");
        } else {
            debug!(supervisor = %self.name, "Nothing left to stop");
        }
    }

    pub fn running_count(&self) -> usize {
        self.lock().iter().filter(|h| h.is_running()).count()
    }
}

/// The `stop` callable handed out by a supervisor.
///
/// Cheap to clone, `Send + Sync`, idempotent. Every clone acts on the full,
/// current handle list of the supervisor that produced it, including handles
/// added by later `start` calls. A stopper created after the first `start`
/// also keeps the supervisor's exit hook alive.
#[derive(Clone)]
pub struct Stopper {
    shared: Arc<Shared>,
    _exit_hook: Option<Arc<ExitHook>>,
}

impl Stopper {
    pub(crate) fn new(shared: Arc<Shared>, exit_hook: Option<Arc<ExitHook>>) -> Self {
        Self {
            shared,
            _exit_hook: exit_hook,
        }
    }

    /// Force-kill every running child in spawn order.
    ///
    /// Children that already exited are skipped and kill failures are only
    /// logged, so this can be called any number of times from any thread.
    pub fn stop(&self) {
        self.shared.stop_all();
    }

    /// Two-phase stop: ask every running child to exit, give them `grace` to
    /// do so, then force-kill whatever is left. Children ended this way are
    /// reported as `Killed`.
    pub async fn shutdown(&self, grace: Duration) {
        let running: Vec<ProcessHandle> = self
            .shared
            .snapshot()
            .into_iter()
            .filter(ProcessHandle::is_running)
            .collect();

        if !running.is_empty() {
            info!(
                supervisor = %self.shared.name,
                count = running.len(),
                ?grace,
                "Requesting graceful exit"
            );
            for handle in &running {
                handle.request_exit(self.shared.terminator.as_ref());
            }

            let all_exited = async {
                for handle in &running {
                    handle.wait().await;
                }
            };
            if tokio::time::timeout(grace, all_exited).await.is_err() {
                debug!(supervisor = %self.shared.name, "Grace period elapsed");
            }
        }

        self.stop();
    }

    /// Number of children still in the `Running` state
    pub fn running_count(&self) -> usize {
        self.shared.running_count()
    }

    /// States of all tracked children in spawn order
    pub fn states(&self) -> Vec<ProcessState> {
        self.shared.snapshot().iter().map(ProcessHandle::state).collect()
    }
}

impl std::fmt::Debug for Stopper {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Stopper")
            .field("supervisor", &self.shared.name)
            .field("running", &self.running_count())
            .finish()
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use anyhow::Result;
    use procvisor_core::{ProcessId, ProcessSpec, TerminationResult};

    /// Terminator that records calls and delegates to the real one
    struct Recording {
        real: Arc<dyn ProcessTermination>,
        calls: Mutex<Vec<String>>,
        denied: Mutex<Option<ProcessId>>,
    }

    impl Recording {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                real: crate::factory::PlatformTerminatorFactory::create_terminator(),
                calls: Mutex::new(Vec::new()),
                denied: Mutex::new(None),
            })
        }

        /// Refuse to kill `pid`, as if it belonged to another user
        fn deny(&self, pid: ProcessId) {
            *self.denied.lock().unwrap() = Some(pid);
        }

        fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }

        fn record(&self, call: String) {
            self.calls.lock().unwrap().push(call);
        }
    }

    impl ProcessTermination for Recording {
        fn terminate_gracefully(&self, pid: ProcessId) -> TerminationResult {
            self.record(format!("term {pid}"));
            self.real.terminate_gracefully(pid)
        }

        fn force_kill(&self, pid: ProcessId) -> TerminationResult {
            self.record(format!("kill {pid}"));
            if *self.denied.lock().unwrap() == Some(pid) {
                return TerminationResult::AccessDenied;
            }
            self.real.force_kill(pid)
        }

        fn kill_process_group(&self, pid: ProcessId) -> TerminationResult {
            self.record(format!("killpg {pid}"));
            self.real.kill_process_group(pid)
        }

        fn find_descendants(&self, pid: ProcessId) -> Result<Vec<ProcessId>> {
            self.real.find_descendants(pid)
        }

        fn platform_name(&self) -> &'static str {
            "recording"
        }
    }

    fn spawn_all(shared: &Shared, lines: &[&str]) -> Vec<ProcessHandle> {
        lines
            .iter()
            .map(|line| {
                let spec = Arc::new(ProcessSpec::shell(line).unwrap());
                let handle = ProcessHandle::spawn(spec, shared.mode.process_group).unwrap();
                shared.push(handle.clone());
                handle
            })
            .collect()
    }

    #[tokio::test]
    async fn test_stop_kills_in_spawn_order() {
        let recording = Recording::new();
        let shared = Arc::new(Shared::new(
            "order".to_string(),
            KillMode::default(),
            recording.clone(),
        ));
        let handles = spawn_all(&shared, &["sleep 10", "sleep 11", "sleep 12"]);

        let stopper = Stopper::new(shared, None);
        stopper.stop();

        let expected: Vec<String> = handles.iter().map(|h| format!("kill {}", h.pid())).collect();
        assert_eq!(recording.calls(), expected);
        assert_eq!(stopper.states(), vec![ProcessState::Killed; 3]);
    }

    #[tokio::test]
    async fn test_stop_skips_exited_handles() {
        let recording = Recording::new();
        let shared = Arc::new(Shared::new(
            "skip".to_string(),
            KillMode::default(),
            recording.clone(),
        ));
        let handles = spawn_all(&shared, &["true", "sleep 10"]);
        handles[0].wait().await;

        let stopper = Stopper::new(shared, None);
        stopper.stop();
        stopper.stop();

        assert_eq!(recording.calls(), vec![format!("kill {}", handles[1].pid())]);
        assert_eq!(
            stopper.states(),
            vec![ProcessState::Exited(0), ProcessState::Killed]
        );
        assert_eq!(stopper.running_count(), 0);
    }

    #[tokio::test]
    async fn test_stop_never_signals_collected_child() {
        let recording = Recording::new();
        let shared = Arc::new(Shared::new(
            "collected".to_string(),
            KillMode::default(),
            recording.clone(),
        ));
        let handles = spawn_all(&shared, &["true"]);
        // Nobody waits on the handle, the reaper collects it by itself
        tokio::time::sleep(Duration::from_millis(500)).await;

        Stopper::new(shared, None).stop();

        assert!(recording.calls().is_empty());
        assert_eq!(handles[0].state(), ProcessState::Exited(0));
    }

    #[tokio::test]
    async fn test_process_group_mode_uses_group_kill() {
        let recording = Recording::new();
        let mode = KillMode {
            process_group: true,
            kill_descendants: false,
        };
        let shared = Arc::new(Shared::new("group".to_string(), mode, recording.clone()));
        let handles = spawn_all(&shared, &["sleep 10"]);

        Stopper::new(shared, None).stop();

        assert_eq!(recording.calls(), vec![format!("killpg {}", handles[0].pid())]);
    }

    #[tokio::test]
    async fn test_shutdown_is_graceful_first() {
        let recording = Recording::new();
        let shared = Arc::new(Shared::new(
            "graceful".to_string(),
            KillMode::default(),
            recording.clone(),
        ));
        let handles = spawn_all(&shared, &["sleep 10"]);

        let stopper = Stopper::new(shared, None);
        stopper.shutdown(Duration::from_secs(5)).await;

        // sleep honours SIGTERM, so no kill is needed, but the supervisor
        // still ended it
        assert_eq!(recording.calls(), vec![format!("term {}", handles[0].pid())]);
        assert_eq!(handles[0].state(), ProcessState::Killed);
        assert_eq!(handles[0].exit_code(), None);
    }

    #[tokio::test]
    async fn test_shutdown_escalates_after_grace() {
        let recording = Recording::new();
        let shared = Arc::new(Shared::new(
            "stubborn".to_string(),
            KillMode::default(),
            recording.clone(),
        ));
        let handles = spawn_all(&shared, &["sh -c 'trap \"\" TERM; sleep 10'"]);
        // Let the shell install its trap
        tokio::time::sleep(Duration::from_millis(200)).await;

        let stopper = Stopper::new(shared, None);
        stopper.shutdown(Duration::from_millis(300)).await;

        let pid = handles[0].pid();
        assert_eq!(
            recording.calls(),
            vec![format!("term {pid}"), format!("kill {pid}")]
        );
        assert_eq!(handles[0].state(), ProcessState::Killed);
    }

    #[tokio::test]
    async fn test_stop_continues_past_kill_failure() {
        let recording = Recording::new();
        let shared = Arc::new(Shared::new(
            "denied".to_string(),
            KillMode::default(),
            recording.clone(),
        ));
        let handles = spawn_all(&shared, &["sleep 10", "sleep 10"]);
        recording.deny(handles[0].pid());

        let stopper = Stopper::new(shared, None);
        stopper.stop();

        let expected: Vec<String> = handles.iter().map(|h| format!("kill {}", h.pid())).collect();
        assert_eq!(recording.calls(), expected);
        assert_eq!(stopper.running_count(), 0);

        // The refused child is still taken down by its reaper
        for handle in &handles {
            assert_eq!(
                handle.wait_timeout(Duration::from_secs(5)).await,
                Some(ProcessState::Killed)
            );
        }
    }
}

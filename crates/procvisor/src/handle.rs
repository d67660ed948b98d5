use procvisor_core::{ProcessId, ProcessSpec, ProcessState, ProcessTermination, TerminationResult};
use std::fs::{File, OpenOptions};
use std::path::Path;
use std::process::{ExitStatus, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::process::{Child, Command};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Backstop for missed SIGCHLD wakeups
#[cfg(unix)]
const SIGCHLD_BACKSTOP: Duration = Duration::from_millis(250);
const POLL_INTERVAL: Duration = Duration::from_millis(20);

/// Handle to one spawned child process.
///
/// Clones share the same state. A reaper task owns the OS child and records
/// its exit, so the state moves from `Running` to `Exited` without anyone
/// polling.
#[derive(Clone)]
pub struct ProcessHandle {
    inner: Arc<HandleInner>,
}

struct HandleInner {
    spec: Arc<ProcessSpec>,
    pid: ProcessId,
    state: Mutex<ProcessState>,
    /// Set once the supervisor itself asked the process to exit
    exit_requested: AtomicBool,
    kill: CancellationToken,
    reaped: watch::Receiver<bool>,
}

impl HandleInner {
    fn lock_state(&self) -> MutexGuard<'_, ProcessState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn record_exit(&self, state: &mut ProcessState, code: i32) {
        if !state.is_running() {
            debug!(pid = %self.pid, state = %*state, code, "Reaped process");
        } else if self.exit_requested.load(Ordering::SeqCst) {
            *state = ProcessState::Killed;
            info!(
                pid = %self.pid,
                name = self.spec.display_name(),
                code,
                "Process terminated on request"
            );
        } else {
            *state = ProcessState::Exited(code);
            info!(
                pid = %self.pid,
                name = self.spec.display_name(),
                code,
                "Process exited"
            );
        }
    }
}

/// Tunables for how a handle gets force-stopped
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct KillMode {
    pub process_group: bool,
    pub kill_descendants: bool,
}

impl ProcessHandle {
    /// Spawn the process described by `spec` and start its reaper task.
    ///
    /// Must be called from within a tokio runtime.
    pub(crate) fn spawn(spec: Arc<ProcessSpec>, process_group: bool) -> std::io::Result<Self> {
        let mut cmd = Command::new(&spec.command);
        cmd.args(&spec.args);

        if let Some(dir) = &spec.working_directory {
            cmd.current_dir(dir);
        }

        // An explicit environment replaces the inherited one entirely
        if let Some(env) = &spec.environment {
            cmd.env_clear();
            cmd.envs(env);
        }

        if let Some(path) = &spec.stdout {
            cmd.stdout(Stdio::from(open_log(path)?));
        }
        if let Some(path) = &spec.stderr {
            cmd.stderr(Stdio::from(open_log(path)?));
        }

        #[cfg(unix)]
        if process_group {
            cmd.process_group(0);
        }
        #[cfg(not(unix))]
        let _ = process_group;

        // Runtime teardown must not leak children
        cmd.kill_on_drop(true);

        let child = cmd.spawn()?;
        let pid = child
            .id()
            .map(ProcessId::from)
            .ok_or_else(|| std::io::Error::other("spawned process has no pid"))?;

        let (reaped_tx, reaped_rx) = watch::channel(false);
        let inner = Arc::new(HandleInner {
            spec,
            pid,
            state: Mutex::new(ProcessState::Running),
            exit_requested: AtomicBool::new(false),
            kill: CancellationToken::new(),
            reaped: reaped_rx,
        });

        tokio::spawn(reap(child, inner.clone(), reaped_tx));

        Ok(Self { inner })
    }

    pub fn pid(&self) -> ProcessId {
        self.inner.pid
    }

    pub fn spec(&self) -> &ProcessSpec {
        &self.inner.spec
    }

    pub fn name(&self) -> &str {
        self.inner.spec.display_name()
    }

    pub fn state(&self) -> ProcessState {
        *self.inner.lock_state()
    }

    pub fn is_running(&self) -> bool {
        self.state().is_running()
    }

    pub fn exit_code(&self) -> Option<i32> {
        self.state().exit_code()
    }

    /// Wait until the OS process is gone and return the final state
    pub async fn wait(&self) -> ProcessState {
        let mut reaped = self.inner.reaped.clone();
        // Err means the reaper was dropped with the runtime, nothing more to observe
        let _ = reaped.wait_for(|done| *done).await;
        self.state()
    }

    /// Like [`wait`](Self::wait) but gives up after `timeout`
    pub async fn wait_timeout(&self, timeout: Duration) -> Option<ProcessState> {
        tokio::time::timeout(timeout, self.wait()).await.ok()
    }

    /// Has the reaper collected the OS process yet
    pub fn is_reaped(&self) -> bool {
        *self.inner.reaped.borrow()
    }

    /// Force-kill the process if it is still running. Never fails: errors are
    /// logged and the handle is marked `Killed` regardless.
    ///
    /// The reaper only collects the child while holding the state lock, so a
    /// `Running` state seen under that lock guarantees the pid is still ours.
    ///
    /// Returns whether the handle was running.
    pub(crate) fn force_stop(&self, terminator: &dyn ProcessTermination, mode: KillMode) -> bool {
        let inner = &self.inner;
        if !self.is_running() {
            return false;
        }

        // Walking the process table is slow, keep it outside the lock
        let descendants = if mode.kill_descendants {
            terminator.find_descendants(inner.pid).unwrap_or_else(|e| {
                warn!(pid = %inner.pid, "Failed to enumerate descendants: {e}");
                Vec::new()
            })
        } else {
            Vec::new()
        };

        let mut state = inner.lock_state();
        if !state.is_running() {
            debug!(pid = %inner.pid, state = %*state, "Skipping process that is not running");
            return false;
        }

        for descendant in descendants {
            log_kill_failure(descendant, terminator.force_kill(descendant));
        }

        let result = if mode.process_group {
            terminator.kill_process_group(inner.pid)
        } else {
            terminator.force_kill(inner.pid)
        };
        log_kill_failure(inner.pid, result);

        *state = ProcessState::Killed;
        drop(state);

        // Wake the reaper so it collects the child, and kills it itself on
        // platforms where the terminator could not
        inner.kill.cancel();
        info!(pid = %inner.pid, name = inner.spec.display_name(), "Killed process");
        true
    }

    /// Ask the process to exit on its own (SIGTERM on Unix). If it does, the
    /// handle ends up `Killed` rather than `Exited`.
    pub(crate) fn request_exit(&self, terminator: &dyn ProcessTermination) -> TerminationResult {
        let inner = &self.inner;
        let state = inner.lock_state();
        if !state.is_running() {
            return TerminationResult::ProcessNotFound;
        }
        inner.exit_requested.store(true, Ordering::SeqCst);
        let result = terminator.terminate_gracefully(inner.pid);
        if !result.is_gone() {
            inner.exit_requested.store(false, Ordering::SeqCst);
        }
        drop(state);
        debug!(pid = %inner.pid, ?result, "Requested graceful exit");
        result
    }
}

impl std::fmt::Debug for ProcessHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessHandle")
            .field("name", &self.name())
            .field("pid", &self.inner.pid)
            .field("state", &self.state())
            .finish()
    }
}

async fn reap(mut child: Child, inner: Arc<HandleInner>, reaped: watch::Sender<bool>) {
    let mut wakeups = Wakeups::new();
    let mut kill_sent = false;

    loop {
        {
            // Collecting under the lock keeps force_stop from signalling a
            // pid the OS may already have handed out again
            let mut state = inner.lock_state();
            match child.try_wait() {
                Ok(Some(status)) => {
                    inner.record_exit(&mut state, exit_code(status));
                    break;
                }
                Ok(None) => {}
                Err(e) => {
                    warn!(pid = %inner.pid, "Failed to wait for process: {e}");
                    inner.record_exit(&mut state, -1);
                    break;
                }
            }
        }

        tokio::select! {
            _ = wakeups.next() => {}
            _ = inner.kill.cancelled(), if !kill_sent => {
                kill_sent = true;
                if let Err(e) = child.start_kill() {
                    debug!(pid = %inner.pid, "Child already gone at kill time: {e}");
                }
            }
        }
    }

    let _ = reaped.send(true);
}

/// Wakes the reaper when a child may have changed state
struct Wakeups {
    #[cfg(unix)]
    sigchld: Option<tokio::signal::unix::Signal>,
    tick: tokio::time::Interval,
}

impl Wakeups {
    fn new() -> Self {
        #[cfg(unix)]
        let (sigchld, period) = {
            use tokio::signal::unix::{SignalKind, signal};
            match signal(SignalKind::child()) {
                Ok(stream) => (Some(stream), SIGCHLD_BACKSTOP),
                Err(e) => {
                    warn!("Cannot listen for SIGCHLD, polling instead: {e}");
                    (None, POLL_INTERVAL)
                }
            }
        };
        #[cfg(not(unix))]
        let period = POLL_INTERVAL;

        let mut tick = tokio::time::interval(period);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        Self {
            #[cfg(unix)]
            sigchld,
            tick,
        }
    }

    async fn next(&mut self) {
        #[cfg(unix)]
        if let Some(sigchld) = &mut self.sigchld {
            let closed = tokio::select! {
                signal = sigchld.recv() => signal.is_none(),
                _ = self.tick.tick() => false,
            };
            if closed {
                self.sigchld = None;
            }
            return;
        }
        self.tick.tick().await;
    }
}

fn log_kill_failure(pid: ProcessId, result: TerminationResult) {
    match result {
        r if r.is_gone() => {}
        TerminationResult::Unsupported => {
            debug!(pid = %pid, "Platform kill unsupported, relying on runtime kill")
        }
        other => warn!(pid = %pid, "Ignoring kill failure: {other:?}"),
    }
}

/// Exit code with the shell convention of 128 + signal for signal deaths
fn exit_code(status: ExitStatus) -> i32 {
    if let Some(code) = status.code() {
        return code;
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return 128 + signal;
        }
    }
    -1
}

fn open_log(path: &Path) -> std::io::Result<File> {
    OpenOptions::new().create(true).append(true).open(path)
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::factory::PlatformTerminatorFactory;

    fn spec(line: &str) -> Arc<ProcessSpec> {
        Arc::new(ProcessSpec::shell(line).unwrap())
    }

    #[tokio::test]
    async fn test_natural_exit_is_recorded() {
        let handle = ProcessHandle::spawn(spec("sh -c 'exit 7'"), false).unwrap();
        assert_eq!(handle.wait().await, ProcessState::Exited(7));
        assert_eq!(handle.exit_code(), Some(7));
        assert!(handle.is_reaped());
    }

    #[tokio::test]
    async fn test_force_stop_marks_killed() {
        let terminator = PlatformTerminatorFactory::create_terminator();
        let handle = ProcessHandle::spawn(spec("sleep 10"), false).unwrap();
        assert!(handle.is_running());

        assert!(handle.force_stop(terminator.as_ref(), KillMode::default()));
        assert_eq!(handle.state(), ProcessState::Killed);
        assert_eq!(
            handle.wait_timeout(Duration::from_secs(5)).await,
            Some(ProcessState::Killed)
        );

        // Second attempt is a no-op
        assert!(!handle.force_stop(terminator.as_ref(), KillMode::default()));
    }

    #[tokio::test]
    async fn test_external_signal_reports_shell_code() {
        let terminator = PlatformTerminatorFactory::create_terminator();
        let handle = ProcessHandle::spawn(spec("sleep 10"), false).unwrap();

        terminator.terminate_gracefully(handle.pid());
        assert_eq!(
            handle.wait_timeout(Duration::from_secs(5)).await,
            Some(ProcessState::Exited(128 + 15))
        );
    }

    #[tokio::test]
    async fn test_requested_exit_is_killed() {
        let terminator = PlatformTerminatorFactory::create_terminator();
        let handle = ProcessHandle::spawn(spec("sleep 10"), false).unwrap();

        assert_eq!(handle.request_exit(terminator.as_ref()), TerminationResult::Success);
        assert_eq!(
            handle.wait_timeout(Duration::from_secs(5)).await,
            Some(ProcessState::Killed)
        );
        assert_eq!(
            handle.request_exit(terminator.as_ref()),
            TerminationResult::ProcessNotFound
        );
    }

    #[tokio::test]
    async fn test_clones_share_state() {
        let handle = ProcessHandle::spawn(spec("true"), false).unwrap();
        let clone = handle.clone();
        handle.wait().await;
        assert_eq!(clone.state(), ProcessState::Exited(0));
        assert_eq!(clone.pid(), handle.pid());
    }

    #[tokio::test]
    async fn test_spawn_failure_is_io_error() {
        let err = ProcessHandle::spawn(spec("nonexistent-binary-xyz"), false).unwrap_err();
        assert_eq!(err.kind(), std::io::ErrorKind::NotFound);
    }
}

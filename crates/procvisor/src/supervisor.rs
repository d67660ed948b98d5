use crate::exit_hook::ExitHook;
use crate::factory::PlatformTerminatorFactory;
use crate::handle::{KillMode, ProcessHandle};
use crate::stop::{Shared, Stopper};
use procvisor_core::{
    ProcessId, ProcessSpec, ProcessState, ProcessTermination, StartOptions, SupervisorConfig,
    SupervisorError,
};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Result of one `start` call: the handles it spawned and the stop callable
#[derive(Debug)]
pub struct Started {
    pub handles: Vec<ProcessHandle>,
    pub stopper: Stopper,
}

impl Started {
    /// Force-kill every child of the supervisor, see [`Stopper::stop`]
    pub fn stop(&self) {
        self.stopper.stop();
    }

    pub fn pids(&self) -> Vec<ProcessId> {
        self.handles.iter().map(ProcessHandle::pid).collect()
    }
}

/// Owns a set of child processes and their coordinated shutdown.
///
/// Handles are kept in spawn order. The first `start` call registers an exit
/// hook shared with every [`Started`] and [`Stopper`] handed out afterwards;
/// once the last of them is dropped, every child still running gets
/// force-killed. Supervisors are independent of each other: stopping one never
/// touches children of another.
pub struct Supervisor {
    config: SupervisorConfig,
    shared: Arc<Shared>,
    exit_hook: Option<Arc<ExitHook>>,
}

impl Default for Supervisor {
    fn default() -> Self {
        Self::new()
    }
}

impl Supervisor {
    pub fn new() -> Self {
        Self::with_config(SupervisorConfig::default())
    }

    pub fn with_config(config: SupervisorConfig) -> Self {
        Self::with_terminator(config, PlatformTerminatorFactory::create_terminator())
    }

    /// Create a supervisor that signals processes through `terminator`
    pub fn with_terminator(
        config: SupervisorConfig,
        terminator: Arc<dyn ProcessTermination>,
    ) -> Self {
        let mode = KillMode {
            process_group: config.process_group,
            kill_descendants: config.kill_descendants,
        };
        debug!(
            supervisor = %config.name,
            platform = terminator.platform_name(),
            "Created supervisor"
        );
        Self {
            shared: Arc::new(Shared::new(config.name.clone(), mode, terminator)),
            config,
            exit_hook: None,
        }
    }

    pub fn config(&self) -> &SupervisorConfig {
        &self.config
    }

    /// Spawn one process per spec, in order.
    ///
    /// A spawn failure is returned as [`SupervisorError::Spawn`] carrying the
    /// index of the failing spec. Children spawned before it keep running
    /// unless `rollback_on_spawn_failure` is configured; either way they stay
    /// tracked by this supervisor and covered by its exit hook.
    ///
    /// With `options.wait` the call returns only once every child spawned by
    /// it has exited, or fails with [`SupervisorError::WaitTimeout`] when
    /// `options.wait_timeout_ms` elapses first.
    pub async fn start<I>(
        &mut self,
        specs: I,
        options: StartOptions,
    ) -> Result<Started, SupervisorError>
    where
        I: IntoIterator<Item = ProcessSpec>,
    {
        let specs: Vec<Arc<ProcessSpec>> = specs.into_iter().map(Arc::new).collect();
        info!(
            supervisor = %self.config.name,
            count = specs.len(),
            wait = options.wait,
            "Starting processes"
        );

        let mut spawned = Vec::with_capacity(specs.len());
        for (index, spec) in specs.into_iter().enumerate() {
            match ProcessHandle::spawn(spec.clone(), self.config.process_group) {
                Ok(handle) => {
                    info!(
                        supervisor = %self.config.name,
                        index,
                        pid = %handle.pid(),
                        name = spec.display_name(),
                        argv = ?spec.argv(),
                        "Spawned process"
                    );
                    self.shared.push(handle.clone());
                    spawned.push(handle);
                }
                Err(source) => {
                    error!(
                        supervisor = %self.config.name,
                        index,
                        name = spec.display_name(),
                        "Failed to spawn process: {source}"
                    );
                    self.register_exit_hook();
                    if self.config.rollback_on_spawn_failure && !spawned.is_empty() {
                        warn!(
                            supervisor = %self.config.name,
                            count = spawned.len(),
                            "Rolling back processes spawned before the failure"
                        );
                        for handle in &spawned {
                            self.shared.kill(handle);
                        }
                    }
                    return Err(SupervisorError::Spawn {
                        index,
                        name: spec.display_name().to_string(),
                        program: spec.command.clone(),
                        source,
                    });
                }
            }
        }

        self.register_exit_hook();

        if options.wait {
            wait_for(&spawned, options.wait_timeout()).await?;
        }

        Ok(Started {
            handles: spawned,
            stopper: self.stopper(),
        })
    }

    /// A stop callable acting on every child of this supervisor
    pub fn stopper(&self) -> Stopper {
        Stopper::new(self.shared.clone(), self.exit_hook.clone())
    }

    /// Force-kill every running child, see [`Stopper::stop`]
    pub fn stop(&self) {
        self.stopper().stop();
    }

    /// Graceful-then-forceful stop, see [`Stopper::shutdown`]
    pub async fn shutdown(&self, grace: Duration) {
        self.stopper().shutdown(grace).await;
    }

    /// Wait for every child of this supervisor, across all `start` calls
    pub async fn wait_all(
        &self,
        timeout: Option<Duration>,
    ) -> Result<Vec<ProcessState>, SupervisorError> {
        let handles = self.shared.snapshot();
        wait_for(&handles, timeout).await?;
        Ok(handles.iter().map(ProcessHandle::state).collect())
    }

    /// All handles in spawn order
    pub fn handles(&self) -> Vec<ProcessHandle> {
        self.shared.snapshot()
    }

    pub fn running_count(&self) -> usize {
        self.shared.running_count()
    }

    pub fn exit_hook_registered(&self) -> bool {
        self.exit_hook.is_some()
    }

    /// Leave the children running when the last owner of the exit hook goes
    /// away. Explicit `stop` calls keep working.
    pub fn disarm_exit_hook(&self) {
        if let Some(hook) = &self.exit_hook {
            hook.disarm();
        }
    }

    /// Whether dropping the last owner will stop the children
    pub fn exit_hook_armed(&self) -> bool {
        self.exit_hook.as_ref().is_some_and(|hook| hook.is_armed())
    }

    fn register_exit_hook(&mut self) {
        if self.exit_hook.is_none() {
            self.exit_hook = Some(ExitHook::register(self.shared.clone()));
        }
    }
}

async fn wait_for(
    handles: &[ProcessHandle],
    timeout: Option<Duration>,
) -> Result<(), SupervisorError> {
    let all_exited = async {
        for handle in handles {
            let state = handle.wait().await;
            debug!(pid = %handle.pid(), %state, "Process finished");
        }
    };

    match timeout {
        None => {
            all_exited.await;
            Ok(())
        }
        Some(timeout) => tokio::time::timeout(timeout, all_exited)
            .await
            .map_err(|_| SupervisorError::WaitTimeout {
                timeout,
                running: handles.iter().filter(|h| h.is_running()).count(),
            }),
    }
}

/// Start `specs` under a fresh supervisor.
///
/// The returned [`Started`] shares the exit hook with the supervisor, so the
/// children keep running until both are dropped. On error the fresh
/// supervisor is dropped, which stops anything spawned before the failure.
pub async fn start<I>(
    specs: I,
    options: StartOptions,
) -> Result<(Supervisor, Started), SupervisorError>
where
    I: IntoIterator<Item = ProcessSpec>,
{
    let mut supervisor = Supervisor::new();
    let started = supervisor.start(specs, options).await?;
    Ok((supervisor, started))
}

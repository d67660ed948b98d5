//! Scope-bound cleanup for supervised children.
//!
//! A supervisor registers exactly one [`ExitHook`] on its first `start` call.
//! The hook is shared: the supervisor, every `Started` result and every
//! stopper handed out after registration hold it, and it force-kills the
//! remaining children when the last of them goes away. That covers the end of
//! `main`, an early `?` return, and a panic unwinding the stack.
//!
//! Known limitation: `std::process::exit`, `abort`, and SIGKILL of the parent
//! skip destructors and therefore skip the hook. The children are spawned with
//! `kill_on_drop`, which covers runtime teardown but not those paths either.
//! Binaries that want Ctrl-C/SIGTERM coverage install a signal handler that
//! calls [`Stopper::stop`](crate::Stopper::stop) (see the `procvisor` CLI).

use crate::stop::Shared;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{debug, warn};

pub(crate) struct ExitHook {
    shared: Arc<Shared>,
    armed: AtomicBool,
}

impl ExitHook {
    pub fn register(shared: Arc<Shared>) -> Arc<Self> {
        debug!(supervisor = %shared.name, "Registered exit hook");
        Arc::new(Self {
            shared,
            armed: AtomicBool::new(true),
        })
    }

    /// Keep the hook registered but make it do nothing when it fires
    pub fn disarm(&self) {
        if self.armed.swap(false, Ordering::SeqCst) {
            debug!(supervisor = %self.shared.name, "Disarmed exit hook");
        }
    }

    pub fn is_armed(&self) -> bool {
        self.armed.load(Ordering::SeqCst)
    }
}

impl Drop for ExitHook {
    fn drop(&mut self) {
        if !self.is_armed() {
            return;
        }
        let running = self.shared.running_count();
        if running > 0 {
            warn!(
                supervisor = %self.shared.name,
                running, "Exit hook stopping processes still running"
            );
        }
        self.shared.stop_all();
    }
}

//! procvisor - launch a set of child processes and guarantee their cleanup
//!
//! ```rust,no_run
//! use procvisor::{ProcessSpec, StartOptions, Supervisor};
//!
//! # async fn run() -> anyhow::Result<()> {
//! let specs = (9000..9003)
//!     .map(|port| ProcessSpec::shell(&format!("python3 -m http.server {port}")))
//!     .collect::<Result<Vec<_>, _>>()?;
//!
//! let mut supervisor = Supervisor::new();
//! let started = supervisor.start(specs, StartOptions::default()).await?;
//! println!("running: {:?}", started.pids());
//!
//! // ... talk to the children ...
//!
//! started.stop();
//! # Ok(())
//! # }
//! ```

mod exit_hook;
mod factory;
mod handle;
mod logging;
mod stop;
mod supervisor;

pub use factory::PlatformTerminatorFactory;
pub use handle::ProcessHandle;
pub use logging::init_logging;
pub use stop::Stopper;
pub use supervisor::{Started, Supervisor, start};

// Re-export core functionality
pub use procvisor_core::*;

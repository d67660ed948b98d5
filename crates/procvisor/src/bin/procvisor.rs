use anyhow::{Context, Result, bail};
use clap::Parser;
use procvisor::{
    LaunchPlan, ProcessSpec, ProcessState, StartOptions, Supervisor, SupervisorConfig,
    SupervisorError, init_logging,
};
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;
use tracing::{info, warn};

/// Launch a set of processes and stop them together
#[derive(Parser, Debug)]
#[command(name = "procvisor", version)]
struct Cli {
    /// Return once every process has exited on its own
    #[arg(long)]
    wait: bool,

    /// Give up waiting after this many milliseconds and stop everything
    #[arg(long, value_name = "MS", requires = "wait")]
    timeout_ms: Option<u64>,

    /// On timeout, send SIGTERM and wait this long before force-killing
    #[arg(long, value_name = "MS", requires = "timeout_ms")]
    grace_ms: Option<u64>,

    /// JSON launch plan; COMMANDs are appended to its processes
    #[arg(long, value_name = "FILE")]
    plan: Option<PathBuf>,

    /// Stop already started processes when a later one fails to spawn
    #[arg(long)]
    rollback: bool,

    /// Start every process in its own process group
    #[arg(long)]
    process_group: bool,

    /// Also kill descendants of each process when stopping
    #[arg(long)]
    kill_descendants: bool,

    /// Emit logs as JSON
    #[arg(long)]
    json_logs: bool,

    /// Shell command lines, one process each
    #[arg(value_name = "COMMAND")]
    commands: Vec<String>,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging("info", cli.json_logs);

    match run(cli).await {
        Ok(code) => code,
        Err(e) => {
            eprintln!("procvisor: {e:#}");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> Result<ExitCode> {
    let (config, mut options, specs) = load(&cli)?;
    if specs.is_empty() {
        bail!("nothing to launch: pass at least one COMMAND or a --plan");
    }
    if cli.wait {
        options.wait = true;
    }

    let mut supervisor = Supervisor::with_config(config);

    info!("Creating the signal handler");
    let stopper = supervisor.stopper();
    ctrlc::set_handler(move || {
        warn!("Termination requested, stopping processes");
        stopper.stop();
        std::process::exit(130);
    })
    .context("could not install signal handler")?;

    let started = match supervisor.start(specs, options.clone()).await {
        Ok(started) => started,
        Err(SupervisorError::WaitTimeout { timeout, running }) => {
            warn!(?timeout, running, "Processes did not finish in time, stopping them");
            match cli.grace_ms {
                Some(ms) => supervisor.shutdown(Duration::from_millis(ms)).await,
                None => supervisor.stop(),
            }
            return Ok(ExitCode::from(124));
        }
        Err(e) => return Err(e).context("failed to start processes"),
    };

    for handle in &started.handles {
        println!("{}\t{}", handle.pid(), handle.name());
    }

    let states: Vec<ProcessState> = if options.wait {
        started.handles.iter().map(|h| h.state()).collect()
    } else {
        supervisor.wait_all(None).await?
    };

    Ok(report(&started.handles, &states))
}

fn load(cli: &Cli) -> Result<(SupervisorConfig, StartOptions, Vec<ProcessSpec>)> {
    let (mut config, mut options, mut specs) = match &cli.plan {
        Some(path) => {
            let plan = LaunchPlan::from_path(path)?;
            let specs = plan.specs()?;
            (plan.supervisor, plan.options, specs)
        }
        None => (SupervisorConfig::default(), StartOptions::default(), Vec::new()),
    };

    let base = specs.len();
    for (offset, line) in cli.commands.iter().enumerate() {
        let spec = ProcessSpec::shell(line).map_err(|source| SupervisorError::InvalidSpec {
            index: base + offset,
            source,
        })?;
        specs.push(spec);
    }

    config.rollback_on_spawn_failure |= cli.rollback;
    config.process_group |= cli.process_group;
    config.kill_descendants |= cli.kill_descendants;
    if let Some(ms) = cli.timeout_ms {
        options.wait_timeout_ms = Some(ms);
    }

    Ok((config, options, specs))
}

fn report(handles: &[procvisor::ProcessHandle], states: &[ProcessState]) -> ExitCode {
    let mut failed = false;
    for (handle, state) in handles.iter().zip(states) {
        match state {
            ProcessState::Exited(0) => {
                info!(pid = %handle.pid(), name = handle.name(), "Finished")
            }
            other => {
                failed = true;
                warn!(
                    pid = %handle.pid(),
                    name = handle.name(),
                    state = %other,
                    "Finished unsuccessfully"
                );
            }
        }
    }
    if failed {
        ExitCode::FAILURE
    } else {
        ExitCode::SUCCESS
    }
}

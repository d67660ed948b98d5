use anyhow::{Context, Result};
use backon::{ExponentialBuilder, Retryable};
use procvisor::{ProcessSpec, StartOptions, Supervisor, SupervisorConfig, init_logging};
use std::time::Duration;
use tracing::{info, warn};

const PORTS: [u16; 3] = [8701, 8702, 8703];
const STARTUP_DELAY: Duration = Duration::from_secs(1);

fn worker(port: u16) -> Result<ProcessSpec> {
    let spec = ProcessSpec::builder()
        .name(format!("http-{port}"))
        .command("python3")
        .args(["-m", "http.server", &port.to_string()])
        .build()?;
    Ok(spec)
}

#[tokio::main]
async fn main() -> Result<()> {
    init_logging("info", false);

    let specs = PORTS.into_iter().map(worker).collect::<Result<Vec<_>>>()?;
    let config = SupervisorConfig::builder().name("http-workers").build()?;
    let mut supervisor = Supervisor::with_config(config);

    let started = supervisor
        .start(specs, StartOptions::detached())
        .await
        .context("failed to start http workers")?;
    for handle in &started.handles {
        info!(pid = %handle.pid(), name = handle.name(), "Worker up");
    }

    tokio::time::sleep(STARTUP_DELAY).await;

    let url = format!("http://127.0.0.1:{}/", PORTS[0]);
    let fetch = || async { reqwest::get(&url).await?.error_for_status() };
    let retry = ExponentialBuilder::default()
        .with_min_delay(Duration::from_millis(100))
        .with_max_delay(Duration::from_secs(2))
        .with_max_times(5);

    match fetch
        .retry(retry)
        .notify(|err, after| warn!(%url, ?after, "Request failed, retrying: {err}"))
        .await
    {
        Ok(response) => info!(%url, status = %response.status(), "Worker answered"),
        Err(e) => warn!(%url, "Worker never answered: {e}"),
    }

    started.stop();
    info!(running = supervisor.running_count(), "Done");
    Ok(())
}

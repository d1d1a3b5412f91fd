use std::path::PathBuf;

use anyhow::{Context, Result};
use open_energy_scheduler::config::Config;
use open_energy_scheduler::controller::SchedulingService;
use open_energy_scheduler::flex::ScheduleRequest;
use open_energy_scheduler::telemetry;
use tracing::info;

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cfg = Config::load()?;
    telemetry::init_tracing(&cfg.logging);

    let path: PathBuf = std::env::args_os()
        .nth(1)
        .map(PathBuf::from)
        .context("usage: open-energy-scheduler <request.json>")?;
    let body = std::fs::read_to_string(&path)
        .with_context(|| format!("reading {}", path.display()))?;
    let request: ScheduleRequest = serde_json::from_str(&body)
        .with_context(|| format!("parsing {}", path.display()))?;

    let service = SchedulingService::from_config(&cfg)?;
    info!(
        request = %path.display(),
        solver = %cfg.solver.backend,
        "scheduling"
    );
    let schedule = service.submit(request).await?;
    println!("{}", serde_json::to_string_pretty(&schedule)?);
    Ok(())
}

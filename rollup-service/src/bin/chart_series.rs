use anyhow::{anyhow, bail, Result};
use energy_client::domain::{BucketWindow, Resolution};
use rollup_service::{
    bootstrap::Services,
    config::AppConfig,
    series::{to_series, SeriesValue},
};
use std::env;

/// Prints the chart payload for the latest buckets of one location.
#[tokio::main]
async fn main() -> Result<()> {
    rollup_service::observability::init_tracing();

    let args: Vec<String> = env::args().collect();
    if args.len() < 4 {
        bail!("usage: chart_series <location> <five-minute|daily> <channel[:net|hi|lo]|charge> [limit]");
    }
    let location = args[1].to_ascii_uppercase();
    let resolution: Resolution = args[2].parse().map_err(|e: String| anyhow!(e))?;
    let value: SeriesValue = args[3].parse().map_err(|e: String| anyhow!(e))?;

    let cfg = AppConfig::load()?;
    let limit = match args.get(4) {
        Some(l) => l.parse()?,
        None => cfg.query.daily_history_limit,
    };

    let services = Services::connect(&cfg).await?;
    let mut buckets = services
        .engine
        .history_view(&location, resolution, &BucketWindow::latest(limit))
        .await?;
    // Charts plot left to right.
    buckets.reverse();

    println!("{}", to_series(&buckets, value).to_json()?);
    Ok(())
}

use anyhow::{Context, Result};
use rollup_service::{
    bootstrap::Services,
    config::AppConfig,
    metrics_server, observability,
    pipeline::Pipeline,
    sinks::RollupSink,
    sources::HttpReadingsSource,
    transform::ReadingValidation,
};

#[tokio::main]
async fn main() -> Result<()> {
    observability::init_tracing();

    let cfg = AppConfig::load()?;
    let ingest = cfg
        .ingest
        .as_ref()
        .context("rollup-service requires an [ingest] section")?;

    if let Some(metrics_cfg) = &cfg.metrics {
        metrics_server::init(&metrics_cfg.bind_addr).await?;
    }

    let services = Services::connect(&cfg).await?;

    let source = HttpReadingsSource::new(&ingest.http_bind_addr, ingest.channel_capacity).await?;
    let sink = RollupSink::new(services.store.clone(), services.updater.clone(), services.store_policy);

    Pipeline::new(source, sink)
        .with_transform(ReadingValidation)
        .run()
        .await?;

    Ok(())
}

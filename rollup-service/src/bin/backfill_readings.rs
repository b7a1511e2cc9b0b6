use anyhow::{bail, Result};
use energy_client::domain::Reading;
use rollup_service::{
    bootstrap::Services,
    config::AppConfig,
    pipeline::{Pipeline, Source},
    sinks::RollupSink,
    sources::{ReadingDelimitedFileSource, ReadingNdjsonFileSource},
    transform::ReadingValidation,
};
use std::env;

const USAGE: &str = "usage: backfill_readings <file> [--delimiter <char>]";

/// Files ending in `.ndjson` or `.jsonl` are read as NDJSON; anything else
/// is delimited text (`,` unless `--delimiter` is given, `|` for `.dat`).
fn parse_args(args: &[String]) -> Result<(String, Option<u8>)> {
    let mut path = None;
    let mut delimiter = None;
    let mut it = args.iter().skip(1);
    while let Some(arg) = it.next() {
        match arg.as_str() {
            "--delimiter" => {
                let Some(d) = it.next() else { bail!(USAGE) };
                match d.as_bytes() {
                    [b] => delimiter = Some(*b),
                    _ if d == "\\t" => delimiter = Some(b'\t'),
                    _ => bail!("delimiter must be a single byte, got '{d}'"),
                }
            }
            other if path.is_none() => path = Some(other.to_string()),
            _ => bail!(USAGE),
        }
    }
    match path {
        Some(p) => Ok((p, delimiter)),
        None => bail!(USAGE),
    }
}

async fn run<S: Source<Reading> + 'static>(source: S, sink: RollupSink) -> Result<()> {
    Pipeline::new(source, sink)
        .with_transform(ReadingValidation)
        .run()
        .await?;
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    rollup_service::observability::init_tracing();

    let args: Vec<String> = env::args().collect();
    let (path, delimiter) = parse_args(&args)?;

    // ROLLUP_CONFIG may point at a backfill-specific file.
    let cfg = AppConfig::load()?;
    let services = Services::connect(&cfg).await?;
    let sink = RollupSink::new(services.store.clone(), services.updater.clone(), services.store_policy);

    tracing::info!(%path, "starting backfill");
    let lower = path.to_ascii_lowercase();
    if delimiter.is_none() && (lower.ends_with(".ndjson") || lower.ends_with(".jsonl")) {
        run(ReadingNdjsonFileSource::new(&path), sink).await
    } else {
        let d = delimiter.unwrap_or(if lower.ends_with(".dat") { b'|' } else { b',' });
        run(ReadingDelimitedFileSource::with_delimiter(&path, d), sink).await
    }
}

pub mod bootstrap;
pub mod config;
pub mod metrics_server;
pub mod observability;
pub mod pipeline;
pub mod query;
pub mod retry;
pub mod rollup;
pub mod series;
pub mod sinks;
pub mod sources;
pub mod transform;

#[cfg(test)]
mod testing;

pub use pipeline::{Envelope, Pipeline};
pub use query::QueryEngine;
pub use rollup::RollupUpdater;

pub mod rollup;

pub use rollup::{RollupSink, SinkReport};

//! Persisted readings and bucket aggregates.
//!
//! `BucketStore` is the single seam between the rollup/query layers and the
//! backing store. Implementations must apply each `upsert_*` call as one
//! unit of work across all given keys, together with the record of its fold
//! id, and must enforce `BucketWindow` limits themselves; callers never
//! re-bound the returned sequence.

pub mod memory;
pub mod pg;

use time::OffsetDateTime;

use crate::{
    domain::{
        Bucket, BucketKey, BucketWindow, Channel, ChargeFold, ChargeSample, EnergyCounters,
        InstantReading, PowerFold, Reading, Resolution,
    },
    error::StoreError,
};

pub use memory::MemoryBucketStore;
pub use pg::PgBucketStore;

#[async_trait::async_trait]
pub trait BucketStore: Send + Sync {
    /// Inserts a raw reading. Returns `false` when an identical reading was
    /// already recorded.
    async fn record_reading(&self, reading: &Reading) -> Result<bool, StoreError>;

    async fn record_charge(&self, charge: &ChargeSample) -> Result<(), StoreError>;

    /// Most recent raw reading for `location`.
    async fn latest_instant(&self, location: &str) -> Result<InstantReading, StoreError>;

    async fn latest_charge(&self, location: &str) -> Result<ChargeSample, StoreError>;

    /// Energy counters of the newest raw reading strictly before `before`
    /// that carries counters for `channel`.
    async fn previous_counters(
        &self,
        location: &str,
        channel: Channel,
        before: OffsetDateTime,
    ) -> Result<Option<EnergyCounters>, StoreError>;

    /// Folds into every key unless `fold_id` was already applied. Returns
    /// `false`, writing nothing, for an already applied id.
    async fn upsert_power(
        &self,
        fold_id: &str,
        keys: &[BucketKey],
        fold: &PowerFold,
    ) -> Result<bool, StoreError>;

    async fn upsert_charge(
        &self,
        fold_id: &str,
        keys: &[BucketKey],
        fold: &ChargeFold,
    ) -> Result<bool, StoreError>;

    /// `Latest` windows come back strictly descending by `bucket_start`,
    /// `Range` windows strictly ascending.
    async fn buckets(
        &self,
        location: &str,
        resolution: Resolution,
        window: &BucketWindow,
    ) -> Result<Vec<Bucket>, StoreError>;
}

//! Failure-injecting store used by unit tests.

use std::{
    sync::atomic::{AtomicBool, AtomicU32, Ordering},
    time::Duration,
};

use energy_client::{
    domain::{
        Bucket, BucketKey, BucketWindow, Channel, ChargeFold, ChargeSample, EnergyCounters,
        InstantReading, PowerFold, Reading, Resolution,
    },
    BucketStore, MemoryBucketStore, StoreError,
};
use time::OffsetDateTime;

#[derive(Debug, Default)]
pub struct FlakyStore {
    inner: MemoryBucketStore,
    upsert_passes: AtomicU32,
    upsert_failures: AtomicU32,
    lose_ack: AtomicBool,
    fail_charge: AtomicBool,
    fail_buckets: AtomicBool,
    stall_reads: AtomicBool,
}

impl FlakyStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn inner(&self) -> &MemoryBucketStore {
        &self.inner
    }

    /// The next `n` upserts fail with a transient error.
    pub fn fail_next_upserts(&self, n: u32) {
        self.fail_upserts_after(0, n);
    }

    /// Lets `pass` upserts through, then fails the following `fail`.
    pub fn fail_upserts_after(&self, pass: u32, fail: u32) {
        self.upsert_passes.store(pass, Ordering::SeqCst);
        self.upsert_failures.store(fail, Ordering::SeqCst);
    }

    /// The next upsert is applied but reports a transient error, as when
    /// the connection drops after COMMIT.
    pub fn lose_next_commit_ack(&self) {
        self.lose_ack.store(true, Ordering::SeqCst);
    }

    pub fn fail_charge_reads(&self) {
        self.fail_charge.store(true, Ordering::SeqCst);
    }

    pub fn fail_bucket_reads(&self) {
        self.fail_buckets.store(true, Ordering::SeqCst);
    }

    /// Point reads hang far beyond any test deadline.
    pub fn stall_reads(&self) {
        self.stall_reads.store(true, Ordering::SeqCst);
    }

    fn take_upsert_failure(&self) -> Result<(), StoreError> {
        let passed = self
            .upsert_passes
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if passed {
            return Ok(());
        }
        let failed = self
            .upsert_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failed {
            Err(StoreError::Transient("could not obtain lock on row".to_string()))
        } else {
            Ok(())
        }
    }

    fn take_lost_ack(&self) -> Result<(), StoreError> {
        if self.lose_ack.swap(false, Ordering::SeqCst) {
            return Err(StoreError::Transient(
                "connection closed before commit was acknowledged".to_string(),
            ));
        }
        Ok(())
    }

    async fn maybe_stall(&self) {
        if self.stall_reads.load(Ordering::SeqCst) {
            tokio::time::sleep(Duration::from_secs(3600)).await;
        }
    }
}

#[async_trait::async_trait]
impl BucketStore for FlakyStore {
    async fn record_reading(&self, reading: &Reading) -> Result<bool, StoreError> {
        self.inner.record_reading(reading).await
    }

    async fn record_charge(&self, charge: &ChargeSample) -> Result<(), StoreError> {
        self.inner.record_charge(charge).await
    }

    async fn latest_instant(&self, location: &str) -> Result<InstantReading, StoreError> {
        self.maybe_stall().await;
        self.inner.latest_instant(location).await
    }

    async fn latest_charge(&self, location: &str) -> Result<ChargeSample, StoreError> {
        self.maybe_stall().await;
        if self.fail_charge.load(Ordering::SeqCst) {
            return Err(StoreError::Transient("connection reset by peer".to_string()));
        }
        self.inner.latest_charge(location).await
    }

    async fn previous_counters(
        &self,
        location: &str,
        channel: Channel,
        before: OffsetDateTime,
    ) -> Result<Option<EnergyCounters>, StoreError> {
        self.inner.previous_counters(location, channel, before).await
    }

    async fn upsert_power(
        &self,
        fold_id: &str,
        keys: &[BucketKey],
        fold: &PowerFold,
    ) -> Result<bool, StoreError> {
        self.take_upsert_failure()?;
        let applied = self.inner.upsert_power(fold_id, keys, fold).await?;
        self.take_lost_ack()?;
        Ok(applied)
    }

    async fn upsert_charge(
        &self,
        fold_id: &str,
        keys: &[BucketKey],
        fold: &ChargeFold,
    ) -> Result<bool, StoreError> {
        self.take_upsert_failure()?;
        let applied = self.inner.upsert_charge(fold_id, keys, fold).await?;
        self.take_lost_ack()?;
        Ok(applied)
    }

    async fn buckets(
        &self,
        location: &str,
        resolution: Resolution,
        window: &BucketWindow,
    ) -> Result<Vec<Bucket>, StoreError> {
        if self.fail_buckets.load(Ordering::SeqCst) {
            return Err(StoreError::Backend("relation does not exist".to_string()));
        }
        self.inner.buckets(location, resolution, window).await
    }
}

use std::{
    collections::{HashMap, HashSet},
    sync::{Mutex, MutexGuard, PoisonError},
};

use time::OffsetDateTime;

use super::BucketStore;
use crate::{
    domain::{
        Bucket, BucketKey, BucketWindow, Channel, ChargeFold, ChargeSample, EnergyCounters,
        InstantReading, PowerFold, Reading, Resolution,
    },
    error::StoreError,
};

/// In-process `BucketStore` with the same fold and ordering semantics as
/// `PgBucketStore`. One lock guards all state, so every upsert is atomic
/// across its keys and its fold id.
#[derive(Debug, Default)]
pub struct MemoryBucketStore {
    inner: Mutex<Inner>,
}

#[derive(Debug, Default)]
struct Inner {
    event_ids: HashSet<String>,
    applied_folds: HashSet<String>,
    readings: Vec<Reading>,
    charges: Vec<ChargeSample>,
    buckets: HashMap<BucketKey, Bucket>,
}

impl MemoryBucketStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, Inner>, StoreError> {
        self.inner
            .lock()
            .map_err(|_| StoreError::Backend("memory store lock poisoned".to_string()))
    }

    /// Inspection reads state left behind by a panicked writer too; every
    /// mutation completes before the lock is released.
    fn inspect(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Direct lookup of one bucket.
    pub fn bucket(&self, key: &BucketKey) -> Option<Bucket> {
        self.inspect().buckets.get(key).cloned()
    }

    pub fn bucket_count(&self) -> usize {
        self.inspect().buckets.len()
    }
}

#[async_trait::async_trait]
impl BucketStore for MemoryBucketStore {
    async fn record_reading(&self, reading: &Reading) -> Result<bool, StoreError> {
        let mut inner = self.lock()?;
        if !inner.event_ids.insert(reading.event_id()) {
            return Ok(false);
        }
        inner.readings.push(reading.clone());
        Ok(true)
    }

    async fn record_charge(&self, charge: &ChargeSample) -> Result<(), StoreError> {
        let mut inner = self.lock()?;
        let exists = inner
            .charges
            .iter()
            .any(|c| c.location == charge.location && c.ts == charge.ts);
        if !exists {
            inner.charges.push(charge.clone());
        }
        Ok(())
    }

    async fn latest_instant(&self, location: &str) -> Result<InstantReading, StoreError> {
        let inner = self.lock()?;
        inner
            .readings
            .iter()
            .filter(|r| r.location == location)
            .max_by_key(|r| r.ts)
            .map(InstantReading::from)
            .ok_or_else(|| StoreError::NotFound(format!("no raw reading for location {location}")))
    }

    async fn latest_charge(&self, location: &str) -> Result<ChargeSample, StoreError> {
        let inner = self.lock()?;
        inner
            .charges
            .iter()
            .filter(|c| c.location == location)
            .max_by_key(|c| c.ts)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(format!("no charge reading for location {location}")))
    }

    async fn previous_counters(
        &self,
        location: &str,
        channel: Channel,
        before: OffsetDateTime,
    ) -> Result<Option<EnergyCounters>, StoreError> {
        let inner = self.lock()?;
        Ok(inner
            .readings
            .iter()
            .filter(|r| r.location == location && r.ts < before)
            .filter_map(|r| r.channel(channel).energy.map(|e| (r.ts, e)))
            .max_by_key(|(ts, _)| *ts)
            .map(|(_, e)| e))
    }

    async fn upsert_power(
        &self,
        fold_id: &str,
        keys: &[BucketKey],
        fold: &PowerFold,
    ) -> Result<bool, StoreError> {
        let mut inner = self.lock()?;
        if !inner.applied_folds.insert(fold_id.to_string()) {
            return Ok(false);
        }
        for key in keys {
            inner
                .buckets
                .entry(key.clone())
                .or_insert_with(|| Bucket::empty(key))
                .apply_power(fold);
        }
        Ok(true)
    }

    async fn upsert_charge(
        &self,
        fold_id: &str,
        keys: &[BucketKey],
        fold: &ChargeFold,
    ) -> Result<bool, StoreError> {
        let mut inner = self.lock()?;
        if !inner.applied_folds.insert(fold_id.to_string()) {
            return Ok(false);
        }
        for key in keys {
            inner
                .buckets
                .entry(key.clone())
                .or_insert_with(|| Bucket::empty(key))
                .apply_charge(fold);
        }
        Ok(true)
    }

    async fn buckets(
        &self,
        location: &str,
        resolution: Resolution,
        window: &BucketWindow,
    ) -> Result<Vec<Bucket>, StoreError> {
        let inner = self.lock()?;
        let mut rows: Vec<Bucket> = inner
            .buckets
            .values()
            .filter(|b| b.location == location && b.resolution == resolution)
            .filter(|b| window.admits(b.bucket_start))
            .cloned()
            .collect();

        match window {
            BucketWindow::Latest { .. } => rows.sort_by(|a, b| b.bucket_start.cmp(&a.bucket_start)),
            BucketWindow::Range { .. } => rows.sort_by_key(|b| b.bucket_start),
        }
        if let Some(limit) = window.limit() {
            rows.truncate(limit as usize);
        }
        Ok(rows)
    }
}

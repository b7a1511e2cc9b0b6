//! Folds incoming samples into their bucket aggregates.

use std::sync::Arc;

use energy_client::{
    domain::{BucketKey, ChargeFold, ChargeSample, PowerFold, Reading, Resolution, Sample},
    BucketStore,
};

use crate::{
    config::RollupConfig,
    retry::{RetryError, RetryPolicy},
};

#[derive(thiserror::Error, Debug)]
pub enum RollupError {
    #[error("invalid sample for {location}: {reason}")]
    InvalidSample { location: String, reason: String },
    #[error(transparent)]
    Store(#[from] RetryError),
}

impl RollupError {
    /// True when the caller may resubmit the same sample later.
    pub fn is_retryable(&self) -> bool {
        match self {
            RollupError::InvalidSample { .. } => false,
            RollupError::Store(e) => e.is_retryable(),
        }
    }
}

/// Applies samples to every configured resolution.
///
/// All resolutions for one sample are written in a single store call, so a
/// fold either lands everywhere or nowhere. Each sample folds at most once:
/// a retry after an unacknowledged commit, or a replay of a sample already
/// folded, is reported as `Ok(false)`.
#[derive(Clone)]
pub struct RollupUpdater {
    store: Arc<dyn BucketStore>,
    resolutions: Vec<Resolution>,
    policy: RetryPolicy,
}

impl RollupUpdater {
    pub fn new(store: Arc<dyn BucketStore>, resolutions: Vec<Resolution>, policy: RetryPolicy) -> Self {
        Self {
            store,
            resolutions,
            policy,
        }
    }

    pub fn from_config(store: Arc<dyn BucketStore>, cfg: &RollupConfig) -> Self {
        Self::new(
            store,
            cfg.resolutions.clone(),
            RetryPolicy {
                max_retries: cfg.max_retries,
                backoff: cfg.retry_backoff(),
                deadline: cfg.deadline(),
            },
        )
    }

    pub fn resolutions(&self) -> &[Resolution] {
        &self.resolutions
    }

    fn keys_for(&self, location: &str, ts: time::OffsetDateTime) -> Vec<BucketKey> {
        self.resolutions
            .iter()
            .map(|r| BucketKey::containing(location, *r, ts))
            .collect()
    }

    pub async fn fold(&self, sample: &Sample) -> Result<bool, RollupError> {
        if !sample.power.is_finite() {
            return Err(RollupError::InvalidSample {
                location: sample.location.clone(),
                reason: format!("non-finite {} power", sample.channel),
            });
        }

        let delta = match sample.energy {
            Some(counters) => {
                let previous = self
                    .policy
                    .run("previous_counters", || {
                        self.store
                            .previous_counters(&sample.location, sample.channel, sample.ts)
                    })
                    .await?;
                counters.delta_since(previous.as_ref())
            }
            None => Default::default(),
        };

        let fold = PowerFold {
            channel: sample.channel,
            ts: sample.ts,
            power: sample.power,
            imported: delta.imported,
            exported: delta.exported,
        };
        let keys = self.keys_for(&sample.location, sample.ts);
        let fold_id = sample.fold_id();
        let applied = self
            .policy
            .run("upsert_power", || self.store.upsert_power(&fold_id, &keys, &fold))
            .await
            .inspect_err(|_| {
                metrics::counter!("rollup_fold_failures_total", "kind" => "power").increment(1);
            })?;

        if !applied {
            metrics::counter!("rollup_folds_skipped_total", "kind" => "power").increment(1);
            tracing::debug!(
                location = %sample.location,
                channel = %sample.channel,
                fold_id = %fold_id,
                "power sample already folded"
            );
            return Ok(false);
        }
        metrics::counter!("rollup_folds_total", "kind" => "power").increment(1);
        tracing::debug!(
            location = %sample.location,
            channel = %sample.channel,
            power = sample.power,
            buckets = keys.len(),
            "folded power sample"
        );
        Ok(true)
    }

    pub async fn fold_charge(&self, charge: &ChargeSample) -> Result<bool, RollupError> {
        let pct = charge.percent_charged;
        if !(0.0..=100.0).contains(&pct) {
            return Err(RollupError::InvalidSample {
                location: charge.location.clone(),
                reason: format!("percent_charged {pct} outside [0, 100]"),
            });
        }

        let fold = ChargeFold {
            ts: charge.ts,
            percent_charged: pct,
        };
        let keys = self.keys_for(&charge.location, charge.ts);
        let fold_id = charge.fold_id();
        let applied = self
            .policy
            .run("upsert_charge", || self.store.upsert_charge(&fold_id, &keys, &fold))
            .await
            .inspect_err(|_| {
                metrics::counter!("rollup_fold_failures_total", "kind" => "charge").increment(1);
            })?;

        let kind = if applied { "rollup_folds_total" } else { "rollup_folds_skipped_total" };
        metrics::counter!(kind, "kind" => "charge").increment(1);
        Ok(applied)
    }

    /// Folds every channel of a combined reading, then its charge level.
    /// Returns how many folds were newly applied.
    ///
    /// A failure leaves earlier channels folded; folding the same reading
    /// again applies only what is still missing.
    pub async fn fold_reading(&self, reading: &Reading) -> Result<usize, RollupError> {
        let mut applied = 0;
        for sample in reading.samples() {
            if self.fold(&sample).await? {
                applied += 1;
            }
        }
        if let Some(charge) = reading.charge_sample() {
            if self.fold_charge(&charge).await? {
                applied += 1;
            }
        }
        Ok(applied)
    }
}

use std::sync::Arc;

use energy_client::{domain::Reading, BucketStore};
use futures::StreamExt;

use crate::{
    pipeline::{Envelope, EnvelopeStream, PipelineError, Sink},
    retry::RetryPolicy,
    rollup::RollupUpdater,
};

/// Records each reading's raw row and folds it into its buckets.
///
/// Folds are idempotent per sample, so a replayed reading only applies what
/// an earlier attempt left unfolded. A reading with nothing left to fold is
/// a duplicate. Fold failures are logged with the reading's event id and
/// skipped; resubmitting the reading completes it.
pub struct RollupSink {
    store: Arc<dyn BucketStore>,
    updater: RollupUpdater,
    policy: RetryPolicy,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SinkReport {
    pub folded: u64,
    pub duplicates: u64,
    pub failed: u64,
    pub rejected: u64,
}

enum Outcome {
    Folded,
    Duplicate,
}

impl RollupSink {
    pub fn new(store: Arc<dyn BucketStore>, updater: RollupUpdater, policy: RetryPolicy) -> Self {
        Self {
            store,
            updater,
            policy,
        }
    }

    async fn handle(&self, env: &Envelope<Reading>) -> Result<Outcome, PipelineError> {
        let reading = &env.payload;

        let inserted = self
            .policy
            .run("record_reading", || self.store.record_reading(reading))
            .await
            .map_err(|e| PipelineError::Sink(e.to_string()))?;
        if let Some(charge) = reading.charge_sample() {
            self.policy
                .run("record_charge", || self.store.record_charge(&charge))
                .await
                .map_err(|e| PipelineError::Sink(e.to_string()))?;
        }

        let applied = self
            .updater
            .fold_reading(reading)
            .await
            .map_err(|e| PipelineError::Sink(e.to_string()))?;
        if applied == 0 {
            return Ok(Outcome::Duplicate);
        }
        if !inserted {
            tracing::info!(
                location = %reading.location,
                applied,
                "completed folds of a previously recorded reading"
            );
        }

        if let Ok(dur) = std::time::SystemTime::now().duration_since(env.received_at) {
            metrics::histogram!("ingest_end_to_end_latency_seconds").record(dur.as_secs_f64());
        }
        Ok(Outcome::Folded)
    }

    /// Drains `input`, returning what happened to each item.
    pub async fn drain(&self, mut input: EnvelopeStream<Reading>) -> SinkReport {
        let mut report = SinkReport::default();

        while let Some(item) = input.next().await {
            let env = match item {
                Ok(env) => env,
                Err(e) => {
                    tracing::warn!(error = %e, "reading rejected upstream of rollup sink");
                    report.rejected += 1;
                    continue;
                }
            };

            match self.handle(&env).await {
                Ok(Outcome::Folded) => report.folded += 1,
                Ok(Outcome::Duplicate) => {
                    metrics::counter!("rollup_readings_duplicate_total").increment(1);
                    tracing::debug!(location = %env.payload.location, "replayed reading skipped");
                    report.duplicates += 1;
                }
                Err(e) => {
                    tracing::error!(
                        error = %e,
                        location = %env.payload.location,
                        event_id = %env.payload.event_id(),
                        "failed to fold reading"
                    );
                    report.failed += 1;
                }
            }
        }

        report
    }
}

#[async_trait::async_trait]
impl Sink<Reading> for RollupSink {
    async fn run(&self, input: EnvelopeStream<Reading>) -> Result<(), PipelineError> {
        let report = self.drain(input).await;
        tracing::info!(
            folded = report.folded,
            duplicates = report.duplicates,
            failed = report.failed,
            rejected = report.rejected,
            "rollup sink input ended"
        );
        Ok(())
    }
}

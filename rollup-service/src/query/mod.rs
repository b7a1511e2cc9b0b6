//! Read path: instant snapshots, bucket histories and per-location dashboards.

use std::{sync::Arc, time::Duration};

use energy_client::{
    domain::{Bucket, BucketWindow, Channel, ChannelStats, Extrema, InstantReading, Resolution},
    BucketStore, StoreError,
};
use serde::Serialize;
use time::{OffsetDateTime, UtcOffset};

use crate::{
    config::{ConfigError, QueryConfig},
    retry::with_deadline,
};

#[derive(thiserror::Error, Debug)]
pub enum QueryError {
    #[error("not found: {0}")]
    NotFound(String),
    #[error(transparent)]
    Store(StoreError),
}

impl QueryError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, QueryError::NotFound(_))
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, QueryError::Store(e) if e.is_retryable())
    }
}

impl From<StoreError> for QueryError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::NotFound(what) => QueryError::NotFound(what),
            other => QueryError::Store(other),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChargeReading {
    pub percent_charged: f64,
    #[serde(with = "time::serde::rfc3339")]
    pub as_of: OffsetDateTime,
}

/// Latest raw power per channel plus, when available, the latest charge level.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct InstantSnapshot {
    pub location: String,
    #[serde(with = "time::serde::rfc3339")]
    pub as_of: OffsetDateTime,
    pub site: f64,
    pub load: f64,
    pub battery: f64,
    pub solar: f64,
    pub charge: Option<ChargeReading>,
}

impl InstantSnapshot {
    fn new(reading: InstantReading, charge: Option<ChargeReading>, offset: UtcOffset) -> Self {
        Self {
            location: reading.location,
            as_of: reading.ts.to_offset(offset),
            site: reading.site,
            load: reading.load,
            battery: reading.battery,
            solar: reading.solar,
            charge,
        }
    }

    pub fn power(&self, channel: Channel) -> f64 {
        match channel {
            Channel::Site => self.site,
            Channel::Load => self.load,
            Channel::Battery => self.battery,
            Channel::Solar => self.solar,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ChannelSummary {
    pub hi: f64,
    #[serde(with = "time::serde::rfc3339")]
    pub hi_time: OffsetDateTime,
    pub lo: f64,
    #[serde(with = "time::serde::rfc3339")]
    pub lo_time: OffsetDateTime,
    pub count: i64,
    pub average: f64,
    pub imported: f64,
    pub exported: f64,
    pub net_energy: f64,
}

impl ChannelSummary {
    fn from_stats(stats: &ChannelStats) -> Option<Self> {
        let average = stats.average()?;
        Some(Self {
            hi: stats.power.hi,
            hi_time: stats.power.hi_time,
            lo: stats.power.lo,
            lo_time: stats.power.lo_time,
            count: stats.power.count,
            average,
            imported: stats.imported,
            exported: stats.exported,
            net_energy: stats.net_energy(),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ChargeSummary {
    pub hi: f64,
    #[serde(with = "time::serde::rfc3339")]
    pub hi_time: OffsetDateTime,
    pub lo: f64,
    #[serde(with = "time::serde::rfc3339")]
    pub lo_time: OffsetDateTime,
    pub count: i64,
    pub average: f64,
}

impl ChargeSummary {
    fn from_extrema(e: &Extrema) -> Option<Self> {
        let average = e.average()?;
        Some(Self {
            hi: e.hi,
            hi_time: e.hi_time,
            lo: e.lo,
            lo_time: e.lo_time,
            count: e.count,
            average,
        })
    }
}

/// One bucket as served to callers: averages derived, timestamps in the
/// serving offset. Channels without samples in the window are `None`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BucketView {
    pub location: String,
    pub resolution: Resolution,
    #[serde(with = "time::serde::rfc3339")]
    pub bucket_start: OffsetDateTime,
    pub site: Option<ChannelSummary>,
    pub load: Option<ChannelSummary>,
    pub battery: Option<ChannelSummary>,
    pub solar: Option<ChannelSummary>,
    pub charge: Option<ChargeSummary>,
}

impl BucketView {
    pub fn from_bucket(bucket: Bucket, offset: UtcOffset) -> Self {
        let b = bucket.to_offset(offset);
        let summary = |s: &Option<ChannelStats>| s.as_ref().and_then(ChannelSummary::from_stats);
        Self {
            site: summary(&b.site),
            load: summary(&b.load),
            battery: summary(&b.battery),
            solar: summary(&b.solar),
            charge: b.charge.as_ref().and_then(ChargeSummary::from_extrema),
            location: b.location,
            resolution: b.resolution,
            bucket_start: b.bucket_start,
        }
    }

    pub fn channel(&self, channel: Channel) -> Option<&ChannelSummary> {
        match channel {
            Channel::Site => self.site.as_ref(),
            Channel::Load => self.load.as_ref(),
            Channel::Battery => self.battery.as_ref(),
            Channel::Solar => self.solar.as_ref(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DashboardView {
    pub instant: InstantSnapshot,
    /// Most recent daily buckets, newest first. Empty when the history read
    /// failed.
    pub daily: Vec<BucketView>,
    pub query_time_ms: u64,
}

#[derive(Clone)]
pub struct QueryEngine {
    store: Arc<dyn BucketStore>,
    serving_offset: UtcOffset,
    deadline: Duration,
    daily_history_limit: u32,
}

impl QueryEngine {
    pub fn new(
        store: Arc<dyn BucketStore>,
        serving_offset: UtcOffset,
        deadline: Duration,
        daily_history_limit: u32,
    ) -> Self {
        Self {
            store,
            serving_offset,
            deadline,
            daily_history_limit,
        }
    }

    pub fn from_config(store: Arc<dyn BucketStore>, cfg: &QueryConfig) -> Result<Self, ConfigError> {
        Ok(Self::new(
            store,
            cfg.serving_offset()?,
            cfg.deadline(),
            cfg.daily_history_limit,
        ))
    }

    pub fn serving_offset(&self) -> UtcOffset {
        self.serving_offset
    }

    /// Fails when the power reading is unavailable. A missing or failed charge
    /// read only drops the charge part.
    pub async fn instant_view(&self, location: &str) -> Result<InstantSnapshot, QueryError> {
        let started = std::time::Instant::now();
        let (power, charge) = tokio::join!(
            with_deadline(self.deadline, self.store.latest_instant(location)),
            with_deadline(self.deadline, self.store.latest_charge(location)),
        );
        metrics::histogram!("query_duration_seconds", "view" => "instant")
            .record(started.elapsed().as_secs_f64());
        let power = power?;

        let charge = match charge {
            Ok(c) => Some(ChargeReading {
                percent_charged: c.percent_charged,
                as_of: c.ts.to_offset(self.serving_offset),
            }),
            Err(e) if e.is_not_found() => {
                tracing::debug!(location, "no charge reading, serving power only");
                metrics::counter!("query_instant_degraded_total", "reason" => "not_found").increment(1);
                None
            }
            Err(e) => {
                tracing::warn!(location, error = %e, "charge read failed, serving power only");
                metrics::counter!("query_instant_degraded_total", "reason" => "error").increment(1);
                None
            }
        };

        Ok(InstantSnapshot::new(power, charge, self.serving_offset))
    }

    /// An empty window is an empty history, not an error.
    pub async fn history_view(
        &self,
        location: &str,
        resolution: Resolution,
        window: &BucketWindow,
    ) -> Result<Vec<BucketView>, QueryError> {
        let started = std::time::Instant::now();
        let rows = with_deadline(self.deadline, self.store.buckets(location, resolution, window)).await?;
        metrics::histogram!("query_duration_seconds", "view" => "history")
            .record(started.elapsed().as_secs_f64());

        Ok(rows
            .into_iter()
            .map(|b| BucketView::from_bucket(b, self.serving_offset))
            .collect())
    }

    pub async fn recent_daily(&self, location: &str) -> Result<Vec<BucketView>, QueryError> {
        self.history_view(
            location,
            Resolution::Daily,
            &BucketWindow::latest(self.daily_history_limit),
        )
        .await
    }

    pub async fn dashboard(&self, location: &str) -> Result<DashboardView, QueryError> {
        let started = std::time::Instant::now();
        let (instant, daily) = tokio::join!(self.instant_view(location), self.recent_daily(location));
        let instant = instant?;
        let daily = daily.unwrap_or_else(|e| {
            tracing::warn!(location, error = %e, "daily history read failed, serving without history");
            Vec::new()
        });

        Ok(DashboardView {
            instant,
            daily,
            query_time_ms: started.elapsed().as_millis() as u64,
        })
    }

    /// Dashboards for several locations, in input order.
    pub async fn dashboards(&self, locations: &[String]) -> Vec<Result<DashboardView, QueryError>> {
        futures::future::join_all(locations.iter().map(|l| self.dashboard(l))).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FlakyStore;
    use energy_client::{
        domain::{BucketKey, ChannelReading, ChargeFold, ChargeSample, PowerFold, Reading},
        MemoryBucketStore,
    };
    use time::{
        macros::{datetime, offset},
        Duration as TimeDuration,
    };

    fn reading(ts: OffsetDateTime) -> Reading {
        let power = |p| ChannelReading { power: p, energy: None };
        Reading {
            location: "VT".to_string(),
            ts,
            site: power(1200.0),
            load: power(900.0),
            battery: power(-300.0),
            solar: power(0.0),
            percent_charged: None,
        }
    }

    fn charge(ts: OffsetDateTime, pct: f64) -> ChargeSample {
        ChargeSample {
            location: "VT".to_string(),
            ts,
            percent_charged: pct,
        }
    }

    fn engine(store: Arc<dyn BucketStore>) -> QueryEngine {
        QueryEngine::new(store, UtcOffset::UTC, Duration::from_millis(200), 7)
    }

    async fn seed_daily(store: &MemoryBucketStore, days: i64) {
        let base = datetime!(2024-06-01 12:00:00 UTC);
        for d in 0..days {
            let ts = base + TimeDuration::days(d);
            let key = BucketKey::containing("VT", Resolution::Daily, ts);
            let fold = PowerFold {
                channel: Channel::Solar,
                ts,
                power: 100.0 * (d + 1) as f64,
                imported: 0.0,
                exported: 10.0,
            };
            store
                .upsert_power(&format!("solar-{d}"), &[key.clone()], &fold)
                .await
                .unwrap();
            store
                .upsert_charge(&format!("charge-{d}"), &[key], &ChargeFold { ts, percent_charged: 50.0 })
                .await
                .unwrap();
        }
    }

    #[tokio::test]
    async fn instant_view_combines_power_and_charge() {
        let store = Arc::new(MemoryBucketStore::new());
        let ts = datetime!(2024-06-01 14:00:00 UTC);
        store.record_reading(&reading(ts)).await.unwrap();
        store.record_charge(&charge(ts, 81.0)).await.unwrap();

        let view = engine(store).instant_view("VT").await.unwrap();
        assert_eq!(view.as_of, ts);
        assert_eq!(view.power(Channel::Battery), -300.0);
        assert_eq!(view.charge.map(|c| c.percent_charged), Some(81.0));
    }

    #[tokio::test]
    async fn instant_view_degrades_without_charge_reading() {
        let store = Arc::new(MemoryBucketStore::new());
        store.record_reading(&reading(datetime!(2024-06-01 14:00:00 UTC))).await.unwrap();

        let view = engine(store).instant_view("VT").await.unwrap();
        assert_eq!(view.site, 1200.0);
        assert!(view.charge.is_none());
    }

    #[tokio::test]
    async fn instant_view_degrades_when_charge_read_fails() {
        let store = Arc::new(FlakyStore::new());
        let ts = datetime!(2024-06-01 14:00:00 UTC);
        store.record_reading(&reading(ts)).await.unwrap();
        store.record_charge(&charge(ts, 81.0)).await.unwrap();
        store.fail_charge_reads();

        let view = engine(store).instant_view("VT").await.unwrap();
        assert!(view.charge.is_none());
    }

    #[tokio::test]
    async fn instant_view_fails_without_power_reading() {
        let store = Arc::new(MemoryBucketStore::new());
        store.record_charge(&charge(datetime!(2024-06-01 14:00:00 UTC), 81.0)).await.unwrap();

        let err = engine(store).instant_view("VT").await.unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test(start_paused = true)]
    async fn stalled_store_hits_the_deadline() {
        let store = Arc::new(FlakyStore::new());
        store.record_reading(&reading(datetime!(2024-06-01 14:00:00 UTC))).await.unwrap();
        store.stall_reads();

        let err = engine(store).instant_view("VT").await.unwrap_err();
        assert!(matches!(err, QueryError::Store(_)));
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn history_is_normalized_to_serving_offset() {
        let store = Arc::new(MemoryBucketStore::new());
        seed_daily(&store, 3).await;
        let engine = QueryEngine::new(store, offset!(-5), Duration::from_millis(200), 7);

        let rows = engine.recent_daily("VT").await.unwrap();
        assert_eq!(rows.len(), 3);
        let newest = &rows[0];
        assert_eq!(newest.bucket_start.offset(), offset!(-5));
        assert_eq!(newest.bucket_start, datetime!(2024-06-03 00:00:00 UTC));

        let solar = newest.solar.expect("solar present");
        assert_eq!(solar.average, 300.0);
        assert_eq!(solar.net_energy, 10.0);
        assert_eq!(solar.hi_time.offset(), offset!(-5));
        assert!(newest.site.is_none());
        assert_eq!(newest.charge.map(|c| c.average), Some(50.0));
    }

    #[tokio::test]
    async fn recent_daily_is_bounded_by_configured_limit() {
        let store = Arc::new(MemoryBucketStore::new());
        seed_daily(&store, 10).await;

        let rows = engine(store).recent_daily("VT").await.unwrap();
        assert_eq!(rows.len(), 7);
        assert!(rows.windows(2).all(|w| w[0].bucket_start > w[1].bucket_start));
    }

    #[tokio::test]
    async fn empty_history_is_not_an_error() {
        let store = Arc::new(MemoryBucketStore::new());
        let rows = engine(store)
            .history_view("VT", Resolution::FiveMinute, &BucketWindow::latest(12))
            .await
            .unwrap();
        assert!(rows.is_empty());
    }

    #[tokio::test]
    async fn dashboard_serves_instant_view_when_history_fails() {
        let store = Arc::new(FlakyStore::new());
        store.record_reading(&reading(datetime!(2024-06-01 14:00:00 UTC))).await.unwrap();
        store.fail_bucket_reads();

        let view = engine(store).dashboard("VT").await.unwrap();
        assert_eq!(view.instant.load, 900.0);
        assert!(view.daily.is_empty());
    }

    #[tokio::test]
    async fn dashboards_keep_input_order_and_isolate_failures() {
        let store = Arc::new(MemoryBucketStore::new());
        store.record_reading(&reading(datetime!(2024-06-01 14:00:00 UTC))).await.unwrap();
        seed_daily(&store, 2).await;

        let views = engine(store)
            .dashboards(&["MA".to_string(), "VT".to_string()])
            .await;
        assert_eq!(views.len(), 2);
        assert!(views[0].as_ref().unwrap_err().is_not_found());
        let vt = views[1].as_ref().unwrap();
        assert_eq!(vt.instant.location, "VT");
        assert_eq!(vt.daily.len(), 2);
    }

    #[test]
    fn snapshot_serializes_timestamps_as_rfc3339() {
        let snapshot = InstantSnapshot {
            location: "VT".to_string(),
            as_of: datetime!(2024-06-01 14:00:00 UTC),
            site: 1.0,
            load: 2.0,
            battery: 3.0,
            solar: 4.0,
            charge: None,
        };
        let json = serde_json::to_value(&snapshot).unwrap();
        assert_eq!(json["as_of"], "2024-06-01T14:00:00Z");
        assert!(json["charge"].is_null());
    }

    /// Collects the names of histograms registered while installed.
    #[derive(Default)]
    struct HistogramNames(std::sync::Mutex<Vec<String>>);

    impl metrics::Recorder for HistogramNames {
        fn describe_counter(&self, _: metrics::KeyName, _: Option<metrics::Unit>, _: metrics::SharedString) {}
        fn describe_gauge(&self, _: metrics::KeyName, _: Option<metrics::Unit>, _: metrics::SharedString) {}
        fn describe_histogram(&self, _: metrics::KeyName, _: Option<metrics::Unit>, _: metrics::SharedString) {}

        fn register_counter(&self, _: &metrics::Key, _: &metrics::Metadata<'_>) -> metrics::Counter {
            metrics::Counter::noop()
        }

        fn register_gauge(&self, _: &metrics::Key, _: &metrics::Metadata<'_>) -> metrics::Gauge {
            metrics::Gauge::noop()
        }

        fn register_histogram(&self, key: &metrics::Key, _: &metrics::Metadata<'_>) -> metrics::Histogram {
            self.0.lock().unwrap().push(key.name().to_string());
            metrics::Histogram::noop()
        }
    }

    #[test]
    fn failed_instant_view_still_records_its_latency() {
        let recorder = HistogramNames::default();
        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_time()
            .build()
            .unwrap();
        let engine = engine(Arc::new(MemoryBucketStore::new()));

        let result = metrics::with_local_recorder(&recorder, || rt.block_on(engine.instant_view("VT")));

        assert!(result.unwrap_err().is_not_found());
        assert!(recorder.0.lock().unwrap().iter().any(|n| n == "query_duration_seconds"));
    }
}

use std::{fmt, str::FromStr};

use time::{Duration, OffsetDateTime, UtcOffset};

use super::reading::Channel;

/// Width of a bucket's time window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(
    feature = "serde",
    derive(serde::Serialize, serde::Deserialize),
    serde(rename_all = "snake_case")
)]
pub enum Resolution {
    FiveMinute,
    Daily,
}

impl Resolution {
    pub const ALL: [Resolution; 2] = [Resolution::FiveMinute, Resolution::Daily];

    pub const fn width_seconds(self) -> i64 {
        match self {
            Resolution::FiveMinute => 300,
            Resolution::Daily => 86_400,
        }
    }

    pub const fn table(self) -> &'static str {
        match self {
            Resolution::FiveMinute => "bucket_five_minute",
            Resolution::Daily => "bucket_daily",
        }
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            Resolution::FiveMinute => "five_minute",
            Resolution::Daily => "daily",
        }
    }

    /// Start of the window containing `ts`, in UTC.
    pub fn bucket_start(self, ts: OffsetDateTime) -> OffsetDateTime {
        let width = self.width_seconds();
        let into_window = ts.unix_timestamp().rem_euclid(width);
        ts.to_offset(UtcOffset::UTC)
            - Duration::seconds(into_window)
            - Duration::nanoseconds(i64::from(ts.nanosecond()))
    }

    pub fn is_aligned(self, ts: OffsetDateTime) -> bool {
        ts.nanosecond() == 0 && ts.unix_timestamp().rem_euclid(self.width_seconds()) == 0
    }
}

impl fmt::Display for Resolution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Resolution {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "five_minute" | "five-minute" | "5m" => Ok(Resolution::FiveMinute),
            "daily" | "day" | "1d" => Ok(Resolution::Daily),
            other => Err(format!("unknown resolution '{other}'")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BucketKey {
    pub location: String,
    pub resolution: Resolution,
    pub bucket_start: OffsetDateTime,
}

impl BucketKey {
    pub fn containing(location: &str, resolution: Resolution, ts: OffsetDateTime) -> Self {
        Self {
            location: location.to_string(),
            resolution,
            bucket_start: resolution.bucket_start(ts),
        }
    }
}

/// Which buckets a read returns.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BucketWindow {
    /// The most recent `limit` buckets, newest first.
    Latest { limit: u32 },
    /// Buckets with `begin <= bucket_start <= end`, oldest first.
    Range {
        begin: OffsetDateTime,
        end: OffsetDateTime,
        limit: Option<u32>,
    },
}

impl BucketWindow {
    pub fn latest(limit: u32) -> Self {
        BucketWindow::Latest { limit }
    }

    pub fn range(begin: OffsetDateTime, end: OffsetDateTime) -> Self {
        BucketWindow::Range {
            begin,
            end,
            limit: None,
        }
    }

    pub fn limit(&self) -> Option<u32> {
        match self {
            BucketWindow::Latest { limit } => Some(*limit),
            BucketWindow::Range { limit, .. } => *limit,
        }
    }

    pub fn admits(&self, bucket_start: OffsetDateTime) -> bool {
        match self {
            BucketWindow::Latest { .. } => true,
            BucketWindow::Range { begin, end, .. } => *begin <= bucket_start && bucket_start <= *end,
        }
    }
}

/// Running extrema, count and sum of one measured quantity within a bucket.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Extrema {
    pub hi: f64,
    pub hi_time: OffsetDateTime,
    pub lo: f64,
    pub lo_time: OffsetDateTime,
    pub count: i64,
    pub sum: f64,
}

impl Extrema {
    pub fn first(value: f64, ts: OffsetDateTime) -> Self {
        Self {
            hi: value,
            hi_time: ts,
            lo: value,
            lo_time: ts,
            count: 1,
            sum: value,
        }
    }

    /// Folds one value in. A value equal to the current extremum keeps the
    /// timestamp already recorded.
    pub fn fold(&mut self, value: f64, ts: OffsetDateTime) {
        self.count += 1;
        self.sum += value;
        if value > self.hi {
            self.hi = value;
            self.hi_time = ts;
        }
        if value < self.lo {
            self.lo = value;
            self.lo_time = ts;
        }
    }

    /// `None` for an empty aggregate.
    pub fn average(&self) -> Option<f64> {
        (self.count > 0).then(|| self.sum / self.count as f64)
    }

    fn to_offset(mut self, offset: UtcOffset) -> Self {
        self.hi_time = self.hi_time.to_offset(offset);
        self.lo_time = self.lo_time.to_offset(offset);
        self
    }
}

/// One power sample's contribution to a channel aggregate.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PowerFold {
    pub channel: Channel,
    pub ts: OffsetDateTime,
    pub power: f64,
    pub imported: f64,
    pub exported: f64,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ChargeFold {
    pub ts: OffsetDateTime,
    pub percent_charged: f64,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ChannelStats {
    pub power: Extrema,
    /// Imported energy accumulated within the bucket (Wh).
    pub imported: f64,
    /// Exported energy accumulated within the bucket (Wh).
    pub exported: f64,
}

impl ChannelStats {
    pub fn first(fold: &PowerFold) -> Self {
        Self {
            power: Extrema::first(fold.power, fold.ts),
            imported: fold.imported,
            exported: fold.exported,
        }
    }

    pub fn fold(&mut self, fold: &PowerFold) {
        self.power.fold(fold.power, fold.ts);
        self.imported += fold.imported;
        self.exported += fold.exported;
    }

    pub fn average(&self) -> Option<f64> {
        self.power.average()
    }

    /// Positive when the channel exported more than it imported.
    pub fn net_energy(&self) -> f64 {
        self.exported - self.imported
    }
}

/// Aggregates for one `(location, resolution, bucket_start)`.
///
/// A channel that has not received a sample in this window is `None`; a
/// present channel always has `count > 0`.
#[derive(Debug, Clone, PartialEq)]
pub struct Bucket {
    pub location: String,
    pub resolution: Resolution,
    pub bucket_start: OffsetDateTime,
    pub site: Option<ChannelStats>,
    pub load: Option<ChannelStats>,
    pub battery: Option<ChannelStats>,
    pub solar: Option<ChannelStats>,
    pub charge: Option<Extrema>,
}

impl Bucket {
    pub fn empty(key: &BucketKey) -> Self {
        Self {
            location: key.location.clone(),
            resolution: key.resolution,
            bucket_start: key.bucket_start,
            site: None,
            load: None,
            battery: None,
            solar: None,
            charge: None,
        }
    }

    pub fn channel(&self, channel: Channel) -> Option<&ChannelStats> {
        match channel {
            Channel::Site => self.site.as_ref(),
            Channel::Load => self.load.as_ref(),
            Channel::Battery => self.battery.as_ref(),
            Channel::Solar => self.solar.as_ref(),
        }
    }

    fn channel_mut(&mut self, channel: Channel) -> &mut Option<ChannelStats> {
        match channel {
            Channel::Site => &mut self.site,
            Channel::Load => &mut self.load,
            Channel::Battery => &mut self.battery,
            Channel::Solar => &mut self.solar,
        }
    }

    pub fn apply_power(&mut self, fold: &PowerFold) {
        let slot = self.channel_mut(fold.channel);
        if let Some(stats) = slot.as_mut() {
            stats.fold(fold);
        } else {
            *slot = Some(ChannelStats::first(fold));
        }
    }

    pub fn apply_charge(&mut self, fold: &ChargeFold) {
        if let Some(stats) = self.charge.as_mut() {
            stats.fold(fold.percent_charged, fold.ts);
        } else {
            self.charge = Some(Extrema::first(fold.percent_charged, fold.ts));
        }
    }

    /// Same instants expressed in `offset`.
    pub fn to_offset(mut self, offset: UtcOffset) -> Self {
        self.bucket_start = self.bucket_start.to_offset(offset);
        for channel in Channel::ALL {
            if let Some(stats) = self.channel_mut(channel) {
                stats.power = stats.power.to_offset(offset);
            }
        }
        self.charge = self.charge.map(|c| c.to_offset(offset));
        self
    }
}

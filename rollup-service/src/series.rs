//! Chart payloads: ordered `[timestamp_ms, value]` pairs.

use std::{fmt, str::FromStr};

use energy_client::domain::Channel;
use serde::{Serialize, Serializer};

use crate::query::BucketView;

/// Which derived quantity of a bucket a series projects.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SeriesValue {
    AveragePower(Channel),
    AverageCharge,
    NetEnergy(Channel),
    High(Channel),
    Low(Channel),
}

impl SeriesValue {
    /// `None` when the bucket holds no samples for the selected quantity.
    pub fn select(&self, bucket: &BucketView) -> Option<f64> {
        match *self {
            SeriesValue::AveragePower(c) => bucket.channel(c).map(|s| s.average),
            SeriesValue::AverageCharge => bucket.charge.map(|c| c.average),
            SeriesValue::NetEnergy(c) => bucket.channel(c).map(|s| s.net_energy),
            SeriesValue::High(c) => bucket.channel(c).map(|s| s.hi),
            SeriesValue::Low(c) => bucket.channel(c).map(|s| s.lo),
        }
    }
}

impl fmt::Display for SeriesValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SeriesValue::AveragePower(c) => write!(f, "{c}"),
            SeriesValue::AverageCharge => f.write_str("charge"),
            SeriesValue::NetEnergy(c) => write!(f, "{c}:net"),
            SeriesValue::High(c) => write!(f, "{c}:hi"),
            SeriesValue::Low(c) => write!(f, "{c}:lo"),
        }
    }
}

/// Accepts `charge`, `<channel>` (average power) and `<channel>:net|hi|lo`.
impl FromStr for SeriesValue {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.eq_ignore_ascii_case("charge") {
            return Ok(SeriesValue::AverageCharge);
        }
        let (channel, quantity) = s.split_once(':').unwrap_or((s, "avg"));
        let channel: Channel = channel.parse()?;
        match quantity.to_ascii_lowercase().as_str() {
            "avg" => Ok(SeriesValue::AveragePower(channel)),
            "net" => Ok(SeriesValue::NetEnergy(channel)),
            "hi" => Ok(SeriesValue::High(channel)),
            "lo" => Ok(SeriesValue::Low(channel)),
            other => Err(format!("unknown series quantity '{other}'")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SeriesPoint {
    pub timestamp_ms: i64,
    pub value: Option<f64>,
}

impl Serialize for SeriesPoint {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        (self.timestamp_ms, self.value).serialize(serializer)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(transparent)]
pub struct Series(pub Vec<SeriesPoint>);

impl Series {
    pub fn points(&self) -> &[SeriesPoint] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}

/// One point per bucket, in input order. Buckets without data for `value`
/// keep their slot with a `null` value.
pub fn to_series(buckets: &[BucketView], value: SeriesValue) -> Series {
    Series(
        buckets
            .iter()
            .map(|b| SeriesPoint {
                timestamp_ms: b.bucket_start.unix_timestamp() * 1000,
                value: value.select(b),
            })
            .collect(),
    )
}

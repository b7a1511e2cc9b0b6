use std::{fmt, str::FromStr};

use time::OffsetDateTime;

/// One of the four power flows a site reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(
    feature = "serde",
    derive(serde::Serialize, serde::Deserialize),
    serde(rename_all = "snake_case")
)]
pub enum Channel {
    Site,
    Load,
    Battery,
    Solar,
}

impl Channel {
    pub const ALL: [Channel; 4] = [Channel::Site, Channel::Load, Channel::Battery, Channel::Solar];

    /// Column prefix used by `raw_readings` and the bucket tables.
    pub const fn as_str(self) -> &'static str {
        match self {
            Channel::Site => "site",
            Channel::Load => "load",
            Channel::Battery => "battery",
            Channel::Solar => "solar",
        }
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Channel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "site" => Ok(Channel::Site),
            "load" => Ok(Channel::Load),
            "battery" => Ok(Channel::Battery),
            "solar" => Ok(Channel::Solar),
            other => Err(format!("unknown channel '{other}'")),
        }
    }
}

/// Cumulative energy counters as reported by the meter (watt-hours).
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct EnergyCounters {
    pub imported: f64,
    pub exported: f64,
}

impl EnergyCounters {
    /// Energy accumulated since `previous`.
    ///
    /// Without a previous reading there is no baseline and the delta is zero.
    /// A counter lower than its predecessor was reset and counts from zero.
    pub fn delta_since(&self, previous: Option<&EnergyCounters>) -> EnergyCounters {
        match previous {
            None => EnergyCounters::default(),
            Some(prev) => EnergyCounters {
                imported: counter_delta(prev.imported, self.imported),
                exported: counter_delta(prev.exported, self.exported),
            },
        }
    }
}

fn counter_delta(previous: f64, current: f64) -> f64 {
    if current >= previous {
        current - previous
    } else {
        current
    }
}

/// A single instantaneous power reading for one channel.
#[derive(Debug, Clone, PartialEq)]
pub struct Sample {
    pub location: String,
    pub channel: Channel,
    pub ts: OffsetDateTime,
    /// Signed watts.
    pub power: f64,
    pub energy: Option<EnergyCounters>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ChargeSample {
    pub location: String,
    pub ts: OffsetDateTime,
    pub percent_charged: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct ChannelReading {
    pub power: f64,
    pub energy: Option<EnergyCounters>,
}

/// The combined frame delivered by a site's telemetry feed.
#[derive(Debug, Clone, PartialEq)]
pub struct Reading {
    pub location: String,
    pub ts: OffsetDateTime,
    pub site: ChannelReading,
    pub load: ChannelReading,
    pub battery: ChannelReading,
    pub solar: ChannelReading,
    pub percent_charged: Option<f64>,
}

impl Reading {
    pub fn channel(&self, channel: Channel) -> &ChannelReading {
        match channel {
            Channel::Site => &self.site,
            Channel::Load => &self.load,
            Channel::Battery => &self.battery,
            Channel::Solar => &self.solar,
        }
    }

    pub fn samples(&self) -> impl Iterator<Item = Sample> + '_ {
        Channel::ALL.into_iter().map(move |channel| {
            let c = self.channel(channel);
            Sample {
                location: self.location.clone(),
                channel,
                ts: self.ts,
                power: c.power,
                energy: c.energy,
            }
        })
    }

    pub fn charge_sample(&self) -> Option<ChargeSample> {
        self.percent_charged.map(|percent_charged| ChargeSample {
            location: self.location.clone(),
            ts: self.ts,
            percent_charged,
        })
    }

    /// Content digest identifying this reading in `raw_readings`.
    ///
    /// Two readings with identical content share an id, so a replayed frame
    /// is rejected at insert time.
    pub fn event_id(&self) -> String {
        let mut h = blake3::Hasher::new();
        h.update(&self.ts.unix_timestamp_nanos().to_le_bytes());
        hash_str(&mut h, &self.location);
        for channel in Channel::ALL {
            let c = self.channel(channel);
            hash_f64(&mut h, c.power);
            hash_opt_counters(&mut h, c.energy);
        }
        hash_opt_f64(&mut h, self.percent_charged);
        h.finalize().to_hex().to_string()
    }
}

impl Sample {
    /// Digest identifying this sample's contribution to its buckets.
    ///
    /// Stores apply at most one fold per id, so a retried or replayed sample
    /// is never counted twice. Samples differing in any field fold separately.
    pub fn fold_id(&self) -> String {
        let mut h = blake3::Hasher::new();
        h.update(b"power");
        h.update(&self.ts.unix_timestamp_nanos().to_le_bytes());
        hash_str(&mut h, &self.location);
        hash_str(&mut h, self.channel.as_str());
        hash_f64(&mut h, self.power);
        hash_opt_counters(&mut h, self.energy);
        h.finalize().to_hex().to_string()
    }
}

impl ChargeSample {
    pub fn fold_id(&self) -> String {
        let mut h = blake3::Hasher::new();
        h.update(b"charge");
        h.update(&self.ts.unix_timestamp_nanos().to_le_bytes());
        hash_str(&mut h, &self.location);
        hash_f64(&mut h, self.percent_charged);
        h.finalize().to_hex().to_string()
    }
}

fn hash_str(hasher: &mut blake3::Hasher, s: &str) {
    let len = s.len() as u32;
    hasher.update(&len.to_le_bytes());
    hasher.update(s.as_bytes());
}

fn hash_f64(hasher: &mut blake3::Hasher, v: f64) {
    hasher.update(&v.to_bits().to_le_bytes());
}

fn hash_opt_counters(hasher: &mut blake3::Hasher, energy: Option<EnergyCounters>) {
    match energy {
        Some(e) => {
            hasher.update(&[1]);
            hash_f64(hasher, e.imported);
            hash_f64(hasher, e.exported);
        }
        None => {
            hasher.update(&[0]);
        }
    }
}

fn hash_opt_f64(hasher: &mut blake3::Hasher, v: Option<f64>) {
    match v {
        Some(x) => {
            hasher.update(&[1]);
            hash_f64(hasher, x);
        }
        None => {
            hasher.update(&[0]);
        }
    }
}

/// Latest raw power per channel for a location.
#[derive(Debug, Clone, PartialEq)]
pub struct InstantReading {
    pub location: String,
    pub ts: OffsetDateTime,
    pub site: f64,
    pub load: f64,
    pub battery: f64,
    pub solar: f64,
}

impl InstantReading {
    pub fn power(&self, channel: Channel) -> f64 {
        match channel {
            Channel::Site => self.site,
            Channel::Load => self.load,
            Channel::Battery => self.battery,
            Channel::Solar => self.solar,
        }
    }
}

impl From<&Reading> for InstantReading {
    fn from(r: &Reading) -> Self {
        InstantReading {
            location: r.location.clone(),
            ts: r.ts,
            site: r.site.power,
            load: r.load.power,
            battery: r.battery.power,
            solar: r.solar.power,
        }
    }
}

pub mod http_readings;
pub mod reading_delimited_file;
pub mod reading_ndjson_file;

pub use http_readings::HttpReadingsSource;
pub use reading_delimited_file::ReadingDelimitedFileSource;
pub use reading_ndjson_file::ReadingNdjsonFileSource;

use energy_client::domain::{ChannelReading, EnergyCounters, Reading};

/// One channel of a reading as the telemetry feed sends it.
#[derive(Debug, Clone, Copy, serde::Deserialize)]
pub struct IncomingChannel {
    pub instant_power: f64,
    pub energy_imported: Option<f64>,
    pub energy_exported: Option<f64>,
}

impl From<IncomingChannel> for ChannelReading {
    fn from(c: IncomingChannel) -> Self {
        // Counters are only meaningful as a pair.
        let energy = match (c.energy_imported, c.energy_exported) {
            (Some(imported), Some(exported)) => Some(EnergyCounters { imported, exported }),
            _ => None,
        };
        ChannelReading {
            power: c.instant_power,
            energy,
        }
    }
}

/// Wire shape shared by the HTTP and NDJSON sources.
#[derive(Debug, Clone, serde::Deserialize)]
pub struct IncomingReading {
    pub location: String,
    #[serde(with = "time::serde::rfc3339")]
    pub ts: time::OffsetDateTime,
    pub site: IncomingChannel,
    pub load: IncomingChannel,
    pub battery: IncomingChannel,
    pub solar: IncomingChannel,
    pub percent_charged: Option<f64>,
}

impl From<IncomingReading> for Reading {
    fn from(i: IncomingReading) -> Self {
        Reading {
            location: i.location,
            ts: i.ts,
            site: i.site.into(),
            load: i.load.into(),
            battery: i.battery.into(),
            solar: i.solar.into(),
            percent_charged: i.percent_charged,
        }
    }
}

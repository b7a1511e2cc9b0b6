use std::{fs::File, path::PathBuf};

use csv::StringRecord;
use energy_client::domain::{Channel, ChannelReading, EnergyCounters, Reading};
use time::{format_description::well_known::Rfc3339, OffsetDateTime};

use crate::pipeline::{Envelope, EnvelopeStream, PipelineError, Source};

/// Delimited backfill (CSV by default, `|` for `.dat` exports).
///
/// Header columns, by name:
/// - `ts` (RFC3339), `location`
/// - `<channel>_power` for site, load, battery and solar
/// - `<channel>_imported`, `<channel>_exported` (optional)
/// - `percent_charged` (optional)
pub struct ReadingDelimitedFileSource {
    path: PathBuf,
    delimiter: u8,
}

impl ReadingDelimitedFileSource {
    pub fn new<P: Into<PathBuf>>(path: P) -> Self {
        Self::with_delimiter(path, b',')
    }

    pub fn with_delimiter<P: Into<PathBuf>>(path: P, delimiter: u8) -> Self {
        Self {
            path: path.into(),
            delimiter,
        }
    }
}

fn parse_optional_f64(s: &str) -> Result<Option<f64>, String> {
    let s = s.trim();
    if s.is_empty() {
        return Ok(None);
    }
    s.parse().map(Some).map_err(|e| format!("invalid number '{s}': {e}"))
}

fn record_to_reading(record: &StringRecord, headers: &StringRecord) -> Result<Reading, PipelineError> {
    let get = |name: &str| {
        headers
            .iter()
            .position(|h| h.trim() == name)
            .and_then(|idx| record.get(idx))
    };
    let required = |name: &str| {
        get(name).ok_or_else(|| PipelineError::Source(format!("missing column '{name}'")))
    };
    let optional = |name: &str| {
        parse_optional_f64(get(name).unwrap_or("")).map_err(|e| PipelineError::Source(format!("{name}: {e}")))
    };

    let ts_str = required("ts")?.trim();
    let ts = OffsetDateTime::parse(ts_str, &Rfc3339)
        .map_err(|e| PipelineError::Source(format!("invalid ts '{ts_str}': {e}")))?;
    let location = required("location")?.trim().to_string();

    let channel = |c: Channel| -> Result<ChannelReading, PipelineError> {
        let power_col = format!("{c}_power");
        let power = optional(&power_col)?
            .ok_or_else(|| PipelineError::Source(format!("missing value for '{power_col}'")))?;
        let imported = optional(&format!("{c}_imported"))?;
        let exported = optional(&format!("{c}_exported"))?;
        let energy = match (imported, exported) {
            (Some(imported), Some(exported)) => Some(EnergyCounters { imported, exported }),
            _ => None,
        };
        Ok(ChannelReading { power, energy })
    };

    Ok(Reading {
        location,
        ts,
        site: channel(Channel::Site)?,
        load: channel(Channel::Load)?,
        battery: channel(Channel::Battery)?,
        solar: channel(Channel::Solar)?,
        percent_charged: optional("percent_charged")?,
    })
}

#[async_trait::async_trait]
impl Source<Reading> for ReadingDelimitedFileSource {
    async fn stream(&self) -> Result<EnvelopeStream<Reading>, PipelineError> {
        let file = File::open(&self.path).map_err(|e| {
            PipelineError::Source(format!("failed to open {}: {e}", self.path.display()))
        })?;
        let mut rdr = csv::ReaderBuilder::new()
            .delimiter(self.delimiter)
            .trim(csv::Trim::All)
            .from_reader(file);
        let headers = rdr
            .headers()
            .map_err(|e| PipelineError::Source(format!("failed to read headers: {e}")))?
            .clone();

        // Blocking reads; backfill files are consumed by a dedicated binary.
        let s = async_stream::stream! {
            for (idx, result) in rdr.records().enumerate() {
                let row = idx + 2;
                let parsed = result
                    .map_err(|e| PipelineError::Source(e.to_string()))
                    .and_then(|record| record_to_reading(&record, &headers));
                match parsed {
                    Ok(reading) => {
                        yield Ok(Envelope::new(reading));
                    }
                    Err(e) => {
                        metrics::counter!("backfill_readings_parse_errors_total").increment(1);
                        yield Err(PipelineError::Source(format!("row {row}: {e}")));
                    }
                }
            }
        };

        Ok(Box::pin(s))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;
    use std::io::Write;
    use time::macros::datetime;

    const HEADER: &str = "ts|location|site_power|site_imported|site_exported|load_power|battery_power|solar_power|percent_charged";

    async fn read_all(contents: &str, delimiter: u8) -> Vec<Result<Envelope<Reading>, PipelineError>> {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        ReadingDelimitedFileSource::with_delimiter(file.path(), delimiter)
            .stream()
            .await
            .unwrap()
            .collect()
            .await
    }

    #[tokio::test]
    async fn parses_pipe_delimited_rows() {
        let contents = format!(
            "{HEADER}\n2024-06-01T14:00:00Z|VT|1200|9000.5|10|800|-300|0|64.5\n2024-06-01T14:00:05Z|VT|1100|||790|-310|0|\n"
        );
        let items = read_all(&contents, b'|').await;
        assert_eq!(items.len(), 2);

        let first = &items[0].as_ref().unwrap().payload;
        assert_eq!(first.ts, datetime!(2024-06-01 14:00:00 UTC));
        assert_eq!(first.site.energy, Some(EnergyCounters { imported: 9000.5, exported: 10.0 }));
        assert_eq!(first.battery.power, -300.0);
        assert_eq!(first.percent_charged, Some(64.5));

        let second = &items[1].as_ref().unwrap().payload;
        assert!(second.site.energy.is_none());
        assert!(second.percent_charged.is_none());
    }

    #[tokio::test]
    async fn bad_rows_are_reported_with_their_row_number() {
        let contents = "ts,location,site_power,load_power,battery_power,solar_power\n\
                        2024-06-01T14:00:00Z,VT,abc,1,2,3\n\
                        2024-06-01T14:00:05Z,VT,5,1,2,3\n";
        let items = read_all(contents, b',').await;
        assert_eq!(items.len(), 2);
        assert!(matches!(&items[0], Err(PipelineError::Source(msg)) if msg.starts_with("row 2")));
        assert_eq!(items[1].as_ref().unwrap().payload.site.power, 5.0);
    }

    #[tokio::test]
    async fn missing_power_column_is_rejected() {
        let contents = "ts,location,site_power,load_power,battery_power\n2024-06-01T14:00:00Z,VT,1,2,3\n";
        let items = read_all(contents, b',').await;
        assert!(items[0].is_err());
    }
}

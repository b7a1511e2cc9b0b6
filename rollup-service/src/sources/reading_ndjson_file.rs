use std::path::PathBuf;

use energy_client::domain::Reading;
use tokio::{
    fs::File,
    io::{AsyncBufReadExt, BufReader},
};

use super::IncomingReading;
use crate::pipeline::{Envelope, EnvelopeStream, PipelineError, Source};

/// NDJSON backfill: one reading per line, same shape as the HTTP payload
/// elements. Malformed lines are reported downstream and skipped; an
/// unreadable file ends the stream.
pub struct ReadingNdjsonFileSource {
    path: PathBuf,
}

impl ReadingNdjsonFileSource {
    pub fn new<P: Into<PathBuf>>(path: P) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait::async_trait]
impl Source<Reading> for ReadingNdjsonFileSource {
    async fn stream(&self) -> Result<EnvelopeStream<Reading>, PipelineError> {
        let file = File::open(&self.path).await.map_err(|e| {
            PipelineError::Source(format!("failed to open {}: {e}", self.path.display()))
        })?;

        let s = async_stream::stream! {
            let mut lines = BufReader::new(file).lines();
            let mut line_no: u64 = 0;
            loop {
                let line = match lines.next_line().await {
                    Ok(Some(line)) => line,
                    Ok(None) => break,
                    Err(e) => {
                        yield Err(PipelineError::Source(format!("failed to read backfill line: {e}")));
                        break;
                    }
                };
                line_no += 1;
                if line.trim().is_empty() {
                    continue;
                }
                match serde_json::from_str::<IncomingReading>(&line) {
                    Ok(incoming) => {
                        yield Ok(Envelope::new(Reading::from(incoming)));
                    }
                    Err(e) => {
                        metrics::counter!("backfill_readings_parse_errors_total").increment(1);
                        yield Err(PipelineError::Source(format!("line {line_no}: {e}")));
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

    #[tokio::test]
    async fn skips_malformed_lines_and_keeps_going() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        let good = |loc: &str| {
            format!(
                r#"{{"location":"{loc}","ts":"2024-06-01T14:00:00Z","site":{{"instant_power":1.0}},"load":{{"instant_power":2.0}},"battery":{{"instant_power":3.0}},"solar":{{"instant_power":4.0}}}}"#
            )
        };
        writeln!(file, "{}", good("VT")).unwrap();
        writeln!(file, "{{not json").unwrap();
        writeln!(file).unwrap();
        writeln!(file, "{}", good("MA")).unwrap();

        let items: Vec<_> = ReadingNdjsonFileSource::new(file.path())
            .stream()
            .await
            .unwrap()
            .collect()
            .await;

        assert_eq!(items.len(), 3);
        assert_eq!(items[0].as_ref().unwrap().payload.location, "VT");
        assert!(matches!(&items[1], Err(PipelineError::Source(msg)) if msg.starts_with("line 2")));
        assert_eq!(items[2].as_ref().unwrap().payload.location, "MA");
    }

    #[tokio::test]
    async fn missing_file_is_a_source_error() {
        let res = ReadingNdjsonFileSource::new("/nonexistent/readings.ndjson").stream().await;
        assert!(matches!(res, Err(PipelineError::Source(_))));
    }
}

use energy_client::domain::{Channel, Reading};
use time::macros::datetime;

use crate::pipeline::{Envelope, PipelineError, Transform};

/// Pure validation of an incoming `Reading`.
///
/// Rules:
/// - location must be non-empty; it is normalized to upper case.
/// - ts must be within a broad sanity window [2000-01-01, 2100-01-01].
/// - every channel power must be finite.
/// - energy counters, when present, must be finite and non-negative.
/// - percent_charged, when present, must be within [0, 100].
pub fn validate_reading(mut env: Envelope<Reading>) -> Result<Envelope<Reading>, PipelineError> {
    let r = &mut env.payload;

    let location = r.location.trim().to_ascii_uppercase();
    if location.is_empty() {
        return Err(PipelineError::Transform("location must not be empty".to_string()));
    }
    r.location = location;

    let min_ts = datetime!(2000-01-01 00:00:00 UTC);
    let max_ts = datetime!(2100-01-01 00:00:00 UTC);
    if r.ts < min_ts || r.ts > max_ts {
        return Err(PipelineError::Transform(format!(
            "{}: timestamp out of allowed range",
            r.location
        )));
    }

    for channel in Channel::ALL {
        let c = r.channel(channel);
        if !c.power.is_finite() {
            return Err(PipelineError::Transform(format!(
                "{}: {channel} power is not finite",
                r.location
            )));
        }
        if let Some(e) = c.energy {
            let valid = |v: f64| v.is_finite() && v >= 0.0;
            if !valid(e.imported) || !valid(e.exported) {
                return Err(PipelineError::Transform(format!(
                    "{}: {channel} energy counters must be finite and non-negative",
                    r.location
                )));
            }
        }
    }

    if let Some(pct) = r.percent_charged {
        if !(0.0..=100.0).contains(&pct) {
            return Err(PipelineError::Transform(format!(
                "{}: percent_charged {pct} outside [0, 100]",
                r.location
            )));
        }
    }

    Ok(env)
}

#[derive(Clone, Default)]
pub struct ReadingValidation;

#[async_trait::async_trait]
impl Transform<Reading, Reading> for ReadingValidation {
    async fn apply(&self, input: Envelope<Reading>) -> Result<Envelope<Reading>, PipelineError> {
        validate_reading(input).inspect_err(|_| {
            metrics::counter!("validation_readings_rejected_total").increment(1);
        })
    }
}

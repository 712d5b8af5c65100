use crate::pipeline::{Envelope, PipelineError, Transform};
use meter_client::domain::Sample;
use time::macros::datetime;

/// Pure validation of an incoming counter `Sample`.
///
/// Rules:
/// - count must be non-negative.
/// - timestamp must be within a broad sanity window [2000-01-01, 2100-01-01).
pub fn validate_sample(env: Envelope<Sample>) -> Result<Envelope<Sample>, PipelineError> {
    let s = &env.payload;

    if s.count < 0 {
        return Err(PipelineError::Transform("count must be non-negative".to_string()));
    }

    let min_ts = datetime!(2000-01-01 00:00:00 UTC).unix_timestamp();
    let max_ts = datetime!(2100-01-01 00:00:00 UTC).unix_timestamp();

    if s.timestamp < min_ts || s.timestamp >= max_ts {
        return Err(PipelineError::Transform(format!(
            "timestamp {} out of allowed range",
            s.timestamp
        )));
    }

    Ok(env)
}

#[derive(Clone, Default)]
pub struct SampleValidation;

#[async_trait::async_trait]
impl Transform<Sample, Sample> for SampleValidation {
    async fn apply(&self, input: Envelope<Sample>) -> Result<Envelope<Sample>, PipelineError> {
        match validate_sample(input) {
            Ok(env) => Ok(env),
            Err(e) => {
                metrics::counter!("validation_sample_rejected_total").increment(1);
                Err(e)
            }
        }
    }
}

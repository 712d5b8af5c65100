use std::{path::PathBuf, time::SystemTime};

use async_stream::stream;
use meter_client::domain::Sample;
use tokio::{
    fs::File,
    io::{AsyncBufReadExt, BufReader},
};

use super::IncomingSample;
use crate::pipeline::{Envelope, EnvelopeStream, PipelineError, Source};

/// NDJSON backfill source. Each non-blank line is one `{"count", "timestamp"}` object.
pub struct SampleNdjsonFileSource {
    path: PathBuf,
}

impl SampleNdjsonFileSource {
    pub fn new<P: Into<PathBuf>>(path: P) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait::async_trait]
impl Source<Sample> for SampleNdjsonFileSource {
    async fn stream(&self) -> EnvelopeStream<Sample> {
        let path = self.path.clone();
        // A bad line is reported on its own; only open/read failures end the stream.
        let s = stream! {
            let file = match File::open(&path).await {
                Ok(f) => f,
                Err(e) => {
                    yield Err(PipelineError::Source(format!("failed to open backfill file: {e}")));
                    return;
                }
            };
            let mut lines = BufReader::new(file).lines();
            let mut line_no: u64 = 0;

            loop {
                let line = match lines.next_line().await {
                    Ok(Some(line)) => line,
                    Ok(None) => break,
                    Err(e) => {
                        yield Err(PipelineError::Source(format!("failed to read backfill line: {e}")));
                        return;
                    }
                };
                line_no += 1;
                if line.trim().is_empty() {
                    continue;
                }

                match serde_json::from_str::<IncomingSample>(&line) {
                    Ok(parsed) => {
                        let received_at = SystemTime::now();
                        yield Ok(Envelope {
                            payload: parsed.into_sample(received_at),
                            received_at,
                        });
                    }
                    Err(e) => {
                        metrics::counter!("backfill_sample_parse_errors_total").increment(1);
                        yield Err(PipelineError::Source(format!(
                            "line {line_no}: failed to parse backfill json: {e}"
                        )));
                    }
                }
            }
        };

        Box::pin(s)
    }
}

use std::{sync::Arc, time::Duration};

use futures::StreamExt;
use meter_client::{db::SampleStore, domain::Sample, StorageError};

use crate::{
    pipeline::{Envelope, PipelineError, Sink},
    sources::IngestStatus,
};

/// Batches validated readings into the Sample Store.
///
/// Readings are appended in arrival order. A partially filled batch is flushed
/// when the input ends, so a graceful stop loses nothing already received.
pub struct SampleStoreSink {
    store: Arc<dyn SampleStore>,
    status: Option<IngestStatus>,
    batch_size: usize,
    max_retries: u32,
    retry_backoff: Duration,
}

impl SampleStoreSink {
    pub fn new(
        store: Arc<dyn SampleStore>,
        batch_size: usize,
        max_retries: u32,
        retry_backoff: Duration,
    ) -> Self {
        Self {
            store,
            status: None,
            batch_size: batch_size.max(1),
            max_retries,
            retry_backoff,
        }
    }

    /// Also publish `last_msg_ts` / `last_msg_count` after each flush.
    pub fn with_status(mut self, status: IngestStatus) -> Self {
        self.status = Some(status);
        self
    }

    async fn flush_batch(&self, batch: &[Envelope<Sample>]) -> Result<(), PipelineError> {
        if batch.is_empty() {
            return Ok(());
        }
        let samples: Vec<Sample> = batch.iter().map(|e| e.payload).collect();

        let mut attempt: u32 = 0;
        loop {
            match self.store.append_batch(&samples).await {
                Ok(()) => {
                    metrics::counter!("samples_ingested_total").increment(samples.len() as u64);

                    if let Some(min_received) = batch.iter().map(|e| e.received_at).min() {
                        if let Ok(dur) = std::time::SystemTime::now().duration_since(min_received) {
                            metrics::histogram!("ingest_end_to_end_latency_seconds")
                                .record(dur.as_secs_f64());
                        }
                    }

                    if let (Some(status), Some(last)) = (&self.status, samples.last()) {
                        status.record_last(last).await;
                    }
                    return Ok(());
                }
                Err(e) if attempt < self.max_retries && is_retryable(&e) => {
                    attempt += 1;
                    metrics::counter!("sample_sink_retries_total").increment(1);
                    let sleep_for = self.retry_backoff * attempt;
                    tracing::warn!(
                        error = %e,
                        attempt,
                        "sample sink flush failed, retrying with backoff"
                    );
                    tokio::time::sleep(sleep_for).await;
                }
                Err(e) => {
                    tracing::error!(error = %e, batch = samples.len(), "sample sink flush failed, giving up");
                    metrics::counter!("sample_sink_errors_total").increment(1);
                    return Err(PipelineError::Sink(e.to_string()));
                }
            }
        }
    }
}

fn is_retryable(e: &StorageError) -> bool {
    !matches!(e, StorageError::Corrupt { .. })
}

#[async_trait::async_trait]
impl Sink<Sample> for SampleStoreSink {
    async fn run<S>(&self, mut input: S) -> Result<(), PipelineError>
    where
        S: futures::Stream<Item = Result<Envelope<Sample>, PipelineError>> + Send + Unpin + 'static,
    {
        let mut buffer: Vec<Envelope<Sample>> = Vec::with_capacity(self.batch_size);
        let (mut written, mut rejected) = (0u64, 0u64);

        while let Some(item) = input.next().await {
            let env = match item {
                Ok(env) => env,
                Err(e) => {
                    rejected += 1;
                    tracing::warn!(error = %e, "dropping reading rejected upstream");
                    continue;
                }
            };

            buffer.push(env);
            if buffer.len() >= self.batch_size {
                self.flush_batch(&buffer).await?;
                written += buffer.len() as u64;
                buffer.clear();
            }
        }

        if !buffer.is_empty() {
            self.flush_batch(&buffer).await?;
            written += buffer.len() as u64;
        }

        tracing::info!(written, rejected, "sample sink input ended");
        Ok(())
    }
}

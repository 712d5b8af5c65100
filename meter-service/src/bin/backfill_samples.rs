use anyhow::{bail, Result};
use meter_client::{db::SqliteStore, domain::Sample};
use meter_service::{
    config::AppConfig,
    observability,
    pipeline::{EnvelopeStream, Pipeline, Source},
    sinks::SampleStoreSink,
    sources::{SampleCsvFileSource, SampleNdjsonFileSource},
    transform,
};
use std::{env, path::Path, sync::Arc, time::Duration};
use tokio_util::sync::CancellationToken;

enum BackfillSource {
    Ndjson(SampleNdjsonFileSource),
    Csv(SampleCsvFileSource),
}

#[async_trait::async_trait]
impl Source<Sample> for BackfillSource {
    async fn stream(&self) -> EnvelopeStream<Sample> {
        match self {
            Self::Ndjson(s) => s.stream().await,
            Self::Csv(s) => s.stream().await,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    observability::init_tracing();

    let args: Vec<String> = env::args().collect();
    if args.len() < 2 {
        bail!("usage: backfill_samples <file.ndjson|file.csv>");
    }
    let file_path = &args[1];

    // METER_CONFIG may point at a backfill-specific file.
    let cfg = AppConfig::load()?;

    let store = Arc::new(SqliteStore::connect(&cfg.database.url, cfg.database.max_connections).await?);

    let source = match Path::new(file_path).extension().and_then(|e| e.to_str()) {
        Some("csv") => BackfillSource::Csv(SampleCsvFileSource::new(file_path)),
        _ => BackfillSource::Ndjson(SampleNdjsonFileSource::new(file_path)),
    };

    let sink = SampleStoreSink::new(
        store,
        cfg.sink.batch_size,
        cfg.sink.max_retries,
        Duration::from_millis(cfg.sink.retry_backoff_ms),
    );

    let pipeline =
        Pipeline::<_, Sample, _>::new(source, sink).with_transform(transform::SampleValidation);

    // Ctrl-C stops reading the file; rows already read are still written.
    let shutdown = CancellationToken::new();
    {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::warn!("interrupted, flushing rows read so far");
                shutdown.cancel();
            }
        });
    }

    pipeline.run_until(shutdown.clone()).await?;
    if shutdown.is_cancelled() {
        tracing::warn!(file = %file_path, "backfill interrupted");
    } else {
        tracing::info!(file = %file_path, "backfill complete");
    }

    Ok(())
}

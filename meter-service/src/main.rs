use anyhow::Result;
use meter_client::{db::SqliteStore, domain::Sample, engine::LocalCalendar, MeteringEngine};
use meter_service::{
    api::{self, AppState},
    config::AppConfig,
    metrics_server,
    notifier::TelegramNotifier,
    observability,
    pipeline::Pipeline,
    sinks::SampleStoreSink,
    sources::{HttpSampleSource, IngestStatus},
    transform,
};
use std::{sync::Arc, time::Duration};
use tokio_util::sync::CancellationToken;

#[tokio::main]
async fn main() -> Result<()> {
    observability::init_tracing();

    let cfg = AppConfig::load()?;

    let store = Arc::new(SqliteStore::connect(&cfg.database.url, cfg.database.max_connections).await?);
    let status = IngestStatus::new(store.clone());
    status.set("starting").await;

    let notifier = TelegramNotifier::new(Duration::from_secs(cfg.engine.notify_timeout_secs))?;
    let calendar = LocalCalendar::from_offset_minutes(cfg.engine.utc_offset_minutes);
    let engine = Arc::new(MeteringEngine::new(
        store.clone(),
        store.clone(),
        Arc::new(notifier),
        calendar,
    ));

    let shutdown = CancellationToken::new();
    if let Some(metrics_cfg) = &cfg.metrics {
        metrics_server::init(&metrics_cfg.bind_addr, shutdown.clone())?;
    }
    {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            match tokio::signal::ctrl_c().await {
                Ok(()) => tracing::info!("shutdown requested"),
                Err(e) => tracing::error!(error = %e, "failed to listen for shutdown signal"),
            }
            shutdown.cancel();
        });
    }

    let source = HttpSampleSource::new(
        &cfg.ingest.http_bind_addr,
        cfg.ingest.channel_capacity,
        cfg.ingest.max_body_bytes,
        Some(status.clone()),
        shutdown.clone(),
    )
    .await?;
    let sink = SampleStoreSink::new(
        store.clone(),
        cfg.sink.batch_size,
        cfg.sink.max_retries,
        Duration::from_millis(cfg.sink.retry_backoff_ms),
    )
    .with_status(status.clone());
    let pipeline =
        Pipeline::<_, Sample, _>::new(source, sink).with_transform(transform::SampleValidation);

    // The source ends by itself on shutdown, after draining accepted readings.
    let ingest = {
        let shutdown = shutdown.clone();
        async move {
            let res = pipeline.run().await;
            if let Err(e) = &res {
                tracing::error!(error = %e, "ingest pipeline stopped");
                shutdown.cancel();
            }
            res.map_err(anyhow::Error::from)
        }
    };

    tokio::try_join!(api::serve(&cfg.api.bind_addr, AppState { engine }, shutdown.clone()), ingest)?;

    status.set("stopped").await;
    tracing::info!("shutdown complete");
    Ok(())
}

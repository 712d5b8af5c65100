//! Prometheus exposition of the ingest, sink, notifier and API counters.

use std::net::SocketAddr;

use axum::{extract::State, routing::get, Router};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use tokio_util::sync::CancellationToken;

const COUNTERS: &[(&str, &str)] = &[
    ("http_ingest_requests_total", "Ingest requests received"),
    ("http_ingest_failed_total", "Ingest requests refused because the pipeline was closed"),
    ("backfill_sample_parse_errors_total", "NDJSON backfill lines that failed to parse"),
    ("sample_csv_parse_errors_total", "CSV backfill rows that failed to parse"),
    ("validation_sample_rejected_total", "Readings rejected by validation"),
    ("samples_ingested_total", "Readings written to the sample store"),
    ("sample_sink_retries_total", "Sample store writes retried"),
    ("sample_sink_errors_total", "Sample store batches abandoned after retries"),
    ("notify_sent_total", "Notifications delivered"),
    ("notify_send_failures_total", "Notifications that failed to deliver"),
    ("api_storage_errors_total", "API requests answered 503 because of storage failures"),
];

const HISTOGRAMS: &[(&str, &str)] = &[(
    "ingest_end_to_end_latency_seconds",
    "Time from receiving a reading to storing its batch",
)];

/// Registers help text for every metric the service emits.
pub fn describe() {
    for (name, help) in COUNTERS {
        metrics::describe_counter!(*name, *help);
    }
    for (name, help) in HISTOGRAMS {
        metrics::describe_histogram!(*name, *help);
    }
}

/// Installs the global Prometheus recorder and serves `/metrics` on
/// `bind_addr` until `shutdown` fires.
pub fn init(bind_addr: &str, shutdown: CancellationToken) -> anyhow::Result<PrometheusHandle> {
    let addr: SocketAddr = bind_addr
        .parse()
        .map_err(|e| anyhow::anyhow!("invalid metrics bind address '{bind_addr}': {e}"))?;

    let handle = PrometheusBuilder::new()
        .install_recorder()
        .map_err(|e| anyhow::anyhow!("failed to install Prometheus recorder: {e}"))?;
    describe();

    let app = Router::new()
        .route("/metrics", get(render))
        .with_state(handle.clone());

    tokio::spawn(async move {
        match tokio::net::TcpListener::bind(addr).await {
            Ok(listener) => {
                tracing::info!(%addr, "metrics endpoint listening");
                let res = axum::serve(listener, app.into_make_service())
                    .with_graceful_shutdown(async move { shutdown.cancelled().await })
                    .await;
                if let Err(e) = res {
                    tracing::error!(error = %e, "metrics server error");
                }
            }
            Err(e) => tracing::error!(error = %e, %addr, "failed to bind metrics listener"),
        }
    });

    Ok(handle)
}

async fn render(State(handle): State<PrometheusHandle>) -> String {
    handle.render()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn described_counters_render_with_help_text() {
        let recorder = PrometheusBuilder::new().build_recorder();
        let handle = recorder.handle();

        metrics::with_local_recorder(&recorder, || {
            describe();
            metrics::counter!("samples_ingested_total").increment(3);
        });

        let text = handle.render();
        assert!(text.contains("# HELP samples_ingested_total Readings written to the sample store"));
        assert!(text.contains("samples_ingested_total 3"));
    }

    #[test]
    fn metric_names_are_unique() {
        let mut names: Vec<&str> = COUNTERS.iter().chain(HISTOGRAMS).map(|(n, _)| *n).collect();
        let total = names.len();
        names.sort_unstable();
        names.dedup();
        assert_eq!(names.len(), total);
    }

    #[test]
    fn bad_bind_address_is_rejected_before_installing() {
        assert!(init("not-an-address", CancellationToken::new()).is_err());
    }
}

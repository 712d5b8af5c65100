use std::{net::SocketAddr, sync::Arc, time::SystemTime};

use axum::{extract::DefaultBodyLimit, extract::State, http::StatusCode, routing::post, Json, Router};
use futures::StreamExt;
use meter_client::domain::Sample;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;

use super::{IncomingSample, IngestStatus};
use crate::pipeline::{Envelope, EnvelopeStream, PipelineError, Source};

#[derive(Clone)]
struct SharedSender {
    tx: mpsc::Sender<Envelope<Sample>>,
}

/// Push source: counter readings POSTed to `/ingest/samples`.
///
/// On shutdown the listener stops accepting requests and the channel closes
/// once in-flight requests finish, so every reading already answered with
/// `202` is still delivered before the stream ends.
#[derive(Clone)]
pub struct HttpSampleSource {
    receiver: Arc<tokio::sync::Mutex<Option<mpsc::Receiver<Envelope<Sample>>>>>,
    local_addr: Option<SocketAddr>,
}

/// A request body may carry one reading or an array of them.
#[derive(Debug, serde::Deserialize)]
#[serde(untagged)]
enum IncomingBatch {
    Many(Vec<IncomingSample>),
    One(IncomingSample),
}

impl IncomingBatch {
    fn into_vec(self) -> Vec<IncomingSample> {
        match self {
            Self::Many(v) => v,
            Self::One(s) => vec![s],
        }
    }
}

impl HttpSampleSource {
    pub async fn new(
        bind_addr: &str,
        channel_capacity: usize,
        max_body_bytes: usize,
        status: Option<IngestStatus>,
        shutdown: CancellationToken,
    ) -> Result<Self, PipelineError> {
        let (tx, rx) = mpsc::channel(channel_capacity);

        let addr: SocketAddr = bind_addr
            .parse()
            .map_err(|e| PipelineError::Source(format!("invalid bind addr: {e}")))?;

        let local_addr = match tokio::net::TcpListener::bind(addr).await {
            Ok(listener) => {
                let local = listener.local_addr().ok();
                tracing::info!(addr = ?local, "sample ingest listener bound");
                if let Some(status) = &status {
                    status.set("listening").await;
                }

                // The router owns the only sender; dropping it ends the stream.
                let app = router(SharedSender { tx }, max_body_bytes);
                tokio::spawn(async move {
                    let res = axum::serve(listener, app.into_make_service())
                        .with_graceful_shutdown(async move { shutdown.cancelled().await })
                        .await;
                    if let Err(e) = res {
                        tracing::error!(error = %e, "sample ingest server error");
                        if let Some(status) = &status {
                            status.set(&format!("server_error: {e}")).await;
                        }
                    }
                });
                local
            }
            Err(e) => {
                tracing::error!(error = %e, %addr, "failed to bind sample ingest listener");
                if let Some(status) = &status {
                    status.set(&format!("bind_failed: {e}")).await;
                }
                None
            }
        };

        Ok(Self {
            receiver: Arc::new(tokio::sync::Mutex::new(Some(rx))),
            local_addr,
        })
    }

    /// Address actually bound, if the listener came up.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }
}

fn router(sender: SharedSender, max_body_bytes: usize) -> Router {
    Router::new()
        .route("/ingest/samples", post(ingest_samples))
        .layer(DefaultBodyLimit::max(max_body_bytes))
        .with_state(sender)
}

#[async_trait::async_trait]
impl Source<Sample> for HttpSampleSource {
    async fn stream(&self) -> EnvelopeStream<Sample> {
        let mut guard = self.receiver.lock().await;
        match guard.take() {
            Some(rx) => Box::pin(ReceiverStream::new(rx).map(Ok)),
            None => Box::pin(futures::stream::once(async {
                Err(PipelineError::Source(
                    "sample stream already taken; only one consumer supported".to_string(),
                ))
            })),
        }
    }
}

async fn ingest_samples(
    State(sender): State<SharedSender>,
    Json(payload): Json<IncomingBatch>,
) -> Result<StatusCode, StatusCode> {
    metrics::counter!("http_ingest_requests_total").increment(1);

    for incoming in payload.into_vec() {
        let received_at = SystemTime::now();
        let env = Envelope {
            payload: incoming.into_sample(received_at),
            received_at,
        };

        if sender.tx.send(env).await.is_err() {
            metrics::counter!("http_ingest_failed_total").increment(1);
            return Err(StatusCode::SERVICE_UNAVAILABLE);
        }
    }

    Ok(StatusCode::ACCEPTED)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn body_accepts_single_object_or_array() {
        let one: IncomingBatch = serde_json::from_str(r#"{"count": 5}"#).unwrap();
        assert_eq!(one.into_vec().len(), 1);

        let many: IncomingBatch =
            serde_json::from_str(r#"[{"count": 5, "timestamp": 1}, {"count": 6}]"#).unwrap();
        assert_eq!(many.into_vec().len(), 2);

        assert!(serde_json::from_str::<IncomingBatch>(r#"{"count": 5, "pulses": 1}"#).is_err());
    }

    #[tokio::test]
    async fn handler_forwards_readings_in_order() {
        let (tx, mut rx) = mpsc::channel(8);
        let batch: IncomingBatch = serde_json::from_str(
            r#"[{"count": 100, "timestamp": 1700000000}, {"count": 101, "timestamp": 1700000060}]"#,
        )
        .unwrap();

        let status = ingest_samples(State(SharedSender { tx }), Json(batch)).await;
        assert_eq!(status, Ok(StatusCode::ACCEPTED));

        assert_eq!(rx.recv().await.unwrap().payload, Sample::new(1_700_000_000, 100));
        assert_eq!(rx.recv().await.unwrap().payload, Sample::new(1_700_000_060, 101));
    }

    #[tokio::test]
    async fn shutdown_delivers_accepted_readings_then_ends() {
        let shutdown = CancellationToken::new();
        let source = HttpSampleSource::new("127.0.0.1:0", 16, 64 * 1024, None, shutdown.clone())
            .await
            .unwrap();
        let addr = source.local_addr().unwrap();

        let client = reqwest::Client::new();
        let resp = client
            .post(format!("http://{addr}/ingest/samples"))
            .json(&serde_json::json!([
                {"count": 7, "timestamp": 1700000000},
                {"count": 9, "timestamp": 1700000060}
            ]))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status().as_u16(), 202);
        drop(client);

        shutdown.cancel();
        let items: Vec<_> = source.stream().await.collect().await;
        let samples: Vec<Sample> = items.into_iter().map(|r| r.unwrap().payload).collect();
        assert_eq!(
            samples,
            vec![Sample::new(1_700_000_000, 7), Sample::new(1_700_000_060, 9)]
        );
    }

    #[tokio::test]
    async fn unbindable_address_yields_an_empty_stream() {
        let taken = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = taken.local_addr().unwrap().to_string();

        let source = HttpSampleSource::new(&addr, 4, 1024, None, CancellationToken::new())
            .await
            .unwrap();
        assert!(source.local_addr().is_none());

        let items: Vec<_> = source.stream().await.collect().await;
        assert!(items.is_empty());
    }

    #[tokio::test]
    async fn handler_reports_closed_pipeline() {
        let (tx, rx) = mpsc::channel(1);
        drop(rx);
        let batch: IncomingBatch = serde_json::from_str(r#"{"count": 1}"#).unwrap();

        let status = ingest_samples(State(SharedSender { tx }), Json(batch)).await;
        assert_eq!(status, Err(StatusCode::SERVICE_UNAVAILABLE));
    }
}

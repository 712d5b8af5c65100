use std::{pin::Pin, sync::Arc, time::SystemTime};

use futures::{Stream, StreamExt};
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone)]
pub struct Envelope<T> {
    pub payload: T,
    pub received_at: SystemTime,
}

impl<T> Envelope<T> {
    pub fn now(payload: T) -> Self {
        Self {
            payload,
            received_at: SystemTime::now(),
        }
    }
}

#[derive(thiserror::Error, Debug)]
pub enum PipelineError {
    #[error("source error: {0}")]
    Source(String),
    #[error("transform error: {0}")]
    Transform(String),
    #[error("sink error: {0}")]
    Sink(String),
}

pub type EnvelopeStream<T> = Pin<Box<dyn Stream<Item = Result<Envelope<T>, PipelineError>> + Send>>;

#[async_trait::async_trait]
pub trait Source<T>: Send + Sync {
    async fn stream(&self) -> EnvelopeStream<T>;
}

#[async_trait::async_trait]
pub trait Transform<I, O>: Send + Sync {
    async fn apply(&self, input: Envelope<I>) -> Result<Envelope<O>, PipelineError>;
}

#[async_trait::async_trait]
pub trait Sink<T>: Send + Sync {
    async fn run<S>(&self, input: S) -> Result<(), PipelineError>
    where
        S: Stream<Item = Result<Envelope<T>, PipelineError>> + Send + Unpin + 'static;
}

/// A source feeding a sink through an ordered chain of same-type transforms.
pub struct Pipeline<S, T, K> {
    pub source: S,
    pub transforms: Vec<Arc<dyn Transform<T, T> + Send + Sync>>,
    pub sink: K,
}

impl<T, S, K> Pipeline<S, T, K>
where
    T: Send + 'static,
    S: Source<T> + Send + Sync + 'static,
    K: Sink<T> + Send + Sync + 'static,
{
    pub fn new(source: S, sink: K) -> Self {
        Self {
            source,
            transforms: Vec::new(),
            sink,
        }
    }

    pub fn with_transform(mut self, t: impl Transform<T, T> + 'static) -> Self {
        self.transforms.push(Arc::new(t));
        self
    }

    async fn build_stream(&self) -> EnvelopeStream<T> {
        let mut stream = self.source.stream().await;

        // Apply transforms in sequence (if any).
        for t in &self.transforms {
            let t_arc = t.clone();
            stream = Box::pin(stream.then(move |item| {
                let t_inner = t_arc.clone();
                async move {
                    match item {
                        Ok(env) => t_inner.apply(env).await,
                        Err(e) => Err(e),
                    }
                }
            }));
        }

        stream
    }

    /// Runs until the source is exhausted.
    pub async fn run(self) -> Result<(), PipelineError> {
        let stream = self.build_stream().await;
        self.sink.run(stream).await
    }

    /// Runs until the source is exhausted or `shutdown` fires. On shutdown the
    /// source stops being polled and the sink flushes what it already holds.
    pub async fn run_until(self, shutdown: CancellationToken) -> Result<(), PipelineError> {
        let stream = self.build_stream().await;
        let stopped = async move { shutdown.cancelled().await };
        self.sink.run(Box::pin(stream.take_until(stopped))).await
    }
}

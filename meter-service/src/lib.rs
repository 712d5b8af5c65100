pub mod api;
pub mod config;
pub mod metrics_server;
pub mod notifier;
pub mod observability;
pub mod pipeline;
pub mod sinks;
pub mod sources;
pub mod transform;

pub use pipeline::{Envelope, Pipeline};

pub mod csv_file;
pub mod http_json;
pub mod ndjson_file;

pub use csv_file::SampleCsvFileSource;
pub use http_json::HttpSampleSource;
pub use ndjson_file::SampleNdjsonFileSource;

use std::{sync::Arc, time::SystemTime};

use meter_client::{
    db::SettingsStore,
    domain::{settings::keys, Sample},
};

/// Wire shape of one counter reading.
///
/// Unknown fields are rejected; a missing timestamp means "now".
#[derive(Debug, Clone, PartialEq, Eq, serde::Deserialize)]
#[serde(deny_unknown_fields)]
pub struct IncomingSample {
    pub count: i64,
    #[serde(default)]
    pub timestamp: Option<i64>,
}

impl IncomingSample {
    pub fn into_sample(self, received_at: SystemTime) -> Sample {
        let ts = self.timestamp.unwrap_or_else(|| unix_seconds(received_at));
        Sample::new(ts, self.count)
    }
}

pub(crate) fn unix_seconds(t: SystemTime) -> i64 {
    time::OffsetDateTime::from(t).unix_timestamp()
}

/// Ingestion health published through the Settings Store for the dashboard.
#[derive(Clone)]
pub struct IngestStatus {
    store: Arc<dyn SettingsStore>,
}

impl IngestStatus {
    pub fn new(store: Arc<dyn SettingsStore>) -> Self {
        Self { store }
    }

    pub async fn set(&self, status: &str) {
        if let Err(e) = self.store.set(keys::INGEST_STATUS, status).await {
            tracing::warn!(error = %e, status, "failed to record ingest status");
        }
    }

    pub async fn record_last(&self, sample: &Sample) {
        let entries = [
            (keys::LAST_MSG_TS.to_string(), sample.timestamp.to_string()),
            (keys::LAST_MSG_COUNT.to_string(), sample.count.to_string()),
        ];
        if let Err(e) = self.store.set_many(&entries).await {
            tracing::warn!(error = %e, "failed to record last message");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn missing_timestamp_uses_receive_time() {
        let parsed: IncomingSample = serde_json::from_str(r#"{"count": 17}"#).unwrap();
        let at = SystemTime::UNIX_EPOCH + Duration::from_secs(1_700_000_000);
        assert_eq!(parsed.into_sample(at), Sample::new(1_700_000_000, 17));
    }

    #[test]
    fn explicit_timestamp_wins() {
        let parsed: IncomingSample =
            serde_json::from_str(r#"{"count": 3, "timestamp": 1700000123}"#).unwrap();
        assert_eq!(parsed.into_sample(SystemTime::now()), Sample::new(1_700_000_123, 3));
    }

    #[test]
    fn unknown_or_mistyped_fields_are_rejected() {
        assert!(serde_json::from_str::<IncomingSample>(r#"{"count": 1, "extra": 2}"#).is_err());
        assert!(serde_json::from_str::<IncomingSample>(r#"{"count": "1"}"#).is_err());
        assert!(serde_json::from_str::<IncomingSample>(r#"{"timestamp": 1}"#).is_err());
    }
}

use rust_decimal::Decimal;
use serde::{de::DeserializeOwned, Deserialize, Serialize};

use crate::{
    db::SettingsStore,
    domain::Settings,
    error::{ConfigError, StorageError},
};

/// Baseline against which "usage since" is measured.
///
/// Persisted as a single JSON record so that all four fields change together.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Anchor {
    pub revision: u64,
    pub base_pulses: i64,
    pub base_remaining_supply: Decimal,
    pub base_meter_reading: Decimal,
    /// Unix seconds of the last calibration, 0 when never calibrated.
    pub calibrated_at: i64,
}

impl Anchor {
    pub const KEY: &'static str = "anchor";

    /// The anchor implied by initial configuration, used until the first calibration.
    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            revision: 0,
            base_pulses: settings.initial_base_pulses,
            base_remaining_supply: settings.initial_supply,
            base_meter_reading: settings.desired_meter_reading,
            calibrated_at: 0,
        }
    }

    pub fn is_calibrated(&self) -> bool {
        self.calibrated_at > 0
    }

    /// Loads the stored anchor. Falls back to initial configuration when the
    /// engine was never calibrated or the record does not decode.
    pub async fn load(store: &dyn SettingsStore, settings: &Settings) -> Result<Self, StorageError> {
        let stored: Option<Anchor> = load_record(store, Self::KEY).await?;
        Ok(match stored {
            Some(a) if a.is_calibrated() => a,
            _ => Self::from_settings(settings),
        })
    }

    pub fn encode(&self) -> Result<String, StorageError> {
        encode_record(Self::KEY, self)
    }
}

/// Per-episode low-supply alert bookkeeping.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotificationState {
    pub revision: u64,
    /// Alerts sent since supply last rose above the threshold.
    pub notify_count: i64,
    pub first_notify_time: i64,
    /// Most recent alert of any episode.
    pub last_notify_time: i64,
}

impl NotificationState {
    pub const KEY: &'static str = "low_supply_notify_state";

    pub fn is_cleared(&self) -> bool {
        self.notify_count == 0 && self.first_notify_time == 0 && self.last_notify_time == 0
    }

    /// The same state with every counter reset, at the next revision.
    pub fn cleared(&self) -> Self {
        Self {
            revision: self.revision + 1,
            ..Self::default()
        }
    }

    pub async fn load(store: &dyn SettingsStore) -> Result<Self, StorageError> {
        Ok(load_record(store, Self::KEY).await?.unwrap_or_default())
    }

    pub async fn store(&self, store: &dyn SettingsStore) -> Result<(), StorageError> {
        store.set(Self::KEY, &encode_record(Self::KEY, self)?).await
    }
}

async fn load_record<T: DeserializeOwned>(
    store: &dyn SettingsStore,
    key: &str,
) -> Result<Option<T>, StorageError> {
    let raw = store.get(key, "").await?;
    if raw.is_empty() {
        return Ok(None);
    }
    match serde_json::from_str(&raw) {
        Ok(v) => Ok(Some(v)),
        Err(e) => {
            let err = ConfigError::InvalidValue {
                key: key.to_string(),
                value: raw,
                reason: e.to_string(),
            };
            tracing::warn!(error = %err, "discarding undecodable state record");
            Ok(None)
        }
    }
}

fn encode_record<T: Serialize>(key: &str, value: &T) -> Result<String, StorageError> {
    serde_json::to_string(value).map_err(|e| StorageError::Corrupt {
        key: key.to_string(),
        reason: e.to_string(),
    })
}

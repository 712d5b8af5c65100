use std::{fmt::Display, str::FromStr};

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::{
    db::SettingsStore,
    error::{ConfigError, StorageError},
};

/// Settings Store keys owned by the operator or by the ingestion worker.
pub mod keys {
    pub const GAS_PER_PULSE: &str = "gas_per_pulse";
    pub const INITIAL_SUPPLY: &str = "initial_supply";
    pub const INITIAL_BASE_PULSES: &str = "initial_base_pulses";
    pub const METER_BASE: &str = "meter_base";
    pub const DESIRED_METER_READING: &str = "desired_meter_reading";

    pub const NOTIFY_ENABLED: &str = "notify_enabled";
    pub const NOTIFY_BOT_TOKEN: &str = "notify_bot_token";
    pub const NOTIFY_CHAT_ID: &str = "notify_chat_id";
    pub const NOTIFY_API_ENDPOINT: &str = "notify_api_endpoint";
    pub const NOTIFY_THRESHOLD: &str = "notify_threshold";
    pub const NOTIFY_MAX_COUNT: &str = "notify_max_count";
    pub const NOTIFY_INTERVAL_HOURS: &str = "notify_interval_hours";

    pub const INGEST_STATUS: &str = "ingest_status";
    pub const LAST_MSG_TS: &str = "last_msg_ts";
    pub const LAST_MSG_COUNT: &str = "last_msg_count";
}

pub const DEFAULT_API_ENDPOINT: &str = "https://api.telegram.org";
pub const DEFAULT_NOTIFY_MAX_COUNT: i64 = 2;

/// Operator configuration, read as a snapshot on every computation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Physical units (m³) represented by one pulse.
    pub gas_per_pulse: Decimal,
    pub initial_supply: Decimal,
    pub initial_base_pulses: i64,
    pub meter_base: Decimal,
    pub desired_meter_reading: Decimal,
    pub notify: NotifySettings,
}

/// Low-supply alert policy plus the outbound channel it is delivered on.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NotifySettings {
    pub enabled: bool,
    pub bot_token: String,
    pub chat_id: String,
    pub api_endpoint: String,
    pub threshold: Decimal,
    pub max_count: i64,
    pub interval_hours: Decimal,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            gas_per_pulse: Decimal::new(1, 3),
            initial_supply: Decimal::new(100_000, 3),
            initial_base_pulses: 0,
            meter_base: Decimal::new(0, 3),
            desired_meter_reading: Decimal::new(0, 3),
            notify: NotifySettings::default(),
        }
    }
}

impl Default for NotifySettings {
    fn default() -> Self {
        Self {
            enabled: false,
            bot_token: String::new(),
            chat_id: String::new(),
            api_endpoint: DEFAULT_API_ENDPOINT.to_string(),
            threshold: Decimal::new(50, 1),
            max_count: DEFAULT_NOTIFY_MAX_COUNT,
            interval_hours: Decimal::new(20, 1),
        }
    }
}

impl NotifySettings {
    /// Missing credentials make the channel unusable even when enabled.
    pub fn is_configured(&self) -> bool {
        !self.bot_token.is_empty() && !self.chat_id.is_empty()
    }

    pub fn interval_seconds(&self) -> i64 {
        use rust_decimal::prelude::ToPrimitive;

        (self.interval_hours * Decimal::from(3600))
            .trunc()
            .to_i64()
            .unwrap_or(0)
    }
}

pub(crate) fn parse_value<T>(key: &str, raw: &str) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: Display,
{
    raw.trim().parse().map_err(|e: T::Err| ConfigError::InvalidValue {
        key: key.to_string(),
        value: raw.to_string(),
        reason: e.to_string(),
    })
}

pub(crate) fn parse_flag(key: &str, raw: &str) -> Result<bool, ConfigError> {
    match raw.trim() {
        "1" | "true" => Ok(true),
        "0" | "false" | "" => Ok(false),
        other => Err(ConfigError::InvalidValue {
            key: key.to_string(),
            value: other.to_string(),
            reason: "expected 0 or 1".to_string(),
        }),
    }
}

/// Unwraps a parsed setting, substituting `default` when it did not parse.
pub(crate) fn or_default<T>(parsed: Result<T, ConfigError>, default: T) -> T {
    match parsed {
        Ok(v) => v,
        Err(e) => {
            tracing::warn!(error = %e, "invalid stored setting, using default");
            default
        }
    }
}

async fn read_parsed<T>(store: &dyn SettingsStore, key: &str, default: T) -> Result<T, StorageError>
where
    T: FromStr,
    T::Err: Display,
{
    let raw = store.get(key, "").await?;
    if raw.trim().is_empty() {
        return Ok(default);
    }
    Ok(or_default(parse_value(key, &raw), default))
}

fn flag(v: bool) -> String {
    let raw = if v { "1" } else { "0" };
    raw.to_string()
}

impl Settings {
    pub async fn load(store: &dyn SettingsStore) -> Result<Self, StorageError> {
        let d = Settings::default();

        let enabled_raw = store.get(keys::NOTIFY_ENABLED, "0").await?;
        let notify = NotifySettings {
            enabled: or_default(parse_flag(keys::NOTIFY_ENABLED, &enabled_raw), false),
            bot_token: store.get(keys::NOTIFY_BOT_TOKEN, "").await?,
            chat_id: store.get(keys::NOTIFY_CHAT_ID, "").await?,
            api_endpoint: store
                .get(keys::NOTIFY_API_ENDPOINT, DEFAULT_API_ENDPOINT)
                .await?,
            threshold: read_parsed(store, keys::NOTIFY_THRESHOLD, d.notify.threshold).await?,
            max_count: read_parsed(store, keys::NOTIFY_MAX_COUNT, d.notify.max_count).await?,
            interval_hours: read_parsed(store, keys::NOTIFY_INTERVAL_HOURS, d.notify.interval_hours)
                .await?,
        };

        Ok(Settings {
            gas_per_pulse: read_parsed(store, keys::GAS_PER_PULSE, d.gas_per_pulse).await?,
            initial_supply: read_parsed(store, keys::INITIAL_SUPPLY, d.initial_supply).await?,
            initial_base_pulses: read_parsed(store, keys::INITIAL_BASE_PULSES, d.initial_base_pulses)
                .await?,
            meter_base: read_parsed(store, keys::METER_BASE, d.meter_base).await?,
            desired_meter_reading: read_parsed(
                store,
                keys::DESIRED_METER_READING,
                d.desired_meter_reading,
            )
            .await?,
            notify,
        })
    }

    /// Writes every operator-owned key in one batch.
    pub async fn save(&self, store: &dyn SettingsStore) -> Result<(), StorageError> {
        let n = &self.notify;
        let entries = vec![
            (keys::GAS_PER_PULSE.to_string(), self.gas_per_pulse.to_string()),
            (keys::INITIAL_SUPPLY.to_string(), self.initial_supply.to_string()),
            (keys::INITIAL_BASE_PULSES.to_string(), self.initial_base_pulses.to_string()),
            (keys::METER_BASE.to_string(), self.meter_base.to_string()),
            (keys::DESIRED_METER_READING.to_string(), self.desired_meter_reading.to_string()),
            (keys::NOTIFY_ENABLED.to_string(), flag(n.enabled)),
            (keys::NOTIFY_BOT_TOKEN.to_string(), n.bot_token.clone()),
            (keys::NOTIFY_CHAT_ID.to_string(), n.chat_id.clone()),
            (keys::NOTIFY_API_ENDPOINT.to_string(), n.api_endpoint.clone()),
            (keys::NOTIFY_THRESHOLD.to_string(), n.threshold.to_string()),
            (keys::NOTIFY_MAX_COUNT.to_string(), n.max_count.to_string()),
            (keys::NOTIFY_INTERVAL_HOURS.to_string(), n.interval_hours.to_string()),
        ];
        store.set_many(&entries).await
    }
}

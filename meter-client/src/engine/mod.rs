//! The metering and calibration engine.

pub mod calendar;
pub mod calibration;
pub mod delta;
pub mod throttle;
pub mod units;
pub mod window;

use std::sync::Arc;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

pub use calendar::LocalCalendar;
pub use calibration::{CalibrationManager, CalibrationRequest, CalibrationSummary, Estimate};
pub use throttle::{NotificationThrottle, Notifier, ThrottleDecision};
pub use window::WindowAggregator;

use crate::{
    db::{SampleStore, SettingsStore},
    domain::{settings::keys, Sample, Settings},
    error::{SendError, StorageError},
};

/// Dashboard figures in physical units, formatted to three decimals.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub today_usage: String,
    pub week_usage: String,
    pub month_usage: String,
    pub total_used: String,
    pub meter_reading: String,
    pub remaining_supply: String,
    pub ingest_status: String,
    pub last_msg_time: String,
}

pub struct MeteringEngine {
    samples: Arc<dyn SampleStore>,
    settings: Arc<dyn SettingsStore>,
    aggregator: WindowAggregator,
    calibration: CalibrationManager,
    throttle: NotificationThrottle,
    calendar: LocalCalendar,
}

impl MeteringEngine {
    pub fn new(
        samples: Arc<dyn SampleStore>,
        settings: Arc<dyn SettingsStore>,
        notifier: Arc<dyn Notifier>,
        calendar: LocalCalendar,
    ) -> Self {
        Self {
            aggregator: WindowAggregator::new(samples.clone(), calendar),
            calibration: CalibrationManager::new(settings.clone()),
            throttle: NotificationThrottle::new(settings.clone(), notifier, calendar),
            samples,
            settings,
            calendar,
        }
    }

    pub fn calendar(&self) -> &LocalCalendar {
        &self.calendar
    }

    pub fn aggregator(&self) -> &WindowAggregator {
        &self.aggregator
    }

    pub fn sample_store(&self) -> &Arc<dyn SampleStore> {
        &self.samples
    }

    pub fn settings_store(&self) -> &Arc<dyn SettingsStore> {
        &self.settings
    }

    pub fn now(&self) -> OffsetDateTime {
        self.calendar.now()
    }

    pub async fn record_sample(&self, sample: Sample) -> Result<(), StorageError> {
        self.samples.append(sample).await
    }

    pub async fn recent_samples(&self, limit: usize) -> Result<Vec<Sample>, StorageError> {
        self.samples.recent(limit).await
    }

    pub async fn load_settings(&self) -> Result<Settings, StorageError> {
        Settings::load(self.settings.as_ref()).await
    }

    pub async fn save_settings(&self, settings: &Settings) -> Result<(), StorageError> {
        settings.save(self.settings.as_ref()).await
    }

    pub async fn usage_in_window(&self, start: i64, end: i64) -> Result<i64, StorageError> {
        self.aggregator.usage_in_window(start, end).await
    }

    pub async fn usage_today(&self) -> Result<i64, StorageError> {
        self.aggregator.usage_today(self.now()).await
    }

    pub async fn usage_this_week(&self) -> Result<i64, StorageError> {
        self.aggregator.usage_this_week(self.now()).await
    }

    pub async fn usage_this_month(&self) -> Result<i64, StorageError> {
        self.aggregator.usage_this_month(self.now()).await
    }

    pub async fn usage_lifetime(&self) -> Result<i64, StorageError> {
        self.aggregator.usage_lifetime().await
    }

    pub async fn hourly_buckets_today(&self, now: OffsetDateTime) -> Result<[i64; 24], StorageError> {
        self.aggregator.hourly_buckets_today(now).await
    }

    pub async fn monthly_buckets_this_year(&self, now: OffsetDateTime) -> Result<[i64; 12], StorageError> {
        self.aggregator.monthly_buckets_this_year(now).await
    }

    pub async fn calibrate(&self, request: &CalibrationRequest) -> Result<CalibrationSummary, StorageError> {
        self.calibrate_at(request, self.now()).await
    }

    pub async fn calibrate_at(
        &self,
        request: &CalibrationRequest,
        now: OffsetDateTime,
    ) -> Result<CalibrationSummary, StorageError> {
        let settings = self.load_settings().await?;
        self.calibration
            .calibrate(&self.aggregator, &settings, request, now.unix_timestamp())
            .await
    }

    pub async fn current_estimate(&self) -> Result<Estimate, StorageError> {
        let settings = self.load_settings().await?;
        self.calibration
            .current_estimate(&self.aggregator, &settings)
            .await
    }

    pub async fn check_and_notify(&self, settings: &Settings, remaining: Decimal, now: OffsetDateTime) {
        self.throttle
            .check_and_notify(&settings.notify, remaining, now)
            .await;
    }

    /// Sends a one-off message through the configured channel, bypassing the throttle.
    pub async fn send_test_notification(&self, settings: &Settings) -> Result<(), SendError> {
        let notify = &settings.notify;
        if !notify.is_configured() {
            return Err(SendError::NotConfigured(
                "bot token and chat id are required".to_string(),
            ));
        }
        if !notify.enabled {
            return Err(SendError::NotConfigured("notifications are disabled".to_string()));
        }
        let message = format!(
            "🧪 <b>Test notification</b>\n\nThis message confirms the alert channel is configured.\n\n⏰ Sent at: {}",
            self.calendar.format(self.now())
        );
        self.throttle.notifier().send(notify, &message).await
    }

    pub async fn metrics(&self) -> Result<MetricsSnapshot, StorageError> {
        self.metrics_at(self.now()).await
    }

    /// Computes the dashboard and, as a side effect, evaluates the low-supply alert.
    pub async fn metrics_at(&self, now: OffsetDateTime) -> Result<MetricsSnapshot, StorageError> {
        let settings = self.load_settings().await?;
        let per_pulse = settings.gas_per_pulse;

        let today = self.aggregator.usage_today(now).await?;
        let week = self.aggregator.usage_this_week(now).await?;
        let month = self.aggregator.usage_this_month(now).await?;
        let lifetime = self.aggregator.usage_lifetime().await?;

        let anchor = self.calibration.anchor(&settings).await?;
        let estimate = Estimate::from_anchor(&anchor, lifetime, per_pulse);

        let ingest_status = self
            .settings
            .get(keys::INGEST_STATUS, "not_started")
            .await?;
        let last_msg_time = self
            .settings
            .get(keys::LAST_MSG_TS, "")
            .await?
            .parse::<i64>()
            .ok()
            .and_then(|ts| self.calendar.format_unix(ts))
            .unwrap_or_default();

        let snapshot = MetricsSnapshot {
            today_usage: units::fixed3(units::pulses_to_units(today, per_pulse)),
            week_usage: units::fixed3(units::pulses_to_units(week, per_pulse)),
            month_usage: units::fixed3(units::pulses_to_units(month, per_pulse)),
            total_used: units::fixed3(units::pulses_to_units(lifetime, per_pulse)),
            meter_reading: units::fixed3(estimate.meter_reading),
            remaining_supply: units::fixed3(estimate.remaining_supply),
            ingest_status,
            last_msg_time,
        };

        self.throttle
            .check_and_notify(&settings.notify, estimate.remaining_supply, now)
            .await;

        Ok(snapshot)
    }
}

//! Re-anchoring the baseline against a physical meter reading.

use std::sync::Arc;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use super::{units, window::WindowAggregator};
use crate::{
    db::SettingsStore,
    domain::{settings::keys, Anchor, Settings},
    error::StorageError,
};

/// Operator-supplied corrections. Absent fields keep the current estimate.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CalibrationRequest {
    pub remaining_supply: Option<Decimal>,
    pub meter_base: Option<Decimal>,
    pub desired_meter_reading: Option<Decimal>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CalibrationSummary {
    pub base_pulses: i64,
    pub base_remaining_supply: Decimal,
    pub base_meter_reading: Decimal,
    pub calibrated_at: i64,
}

impl From<&Anchor> for CalibrationSummary {
    fn from(a: &Anchor) -> Self {
        Self {
            base_pulses: a.base_pulses,
            base_remaining_supply: a.base_remaining_supply,
            base_meter_reading: a.base_meter_reading,
            calibrated_at: a.calibrated_at,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Estimate {
    pub used_since_anchor: Decimal,
    pub meter_reading: Decimal,
    pub remaining_supply: Decimal,
}

impl Estimate {
    pub fn from_anchor(anchor: &Anchor, lifetime_pulses: i64, per_pulse: Decimal) -> Self {
        let used_pulses = lifetime_pulses.saturating_sub(anchor.base_pulses).max(0);
        let used = units::round3(units::pulses_to_units(used_pulses, per_pulse));
        Self {
            used_since_anchor: used,
            meter_reading: units::round3(anchor.base_meter_reading + used),
            remaining_supply: units::round3(anchor.base_remaining_supply - used),
        }
    }
}

pub struct CalibrationManager {
    store: Arc<dyn SettingsStore>,
    // Serializes calibrations; the anchor itself is one atomic record.
    lock: Mutex<()>,
}

impl CalibrationManager {
    pub fn new(store: Arc<dyn SettingsStore>) -> Self {
        Self {
            store,
            lock: Mutex::new(()),
        }
    }

    pub async fn anchor(&self, settings: &Settings) -> Result<Anchor, StorageError> {
        Anchor::load(self.store.as_ref(), settings).await
    }

    pub async fn current_estimate(
        &self,
        aggregator: &WindowAggregator,
        settings: &Settings,
    ) -> Result<Estimate, StorageError> {
        let lifetime = aggregator.usage_lifetime().await?;
        let anchor = self.anchor(settings).await?;
        Ok(Estimate::from_anchor(&anchor, lifetime, settings.gas_per_pulse))
    }

    /// Moves the baseline to the current lifetime total.
    ///
    /// The new anchor and any operator-visible setting it implies are written
    /// in one batch as the final step, so readers see the old or the new
    /// baseline, never a mix.
    pub async fn calibrate(
        &self,
        aggregator: &WindowAggregator,
        settings: &Settings,
        request: &CalibrationRequest,
        now: i64,
    ) -> Result<CalibrationSummary, StorageError> {
        let _guard = self.lock.lock().await;

        let lifetime = aggregator.usage_lifetime().await?;
        let previous = self.anchor(settings).await?;
        let current = Estimate::from_anchor(&previous, lifetime, settings.gas_per_pulse);

        let anchor = Anchor {
            revision: previous.revision + 1,
            base_pulses: lifetime,
            base_remaining_supply: request
                .remaining_supply
                .unwrap_or(current.remaining_supply),
            base_meter_reading: request
                .desired_meter_reading
                .or(request.meter_base)
                .unwrap_or(previous.base_meter_reading),
            calibrated_at: now,
        };

        let mut entries = vec![(Anchor::KEY.to_string(), anchor.encode()?)];
        if let Some(v) = request.remaining_supply {
            entries.push((keys::INITIAL_SUPPLY.to_string(), v.to_string()));
        }
        if let Some(v) = request.meter_base {
            entries.push((keys::METER_BASE.to_string(), v.to_string()));
        }
        if let Some(v) = request.desired_meter_reading.or(request.meter_base) {
            entries.push((keys::DESIRED_METER_READING.to_string(), v.to_string()));
        }
        self.store.set_many(&entries).await?;

        tracing::info!(
            base_pulses = anchor.base_pulses,
            base_remaining_supply = %anchor.base_remaining_supply,
            base_meter_reading = %anchor.base_meter_reading,
            revision = anchor.revision,
            "calibration anchor updated"
        );

        Ok(CalibrationSummary::from(&anchor))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        db::{MemoryStore, SampleStore},
        domain::Sample,
        engine::calendar::LocalCalendar,
    };

    fn dec(s: &str) -> Decimal {
        s.parse().unwrap()
    }

    async fn fixture(samples: &[Sample]) -> (Arc<MemoryStore>, WindowAggregator, CalibrationManager) {
        let store = Arc::new(MemoryStore::new());
        store.append_batch(samples).await.unwrap();
        let agg = WindowAggregator::new(store.clone(), LocalCalendar::default());
        let mgr = CalibrationManager::new(store.clone());
        (store, agg, mgr)
    }

    #[tokio::test]
    async fn estimate_before_calibration_uses_initial_settings() {
        let (_, agg, mgr) = fixture(&[Sample::new(0, 0), Sample::new(10, 2500)]).await;
        let settings = Settings::default();

        let est = mgr.current_estimate(&agg, &settings).await.unwrap();
        assert_eq!(est.used_since_anchor, dec("2.5"));
        assert_eq!(est.remaining_supply, dec("97.5"));
        assert_eq!(est.meter_reading, dec("2.5"));
    }

    #[tokio::test]
    async fn calibrate_with_supply_resets_remaining() {
        let (store, agg, mgr) = fixture(&[Sample::new(0, 0), Sample::new(10, 2500)]).await;
        let settings = Settings::default();

        let req = CalibrationRequest {
            remaining_supply: Some(dec("40.000")),
            ..Default::default()
        };
        let summary = mgr.calibrate(&agg, &settings, &req, 1_000).await.unwrap();
        assert_eq!(summary.base_pulses, 2500);
        assert_eq!(summary.base_remaining_supply, dec("40.000"));
        assert_eq!(summary.calibrated_at, 1_000);

        let est = mgr.current_estimate(&agg, &settings).await.unwrap();
        assert_eq!(est.remaining_supply, dec("40"));
        // No meter correction: the base reading is left as it was.
        assert_eq!(summary.base_meter_reading, Decimal::ZERO);
        assert_eq!(est.meter_reading, Decimal::ZERO);

        store.append(Sample::new(20, 3500)).await.unwrap();
        let est = mgr.current_estimate(&agg, &settings).await.unwrap();
        assert_eq!(est.remaining_supply, dec("39"));
        assert_eq!(est.meter_reading, dec("1"));
    }

    #[tokio::test]
    async fn calibrate_without_corrections_keeps_supply_and_base_reading() {
        let (_, agg, mgr) = fixture(&[Sample::new(0, 10), Sample::new(10, 1010)]).await;
        let settings = Settings::default();

        let before = mgr.current_estimate(&agg, &settings).await.unwrap();
        let summary = mgr
            .calibrate(&agg, &settings, &CalibrationRequest::default(), 50)
            .await
            .unwrap();
        let after = mgr.current_estimate(&agg, &settings).await.unwrap();

        assert_eq!(before.remaining_supply, after.remaining_supply);
        assert_eq!(summary.base_meter_reading, settings.desired_meter_reading);
        assert_eq!(after.meter_reading, settings.desired_meter_reading);
        assert_eq!(after.used_since_anchor, Decimal::ZERO);
    }

    #[tokio::test]
    async fn uncorrected_calibration_keeps_previous_calibrated_reading() {
        let (store, agg, mgr) = fixture(&[Sample::new(0, 0), Sample::new(10, 2500)]).await;
        let settings = Settings::default();

        let req = CalibrationRequest {
            desired_meter_reading: Some(dec("50.000")),
            ..Default::default()
        };
        mgr.calibrate(&agg, &settings, &req, 1).await.unwrap();

        store.append(Sample::new(20, 4500)).await.unwrap();
        let summary = mgr
            .calibrate(&agg, &settings, &CalibrationRequest::default(), 2)
            .await
            .unwrap();
        assert_eq!(summary.base_pulses, 4500);
        assert_eq!(summary.base_meter_reading, dec("50"));
        assert_eq!(store.get(keys::DESIRED_METER_READING, "").await.unwrap(), "50.000");
    }

    #[tokio::test]
    async fn meter_reading_prefers_desired_over_base() {
        let (store, agg, mgr) = fixture(&[Sample::new(0, 0)]).await;
        let settings = Settings::default();

        let req = CalibrationRequest {
            remaining_supply: None,
            meter_base: Some(dec("100")),
            desired_meter_reading: Some(dec("123.456")),
        };
        let summary = mgr.calibrate(&agg, &settings, &req, 5).await.unwrap();
        assert_eq!(summary.base_meter_reading, dec("123.456"));
        assert_eq!(store.get(keys::METER_BASE, "").await.unwrap(), "100");
        assert_eq!(store.get(keys::DESIRED_METER_READING, "").await.unwrap(), "123.456");

        let req = CalibrationRequest {
            meter_base: Some(dec("200")),
            ..Default::default()
        };
        let summary = mgr.calibrate(&agg, &settings, &req, 6).await.unwrap();
        assert_eq!(summary.base_meter_reading, dec("200"));
        assert_eq!(store.get(keys::DESIRED_METER_READING, "").await.unwrap(), "200");
    }

    #[tokio::test]
    async fn calibration_leaves_historical_windows_alone() {
        let (_, agg, mgr) = fixture(&[
            Sample::new(0, 0),
            Sample::new(10, 40),
            Sample::new(20, 5),
            Sample::new(30, 25),
        ])
        .await;
        let settings = Settings::default();

        let before = agg.usage_in_window(0, 35).await.unwrap();
        let req = CalibrationRequest {
            remaining_supply: Some(dec("1")),
            ..Default::default()
        };
        mgr.calibrate(&agg, &settings, &req, 100).await.unwrap();
        assert_eq!(agg.usage_in_window(0, 35).await.unwrap(), before);
        assert_eq!(before, 65);
    }
}

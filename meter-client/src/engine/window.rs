//! Usage over time windows, rebuilt from raw samples on every call.

use std::sync::Arc;

use time::{Duration, OffsetDateTime};

use super::{
    calendar::LocalCalendar,
    delta::{self, Reconstructor},
};
use crate::{db::SampleStore, error::StorageError};

const SECONDS_PER_HOUR: i64 = 3_600;
const SECONDS_PER_DAY: i64 = 86_400;

pub struct WindowAggregator {
    samples: Arc<dyn SampleStore>,
    calendar: LocalCalendar,
}

impl WindowAggregator {
    pub fn new(samples: Arc<dyn SampleStore>, calendar: LocalCalendar) -> Self {
        Self { samples, calendar }
    }

    pub fn calendar(&self) -> &LocalCalendar {
        &self.calendar
    }

    /// Pulses used strictly inside `[start, end)` (unix seconds).
    pub async fn usage_in_window(&self, start: i64, end: i64) -> Result<i64, StorageError> {
        if end <= start {
            return Ok(0);
        }
        let snap = self.samples.window(start, end).await?;
        Ok(delta::total(snap.carry_in, &snap.samples))
    }

    async fn usage_since(&self, start: OffsetDateTime, now: OffsetDateTime) -> Result<i64, StorageError> {
        self.usage_in_window(start.unix_timestamp(), now.unix_timestamp())
            .await
    }

    pub async fn usage_today(&self, now: OffsetDateTime) -> Result<i64, StorageError> {
        self.usage_since(self.calendar.start_of_day(now), now).await
    }

    pub async fn usage_this_week(&self, now: OffsetDateTime) -> Result<i64, StorageError> {
        self.usage_since(self.calendar.start_of_week(now), now).await
    }

    pub async fn usage_this_month(&self, now: OffsetDateTime) -> Result<i64, StorageError> {
        self.usage_since(self.calendar.start_of_month(now), now).await
    }

    /// Reconstructed over the entire history with no carry-in.
    pub async fn usage_lifetime(&self) -> Result<i64, StorageError> {
        let all = self.samples.all().await?;
        Ok(delta::total(None, &all))
    }

    /// Usage per local hour of today. Each delta lands in the hour of the
    /// sample that closes its interval.
    pub async fn hourly_buckets_today(&self, now: OffsetDateTime) -> Result<[i64; 24], StorageError> {
        let day_start = self.calendar.start_of_day(now).unix_timestamp();
        let snap = self
            .samples
            .window(day_start, day_start + SECONDS_PER_DAY)
            .await?;

        let mut buckets = [0i64; 24];
        let mut walk = Reconstructor::new(snap.carry_in);
        for s in &snap.samples {
            let d = walk.push(s.count);
            let hour = ((s.timestamp - day_start) / SECONDS_PER_HOUR).clamp(0, 23) as usize;
            buckets[hour] = buckets[hour].saturating_add(d);
        }
        Ok(buckets)
    }

    /// Usage per calendar month of the current local year.
    pub async fn monthly_buckets_this_year(&self, now: OffsetDateTime) -> Result<[i64; 12], StorageError> {
        let mut month_start = self.calendar.start_of_year(now).date();
        let year = month_start.year();

        let mut buckets = [0i64; 12];
        for bucket in buckets.iter_mut() {
            let days = time::util::days_in_year_month(year, month_start.month());
            let next = month_start + Duration::days(i64::from(days));
            *bucket = self
                .usage_in_window(
                    self.calendar.midnight(month_start).unix_timestamp(),
                    self.calendar.midnight(next).unix_timestamp(),
                )
                .await?;
            month_start = next;
        }
        Ok(buckets)
    }
}

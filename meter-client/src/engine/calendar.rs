use time::{
    format_description::FormatItem, macros::format_description, Date, Duration, OffsetDateTime,
    PrimitiveDateTime, Time, UtcOffset,
};

const DISPLAY_FORMAT: &[FormatItem<'static>] =
    format_description!("[year]-[month]-[day] [hour]:[minute]:[second]");

/// Local-time boundaries for the canned windows, at a fixed UTC offset.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LocalCalendar {
    offset: UtcOffset,
}

impl Default for LocalCalendar {
    fn default() -> Self {
        Self::new(UtcOffset::UTC)
    }
}

impl LocalCalendar {
    pub fn new(offset: UtcOffset) -> Self {
        Self { offset }
    }

    /// Out-of-range offsets fall back to UTC.
    pub fn from_offset_minutes(minutes: i32) -> Self {
        match UtcOffset::from_whole_seconds(minutes.saturating_mul(60)) {
            Ok(offset) => Self::new(offset),
            Err(e) => {
                tracing::warn!(error = %e, minutes, "invalid utc offset, using UTC");
                Self::default()
            }
        }
    }

    pub fn offset(&self) -> UtcOffset {
        self.offset
    }

    pub fn now(&self) -> OffsetDateTime {
        self.localize(OffsetDateTime::now_utc())
    }

    pub fn localize(&self, t: OffsetDateTime) -> OffsetDateTime {
        t.to_offset(self.offset)
    }

    pub fn midnight(&self, date: Date) -> OffsetDateTime {
        PrimitiveDateTime::new(date, Time::MIDNIGHT).assume_offset(self.offset)
    }

    pub fn start_of_day(&self, now: OffsetDateTime) -> OffsetDateTime {
        self.midnight(self.localize(now).date())
    }

    /// Monday at local midnight; a Sunday goes back six days.
    pub fn start_of_week(&self, now: OffsetDateTime) -> OffsetDateTime {
        let date = self.localize(now).date();
        let back = i64::from(date.weekday().number_days_from_monday());
        self.midnight(date - Duration::days(back))
    }

    pub fn start_of_month(&self, now: OffsetDateTime) -> OffsetDateTime {
        let date = self.localize(now).date();
        self.midnight(date - Duration::days(i64::from(date.day()) - 1))
    }

    pub fn start_of_year(&self, now: OffsetDateTime) -> OffsetDateTime {
        let date = self.localize(now).date();
        self.midnight(date - Duration::days(i64::from(date.ordinal()) - 1))
    }

    /// `YYYY-MM-DD HH:MM:SS` in local time.
    pub fn format(&self, t: OffsetDateTime) -> String {
        self.localize(t).format(DISPLAY_FORMAT).unwrap_or_default()
    }

    pub fn format_unix(&self, ts: i64) -> Option<String> {
        OffsetDateTime::from_unix_timestamp(ts)
            .ok()
            .map(|t| self.format(t))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::{datetime, offset};

    fn cst() -> LocalCalendar {
        LocalCalendar::new(offset!(+8))
    }

    #[test]
    fn day_starts_at_local_midnight() {
        // 2024-03-05 01:30 local is still 2024-03-04 in UTC.
        let now = datetime!(2024-03-04 17:30:00 UTC);
        assert_eq!(cst().start_of_day(now), datetime!(2024-03-05 00:00:00 +8));
    }

    #[test]
    fn week_starts_on_monday() {
        // Wednesday
        let wed = datetime!(2024-03-06 12:00:00 +8);
        assert_eq!(cst().start_of_week(wed), datetime!(2024-03-04 00:00:00 +8));

        // Monday itself
        let mon = datetime!(2024-03-04 00:00:01 +8);
        assert_eq!(cst().start_of_week(mon), datetime!(2024-03-04 00:00:00 +8));
    }

    #[test]
    fn sunday_belongs_to_the_previous_monday() {
        let sun = datetime!(2024-03-10 23:59:59 +8);
        assert_eq!(cst().start_of_week(sun), datetime!(2024-03-04 00:00:00 +8));
    }

    #[test]
    fn month_and_year_boundaries() {
        let now = datetime!(2024-03-31 08:00:00 +8);
        assert_eq!(cst().start_of_month(now), datetime!(2024-03-01 00:00:00 +8));
        assert_eq!(cst().start_of_year(now), datetime!(2024-01-01 00:00:00 +8));
    }

    #[test]
    fn format_uses_local_offset() {
        let t = datetime!(2024-01-01 16:00:00 UTC);
        assert_eq!(cst().format(t), "2024-01-02 00:00:00");
        assert_eq!(cst().format_unix(0).as_deref(), Some("1970-01-01 08:00:00"));
    }

    #[test]
    fn invalid_offset_falls_back_to_utc() {
        assert_eq!(LocalCalendar::from_offset_minutes(480).offset(), offset!(+8));
        assert_eq!(LocalCalendar::from_offset_minutes(100_000).offset(), UtcOffset::UTC);
    }
}

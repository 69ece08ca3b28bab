//! Day buckets.
//!
//! Samples are stored at the start of a local calendar day, expressed as
//! epoch milliseconds of that wall-clock midnight (local time shifted into
//! the UTC scale). Every stored timestamp is therefore a multiple of
//! [`SAMPLE_RATE_MS`].

use chrono::{DateTime, FixedOffset, Local, NaiveDateTime, Offset, TimeZone, Utc};

/// Length of one bucket: a day.
pub const SAMPLE_RATE_MS: i64 = 24 * 60 * 60 * 1000;

/// Buckets kept per series before older ones are pruned.
pub const MAX_STORED_SAMPLES: i64 = 6 * 30;

/// Oldest data kept, in milliseconds.
pub fn max_storage_age_ms() -> i64 {
    SAMPLE_RATE_MS * MAX_STORED_SAMPLES
}

/// Which wall clock defines where a day starts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeBasis {
    Local,
    Fixed(FixedOffset),
}

impl TimeBasis {
    pub fn utc() -> Self {
        TimeBasis::Fixed(Utc.fix())
    }

    /// Fixed offset east of UTC, in minutes.
    pub fn fixed_minutes(minutes: i32) -> Option<Self> {
        FixedOffset::east_opt(minutes.checked_mul(60)?).map(TimeBasis::Fixed)
    }

    fn offset_ms(&self, at: DateTime<Utc>) -> i64 {
        let offset = match self {
            TimeBasis::Local => Local.offset_from_utc_datetime(&at.naive_utc()).fix(),
            TimeBasis::Fixed(offset) => *offset,
        };
        offset.local_minus_utc() as i64 * 1000
    }

    /// Bucket timestamp containing `at`.
    pub fn normalize(&self, at: DateTime<Utc>) -> i64 {
        let local = at.timestamp_millis() + self.offset_ms(at);
        local.div_euclid(SAMPLE_RATE_MS) * SAMPLE_RATE_MS
    }

    /// The UTC instant at which bucket `timestamp` starts.
    pub fn bucket_start(&self, timestamp: i64) -> DateTime<Utc> {
        let midnight = millis_to_utc(timestamp).naive_utc();
        let resolved = match self {
            TimeBasis::Local => wall_clock_to_utc(&Local, &midnight),
            TimeBasis::Fixed(offset) => wall_clock_to_utc(offset, &midnight),
        };
        // A clock change skipped this midnight.
        resolved.unwrap_or_else(|| millis_to_utc(timestamp - self.offset_ms(millis_to_utc(timestamp))))
    }

    /// Start of the bucket following the one containing `now`.
    pub fn next_boundary(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        self.bucket_start(self.normalize(now) + SAMPLE_RATE_MS)
    }
}

/// The instant wall-clock time `local` names in `tz`, the earlier one when a
/// clock change makes it ambiguous.
fn wall_clock_to_utc<Tz: TimeZone>(tz: &Tz, local: &NaiveDateTime) -> Option<DateTime<Utc>> {
    tz.from_local_datetime(local).earliest().map(|at| at.with_timezone(&Utc))
}

pub(crate) fn millis_to_utc(ms: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(ms).single().unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::LocalResult;

    #[test]
    fn utc_normalizes_to_midnight() {
        let basis = TimeBasis::utc();
        let at = Utc.with_ymd_and_hms(2026, 3, 1, 17, 45, 12).unwrap();
        let bucket = basis.normalize(at);
        assert_eq!(bucket % SAMPLE_RATE_MS, 0);
        assert_eq!(basis.bucket_start(bucket), Utc.with_ymd_and_hms(2026, 3, 1, 0, 0, 0).unwrap());
    }

    #[test]
    fn east_offset_moves_late_utc_hours_into_next_day() {
        // 23:30 UTC is 01:30 the next day at UTC+2.
        let basis = TimeBasis::fixed_minutes(120).unwrap();
        let at = Utc.with_ymd_and_hms(2026, 3, 1, 23, 30, 0).unwrap();
        let bucket = basis.normalize(at);
        assert_eq!(bucket, TimeBasis::utc().normalize(Utc.with_ymd_and_hms(2026, 3, 2, 0, 0, 0).unwrap()));
        // Local midnight of March 2nd is 22:00 UTC on March 1st.
        assert_eq!(basis.bucket_start(bucket), Utc.with_ymd_and_hms(2026, 3, 1, 22, 0, 0).unwrap());
    }

    #[test]
    fn next_boundary_is_one_day_after_bucket_start() {
        let basis = TimeBasis::utc();
        let at = Utc.with_ymd_and_hms(2026, 3, 1, 5, 0, 0).unwrap();
        assert_eq!(basis.next_boundary(at), Utc.with_ymd_and_hms(2026, 3, 2, 0, 0, 0).unwrap());
    }

    /// UTC+2 until 2026-03-28 23:00 UTC, UTC+3 afterwards.
    #[derive(Debug, Clone, Copy)]
    struct EarlyShift;

    impl EarlyShift {
        fn switch() -> NaiveDateTime {
            Utc.with_ymd_and_hms(2026, 3, 28, 23, 0, 0).unwrap().naive_utc()
        }
    }

    impl TimeZone for EarlyShift {
        type Offset = FixedOffset;

        fn from_offset(_: &FixedOffset) -> Self {
            EarlyShift
        }

        fn offset_from_local_date(&self, local: &chrono::NaiveDate) -> LocalResult<FixedOffset> {
            self.offset_from_local_datetime(&local.and_hms_opt(0, 0, 0).unwrap())
        }

        fn offset_from_local_datetime(&self, local: &NaiveDateTime) -> LocalResult<FixedOffset> {
            let candidates: Vec<FixedOffset> = [2, 3]
                .into_iter()
                .map(|h| FixedOffset::east_opt(h * 3600).unwrap())
                .filter(|off| {
                    let utc = *local - chrono::Duration::seconds(off.local_minus_utc() as i64);
                    self.offset_from_utc_datetime(&utc) == *off
                })
                .collect();
            match candidates.as_slice() {
                [] => LocalResult::None,
                [one] => LocalResult::Single(*one),
                [a, b] => LocalResult::Ambiguous(*a, *b),
                _ => unreachable!(),
            }
        }

        fn offset_from_utc_date(&self, utc: &chrono::NaiveDate) -> FixedOffset {
            self.offset_from_utc_datetime(&utc.and_hms_opt(0, 0, 0).unwrap())
        }

        fn offset_from_utc_datetime(&self, utc: &NaiveDateTime) -> FixedOffset {
            let hours = if *utc < Self::switch() { 2 } else { 3 };
            FixedOffset::east_opt(hours * 3600).unwrap()
        }
    }

    #[test]
    fn midnight_before_a_late_evening_shift_keeps_its_own_offset() {
        // Local midnight of March 29th is still UTC+2; the shift an hour later
        // must not move the start of the day.
        let midnight = Utc.with_ymd_and_hms(2026, 3, 29, 0, 0, 0).unwrap().naive_utc();
        assert_eq!(
            wall_clock_to_utc(&EarlyShift, &midnight),
            Some(Utc.with_ymd_and_hms(2026, 3, 28, 22, 0, 0).unwrap())
        );
    }

    #[test]
    fn skipped_wall_clock_time_does_not_resolve() {
        // 01:30 local on March 29th falls in the hour the clock jumps over.
        let skipped = Utc.with_ymd_and_hms(2026, 3, 29, 1, 30, 0).unwrap().naive_utc();
        assert_eq!(wall_clock_to_utc(&EarlyShift, &skipped), None);
    }

    #[test]
    fn retention_is_180_days() {
        assert_eq!(MAX_STORED_SAMPLES, 180);
        assert_eq!(max_storage_age_ms(), 180 * SAMPLE_RATE_MS);
    }
}

//! Calendar-aligned query periods.
//!
//! Day, week and month lookups all reduce to one `select_interval` call;
//! [`Period::bounds`] is the only place the boundaries are computed.

use chrono::{
    DateTime, Datelike, Days, Duration, FixedOffset, Months, NaiveDate, NaiveDateTime, NaiveTime,
    TimeZone, Utc,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Period {
    /// `00:00:00` through `23:59:59` of the date.
    Day,
    /// Seven days starting on the Sunday on or before the date.
    Week,
    /// The 1st of the month through one second before the 1st of the next.
    Month,
}

impl Period {
    /// Inclusive `[start, end]` bounds of the period containing `date`,
    /// aligned to midnight in `date`'s own offset.
    pub fn bounds(self, date: &DateTime<FixedOffset>) -> (DateTime<Utc>, DateTime<Utc>) {
        let day = date.date_naive();
        let (first, last) = match self {
            Period::Day => (day, day),
            Period::Week => {
                let back = u64::from(day.weekday().num_days_from_sunday());
                let first = day.checked_sub_days(Days::new(back)).unwrap_or(NaiveDate::MIN);
                (first, first.checked_add_days(Days::new(6)).unwrap_or(NaiveDate::MAX))
            }
            Period::Month => {
                let first = day.with_day(1).unwrap_or(day);
                let last = first
                    .checked_add_months(Months::new(1))
                    .and_then(|next| next.pred_opt())
                    .unwrap_or(NaiveDate::MAX);
                (first, last)
            }
        };

        let start = start_of(first);
        let end = start_of(last)
            .checked_add_signed(Duration::seconds(86_399))
            .unwrap_or(NaiveDateTime::MAX);

        let offset = *date.offset();
        (to_utc(start, offset), to_utc(end, offset))
    }
}

fn start_of(day: NaiveDate) -> NaiveDateTime {
    day.and_time(NaiveTime::MIN)
}

/// Shift a local time to UTC, saturating at the ends of the representable
/// range.
fn to_utc(local: NaiveDateTime, offset: FixedOffset) -> DateTime<Utc> {
    let shift = Duration::seconds(i64::from(offset.local_minus_utc()));
    let utc = local.checked_sub_signed(shift).unwrap_or(if shift > Duration::zero() {
        NaiveDateTime::MIN
    } else {
        NaiveDateTime::MAX
    });
    Utc.from_utc_datetime(&utc)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn at(
        offset_hours: i32,
        y: i32,
        m: u32,
        d: u32,
        h: u32,
        mi: u32,
        s: u32,
    ) -> DateTime<FixedOffset> {
        FixedOffset::east_opt(offset_hours * 3600)
            .unwrap()
            .with_ymd_and_hms(y, m, d, h, mi, s)
            .unwrap()
    }

    #[test]
    fn bounds_saturate_at_the_end_of_time() {
        let offset = FixedOffset::west_opt(5 * 3600).unwrap();
        let date = offset.from_utc_datetime(&NaiveDate::MAX.and_hms_opt(23, 0, 0).unwrap());

        for period in [Period::Day, Period::Week, Period::Month] {
            let (start, end) = period.bounds(&date);
            assert!(start <= end, "{:?}", period);
            assert_eq!(end, DateTime::<Utc>::MAX_UTC, "{:?}", period);
        }
    }

    #[test]
    fn bounds_saturate_at_the_start_of_time() {
        let offset = FixedOffset::east_opt(5 * 3600).unwrap();
        let date = offset.from_utc_datetime(&NaiveDate::MIN.and_hms_opt(0, 0, 0).unwrap());

        for period in [Period::Day, Period::Week, Period::Month] {
            let (start, end) = period.bounds(&date);
            assert_eq!(start, DateTime::<Utc>::MIN_UTC, "{:?}", period);
            assert!(start <= end);
        }
    }

    #[test]
    fn day_spans_midnight_to_last_second() {
        let (start, end) = Period::Day.bounds(&at(0, 2022, 1, 2, 22, 22, 22));
        assert_eq!(start, at(0, 2022, 1, 2, 0, 0, 0));
        assert_eq!(end, at(0, 2022, 1, 2, 23, 59, 59));
    }

    #[test]
    fn week_starts_on_sunday() {
        // 2022-04-02 is a Saturday.
        let (start, end) = Period::Week.bounds(&at(0, 2022, 4, 2, 22, 22, 22));
        assert_eq!(start, at(0, 2022, 3, 27, 0, 0, 0));
        assert_eq!(end, at(0, 2022, 4, 2, 23, 59, 59));
    }

    #[test]
    fn week_of_a_sunday_starts_that_day() {
        let (start, _) = Period::Week.bounds(&at(0, 2022, 3, 27, 8, 0, 0));
        assert_eq!(start, at(0, 2022, 3, 27, 0, 0, 0));
    }

    #[test]
    fn month_ends_one_second_before_next_month() {
        let (start, end) = Period::Month.bounds(&at(0, 2022, 4, 2, 22, 22, 22));
        assert_eq!(start, at(0, 2022, 4, 1, 0, 0, 0));
        assert_eq!(end, at(0, 2022, 4, 30, 23, 59, 59));
    }

    #[test]
    fn december_rolls_into_next_year() {
        let (_, end) = Period::Month.bounds(&at(0, 2021, 12, 15, 0, 0, 0));
        assert_eq!(end, at(0, 2021, 12, 31, 23, 59, 59));
    }

    #[test]
    fn bounds_follow_callers_offset() {
        let (start, end) = Period::Day.bounds(&at(3, 2022, 1, 2, 1, 0, 0));
        assert_eq!(start, Utc.with_ymd_and_hms(2022, 1, 1, 21, 0, 0).unwrap());
        assert_eq!(end, Utc.with_ymd_and_hms(2022, 1, 2, 20, 59, 59).unwrap());
    }

    proptest! {
        #[test]
        fn every_period_contains_its_date(
            secs in 0i64..4_000_000_000,
            offset_hours in -12i32..=14,
        ) {
            let offset = FixedOffset::east_opt(offset_hours * 3600).unwrap();
            let date = Utc.timestamp_opt(secs, 0).unwrap().with_timezone(&offset);

            for period in [Period::Day, Period::Week, Period::Month] {
                let (start, end) = period.bounds(&date);
                prop_assert!(start <= date.with_timezone(&Utc));
                prop_assert!(date.with_timezone(&Utc) <= end);

                let local_start = start.with_timezone(&offset);
                prop_assert_eq!(local_start.time(), NaiveTime::MIN);
            }
        }

        #[test]
        fn day_is_always_one_second_short_of_a_day(secs in 0i64..4_000_000_000) {
            let utc = FixedOffset::east_opt(0).unwrap();
            let date = Utc.timestamp_opt(secs, 0).unwrap().with_timezone(&utc);
            let (start, end) = Period::Day.bounds(&date);
            prop_assert_eq!(end - start, Duration::seconds(86_399));
        }
    }
}

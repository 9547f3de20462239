//! Service-date and schedule-time conversions in the fleet's local timezone.

use chrono::{DateTime, Duration, NaiveDate, NaiveTime, TimeZone};
use chrono_tz::Tz;

/// Derives the service date (YYYYMMDD, fleet-local) from a Unix timestamp.
///
/// This is the calendar day on which a trip started; callers persist it for
/// the trip's whole lifecycle so later samples crossing local midnight do
/// not move the trip to a new date.
pub fn service_date(timestamp: i64, tz: Tz) -> Option<String> {
    let utc = DateTime::from_timestamp(timestamp, 0)?;
    Some(utc.with_timezone(&tz).format("%Y%m%d").to_string())
}

/// Converts a GTFS schedule time (`HH:MM:SS`, hours may be >= 24) anchored
/// to a YYYYMMDD service date into a Unix timestamp.
///
/// Hours of 24 and beyond roll into the following calendar day(s), matching
/// GTFS semantics for trips that run past midnight.
pub fn gtfs_time_to_timestamp(hms: &str, service_date: &str, tz: Tz) -> Option<i64> {
    let date = NaiveDate::parse_from_str(service_date, "%Y%m%d").ok()?;

    let mut parts = hms.split(':');
    let hours: i64 = parts.next()?.trim().parse().ok()?;
    let minutes: u32 = parts.next()?.trim().parse().ok()?;
    let seconds: u32 = parts.next()?.trim().parse().ok()?;
    if parts.next().is_some() || minutes > 59 || seconds > 59 || hours < 0 {
        return None;
    }

    let day_offset = hours / 24;
    let hour_of_day = (hours % 24) as u32;

    let date = date.checked_add_signed(Duration::days(day_offset))?;
    let time = NaiveTime::from_hms_opt(hour_of_day, minutes, seconds)?;
    let naive = date.and_time(time);

    // On DST transitions a local time can map to zero or two instants;
    // take the earliest valid one.
    match tz.from_local_datetime(&naive) {
        chrono::LocalResult::Single(dt) => Some(dt.timestamp()),
        chrono::LocalResult::Ambiguous(dt, _) => Some(dt.timestamp()),
        chrono::LocalResult::None => tz
            .from_local_datetime(&(naive + Duration::hours(1)))
            .earliest()
            .map(|dt| dt.timestamp()),
    }
}

/// Formats seconds-since-midnight (possibly >= 24h) as a GTFS `HH:MM:SS`
/// schedule time string.
pub fn seconds_to_gtfs_time(total: u32) -> String {
    format!("{:02}:{:02}:{:02}", total / 3600, (total / 60) % 60, total % 60)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono_tz::Europe::Lisbon;

    fn lisbon_ts(date: &str, hms: &str) -> i64 {
        let naive = NaiveDate::parse_from_str(date, "%Y%m%d")
            .unwrap()
            .and_time(NaiveTime::parse_from_str(hms, "%H:%M:%S").unwrap());
        Lisbon.from_local_datetime(&naive).unwrap().timestamp()
    }

    #[test]
    fn test_service_date_changes_across_local_midnight() {
        let before = lisbon_ts("20251207", "23:59:59");
        let after = lisbon_ts("20251208", "00:00:30");

        assert_eq!(service_date(before, Lisbon).unwrap(), "20251207");
        assert_eq!(service_date(after, Lisbon).unwrap(), "20251208");
    }

    #[test]
    fn test_gtfs_time_plain() {
        let ts = gtfs_time_to_timestamp("14:30:00", "20251207", Lisbon).unwrap();
        assert_eq!(ts, lisbon_ts("20251207", "14:30:00"));
    }

    #[test]
    fn test_gtfs_time_past_midnight_rolls_to_next_day() {
        let ts = gtfs_time_to_timestamp("24:15:00", "20251207", Lisbon).unwrap();
        assert_eq!(ts, lisbon_ts("20251208", "00:15:00"));
    }

    #[test]
    fn test_gtfs_time_two_days_ahead() {
        let ts = gtfs_time_to_timestamp("49:00:00", "20251207", Lisbon).unwrap();
        assert_eq!(ts, lisbon_ts("20251209", "01:00:00"));
    }

    #[test]
    fn test_gtfs_time_rejects_garbage() {
        assert!(gtfs_time_to_timestamp("not-a-time", "20251207", Lisbon).is_none());
        assert!(gtfs_time_to_timestamp("12:75:00", "20251207", Lisbon).is_none());
        assert!(gtfs_time_to_timestamp("12:00:00", "2025-12-07", Lisbon).is_none());
    }

    #[test]
    fn test_seconds_to_gtfs_time() {
        assert_eq!(seconds_to_gtfs_time(0), "00:00:00");
        assert_eq!(seconds_to_gtfs_time(14 * 3600 + 30 * 60), "14:30:00");
        assert_eq!(seconds_to_gtfs_time(24 * 3600 + 15 * 60), "24:15:00");
    }
}

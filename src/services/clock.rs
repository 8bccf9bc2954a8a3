use chrono::{DateTime, Days, Local, NaiveDate};

pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Local>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Local> {
        Local::now()
    }
}

/// Calendar day key used by the day-scoped local records.
pub fn day_key(at: DateTime<Local>) -> String {
    at.date_naive().format("%Y-%m-%d").to_string()
}

/// The first instant of the local day after `at`.
pub fn next_local_midnight(at: DateTime<Local>) -> DateTime<Local> {
    let tomorrow: NaiveDate = at
        .date_naive()
        .checked_add_days(Days::new(1))
        .unwrap_or(NaiveDate::MAX);
    let midnight = tomorrow.and_hms_opt(0, 0, 0).unwrap_or_default();
    midnight
        .and_local_timezone(Local)
        .earliest()
        // Midnight skipped by a DST jump: the day starts an hour later.
        .or_else(|| (midnight + chrono::Duration::hours(1)).and_local_timezone(Local).earliest())
        .unwrap_or(at)
}

#[cfg(test)]
pub use manual::ManualClock;


#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;

    #[test]
    fn test_next_midnight_is_start_of_following_day() {
        let at = Local.with_ymd_and_hms(2025, 3, 10, 15, 30, 0).unwrap();
        let midnight = next_local_midnight(at);
        assert_eq!(day_key(midnight), "2025-03-11");
        assert_eq!(midnight.format("%H:%M:%S").to_string(), "00:00:00");
    }
}

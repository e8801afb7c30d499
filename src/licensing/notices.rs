use crate::licensing::storage::{LicensingStore, NoticeCounter};
use crate::licensing::types::{LicenseInfo, LicensingError};
use chrono::NaiveDate;
use serde::Serialize;

const HOUR_MS: i64 = 60 * 60 * 1000;
const DAY_MS: i64 = 24 * HOUR_MS;

/// Trial-remaining notice to show the user
#[derive(Serialize, Clone, PartialEq, Eq, Debug)]
pub struct TrialNotice {
    pub days: i64,
    pub hours: i64,
    pub message: String,
    /// 1-based index of this notice within the day
    pub shown_today: u32,
}

impl TrialNotice {
    fn new(time_left_ms: i64, shown_today: u32) -> Self {
        let days = time_left_ms / DAY_MS;
        let hours = (time_left_ms % DAY_MS) / HOUR_MS;

        let message = if days > 0 {
            format!(
                "Pro trial: {} day{} and {} hour{} remaining",
                days,
                plural(days),
                hours,
                plural(hours)
            )
        } else {
            format!("Pro trial: {} hour{} remaining", hours, plural(hours))
        };

        Self {
            days,
            hours,
            message,
            shown_today,
        }
    }
}

fn plural(n: i64) -> &'static str {
    if n == 1 {
        ""
    } else {
        "s"
    }
}

/// Daily-capped trial notices. The counter is keyed by the date string and
/// starts over whenever the date changes.
pub struct TrialNotices {
    store: LicensingStore,
    max_per_day: u32,
}

impl TrialNotices {
    pub fn new(store: LicensingStore, max_per_day: u32) -> Self {
        Self { store, max_per_day }
    }

    /// Next notice for `today`, or `None` when no trial is running or the
    /// day's quota is used up. Returning a notice counts it as shown.
    pub fn next_notice(
        &self,
        info: &LicenseInfo,
        today: NaiveDate,
    ) -> Result<Option<TrialNotice>, LicensingError> {
        if !info.access.is_trial_active {
            return Ok(None);
        }

        let date = today.format("%Y-%m-%d").to_string();
        let shown = match self.store.load_notice_counter()? {
            Some(counter) if counter.date == date => counter.count,
            _ => 0,
        };

        if shown >= self.max_per_day {
            return Ok(None);
        }

        let counter = NoticeCounter {
            date,
            count: shown + 1,
        };
        self.store.save_notice_counter(&counter)?;

        Ok(Some(TrialNotice::new(info.time_left_ms, counter.count)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::licensing::types::{LicensingState, UserMode};

    fn trial_info(time_left_ms: i64) -> LicenseInfo {
        let state = LicensingState {
            user_mode: Some(UserMode::Pro),
            trial_start: Some(0),
            ..Default::default()
        };
        LicenseInfo::from_state(&state, 3 * DAY_MS - time_left_ms, 3 * DAY_MS)
    }

    fn day(d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2026, 5, d).unwrap()
    }

    #[test]
    fn test_two_notices_per_day() {
        let notices = TrialNotices::new(LicensingStore::in_memory(), 2);
        let info = trial_info(2 * DAY_MS + 5 * HOUR_MS);

        let first = notices.next_notice(&info, day(1)).unwrap().unwrap();
        assert_eq!(first.days, 2);
        assert_eq!(first.hours, 5);
        assert_eq!(first.message, "Pro trial: 2 days and 5 hours remaining");
        assert_eq!(first.shown_today, 1);

        assert!(notices.next_notice(&info, day(1)).unwrap().is_some());
        assert!(notices.next_notice(&info, day(1)).unwrap().is_none());

        let next_day = notices.next_notice(&info, day(2)).unwrap().unwrap();
        assert_eq!(next_day.shown_today, 1);
    }

    #[test]
    fn test_no_notice_without_active_trial() {
        let notices = TrialNotices::new(LicensingStore::in_memory(), 2);
        let expired = trial_info(0);
        assert!(notices.next_notice(&expired, day(1)).unwrap().is_none());
    }

    #[test]
    fn test_last_hours_message() {
        let notices = TrialNotices::new(LicensingStore::in_memory(), 2);
        let notice = notices
            .next_notice(&trial_info(HOUR_MS + 10), day(3))
            .unwrap()
            .unwrap();
        assert_eq!(notice.message, "Pro trial: 1 hour remaining");
    }
}

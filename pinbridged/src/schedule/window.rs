//! Wall-clock evaluation of schedule time windows.
//!
//! Windows are compared at one-minute granularity in the device's
//! local time zone. Daylight-saving transitions need no special
//! casing: a start time that doesn't occur on a spring-forward day
//! simply isn't matched that day, and the periodic re-evaluator
//! catches up on the next.

use chrono::{Local, Timelike};
use pinbridge_api::types::schedule::ScheduleSpec;

/// Minutes since local midnight for any time-like value.

pub fn minute_of_day<T: Timelike>(t: &T) -> u16 {
    (t.hour() * 60 + t.minute()) as u16
}

/// Whether the schedule's window admits the current local time.

pub fn is_open(spec: &ScheduleSpec) -> bool {
    spec.in_window(minute_of_day(&Local::now()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveTime;
    use pinbridge_api::types::schedule::TimeWindow;

    fn at(h: u32, m: u32) -> u16 {
        minute_of_day(&NaiveTime::from_hms_opt(h, m, 0).unwrap())
    }

    #[test]
    fn test_minute_of_day() {
        assert_eq!(at(0, 0), 0);
        assert_eq!(at(6, 0), 360);
        assert_eq!(at(23, 59), 1439);
    }

    #[test]
    fn test_midnight_to_midnight_is_always_open() {
        let w = TimeWindow {
            enabled: true,
            start: at(0, 0),
            end: at(0, 0),
        };

        for minute in [at(0, 0), at(3, 30), at(12, 0), at(23, 59)] {
            assert!(w.admits(minute));
        }
    }

    #[test]
    fn test_overnight_window_boundaries() {
        // 22:00 - 06:00, wrapping midnight.

        let w = TimeWindow {
            enabled: true,
            start: at(22, 0),
            end: at(6, 0),
        };

        assert!(w.admits(at(23, 59)));
        assert!(w.admits(at(5, 59)));
        assert!(!w.admits(at(6, 0)));
        assert!(w.admits(at(22, 0)));
        assert!(!w.admits(at(21, 59)));
        assert!(!w.admits(at(12, 0)));
    }
}

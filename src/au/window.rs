//! Crawl windows: time-of-day and day-of-week predicates gating when an AU
//! may be crawled.
//!
//! Windows are evaluated against UTC wall-clock time.

use chrono::{DateTime, Datelike, NaiveTime, Utc, Weekday};
use serde::Deserialize;
use std::fmt;
use std::sync::Arc;

/// A predicate over wall-clock time
///
/// Deserializes from a tagged table, e.g.
///
/// ```toml
/// [archival-unit.crawl-window]
/// kind = "interval"
/// start = "22:00:00"
/// end = "06:00:00"
/// days = ["Sat", "Sun"]
/// ```
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum CrawlWindow {
    /// Always open
    Always,

    /// Open between `start` (inclusive) and `end` (exclusive); wraps past
    /// midnight when `end <= start`. `days` restricts the days on which the
    /// interval starts.
    Interval {
        start: NaiveTime,
        end: NaiveTime,
        #[serde(default)]
        days: Vec<Weekday>,
    },

    /// Open all day on the listed days
    DaysOfWeek { days: Vec<Weekday> },

    /// Open when every inner window is open
    And { windows: Vec<CrawlWindow> },

    /// Open when any inner window is open
    Or { windows: Vec<CrawlWindow> },

    /// Open when the inner window is closed
    Not { window: Box<CrawlWindow> },
}

impl CrawlWindow {
    /// Returns true if crawling is allowed right now
    pub fn can_crawl(&self) -> bool {
        self.is_open_at(Utc::now())
    }

    /// Returns true if crawling is allowed at the given instant
    pub fn is_open_at(&self, now: DateTime<Utc>) -> bool {
        match self {
            CrawlWindow::Always => true,
            CrawlWindow::Interval { start, end, days } => {
                let time = now.time();
                let today = now.weekday();
                let day_ok = |day: Weekday| days.is_empty() || days.contains(&day);

                if start < end {
                    day_ok(today) && time >= *start && time < *end
                } else if time >= *start {
                    // Evening part of a window that wraps past midnight
                    day_ok(today)
                } else if time < *end {
                    // Morning part; the window started the previous day
                    day_ok(today.pred())
                } else {
                    false
                }
            }
            CrawlWindow::DaysOfWeek { days } => days.contains(&now.weekday()),
            CrawlWindow::And { windows } => windows.iter().all(|w| w.is_open_at(now)),
            CrawlWindow::Or { windows } => windows.iter().any(|w| w.is_open_at(now)),
            CrawlWindow::Not { window } => !window.is_open_at(now),
        }
    }
}

/// Returns true if the optional window allows crawling now
pub fn window_open(window: Option<&CrawlWindow>) -> bool {
    window_open_at(window, Utc::now())
}

/// Returns true if the optional window allows crawling at `now`
pub fn window_open_at(window: Option<&CrawlWindow>, now: DateTime<Utc>) -> bool {
    window.map_or(true, |w| w.is_open_at(now))
}

/// Source of the wall-clock time that windows are checked against
#[derive(Clone)]
pub struct Clock(Arc<dyn Fn() -> DateTime<Utc> + Send + Sync>);

impl Clock {
    pub fn system() -> Self {
        Self(Arc::new(Utc::now))
    }

    pub fn from_fn(now: impl Fn() -> DateTime<Utc> + Send + Sync + 'static) -> Self {
        Self(Arc::new(now))
    }

    pub fn now(&self) -> DateTime<Utc> {
        (self.0)()
    }
}

impl Default for Clock {
    fn default() -> Self {
        Self::system()
    }
}

impl fmt::Debug for Clock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Clock").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(y: i32, m: u32, d: u32, h: u32, min: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, m, d, h, min, 0).unwrap()
    }

    fn time(h: u32, m: u32) -> NaiveTime {
        NaiveTime::from_hms_opt(h, m, 0).unwrap()
    }

    #[test]
    fn test_always_open() {
        assert!(CrawlWindow::Always.is_open_at(at(2024, 1, 1, 3, 0)));
        assert!(window_open(None));
    }

    #[test]
    fn test_fixed_clock_drives_window() {
        let clock = Clock::from_fn(|| at(2024, 1, 1, 20, 0));
        let window = CrawlWindow::Interval {
            start: time(9, 0),
            end: time(17, 0),
            days: vec![],
        };
        assert_eq!(clock.now(), at(2024, 1, 1, 20, 0));
        assert!(!window_open_at(Some(&window), clock.now()));
        assert!(window_open_at(None, clock.now()));
    }

    #[test]
    fn test_simple_interval() {
        let window = CrawlWindow::Interval {
            start: time(9, 0),
            end: time(17, 0),
            days: vec![],
        };
        assert!(window.is_open_at(at(2024, 1, 1, 9, 0)));
        assert!(window.is_open_at(at(2024, 1, 1, 16, 59)));
        assert!(!window.is_open_at(at(2024, 1, 1, 17, 0)));
        assert!(!window.is_open_at(at(2024, 1, 1, 8, 59)));
    }

    #[test]
    fn test_interval_wraps_midnight() {
        // 2024-01-06 is a Saturday
        let window = CrawlWindow::Interval {
            start: time(22, 0),
            end: time(6, 0),
            days: vec![Weekday::Sat],
        };
        assert!(window.is_open_at(at(2024, 1, 6, 23, 0)));
        assert!(window.is_open_at(at(2024, 1, 7, 5, 0)));
        assert!(!window.is_open_at(at(2024, 1, 7, 23, 0)));
        assert!(!window.is_open_at(at(2024, 1, 6, 12, 0)));
    }

    #[test]
    fn test_boolean_combinators() {
        let weekend = CrawlWindow::DaysOfWeek {
            days: vec![Weekday::Sat, Weekday::Sun],
        };
        let weekdays = CrawlWindow::Not {
            window: Box::new(weekend.clone()),
        };
        let nights = CrawlWindow::Interval {
            start: time(0, 0),
            end: time(6, 0),
            days: vec![],
        };
        let either = CrawlWindow::Or {
            windows: vec![weekend.clone(), nights.clone()],
        };
        let both = CrawlWindow::And {
            windows: vec![weekdays.clone(), nights],
        };

        // Monday noon
        assert!(!either.is_open_at(at(2024, 1, 8, 12, 0)));
        assert!(weekdays.is_open_at(at(2024, 1, 8, 12, 0)));
        // Monday 3am
        assert!(either.is_open_at(at(2024, 1, 8, 3, 0)));
        assert!(both.is_open_at(at(2024, 1, 8, 3, 0)));
        // Sunday 3am
        assert!(!both.is_open_at(at(2024, 1, 7, 3, 0)));
    }

    #[test]
    fn test_deserialize_window() {
        #[derive(Deserialize)]
        struct Wrapper {
            window: CrawlWindow,
        }

        let parsed: Wrapper = toml::from_str(
            r#"
[window]
kind = "interval"
start = "01:00:00"
end = "05:00:00"
days = ["Mon", "Tue"]
"#,
        )
        .unwrap();

        assert_eq!(
            parsed.window,
            CrawlWindow::Interval {
                start: time(1, 0),
                end: time(5, 0),
                days: vec![Weekday::Mon, Weekday::Tue],
            }
        );
    }
}

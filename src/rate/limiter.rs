//! Event-count rate limiter
//!
//! A `RateLimiter` allows at most N events in any rolling interval. It keeps
//! the times of the last N events; a new event is allowed once the oldest of
//! them is at least one interval in the past.

use crate::rate::{RateError, RateResult};
use std::collections::VecDeque;
use std::fmt;
use std::str::FromStr;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use tokio::time::Instant;

/// A rate expression: N events per interval, or unlimited
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rate {
    Limited { events: usize, interval: Duration },
    Unlimited,
}

impl Rate {
    /// Creates a limited rate, rejecting zero limits and intervals
    pub fn new(events: usize, interval: Duration) -> RateResult<Self> {
        if events == 0 {
            return Err(RateError::InvalidRate(
                "event limit must be greater than zero".to_string(),
            ));
        }
        if interval.is_zero() {
            return Err(RateError::InvalidRate(
                "interval must be greater than zero".to_string(),
            ));
        }
        Ok(Rate::Limited { events, interval })
    }

    fn capacity(&self) -> usize {
        match self {
            Rate::Limited { events, .. } => *events,
            Rate::Unlimited => 0,
        }
    }
}

impl FromStr for Rate {
    type Err = RateError;

    /// Parses `N/interval` (e.g. `"1/18h"`, `"50/1d"`, `"10/100"`) or `unlimited`
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.eq_ignore_ascii_case("unlimited") {
            return Ok(Rate::Unlimited);
        }

        let (count, interval) = s
            .split_once('/')
            .ok_or_else(|| RateError::InvalidRate(format!("missing '/' in rate '{}'", s)))?;

        let events: usize = count
            .trim()
            .parse()
            .map_err(|_| RateError::InvalidRate(format!("invalid event count in '{}'", s)))?;

        let interval = parse_duration(interval)?;
        Rate::new(events, interval)
    }
}

impl fmt::Display for Rate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Rate::Unlimited => write!(f, "unlimited"),
            Rate::Limited { events, interval } => {
                write!(f, "{}/{}", events, format_duration(*interval))
            }
        }
    }
}

const UNITS: &[(&str, u64)] = &[
    ("ms", 1),
    ("s", 1_000),
    ("m", 60_000),
    ("h", 3_600_000),
    ("d", 86_400_000),
    ("w", 604_800_000),
];

/// Parses a duration like `"18h"`, `"1d"`, `"100ms"` or a bare millisecond count
pub fn parse_duration(s: &str) -> RateResult<Duration> {
    let s = s.trim();
    let split = s
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(s.len());
    let (number, unit) = s.split_at(split);

    let value: u64 = number
        .parse()
        .map_err(|_| RateError::InvalidRate(format!("invalid interval '{}'", s)))?;

    let unit = unit.trim().to_ascii_lowercase();
    let millis_per_unit = if unit.is_empty() {
        1
    } else {
        UNITS
            .iter()
            .find(|(name, _)| *name == unit)
            .map(|(_, ms)| *ms)
            .ok_or_else(|| RateError::InvalidRate(format!("unknown interval unit '{}'", unit)))?
    };

    Ok(Duration::from_millis(value.saturating_mul(millis_per_unit)))
}

fn format_duration(d: Duration) -> String {
    let ms = d.as_millis() as u64;
    for (name, unit_ms) in UNITS.iter().rev() {
        if ms >= *unit_ms && ms % unit_ms == 0 && *unit_ms > 1 {
            return format!("{}{}", ms / unit_ms, name);
        }
    }
    format!("{}ms", ms)
}

#[derive(Debug)]
struct LimiterState {
    rate: Rate,
    /// Most recent events, oldest at the front, at most `rate.capacity()` long
    events: VecDeque<Instant>,
}

impl LimiterState {
    fn time_until_ok(&self, now: Instant) -> Duration {
        match self.rate {
            Rate::Unlimited => Duration::ZERO,
            Rate::Limited { events, interval } => {
                if self.events.len() < events {
                    return Duration::ZERO;
                }
                match self.events.front() {
                    Some(oldest) => (*oldest + interval).saturating_duration_since(now),
                    None => Duration::ZERO,
                }
            }
        }
    }

    fn record(&mut self, now: Instant) {
        let capacity = self.rate.capacity();
        if capacity == 0 {
            return;
        }
        self.events.push_back(now);
        while self.events.len() > capacity {
            self.events.pop_front();
        }
    }
}

/// Thread-safe rate limiter shared between concurrently running crawls
///
/// Waiters queue on a fair async mutex, so callers of
/// [`RateLimiter::fifo_wait_and_signal_event`] are serviced in arrival order.
#[derive(Debug)]
pub struct RateLimiter {
    state: Mutex<LimiterState>,
    turn: tokio::sync::Mutex<()>,
}

impl RateLimiter {
    pub fn new(rate: Rate) -> Self {
        Self {
            state: Mutex::new(LimiterState {
                rate,
                events: VecDeque::with_capacity(rate.capacity()),
            }),
            turn: tokio::sync::Mutex::new(()),
        }
    }

    /// Creates a limiter from a rate string such as `"1/18h"`
    pub fn from_rate_str(rate: &str) -> RateResult<Self> {
        Ok(Self::new(rate.parse()?))
    }

    pub fn unlimited() -> Self {
        Self::new(Rate::Unlimited)
    }

    fn lock(&self) -> MutexGuard<'_, LimiterState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn rate(&self) -> Rate {
        self.lock().rate
    }

    /// Returns true if this limiter is configured with the given rate string
    pub fn is_rate(&self, rate: &str) -> bool {
        rate.parse::<Rate>().map(|r| r == self.rate()).unwrap_or(false)
    }

    /// Changes the rate, keeping the most recent events that still fit
    pub fn set_rate(&self, rate: Rate) {
        let mut state = self.lock();
        if state.rate == rate {
            return;
        }
        tracing::debug!("Changing rate from {} to {}", state.rate, rate);
        state.rate = rate;
        let capacity = rate.capacity();
        while state.events.len() > capacity {
            state.events.pop_front();
        }
    }

    /// Non-blocking check: would an event be allowed right now
    pub fn is_event_ok(&self) -> bool {
        self.time_until_event_ok().is_zero()
    }

    pub fn time_until_event_ok(&self) -> Duration {
        self.lock().time_until_ok(Instant::now())
    }

    /// Records an event at the current time
    pub fn event(&self) {
        self.lock().record(Instant::now());
    }

    /// Removes the most recently recorded event
    pub fn unevent(&self) {
        self.lock().events.pop_back();
    }

    /// Records an event if one is allowed now, otherwise returns the wait
    ///
    /// The check and the record happen under one lock, so concurrent
    /// callers cannot both take the last slot.
    pub fn try_event(&self) -> Result<(), Duration> {
        let mut state = self.lock();
        let now = Instant::now();
        let wait = state.time_until_ok(now);
        if wait.is_zero() {
            state.record(now);
            Ok(())
        } else {
            Err(wait)
        }
    }

    /// Waits until an event is allowed, then records it
    ///
    /// Concurrent callers are served first come, first served. The rate is
    /// re-read on every wakeup, so a concurrent `set_rate` takes effect for
    /// waiters already in line.
    pub async fn fifo_wait_and_signal_event(&self) {
        let _turn = self.turn.lock().await;
        loop {
            match self.try_event() {
                Ok(()) => return,
                Err(wait) => tokio::time::sleep(wait).await,
            }
        }
    }

    /// Number of events currently retained in the history window
    pub fn recorded_events(&self) -> usize {
        self.lock().events.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_parse_rates() {
        assert_eq!(
            "10/100".parse::<Rate>().unwrap(),
            Rate::Limited {
                events: 10,
                interval: Duration::from_millis(100)
            }
        );
        assert_eq!(
            "10/100ms".parse::<Rate>().unwrap(),
            "10/100".parse::<Rate>().unwrap()
        );
        assert_eq!(
            "1/18h".parse::<Rate>().unwrap(),
            Rate::Limited {
                events: 1,
                interval: Duration::from_secs(18 * 3600)
            }
        );
        assert_eq!(
            "50/1d".parse::<Rate>().unwrap(),
            Rate::Limited {
                events: 50,
                interval: Duration::from_secs(86_400)
            }
        );
        assert_eq!("Unlimited".parse::<Rate>().unwrap(), Rate::Unlimited);
    }

    #[test]
    fn test_parse_invalid_rates() {
        assert!("0/1s".parse::<Rate>().is_err());
        assert!("1/0".parse::<Rate>().is_err());
        assert!("abc".parse::<Rate>().is_err());
        assert!("1/5fortnights".parse::<Rate>().is_err());
        assert!("x/1s".parse::<Rate>().is_err());
    }

    #[test]
    fn test_rate_display() {
        assert_eq!("1/18h".parse::<Rate>().unwrap().to_string(), "1/18h");
        assert_eq!("50/1d".parse::<Rate>().unwrap().to_string(), "50/1d");
        assert_eq!("3/1500".parse::<Rate>().unwrap().to_string(), "3/1500ms");
    }

    #[tokio::test(start_paused = true)]
    async fn test_event_ok_until_limit() {
        let limiter = RateLimiter::from_rate_str("2/1s").unwrap();
        assert!(limiter.is_event_ok());
        limiter.event();
        assert!(limiter.is_event_ok());
        limiter.event();
        assert!(!limiter.is_event_ok());
        assert_eq!(limiter.time_until_event_ok(), Duration::from_secs(1));

        tokio::time::advance(Duration::from_millis(999)).await;
        assert!(!limiter.is_event_ok());
        tokio::time::advance(Duration::from_millis(1)).await;
        assert!(limiter.is_event_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_unevent_restores_capacity() {
        let limiter = RateLimiter::from_rate_str("1/1h").unwrap();
        limiter.event();
        assert!(!limiter.is_event_ok());
        limiter.unevent();
        assert!(limiter.is_event_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_unlimited_never_blocks() {
        let limiter = RateLimiter::unlimited();
        for _ in 0..1000 {
            limiter.event();
        }
        assert!(limiter.is_event_ok());
        assert_eq!(limiter.recorded_events(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_set_rate_keeps_most_recent_events() {
        let limiter = RateLimiter::from_rate_str("3/10s").unwrap();
        limiter.event();
        tokio::time::advance(Duration::from_secs(1)).await;
        limiter.event();
        tokio::time::advance(Duration::from_secs(1)).await;
        limiter.event();

        limiter.set_rate("2/10s".parse().unwrap());
        assert_eq!(limiter.recorded_events(), 2);
        // Oldest retained event is the one at t=1s
        assert_eq!(limiter.time_until_event_ok(), Duration::from_secs(9));
        assert!(limiter.is_rate("2/10s"));
        assert!(!limiter.is_rate("3/10s"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_fifo_wait_respects_rolling_window() {
        let limiter = Arc::new(RateLimiter::from_rate_str("2/1s").unwrap());
        let start = Instant::now();
        let mut times = Vec::new();
        for _ in 0..6 {
            limiter.fifo_wait_and_signal_event().await;
            times.push(start.elapsed());
        }

        // No rolling one-second window contains more than two events
        for window in times.windows(3) {
            assert!(window[2] - window[0] >= Duration::from_secs(1));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_fifo_order_under_concurrency() {
        let limiter = Arc::new(RateLimiter::from_rate_str("1/100ms").unwrap());
        let order = Arc::new(Mutex::new(Vec::new()));

        let mut handles = Vec::new();
        for i in 0..5 {
            let limiter = limiter.clone();
            let order = order.clone();
            handles.push(tokio::spawn(async move {
                limiter.fifo_wait_and_signal_event().await;
                order.lock().unwrap().push(i);
            }));
            // Make arrival order deterministic
            tokio::task::yield_now().await;
        }
        for handle in handles {
            handle.await.unwrap();
        }

        assert_eq!(*order.lock().unwrap(), vec![0, 1, 2, 3, 4]);
    }
}

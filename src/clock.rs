// src/clock.rs
//! Injectable time source.
//!
//! Everything that waits (scheduler cycles, fetch pacing, retry backoff) goes
//! through [`Clock`], so tests can drive virtual time with [`ManualClock`]
//! instead of sleeping for real.

use std::sync::Mutex;
use std::time::Duration;

use chrono::{DateTime, FixedOffset, NaiveDateTime, TimeZone, Utc};

#[async_trait::async_trait]
pub trait Clock: Send + Sync {
    /// Wall-clock time in UTC.
    fn now_utc(&self) -> DateTime<Utc>;
    /// Naive wall-clock time in the market's local zone.
    fn now_local(&self) -> NaiveDateTime;
    async fn sleep(&self, d: Duration);
}

/// Real clock. `offset` pins the market's local zone; `None` uses the host zone.
#[derive(Debug, Clone, Default)]
pub struct SystemClock {
    offset: Option<FixedOffset>,
}

impl SystemClock {
    pub fn new(utc_offset_minutes: Option<i32>) -> Self {
        Self {
            offset: utc_offset_minutes.and_then(|m| FixedOffset::east_opt(m * 60)),
        }
    }
}

#[async_trait::async_trait]
impl Clock for SystemClock {
    fn now_utc(&self) -> DateTime<Utc> {
        Utc::now()
    }

    fn now_local(&self) -> NaiveDateTime {
        match self.offset {
            Some(off) => off.from_utc_datetime(&Utc::now().naive_utc()).naive_local(),
            None => chrono::Local::now().naive_local(),
        }
    }

    async fn sleep(&self, d: Duration) {
        tokio::time::sleep(d).await;
    }
}

/// Virtual clock for tests: `sleep` advances time instantly and records the request.
/// Local time and UTC coincide.
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<NaiveDateTime>,
    slept: Mutex<Vec<Duration>>,
}

impl ManualClock {
    pub fn new(start: NaiveDateTime) -> Self {
        Self {
            now: Mutex::new(start),
            slept: Mutex::new(Vec::new()),
        }
    }

    pub fn set(&self, t: NaiveDateTime) {
        *self.now.lock().expect("clock mutex poisoned") = t;
    }

    pub fn advance(&self, d: Duration) {
        let mut now = self.now.lock().expect("clock mutex poisoned");
        *now += chrono::Duration::from_std(d).unwrap_or_else(|_| chrono::Duration::zero());
    }

    /// All durations passed to `sleep`, oldest first.
    pub fn sleeps(&self) -> Vec<Duration> {
        self.slept.lock().expect("clock mutex poisoned").clone()
    }

    pub fn total_slept(&self) -> Duration {
        self.sleeps().iter().sum()
    }
}

#[async_trait::async_trait]
impl Clock for ManualClock {
    fn now_utc(&self) -> DateTime<Utc> {
        self.now_local().and_utc()
    }

    fn now_local(&self) -> NaiveDateTime {
        *self.now.lock().expect("clock mutex poisoned")
    }

    async fn sleep(&self, d: Duration) {
        self.slept.lock().expect("clock mutex poisoned").push(d);
        self.advance(d);
        tokio::task::yield_now().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    #[tokio::test]
    async fn manual_clock_advances_on_sleep() {
        let start = NaiveDate::from_ymd_opt(2025, 3, 3)
            .unwrap()
            .and_hms_opt(8, 0, 0)
            .unwrap();
        let clock = ManualClock::new(start);
        clock.sleep(Duration::from_secs(90)).await;
        assert_eq!(clock.now_local(), start + chrono::Duration::seconds(90));
        assert_eq!(clock.sleeps(), vec![Duration::from_secs(90)]);
    }
}

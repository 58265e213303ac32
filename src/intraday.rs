// src/intraday.rs
//! Intraday watcher seam. The scheduler calls [`IntradayWatcher::ensure`]
//! on every cycle; the watcher decides whether it should be active.

use std::sync::{Arc, RwLock};

use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};

use crate::market_time::{format_trade_date, is_trading_hours, next_close, next_open, TradingCalendar};

pub trait IntradayWatcher: Send + Sync {
    fn ensure(&self, market: &str, now: NaiveDateTime);
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct WatcherStatus {
    pub running: bool,
    pub market: Option<String>,
    pub trade_date: Option<String>,
    pub last_change_at: Option<NaiveDateTime>,
    /// Close while running, next open once stopped.
    pub next_transition_at: Option<NaiveDateTime>,
}

/// Active exactly while the market is in session; logs each transition.
pub struct TradingHoursGate {
    calendar: Arc<dyn TradingCalendar>,
    state: RwLock<WatcherStatus>,
}

impl TradingHoursGate {
    pub fn new(calendar: Arc<dyn TradingCalendar>) -> Self {
        Self {
            calendar,
            state: RwLock::new(WatcherStatus::default()),
        }
    }

    pub fn status(&self) -> WatcherStatus {
        self.state.read().expect("watcher lock poisoned").clone()
    }
}

impl IntradayWatcher for TradingHoursGate {
    fn ensure(&self, market: &str, now: NaiveDateTime) {
        let open = is_trading_hours(self.calendar.as_ref(), market, now);
        let trade_date = format_trade_date(now.date());
        let mut s = self.state.write().expect("watcher lock poisoned");
        let same_session = s.market.as_deref() == Some(market) && s.trade_date.as_deref() == Some(trade_date.as_str());
        if open && !(s.running && same_session) {
            let closes_at = next_close(self.calendar.as_ref(), market, now);
            tracing::info!(target: "intraday", market, trade_date = %trade_date, %closes_at, "watcher started");
            *s = WatcherStatus {
                running: true,
                market: Some(market.to_string()),
                trade_date: Some(trade_date),
                last_change_at: Some(now),
                next_transition_at: Some(closes_at),
            };
        } else if !open && s.running {
            let opens_at = next_open(self.calendar.as_ref(), market, now);
            tracing::info!(target: "intraday", market, %opens_at, "watcher stopped");
            s.running = false;
            s.last_change_at = Some(now);
            s.next_transition_at = Some(opens_at);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::market_time::WeekdayCalendar;
    use chrono::NaiveDate;

    fn at(d: u32, h: u32, m: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2025, 1, d)
            .unwrap()
            .and_hms_opt(h, m, 0)
            .unwrap()
    }

    #[test]
    fn follows_session_hours() {
        let gate = TradingHoursGate::new(Arc::new(WeekdayCalendar::default()));
        gate.ensure("SSE", at(6, 9, 0));
        assert!(!gate.status().running);

        gate.ensure("SSE", at(6, 10, 0));
        let s = gate.status();
        assert!(s.running);
        assert_eq!(s.trade_date.as_deref(), Some("2025-01-06"));
        assert_eq!(s.last_change_at, Some(at(6, 10, 0)));
        assert_eq!(s.next_transition_at, Some(at(6, 15, 0)));

        // still open: no transition recorded
        gate.ensure("SSE", at(6, 11, 0));
        assert_eq!(gate.status().last_change_at, Some(at(6, 10, 0)));

        gate.ensure("SSE", at(6, 15, 30));
        let s = gate.status();
        assert!(!s.running);
        assert_eq!(s.next_transition_at, Some(at(7, 9, 30)));

        // Saturday
        gate.ensure("SSE", at(11, 10, 0));
        assert!(!gate.status().running);
    }
}

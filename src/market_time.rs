// src/market_time.rs
//! Market sessions, trading-day calendar and pre-open deadline arithmetic.
//!
//! All datetimes here are naive market-local wall-clock times; there is no
//! timezone handling beyond what the injected [`crate::clock::Clock`] provides.

use std::collections::{BTreeSet, HashMap};

use chrono::{Datelike, Duration, NaiveDate, NaiveDateTime, NaiveTime, Weekday};
use serde::{Deserialize, Serialize};

use crate::config::MarketCalendarConfig;

pub const DEFAULT_MARKET: &str = "SSE";

/// Upper bound on the forward scan for the next trading day.
const MAX_SCAN_DAYS: u32 = 366;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum MarketTimeError {
    #[error("invalid trade date {0:?}, expected YYYY-MM-DD")]
    BadTradeDate(String),
}

/// Single-session open/close for a market (lunch breaks are ignored).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MarketSession {
    pub open: NaiveTime,
    pub close: NaiveTime,
}

fn hm(h: u32, m: u32) -> NaiveTime {
    NaiveTime::from_hms_opt(h, m, 0).unwrap_or(NaiveTime::MIN)
}

/// Session table. Unknown markets use SSE hours.
pub fn market_session(market: &str) -> MarketSession {
    match market.trim().to_ascii_uppercase().as_str() {
        "NYSE" | "NASDAQ" | "HKEX" => MarketSession {
            open: hm(9, 30),
            close: hm(16, 0),
        },
        _ => MarketSession {
            open: hm(9, 30),
            close: hm(15, 0),
        },
    }
}

pub fn market_open_at(market: &str, date: NaiveDate) -> NaiveDateTime {
    date.and_time(market_session(market).open)
}

pub fn market_close_at(market: &str, date: NaiveDate) -> NaiveDateTime {
    date.and_time(market_session(market).close)
}

pub fn parse_trade_date(s: &str) -> Result<NaiveDate, MarketTimeError> {
    NaiveDate::parse_from_str(s.trim(), "%Y-%m-%d")
        .map_err(|_| MarketTimeError::BadTradeDate(s.to_string()))
}

pub fn format_trade_date(d: NaiveDate) -> String {
    d.format("%Y-%m-%d").to_string()
}

/// Pluggable trading-day predicate.
pub trait TradingCalendar: Send + Sync {
    fn is_trading_day(&self, market: &str, date: NaiveDate) -> bool;
}

/// Monday–Friday minus configured holidays. A market-specific holiday list,
/// when present, replaces the global one.
#[derive(Debug, Clone, Default)]
pub struct WeekdayCalendar {
    global: BTreeSet<NaiveDate>,
    per_market: HashMap<String, BTreeSet<NaiveDate>>,
}

impl WeekdayCalendar {
    pub fn from_config(cfg: &MarketCalendarConfig) -> Self {
        Self {
            global: cfg.holidays.iter().copied().collect(),
            per_market: cfg
                .markets
                .iter()
                .map(|(k, v)| (k.to_ascii_uppercase(), v.holidays.iter().copied().collect()))
                .collect(),
        }
    }

    pub fn with_holidays<I: IntoIterator<Item = NaiveDate>>(holidays: I) -> Self {
        Self {
            global: holidays.into_iter().collect(),
            per_market: HashMap::new(),
        }
    }
}

impl TradingCalendar for WeekdayCalendar {
    fn is_trading_day(&self, market: &str, date: NaiveDate) -> bool {
        if matches!(date.weekday(), Weekday::Sat | Weekday::Sun) {
            return false;
        }
        let holidays = self
            .per_market
            .get(&market.to_ascii_uppercase())
            .unwrap_or(&self.global);
        !holidays.contains(&date)
    }
}

/// First trading day strictly after `date`.
pub fn next_trading_day(cal: &dyn TradingCalendar, market: &str, date: NaiveDate) -> NaiveDate {
    let mut d = date;
    for _ in 0..MAX_SCAN_DAYS {
        d = d.succ_opt().unwrap_or(d);
        if cal.is_trading_day(market, d) {
            return d;
        }
    }
    tracing::warn!(market, %date, "no trading day found within scan window");
    d
}

/// Next open on or after `from`: today's open if `from` is before it on a trading day.
pub fn next_open(cal: &dyn TradingCalendar, market: &str, from: NaiveDateTime) -> NaiveDateTime {
    let today = market_open_at(market, from.date());
    if cal.is_trading_day(market, from.date()) && from < today {
        return today;
    }
    market_open_at(market, next_trading_day(cal, market, from.date()))
}

pub fn next_close(cal: &dyn TradingCalendar, market: &str, from: NaiveDateTime) -> NaiveDateTime {
    let today = market_close_at(market, from.date());
    if cal.is_trading_day(market, from.date()) && from < today {
        return today;
    }
    market_close_at(market, next_trading_day(cal, market, from.date()))
}

pub fn is_trading_hours(cal: &dyn TradingCalendar, market: &str, now: NaiveDateTime) -> bool {
    cal.is_trading_day(market, now.date())
        && now >= market_open_at(market, now.date())
        && now < market_close_at(market, now.date())
}

/// Minutes-before-open for each pipeline milestone.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeadlinesSpec {
    pub fetch_min_before_open: u32,
    pub topn_min_before_open: u32,
    pub plan_min_before_open: u32,
}

impl Default for DeadlinesSpec {
    fn default() -> Self {
        Self {
            fetch_min_before_open: 45,
            topn_min_before_open: 35,
            plan_min_before_open: 30,
        }
    }
}

/// Resolved deadlines with `T-NN` labels.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeadlineSchedule {
    pub open_at: NaiveDateTime,
    pub fetch: String,
    pub topn: String,
    pub plan: String,
    pub fetch_at: NaiveDateTime,
    pub topn_at: NaiveDateTime,
    pub plan_at: NaiveDateTime,
}

pub fn compute_deadlines(market: &str, trade_date: NaiveDate, spec: &DeadlinesSpec) -> DeadlineSchedule {
    let open_at = market_open_at(market, trade_date);
    let before = |m: u32| open_at - Duration::minutes(i64::from(m));
    DeadlineSchedule {
        open_at,
        fetch: format!("T-{}", spec.fetch_min_before_open),
        topn: format!("T-{}", spec.topn_min_before_open),
        plan: format!("T-{}", spec.plan_min_before_open),
        fetch_at: before(spec.fetch_min_before_open),
        topn_at: before(spec.topn_min_before_open),
        plan_at: before(spec.plan_min_before_open),
    }
}

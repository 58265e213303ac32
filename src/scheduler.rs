// src/scheduler.rs
//! Pre-open scheduler with a consecutive-failure circuit breaker.
//!
//! One decision per [`Scheduler::cycle`]; the run loop sleeps for the
//! returned duration, and any sleep is cut short by the shutdown signal.
//! Triggers go through the same [`RunTrigger`] entry point manual callers
//! use, so the per-date dedupe applies to both.

use std::collections::BTreeMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{NaiveDateTime, NaiveTime};
use metrics::{counter, describe_counter};
use once_cell::sync::OnceCell;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::alerts::{AlertLevel, AlertLog};
use crate::clock::Clock;
use crate::config::SchedulerConfig;
use crate::intraday::IntradayWatcher;
use crate::market_time::{format_trade_date, market_open_at, next_trading_day, TradingCalendar};

pub const CIRCUIT_OPEN_ALERT: &str = "alert.scheduler.circuit_open";

fn ensure_metrics_described() {
    static ONCE: OnceCell<()> = OnceCell::new();
    ONCE.get_or_init(|| {
        describe_counter!("scheduler_triggers_total", "Pre-open runs triggered by the scheduler.");
        describe_counter!("scheduler_failures_total", "Scheduler trigger attempts that failed.");
        describe_counter!("scheduler_circuit_open_total", "Times the scheduler circuit opened.");
    });
}

/// Entry point shared by the scheduler and manual callers.
#[async_trait]
pub trait RunTrigger: Send + Sync {
    /// Returns the task id.
    async fn trigger_run(&self, market: &str, trade_date: &str) -> anyhow::Result<String>;
    fn has_job_for(&self, market: &str, trade_date: &str) -> bool;
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum SchedulerStatus {
    Running,
    Paused,
    Stopped,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SchedulerState {
    pub status: SchedulerStatus,
    pub reason: Option<String>,
    pub market: String,
    pub trade_date: Option<String>,
    pub next_run_at: Option<NaiveDateTime>,
    pub next_wake_at: Option<NaiveDateTime>,
    pub consecutive_failures: u32,
    pub circuit_resume_at: Option<NaiveDateTime>,
    pub last_triggered_trade_date: Option<String>,
    pub last_triggered_at: Option<NaiveDateTime>,
    pub last_error: Option<String>,
    pub last_error_at: Option<NaiveDateTime>,
}

impl SchedulerState {
    fn new(market: &str) -> Self {
        Self {
            status: SchedulerStatus::Running,
            reason: None,
            market: market.to_string(),
            trade_date: None,
            next_run_at: None,
            next_wake_at: None,
            consecutive_failures: 0,
            circuit_resume_at: None,
            last_triggered_trade_date: None,
            last_triggered_at: None,
            last_error: None,
            last_error_at: None,
        }
    }
}

/// `max(floor, target − now)`; a target in the past yields the floor.
fn wait_until(now: NaiveDateTime, target: NaiveDateTime, floor: Duration) -> Duration {
    (target - now).to_std().unwrap_or(Duration::ZERO).max(floor)
}

/// Non-trading days sleep until this local time on the next session.
fn morning_wake() -> NaiveTime {
    NaiveTime::from_hms_opt(6, 0, 0).unwrap_or_default()
}

pub struct Scheduler {
    market: String,
    first_fetch_minutes: u32,
    cfg: SchedulerConfig,
    clock: Arc<dyn Clock>,
    calendar: Arc<dyn TradingCalendar>,
    trigger: Arc<dyn RunTrigger>,
    watcher: Arc<dyn IntradayWatcher>,
    alerts: Arc<AlertLog>,
    state: Arc<RwLock<SchedulerState>>,
}

impl Scheduler {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        market: impl Into<String>,
        first_fetch_minutes: u32,
        cfg: SchedulerConfig,
        clock: Arc<dyn Clock>,
        calendar: Arc<dyn TradingCalendar>,
        trigger: Arc<dyn RunTrigger>,
        watcher: Arc<dyn IntradayWatcher>,
        alerts: Arc<AlertLog>,
    ) -> Self {
        let market = market.into();
        let state = Arc::new(RwLock::new(SchedulerState::new(&market)));
        Self {
            market,
            first_fetch_minutes,
            cfg,
            clock,
            calendar,
            trigger,
            watcher,
            alerts,
            state,
        }
    }

    pub fn snapshot(&self) -> SchedulerState {
        self.state.read().expect("scheduler state lock poisoned").clone()
    }

    fn update(&self, f: impl FnOnce(&mut SchedulerState)) {
        f(&mut self.state.write().expect("scheduler state lock poisoned"));
    }

    /// One scheduling decision. Returns how long to wait before the next one.
    pub async fn cycle(&self) -> Duration {
        ensure_metrics_described();
        let market = self.market.as_str();
        let now = self.clock.now_local();
        self.watcher.ensure(market, now);

        let resume_at = self.snapshot().circuit_resume_at;
        if let Some(resume) = resume_at {
            if now < resume {
                self.update(|s| {
                    s.status = SchedulerStatus::Paused;
                    s.reason = Some("circuit_open".into());
                });
                return wait_until(now, resume, Duration::from_secs(5));
            }
            tracing::info!(target: "scheduler", market, "circuit closed after cooldown");
            self.update(|s| {
                s.circuit_resume_at = None;
                s.reason = None;
                s.status = SchedulerStatus::Running;
            });
        }

        let today = now.date();
        if !self.calendar.is_trading_day(market, today) {
            let wake = next_trading_day(self.calendar.as_ref(), market, today).and_time(morning_wake());
            self.update(|s| {
                s.status = SchedulerStatus::Running;
                s.reason = Some("non_trading_day".into());
                s.next_wake_at = Some(wake);
            });
            tracing::debug!(target: "scheduler", market, wake = %wake, "non-trading day");
            return wait_until(now, wake, Duration::from_secs(5));
        }

        let lead = chrono::Duration::minutes(i64::from(self.first_fetch_minutes));
        let trade_date = format_trade_date(today);
        let open = market_open_at(market, today);
        let run_at = open - lead;
        self.update(|s| {
            s.status = SchedulerStatus::Running;
            s.reason = None;
            s.trade_date = Some(trade_date.clone());
            s.next_run_at = Some(run_at);
        });
        if now < run_at {
            return wait_until(now, run_at, Duration::from_secs(1));
        }
        if now >= open {
            let next = next_trading_day(self.calendar.as_ref(), market, today);
            let next_run = market_open_at(market, next) - lead;
            self.update(|s| {
                s.trade_date = Some(format_trade_date(next));
                s.next_run_at = Some(next_run);
                s.reason = Some("past_open".into());
            });
            return wait_until(now, next_run, Duration::from_secs(5));
        }

        if self.trigger.has_job_for(market, &trade_date) {
            return Duration::from_secs(self.cfg.poll_secs);
        }

        tracing::info!(target: "scheduler", market, trade_date = %trade_date, "triggering pre-open run");
        match self.trigger.trigger_run(market, &trade_date).await {
            Ok(task_id) => {
                counter!("scheduler_triggers_total").increment(1);
                let at = self.clock.now_local();
                self.update(|s| {
                    s.consecutive_failures = 0;
                    s.last_triggered_trade_date = Some(trade_date.clone());
                    s.last_triggered_at = Some(at);
                });
                tracing::info!(target: "scheduler", market, task_id = %task_id, "pre-open run triggered");
                let buffer = chrono::Duration::minutes(i64::from(self.cfg.post_open_buffer_minutes));
                wait_until(at, open + buffer, Duration::from_secs(5))
            }
            Err(e) => {
                counter!("scheduler_failures_total").increment(1);
                let at = self.clock.now_local();
                let mut streak = 0;
                self.update(|s| {
                    s.consecutive_failures += 1;
                    s.last_error = Some(format!("{e:#}"));
                    s.last_error_at = Some(at);
                    streak = s.consecutive_failures;
                });
                tracing::warn!(target: "scheduler", error = ?e, market, streak, "trigger failed");

                if streak >= self.cfg.failure_threshold.max(1) {
                    let cooldown = Duration::from_secs(u64::from(self.cfg.circuit_cooldown_minutes) * 60);
                    let resume = at + chrono::Duration::minutes(i64::from(self.cfg.circuit_cooldown_minutes));
                    self.update(|s| {
                        s.status = SchedulerStatus::Paused;
                        s.reason = Some("circuit_open".into());
                        s.circuit_resume_at = Some(resume);
                    });
                    counter!("scheduler_circuit_open_total").increment(1);
                    let mut fields = BTreeMap::new();
                    fields.insert("consecutive_failures".to_string(), serde_json::Value::from(streak));
                    fields.insert("resume_after".to_string(), serde_json::Value::from(resume.to_string()));
                    fields.insert("market".to_string(), serde_json::Value::from(market));
                    self.alerts.log_event(
                        CIRCUIT_OPEN_ALERT,
                        AlertLevel::Critical,
                        format!("Scheduler circuit open after {streak} consecutive failures"),
                        fields,
                    );
                    return cooldown.max(Duration::from_secs(5));
                }
                Duration::from_secs(self.cfg.error_backoff_secs)
            }
        }
    }

    /// Starts the loop on its own task.
    pub fn spawn(self) -> SchedulerHandle {
        let (tx, mut rx) = watch::channel(false);
        let state = self.state.clone();
        let join = tokio::spawn(async move {
            tracing::info!(target: "scheduler", market = %self.market, "scheduler started");
            loop {
                if *rx.borrow() {
                    break;
                }
                let wait = self.cycle().await;
                tokio::select! {
                    _ = self.clock.sleep(wait) => {}
                    _ = rx.changed() => break,
                }
            }
            self.update(|s| s.status = SchedulerStatus::Stopped);
            tracing::info!(target: "scheduler", market = %self.market, "scheduler stopped");
        });
        SchedulerHandle {
            state,
            shutdown: tx,
            join,
        }
    }
}

/// Read-only view of the scheduler state, cheap to clone into handlers.
#[derive(Clone)]
pub struct SchedulerView {
    state: Arc<RwLock<SchedulerState>>,
}

impl SchedulerView {
    pub fn snapshot(&self) -> SchedulerState {
        self.state.read().expect("scheduler state lock poisoned").clone()
    }
}

pub struct SchedulerHandle {
    state: Arc<RwLock<SchedulerState>>,
    shutdown: watch::Sender<bool>,
    join: JoinHandle<()>,
}

impl SchedulerHandle {
    pub fn snapshot(&self) -> SchedulerState {
        self.state.read().expect("scheduler state lock poisoned").clone()
    }

    pub fn view(&self) -> SchedulerView {
        SchedulerView {
            state: self.state.clone(),
        }
    }

    pub fn is_alive(&self) -> bool {
        !self.join.is_finished()
    }

    /// Signals shutdown and waits up to `timeout`. `true` when the loop exited.
    pub async fn stop(self, timeout: Duration) -> bool {
        let _ = self.shutdown.send(true);
        tokio::time::timeout(timeout, self.join).await.is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wait_respects_floor() {
        let base = chrono::NaiveDate::from_ymd_opt(2025, 1, 6)
            .unwrap()
            .and_hms_opt(8, 0, 0)
            .unwrap();
        let later = base + chrono::Duration::minutes(10);
        assert_eq!(wait_until(base, later, Duration::from_secs(1)), Duration::from_secs(600));
        assert_eq!(wait_until(later, base, Duration::from_secs(5)), Duration::from_secs(5));
    }

    #[test]
    fn morning_wake_is_six() {
        assert_eq!(morning_wake(), NaiveTime::from_hms_opt(6, 0, 0).unwrap());
    }
}

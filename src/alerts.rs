//! alerts.rs: bounded in-memory buffer of explicit alert events
//! (e.g. scheduler circuit open). Oldest events are dropped first.

use std::collections::BTreeMap;
use std::sync::Mutex;

use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const DEFAULT_MAX_EVENTS: usize = 100;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum AlertLevel {
    Info,
    Warning,
    Critical,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AlertEvent {
    pub key: String,
    pub level: AlertLevel,
    pub message: String,
    pub ts_ms: i64,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub fields: BTreeMap<String, Value>,
}

#[derive(Debug)]
pub struct AlertLog {
    inner: Mutex<Vec<AlertEvent>>,
    cap: usize,
}

impl Default for AlertLog {
    fn default() -> Self {
        Self::with_capacity(DEFAULT_MAX_EVENTS)
    }
}

impl AlertLog {
    pub fn with_capacity(cap: usize) -> Self {
        let cap = cap.clamp(1, 10_000);
        Self {
            inner: Mutex::new(Vec::with_capacity(cap)),
            cap,
        }
    }

    pub fn log_event(
        &self,
        key: &str,
        level: AlertLevel,
        message: impl Into<String>,
        fields: BTreeMap<String, Value>,
    ) {
        let event = AlertEvent {
            key: key.to_string(),
            level,
            message: message.into(),
            ts_ms: chrono::Utc::now().timestamp_millis(),
            fields,
        };
        match level {
            AlertLevel::Critical => {
                tracing::error!(target: "alerts", key, message = %event.message, "alert event")
            }
            AlertLevel::Warning => {
                tracing::warn!(target: "alerts", key, message = %event.message, "alert event")
            }
            AlertLevel::Info => {
                tracing::info!(target: "alerts", key, message = %event.message, "alert event")
            }
        }

        let mut v = self.inner.lock().expect("alert log mutex poisoned");
        v.push(event);
        if v.len() > self.cap {
            let excess = v.len() - self.cap;
            v.drain(0..excess);
        }
    }

    /// Oldest first.
    pub fn recent(&self) -> Vec<AlertEvent> {
        self.inner.lock().expect("alert log mutex poisoned").clone()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().expect("alert log mutex poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

//! Metric transformation and fan-out.
//!
//! [`MetricSender`] turns raw counter samples into simple-change or
//! per-second rate values using a per-(host, key) baseline, then
//! forwards the result to every registered transport backend. The first
//! sample of any (host, key) pair only seeds the baseline; nothing is
//! emitted until a second sample arrives.

use crate::transport::Transport;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use std::time::Duration;
use tracing::{debug, warn};

/// How a counter sample is transformed before forwarding
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Delta {
    /// Forward the sample as-is.
    #[default]
    None,
    /// Forward `value - previous`.
    SimpleChange,
    /// Forward `(value - previous) / (clock - previous clock)`.
    SpeedPerSecond,
}

/// One metric value on its way to a backend
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MetricValue {
    Integer(i64),
    Float(f64),
    Text(String),
}

impl MetricValue {
    /// Numeric view; text and other values are not transformable.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            MetricValue::Integer(i) => Some(*i as f64),
            MetricValue::Float(f) => Some(*f),
            MetricValue::Text(_) => None,
        }
    }
}

impl From<i64> for MetricValue {
    fn from(value: i64) -> Self {
        MetricValue::Integer(value)
    }
}

impl From<f64> for MetricValue {
    fn from(value: f64) -> Self {
        MetricValue::Float(value)
    }
}

impl From<&str> for MetricValue {
    fn from(value: &str) -> Self {
        MetricValue::Text(value.to_string())
    }
}

impl From<String> for MetricValue {
    fn from(value: String) -> Self {
        MetricValue::Text(value)
    }
}

/// Serialize a value to the transport-ready textual form.
pub fn to_json<T: Serialize>(value: &T) -> serde_json::Result<String> {
    serde_json::to_string(value)
}

const DEFAULT_SEND_TIMEOUT: Duration = Duration::from_secs(60);

/// Baseline table bounds. The sweep is best effort: when the table grows
/// past capacity, entries that have not been updated within the stale
/// age are dropped.
const DEFAULT_TABLE_CAPACITY: usize = 10_000;
const DEFAULT_STALE_AGE_SECS: i64 = 3600;

struct Baseline {
    value: f64,
    clock: i64,
}

struct LastValueTable {
    entries: HashMap<String, Baseline>,
    capacity: usize,
    stale_age: i64,
}

impl LastValueTable {
    fn new(capacity: usize, stale_age: i64) -> Self {
        Self {
            entries: HashMap::new(),
            capacity,
            stale_age,
        }
    }

    /// Store the new baseline, returning the previous one if any.
    fn swap(&mut self, key: String, value: f64, clock: i64) -> Option<Baseline> {
        let previous = self.entries.insert(key, Baseline { value, clock });
        if previous.is_none() && self.entries.len() > self.capacity {
            let cutoff = clock - self.stale_age;
            let before = self.entries.len();
            self.entries.retain(|_, baseline| baseline.clock >= cutoff);
            debug!(
                evicted = before - self.entries.len(),
                remaining = self.entries.len(),
                "swept stale metric baselines"
            );
        }
        previous
    }
}

/// Stateful transform and fan-out stage between plugins and transports.
pub struct MetricSender {
    backends: RwLock<Vec<Arc<dyn Transport>>>,
    last_values: Mutex<LastValueTable>,
    send_timeout: Duration,
}

impl Default for MetricSender {
    fn default() -> Self {
        Self::new()
    }
}

impl MetricSender {
    pub fn new() -> Self {
        Self {
            backends: RwLock::new(Vec::new()),
            last_values: Mutex::new(LastValueTable::new(
                DEFAULT_TABLE_CAPACITY,
                DEFAULT_STALE_AGE_SECS,
            )),
            send_timeout: DEFAULT_SEND_TIMEOUT,
        }
    }

    /// Upper bound on one backend delivery, covering the backend's own
    /// internal retries.
    pub fn with_send_timeout(mut self, timeout: Duration) -> Self {
        self.send_timeout = timeout;
        self
    }

    pub fn with_table_bounds(mut self, capacity: usize, stale_age_secs: i64) -> Self {
        self.last_values = Mutex::new(LastValueTable::new(capacity, stale_age_secs));
        self
    }

    /// Replace the active backend set.
    pub fn set_backends(&self, backends: Vec<Arc<dyn Transport>>) {
        *self
            .backends
            .write()
            .unwrap_or_else(PoisonError::into_inner) = backends;
    }

    fn table(&self) -> MutexGuard<'_, LastValueTable> {
        self.last_values
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn active_backends(&self) -> Vec<Arc<dyn Transport>> {
        self.backends
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Transform and forward one sample.
    ///
    /// `clock` defaults to current epoch seconds. In a delta mode the
    /// first numeric sample per (host, key) seeds the baseline and is
    /// absorbed; a rate sample whose clock equals the baseline's is also
    /// absorbed (the baseline still advances) since no rate can be
    /// derived from a zero-length interval. Backend failures are logged
    /// and do not stop delivery to the remaining backends.
    pub async fn send(
        &self,
        key: &str,
        value: impl Into<MetricValue>,
        delta: Delta,
        host: Option<&str>,
        clock: Option<i64>,
    ) {
        let clock = clock.unwrap_or_else(|| Utc::now().timestamp());
        let mut outgoing = value.into();

        if delta != Delta::None {
            if let Some(current) = outgoing.as_f64() {
                let hash_key = format!("{}.{}", host.unwrap_or(""), key);
                let previous = self.table().swap(hash_key, current, clock);

                let Some(previous) = previous else {
                    // First observation: baseline seeded, nothing emitted.
                    return;
                };

                match delta {
                    Delta::SimpleChange => {
                        outgoing = MetricValue::Float(current - previous.value);
                    }
                    Delta::SpeedPerSecond => {
                        if clock == previous.clock {
                            debug!(key, clock, "dropping rate sample with unchanged clock");
                            return;
                        }
                        outgoing = MetricValue::Float(
                            (current - previous.value) / (clock - previous.clock) as f64,
                        );
                    }
                    Delta::None => {}
                }
            }
        }

        for backend in self.active_backends() {
            match tokio::time::timeout(
                self.send_timeout,
                backend.send(key, &outgoing, host, clock),
            )
            .await
            {
                Ok(Ok(())) => {}
                Ok(Err(error)) => {
                    warn!(backend = backend.name(), key, error = %error, "transport send failed");
                }
                Err(_) => {
                    warn!(backend = backend.name(), key, "transport send timed out");
                }
            }
        }
    }

    #[cfg(test)]
    pub(crate) fn baseline_count(&self) -> usize {
        self.table().entries.len()
    }
}

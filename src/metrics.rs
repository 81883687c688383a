//! Per-stage execution metrics.
//!
//! Executors accept an optional [`MetricsCollector`]. When one is attached they record, per
//! stage, an `<stage>.invocations` counter, an `<stage>.failures` counter and a
//! `<stage>.duration_ms` histogram of individual invocation times, plus the wall-clock span of
//! the whole run.
//!
//! ```
//! use chunkforge::metrics::MetricsCollector;
//! use std::time::Duration;
//!
//! let metrics = MetricsCollector::new();
//! metrics.record_invocation("store_chunk", Duration::from_millis(12), true);
//! metrics.record_invocation("store_chunk", Duration::from_millis(8), false);
//!
//! let snap = metrics.snapshot();
//! assert_eq!(snap["store_chunk.invocations"], 2);
//! assert_eq!(snap["store_chunk.failures"], 1);
//! ```

use anyhow::{Context, Result};
use serde_json::{Map, Value, json};
use std::any::Any;
use std::collections::HashMap;
use std::fs;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use tracing::info;

/// A named value reported by a [`MetricsCollector`].
pub trait Metric: Send + Sync + Any {
    fn name(&self) -> &str;

    fn value(&self) -> Value;

    fn description(&self) -> Option<&str> {
        None
    }

    fn as_any(&self) -> &dyn Any;

    fn as_any_mut(&mut self) -> &mut dyn Any;
}

/// Thread-safe metric registry shared between an executor and its workers.
#[derive(Clone, Default)]
pub struct MetricsCollector {
    inner: Arc<Mutex<MetricsCollectorInner>>,
}

#[derive(Default)]
struct MetricsCollectorInner {
    metrics: HashMap<String, Box<dyn Metric>>,
    start_time: Option<Instant>,
    end_time: Option<Instant>,
}

impl MetricsCollector {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, MetricsCollectorInner> {
        // A poisoned registry still holds usable numbers.
        self.inner.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    /// Register a metric, replacing any metric with the same name.
    pub fn register(&self, metric: Box<dyn Metric>) {
        self.lock().metrics.insert(metric.name().to_string(), metric);
    }

    pub fn record_start(&self) {
        self.lock().start_time = Some(Instant::now());
    }

    pub fn record_end(&self) {
        self.lock().end_time = Some(Instant::now());
    }

    #[must_use]
    pub fn elapsed(&self) -> Option<Duration> {
        self.lock().span()
    }

    /// Add `value` to a counter, creating it at zero if missing.
    pub fn increment_counter(&self, name: &str, value: u64) {
        let mut inner = self.lock();
        let metric = inner
            .metrics
            .entry(name.to_string())
            .or_insert_with(|| Box::new(CounterMetric::new(name)));
        if let Some(counter) = metric.as_any_mut().downcast_mut::<CounterMetric>() {
            counter.count += value;
        }
    }

    /// Record one observation into a histogram, creating it if missing.
    pub fn observe(&self, name: &str, value: f64) {
        let mut inner = self.lock();
        let metric = inner
            .metrics
            .entry(name.to_string())
            .or_insert_with(|| Box::new(HistogramMetric::new(name)));
        if let Some(hist) = metric.as_any_mut().downcast_mut::<HistogramMetric>() {
            hist.record(value);
        }
    }

    /// Record one stage invocation.
    pub fn record_invocation(&self, stage: &str, elapsed: Duration, ok: bool) {
        self.increment_counter(&format!("{stage}.invocations"), 1);
        if !ok {
            self.increment_counter(&format!("{stage}.failures"), 1);
        }
        self.observe(&format!("{stage}.duration_ms"), elapsed.as_secs_f64() * 1000.0);
    }

    /// Current counter value, if `name` is a counter.
    #[must_use]
    pub fn counter(&self, name: &str) -> Option<u64> {
        self.lock()
            .metrics
            .get(name)
            .and_then(|m| m.as_any().downcast_ref::<CounterMetric>())
            .map(|c| c.count)
    }

    /// All metrics as a JSON object, including `execution_time_ms` when the run has ended.
    #[must_use]
    pub fn to_json(&self) -> Value {
        let inner = self.lock();
        let mut report: Map<String, Value> = inner
            .metrics
            .iter()
            .map(|(name, metric)| {
                let mut entry = json!({ "value": metric.value() });
                if let Some(text) = metric.description() {
                    entry["description"] = json!(text);
                }
                (name.clone(), entry)
            })
            .collect();
        if let Some(span) = inner.span() {
            report.insert(
                "execution_time_ms".into(),
                json!({
                    "value": span.as_millis(),
                    "description": "Wall-clock time from run start to run end",
                }),
            );
        }
        Value::Object(report)
    }

    /// Emit every metric at `info` level, sorted by name.
    pub fn log_summary(&self) {
        let inner = self.lock();
        let mut sorted: Vec<_> = inner.metrics.iter().collect();
        sorted.sort_by_key(|(name, _)| *name);
        for (name, metric) in sorted {
            info!(metric = %name, value = %metric.value(), "pipeline metric");
        }
    }

    /// # Errors
    ///
    /// Returns an error if the file cannot be created or written.
    pub fn save_to_file(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let body = serde_json::to_vec_pretty(&self.to_json())?;
        fs::write(path, body).with_context(|| format!("write metrics to {}", path.display()))
    }

    /// Metric names to current values.
    #[must_use]
    pub fn snapshot(&self) -> HashMap<String, Value> {
        let inner = self.lock();
        inner.metrics.iter().map(|(k, m)| (k.clone(), m.value())).collect()
    }
}

impl MetricsCollectorInner {
    fn span(&self) -> Option<Duration> {
        Some(self.end_time?.duration_since(self.start_time?))
    }
}

pub struct CounterMetric {
    name: String,
    count: u64,
}

impl CounterMetric {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into(), count: 0 }
    }

    pub fn with_value(name: impl Into<String>, count: u64) -> Self {
        Self { name: name.into(), count }
    }
}

impl Metric for CounterMetric {
    fn name(&self) -> &str {
        &self.name
    }

    fn value(&self) -> Value {
        json!(self.count)
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

/// Distribution of observed values.
pub struct HistogramMetric {
    name: String,
    values: Vec<f64>,
    description: Option<String>,
}

impl HistogramMetric {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into(), values: Vec::new(), description: None }
    }

    pub fn with_values(name: impl Into<String>, values: Vec<f64>) -> Self {
        Self { name: name.into(), values, description: None }
    }

    #[must_use]
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn record(&mut self, value: f64) {
        self.values.push(value);
    }

    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn stats(&self) -> HistogramStats {
        if self.values.is_empty() {
            return HistogramStats::default();
        }

        let mut sorted = self.values.clone();
        sorted.sort_by(f64::total_cmp);

        let count = sorted.len();
        let sum: f64 = sorted.iter().sum();
        HistogramStats {
            count,
            sum,
            mean: sum / count as f64,
            min: sorted[0],
            max: sorted[count - 1],
            p50: sorted[count / 2],
            p95: sorted[(count * 95) / 100],
        }
    }
}

impl Metric for HistogramMetric {
    fn name(&self) -> &str {
        &self.name
    }

    fn value(&self) -> Value {
        let stats = self.stats();
        json!({
            "count": stats.count,
            "sum": stats.sum,
            "mean": stats.mean,
            "min": stats.min,
            "max": stats.max,
            "p50": stats.p50,
            "p95": stats.p95,
        })
    }

    fn description(&self) -> Option<&str> {
        self.description.as_deref()
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

#[derive(Debug, Clone, Default)]
pub struct HistogramStats {
    pub count: usize,
    pub sum: f64,
    pub mean: f64,
    pub min: f64,
    pub max: f64,
    pub p50: f64,
    pub p95: f64,
}

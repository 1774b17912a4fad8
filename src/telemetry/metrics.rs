//! Process-lifetime counters and histograms.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::{PoisonError, RwLock};

/// Well-known metric names emitted by this crate.
pub mod names {
    /// Counter, tagged `outcome=hit|miss`.
    pub const CACHE_LOOKUPS: &str = "cache.lookups";
    pub const CACHE_WRITES: &str = "cache.writes";
    pub const CACHE_INVALIDATIONS: &str = "cache.invalidations";
    /// Counter of backend failures absorbed by the cache store.
    pub const CACHE_ERRORS: &str = "cache.errors";
    /// Counter, tagged `outcome=success|failure|rejected_by_breaker|rejected_by_limiter`.
    pub const CALLS: &str = "calls";
    pub const CALL_LATENCY_MS: &str = "call.latency_ms";
    pub const RETRY_ATTEMPTS: &str = "retry.attempts";
    /// Counter, tagged `from` / `to`.
    pub const BREAKER_TRANSITIONS: &str = "breaker.transitions";
    pub const LIMITER_WAIT_MS: &str = "limiter.wait_ms";
}

/// Outcome tag attached to cache and call metrics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Outcome {
    Hit,
    Miss,
    Success,
    Failure,
    RejectedByBreaker,
    RejectedByLimiter,
}

impl Outcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Hit => "hit",
            Self::Miss => "miss",
            Self::Success => "success",
            Self::Failure => "failure",
            Self::RejectedByBreaker => "rejected_by_breaker",
            Self::RejectedByLimiter => "rejected_by_limiter",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
struct MetricKey {
    name: String,
    tags: Vec<(String, String)>,
}

impl MetricKey {
    fn new(name: &str, tags: &[(&str, &str)]) -> Self {
        let mut tags: Vec<(String, String)> = tags
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        tags.sort();
        tags.dedup_by(|a, b| a.0 == b.0);
        Self {
            name: name.to_string(),
            tags,
        }
    }

    /// Renders as `name{k=v,...}`, or just `name` when untagged.
    fn render(&self) -> String {
        if self.tags.is_empty() {
            return self.name.clone();
        }
        let tags: Vec<String> = self.tags.iter().map(|(k, v)| format!("{}={}", k, v)).collect();
        format!("{}{{{}}}", self.name, tags.join(","))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct HistogramSummary {
    pub count: u64,
    pub sum: f64,
    pub min: f64,
    pub max: f64,
}

impl HistogramSummary {
    fn first(value: f64) -> Self {
        Self {
            count: 1,
            sum: value,
            min: value,
            max: value,
        }
    }

    fn record(&mut self, value: f64) {
        self.count += 1;
        self.sum += value;
        self.min = self.min.min(value);
        self.max = self.max.max(value);
    }

    pub fn mean(&self) -> f64 {
        if self.count == 0 {
            0.0
        } else {
            self.sum / self.count as f64
        }
    }
}

/// Point-in-time copy of every metric, keyed by rendered `name{tags}`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub counters: BTreeMap<String, u64>,
    pub histograms: BTreeMap<String, HistogramSummary>,
}

impl MetricsSnapshot {
    pub fn counter(&self, rendered: &str) -> u64 {
        self.counters.get(rendered).copied().unwrap_or(0)
    }

    pub fn histogram(&self, rendered: &str) -> Option<&HistogramSummary> {
        self.histograms.get(rendered)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SampleKind {
    Counter,
    Histogram,
}

/// One named numeric series value with tags, the unit handed to export sinks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricSample {
    pub name: String,
    pub kind: SampleKind,
    pub value: f64,
    pub tags: BTreeMap<String, String>,
}

#[derive(Default)]
struct Inner {
    counters: HashMap<MetricKey, u64>,
    histograms: HashMap<MetricKey, HistogramSummary>,
}

/// Registry of counters and histograms shared by every resilience component.
#[derive(Default)]
pub struct MetricsRegistry {
    inner: RwLock<Inner>,
}

impl MetricsRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn increment(&self, name: &str, tags: &[(&str, &str)]) {
        self.add(name, 1, tags);
    }

    pub fn add(&self, name: &str, n: u64, tags: &[(&str, &str)]) {
        let key = MetricKey::new(name, tags);
        let mut inner = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        let slot = inner.counters.entry(key).or_insert(0);
        *slot = slot.saturating_add(n);
    }

    pub fn observe(&self, name: &str, value: f64, tags: &[(&str, &str)]) {
        if !value.is_finite() {
            return;
        }
        let key = MetricKey::new(name, tags);
        let mut inner = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        inner
            .histograms
            .entry(key)
            .and_modify(|h| h.record(value))
            .or_insert_with(|| HistogramSummary::first(value));
    }

    /// Current value of one counter.
    pub fn counter(&self, name: &str, tags: &[(&str, &str)]) -> u64 {
        let key = MetricKey::new(name, tags);
        let inner = self.inner.read().unwrap_or_else(PoisonError::into_inner);
        inner.counters.get(&key).copied().unwrap_or(0)
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let inner = self.inner.read().unwrap_or_else(PoisonError::into_inner);
        MetricsSnapshot {
            counters: inner.counters.iter().map(|(k, v)| (k.render(), *v)).collect(),
            histograms: inner
                .histograms
                .iter()
                .map(|(k, v)| (k.render(), *v))
                .collect(),
        }
    }

    /// Flattens the registry into series for export. Histograms become
    /// `<name>.count`, `<name>.sum` and `<name>.max`.
    pub fn samples(&self) -> Vec<MetricSample> {
        let inner = self.inner.read().unwrap_or_else(PoisonError::into_inner);
        let mut out = Vec::with_capacity(inner.counters.len() + inner.histograms.len() * 3);
        for (key, value) in &inner.counters {
            out.push(MetricSample {
                name: key.name.clone(),
                kind: SampleKind::Counter,
                value: *value as f64,
                tags: key.tags.iter().cloned().collect(),
            });
        }
        for (key, h) in &inner.histograms {
            for (suffix, value) in [("count", h.count as f64), ("sum", h.sum), ("max", h.max)] {
                out.push(MetricSample {
                    name: format!("{}.{}", key.name, suffix),
                    kind: SampleKind::Histogram,
                    value,
                    tags: key.tags.iter().cloned().collect(),
                });
            }
        }
        out.sort_by(|a, b| a.name.cmp(&b.name).then_with(|| a.tags.cmp(&b.tags)));
        out
    }

    /// Operator action: drop every accumulated value.
    pub fn reset(&self) {
        let mut inner = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        inner.counters.clear();
        inner.histograms.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn counters_are_keyed_by_sorted_tags() {
        let m = MetricsRegistry::new();
        m.increment("calls", &[("service", "llm"), ("outcome", "success")]);
        m.increment("calls", &[("outcome", "success"), ("service", "llm")]);
        m.increment("calls", &[("outcome", "failure"), ("service", "llm")]);

        assert_eq!(m.counter("calls", &[("service", "llm"), ("outcome", "success")]), 2);
        let snap = m.snapshot();
        assert_eq!(snap.counter("calls{outcome=success,service=llm}"), 2);
        assert_eq!(snap.counter("calls{outcome=failure,service=llm}"), 1);
        assert_eq!(snap.counter("calls{outcome=hit,service=llm}"), 0);
    }

    #[test]
    fn histogram_summary() {
        let m = MetricsRegistry::new();
        for v in [10.0, 30.0, 20.0] {
            m.observe("call.latency_ms", v, &[]);
        }
        m.observe("call.latency_ms", f64::NAN, &[]);
        let snap = m.snapshot();
        let h = snap.histogram("call.latency_ms").unwrap();
        assert_eq!(h.count, 3);
        assert_eq!(h.min, 10.0);
        assert_eq!(h.max, 30.0);
        assert_eq!(h.mean(), 20.0);
    }

    #[test]
    fn samples_flatten_histograms() {
        let m = MetricsRegistry::new();
        m.increment("cache.lookups", &[("outcome", "hit")]);
        m.observe("retry.attempts", 2.0, &[("service", "image")]);
        let samples = m.samples();
        let names: Vec<&str> = samples.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(
            names,
            vec![
                "cache.lookups",
                "retry.attempts.count",
                "retry.attempts.max",
                "retry.attempts.sum"
            ]
        );
        assert_eq!(samples[0].tags.get("outcome").map(String::as_str), Some("hit"));
    }

    #[test]
    fn reset_clears_everything() {
        let m = MetricsRegistry::new();
        m.increment("calls", &[]);
        m.observe("call.latency_ms", 1.0, &[]);
        m.reset();
        assert_eq!(m.snapshot(), MetricsSnapshot::default());
    }

    #[test]
    fn concurrent_increments_are_not_lost() {
        let m = Arc::new(MetricsRegistry::new());
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let m = Arc::clone(&m);
                std::thread::spawn(move || {
                    for _ in 0..100 {
                        m.increment("calls", &[("service", "llm")]);
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(m.counter("calls", &[("service", "llm")]), 800);
    }
}

//! Metric export sinks.
//!
//! A sink receives flattened [`MetricSample`]s (named numeric series with tags).
//! Whether a sink is configured only affects observability: export failures are
//! logged and never reach a caller of the resilience layer.

use super::metrics::MetricSample;
use crate::Result;
use async_trait::async_trait;
use futures::future::join_all;
use std::sync::{Arc, PoisonError, RwLock};
use tracing::{info, warn};

/// Destination for exported metric series.
#[async_trait]
pub trait MetricsSink: Send + Sync {
    async fn export(&self, samples: &[MetricSample]) -> Result<()>;

    async fn close(&self) -> Result<()> {
        Ok(())
    }

    fn name(&self) -> &'static str;
}

/// No-op sink (always available).
pub struct NoopMetricsSink;

#[async_trait]
impl MetricsSink for NoopMetricsSink {
    async fn export(&self, _: &[MetricSample]) -> Result<()> {
        Ok(())
    }

    fn name(&self) -> &'static str {
        "noop"
    }
}

/// Returns a no-op metrics sink.
pub fn noop_sink() -> Arc<dyn MetricsSink> {
    Arc::new(NoopMetricsSink)
}

/// Keeps the most recent exports in memory, for tests and local inspection.
pub struct InMemoryMetricsSink {
    batches: RwLock<Vec<Vec<MetricSample>>>,
    max_batches: usize,
}

impl InMemoryMetricsSink {
    pub fn new(max_batches: usize) -> Self {
        Self {
            batches: RwLock::new(Vec::new()),
            max_batches: max_batches.max(1),
        }
    }

    pub fn batches(&self) -> Vec<Vec<MetricSample>> {
        self.batches
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn latest(&self) -> Option<Vec<MetricSample>> {
        self.batches
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .last()
            .cloned()
    }

    pub fn len(&self) -> usize {
        self.batches.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl MetricsSink for InMemoryMetricsSink {
    async fn export(&self, samples: &[MetricSample]) -> Result<()> {
        let mut batches = self.batches.write().unwrap_or_else(PoisonError::into_inner);
        batches.push(samples.to_vec());
        if batches.len() > self.max_batches {
            batches.remove(0);
        }
        Ok(())
    }

    fn name(&self) -> &'static str {
        "in_memory"
    }
}

/// Emits each sample as a structured `tracing` event on the
/// `coursegen_resilience::metrics` target.
pub struct TracingMetricsSink;

#[async_trait]
impl MetricsSink for TracingMetricsSink {
    async fn export(&self, samples: &[MetricSample]) -> Result<()> {
        for s in samples {
            let tags = serde_json::to_string(&s.tags)?;
            info!(
                target: "coursegen_resilience::metrics",
                metric = s.name.as_str(),
                value = s.value,
                tags = tags.as_str(),
                "metric"
            );
        }
        Ok(())
    }

    fn name(&self) -> &'static str {
        "tracing"
    }
}

/// Fans one export out to several sinks; a failing sink does not stop the others.
#[derive(Default)]
pub struct CompositeMetricsSink {
    sinks: Vec<Arc<dyn MetricsSink>>,
}

impl CompositeMetricsSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_sink(mut self, sink: Arc<dyn MetricsSink>) -> Self {
        self.sinks.push(sink);
        self
    }
}

#[async_trait]
impl MetricsSink for CompositeMetricsSink {
    async fn export(&self, samples: &[MetricSample]) -> Result<()> {
        let results = join_all(self.sinks.iter().map(|s| s.export(samples))).await;
        for (s, res) in self.sinks.iter().zip(results) {
            if let Err(e) = res {
                warn!(sink = s.name(), error = %e, "metrics export failed");
            }
        }
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        for s in &self.sinks {
            let _ = s.close().await;
        }
        Ok(())
    }

    fn name(&self) -> &'static str {
        "composite"
    }
}

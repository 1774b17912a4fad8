//! Metrics and health registry.
//!
//! Every resilience component reports into a [`MetricsRegistry`] owned by the
//! process-wide client rather than logging counts independently. Operators read
//! it back through [`MetricsRegistry::snapshot`] and probe liveness through the
//! [`HealthRegistry`].
//!
//! ## Key Components
//!
//! | Component | Description |
//! |-----------|-------------|
//! | [`MetricsRegistry`] | Counters and histograms keyed by name and tags |
//! | [`HealthRegistry`] | Named synchronous probes aggregated into a snapshot |
//! | [`MetricsSink`] | Export destination for metric series |
//! | [`TracingMetricsSink`] | Emits samples as `tracing` events |
//! | [`InMemoryMetricsSink`] | Keeps exports in memory for tests |
//! | [`CompositeMetricsSink`] | Multi-destination composite sink |

pub mod health;
pub mod metrics;
pub mod sink;

pub use health::{HealthProbe, HealthProbeResult, HealthRegistry, HealthSnapshot, ProbeReport};
pub use metrics::{
    names, HistogramSummary, MetricSample, MetricsRegistry, MetricsSnapshot, Outcome, SampleKind,
};
pub use sink::{
    noop_sink, CompositeMetricsSink, InMemoryMetricsSink, MetricsSink, NoopMetricsSink,
    TracingMetricsSink,
};

use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::warn;

/// Pushes the registry's samples to `sink` every `interval` until the task is aborted.
pub fn spawn_periodic_export(
    metrics: Arc<MetricsRegistry>,
    sink: Arc<dyn MetricsSink>,
    interval: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // The first tick completes immediately.
        ticker.tick().await;
        loop {
            ticker.tick().await;
            let samples = metrics.samples();
            if let Err(e) = sink.export(&samples).await {
                warn!(sink = sink.name(), error = %e, "periodic metrics export failed");
            }
        }
    })
}

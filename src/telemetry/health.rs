//! On-demand health probes.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::warn;

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// What a probe reports when it runs to completion.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProbeReport {
    pub healthy: bool,
    pub detail: String,
}

impl ProbeReport {
    pub fn healthy(detail: impl Into<String>) -> Self {
        Self {
            healthy: true,
            detail: detail.into(),
        }
    }

    pub fn unhealthy(detail: impl Into<String>) -> Self {
        Self {
            healthy: false,
            detail: detail.into(),
        }
    }
}

/// A synchronous, side-effect free health check.
///
/// Closures `Fn() -> crate::Result<ProbeReport>` implement this trait.
pub trait HealthProbe: Send + Sync {
    fn check(&self) -> crate::Result<ProbeReport>;
}

impl<F> HealthProbe for F
where
    F: Fn() -> crate::Result<ProbeReport> + Send + Sync,
{
    fn check(&self) -> crate::Result<ProbeReport> {
        self()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthProbeResult {
    pub probe_name: String,
    pub healthy: bool,
    pub detail: String,
    /// Unix epoch milliseconds.
    pub checked_at: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthSnapshot {
    /// True iff every probe reported healthy.
    pub healthy: bool,
    pub probes: BTreeMap<String, HealthProbeResult>,
}

/// Named collection of health probes.
#[derive(Default)]
pub struct HealthRegistry {
    probes: RwLock<BTreeMap<String, Arc<dyn HealthProbe>>>,
}

impl HealthRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a closure probe, replacing any probe already registered under `name`.
    pub fn register_probe<F>(&self, name: impl Into<String>, probe: F)
    where
        F: Fn() -> crate::Result<ProbeReport> + Send + Sync + 'static,
    {
        self.register(name, Arc::new(probe));
    }

    pub fn register(&self, name: impl Into<String>, probe: Arc<dyn HealthProbe>) {
        self.probes
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(name.into(), probe);
    }

    pub fn unregister_probe(&self, name: &str) -> bool {
        self.probes
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(name)
            .is_some()
    }

    pub fn probe_names(&self) -> Vec<String> {
        self.probes
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect()
    }

    /// Runs every probe. A probe that errors or panics is reported unhealthy.
    pub fn check_health(&self) -> HealthSnapshot {
        // Probes run outside the lock so one may register another.
        let probes: Vec<(String, Arc<dyn HealthProbe>)> = self
            .probes
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(k, v)| (k.clone(), Arc::clone(v)))
            .collect();

        let mut results = BTreeMap::new();
        for (name, probe) in probes {
            let report = match catch_unwind(AssertUnwindSafe(|| probe.check())) {
                Ok(Ok(report)) => report,
                Ok(Err(e)) => ProbeReport::unhealthy(e.to_string()),
                Err(panic) => {
                    let msg = panic
                        .downcast_ref::<&str>()
                        .map(|s| s.to_string())
                        .or_else(|| panic.downcast_ref::<String>().cloned())
                        .unwrap_or_else(|| "unknown panic".to_string());
                    ProbeReport::unhealthy(format!("probe panicked: {}", msg))
                }
            };
            if !report.healthy {
                warn!(probe = name.as_str(), detail = report.detail.as_str(), "health probe failed");
            }
            results.insert(
                name.clone(),
                HealthProbeResult {
                    probe_name: name,
                    healthy: report.healthy,
                    detail: report.detail,
                    checked_at: now_ms(),
                },
            );
        }

        HealthSnapshot {
            healthy: results.values().all(|r| r.healthy),
            probes: results,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Error;

    #[test]
    fn empty_registry_is_healthy() {
        let h = HealthRegistry::new();
        let snap = h.check_health();
        assert!(snap.healthy);
        assert!(snap.probes.is_empty());
    }

    #[test]
    fn one_unhealthy_probe_fails_overall() {
        let h = HealthRegistry::new();
        h.register_probe("cache", || Ok(ProbeReport::healthy("reachable")));
        h.register_probe("breaker.llm", || Ok(ProbeReport::unhealthy("open")));
        let snap = h.check_health();
        assert!(!snap.healthy);
        assert!(snap.probes["cache"].healthy);
        assert_eq!(snap.probes["breaker.llm"].detail, "open");
    }

    #[test]
    fn erroring_probe_is_recorded_not_propagated() {
        let h = HealthRegistry::new();
        h.register_probe("config", || Err(Error::configuration("missing dir")));
        let snap = h.check_health();
        assert!(!snap.healthy);
        assert!(snap.probes["config"].detail.contains("missing dir"));
    }

    #[test]
    fn panicking_probe_is_recorded_not_propagated() {
        let h = HealthRegistry::new();
        h.register_probe("flaky", || -> crate::Result<ProbeReport> { panic!("disk gone") });
        let snap = h.check_health();
        assert!(!snap.probes["flaky"].healthy);
        assert!(snap.probes["flaky"].detail.contains("disk gone"));
    }

    #[test]
    fn register_replaces_and_unregister_removes() {
        let h = HealthRegistry::new();
        h.register_probe("p", || Ok(ProbeReport::unhealthy("old")));
        h.register_probe("p", || Ok(ProbeReport::healthy("new")));
        assert_eq!(h.check_health().probes["p"].detail, "new");
        assert!(h.unregister_probe("p"));
        assert!(h.probe_names().is_empty());
    }
}

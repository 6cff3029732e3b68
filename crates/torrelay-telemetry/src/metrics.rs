//! Prometheus-backed metrics registry and snapshot helpers.
//!
//! # Design
//! - Encapsulates collector registration to keep the public API small.
//! - Exposes the counters and gauges the orchestrator and provider clients
//!   update on their hot paths.

use std::sync::Arc;

use prometheus::{
    Encoder, IntCounter, IntCounterVec, IntGauge, IntGaugeVec, Opts, Registry, TextEncoder,
};
use serde::Serialize;

use crate::error::{Result, TelemetryError};

/// Prometheus-backed metrics registry shared across the engine.
#[derive(Clone)]
pub struct Metrics {
    inner: Arc<MetricsInner>,
}

struct MetricsInner {
    registry: Registry,
    jobs_by_state: IntGaugeVec,
    provider_requests_total: IntCounterVec,
    provider_rate_limited_total: IntCounter,
    transfers_total: IntCounterVec,
    disk_space_paused: IntGauge,
    ticks_total: IntCounter,
}

/// Snapshot of selected gauges and counters for health reporting.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct MetricsSnapshot {
    /// Whether queued jobs are currently held back for disk space.
    pub disk_space_paused: bool,
    /// Driver ticks completed.
    pub ticks_total: u64,
    /// Provider calls rejected or deferred for rate limiting.
    pub provider_rate_limited_total: u64,
}

fn collector_err(name: &'static str) -> impl FnOnce(prometheus::Error) -> TelemetryError {
    move |source| TelemetryError::MetricsRegister { name, source }
}

fn register<C>(registry: &Registry, name: &'static str, collector: &C) -> Result<()>
where
    C: prometheus::core::Collector + Clone + 'static,
{
    registry
        .register(Box::new(collector.clone()))
        .map_err(|source| TelemetryError::MetricsRegister { name, source })
}

impl Metrics {
    /// Construct a registry with the standard collectors registered.
    ///
    /// # Errors
    ///
    /// Returns [`TelemetryError::MetricsRegister`] if any collector cannot be
    /// built or registered.
    pub fn new() -> Result<Self> {
        let registry = Registry::new();

        let jobs_by_state = IntGaugeVec::new(
            Opts::new("jobs_by_state", "Jobs per orchestrator state"),
            &["state"],
        )
        .map_err(collector_err("jobs_by_state"))?;
        let provider_requests_total = IntCounterVec::new(
            Opts::new("provider_requests_total", "Provider calls by operation and outcome"),
            &["operation", "outcome"],
        )
        .map_err(collector_err("provider_requests_total"))?;
        let provider_rate_limited_total = IntCounter::with_opts(Opts::new(
            "provider_rate_limited_total",
            "Provider calls deferred by rate limiting",
        ))
        .map_err(collector_err("provider_rate_limited_total"))?;
        let transfers_total = IntCounterVec::new(
            Opts::new("transfers_total", "Completed transfers by outcome"),
            &["outcome"],
        )
        .map_err(collector_err("transfers_total"))?;
        let disk_space_paused = IntGauge::with_opts(Opts::new(
            "disk_space_paused",
            "1 while queued jobs are held back for disk space",
        ))
        .map_err(collector_err("disk_space_paused"))?;
        let ticks_total = IntCounter::with_opts(Opts::new("ticks_total", "Driver ticks completed"))
            .map_err(collector_err("ticks_total"))?;

        register(&registry, "jobs_by_state", &jobs_by_state)?;
        register(&registry, "provider_requests_total", &provider_requests_total)?;
        register(
            &registry,
            "provider_rate_limited_total",
            &provider_rate_limited_total,
        )?;
        register(&registry, "transfers_total", &transfers_total)?;
        register(&registry, "disk_space_paused", &disk_space_paused)?;
        register(&registry, "ticks_total", &ticks_total)?;

        Ok(Self {
            inner: Arc::new(MetricsInner {
                registry,
                jobs_by_state,
                provider_requests_total,
                provider_rate_limited_total,
                transfers_total,
                disk_space_paused,
                ticks_total,
            }),
        })
    }

    /// Set the job count for one state.
    pub fn set_jobs_in_state(&self, state: &str, count: i64) {
        self.inner.jobs_by_state.with_label_values(&[state]).set(count);
    }

    /// Count a provider call.
    pub fn inc_provider_request(&self, operation: &str, outcome: &str) {
        self.inner
            .provider_requests_total
            .with_label_values(&[operation, outcome])
            .inc();
    }

    /// Count a rate-limit deferral.
    pub fn inc_provider_rate_limited(&self) {
        self.inner.provider_rate_limited_total.inc();
    }

    /// Count a finished transfer.
    pub fn inc_transfer(&self, outcome: &str) {
        self.inner.transfers_total.with_label_values(&[outcome]).inc();
    }

    /// Flag or clear the disk-space pause.
    pub fn set_disk_space_paused(&self, paused: bool) {
        self.inner.disk_space_paused.set(i64::from(paused));
    }

    /// Count a completed driver tick.
    pub fn inc_tick(&self) {
        self.inner.ticks_total.inc();
    }

    /// Render the registry using the Prometheus text exposition format.
    ///
    /// # Errors
    ///
    /// Returns an error if the metrics cannot be encoded or if the encoded
    /// buffer is not valid UTF-8.
    pub fn render(&self) -> Result<String> {
        let encoder = TextEncoder::new();
        let metric_families = self.inner.registry.gather();
        let mut buffer = Vec::new();
        encoder
            .encode(&metric_families, &mut buffer)
            .map_err(|source| TelemetryError::MetricsEncode { source })?;
        String::from_utf8(buffer).map_err(|source| TelemetryError::MetricsUtf8 { source })
    }

    /// Take a point-in-time snapshot of the most relevant gauges and counters.
    #[must_use]
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            disk_space_paused: self.inner.disk_space_paused.get() > 0,
            ticks_total: self.inner.ticks_total.get(),
            provider_rate_limited_total: self.inner.provider_rate_limited_total.get(),
        }
    }

    /// Current gauge value for one job state.
    #[must_use]
    pub fn jobs_in_state(&self, state: &str) -> i64 {
        self.inner.jobs_by_state.with_label_values(&[state]).get()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn metrics_snapshot_reflects_updates() -> anyhow::Result<()> {
        let metrics = Metrics::new()?;
        metrics.set_jobs_in_state("queued", 3);
        metrics.inc_provider_request("add_magnet", "ok");
        metrics.inc_provider_rate_limited();
        metrics.inc_transfer("finished");
        metrics.set_disk_space_paused(true);
        metrics.inc_tick();
        metrics.inc_tick();

        let snapshot = metrics.snapshot();
        assert!(snapshot.disk_space_paused);
        assert_eq!(snapshot.ticks_total, 2);
        assert_eq!(snapshot.provider_rate_limited_total, 1);
        assert_eq!(metrics.jobs_in_state("queued"), 3);

        let rendered = metrics.render()?;
        assert!(rendered.contains("provider_requests_total"));
        assert!(rendered.contains("jobs_by_state"));
        assert!(rendered.contains("transfers_total"));
        Ok(())
    }

    #[test]
    fn registries_are_independent() -> anyhow::Result<()> {
        let first = Metrics::new()?;
        let second = Metrics::new()?;
        first.inc_tick();
        assert_eq!(second.snapshot().ticks_total, 0);
        Ok(())
    }
}

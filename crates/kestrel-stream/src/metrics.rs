//! Prometheus metrics for the stream subsystem.
//!
//! Metrics are registered against a caller-supplied registry at component
//! construction; there is no global state here.

use prometheus::{IntCounter, IntGauge, Registry};

fn counter(registry: &Registry, name: &str, help: &str) -> prometheus::Result<IntCounter> {
    let c = IntCounter::new(name, help)?;
    registry.register(Box::new(c.clone()))?;
    Ok(c)
}

fn gauge(registry: &Registry, name: &str, help: &str) -> prometheus::Result<IntGauge> {
    let g = IntGauge::new(name, help)?;
    registry.register(Box::new(g.clone()))?;
    Ok(g)
}

/// Stream manager metrics.
#[derive(Debug, Clone)]
pub struct StreamManagerMetrics {
    /// Currently registered streams.
    pub streams: IntGauge,
    /// Streams registered since start.
    pub added_total: IntCounter,
    /// Streams removed since start.
    pub removed_total: IntCounter,
}

impl StreamManagerMetrics {
    pub fn new(registry: &Registry) -> prometheus::Result<Self> {
        Ok(Self {
            streams: gauge(registry, "kestrel_streams", "Currently registered peer streams")?,
            added_total: counter(registry, "kestrel_streams_added_total", "Registered streams")?,
            removed_total: counter(registry, "kestrel_streams_removed_total", "Removed streams")?,
        })
    }
}

/// Request manager metrics.
#[derive(Debug, Clone)]
pub struct RequestManagerMetrics {
    /// Requests accepted from callers.
    pub requests_total: IntCounter,
    /// Requests currently pending on a stream.
    pub inflight: IntGauge,
    /// Requests parked on the waiting queue.
    pub waiting: IntGauge,
    /// Retry events (timeouts, write failures, stream removals).
    pub retries_total: IntCounter,
    /// Per-attempt timeouts.
    pub timeouts_total: IntCounter,
    /// Responses delivered to callers.
    pub delivered_total: IntCounter,
    /// Deliveries dropped as stale.
    pub stale_deliveries_total: IntCounter,
    /// Requests cancelled by their caller.
    pub cancelled_total: IntCounter,
}

impl RequestManagerMetrics {
    pub fn new(registry: &Registry) -> prometheus::Result<Self> {
        Ok(Self {
            requests_total: counter(
                registry,
                "kestrel_requests_total",
                "Requests accepted from callers",
            )?,
            inflight: gauge(
                registry,
                "kestrel_requests_inflight",
                "Requests pending on a stream",
            )?,
            waiting: gauge(
                registry,
                "kestrel_requests_waiting",
                "Requests parked on the waiting queue",
            )?,
            retries_total: counter(registry, "kestrel_request_retries_total", "Retry events")?,
            timeouts_total: counter(
                registry,
                "kestrel_request_timeouts_total",
                "Per-attempt request timeouts",
            )?,
            delivered_total: counter(
                registry,
                "kestrel_responses_delivered_total",
                "Responses delivered to callers",
            )?,
            stale_deliveries_total: counter(
                registry,
                "kestrel_responses_stale_total",
                "Deliveries dropped as stale",
            )?,
            cancelled_total: counter(
                registry,
                "kestrel_requests_cancelled_total",
                "Requests cancelled by callers",
            )?,
        })
    }
}

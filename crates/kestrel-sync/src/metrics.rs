//! Prometheus metrics for the sync protocol and download pipeline.

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

/// Peer handler metrics.
#[derive(Debug, Clone)]
pub struct ProtocolMetrics {
    /// Frame payload bytes read from peers.
    pub bytes_in_total: IntCounter,
    /// Frame payload bytes written to peers.
    pub bytes_out_total: IntCounter,
    /// Inbound requests served.
    pub served_requests_total: IntCounter,
    /// Inbound requests answered with a typed error.
    pub served_errors_total: IntCounter,
}

impl ProtocolMetrics {
    pub fn new(registry: &Registry) -> prometheus::Result<Self> {
        Ok(Self {
            bytes_in_total: counter(registry, "kestrel_sync_bytes_in_total", "Payload bytes read")?,
            bytes_out_total: counter(
                registry,
                "kestrel_sync_bytes_out_total",
                "Payload bytes written",
            )?,
            served_requests_total: counter(
                registry,
                "kestrel_sync_served_requests_total",
                "Inbound requests served",
            )?,
            served_errors_total: counter(
                registry,
                "kestrel_sync_served_errors_total",
                "Inbound requests answered with an error",
            )?,
        })
    }
}

/// Download pipeline metrics.
#[derive(Debug, Clone)]
pub struct DownloaderMetrics {
    /// Blocks inserted into the chain.
    pub inserted_blocks_total: IntCounter,
    /// Chain insert failures.
    pub insert_failures_total: IntCounter,
    /// Demerits charged to peers.
    pub demerits_total: IntCounter,
    /// Peers disqualified after crossing the demerit threshold.
    pub disqualified_total: IntCounter,
    /// Long-range sessions started.
    pub long_range_sessions_total: IntCounter,
    /// Short-range sessions started.
    pub short_range_sessions_total: IntCounter,
    /// Current result queue depth.
    pub queue_depth: IntGauge,
}

impl DownloaderMetrics {
    pub fn new(registry: &Registry) -> prometheus::Result<Self> {
        Ok(Self {
            inserted_blocks_total: counter(
                registry,
                "kestrel_sync_inserted_blocks_total",
                "Blocks inserted into the chain",
            )?,
            insert_failures_total: counter(
                registry,
                "kestrel_sync_insert_failures_total",
                "Chain insert failures",
            )?,
            demerits_total: counter(
                registry,
                "kestrel_sync_peer_demerits_total",
                "Demerits charged to peers",
            )?,
            disqualified_total: counter(
                registry,
                "kestrel_sync_peers_disqualified_total",
                "Peers disqualified for repeated failures",
            )?,
            long_range_sessions_total: counter(
                registry,
                "kestrel_sync_long_range_sessions_total",
                "Long-range sessions started",
            )?,
            short_range_sessions_total: counter(
                registry,
                "kestrel_sync_short_range_sessions_total",
                "Short-range sessions started",
            )?,
            queue_depth: gauge(
                registry,
                "kestrel_sync_result_queue_depth",
                "Result queue depth",
            )?,
        })
    }
}

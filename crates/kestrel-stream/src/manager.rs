//! Live peer stream registry.
//!
//! The stream manager owns stream lifecycle: registration of freshly
//! handshaked peers, removal, and add/remove event subscriptions for
//! downstream components. Events ride bounded broadcast channels; a slow
//! observer is lagged past and must reconcile against the registry, which
//! stays authoritative.

use crate::error::{StreamError, StreamResult};
use crate::metrics::StreamManagerMetrics;
use crate::types::{StreamHandle, StreamId};
use parking_lot::RwLock;
use prometheus::Registry;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{broadcast, watch};
use tracing::{debug, info, warn};

/// Capacity of the add/remove event channels. Observers that fall further
/// behind than this lose the oldest events.
const EVENT_BUFFER: usize = 64;

/// Stream manager configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamManagerConfig {
    /// Network name carried in the protocol descriptor.
    pub network: String,
    /// Number of concurrent sync workers the node will run.
    pub concurrency: usize,
    /// Minimum streams to keep sync running.
    pub min_streams: usize,
    /// Streams required before the subsystem reports bootstrapped.
    pub init_streams: usize,
    /// Hard cap on registered streams.
    pub max_streams: usize,
}

impl Default for StreamManagerConfig {
    fn default() -> Self {
        Self {
            network: "mainnet".to_string(),
            concurrency: 16,
            min_streams: 16,
            init_streams: 16,
            max_streams: 32,
        }
    }
}

impl StreamManagerConfig {
    /// Normalise thresholds so that
    /// `concurrency <= min_streams <= init_streams <= max_streams`.
    pub fn fix_values(&mut self) {
        if self.concurrency == 0 {
            self.concurrency = 16;
        }
        if self.min_streams < self.concurrency {
            self.min_streams = self.concurrency;
        }
        if self.init_streams < self.min_streams {
            self.init_streams = self.min_streams;
        }
        if self.max_streams < self.init_streams {
            self.max_streams = self.init_streams;
        }
    }
}

/// Registry of live peer streams.
pub struct StreamManager {
    config: StreamManagerConfig,
    streams: RwLock<HashMap<StreamId, Arc<StreamHandle>>>,
    add_tx: broadcast::Sender<Arc<StreamHandle>>,
    remove_tx: broadcast::Sender<StreamId>,
    bootstrapped_tx: watch::Sender<bool>,
    metrics: StreamManagerMetrics,
}

impl StreamManager {
    pub fn new(mut config: StreamManagerConfig, registry: &Registry) -> StreamResult<Arc<Self>> {
        config.fix_values();
        let (add_tx, _) = broadcast::channel(EVENT_BUFFER);
        let (remove_tx, _) = broadcast::channel(EVENT_BUFFER);
        let (bootstrapped_tx, _) = watch::channel(false);
        Ok(Arc::new(Self {
            config,
            streams: RwLock::new(HashMap::new()),
            add_tx,
            remove_tx,
            bootstrapped_tx,
            metrics: StreamManagerMetrics::new(registry)?,
        }))
    }

    /// The normalised configuration.
    pub fn config(&self) -> &StreamManagerConfig {
        &self.config
    }

    /// Register a freshly handshaked peer stream and emit an add event.
    pub fn new_stream(&self, handle: Arc<StreamHandle>) -> StreamResult<()> {
        let id = handle.id().clone();
        {
            let mut streams = self.streams.write();
            if streams.contains_key(&id) {
                return Err(StreamError::StreamAlreadyExists(id));
            }
            if streams.len() >= self.config.max_streams {
                return Err(StreamError::TooManyStreams {
                    count: streams.len(),
                    max: self.config.max_streams,
                });
            }
            streams.insert(id.clone(), handle.clone());
            self.metrics.streams.set(streams.len() as i64);

            if streams.len() >= self.config.init_streams && !*self.bootstrapped_tx.borrow() {
                info!(streams = streams.len(), "stream manager bootstrapped");
                let _ = self.bootstrapped_tx.send(true);
            }
        }
        self.metrics.added_total.inc();
        info!(stream = %id, proto = %handle.proto_id(), "stream registered");
        // No receivers is fine; subscribers may come later and reconcile.
        let _ = self.add_tx.send(handle);
        Ok(())
    }

    /// Unregister a stream and emit a remove event.
    ///
    /// Unknown IDs are an error so the caller can log the inconsistency.
    pub fn remove_stream(&self, id: &StreamId) -> StreamResult<Arc<StreamHandle>> {
        let removed = {
            let mut streams = self.streams.write();
            let removed = streams
                .remove(id)
                .ok_or_else(|| StreamError::StreamNotFound(id.clone()))?;
            self.metrics.streams.set(streams.len() as i64);
            removed
        };
        self.metrics.removed_total.inc();
        info!(stream = %id, "stream removed");
        let _ = self.remove_tx.send(id.clone());
        Ok(removed)
    }

    /// Subscribe to stream-added events.
    pub fn subscribe_add(&self) -> broadcast::Receiver<Arc<StreamHandle>> {
        self.add_tx.subscribe()
    }

    /// Subscribe to stream-removed events.
    pub fn subscribe_remove(&self) -> broadcast::Receiver<StreamId> {
        self.remove_tx.subscribe()
    }

    /// Resolve a stream by ID.
    pub fn get_stream(&self, id: &StreamId) -> Option<Arc<StreamHandle>> {
        self.streams.read().get(id).cloned()
    }

    /// Number of registered streams.
    pub fn num_streams(&self) -> usize {
        self.streams.read().len()
    }

    /// Whether the subsystem can keep syncing.
    pub fn has_min_streams(&self) -> bool {
        self.num_streams() >= self.config.min_streams
    }

    /// Snapshot of the registry, for observers reconciling after a lag.
    pub fn snapshot(&self) -> Vec<Arc<StreamHandle>> {
        self.streams.read().values().cloned().collect()
    }

    /// Wait until `init_streams` streams have been registered at least once.
    pub async fn wait_bootstrapped(&self) {
        let mut rx = self.bootstrapped_tx.subscribe();
        while !*rx.borrow_and_update() {
            if rx.changed().await.is_err() {
                warn!("stream manager dropped before bootstrap");
                return;
            }
        }
        debug!("bootstrap signal observed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ProtoId;
    use tokio::sync::mpsc;

    fn test_manager(init_streams: usize) -> Arc<StreamManager> {
        let config = StreamManagerConfig {
            network: "testnet".to_string(),
            concurrency: 2,
            min_streams: 2,
            init_streams,
            max_streams: 4,
        };
        StreamManager::new(config, &Registry::new()).unwrap()
    }

    fn test_handle(id: &str) -> Arc<StreamHandle> {
        let (tx, _rx) = mpsc::channel(1);
        Arc::new(StreamHandle::new(
            StreamId::from(id),
            ProtoId::new("sync/1.0.0/testnet/0"),
            tx,
        ))
    }

    #[test]
    fn test_config_normalisation() {
        let mut config = StreamManagerConfig {
            network: "testnet".to_string(),
            concurrency: 0,
            min_streams: 4,
            init_streams: 2,
            max_streams: 1,
        };
        config.fix_values();
        assert_eq!(config.concurrency, 16);
        assert_eq!(config.min_streams, 16);
        assert_eq!(config.init_streams, 16);
        assert_eq!(config.max_streams, 16);
    }

    #[tokio::test]
    async fn test_duplicate_stream_rejected() {
        let sm = test_manager(2);
        sm.new_stream(test_handle("st-1")).unwrap();
        let err = sm.new_stream(test_handle("st-1")).unwrap_err();
        assert!(matches!(err, StreamError::StreamAlreadyExists(_)));
        assert_eq!(sm.num_streams(), 1);
    }

    #[tokio::test]
    async fn test_remove_unknown_stream_errors() {
        let sm = test_manager(2);
        let err = sm.remove_stream(&StreamId::from("ghost")).unwrap_err();
        assert!(matches!(err, StreamError::StreamNotFound(_)));
    }

    #[tokio::test]
    async fn test_capacity_enforced() {
        let sm = test_manager(2);
        for i in 0..4 {
            sm.new_stream(test_handle(&format!("st-{i}"))).unwrap();
        }
        let err = sm.new_stream(test_handle("st-overflow")).unwrap_err();
        assert!(matches!(err, StreamError::TooManyStreams { count: 4, max: 4 }));
    }

    #[tokio::test]
    async fn test_events_are_delivered() {
        let sm = test_manager(2);
        let mut add_rx = sm.subscribe_add();
        let mut rm_rx = sm.subscribe_remove();

        sm.new_stream(test_handle("st-1")).unwrap();
        let added = add_rx.recv().await.unwrap();
        assert_eq!(added.id(), &StreamId::from("st-1"));

        sm.remove_stream(&StreamId::from("st-1")).unwrap();
        let removed = rm_rx.recv().await.unwrap();
        assert_eq!(removed, StreamId::from("st-1"));
    }

    #[tokio::test]
    async fn test_bootstrap_signal_fires_once_threshold_reached() {
        let sm = test_manager(2);
        sm.new_stream(test_handle("st-1")).unwrap();

        let waiter = {
            let sm = sm.clone();
            tokio::spawn(async move { sm.wait_bootstrapped().await })
        };
        assert!(!waiter.is_finished());

        sm.new_stream(test_handle("st-2")).unwrap();
        waiter.await.unwrap();

        // The signal latches even if streams later drop below the threshold.
        sm.remove_stream(&StreamId::from("st-1")).unwrap();
        sm.wait_bootstrapped().await;
    }
}

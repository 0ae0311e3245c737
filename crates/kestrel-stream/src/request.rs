//! Request manager: matches responses with in-flight requests.
//!
//! A single control loop owns all request/stream bookkeeping, so none of the
//! maps need locking. Callers enqueue requests through [`RequestManager::do_request`]
//! and await their reply channel; peer handlers push replies back through
//! [`RequestManager::deliver_response`]. The loop pairs waiting requests with
//! available streams on a throttle cadence, retries timed-out or failed
//! attempts at high priority, and re-queues the pending request of any stream
//! that goes away.

use crate::error::{StreamError, StreamResult};
use crate::manager::StreamManager;
use crate::message::{Message, Request, RequestPayload, Response};
use crate::metrics::RequestManagerMetrics;
use crate::types::{StreamHandle, StreamId};
use prometheus::Registry;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Request manager configuration.
#[derive(Debug, Clone)]
pub struct RequestManagerConfig {
    /// Per-attempt timeout before the request is retried on another stream.
    pub req_timeout: Duration,
    /// Cadence of the waiting-queue drain.
    pub throttle_interval: Duration,
    /// Maximum requests paired with streams per drain.
    pub throttle_batch: usize,
    /// How long `deliver_response` may wait on a stuck loop before dropping.
    pub deliver_timeout: Duration,
}

impl Default for RequestManagerConfig {
    fn default() -> Self {
        Self {
            req_timeout: Duration::from_secs(10),
            throttle_interval: Duration::from_millis(100),
            throttle_batch: 16,
            deliver_timeout: Duration::from_secs(5),
        }
    }
}

/// Per-request options.
#[derive(Debug, Clone, Copy, Default)]
pub struct RequestOptions {
    /// Enqueue at the front of the waiting queue.
    pub high_priority: bool,
    /// Fail immediately with `NoAvailableStream` when no stream is live,
    /// instead of parking on the waiting queue.
    pub fail_fast: bool,
}

/// Snapshot of the loop's bookkeeping, for tests and introspection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RequestManagerStats {
    pub streams: usize,
    pub available: usize,
    pub pending: usize,
    pub waiting: usize,
}

type ResponseTx = oneshot::Sender<StreamResult<(Response, StreamId)>>;

struct NewRequest {
    ticket: u64,
    payload: RequestPayload,
    options: RequestOptions,
    resp_tx: ResponseTx,
}

struct Delivery {
    stream_id: StreamId,
    response: Response,
}

struct WaitEntry {
    ticket: u64,
    payload: RequestPayload,
    resp_tx: ResponseTx,
}

struct PendingEntry {
    ticket: u64,
    payload: RequestPayload,
    resp_tx: ResponseTx,
    owner: StreamId,
    /// Cancelled when the attempt completes; stops the attempt's timer.
    done: CancellationToken,
}

struct StreamEntry {
    handle: Arc<StreamHandle>,
    /// Wire ID of the request currently pending on this stream.
    pending: Option<u64>,
}

/// Handle to the request manager control loop.
pub struct RequestManager {
    new_req_tx: mpsc::Sender<NewRequest>,
    delivery_tx: mpsc::Sender<Delivery>,
    cancel_tx: mpsc::Sender<u64>,
    stats_tx: mpsc::Sender<oneshot::Sender<RequestManagerStats>>,
    shutdown: CancellationToken,
    next_ticket: AtomicU64,
    deliver_timeout: Duration,
}

impl RequestManager {
    /// Spawn the control loop, subscribed to the stream manager's events.
    pub fn start(
        stream_manager: Arc<StreamManager>,
        config: RequestManagerConfig,
        registry: &Registry,
    ) -> StreamResult<Arc<Self>> {
        let metrics = RequestManagerMetrics::new(registry)?;

        // Subscribe before spawning so bootstrap streams are not missed;
        // anything registered before this point is picked up by the seed
        // snapshot inside the loop.
        let add_rx = stream_manager.subscribe_add();
        let remove_rx = stream_manager.subscribe_remove();

        let (new_req_tx, new_req_rx) = mpsc::channel(128);
        let (delivery_tx, delivery_rx) = mpsc::channel(128);
        let (cancel_tx, cancel_rx) = mpsc::channel(64);
        let (retry_tx, retry_rx) = mpsc::channel(64);
        let (stats_tx, stats_rx) = mpsc::channel(8);
        let shutdown = CancellationToken::new();

        let deliver_timeout = config.deliver_timeout;
        let request_loop = RequestLoop {
            config,
            stream_manager,
            streams: HashMap::new(),
            available: HashSet::new(),
            pendings: HashMap::new(),
            waitings: VecDeque::new(),
            new_req_rx,
            delivery_rx,
            cancel_rx,
            retry_tx,
            retry_rx,
            stats_rx,
            add_rx,
            remove_rx,
            shutdown: shutdown.clone(),
            metrics,
        };
        tokio::spawn(request_loop.run());

        Ok(Arc::new(Self {
            new_req_tx,
            delivery_tx,
            cancel_tx,
            stats_tx,
            shutdown,
            next_ticket: AtomicU64::new(1),
            deliver_timeout,
        }))
    }

    /// Issue a request and wait for its reply.
    ///
    /// Returns the response together with the ID of the stream that served
    /// the satisfied attempt. Cancellation-safe: dropping the future signals
    /// the loop to forget the request.
    pub async fn do_request(
        &self,
        payload: RequestPayload,
    ) -> StreamResult<(Response, StreamId)> {
        self.do_request_with_options(payload, RequestOptions::default())
            .await
    }

    /// [`Self::do_request`] with explicit priority / fail-fast options.
    pub async fn do_request_with_options(
        &self,
        payload: RequestPayload,
        options: RequestOptions,
    ) -> StreamResult<(Response, StreamId)> {
        let ticket = self.next_ticket.fetch_add(1, Ordering::Relaxed);
        let (resp_tx, resp_rx) = oneshot::channel();

        self.new_req_tx
            .send(NewRequest {
                ticket,
                payload,
                options,
                resp_tx,
            })
            .await
            .map_err(|_| StreamError::ManagerClosed)?;

        let mut guard = CancelGuard {
            ticket,
            cancel_tx: self.cancel_tx.clone(),
            armed: true,
        };
        let result = resp_rx.await.map_err(|_| StreamError::ManagerClosed)?;
        guard.armed = false;
        result
    }

    /// Deliver a response read from a peer stream.
    ///
    /// Bounded: if the loop cannot accept the delivery within
    /// `deliver_timeout`, the response is dropped with a warning.
    pub async fn deliver_response(&self, stream_id: StreamId, response: Response) {
        let delivery = Delivery {
            stream_id,
            response,
        };
        match tokio::time::timeout(self.deliver_timeout, self.delivery_tx.send(delivery)).await {
            Ok(Ok(())) => {}
            Ok(Err(_)) => debug!("response delivered after request manager closed"),
            Err(_) => warn!("delivery timeout; request manager loop may be stuck"),
        }
    }

    /// Query the loop's bookkeeping.
    pub async fn stats(&self) -> StreamResult<RequestManagerStats> {
        let (tx, rx) = oneshot::channel();
        self.stats_tx
            .send(tx)
            .await
            .map_err(|_| StreamError::ManagerClosed)?;
        rx.await.map_err(|_| StreamError::ManagerClosed)
    }

    /// Stop the loop. Every in-flight and waiting request fails with
    /// `ManagerClosed`.
    pub fn close(&self) {
        self.shutdown.cancel();
    }
}

/// Signals the loop to forget a request when its caller goes away before the
/// reply arrives.
struct CancelGuard {
    ticket: u64,
    cancel_tx: mpsc::Sender<u64>,
    armed: bool,
}

impl Drop for CancelGuard {
    fn drop(&mut self) {
        if self.armed {
            let _ = self.cancel_tx.try_send(self.ticket);
        }
    }
}

struct RequestLoop {
    config: RequestManagerConfig,
    stream_manager: Arc<StreamManager>,

    streams: HashMap<StreamId, StreamEntry>,
    available: HashSet<StreamId>,
    pendings: HashMap<u64, PendingEntry>,
    /// Front is dequeued first; retries and failovers enter at the front.
    waitings: VecDeque<WaitEntry>,

    new_req_rx: mpsc::Receiver<NewRequest>,
    delivery_rx: mpsc::Receiver<Delivery>,
    cancel_rx: mpsc::Receiver<u64>,
    retry_tx: mpsc::Sender<u64>,
    retry_rx: mpsc::Receiver<u64>,
    stats_rx: mpsc::Receiver<oneshot::Sender<RequestManagerStats>>,
    add_rx: broadcast::Receiver<Arc<StreamHandle>>,
    remove_rx: broadcast::Receiver<StreamId>,
    shutdown: CancellationToken,

    metrics: RequestManagerMetrics,
}

impl RequestLoop {
    async fn run(mut self) {
        for handle in self.stream_manager.snapshot() {
            self.add_stream(handle);
        }

        let mut ticker = tokio::time::interval(self.config.throttle_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => {
                    self.close();
                    return;
                }
                _ = ticker.tick() => self.throttle(),
                maybe_req = self.new_req_rx.recv() => match maybe_req {
                    Some(req) => {
                        if self.handle_new_request(req) {
                            self.throttle();
                        }
                    }
                    // All caller handles dropped; nothing can reach us again.
                    None => {
                        self.close();
                        return;
                    }
                },
                Some(delivery) = self.delivery_rx.recv() => self.handle_delivery(delivery),
                Some(req_id) = self.retry_rx.recv() => {
                    if self.handle_retry(req_id) {
                        self.throttle();
                    }
                }
                Some(ticket) = self.cancel_rx.recv() => self.handle_cancel(ticket),
                Some(reply) = self.stats_rx.recv() => {
                    let _ = reply.send(self.stats());
                }
                event = self.add_rx.recv() => self.handle_add_event(event),
                event = self.remove_rx.recv() => self.handle_remove_event(event),
            }
        }
    }

    fn stats(&self) -> RequestManagerStats {
        RequestManagerStats {
            streams: self.streams.len(),
            available: self.available.len(),
            pending: self.pendings.len(),
            waiting: self.waitings.len(),
        }
    }

    fn handle_new_request(&mut self, req: NewRequest) -> bool {
        self.metrics.requests_total.inc();
        if req.options.fail_fast && self.streams.is_empty() {
            let _ = req.resp_tx.send(Err(StreamError::NoAvailableStream));
            return false;
        }
        let entry = WaitEntry {
            ticket: req.ticket,
            payload: req.payload,
            resp_tx: req.resp_tx,
        };
        if req.options.high_priority {
            self.waitings.push_front(entry);
        } else {
            self.waitings.push_back(entry);
        }
        true
    }

    /// Drain up to `throttle_batch` waiting requests onto available streams.
    fn throttle(&mut self) {
        for _ in 0..self.config.throttle_batch {
            if self.waitings.is_empty() {
                break;
            }
            let Some((stream_id, handle)) = self.pick_available_stream() else {
                break;
            };
            let Some(wait) = self.waitings.pop_front() else {
                break;
            };
            self.dispatch(wait, stream_id, handle);
        }
        self.metrics.waiting.set(self.waitings.len() as i64);
        self.metrics.inflight.set(self.pendings.len() as i64);
    }

    /// First available stream, purging any entry that fails the sanity
    /// checks (registered, and no pending request).
    fn pick_available_stream(&mut self) -> Option<(StreamId, Arc<StreamHandle>)> {
        while let Some(id) = self.available.iter().next().cloned() {
            let Some(entry) = self.streams.get(&id) else {
                debug_assert!(false, "available stream not registered");
                error!(stream = %id, "available stream not registered; purging");
                self.available.remove(&id);
                continue;
            };
            if entry.pending.is_some() {
                debug_assert!(false, "available stream has a pending request");
                error!(stream = %id, "available stream has a pending request; purging");
                self.available.remove(&id);
                continue;
            }
            return Some((id, entry.handle.clone()));
        }
        None
    }

    fn dispatch(&mut self, wait: WaitEntry, stream_id: StreamId, handle: Arc<StreamHandle>) {
        let req_id = self.gen_req_id();
        let Some(entry) = self.streams.get_mut(&stream_id) else {
            self.waitings.push_front(wait);
            return;
        };
        entry.pending = Some(req_id);
        self.available.remove(&stream_id);

        let done = CancellationToken::new();
        let message = Message::Request(Request::new(req_id, wait.payload.clone()));
        self.pendings.insert(
            req_id,
            PendingEntry {
                ticket: wait.ticket,
                payload: wait.payload,
                resp_tx: wait.resp_tx,
                owner: stream_id,
                done: done.clone(),
            },
        );

        let retry_tx = self.retry_tx.clone();
        let req_timeout = self.config.req_timeout;
        let timeouts = self.metrics.timeouts_total.clone();
        tokio::spawn(async move {
            if let Err(err) = handle.send_message(message).await {
                warn!(stream = %handle.id(), error = %err, "failed to send request");
                let _ = retry_tx.send(req_id).await;
                return;
            }
            tokio::select! {
                _ = done.cancelled() => {}
                _ = tokio::time::sleep(req_timeout) => {
                    timeouts.inc();
                    let _ = retry_tx.send(req_id).await;
                }
            }
        });
    }

    fn gen_req_id(&self) -> u64 {
        loop {
            let req_id: u64 = rand::random();
            if !self.pendings.contains_key(&req_id) {
                return req_id;
            }
        }
    }

    fn handle_delivery(&mut self, delivery: Delivery) {
        let req_id = delivery.response.req_id;
        if let Err(reason) = self.validate_delivery(&delivery) {
            // Most likely a stale delivery for an attempt that was retried
            // or cancelled in the meantime.
            warn!(stream = %delivery.stream_id, req_id, reason, "dropping delivery");
            self.metrics.stale_deliveries_total.inc();
            return;
        }
        if let Some(pending) = self.pendings.remove(&req_id) {
            self.release_stream(&pending.owner);
            pending.done.cancel();
            self.metrics.delivered_total.inc();
            self.metrics.inflight.set(self.pendings.len() as i64);
            let _ = pending
                .resp_tx
                .send(Ok((delivery.response, delivery.stream_id)));
        }
    }

    fn validate_delivery(&self, delivery: &Delivery) -> Result<(), &'static str> {
        if !self.streams.contains_key(&delivery.stream_id) {
            return Err("response delivered from dead stream");
        }
        let Some(pending) = self.pendings.get(&delivery.response.req_id) else {
            return Err("no pending request for response");
        };
        if pending.owner != delivery.stream_id {
            return Err("unexpected delivery stream");
        }
        match self.streams.get(&pending.owner).and_then(|e| e.pending) {
            Some(current) if current == delivery.response.req_id => Ok(()),
            // Possible when the request was cancelled under the stream.
            _ => Err("stream is not waiting on this request"),
        }
    }

    /// Move a timed-out or failed attempt back to the waiting queue at high
    /// priority. Stale wire IDs (already completed or re-assigned) are
    /// ignored.
    fn handle_retry(&mut self, req_id: u64) -> bool {
        let Some(pending) = self.pendings.remove(&req_id) else {
            return false;
        };
        self.release_stream(&pending.owner);
        pending.done.cancel();
        self.metrics.retries_total.inc();
        self.waitings.push_front(WaitEntry {
            ticket: pending.ticket,
            payload: pending.payload,
            resp_tx: pending.resp_tx,
        });
        true
    }

    fn handle_cancel(&mut self, ticket: u64) {
        let pending_id = self
            .pendings
            .iter()
            .find(|(_, p)| p.ticket == ticket)
            .map(|(id, _)| *id);
        if let Some(req_id) = pending_id {
            if let Some(pending) = self.pendings.remove(&req_id) {
                self.release_stream(&pending.owner);
                pending.done.cancel();
                self.metrics.cancelled_total.inc();
                self.metrics.inflight.set(self.pendings.len() as i64);
            }
            return;
        }
        if let Some(pos) = self.waitings.iter().position(|w| w.ticket == ticket) {
            self.waitings.remove(pos);
            self.metrics.cancelled_total.inc();
            self.metrics.waiting.set(self.waitings.len() as i64);
        }
    }

    fn handle_add_event(&mut self, event: Result<Arc<StreamHandle>, broadcast::error::RecvError>) {
        match event {
            Ok(handle) => {
                info!(stream = %handle.id(), "request manager adding stream");
                if self.add_stream(handle) {
                    self.throttle();
                }
            }
            Err(broadcast::error::RecvError::Lagged(missed)) => {
                warn!(missed, "lagged on stream add events; reconciling");
                self.resync();
            }
            Err(broadcast::error::RecvError::Closed) => {}
        }
    }

    fn handle_remove_event(&mut self, event: Result<StreamId, broadcast::error::RecvError>) {
        match event {
            Ok(id) => {
                info!(stream = %id, "request manager removing stream");
                if self.remove_stream(&id) {
                    self.throttle();
                }
            }
            Err(broadcast::error::RecvError::Lagged(missed)) => {
                warn!(missed, "lagged on stream remove events; reconciling");
                self.resync();
            }
            Err(broadcast::error::RecvError::Closed) => {}
        }
    }

    /// Reconcile bookkeeping against the authoritative registry after a
    /// missed event window.
    fn resync(&mut self) {
        let live: HashMap<StreamId, Arc<StreamHandle>> = self
            .stream_manager
            .snapshot()
            .into_iter()
            .map(|h| (h.id().clone(), h))
            .collect();

        let gone: Vec<StreamId> = self
            .streams
            .keys()
            .filter(|id| !live.contains_key(*id))
            .cloned()
            .collect();
        for id in gone {
            self.remove_stream(&id);
        }
        for (id, handle) in live {
            if !self.streams.contains_key(&id) {
                self.add_stream(handle);
            }
        }
        self.throttle();
    }

    fn add_stream(&mut self, handle: Arc<StreamHandle>) -> bool {
        let id = handle.id().clone();
        if self.streams.contains_key(&id) {
            return false;
        }
        self.streams.insert(
            id.clone(),
            StreamEntry {
                handle,
                pending: None,
            },
        );
        self.available.insert(id);
        true
    }

    /// Drop a stream; its pending request, if any, is re-queued at the front
    /// of the waiting queue. Returns whether a request was re-queued.
    fn remove_stream(&mut self, id: &StreamId) -> bool {
        let Some(entry) = self.streams.remove(id) else {
            return false;
        };
        self.available.remove(id);

        if let Some(req_id) = entry.pending {
            if let Some(pending) = self.pendings.remove(&req_id) {
                pending.done.cancel();
                self.metrics.retries_total.inc();
                self.waitings.push_front(WaitEntry {
                    ticket: pending.ticket,
                    payload: pending.payload,
                    resp_tx: pending.resp_tx,
                });
                return true;
            }
        }
        false
    }

    fn release_stream(&mut self, id: &StreamId) {
        if let Some(entry) = self.streams.get_mut(id) {
            entry.pending = None;
            self.available.insert(id.clone());
        }
    }

    fn close(&mut self) {
        info!("request manager stopped");
        for (_, pending) in self.pendings.drain() {
            pending.done.cancel();
            let _ = pending.resp_tx.send(Err(StreamError::ManagerClosed));
        }
        for wait in self.waitings.drain(..) {
            let _ = wait.resp_tx.send(Err(StreamError::ManagerClosed));
        }
        self.metrics.inflight.set(0);
        self.metrics.waiting.set(0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manager::StreamManagerConfig;
    use crate::message::ResponsePayload;
    use crate::types::ProtoId;

    fn test_setup(config: RequestManagerConfig) -> (Arc<StreamManager>, Arc<RequestManager>) {
        let sm_config = StreamManagerConfig {
            network: "testnet".to_string(),
            concurrency: 1,
            min_streams: 1,
            init_streams: 1,
            max_streams: 8,
        };
        let registry = Registry::new();
        let sm = StreamManager::new(sm_config, &registry).unwrap();
        let rm = RequestManager::start(sm.clone(), config, &registry).unwrap();
        (sm, rm)
    }

    fn fast_config() -> RequestManagerConfig {
        RequestManagerConfig {
            req_timeout: Duration::from_secs(5),
            throttle_interval: Duration::from_millis(20),
            throttle_batch: 16,
            deliver_timeout: Duration::from_secs(1),
        }
    }

    fn register_stream(
        sm: &StreamManager,
        id: &str,
    ) -> (Arc<StreamHandle>, mpsc::Receiver<Message>) {
        let (tx, rx) = mpsc::channel(16);
        let handle = Arc::new(StreamHandle::new(
            StreamId::from(id),
            ProtoId::new("sync/1.0.0/testnet/0"),
            tx,
        ));
        sm.new_stream(handle.clone()).unwrap();
        (handle, rx)
    }

    async fn recv_request(rx: &mut mpsc::Receiver<Message>) -> Request {
        match tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("timed out waiting for dispatched request")
            .expect("stream channel closed")
        {
            Message::Request(req) => req,
            other => panic!("expected request, got {other:?}"),
        }
    }

    async fn wait_for_stats(
        rm: &RequestManager,
        predicate: impl Fn(RequestManagerStats) -> bool,
    ) -> RequestManagerStats {
        for _ in 0..100 {
            let stats = rm.stats().await.unwrap();
            if predicate(stats) {
                return stats;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("stats predicate never satisfied");
    }

    #[tokio::test]
    async fn test_request_response_roundtrip() {
        let (sm, rm) = test_setup(fast_config());
        let (_handle, mut rx) = register_stream(&sm, "st-1");

        let caller = {
            let rm = rm.clone();
            tokio::spawn(async move { rm.do_request(RequestPayload::GetBlockNumber).await })
        };

        let req = recv_request(&mut rx).await;
        assert_eq!(req.payload, RequestPayload::GetBlockNumber);
        rm.deliver_response(
            StreamId::from("st-1"),
            Response::new(req.req_id, ResponsePayload::BlockNumber(42)),
        )
        .await;

        let (resp, stid) = caller.await.unwrap().unwrap();
        assert_eq!(resp.payload, ResponsePayload::BlockNumber(42));
        assert_eq!(stid, StreamId::from("st-1"));

        // The stream is available again and nothing lingers.
        let stats = wait_for_stats(&rm, |s| s.available == 1).await;
        assert_eq!(stats.pending, 0);
        assert_eq!(stats.waiting, 0);
    }

    #[tokio::test]
    async fn test_single_inflight_per_stream() {
        let (sm, rm) = test_setup(fast_config());
        let (_handle, mut rx) = register_stream(&sm, "st-1");

        let first = {
            let rm = rm.clone();
            tokio::spawn(async move { rm.do_request(RequestPayload::GetEpochState(1)).await })
        };
        let second = {
            let rm = rm.clone();
            tokio::spawn(async move { rm.do_request(RequestPayload::GetEpochState(2)).await })
        };

        let req1 = recv_request(&mut rx).await;

        // The second request must stay parked while the first is pending.
        let parked =
            tokio::time::timeout(Duration::from_millis(100), rx.recv()).await;
        assert!(parked.is_err(), "second request dispatched while stream busy");
        let stats = rm.stats().await.unwrap();
        assert_eq!(stats.pending, 1);
        assert_eq!(stats.waiting, 1);

        // Serve both in turn; enqueue order between the two callers is not
        // guaranteed, so only await them once both responses are out.
        rm.deliver_response(
            StreamId::from("st-1"),
            Response::new(req1.req_id, ResponsePayload::EpochState(bytes::Bytes::new())),
        )
        .await;
        let req2 = recv_request(&mut rx).await;
        rm.deliver_response(
            StreamId::from("st-1"),
            Response::new(req2.req_id, ResponsePayload::EpochState(bytes::Bytes::new())),
        )
        .await;
        first.await.unwrap().unwrap();
        second.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_priority_ordering() {
        let (sm, rm) = test_setup(fast_config());

        // Queue R1, R2 (low) then R3 (high) before any stream exists.
        let spawn_req = |epoch: u64, high: bool| {
            let rm = rm.clone();
            tokio::spawn(async move {
                rm.do_request_with_options(
                    RequestPayload::GetEpochState(epoch),
                    RequestOptions {
                        high_priority: high,
                        fail_fast: false,
                    },
                )
                .await
            })
        };
        let r1 = spawn_req(1, false);
        wait_for_stats(&rm, |s| s.waiting == 1).await;
        let r2 = spawn_req(2, false);
        wait_for_stats(&rm, |s| s.waiting == 2).await;
        let r3 = spawn_req(3, true);
        wait_for_stats(&rm, |s| s.waiting == 3).await;

        let (_handle, mut rx) = register_stream(&sm, "st-1");

        let mut served = Vec::new();
        for _ in 0..3 {
            let req = recv_request(&mut rx).await;
            let RequestPayload::GetEpochState(epoch) = req.payload else {
                panic!("unexpected payload");
            };
            served.push(epoch);
            rm.deliver_response(
                StreamId::from("st-1"),
                Response::new(req.req_id, ResponsePayload::EpochState(bytes::Bytes::new())),
            )
            .await;
        }
        assert_eq!(served, vec![3, 1, 2]);

        for task in [r1, r2, r3] {
            task.await.unwrap().unwrap();
        }
    }

    #[tokio::test]
    async fn test_cancelled_caller_leaves_no_residue() {
        let (_sm, rm) = test_setup(fast_config());

        let result = tokio::time::timeout(
            Duration::from_millis(50),
            rm.do_request(RequestPayload::GetBlockNumber),
        )
        .await;
        assert!(result.is_err(), "request completed without any stream");

        let stats = wait_for_stats(&rm, |s| s.waiting == 0).await;
        assert_eq!(stats.pending, 0);
    }

    #[tokio::test]
    async fn test_write_failure_retries_on_new_stream() {
        let (sm, rm) = test_setup(fast_config());

        // A stream whose writer task is already gone: sends into it fail.
        let (dead_handle, dead_rx) = register_stream(&sm, "st-dead");
        drop(dead_rx);
        let _ = dead_handle;

        let caller = {
            let rm = rm.clone();
            tokio::spawn(async move { rm.do_request(RequestPayload::GetBlockNumber).await })
        };

        // Let at least one attempt fail its write, then tear the dead stream
        // down the way its peer handler would.
        tokio::time::sleep(Duration::from_millis(50)).await;
        sm.remove_stream(&StreamId::from("st-dead")).unwrap();
        wait_for_stats(&rm, |s| s.streams == 0 && s.waiting == 1).await;

        let (_handle, mut rx) = register_stream(&sm, "st-live");
        let req = recv_request(&mut rx).await;
        rm.deliver_response(
            StreamId::from("st-live"),
            Response::new(req.req_id, ResponsePayload::BlockNumber(7)),
        )
        .await;

        let (resp, stid) = caller.await.unwrap().unwrap();
        assert_eq!(resp.payload, ResponsePayload::BlockNumber(7));
        assert_eq!(stid, StreamId::from("st-live"));
    }

    #[tokio::test]
    async fn test_timeout_retries_with_fresh_wire_id() {
        let mut config = fast_config();
        config.req_timeout = Duration::from_millis(100);
        let (sm, rm) = test_setup(config);
        let (_handle, mut rx) = register_stream(&sm, "st-1");

        let caller = {
            let rm = rm.clone();
            tokio::spawn(async move { rm.do_request(RequestPayload::GetBlockNumber).await })
        };

        let first = recv_request(&mut rx).await;
        // Ignore the first attempt; the timeout retries on the same stream.
        let second = recv_request(&mut rx).await;
        assert_eq!(second.payload, first.payload);
        assert_ne!(second.req_id, first.req_id);

        rm.deliver_response(
            StreamId::from("st-1"),
            Response::new(second.req_id, ResponsePayload::BlockNumber(9)),
        )
        .await;
        let (resp, _) = caller.await.unwrap().unwrap();
        assert_eq!(resp.payload, ResponsePayload::BlockNumber(9));

        // A late delivery for the first attempt is dropped as stale.
        rm.deliver_response(
            StreamId::from("st-1"),
            Response::new(first.req_id, ResponsePayload::BlockNumber(1)),
        )
        .await;
        let stats = wait_for_stats(&rm, |s| s.pending == 0).await;
        assert_eq!(stats.waiting, 0);
    }

    #[tokio::test]
    async fn test_stream_removal_requeues_pending_request() {
        let (sm, rm) = test_setup(fast_config());
        let (_handle, mut rx) = register_stream(&sm, "st-1");

        let caller = {
            let rm = rm.clone();
            tokio::spawn(async move { rm.do_request(RequestPayload::GetBlockNumber).await })
        };
        let req1 = recv_request(&mut rx).await;

        sm.remove_stream(&StreamId::from("st-1")).unwrap();
        wait_for_stats(&rm, |s| s.streams == 0 && s.waiting == 1).await;

        let (_handle2, mut rx2) = register_stream(&sm, "st-2");
        let req2 = recv_request(&mut rx2).await;
        assert_eq!(req2.payload, req1.payload);

        rm.deliver_response(
            StreamId::from("st-2"),
            Response::new(req2.req_id, ResponsePayload::BlockNumber(3)),
        )
        .await;
        let (resp, stid) = caller.await.unwrap().unwrap();
        assert_eq!(resp.payload, ResponsePayload::BlockNumber(3));
        assert_eq!(stid, StreamId::from("st-2"));
    }

    #[tokio::test]
    async fn test_fail_fast_without_streams() {
        let (_sm, rm) = test_setup(fast_config());
        let err = rm
            .do_request_with_options(
                RequestPayload::GetBlockNumber,
                RequestOptions {
                    high_priority: false,
                    fail_fast: true,
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, StreamError::NoAvailableStream));
    }

    #[tokio::test]
    async fn test_close_fails_outstanding_requests() {
        let (sm, rm) = test_setup(fast_config());
        let (_handle, mut rx) = register_stream(&sm, "st-1");

        let pending_caller = {
            let rm = rm.clone();
            tokio::spawn(async move { rm.do_request(RequestPayload::GetBlockNumber).await })
        };
        let _ = recv_request(&mut rx).await;
        let waiting_caller = {
            let rm = rm.clone();
            tokio::spawn(async move { rm.do_request(RequestPayload::GetEpochState(1)).await })
        };
        wait_for_stats(&rm, |s| s.pending == 1 && s.waiting == 1).await;

        rm.close();
        for caller in [pending_caller, waiting_caller] {
            let err = caller.await.unwrap().unwrap_err();
            assert!(matches!(err, StreamError::ManagerClosed));
        }
    }

    #[tokio::test]
    async fn test_delivery_from_wrong_stream_is_dropped() {
        let (sm, rm) = test_setup(fast_config());
        let (_h1, mut rx1) = register_stream(&sm, "st-1");

        let caller = {
            let rm = rm.clone();
            tokio::spawn(async move { rm.do_request(RequestPayload::GetBlockNumber).await })
        };
        let req = recv_request(&mut rx1).await;

        // Second stream appears after the request is already pending on st-1.
        let (_h2, _rx2) = register_stream(&sm, "st-2");
        wait_for_stats(&rm, |s| s.streams == 2).await;

        // A response with the right wire ID from the wrong stream is stale.
        rm.deliver_response(
            StreamId::from("st-2"),
            Response::new(req.req_id, ResponsePayload::BlockNumber(666)),
        )
        .await;
        let stats = rm.stats().await.unwrap();
        assert_eq!(stats.pending, 1);

        rm.deliver_response(
            StreamId::from("st-1"),
            Response::new(req.req_id, ResponsePayload::BlockNumber(5)),
        )
        .await;
        let (resp, stid) = caller.await.unwrap().unwrap();
        assert_eq!(resp.payload, ResponsePayload::BlockNumber(5));
        assert_eq!(stid, StreamId::from("st-1"));
    }
}

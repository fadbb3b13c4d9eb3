// SPDX-License-Identifier: BUSL-1.1

//! The per-connection `Client` handle shared between the Read Pipe, Write
//! Pipe, Subscription Index, and Broadcast Engine, plus a small pool that
//! reuses `Client` allocations across connections.

use std::collections::HashSet;
use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, AtomicU16, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::{mpsc, Notify, OwnedSemaphorePermit};

use crate::config::FanoutConfig;
use crate::envelope::epoch_ms;
use crate::rate_limiter::TokenBucket;

/// Outcome of a broadcast-side enqueue attempt onto a client's outbound
/// queue. The Broadcast Engine never blocks on a slow client: `Full` is a
/// signal to record a strike, not an error.
#[derive(Debug, PartialEq, Eq)]
pub enum EnqueueOutcome {
    Delivered,
    Full,
    Closed,
}

/// A connected WebSocket client.
///
/// `tx`/`rx` form the bounded outbound queue: the Broadcast Engine and
/// control-reply paths hold `tx` and use non-blocking `try_send`; the
/// Write Pipe owns the single `rx` for the life of the connection.
pub struct Client {
    pub id: String,
    pub remote_ip: IpAddr,
    pub connected_at_ms: i64,
    tx: mpsc::Sender<Arc<str>>,
    strikes: AtomicU32,
    closed: AtomicBool,
    pending_close_code: AtomicU16,
    pub close_notify: Notify,
    pub inbound_bucket: TokenBucket,
    admission_permit: Mutex<Option<OwnedSemaphorePermit>>,
    /// The channels this client has asked to subscribe to, mirrored here so
    /// the Read Pipe can report `count` in subscription acks and filter
    /// reconnect replay to what the client is actually subscribed to,
    /// without querying the Subscription Index's channel -> client
    /// direction in reverse.
    subscribed_channels: Mutex<HashSet<String>>,
}

/// Sentinel meaning "no close pending" in `pending_close_code`; valid
/// WebSocket close codes are >= 1000.
const NO_PENDING_CLOSE: u16 = 0;

impl Client {
    pub fn new(
        id: String,
        remote_ip: IpAddr,
        config: &FanoutConfig,
        permit: OwnedSemaphorePermit,
    ) -> (Arc<Self>, mpsc::Receiver<Arc<str>>) {
        let (tx, rx_for_writer) = mpsc::channel(config.queue_capacity);
        let client = Arc::new(Self {
            id,
            remote_ip,
            connected_at_ms: epoch_ms(),
            tx,
            strikes: AtomicU32::new(0),
            closed: AtomicBool::new(false),
            pending_close_code: AtomicU16::new(NO_PENDING_CLOSE),
            close_notify: Notify::new(),
            inbound_bucket: TokenBucket::new(config.client_rate_per_sec, config.client_rate_burst as f64),
            admission_permit: Mutex::new(Some(permit)),
            subscribed_channels: Mutex::new(HashSet::new()),
        });
        (client, rx_for_writer)
    }

    #[cfg(test)]
    pub fn new_for_test(id: &str, config: &FanoutConfig) -> Self {
        let (tx, _rx) = mpsc::channel(config.queue_capacity);
        Self {
            id: id.to_owned(),
            remote_ip: std::net::IpAddr::V4(std::net::Ipv4Addr::LOCALHOST),
            connected_at_ms: epoch_ms(),
            tx,
            strikes: AtomicU32::new(0),
            closed: AtomicBool::new(false),
            pending_close_code: AtomicU16::new(NO_PENDING_CLOSE),
            close_notify: Notify::new(),
            inbound_bucket: TokenBucket::new(config.client_rate_per_sec, config.client_rate_burst as f64),
            admission_permit: Mutex::new(None),
            subscribed_channels: Mutex::new(HashSet::new()),
        }
    }

    /// Non-blocking enqueue of a shared, pre-serialized payload. Never
    /// awaits, never interleaves with an I/O point, matching the
    /// "broadcast never blocks" invariant.
    pub fn try_enqueue(&self, payload: Arc<str>) -> EnqueueOutcome {
        if self.is_closed() {
            return EnqueueOutcome::Closed;
        }
        match self.tx.try_send(payload) {
            Ok(()) => {
                self.strikes.store(0, Ordering::Relaxed);
                EnqueueOutcome::Delivered
            }
            Err(mpsc::error::TrySendError::Full(_)) => EnqueueOutcome::Full,
            Err(mpsc::error::TrySendError::Closed(_)) => {
                self.closed.store(true, Ordering::Relaxed);
                EnqueueOutcome::Closed
            }
        }
    }

    /// Record a full-queue strike. Returns `true` once the client has hit
    /// `slow_client_strikes` consecutive failures and should be evicted.
    pub fn record_strike(&self, threshold: u32) -> bool {
        self.strikes.fetch_add(1, Ordering::Relaxed) + 1 >= threshold
    }

    pub fn sender(&self) -> mpsc::Sender<Arc<str>> {
        self.tx.clone()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Relaxed)
    }

    pub fn mark_closed(&self) {
        self.closed.store(true, Ordering::Relaxed);
    }

    /// Request an out-of-band close frame with `code`, delivered by the
    /// Write Pipe even when the data queue is saturated. Wakes any task
    /// parked on `close_notify`.
    pub fn request_close(&self, code: u16) {
        self.pending_close_code.store(code, Ordering::Relaxed);
        self.closed.store(true, Ordering::Relaxed);
        self.close_notify.notify_one();
    }

    /// Take the pending close code, if any, clearing it so it's delivered
    /// exactly once.
    pub fn take_pending_close(&self) -> Option<u16> {
        match self.pending_close_code.swap(NO_PENDING_CLOSE, Ordering::Relaxed) {
            NO_PENDING_CLOSE => None,
            code => Some(code),
        }
    }

    /// Release the admission-capacity permit held for this connection.
    /// Idempotent: a second call is a no-op since the `Option` is already
    /// `None`.
    pub fn release_permit(&self) {
        self.admission_permit.lock().unwrap_or_else(|e| e.into_inner()).take();
    }

    /// Record channels this client just subscribed to, for ack counts and
    /// reconnect replay filtering.
    pub fn add_subscriptions(&self, channels: impl IntoIterator<Item = String>) {
        let mut set = self.subscribed_channels.lock().unwrap_or_else(|e| e.into_inner());
        set.extend(channels);
    }

    pub fn remove_subscriptions<'a>(&self, channels: impl IntoIterator<Item = &'a str>) {
        let mut set = self.subscribed_channels.lock().unwrap_or_else(|e| e.into_inner());
        for channel in channels {
            set.remove(channel);
        }
    }

    pub fn is_subscribed(&self, channel: &str) -> bool {
        self.subscribed_channels.lock().unwrap_or_else(|e| e.into_inner()).contains(channel)
    }

    pub fn subscription_count(&self) -> usize {
        self.subscribed_channels.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    fn clear_subscriptions(&self) {
        self.subscribed_channels.lock().unwrap_or_else(|e| e.into_inner()).clear();
    }
}

/// Reuses `Client` allocations across connections to cut allocator churn
/// under high connection churn. Reuse is opportunistic:
/// a `Client` goes back in the pool only when its `Arc` strong count has
/// dropped to exactly one, meaning every task that held a reference
/// (Read Pipe, Write Pipe, Subscription Index entries) has released it.
#[derive(Default)]
pub struct ClientPool {
    idle: Mutex<Vec<Arc<Client>>>,
}

impl ClientPool {
    pub fn new() -> Self {
        Self { idle: Mutex::new(Vec::new()) }
    }

    /// Return a client to the pool for potential reuse. Silently dropped
    /// if another reference is still alive or the pool is already at
    /// capacity.
    pub fn release(&self, client: Arc<Client>, max_idle: usize) {
        if Arc::strong_count(&client) != 1 {
            return;
        }
        let mut idle = self.idle.lock().unwrap_or_else(|e| e.into_inner());
        if idle.len() < max_idle {
            idle.push(client);
        }
    }

    /// Take an idle client and reset it for a new connection: a fresh
    /// outbound queue (the old one's receiver end was consumed by that
    /// connection's Write Pipe), `sendAttempts`/`slowWarned` cleared, the
    /// subscription set cleared, and a fresh admission permit and sequence
    /// base. Returns `Err(permit)` handing the permit back unused when the
    /// pool is empty, so the caller falls back to `Client::new`.
    pub fn acquire(
        &self,
        id: String,
        remote_ip: IpAddr,
        config: &FanoutConfig,
        permit: OwnedSemaphorePermit,
    ) -> Result<(Arc<Client>, mpsc::Receiver<Arc<str>>), OwnedSemaphorePermit> {
        let mut idle = self.idle.lock().unwrap_or_else(|e| e.into_inner());
        let Some(mut client) = idle.pop() else { return Err(permit) };
        drop(idle);

        let (tx, rx) = mpsc::channel(config.queue_capacity);
        let inner = Arc::get_mut(&mut client)
            .expect("a released client's Arc::strong_count was 1 and nothing else reachable it since");
        inner.id = id;
        inner.remote_ip = remote_ip;
        inner.connected_at_ms = epoch_ms();
        inner.tx = tx;
        inner.strikes.store(0, Ordering::Relaxed);
        inner.closed.store(false, Ordering::Relaxed);
        inner.pending_close_code.store(NO_PENDING_CLOSE, Ordering::Relaxed);
        inner.clear_subscriptions();
        *inner.admission_permit.lock().unwrap_or_else(|e| e.into_inner()) = Some(permit);

        Ok((client, rx))
    }

    #[cfg(test)]
    pub fn idle_count(&self) -> usize {
        self.idle.lock().unwrap().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::Semaphore;

    async fn test_client() -> (Arc<Client>, mpsc::Receiver<Arc<str>>) {
        let config = FanoutConfig { queue_capacity: 2, ..FanoutConfig::default() };
        let semaphore = Arc::new(Semaphore::new(1));
        let permit = semaphore.acquire_owned().await.unwrap();
        Client::new("c1".to_owned(), std::net::IpAddr::V4(std::net::Ipv4Addr::LOCALHOST), &config, permit)
    }

    #[tokio::test]
    async fn enqueue_delivers_until_full_then_reports_full() {
        let (client, _rx) = test_client().await;
        assert_eq!(client.try_enqueue(Arc::from("a")), EnqueueOutcome::Delivered);
        assert_eq!(client.try_enqueue(Arc::from("b")), EnqueueOutcome::Delivered);
        assert_eq!(client.try_enqueue(Arc::from("c")), EnqueueOutcome::Full);
    }

    #[tokio::test]
    async fn strikes_accumulate_and_reset_on_success() {
        let (client, _rx) = test_client().await;
        assert!(!client.record_strike(3));
        assert!(!client.record_strike(3));
        client.try_enqueue(Arc::from("ok"));
        assert!(!client.record_strike(3));
        assert!(client.record_strike(3));
    }

    #[tokio::test]
    async fn request_close_marks_closed_and_is_delivered_once() {
        let (client, _rx) = test_client().await;
        client.request_close(1008);
        assert!(client.is_closed());
        assert_eq!(client.take_pending_close(), Some(1008));
        assert_eq!(client.take_pending_close(), None);
    }

    #[tokio::test]
    async fn closed_queue_reports_closed_not_full() {
        let (client, rx) = test_client().await;
        drop(rx);
        assert_eq!(client.try_enqueue(Arc::from("x")), EnqueueOutcome::Closed);
    }

    #[tokio::test]
    async fn pool_reuses_only_when_sole_owner() {
        let pool = ClientPool::new();
        let (client, _rx) = test_client().await;
        let clone = client.clone();
        pool.release(client, 8);
        assert_eq!(pool.idle_count(), 0);
        drop(clone);
    }

    #[tokio::test]
    async fn acquire_resets_and_reuses_a_released_client() {
        let config = FanoutConfig { queue_capacity: 2, ..FanoutConfig::default() };
        let pool = ClientPool::new();
        let semaphore = Arc::new(Semaphore::new(2));

        let first_permit = semaphore.clone().acquire_owned().await.unwrap();
        let (first, first_rx) = Client::new("old".to_owned(), std::net::IpAddr::V4(std::net::Ipv4Addr::LOCALHOST), &config, first_permit);
        first.add_subscriptions(["BTC.trade".to_owned()]);
        first.try_enqueue(Arc::from("stale"));
        first.record_strike(3);
        drop(first_rx);
        pool.release(first, 8);
        assert_eq!(pool.idle_count(), 1);

        let second_permit = semaphore.acquire_owned().await.unwrap();
        let (second, _second_rx) = pool
            .acquire("new".to_owned(), std::net::IpAddr::V4(std::net::Ipv4Addr::new(10, 0, 0, 1)), &config, second_permit)
            .expect("pool has an idle client");

        assert_eq!(second.id, "new");
        assert_eq!(second.subscription_count(), 0);
        assert!(!second.is_closed());
        assert_eq!(pool.idle_count(), 0);
    }

    #[tokio::test]
    async fn acquire_hands_permit_back_when_pool_is_empty() {
        let config = FanoutConfig::default();
        let pool = ClientPool::new();
        let semaphore = Arc::new(Semaphore::new(1));
        let permit = semaphore.acquire_owned().await.unwrap();

        let err = pool
            .acquire("id".to_owned(), std::net::IpAddr::V4(std::net::Ipv4Addr::LOCALHOST), &config, permit)
            .err()
            .expect("empty pool returns the permit");
        drop(err);
    }
}

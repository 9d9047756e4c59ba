//! Connection pool keyed by agent destination.
//!
//! Keeps long-lived sockets per `(host, port, token)` and hands them out one
//! request at a time.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────┐
//! │                  ConnectionPool                      │
//! │  Mutex<PoolState>  (never held across I/O)           │
//! │  ┌────────────────────────────────────────────────┐  │
//! │  │ PoolKey A → Bucket { idle: [c3, c1], count: 3, │  │
//! │  │                      waiters: [] }             │  │
//! │  │ PoolKey B → Bucket { idle: [], count: 2,       │  │
//! │  │                      waiters: [w1, w2] }       │  │
//! │  └────────────────────────────────────────────────┘  │
//! └──────────────────────────────────────────────────────┘
//! ```
//!
//! # Acquire
//!
//! 1. Pop the newest idle connection (LIFO); discard it if closed and retry
//! 2. Otherwise reserve a slot if `count < max_per_key` and open a socket
//!    outside the lock
//! 3. Otherwise enqueue as a waiter (FIFO) until `acquire_timeout`
//!
//! # Hand-off
//!
//! A released connection goes straight to the oldest waiter instead of the
//! idle stack. When a connection is disposed or a handshake fails, the freed
//! slot itself is handed to the oldest waiter, which then opens a fresh
//! socket. `count` therefore never exceeds `max_per_key`, and no waiter is
//! left parked while a slot or idle connection exists.

// ============================================================================
// Imports
// ============================================================================

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use futures_util::future::join_all;
use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::oneshot;
use tokio::time::{Instant, sleep, timeout_at};
use tracing::{debug, info, trace, warn};

use crate::error::{Error, Result};
use crate::identifiers::{ConnectionId, PoolKey};
use crate::options::PoolOptions;
use crate::protocol;

use super::connection::Connection;
use super::factory::ConnectionFactory;

// ============================================================================
// Constants
// ============================================================================

/// Default per-request reply timeout.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(20);

/// Default number of retries above the first attempt.
pub const DEFAULT_REQUEST_RETRIES: u32 = 1;

/// Pause before the first retry of a failed request.
const RETRY_DELAY_BASE: Duration = Duration::from_millis(200);

/// Additional pause per retry.
const RETRY_DELAY_STEP: Duration = Duration::from_millis(250);

// ============================================================================
// Types
// ============================================================================

/// What a waiter receives when it is served.
enum Handoff {
    /// A released connection, ready for use.
    Connection(Connection),
    /// A reserved slot; the waiter opens its own connection.
    Slot,
}

/// A blocked acquire.
struct Waiter {
    id: u64,
    tx: oneshot::Sender<Handoff>,
}

/// Per-key state.
#[derive(Default)]
struct Bucket {
    /// Newest last.
    idle: Vec<Connection>,
    /// Idle plus in-use connections, plus slots reserved for handshakes.
    count: usize,
    /// Oldest first.
    waiters: VecDeque<Waiter>,
}

impl Bucket {
    /// Gives `handoff` to the oldest live waiter.
    ///
    /// Returns it back if every waiter has gone away.
    fn hand_off(&mut self, mut handoff: Handoff) -> Option<Handoff> {
        while let Some(waiter) = self.waiters.pop_front() {
            match waiter.tx.send(handoff) {
                Ok(()) => {
                    trace!(waiter = waiter.id, "Handed off to waiter");
                    return None;
                }
                Err(returned) => handoff = returned,
            }
        }
        Some(handoff)
    }
}

/// Everything guarded by the pool lock.
#[derive(Default)]
struct PoolState {
    buckets: FxHashMap<PoolKey, Bucket>,
    /// Bumped by `close_all`; leases from older generations are not pooled.
    generation: u64,
}

/// Snapshot of one bucket.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BucketStats {
    /// Connections for the key, idle plus in use.
    pub count: usize,
    /// Idle connections.
    pub idle: usize,
    /// Blocked acquires.
    pub waiters: usize,
}

/// Shared pool state.
struct PoolInner {
    options: PoolOptions,
    factory: ConnectionFactory,
    state: Mutex<PoolState>,
    next_waiter_id: AtomicU64,
}

// ============================================================================
// ConnectionPool
// ============================================================================

/// Pool of persistent WebSocket connections to monitoring agents.
///
/// Cheap to clone; clones share the same connections.
///
/// # Example
///
/// ```no_run
/// use serde_json::json;
/// use ws_agent_pool::{ConnectionPool, PoolKey, PoolOptions};
///
/// # async fn example() -> ws_agent_pool::Result<()> {
/// let pool = ConnectionPool::new(PoolOptions::default())?;
/// let key = PoolKey::new("10.0.0.5", 8080, "agent-token");
///
/// let reply = pool.request(&key, &json!({ "action": "get_stats" })).await;
/// if let Some(tag) = reply.get("error") {
///     eprintln!("agent unreachable: {tag}");
/// }
///
/// pool.close_all().await;
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct ConnectionPool {
    inner: Arc<PoolInner>,
}

// ============================================================================
// ConnectionPool - Constructor
// ============================================================================

impl ConnectionPool {
    /// Creates a pool with validated options.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if the options are invalid.
    pub fn new(options: PoolOptions) -> Result<Self> {
        options.validate()?;
        Ok(Self::from_valid(options))
    }

    /// Creates a pool from options already known to be valid.
    pub(crate) fn from_valid(options: PoolOptions) -> Self {
        debug!(
            max_per_key = options.max_per_key,
            acquire_timeout_ms = options.acquire_timeout.as_millis() as u64,
            "ConnectionPool created"
        );

        Self {
            inner: Arc::new(PoolInner {
                factory: ConnectionFactory::new(options.clone()),
                options,
                state: Mutex::new(PoolState::default()),
                next_waiter_id: AtomicU64::new(1),
            }),
        }
    }
}

// ============================================================================
// ConnectionPool - Public API
// ============================================================================

impl ConnectionPool {
    /// Returns the options the pool was built with.
    #[inline]
    #[must_use]
    pub fn options(&self) -> &PoolOptions {
        &self.inner.options
    }

    /// Sends `payload` to the agent and returns its JSON reply.
    ///
    /// Uses [`DEFAULT_REQUEST_TIMEOUT`] and [`DEFAULT_REQUEST_RETRIES`].
    /// See [`request_with`](Self::request_with).
    pub async fn request<P: Serialize + ?Sized>(&self, key: &PoolKey, payload: &P) -> Value {
        self.request_with(key, payload, DEFAULT_REQUEST_TIMEOUT, DEFAULT_REQUEST_RETRIES)
            .await
    }

    /// Sends `payload` to the agent and returns its JSON reply.
    ///
    /// Makes up to `retries + 1` attempts. Never fails: errors are reported
    /// as `{"error": <tag>}`, and a reply that is not JSON as
    /// `{"error": "invalid_json", "raw": <text>}`.
    ///
    /// Transport failures dispose the connection and are retried after a
    /// short pause. `acquire_timeout` is returned immediately.
    pub async fn request_with<P: Serialize + ?Sized>(
        &self,
        key: &PoolKey,
        payload: &P,
        request_timeout: Duration,
        retries: u32,
    ) -> Value {
        let text = match protocol::encode_payload(payload) {
            Ok(text) => text,
            Err(e) => return e.to_reply(),
        };

        let mut last_error: Option<Error> = None;

        for attempt in 0..=retries {
            let lease = match self.acquire(key).await {
                Ok(lease) => lease,
                Err(e) if e.is_capacity_error() => {
                    debug!(key = %key, error = %e, "Acquire failed");
                    return e.to_reply();
                }
                Err(e) => {
                    warn!(key = %key, attempt, error = %e, "Could not connect to agent");
                    last_error = Some(e);
                    continue;
                }
            };

            let outcome = lease.exchange(text.clone(), request_timeout).await;
            match outcome {
                Ok(raw) => return protocol::decode_reply(raw),
                Err(e) => {
                    warn!(
                        key = %key,
                        conn_id = %lease.id(),
                        attempt,
                        error = %e,
                        "Request failed"
                    );
                    // Closed connections are disposed on release
                    drop(lease);
                    last_error = Some(e);

                    if attempt < retries {
                        sleep(retry_delay(attempt)).await;
                    }
                }
            }
        }

        match last_error {
            Some(e) => e.to_reply(),
            None => protocol::unknown_reply(),
        }
    }

    /// Returns a snapshot of the bucket for `key`, if it exists.
    #[must_use]
    pub fn stats(&self, key: &PoolKey) -> Option<BucketStats> {
        let state = self.inner.state.lock();
        state.buckets.get(key).map(|bucket| BucketStats {
            count: bucket.count,
            idle: bucket.idle.len(),
            waiters: bucket.waiters.len(),
        })
    }

    /// Returns the number of keys with a bucket.
    #[must_use]
    pub fn key_count(&self) -> usize {
        self.inner.state.lock().buckets.len()
    }

    /// Returns the number of connections across all keys.
    #[must_use]
    pub fn total_connections(&self) -> usize {
        let state = self.inner.state.lock();
        state.buckets.values().map(|bucket| bucket.count).sum()
    }
}

impl std::fmt::Debug for ConnectionPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionPool")
            .field("max_per_key", &self.inner.options.max_per_key)
            .field("keys", &self.key_count())
            .field("connections", &self.total_connections())
            .finish_non_exhaustive()
    }
}

// ============================================================================
// ConnectionPool - Acquire
// ============================================================================

/// Outcome of one pass over the bucket under the lock.
enum Step {
    Reuse(Connection, u64),
    Open(u64),
    Wait(WaitGuard),
}

impl ConnectionPool {
    /// Acquires a connection for `key`.
    ///
    /// # Errors
    ///
    /// - [`Error::AcquireTimeout`] if the bucket stays saturated past `acquire_timeout`
    /// - [`Error::PoolClosed`] if the pool is closed while waiting
    /// - Any handshake error from [`ConnectionFactory::open`]
    pub(crate) async fn acquire(&self, key: &PoolKey) -> Result<Lease> {
        let acquire_timeout = self.inner.options.acquire_timeout;
        let deadline = Instant::now() + acquire_timeout;

        loop {
            match PoolInner::next_step(&self.inner, key) {
                Step::Reuse(connection, generation) => {
                    if connection.is_open() {
                        trace!(key = %key, conn_id = %connection.id(), "Reusing idle connection");
                        return Ok(Lease::new(&self.inner, connection, generation));
                    }
                    debug!(key = %key, conn_id = %connection.id(), "Discarding closed idle connection");
                    self.inner.dispose(connection, generation);
                }

                Step::Open(generation) => return self.open_reserved(key, generation).await,

                Step::Wait(mut guard) => {
                    trace!(key = %key, waiter = guard.id, "Bucket saturated, waiting");
                    let handoff = match timeout_at(deadline, &mut guard.rx).await {
                        Ok(Ok(handoff)) => {
                            guard.settled = true;
                            handoff
                        }
                        Ok(Err(_)) => {
                            guard.settled = true;
                            return Err(Error::PoolClosed);
                        }
                        // Dropping the guard withdraws the waiter
                        Err(_) => {
                            return Err(Error::acquire_timeout(
                                acquire_timeout.as_millis() as u64,
                            ));
                        }
                    };

                    match handoff {
                        Handoff::Connection(connection) if connection.is_open() => {
                            return Ok(Lease::new(&self.inner, connection, guard.generation));
                        }
                        Handoff::Connection(connection) => {
                            debug!(conn_id = %connection.id(), "Handed a closed connection");
                            self.inner.dispose(connection, guard.generation);
                        }
                        Handoff::Slot => return self.open_reserved(key, guard.generation).await,
                    }
                }
            }
        }
    }

    /// Opens a connection into a slot already counted for `key`.
    ///
    /// The slot is released if opening fails or the future is dropped.
    async fn open_reserved(&self, key: &PoolKey, generation: u64) -> Result<Lease> {
        let slot = SlotGuard {
            pool: &self.inner,
            key,
            generation,
            armed: true,
        };

        let connection = self.inner.factory.open(key).await?;
        slot.disarm();

        Ok(Lease::new(&self.inner, connection, generation))
    }
}

// ============================================================================
// PoolInner - Bookkeeping
// ============================================================================

impl PoolInner {
    /// Decides the next acquire step under the lock.
    fn next_step(this: &Arc<Self>, key: &PoolKey) -> Step {
        let mut state = this.state.lock();
        let generation = state.generation;
        let bucket = state.buckets.entry(key.clone()).or_default();

        if let Some(connection) = bucket.idle.pop() {
            return Step::Reuse(connection, generation);
        }

        if bucket.count < this.options.max_per_key {
            bucket.count += 1;
            return Step::Open(generation);
        }

        let id = this.next_waiter_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        bucket.waiters.push_back(Waiter { id, tx });

        Step::Wait(WaitGuard {
            pool: Arc::clone(this),
            key: key.clone(),
            id,
            generation,
            rx,
            settled: false,
        })
    }

    /// Returns a connection after use.
    ///
    /// Closed connections, and connections from before the last
    /// `close_all`, are disposed instead of pooled.
    fn release(&self, connection: Connection, generation: u64) {
        if !connection.is_open() {
            self.dispose(connection, generation);
            return;
        }

        let stale = {
            let mut state = self.state.lock();
            let current = state.generation == generation;
            match state.buckets.get_mut(connection.key()) {
                Some(bucket) if current => {
                    if let Some(Handoff::Connection(connection)) =
                        bucket.hand_off(Handoff::Connection(connection))
                    {
                        bucket.idle.push(connection);
                    }
                    None
                }
                _ => Some(connection),
            }
        };

        if let Some(connection) = stale {
            debug!(conn_id = %connection.id(), "Pool was closed; closing released connection");
            connection.close_in_background();
        }
    }

    /// Closes a connection and frees its slot.
    fn dispose(&self, connection: Connection, generation: u64) {
        let key = connection.key().clone();
        trace!(conn_id = %connection.id(), key = %key, "Disposing connection");
        connection.close_in_background();
        self.release_slot(&key, generation);
    }

    /// Frees one slot of `key`, handing it to a waiter if there is one.
    fn release_slot(&self, key: &PoolKey, generation: u64) {
        let mut state = self.state.lock();
        if state.generation != generation {
            return;
        }

        if let Some(bucket) = state.buckets.get_mut(key)
            && bucket.hand_off(Handoff::Slot).is_some()
        {
            bucket.count = bucket.count.saturating_sub(1);
        }
    }

    /// Removes a waiter that gave up, returning anything already sent to it.
    fn withdraw(&self, key: &PoolKey, id: u64, rx: &mut oneshot::Receiver<Handoff>, generation: u64) {
        let removed = {
            let mut state = self.state.lock();
            state.buckets.get_mut(key).is_some_and(|bucket| {
                let before = bucket.waiters.len();
                bucket.waiters.retain(|waiter| waiter.id != id);
                bucket.waiters.len() != before
            })
        };

        if removed {
            return;
        }

        // Served between the deadline and the lock.
        match rx.try_recv() {
            Ok(Handoff::Connection(connection)) => self.release(connection, generation),
            Ok(Handoff::Slot) => self.release_slot(key, generation),
            Err(_) => {}
        }
    }
}

// ============================================================================
// ConnectionPool - Lifecycle
// ============================================================================

impl ConnectionPool {
    /// Closes every idle connection and cancels every waiter.
    ///
    /// Buckets are removed. Connections in use at this moment are closed
    /// when released. The pool stays usable afterwards.
    pub async fn close_all(&self) {
        let (idle, waiters) = {
            let mut state = self.inner.state.lock();
            state.generation += 1;

            let mut idle = Vec::new();
            let mut waiters = Vec::new();
            for (_, bucket) in state.buckets.drain() {
                idle.extend(bucket.idle);
                waiters.extend(bucket.waiters);
            }
            (idle, waiters)
        };

        info!(
            connections = idle.len(),
            waiters = waiters.len(),
            "ConnectionPool closing"
        );

        // Dropped senders wake waiters with PoolClosed
        drop(waiters);

        join_all(idle.iter().map(|connection| connection.close())).await;

        info!("ConnectionPool closed");
    }
}

// ============================================================================
// Guards
// ============================================================================

/// A connection leased to one request.
///
/// Dropping the lease returns the connection to the pool, or disposes it if
/// it was observed closed.
pub(crate) struct Lease {
    pool: Arc<PoolInner>,
    id: ConnectionId,
    connection: Option<Connection>,
    generation: u64,
}

impl std::fmt::Debug for Lease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Lease")
            .field("id", &self.id)
            .field("generation", &self.generation)
            .finish_non_exhaustive()
    }
}

impl Lease {
    fn new(pool: &Arc<PoolInner>, connection: Connection, generation: u64) -> Self {
        Self {
            pool: Arc::clone(pool),
            id: connection.id(),
            connection: Some(connection),
            generation,
        }
    }

    /// Id of the leased connection.
    #[inline]
    pub(crate) fn id(&self) -> ConnectionId {
        self.id
    }

    /// Runs one request/reply exchange on the leased connection.
    pub(crate) async fn exchange(&self, text: String, request_timeout: Duration) -> Result<String> {
        match &self.connection {
            Some(connection) => connection.exchange(text, request_timeout).await,
            None => Err(Error::connection_closed("lease already returned")),
        }
    }
}

impl Drop for Lease {
    fn drop(&mut self) {
        if let Some(connection) = self.connection.take() {
            self.pool.release(connection, self.generation);
        }
    }
}

/// An enrolled waiter. Dropping it unsettled withdraws from the queue.
struct WaitGuard {
    pool: Arc<PoolInner>,
    key: PoolKey,
    id: u64,
    generation: u64,
    rx: oneshot::Receiver<Handoff>,
    settled: bool,
}

impl Drop for WaitGuard {
    fn drop(&mut self) {
        if !self.settled {
            self.pool
                .withdraw(&self.key, self.id, &mut self.rx, self.generation);
        }
    }
}

/// A counted slot whose handshake has not finished yet.
struct SlotGuard<'a> {
    pool: &'a PoolInner,
    key: &'a PoolKey,
    generation: u64,
    armed: bool,
}

impl SlotGuard<'_> {
    fn disarm(mut self) {
        self.armed = false;
    }
}

impl Drop for SlotGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.pool.release_slot(self.key, self.generation);
        }
    }
}

/// Pause before retry `attempt + 1` of a request.
fn retry_delay(attempt: u32) -> Duration {
    RETRY_DELAY_BASE + RETRY_DELAY_STEP * attempt
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::atomic::AtomicUsize;

    use futures_util::{SinkExt, StreamExt};
    use tokio::net::TcpListener;
    use tokio_tungstenite::tungstenite::Message;

    /// Echo agent counting completed handshakes.
    async fn echo_agent(delay: Duration) -> (u16, Arc<AtomicUsize>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let port = listener.local_addr().expect("addr").port();
        let handshakes = Arc::new(AtomicUsize::new(0));

        let counter = Arc::clone(&handshakes);
        tokio::spawn(async move {
            while let Ok((tcp, _)) = listener.accept().await {
                let counter = Arc::clone(&counter);
                tokio::spawn(async move {
                    let Ok(mut ws) = tokio_tungstenite::accept_async(tcp).await else {
                        return;
                    };
                    counter.fetch_add(1, Ordering::SeqCst);
                    let _token = ws.next().await;
                    while let Some(Ok(msg)) = ws.next().await {
                        if let Message::Text(text) = msg {
                            sleep(delay).await;
                            if ws.send(Message::Text(text)).await.is_err() {
                                break;
                            }
                        }
                    }
                });
            }
        });

        (port, handshakes)
    }

    fn options(max_per_key: usize) -> PoolOptions {
        PoolOptions::new()
            .with_max_per_key(max_per_key)
            .with_acquire_timeout(Duration::from_secs(2))
            .without_keepalive()
    }

    #[test]
    fn test_retry_delay_grows_linearly() {
        assert_eq!(retry_delay(0), Duration::from_millis(200));
        assert_eq!(retry_delay(1), Duration::from_millis(450));
        assert_eq!(retry_delay(2), Duration::from_millis(700));
    }

    #[test]
    fn test_new_rejects_invalid_options() {
        assert!(ConnectionPool::new(PoolOptions::new().with_max_per_key(0)).is_err());
    }

    #[test]
    fn test_bucket_hand_off_is_fifo_and_skips_gone_waiters() {
        let mut bucket = Bucket::default();
        let (tx1, rx1) = oneshot::channel();
        let (tx2, mut rx2) = oneshot::channel();
        let (tx3, mut rx3) = oneshot::channel();
        bucket.waiters.push_back(Waiter { id: 1, tx: tx1 });
        bucket.waiters.push_back(Waiter { id: 2, tx: tx2 });
        bucket.waiters.push_back(Waiter { id: 3, tx: tx3 });

        drop(rx1);
        assert!(bucket.hand_off(Handoff::Slot).is_none());
        assert!(matches!(rx2.try_recv(), Ok(Handoff::Slot)));
        assert!(rx3.try_recv().is_err());

        assert!(bucket.hand_off(Handoff::Slot).is_none());
        assert!(matches!(rx3.try_recv(), Ok(Handoff::Slot)));

        assert!(bucket.hand_off(Handoff::Slot).is_some());
    }

    #[tokio::test]
    async fn test_release_returns_to_idle() {
        let (port, handshakes) = echo_agent(Duration::ZERO).await;
        let pool = ConnectionPool::new(options(2)).unwrap();
        let key = PoolKey::new("127.0.0.1", port, "t");

        let lease = pool.acquire(&key).await.expect("acquire");
        assert_eq!(
            pool.stats(&key),
            Some(BucketStats { count: 1, idle: 0, waiters: 0 })
        );
        drop(lease);
        assert_eq!(
            pool.stats(&key),
            Some(BucketStats { count: 1, idle: 1, waiters: 0 })
        );

        let _again = pool.acquire(&key).await.expect("reacquire");
        assert_eq!(handshakes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_idle_is_lifo() {
        let (port, _handshakes) = echo_agent(Duration::ZERO).await;
        let pool = ConnectionPool::new(options(2)).unwrap();
        let key = PoolKey::new("127.0.0.1", port, "t");

        let first = pool.acquire(&key).await.unwrap();
        let second = pool.acquire(&key).await.unwrap();
        let newest = second.id();
        drop(first);
        drop(second);

        let reused = pool.acquire(&key).await.unwrap();
        assert_eq!(reused.id(), newest);
    }

    #[tokio::test]
    async fn test_waiters_served_in_order() {
        let (port, handshakes) = echo_agent(Duration::ZERO).await;
        let pool = ConnectionPool::new(options(1)).unwrap();
        let key = PoolKey::new("127.0.0.1", port, "t");

        let held = pool.acquire(&key).await.unwrap();
        let order = Arc::new(Mutex::new(Vec::new()));

        let mut tasks = Vec::new();
        for n in 0..3 {
            let task_pool = pool.clone();
            let task_key = key.clone();
            let order = Arc::clone(&order);
            tasks.push(tokio::spawn(async move {
                let lease = task_pool.acquire(&task_key).await.expect("acquire");
                order.lock().push(n);
                sleep(Duration::from_millis(20)).await;
                drop(lease);
            }));
            // Enroll one at a time
            while pool.stats(&key).map(|s| s.waiters) != Some(n + 1) {
                sleep(Duration::from_millis(5)).await;
            }
        }

        drop(held);
        for task in tasks {
            task.await.unwrap();
        }

        assert_eq!(*order.lock(), vec![0, 1, 2]);
        assert_eq!(handshakes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_acquire_timeout_withdraws_waiter() {
        let (port, _handshakes) = echo_agent(Duration::ZERO).await;
        let pool = ConnectionPool::new(
            options(1).with_acquire_timeout(Duration::from_millis(100)),
        )
        .unwrap();
        let key = PoolKey::new("127.0.0.1", port, "t");

        let _held = pool.acquire(&key).await.unwrap();
        let err = pool.acquire(&key).await.unwrap_err();
        assert!(matches!(err, Error::AcquireTimeout { .. }));
        assert_eq!(
            pool.stats(&key),
            Some(BucketStats { count: 1, idle: 0, waiters: 0 })
        );
    }

    #[tokio::test]
    async fn test_cancelled_waiter_does_not_leak() {
        let (port, _handshakes) = echo_agent(Duration::ZERO).await;
        let pool = ConnectionPool::new(options(1)).unwrap();
        let key = PoolKey::new("127.0.0.1", port, "t");

        let held = pool.acquire(&key).await.unwrap();
        let cancelled = tokio::time::timeout(Duration::from_millis(50), pool.acquire(&key)).await;
        assert!(cancelled.is_err());
        assert_eq!(pool.stats(&key).unwrap().waiters, 0);

        drop(held);
        assert_eq!(
            pool.stats(&key),
            Some(BucketStats { count: 1, idle: 1, waiters: 0 })
        );
    }

    #[tokio::test]
    async fn test_dispose_hands_slot_to_waiter() {
        let (port, handshakes) = echo_agent(Duration::ZERO).await;
        let pool = ConnectionPool::new(options(1)).unwrap();
        let key = PoolKey::new("127.0.0.1", port, "t");

        let held = pool.acquire(&key).await.unwrap();
        let waiter = {
            let pool = pool.clone();
            let key = key.clone();
            tokio::spawn(async move { pool.acquire(&key).await.map(|lease| lease.id()) })
        };
        while pool.stats(&key).map(|s| s.waiters) != Some(1) {
            sleep(Duration::from_millis(5)).await;
        }

        let old_id = held.id();
        if let Some(connection) = held.connection.as_ref() {
            connection.close().await;
        }
        drop(held);

        let new_id = waiter.await.unwrap().expect("waiter served");
        assert_ne!(new_id, old_id);
        assert_eq!(handshakes.load(Ordering::SeqCst), 2);
        assert_eq!(pool.stats(&key).unwrap().count, 1);
    }

    #[tokio::test]
    async fn test_failed_handshake_hands_slot_to_waiter() {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let port = listener.local_addr().expect("addr").port();
        let handshakes = Arc::new(AtomicUsize::new(0));

        // First connection stalls, then hangs up before upgrading
        let counter = Arc::clone(&handshakes);
        tokio::spawn(async move {
            let mut first = true;
            while let Ok((tcp, _)) = listener.accept().await {
                if std::mem::take(&mut first) {
                    tokio::spawn(async move {
                        sleep(Duration::from_millis(200)).await;
                        drop(tcp);
                    });
                    continue;
                }
                let counter = Arc::clone(&counter);
                tokio::spawn(async move {
                    let Ok(mut ws) = tokio_tungstenite::accept_async(tcp).await else {
                        return;
                    };
                    counter.fetch_add(1, Ordering::SeqCst);
                    while let Some(Ok(_)) = ws.next().await {}
                });
            }
        });

        let pool = ConnectionPool::new(options(1).with_connect_retries(0)).unwrap();
        let key = PoolKey::new("127.0.0.1", port, "t");

        let opener = {
            let pool = pool.clone();
            let key = key.clone();
            tokio::spawn(async move { pool.acquire(&key).await.map(|_| ()) })
        };
        while pool.stats(&key).map(|s| s.count) != Some(1) {
            sleep(Duration::from_millis(5)).await;
        }

        let waiter = {
            let pool = pool.clone();
            let key = key.clone();
            tokio::spawn(async move {
                let lease = pool.acquire(&key).await?;
                let stats = pool.stats(&key);
                drop(lease);
                Ok::<_, Error>(stats)
            })
        };
        while pool.stats(&key).map(|s| s.waiters) != Some(1) {
            sleep(Duration::from_millis(5)).await;
        }

        assert!(opener.await.unwrap().is_err());

        let served = waiter.await.unwrap().expect("waiter served");
        assert_eq!(served, Some(BucketStats { count: 1, idle: 0, waiters: 0 }));
        assert_eq!(handshakes.load(Ordering::SeqCst), 1);
        assert_eq!(
            pool.stats(&key),
            Some(BucketStats { count: 1, idle: 1, waiters: 0 })
        );
    }

    #[tokio::test]
    async fn test_close_all_cancels_waiters_and_clears_buckets() {
        let (port, _handshakes) = echo_agent(Duration::ZERO).await;
        let pool = ConnectionPool::new(options(1)).unwrap();
        let key = PoolKey::new("127.0.0.1", port, "t");

        let held = pool.acquire(&key).await.unwrap();
        let waiter = {
            let pool = pool.clone();
            let key = key.clone();
            tokio::spawn(async move { pool.acquire(&key).await.map(|_| ()) })
        };
        while pool.stats(&key).map(|s| s.waiters) != Some(1) {
            sleep(Duration::from_millis(5)).await;
        }

        pool.close_all().await;
        assert!(matches!(waiter.await.unwrap(), Err(Error::PoolClosed)));
        assert_eq!(pool.key_count(), 0);

        // In-use connection from the old generation is closed, not pooled
        drop(held);
        assert_eq!(pool.key_count(), 0);
        assert_eq!(pool.total_connections(), 0);
    }

    #[tokio::test]
    async fn test_request_round_trip() {
        let (port, _handshakes) = echo_agent(Duration::ZERO).await;
        let pool = ConnectionPool::new(options(1)).unwrap();
        let key = PoolKey::new("127.0.0.1", port, "t");

        let payload = serde_json::json!({ "action": "get_stats", "n": [1, 2, 3] });
        assert_eq!(pool.request(&key, &payload).await, payload);
    }
}

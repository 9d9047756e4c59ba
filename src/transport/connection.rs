//! One live WebSocket to an agent.
//!
//! A [`Connection`] owns its socket behind an async mutex. The mutex is the
//! exclusive-access primitive: whoever holds it is the sole sender and
//! receiver, for exactly one request/reply pair.
//!
//! # Keepalive
//!
//! When `ping_interval` is configured, the connection spawns a task that
//! pings the socket while it sits idle. The task only ever `try_lock`s the
//! socket and holds it for a short poll window, never across the pong wait,
//! so a request queued behind it stays within its own deadline. A socket
//! serving requests is kept alive by its own traffic. A missing pong or a
//! close frame marks the connection closed, and the pool discards it on the
//! next acquire.

// ============================================================================
// Imports
// ============================================================================

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use tokio::net::TcpStream;
use tokio::time::{MissedTickBehavior, interval, timeout, timeout_at};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tracing::{debug, trace, warn};

use crate::error::{Error, Result};
use crate::identifiers::{ConnectionId, PoolKey};

// ============================================================================
// Types
// ============================================================================

/// Longest a keepalive tick holds the socket while waiting for frames.
const PONG_POLL_WINDOW: Duration = Duration::from_millis(50);

/// Client socket type returned by the handshake.
pub type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Keepalive settings for one connection.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Keepalive {
    pub interval: Duration,
    pub timeout: Duration,
}

/// Shared state of one connection.
struct ConnectionInner {
    id: ConnectionId,
    key: PoolKey,
    socket: tokio::sync::Mutex<WsStream>,
    created_at: Instant,
    last_used_at: Mutex<Instant>,
    /// Last time the peer proved alive (reply or pong).
    last_seen_at: Mutex<Instant>,
    /// Set once the socket is known unusable.
    closed: AtomicBool,
    /// Set once a close handshake has been started.
    close_started: AtomicBool,
    close_timeout: Duration,
}

impl ConnectionInner {
    fn mark_closed(&self, reason: &str) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            debug!(conn_id = %self.id, key = %self.key, reason, "Connection marked closed");
        }
    }
}

// ============================================================================
// InFlight
// ============================================================================

/// Marks the connection closed unless the exchange completes.
///
/// A request future dropped between send and receive leaves the framing
/// position undefined, so the socket must never be reused.
struct InFlight<'a> {
    inner: &'a ConnectionInner,
    armed: bool,
}

impl InFlight<'_> {
    fn finish(mut self) {
        self.armed = false;
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.inner.mark_closed("exchange interrupted");
        }
    }
}

// ============================================================================
// Connection
// ============================================================================

/// A live, token-authenticated WebSocket to one agent.
///
/// Not `Clone`: a connection is either idle in its pool bucket or leased to
/// exactly one request.
pub struct Connection {
    inner: Arc<ConnectionInner>,
}

impl Connection {
    /// Wraps a socket that has already sent its token frame.
    ///
    /// Spawns the keepalive task when `keepalive` is set.
    pub(crate) fn new(
        socket: WsStream,
        key: PoolKey,
        close_timeout: Duration,
        keepalive: Option<Keepalive>,
    ) -> Self {
        let now = Instant::now();
        let inner = Arc::new(ConnectionInner {
            id: ConnectionId::next(),
            key,
            socket: tokio::sync::Mutex::new(socket),
            created_at: now,
            last_used_at: Mutex::new(now),
            last_seen_at: Mutex::new(now),
            closed: AtomicBool::new(false),
            close_started: AtomicBool::new(false),
            close_timeout,
        });

        if let Some(keepalive) = keepalive {
            tokio::spawn(Self::run_keepalive(Arc::downgrade(&inner), keepalive));
        }

        Self { inner }
    }

    /// Returns the connection id.
    #[inline]
    #[must_use]
    pub fn id(&self) -> ConnectionId {
        self.inner.id
    }

    /// Returns the destination key.
    #[inline]
    #[must_use]
    pub fn key(&self) -> &PoolKey {
        &self.inner.key
    }

    /// Returns when the socket was opened.
    #[inline]
    #[must_use]
    pub fn created_at(&self) -> Instant {
        self.inner.created_at
    }

    /// Returns when the last request started.
    #[inline]
    #[must_use]
    pub fn last_used_at(&self) -> Instant {
        *self.inner.last_used_at.lock()
    }

    /// Returns `true` unless the socket has been observed dead or closed.
    #[inline]
    #[must_use]
    pub fn is_open(&self) -> bool {
        !self.inner.closed.load(Ordering::SeqCst)
    }

    /// Sends one request and waits for its reply.
    ///
    /// Holds the exclusive lock for the full send and receive. The deadline
    /// covers waiting for the lock as well. Any transport failure, or a
    /// timeout once the request is on the wire, marks the connection closed.
    ///
    /// # Errors
    ///
    /// - [`Error::ConnectionClosed`] if the connection is closed or the peer closes
    /// - [`Error::RequestTimeout`] if no reply arrives within `request_timeout`
    /// - [`Error::WebSocket`] on socket or protocol failure
    pub async fn exchange(&self, text: String, request_timeout: Duration) -> Result<String> {
        let inner = &*self.inner;

        let result = timeout(request_timeout, async move {
            let mut socket = inner.socket.lock().await;

            if inner.closed.load(Ordering::SeqCst) {
                return Err(Error::connection_closed("connection already closed"));
            }

            *inner.last_used_at.lock() = Instant::now();

            // Dropped armed if the deadline fires mid-exchange
            let in_flight = InFlight { inner, armed: true };

            let reply = async {
                socket.send(Message::Text(text.into())).await?;
                trace!(conn_id = %inner.id, "Request sent");
                Self::next_text(&mut socket).await
            }
            .await;

            match &reply {
                Ok(_) => *inner.last_seen_at.lock() = Instant::now(),
                Err(_) => inner.mark_closed("transport error"),
            }
            in_flight.finish();
            reply
        })
        .await;

        result.unwrap_or_else(|_| {
            debug!(conn_id = %inner.id, "Request deadline elapsed");
            Err(Error::request_timeout(request_timeout.as_millis() as u64))
        })
    }

    /// Closes the socket. Idempotent; errors are ignored.
    pub async fn close(&self) {
        self.inner.mark_closed("close requested");

        if self.inner.close_started.swap(true, Ordering::SeqCst) {
            return;
        }

        let close_timeout = self.inner.close_timeout;
        let closed = timeout(close_timeout, async {
            let mut socket = self.inner.socket.lock().await;
            socket.close(None).await
        })
        .await;

        match closed {
            Ok(Ok(())) => debug!(conn_id = %self.inner.id, "Connection closed"),
            Ok(Err(e)) => debug!(conn_id = %self.inner.id, error = %e, "Close failed"),
            Err(_) => debug!(conn_id = %self.inner.id, "Close timed out"),
        }
    }

    /// Closes the socket on a background task.
    ///
    /// Without a runtime the socket is simply dropped, which still closes
    /// the TCP stream.
    pub(crate) fn close_in_background(self) {
        self.inner.mark_closed("disposed");

        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move { self.close().await });
            }
            Err(_) => {
                trace!(conn_id = %self.inner.id, "No runtime; dropping socket");
            }
        }
    }

    /// Reads frames until a reply text arrives.
    async fn next_text(socket: &mut WsStream) -> Result<String> {
        loop {
            match socket.next().await {
                Some(Ok(Message::Text(text))) => return Ok(text.as_str().to_owned()),

                Some(Ok(Message::Binary(bytes))) => {
                    return String::from_utf8(bytes.to_vec())
                        .map_err(|_| Error::connection_closed("non UTF-8 binary reply"));
                }

                Some(Ok(Message::Close(frame))) => {
                    let detail = frame
                        .map(|f| format!("peer closed ({} {})", u16::from(f.code), f.reason.as_str()))
                        .unwrap_or_else(|| "peer closed".to_string());
                    return Err(Error::connection_closed(detail));
                }

                Some(Err(e)) => return Err(e.into()),

                None => return Err(Error::connection_closed("stream ended")),

                // Ping, Pong, raw frames
                Some(Ok(_)) => {}
            }
        }
    }

    /// Background task that pings the socket while it is idle.
    ///
    /// Each tick holds the socket for at most a short poll window: it drains
    /// frames that arrived while idle, then sends a ping if none is
    /// outstanding. The pong is picked up on a later tick, or proves itself
    /// through any reply read by a request in between.
    async fn run_keepalive(inner: Weak<ConnectionInner>, keepalive: Keepalive) {
        let mut ticker = interval(keepalive.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker.tick().await;

        let poll_window = keepalive.timeout.min(PONG_POLL_WINDOW);
        let mut ping_sent: Option<Instant> = None;

        loop {
            ticker.tick().await;

            let Some(inner) = inner.upgrade() else {
                break;
            };

            if inner.closed.load(Ordering::SeqCst) {
                break;
            }

            // Busy sockets carry their own traffic
            let Ok(mut socket) = inner.socket.try_lock() else {
                continue;
            };

            if let Err(e) = Self::drain_idle(&inner, &mut socket, poll_window).await {
                warn!(conn_id = %inner.id, key = %inner.key, error = %e, "Keepalive failed");
                inner.mark_closed("keepalive failed");
                break;
            }

            let last_seen = *inner.last_seen_at.lock();
            match ping_sent {
                Some(sent) if last_seen >= sent => {
                    trace!(conn_id = %inner.id, "Pong received");
                    ping_sent = None;
                }
                Some(sent) if sent.elapsed() >= keepalive.timeout => {
                    warn!(conn_id = %inner.id, key = %inner.key, "Keepalive pong timed out");
                    inner.mark_closed("pong timeout");
                    break;
                }
                Some(_) => continue,
                None => {}
            }

            match timeout(poll_window, socket.send(Message::Ping(Vec::new().into()))).await {
                Ok(Ok(())) => ping_sent = Some(Instant::now()),
                Ok(Err(e)) => {
                    warn!(conn_id = %inner.id, key = %inner.key, error = %e, "Keepalive ping failed");
                    inner.mark_closed("ping failed");
                    break;
                }
                Err(_) => {
                    warn!(conn_id = %inner.id, key = %inner.key, "Keepalive ping stalled");
                    inner.mark_closed("ping stalled");
                    break;
                }
            }

            // Fast peers answer within the window
            if let Err(e) = Self::drain_idle(&inner, &mut socket, poll_window).await {
                warn!(conn_id = %inner.id, key = %inner.key, error = %e, "Keepalive failed");
                inner.mark_closed("keepalive failed");
                break;
            }
            if ping_sent.is_some_and(|sent| *inner.last_seen_at.lock() >= sent) {
                trace!(conn_id = %inner.id, "Pong received");
                ping_sent = None;
            }
        }

        trace!("Keepalive task terminated");
    }

    /// Reads whatever the peer sent while idle, for at most `window`.
    ///
    /// Pongs update `last_seen_at`. A close or a read error is returned.
    async fn drain_idle(inner: &ConnectionInner, socket: &mut WsStream, window: Duration) -> Result<()> {
        let deadline = tokio::time::Instant::now() + window;

        loop {
            let frame = match timeout_at(deadline, socket.next()).await {
                Ok(frame) => frame,
                Err(_) => return Ok(()),
            };

            match frame {
                Some(Ok(Message::Pong(_))) => *inner.last_seen_at.lock() = Instant::now(),
                Some(Ok(Message::Close(_))) | None => {
                    return Err(Error::connection_closed("peer closed while idle"));
                }
                Some(Ok(Message::Text(text))) => {
                    warn!(len = text.as_str().len(), "Discarding unsolicited frame on idle socket");
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => return Err(e.into()),
            }
        }
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.inner.id)
            .field("key", &self.inner.key)
            .field("open", &self.is_open())
            .finish_non_exhaustive()
    }
}

// ============================================================================
// Tests
// ============================================================================

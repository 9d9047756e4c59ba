//! In-process mock agent shared by the integration tests.
//!
//! The agent accepts `ws://127.0.0.1:<port>`, records the token frame, and
//! echoes every JSON request back. Request fields steer it:
//!
//! - `"sleep_ms": n` - wait `n` milliseconds before replying
//! - `"reply_raw": "text"` - reply with `text` verbatim instead of echoing
//! - `"go_silent": true` - after replying, stop reading the socket (no more
//!   replies, no pongs) while keeping it open

#![allow(dead_code)]

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde_json::Value;
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tokio_tungstenite::tungstenite::Message;
use tracing_subscriber::EnvFilter;

use ws_agent_pool::{BackoffPolicy, PoolKey, PoolOptions};

/// Token every test agent expects.
pub const TOKEN: &str = "t";

/// Installs a test subscriber honoring `RUST_LOG`.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Options tuned for fast tests: no keepalive, short deadlines.
pub fn test_options(max_per_key: usize) -> PoolOptions {
    PoolOptions::new()
        .with_max_per_key(max_per_key)
        .with_open_timeout(Duration::from_secs(2))
        .with_close_timeout(Duration::from_millis(500))
        .with_acquire_timeout(Duration::from_secs(5))
        .with_backoff(BackoffPolicy::new(0.05, 2.0, 0.5, 0.0))
        .without_keepalive()
}

/// A running mock agent.
pub struct MockAgent {
    pub port: u16,
    accepts: Arc<AtomicUsize>,
    handshakes: Arc<AtomicUsize>,
    in_flight: Arc<AtomicUsize>,
    max_in_flight: Arc<AtomicUsize>,
    tokens: Arc<Mutex<Vec<String>>>,
    kill: broadcast::Sender<()>,
}

impl MockAgent {
    /// Starts an agent that accepts every connection.
    pub async fn start() -> Self {
        Self::start_refusing(0).await
    }

    /// Starts an agent that drops the first `refuse` TCP connections
    /// before the WebSocket upgrade.
    pub async fn start_refusing(refuse: usize) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let port = listener.local_addr().expect("addr").port();
        let (kill, _) = broadcast::channel(4);

        let agent = Self {
            port,
            accepts: Arc::new(AtomicUsize::new(0)),
            handshakes: Arc::new(AtomicUsize::new(0)),
            in_flight: Arc::new(AtomicUsize::new(0)),
            max_in_flight: Arc::new(AtomicUsize::new(0)),
            tokens: Arc::new(Mutex::new(Vec::new())),
            kill,
        };

        let accepts = Arc::clone(&agent.accepts);
        let handshakes = Arc::clone(&agent.handshakes);
        let in_flight = Arc::clone(&agent.in_flight);
        let max_in_flight = Arc::clone(&agent.max_in_flight);
        let tokens = Arc::clone(&agent.tokens);
        let kill = agent.kill.clone();

        tokio::spawn(async move {
            while let Ok((tcp, _)) = listener.accept().await {
                if accepts.fetch_add(1, Ordering::SeqCst) < refuse {
                    drop(tcp);
                    continue;
                }

                let handshakes = Arc::clone(&handshakes);
                let in_flight = Arc::clone(&in_flight);
                let max_in_flight = Arc::clone(&max_in_flight);
                let tokens = Arc::clone(&tokens);
                let mut kill = kill.subscribe();

                tokio::spawn(async move {
                    let Ok(mut ws) = tokio_tungstenite::accept_async(tcp).await else {
                        return;
                    };
                    handshakes.fetch_add(1, Ordering::SeqCst);

                    match ws.next().await {
                        Some(Ok(Message::Text(token))) => {
                            tokens.lock().push(token.as_str().to_owned());
                        }
                        _ => return,
                    }

                    loop {
                        let msg = tokio::select! {
                            msg = ws.next() => msg,
                            // Drop the socket without a close frame
                            _ = kill.recv() => return,
                        };

                        let Some(Ok(Message::Text(text))) = msg else {
                            if matches!(msg, Some(Ok(_))) {
                                continue;
                            }
                            return;
                        };

                        let now = in_flight.fetch_add(1, Ordering::SeqCst) + 1;
                        max_in_flight.fetch_max(now, Ordering::SeqCst);

                        let reply = respond(text.as_str()).await;
                        in_flight.fetch_sub(1, Ordering::SeqCst);

                        if ws.send(Message::Text(reply.into())).await.is_err() {
                            return;
                        }

                        if goes_silent(text.as_str()) {
                            let _ = kill.recv().await;
                            return;
                        }
                    }
                });
            }
        });

        agent
    }

    /// Pool key for this agent.
    pub fn key(&self) -> PoolKey {
        PoolKey::new("127.0.0.1", self.port, TOKEN)
    }

    /// TCP connections accepted, including refused ones.
    pub fn accepts(&self) -> usize {
        self.accepts.load(Ordering::SeqCst)
    }

    /// Completed WebSocket handshakes.
    pub fn handshakes(&self) -> usize {
        self.handshakes.load(Ordering::SeqCst)
    }

    /// Highest number of requests the agent was serving at once.
    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    /// Token frames received, in order.
    pub fn tokens(&self) -> Vec<String> {
        self.tokens.lock().clone()
    }

    /// Drops every open socket without a close handshake.
    pub fn kill_connections(&self) {
        let _ = self.kill.send(());
    }
}

/// Builds the reply for one request frame.
async fn respond(text: &str) -> String {
    let Ok(request) = serde_json::from_str::<Value>(text) else {
        return text.to_string();
    };

    if let Some(ms) = request.get("sleep_ms").and_then(Value::as_u64) {
        tokio::time::sleep(Duration::from_millis(ms)).await;
    }

    match request.get("reply_raw").and_then(Value::as_str) {
        Some(raw) => raw.to_string(),
        None => text.to_string(),
    }
}

/// Whether the request asks the agent to stop reading.
fn goes_silent(text: &str) -> bool {
    serde_json::from_str::<Value>(text)
        .ok()
        .and_then(|request| request.get("go_silent").and_then(Value::as_bool))
        .unwrap_or(false)
}

/// A local port with nothing listening on it.
pub fn closed_port() -> u16 {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").expect("bind");
    let port = listener.local_addr().expect("addr").port();
    drop(listener);
    port
}

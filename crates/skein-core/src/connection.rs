//! Outbound connection to one provider address.
//!
//! A background driver task owns the socket. It connects, runs a session
//! (one reader loop plus one writer loop), and on any failure goes back to
//! `Connecting` and tries again after the configured delay. Callers never
//! touch the socket: they register in the [`CorrelationTable`], queue an
//! encoded frame for the writer, and wait on their own [`PendingCall`].
//!
//! ```text
//! Disconnected --open--> Connecting <--failure/peer close-- Connected
//!                            |  ^                               ^
//!                            |  +----- retry after delay        |
//!                            +-------------- success -----------+
//! any state --close--> Closed
//! ```
//!
//! [`PendingCall`]: crate::correlation::PendingCall

use crate::codec::{write_frame, FrameCodec, FrameReader, Message, Request, Response};
use crate::config::ConnectionConfig;
use crate::correlation::CorrelationTable;
use crate::error::{RpcError, Result};
use bytes::Bytes;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Lifecycle of a [`Connection`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Created, `open` not yet called.
    Disconnected,
    /// Connect attempt in progress or waiting to retry.
    Connecting,
    /// Session established; calls may be sent.
    Connected,
    /// Torn down; terminal.
    Closed,
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConnectionState::Disconnected => write!(f, "DISCONNECTED"),
            ConnectionState::Connecting => write!(f, "CONNECTING"),
            ConnectionState::Connected => write!(f, "CONNECTED"),
            ConnectionState::Closed => write!(f, "CLOSED"),
        }
    }
}

/// Handle to one remote endpoint. Cheap to clone; all clones share state.
///
/// Dropping the last clone closes the connection.
#[derive(Debug, Clone)]
pub struct Connection {
    inner: Arc<ConnectionInner>,
    _guard: Arc<CloseOnDrop>,
}

/// Shared by every handle clone but not by the driver task, so its drop
/// marks the moment no caller can use the connection any more.
#[derive(Debug)]
struct CloseOnDrop(Arc<ConnectionInner>);

impl Drop for CloseOnDrop {
    fn drop(&mut self) {
        if self.0.shutdown() {
            debug!("Last handle to {} dropped; closing", self.0.address);
        }
    }
}

#[derive(Debug)]
struct ConnectionInner {
    address: String,
    config: ConnectionConfig,
    codec: FrameCodec,
    table: CorrelationTable,
    state_tx: watch::Sender<ConnectionState>,
    /// Present only while `Connected`.
    outbound: Mutex<Option<mpsc::Sender<Bytes>>>,
    shutdown_tx: watch::Sender<bool>,
}

/// Why a session ended.
enum SessionEnd {
    Shutdown,
    Lost(String),
}

impl Connection {
    /// Create a connection to `address` (`host:port`) without connecting.
    pub fn new(address: impl Into<String>, config: ConnectionConfig) -> Self {
        let address = address.into();
        let (state_tx, _) = watch::channel(ConnectionState::Disconnected);
        let (shutdown_tx, _) = watch::channel(false);
        let inner = Arc::new(ConnectionInner {
            codec: FrameCodec::new(config.max_frame_len),
            table: CorrelationTable::new(address.clone()),
            address,
            config,
            state_tx,
            outbound: Mutex::new(None),
            shutdown_tx,
        });
        Self {
            _guard: Arc::new(CloseOnDrop(Arc::clone(&inner))),
            inner,
        }
    }

    /// Create and immediately open a connection.
    pub fn connect(address: impl Into<String>, config: ConnectionConfig) -> Self {
        let conn = Self::new(address, config);
        conn.open();
        conn
    }

    /// Start the background driver. Idempotent; a closed connection stays
    /// closed. Must be called within a tokio runtime.
    pub fn open(&self) {
        let started = self.inner.state_tx.send_if_modified(|state| {
            if *state == ConnectionState::Disconnected {
                *state = ConnectionState::Connecting;
                true
            } else {
                false
            }
        });
        if started {
            tokio::spawn(Arc::clone(&self.inner).drive());
        }
    }

    /// Tear the connection down. Outstanding calls fail with a
    /// connectivity error.
    pub fn close(&self) {
        if self.inner.shutdown() {
            info!("Closing connection to {}", self.inner.address);
        }
    }

    /// Remote `host:port`.
    pub fn address(&self) -> &str {
        &self.inner.address
    }

    /// Current lifecycle state.
    pub fn state(&self) -> ConnectionState {
        *self.inner.state_tx.borrow()
    }

    /// Whether calls can be sent right now.
    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    /// Number of calls waiting for a response.
    pub fn pending_calls(&self) -> usize {
        self.inner.table.len()
    }

    /// Whether a call with this id is still outstanding.
    pub fn is_pending(&self, id: &str) -> bool {
        self.inner.table.contains(id)
    }

    /// Wait until the connection reaches `target`, up to `timeout`.
    pub async fn wait_for_state(&self, target: ConnectionState, timeout: Duration) -> bool {
        let mut rx = self.inner.state_tx.subscribe();
        tokio::time::timeout(timeout, rx.wait_for(|state| *state == target))
            .await
            .map(|res| res.is_ok())
            .unwrap_or(false)
    }

    /// Send `request` and wait up to `timeout` for its response.
    ///
    /// Fails immediately with a connectivity error unless `Connected`.
    pub async fn send(&self, request: Request, timeout: Duration) -> Result<Response> {
        let sender = self.inner.outbound_sender().ok_or_else(|| {
            RpcError::connectivity(
                &self.inner.address,
                format!("connection is {}", self.state()),
            )
        })?;

        let id = request.id.clone();
        let frame = self.inner.codec.encode(&Message::Request(request))?;

        // Register before writing so a fast response always finds its caller.
        let call = self.inner.table.register(&id, timeout)?;

        match tokio::time::timeout_at(call.deadline(), sender.send(frame)).await {
            Ok(Ok(())) => {}
            Ok(Err(_)) => {
                return Err(RpcError::connectivity(
                    &self.inner.address,
                    "connection lost before the request was written",
                ))
            }
            Err(_) => {
                return Err(RpcError::Timeout {
                    request_id: id,
                    after: timeout,
                })
            }
        }

        debug!("Request {} queued to {}", id, self.inner.address);
        call.wait().await
    }
}

impl ConnectionInner {
    /// Signal the driver to stop. Returns false if already signalled.
    fn shutdown(&self) -> bool {
        let was_shut = self.shutdown_tx.send_replace(true);
        // Never opened: no driver to observe the signal.
        self.state_tx.send_if_modified(|state| {
            if *state == ConnectionState::Disconnected {
                *state = ConnectionState::Closed;
                true
            } else {
                false
            }
        });
        !was_shut
    }

    fn outbound_sender(&self) -> Option<mpsc::Sender<Bytes>> {
        self.outbound
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn set_outbound(&self, sender: Option<mpsc::Sender<Bytes>>) {
        *self.outbound.lock().unwrap_or_else(PoisonError::into_inner) = sender;
    }

    fn set_state(&self, state: ConnectionState) {
        self.state_tx.send_replace(state);
    }

    async fn drive(self: Arc<Self>) {
        let mut shutdown = self.shutdown_tx.subscribe();
        let mut failures: u32 = 0;

        loop {
            if *shutdown.borrow() {
                break;
            }
            self.set_state(ConnectionState::Connecting);

            let attempt = tokio::time::timeout(
                self.config.connect_timeout,
                TcpStream::connect(self.address.as_str()),
            );
            let outcome = tokio::select! {
                _ = shutdown.changed() => break,
                outcome = attempt => outcome,
            };

            let stream = match outcome {
                Ok(Ok(stream)) => stream,
                Ok(Err(e)) => {
                    failures = self.retry_after_failure(failures, &e.to_string(), &mut shutdown).await;
                    continue;
                }
                Err(_) => {
                    failures = self
                        .retry_after_failure(failures, "connect timed out", &mut shutdown)
                        .await;
                    continue;
                }
            };

            if let Err(e) = stream.set_nodelay(true) {
                debug!("Failed to set TCP_NODELAY for {}: {}", self.address, e);
            }
            info!("Connection to {} established", self.address);

            let started = Instant::now();
            let end = self.run_session(stream, &mut shutdown).await;
            self.set_outbound(None);

            match end {
                SessionEnd::Shutdown => break,
                SessionEnd::Lost(reason) => {
                    warn!("Connection to {} lost: {}; reconnecting", self.address, reason);
                    self.set_state(ConnectionState::Connecting);
                    if self.config.fail_pending_on_disconnect {
                        let failed = self.table.fail_all(|| {
                            RpcError::connectivity(&self.address, "connection lost")
                        });
                        if failed > 0 {
                            debug!("Failed {} pending calls on {}", failed, self.address);
                        }
                    }
                    // A session that dies right away counts as a failed
                    // attempt so a peer that accepts and drops cannot spin us.
                    if started.elapsed() < self.config.reconnect.base_delay {
                        failures = self.retry_after_failure(failures, &reason, &mut shutdown).await;
                    } else {
                        failures = 0;
                    }
                }
            }
        }

        self.set_outbound(None);
        self.set_state(ConnectionState::Closed);
        let failed = self
            .table
            .fail_all(|| RpcError::connectivity(&self.address, "connection closed"));
        info!(
            "Connection to {} closed ({} pending calls failed)",
            self.address, failed
        );
    }

    /// Sleep for the reconnect delay unless shut down first. Returns the
    /// updated consecutive failure count.
    async fn retry_after_failure(
        &self,
        failures: u32,
        reason: &str,
        shutdown: &mut watch::Receiver<bool>,
    ) -> u32 {
        let delay = self.config.reconnect.delay_for(failures);
        warn!(
            "Connect to {} failed: {}. Retrying in {:?}",
            self.address, reason, delay
        );
        tokio::select! {
            _ = shutdown.changed() => {}
            _ = tokio::time::sleep(delay) => {}
        }
        failures.saturating_add(1)
    }

    async fn run_session(
        &self,
        stream: TcpStream,
        shutdown: &mut watch::Receiver<bool>,
    ) -> SessionEnd {
        let (read_half, write_half) = stream.into_split();
        let (tx, rx) = mpsc::channel::<Bytes>(self.config.outbound_queue.max(1));

        self.set_outbound(Some(tx));
        self.set_state(ConnectionState::Connected);

        let mut reader = FrameReader::new(read_half, self.codec);
        let writer = write_loop(write_half, rx);
        tokio::pin!(writer);

        loop {
            tokio::select! {
                _ = shutdown.changed() => return SessionEnd::Shutdown,
                result = &mut writer => {
                    return SessionEnd::Lost(match result {
                        Ok(()) => "writer stopped".to_string(),
                        Err(e) => format!("write failed: {}", e),
                    });
                }
                frame = reader.next_frame() => match frame {
                    Ok(Some(payload)) => self.handle_inbound(&payload),
                    Ok(None) => return SessionEnd::Lost("peer closed the connection".to_string()),
                    Err(e) => return SessionEnd::Lost(e.to_string()),
                },
            }
        }
    }

    fn handle_inbound(&self, payload: &[u8]) {
        match Message::from_slice(payload) {
            Ok(Message::Response(response)) => {
                let id = response.id.clone();
                if !self.table.resolve(response) {
                    debug!(
                        "Dropping response {} from {}: no caller waiting",
                        id, self.address
                    );
                }
            }
            Ok(Message::Request(request)) => {
                debug!(
                    "Ignoring request {} sent by provider {}",
                    request.id, self.address
                );
            }
            Err(e) => warn!("Undecodable frame from {}: {}", self.address, e),
        }
    }
}

async fn write_loop(mut writer: OwnedWriteHalf, mut rx: mpsc::Receiver<Bytes>) -> Result<()> {
    while let Some(frame) = rx.recv().await {
        write_frame(&mut writer, &frame).await?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reconnect::ReconnectConfig;
    use serde_json::json;
    use tokio::io::AsyncReadExt;
    use tokio::net::TcpListener;

    fn fast_config() -> ConnectionConfig {
        ConnectionConfig::default()
            .with_connect_timeout(Duration::from_millis(500))
            .with_reconnect(ReconnectConfig::fixed(Duration::from_millis(50)))
    }

    /// Accepts one connection and answers every request with its own params.
    async fn spawn_echo_peer() -> (String, tokio::task::JoinHandle<()>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let handle = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let (read_half, mut write_half) = stream.into_split();
            let codec = FrameCodec::default();
            let mut reader = FrameReader::new(read_half, codec);
            while let Ok(Some(payload)) = reader.next_frame().await {
                if let Ok(Message::Request(req)) = Message::from_slice(&payload) {
                    let resp = Response::success(req.id, json!(req.params));
                    let frame = codec.encode(&resp.into()).unwrap();
                    if write_frame(&mut write_half, &frame).await.is_err() {
                        break;
                    }
                }
            }
        });
        (addr, handle)
    }

    #[tokio::test]
    async fn test_send_before_connected_fails_fast() {
        let conn = Connection::new("127.0.0.1:1", fast_config());
        let request = Request::new("r1", "svc", "m(0)", vec![]);

        let err = conn.send(request, Duration::from_secs(5)).await.unwrap_err();
        assert!(matches!(err, RpcError::Connectivity { .. }));
        assert_eq!(conn.pending_calls(), 0);
    }

    #[tokio::test]
    async fn test_round_trip_over_tcp() {
        let (addr, _peer) = spawn_echo_peer().await;
        let conn = Connection::connect(addr, fast_config());
        assert!(
            conn.wait_for_state(ConnectionState::Connected, Duration::from_secs(5))
                .await
        );

        let request = Request::new("r1", "svc", "m(1)", vec![json!("hello")]);
        let response = conn.send(request, Duration::from_secs(5)).await.unwrap();

        assert_eq!(response.id, "r1");
        assert_eq!(response.result, json!(["hello"]));
        assert_eq!(conn.pending_calls(), 0);
        conn.close();
    }

    #[tokio::test]
    async fn test_unreachable_address_keeps_retrying() {
        // Reserve a port, then free it so nothing is listening.
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        drop(listener);

        let conn = Connection::connect(addr, fast_config());
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(conn.state(), ConnectionState::Connecting);

        conn.close();
        assert!(
            conn.wait_for_state(ConnectionState::Closed, Duration::from_secs(5))
                .await
        );
    }

    #[tokio::test]
    async fn test_reconnects_after_peer_restart() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let conn = Connection::connect(addr.to_string(), fast_config());
        let (first, _) = listener.accept().await.unwrap();
        assert!(
            conn.wait_for_state(ConnectionState::Connected, Duration::from_secs(5))
                .await
        );

        drop(first);
        let (_second, _) = tokio::time::timeout(Duration::from_secs(5), listener.accept())
            .await
            .expect("connection should come back")
            .unwrap();
        assert!(
            conn.wait_for_state(ConnectionState::Connected, Duration::from_secs(5))
                .await
        );
        conn.close();
    }

    #[tokio::test]
    async fn test_pending_call_rides_out_disconnect_by_default() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let conn = Connection::connect(addr.to_string(), fast_config());
        let (peer, _) = listener.accept().await.unwrap();
        assert!(
            conn.wait_for_state(ConnectionState::Connected, Duration::from_secs(5))
                .await
        );

        let sender = conn.clone();
        let call = tokio::spawn(async move {
            sender
                .send(Request::new("r1", "svc", "m(0)", vec![]), Duration::from_millis(400))
                .await
        });
        tokio::time::sleep(Duration::from_millis(50)).await;
        drop(peer);

        let err = call.await.unwrap().unwrap_err();
        assert!(matches!(err, RpcError::Timeout { .. }));
        assert!(!conn.is_pending("r1"));
        conn.close();
    }

    #[tokio::test]
    async fn test_pending_call_fails_fast_when_configured() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let config = fast_config().with_fail_pending_on_disconnect(true);
        let conn = Connection::connect(addr.to_string(), config);
        let (peer, _) = listener.accept().await.unwrap();
        assert!(
            conn.wait_for_state(ConnectionState::Connected, Duration::from_secs(5))
                .await
        );

        let sender = conn.clone();
        let call = tokio::spawn(async move {
            sender
                .send(Request::new("r1", "svc", "m(0)", vec![]), Duration::from_secs(10))
                .await
        });
        tokio::time::sleep(Duration::from_millis(50)).await;
        drop(peer);

        let err = tokio::time::timeout(Duration::from_secs(5), call)
            .await
            .expect("call should fail before its timeout")
            .unwrap()
            .unwrap_err();
        assert!(matches!(err, RpcError::Connectivity { .. }));
        conn.close();
    }

    #[tokio::test]
    async fn test_dropping_last_handle_closes_socket() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let conn = Connection::connect(addr.to_string(), fast_config());
        let (mut peer, _) = listener.accept().await.unwrap();
        assert!(
            conn.wait_for_state(ConnectionState::Connected, Duration::from_secs(5))
                .await
        );

        let clone = conn.clone();
        drop(conn);
        assert!(clone.is_connected());
        drop(clone);

        let mut buf = [0u8; 1];
        let read = tokio::time::timeout(Duration::from_secs(2), peer.read(&mut buf))
            .await
            .expect("socket should close once every handle is gone")
            .unwrap();
        assert_eq!(read, 0);

        // No reconnect attempt follows.
        assert!(
            tokio::time::timeout(Duration::from_millis(300), listener.accept())
                .await
                .is_err()
        );
    }

    #[tokio::test]
    async fn test_close_before_open_is_terminal() {
        let conn = Connection::new("127.0.0.1:1", fast_config());
        conn.close();
        assert_eq!(conn.state(), ConnectionState::Closed);

        conn.open();
        assert_eq!(conn.state(), ConnectionState::Closed);
    }
}

//! TCP provider: accepts consumer connections and dispatches their requests.
//!
//! The accept loop and each connection handler run on the caller's tokio
//! runtime and only do socket work. Decoded requests go to the
//! [`WorkerPool`], whose completion step queues the encoded response on the
//! connection's writer task, so a slow method never stalls reading.
//!
//! # Lifecycle
//!
//! [`Provider::start`] binds, registers the advertised address under every
//! service with discovery, and returns a [`ProviderHandle`].
//! [`ProviderHandle::stop`] unregisters, stops accepting, drains the worker
//! pool and then closes the remaining connections.

use crate::codec::{write_frame, FrameCodec, FrameReader, Message, Request, Response};
use crate::config::ProviderConfig;
use crate::discovery::Discovery;
use crate::dispatcher::{MethodRegistry, ServiceDefinition};
use crate::error::Result;
use crate::naming;
use crate::worker::WorkerPool;
use bytes::Bytes;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, error, info, warn};

/// Frames queued per connection before response writers wait.
const RESPONSE_QUEUE: usize = 256;

/// How long a closing connection may spend flushing queued responses.
const FLUSH_TIMEOUT: Duration = Duration::from_secs(5);

/// Handle to a running provider. Dropping it stops accepting and closes
/// connections but cannot unregister from discovery; call
/// [`stop`](Self::stop) for a clean exit.
pub struct ProviderHandle {
    local_addr: SocketAddr,
    address: String,
    services: Vec<String>,
    discovery: Arc<dyn Discovery>,
    workers: WorkerPool,
    active_connections: Arc<AtomicUsize>,
    shutdown_tx: Option<oneshot::Sender<()>>,
    conn_shutdown_tx: watch::Sender<bool>,
    task_handle: Option<tokio::task::JoinHandle<()>>,
}

impl std::fmt::Debug for ProviderHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProviderHandle")
            .field("local_addr", &self.local_addr)
            .field("address", &self.address)
            .field("services", &self.services)
            .finish()
    }
}

impl ProviderHandle {
    /// Socket address the listener is bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// `host:port` published to discovery.
    pub fn address(&self) -> &str {
        &self.address
    }

    /// Service names registered with discovery.
    pub fn services(&self) -> &[String] {
        &self.services
    }

    /// Consumer connections currently open.
    pub fn active_connections(&self) -> usize {
        self.active_connections.load(Ordering::Relaxed)
    }

    /// Unregister from discovery, stop accepting, drain in-flight
    /// invocations, then close every connection.
    ///
    /// All steps run even if unregistering fails; the first discovery error
    /// is returned.
    pub async fn stop(&mut self) -> Result<()> {
        let mut first_err = None;
        for service in &self.services {
            if let Err(e) = self.discovery.unregister(service, &self.address).await {
                warn!("Failed to unregister {} at {}: {}", service, self.address, e);
                first_err.get_or_insert(e);
            }
        }

        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        if !self.workers.shutdown().await {
            warn!("Provider {} stopped with invocations still running", self.address);
        }
        let _ = self.conn_shutdown_tx.send(true);
        if let Some(handle) = self.task_handle.take() {
            let _ = handle.await;
        }
        info!("Provider {} stopped", self.address);

        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

impl Drop for ProviderHandle {
    fn drop(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        let _ = self.conn_shutdown_tx.send(true);
        if let Some(handle) = self.task_handle.take() {
            handle.abort();
        }
    }
}

/// Everything a connection handler needs.
struct ConnectionContext {
    registry: Arc<MethodRegistry>,
    workers: WorkerPool,
    codec: FrameCodec,
}

/// Provider entry point.
pub struct Provider;

impl Provider {
    /// Build a registry from `definitions` at `config.version` and start it.
    pub async fn serve(
        config: ProviderConfig,
        definitions: Vec<ServiceDefinition>,
        discovery: Arc<dyn Discovery>,
    ) -> Result<ProviderHandle> {
        let registry = MethodRegistry::build(&config.version, definitions)?;
        Self::start(config, registry, discovery).await
    }

    /// Bind, register every service of `registry` and start serving.
    pub async fn start(
        config: ProviderConfig,
        registry: MethodRegistry,
        discovery: Arc<dyn Discovery>,
    ) -> Result<ProviderHandle> {
        let workers = WorkerPool::new(config.worker.clone())?;
        let listener =
            TcpListener::bind((config.bind_host.as_str(), config.port)).await?;
        let local_addr = listener.local_addr()?;
        let address = advertised_address(&config, local_addr);

        info!("Provider listening on {} (advertised as {})", local_addr, address);

        let services: Vec<String> = registry.services().map(str::to_string).collect();
        for service in &services {
            discovery.register(service, &address).await?;
            info!("Registered {} at {}", service, address);
        }

        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
        let (conn_shutdown_tx, conn_shutdown_rx) = watch::channel(false);
        let active_connections = Arc::new(AtomicUsize::new(0));

        let context = Arc::new(ConnectionContext {
            registry: Arc::new(registry),
            workers: workers.clone(),
            codec: FrameCodec::new(config.max_frame_len),
        });

        let task_handle = tokio::spawn(Self::accept_loop(
            listener,
            context,
            config.max_connections,
            shutdown_rx,
            conn_shutdown_rx,
            Arc::clone(&active_connections),
        ));

        Ok(ProviderHandle {
            local_addr,
            address,
            services,
            discovery,
            workers,
            active_connections,
            shutdown_tx: Some(shutdown_tx),
            conn_shutdown_tx,
            task_handle: Some(task_handle),
        })
    }

    async fn accept_loop(
        listener: TcpListener,
        context: Arc<ConnectionContext>,
        max_connections: usize,
        mut shutdown_rx: oneshot::Receiver<()>,
        conn_shutdown_rx: watch::Receiver<bool>,
        active_connections: Arc<AtomicUsize>,
    ) {
        loop {
            tokio::select! {
                _ = &mut shutdown_rx => {
                    info!("Provider no longer accepting connections");
                    break;
                }
                accept_result = listener.accept() => {
                    match accept_result {
                        Ok((stream, peer_addr)) => {
                            let current = active_connections.load(Ordering::Relaxed);
                            if current >= max_connections {
                                warn!(
                                    "Rejecting connection from {}: at max capacity ({})",
                                    peer_addr, max_connections
                                );
                                continue;
                            }

                            active_connections.fetch_add(1, Ordering::Relaxed);
                            let context = Arc::clone(&context);
                            let conns = Arc::clone(&active_connections);
                            let mut conn_shutdown = conn_shutdown_rx.clone();

                            tokio::spawn(async move {
                                debug!("Consumer connected from {}", peer_addr);
                                if let Err(e) =
                                    Self::handle_connection(stream, &context, &mut conn_shutdown).await
                                {
                                    debug!("Connection {} ended: {}", peer_addr, e);
                                }
                                conns.fetch_sub(1, Ordering::Relaxed);
                            });
                        }
                        Err(e) => {
                            error!("Accept error: {}", e);
                        }
                    }
                }
            }
        }
    }

    async fn handle_connection(
        stream: TcpStream,
        context: &ConnectionContext,
        shutdown_rx: &mut watch::Receiver<bool>,
    ) -> Result<()> {
        if let Err(e) = stream.set_nodelay(true) {
            debug!("Failed to set TCP_NODELAY: {}", e);
        }
        let (read_half, write_half) = stream.into_split();
        let (tx, rx) = mpsc::channel::<Bytes>(RESPONSE_QUEUE);
        let mut writer = tokio::spawn(write_loop(write_half, rx, shutdown_rx.clone()));
        let mut reader = FrameReader::new(read_half, context.codec);

        let outcome = loop {
            if *shutdown_rx.borrow() {
                break Ok(());
            }
            let payload = tokio::select! {
                result = reader.next_frame() => match result {
                    Ok(Some(payload)) => payload,
                    Ok(None) => break Ok(()),
                    // Oversized or truncated frames end the connection.
                    Err(e) => break Err(e),
                },
                _ = shutdown_rx.changed() => break Ok(()),
            };

            match Message::from_slice(&payload) {
                Ok(Message::Request(request)) => Self::submit(context, request, &tx).await,
                Ok(Message::Response(response)) => {
                    debug!("Ignoring response {} sent by a consumer", response.id);
                }
                Err(e) => warn!("Dropping undecodable frame: {}", e),
            }
        };

        drop(tx);
        if tokio::time::timeout(FLUSH_TIMEOUT, &mut writer).await.is_err() {
            writer.abort();
        }
        outcome
    }

    /// Hand one request to the worker pool; answer directly if it is shut.
    async fn submit(
        context: &ConnectionContext,
        request: Request,
        tx: &mpsc::Sender<Bytes>,
    ) {
        let id = request.id.clone();
        let registry = Arc::clone(&context.registry);
        let codec = context.codec;
        let reply = tx.clone();

        let submitted = context.workers.execute(
            move || registry.dispatch(request),
            move |response| async move {
                send_response(codec, &reply, response).await;
            },
        );
        if let Err(e) = submitted {
            debug!("Rejecting request {}: {}", id, e);
            send_response(codec, tx, Response::from_error(id, &e)).await;
        }
    }
}

async fn send_response(codec: FrameCodec, tx: &mpsc::Sender<Bytes>, response: Response) {
    let id = response.id.clone();
    match codec.encode(&Message::Response(response)) {
        Ok(frame) => {
            if tx.send(frame).await.is_err() {
                debug!("Connection gone before response {} was written", id);
            }
        }
        Err(e) => error!("Failed to encode response {}: {}", id, e),
    }
}

/// Write queued responses until every sender is gone, or until shutdown,
/// after which only frames already queued are flushed.
async fn write_loop(
    mut writer: OwnedWriteHalf,
    mut rx: mpsc::Receiver<Bytes>,
    mut shutdown_rx: watch::Receiver<bool>,
) -> Result<()> {
    loop {
        if *shutdown_rx.borrow() {
            break;
        }
        tokio::select! {
            frame = rx.recv() => match frame {
                Some(frame) => write_frame(&mut writer, &frame).await?,
                None => return Ok(()),
            },
            _ = shutdown_rx.changed() => break,
        }
    }
    while let Ok(frame) = rx.try_recv() {
        write_frame(&mut writer, &frame).await?;
    }
    Ok(())
}

/// Address published to discovery for a listener bound at `local`.
fn advertised_address(config: &ProviderConfig, local: SocketAddr) -> String {
    let host = match &config.advertise_host {
        Some(host) => host.clone(),
        None => {
            let ip = if local.ip().is_unspecified() {
                IpAddr::V4(Ipv4Addr::LOCALHOST)
            } else {
                local.ip()
            };
            match ip {
                IpAddr::V6(v6) => format!("[{}]", v6),
                IpAddr::V4(v4) => v4.to_string(),
            }
        }
    };
    naming::address(&host, local.port())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::WorkerPoolConfig;
    use crate::discovery::MemoryDiscovery;

    use serde_json::json;

    fn test_config() -> ProviderConfig {
        ProviderConfig::default()
            .with_bind_host("127.0.0.1")
            .with_port(0)
            .with_worker(WorkerPoolConfig::default().with_core_size(2).with_max_size(8))
    }

    fn echo_registry() -> MethodRegistry {
        let echo = ServiceDefinition::new("demo.Echo")
            .method("echo", 1, |params| Ok(params[0].clone()))
            .method("sleep", 1, |params| {
                let ms = params[0].as_u64().unwrap_or(0);
                std::thread::sleep(Duration::from_millis(ms));
                Ok(json!(ms))
            });
        MethodRegistry::build("1.0", vec![echo]).unwrap()
    }

    async fn roundtrip(stream: &mut TcpStream, request: Request) -> Response {
        let codec = FrameCodec::default();
        let frame = codec.encode(&Message::Request(request)).unwrap();
        let (read_half, mut write_half) = stream.split();
        write_frame(&mut write_half, &frame).await.unwrap();
        let mut reader = FrameReader::new(read_half, codec);
        let payload = reader.next_frame().await.unwrap().unwrap();
        match Message::from_slice(&payload).unwrap() {
            Message::Response(response) => response,
            other => panic!("expected response, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_start_registers_and_stop_unregisters() {
        let discovery = MemoryDiscovery::new();
        let mut handle = Provider::start(test_config(), echo_registry(), Arc::new(discovery.clone()))
            .await
            .unwrap();

        assert_eq!(handle.services(), ["demo.Echo_1.0".to_string()]);
        assert!(handle.address().starts_with("127.0.0.1:"));
        assert_eq!(
            discovery.addresses("demo.Echo_1.0").await.unwrap(),
            vec![handle.address().to_string()]
        );

        handle.stop().await.unwrap();
        assert!(discovery.addresses("demo.Echo_1.0").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_serves_requests_and_health() {
        let mut handle = Provider::start(test_config(), echo_registry(), Arc::new(MemoryDiscovery::new()))
            .await
            .unwrap();
        let mut stream = TcpStream::connect(handle.local_addr()).await.unwrap();

        let response = roundtrip(
            &mut stream,
            Request::new("1", "demo.Echo_1.0", "echo(1)", vec![json!({"k": "v"})]),
        )
        .await;
        assert_eq!(response.id, "1");
        assert_eq!(response.result, json!({"k": "v"}));

        let response = roundtrip(&mut stream, Request::new("2", "health", "health", vec![])).await;
        assert_eq!(response.result, json!("ok"));

        let response = roundtrip(&mut stream, Request::new("3", "demo.Echo_1.0", "nope(0)", vec![])).await;
        assert!(response.has_error);
        assert!(response.error.unwrap().message.contains("no such method"));

        handle.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_stop_drains_in_flight_invocations() {
        let mut handle = Provider::start(test_config(), echo_registry(), Arc::new(MemoryDiscovery::new()))
            .await
            .unwrap();
        let stream = TcpStream::connect(handle.local_addr()).await.unwrap();
        let (read_half, mut write_half) = stream.into_split();

        let codec = FrameCodec::default();
        let request = Request::new("slow", "demo.Echo_1.0", "sleep(1)", vec![json!(200)]);
        let frame = codec.encode(&Message::Request(request)).unwrap();
        write_frame(&mut write_half, &frame).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        let reader_task = tokio::spawn(async move {
            let mut reader = FrameReader::new(read_half, codec);
            reader.next_frame().await
        });
        handle.stop().await.unwrap();

        let payload = reader_task.await.unwrap().unwrap().expect("response before close");
        match Message::from_slice(&payload).unwrap() {
            Message::Response(response) => assert_eq!(response.result, json!(200)),
            other => panic!("expected response, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_undecodable_frame_is_skipped() {
        let mut handle = Provider::start(test_config(), echo_registry(), Arc::new(MemoryDiscovery::new()))
            .await
            .unwrap();
        let mut stream = TcpStream::connect(handle.local_addr()).await.unwrap();

        write_frame(&mut stream, b"{\"garbage\": true}").await.unwrap();
        let response = roundtrip(&mut stream, Request::new("after", "health", "health", vec![])).await;
        assert_eq!(response.id, "after");

        handle.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_oversized_frame_closes_connection() {
        let config = test_config().with_max_frame_len(64);
        let mut handle = Provider::start(config, echo_registry(), Arc::new(MemoryDiscovery::new()))
            .await
            .unwrap();
        let mut stream = TcpStream::connect(handle.local_addr()).await.unwrap();

        write_frame(&mut stream, &[b' '; 128]).await.unwrap();
        let mut reader = FrameReader::new(&mut stream, FrameCodec::default());
        let next = tokio::time::timeout(Duration::from_secs(5), reader.next_frame())
            .await
            .unwrap();
        assert!(matches!(next, Ok(None) | Err(_)));

        handle.stop().await.unwrap();
    }

    #[test]
    fn test_advertised_address_rules() {
        let config = ProviderConfig::default();
        let any: SocketAddr = "0.0.0.0:8090".parse().unwrap();
        assert_eq!(advertised_address(&config, any), "127.0.0.1:8090");

        let bound: SocketAddr = "10.1.2.3:9000".parse().unwrap();
        assert_eq!(advertised_address(&config, bound), "10.1.2.3:9000");

        let config = config.with_advertise_host("svc.internal");
        assert_eq!(advertised_address(&config, any), "svc.internal:8090");
    }
}

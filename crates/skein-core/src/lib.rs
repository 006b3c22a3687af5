//! Skein Core - lightweight RPC over framed TCP with discovery-driven pools.
//!
//! A provider exposes service implementations on a TCP port and registers
//! its address with a discovery backend. A consumer follows those
//! registrations, keeps one reconnecting connection per provider address,
//! and turns method invocations into length-prefixed JSON requests that are
//! matched to their responses by id.
//!
//! # Example
//!
//! ```rust,ignore
//! use skein_core::{
//!     Consumer, ConsumerConfig, MemoryDiscovery, Provider, ProviderConfig, ServiceDefinition,
//! };
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> skein_core::Result<()> {
//!     let discovery = Arc::new(MemoryDiscovery::new());
//!
//!     let echo = ServiceDefinition::new("demo.Echo")
//!         .method("echo", 1, |params| Ok(params[0].clone()));
//!     let mut provider =
//!         Provider::serve(ProviderConfig::default(), vec![echo], discovery.clone()).await?;
//!
//!     let consumer = Consumer::new(ConsumerConfig::default(), discovery);
//!     let stub = consumer.consume("demo.Echo", "0.0.1").await?;
//!     let reply = stub.invoke("echo", vec!["hi".into()]).await?;
//!     println!("{}", reply);
//!
//!     consumer.shutdown();
//!     provider.stop().await
//! }
//! ```

pub mod codec;
pub mod config;
pub mod connection;
pub mod consumer;
pub mod correlation;
pub mod discovery;
pub mod dispatcher;
pub mod error;
pub mod monitor;
pub mod naming;
pub mod pool;
pub mod provider;
pub mod reconnect;
pub mod worker;

// Re-export commonly used types
pub use codec::{ErrorPayload, FrameCodec, FrameReader, Message, Request, Response};
pub use config::{
    ConnectionConfig, ConsumerConfig, MonitorConfig, ProviderConfig, WireConfig, WorkerPoolConfig,
};
pub use connection::{Connection, ConnectionState};
pub use consumer::{probe, Consumer, ServiceStub};
pub use correlation::{CorrelationTable, PendingCall};
pub use discovery::{Discovery, FileDiscovery, MemoryDiscovery};
pub use dispatcher::{Handler, MethodRegistry, ServiceDefinition};
pub use error::{RpcError, Result};
pub use monitor::{CallSample, CallTimer, Monitor, Reporter, ReporterHandle};
pub use pool::{ConsumerPool, PoolUpdate};
pub use provider::{Provider, ProviderHandle};
pub use reconnect::ReconnectConfig;
pub use worker::WorkerPool;

//! Call driver: turns a method invocation into a request on a pooled
//! connection and waits for the matching response.
//!
//! [`ServiceStub`] is the client-side entry point for one remote service;
//! it fills in the method signature from the argument count so callers only
//! name the method.

use crate::codec::Request;
use crate::config::{ConnectionConfig, ConsumerConfig, WireConfig};
use crate::connection::{Connection, ConnectionState};
use crate::discovery::Discovery;
use crate::error::{RpcError, Result};
use crate::monitor::Monitor;
use crate::naming;
use crate::pool::ConsumerPool;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

/// Consumer side of the framework: one pool, one discovery feed.
#[derive(Clone)]
pub struct Consumer {
    config: ConsumerConfig,
    pool: ConsumerPool,
    discovery: Arc<dyn Discovery>,
    monitor: Monitor,
}

impl std::fmt::Debug for Consumer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Consumer")
            .field("config", &self.config)
            .field("services", &self.pool.services())
            .finish()
    }
}

impl Consumer {
    pub fn new(config: ConsumerConfig, discovery: Arc<dyn Discovery>) -> Self {
        Self {
            pool: ConsumerPool::new(config.connection.clone()),
            config,
            discovery,
            monitor: Monitor::disabled(),
        }
    }

    /// Record call durations into `monitor`.
    pub fn with_monitor(mut self, monitor: Monitor) -> Self {
        self.monitor = monitor;
        self
    }

    pub fn pool(&self) -> &ConsumerPool {
        &self.pool
    }

    pub fn monitor(&self) -> &Monitor {
        &self.monitor
    }

    /// Follow `interface` at `version` in discovery and return a stub for it.
    pub async fn consume(&self, interface: &str, version: &str) -> Result<ServiceStub> {
        let service = naming::service_name(interface, version);
        self.pool.subscribe(Arc::clone(&self.discovery), &service).await?;
        Ok(ServiceStub {
            consumer: self.clone(),
            service,
            timeout: self.config.default_timeout,
        })
    }

    /// Invoke `method` (a full signature such as `add(2)`) on `service`.
    ///
    /// Fails with [`RpcError::NoProvider`] before any network I/O when the
    /// pool has no member for the service. Never retries.
    pub async fn call(
        &self,
        service: &str,
        method: &str,
        params: Vec<Value>,
        timeout: Duration,
    ) -> Result<Value> {
        let mut timer = self.monitor.start(service, method);
        let result = self.send(service, method, params, timeout).await;
        if result.is_ok() {
            timer.succeed();
        }
        timer.finish();
        result
    }

    async fn send(
        &self,
        service: &str,
        method: &str,
        params: Vec<Value>,
        timeout: Duration,
    ) -> Result<Value> {
        let connection = self.pool.select(service)?;
        let request = Request::new(naming::request_id(), service, method, params);
        debug!(
            "Calling {}.{} on {} as {}",
            service,
            method,
            connection.address(),
            request.id
        );
        let response = connection.send(request, timeout).await?;
        response.into_result(service, method)
    }

    /// Stop following discovery and close every connection, even if
    /// clones of this consumer are still around. Dropping the last clone
    /// has the same effect.
    pub fn shutdown(&self) {
        self.pool.close_all();
    }
}

/// Client-side handle for one remote service.
#[derive(Debug, Clone)]
pub struct ServiceStub {
    consumer: Consumer,
    service: String,
    timeout: Duration,
}

impl ServiceStub {
    /// Use `timeout` instead of the consumer default.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Full service name, `interface_version`.
    pub fn service(&self) -> &str {
        &self.service
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Call method `name` with `params`; the signature is `name(params.len())`.
    pub async fn invoke(&self, name: &str, params: Vec<Value>) -> Result<Value> {
        let signature = naming::method_signature(name, params.len());
        self.consumer
            .call(&self.service, &signature, params, self.timeout)
            .await
    }

    /// [`invoke`](Self::invoke) and deserialize the result.
    pub async fn invoke_as<T: DeserializeOwned>(&self, name: &str, params: Vec<Value>) -> Result<T> {
        let value = self.invoke(name, params).await?;
        serde_json::from_value(value).map_err(|e| RpcError::Json {
            message: format!("unexpected result from {}.{}: {}", self.service, name, e),
            source: Some(e),
        })
    }
}

/// Send the reserved health request to `address` on a fresh connection.
///
/// Returns the round-trip time. `timeout` covers connecting and the call.
pub async fn probe(address: &str, config: ConnectionConfig, timeout: Duration) -> Result<Duration> {
    let started = Instant::now();
    let connection = Connection::connect(address, config);

    let outcome = async {
        if !connection
            .wait_for_state(ConnectionState::Connected, timeout)
            .await
        {
            return Err(RpcError::connectivity(
                address,
                format!("not connected within {:?}", timeout),
            ));
        }
        let remaining = timeout.saturating_sub(started.elapsed());
        let request = Request::new(
            naming::request_id(),
            WireConfig::HEALTH_SERVICE,
            WireConfig::HEALTH_METHOD,
            Vec::new(),
        );
        let result = connection
            .send(request, remaining)
            .await?
            .into_result(WireConfig::HEALTH_SERVICE, WireConfig::HEALTH_METHOD)?;
        if result != Value::from(WireConfig::HEALTH_RESULT) {
            return Err(RpcError::Protocol(format!(
                "unexpected health answer from {}: {}",
                address, result
            )));
        }
        Ok(started.elapsed())
    }
    .await;

    connection.close();
    outcome
}

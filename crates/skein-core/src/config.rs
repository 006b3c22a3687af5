//! Configuration for connections, consumers, providers and monitoring.
//!
//! Every component takes its configuration at construction. Defaults are
//! documented per field; the `with_*` setters allow partial overrides.

use crate::reconnect::ReconnectConfig;
use std::time::Duration;

/// Protocol-wide constants.
pub struct WireConfig;

impl WireConfig {
    /// Size of the big-endian length prefix in front of every frame.
    pub const LENGTH_FIELD_LEN: usize = 4;
    /// Default upper bound on a declared frame payload (16 MiB).
    pub const DEFAULT_MAX_FRAME_LEN: usize = 16 * 1024 * 1024;
    /// Reserved service and method name answered by every provider.
    pub const HEALTH_SERVICE: &'static str = "health";
    pub const HEALTH_METHOD: &'static str = "health";
    pub const HEALTH_RESULT: &'static str = "ok";
}

/// Configuration for one outbound connection.
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// Timeout for a single connect attempt. Default: 3s.
    pub connect_timeout: Duration,
    /// Largest frame payload accepted from the peer. Default: 16 MiB.
    pub max_frame_len: usize,
    /// Encoded frames buffered for the writer task. Default: 1024.
    pub outbound_queue: usize,
    /// Fail outstanding calls with a connectivity error as soon as the
    /// connection drops, instead of letting them run out their timeout.
    /// Default: false.
    pub fail_pending_on_disconnect: bool,
    /// Delay policy between reconnect attempts. Default: fixed 1s.
    pub reconnect: ReconnectConfig,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(3),
            max_frame_len: WireConfig::DEFAULT_MAX_FRAME_LEN,
            outbound_queue: 1024,
            fail_pending_on_disconnect: false,
            reconnect: ReconnectConfig::default(),
        }
    }
}

impl ConnectionConfig {
    /// Set the connect timeout.
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Set the largest accepted frame payload.
    pub fn with_max_frame_len(mut self, len: usize) -> Self {
        self.max_frame_len = len;
        self
    }

    /// Fail outstanding calls as soon as the session drops.
    pub fn with_fail_pending_on_disconnect(mut self, fail: bool) -> Self {
        self.fail_pending_on_disconnect = fail;
        self
    }

    /// Set the reconnect policy.
    pub fn with_reconnect(mut self, reconnect: ReconnectConfig) -> Self {
        self.reconnect = reconnect;
        self
    }
}

/// Configuration for the consumer side (call driver and pool).
#[derive(Debug, Clone)]
pub struct ConsumerConfig {
    /// Timeout applied by `ServiceStub` when none is given. Default: 5s.
    pub default_timeout: Duration,
    /// Settings for every connection the pool opens.
    pub connection: ConnectionConfig,
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            default_timeout: Duration::from_secs(5),
            connection: ConnectionConfig::default(),
        }
    }
}

impl ConsumerConfig {
    /// Set the timeout used by new stubs.
    pub fn with_default_timeout(mut self, timeout: Duration) -> Self {
        self.default_timeout = timeout;
        self
    }

    /// Set the per-connection settings.
    pub fn with_connection(mut self, connection: ConnectionConfig) -> Self {
        self.connection = connection;
        self
    }
}

/// Sizing of the provider's invocation pool.
#[derive(Debug, Clone)]
pub struct WorkerPoolConfig {
    /// Async threads of the pool runtime, started when the pool is built.
    /// They encode and queue responses; invocations never run on them.
    /// Default: 50.
    pub core_size: usize,
    /// Upper bound on threads running invocations. Jobs beyond it queue.
    /// Default: 600.
    pub max_size: usize,
    /// Idle time after which an invocation thread exits. Every invocation
    /// thread is subject to it; none are kept warm. Default: 600s.
    pub keep_alive: Duration,
    /// How long `stop` waits for in-flight invocations. Default: 30s.
    pub drain_timeout: Duration,
}

impl Default for WorkerPoolConfig {
    fn default() -> Self {
        Self {
            core_size: 50,
            max_size: 600,
            keep_alive: Duration::from_secs(600),
            drain_timeout: Duration::from_secs(30),
        }
    }
}

impl WorkerPoolConfig {
    /// Set the number of async completion threads.
    pub fn with_core_size(mut self, size: usize) -> Self {
        self.core_size = size;
        self
    }

    /// Set the invocation thread cap.
    pub fn with_max_size(mut self, size: usize) -> Self {
        self.max_size = size;
        self
    }

    /// Set the idle timeout of invocation threads.
    pub fn with_keep_alive(mut self, keep_alive: Duration) -> Self {
        self.keep_alive = keep_alive;
        self
    }

    /// Set how long shutdown waits for in-flight invocations.
    pub fn with_drain_timeout(mut self, timeout: Duration) -> Self {
        self.drain_timeout = timeout;
        self
    }
}

/// Configuration for a provider process.
#[derive(Debug, Clone)]
pub struct ProviderConfig {
    /// Interface to bind. Default: "0.0.0.0".
    pub bind_host: String,
    /// Port to bind; 0 lets the OS pick. Default: 8090.
    pub port: u16,
    /// Host published to discovery. Default: None (the bound IP, with an
    /// unspecified IP advertised as 127.0.0.1).
    pub advertise_host: Option<String>,
    /// Version appended to every exposed interface name. Default: "0.0.1".
    pub version: String,
    /// Concurrent inbound connections accepted. Default: 1024.
    pub max_connections: usize,
    /// Largest frame payload accepted from consumers. Default: 16 MiB.
    pub max_frame_len: usize,
    /// Invocation pool sizing.
    pub worker: WorkerPoolConfig,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            bind_host: "0.0.0.0".to_string(),
            port: 8090,
            advertise_host: None,
            version: "0.0.1".to_string(),
            max_connections: 1024,
            max_frame_len: WireConfig::DEFAULT_MAX_FRAME_LEN,
            worker: WorkerPoolConfig::default(),
        }
    }
}

impl ProviderConfig {
    /// Set the bind interface.
    pub fn with_bind_host(mut self, host: impl Into<String>) -> Self {
        self.bind_host = host.into();
        self
    }

    /// Set the listen port.
    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    /// Set the host published to discovery.
    pub fn with_advertise_host(mut self, host: impl Into<String>) -> Self {
        self.advertise_host = Some(host.into());
        self
    }

    /// Set the service version.
    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.version = version.into();
        self
    }

    /// Set the inbound connection cap.
    pub fn with_max_connections(mut self, max: usize) -> Self {
        self.max_connections = max;
        self
    }

    /// Set the largest accepted frame payload.
    pub fn with_max_frame_len(mut self, len: usize) -> Self {
        self.max_frame_len = len;
        self
    }

    /// Set the invocation pool sizing.
    pub fn with_worker(mut self, worker: WorkerPoolConfig) -> Self {
        self.worker = worker;
        self
    }
}

/// Call-duration sampling and reporting.
#[derive(Debug, Clone)]
pub struct MonitorConfig {
    /// Whether samples are recorded and reported at all. Default: false.
    pub enabled: bool,
    /// Period between report uploads. Default: 30s.
    pub report_interval: Duration,
    /// Collector endpoint. Default: None (`{center}/report` from discovery).
    pub collector_url: Option<String>,
    /// Samples buffered between reports; extra samples are dropped.
    /// Default: 10_000.
    pub max_buffered: usize,
    /// Connect timeout for the upload. Default: 1s.
    pub connect_timeout: Duration,
    /// Whole-request timeout for the upload. Default: 3s.
    pub request_timeout: Duration,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            report_interval: Duration::from_secs(30),
            collector_url: None,
            max_buffered: 10_000,
            connect_timeout: Duration::from_secs(1),
            request_timeout: Duration::from_secs(3),
        }
    }
}

impl MonitorConfig {
    /// Defaults with reporting switched on.
    pub fn enabled() -> Self {
        Self {
            enabled: true,
            ..Self::default()
        }
    }

    /// Set the report interval.
    pub fn with_report_interval(mut self, interval: Duration) -> Self {
        self.report_interval = interval;
        self
    }

    /// Set a fixed collector URL.
    pub fn with_collector_url(mut self, url: impl Into<String>) -> Self {
        self.collector_url = Some(url.into());
        self
    }

    /// Set the sample buffer bound.
    pub fn with_max_buffered(mut self, max: usize) -> Self {
        self.max_buffered = max;
        self
    }
}

//! Call-duration sampling and best-effort reporting.
//!
//! The call driver wraps every outgoing call in a [`CallTimer`]. Finished
//! timers become [`CallSample`]s in a bounded in-memory buffer; recording
//! never blocks and never fails. A reporter task periodically drains the
//! buffer and POSTs the batch to a collector. Reporting failures are logged
//! and the batch is dropped.
//!
//! The collector URL is `MonitorConfig::collector_url` when set, otherwise
//! `{center}/report` where `center` is the address published through
//! [`Discovery::register_center`].

use crate::config::MonitorConfig;
use crate::discovery::Discovery;
use crate::error::{RpcError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use url::Url;

/// One timed call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallSample {
    pub service: String,
    pub method: String,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub success: bool,
}

impl CallSample {
    pub fn duration(&self) -> chrono::Duration {
        self.end_time - self.start_time
    }
}

/// Body POSTed to the collector.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReportBatch {
    pub samples: Vec<CallSample>,
}

/// Sample buffer shared by every call driver in the process.
#[derive(Debug, Clone)]
pub struct Monitor {
    inner: Arc<MonitorInner>,
}

#[derive(Debug)]
struct MonitorInner {
    config: MonitorConfig,
    buffer: Mutex<VecDeque<CallSample>>,
    dropped: AtomicU64,
}

impl Monitor {
    pub fn new(config: MonitorConfig) -> Self {
        Self {
            inner: Arc::new(MonitorInner {
                config,
                buffer: Mutex::new(VecDeque::new()),
                dropped: AtomicU64::new(0),
            }),
        }
    }

    /// A monitor that records nothing.
    pub fn disabled() -> Self {
        Self::new(MonitorConfig::default())
    }

    pub fn is_enabled(&self) -> bool {
        self.inner.config.enabled
    }

    pub fn config(&self) -> &MonitorConfig {
        &self.inner.config
    }

    fn buffer(&self) -> MutexGuard<'_, VecDeque<CallSample>> {
        self.inner
            .buffer
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Start timing a call.
    pub fn start(&self, service: &str, method: &str) -> CallTimer {
        CallTimer {
            monitor: self.is_enabled().then(|| self.clone()),
            service: service.to_string(),
            method: method.to_string(),
            start_time: Utc::now(),
            success: false,
        }
    }

    /// Buffer a sample, evicting the oldest one when full.
    pub fn record(&self, sample: CallSample) {
        if !self.is_enabled() {
            return;
        }
        let max = self.inner.config.max_buffered.max(1);
        let mut buffer = self.buffer();
        while buffer.len() >= max {
            buffer.pop_front();
            self.inner.dropped.fetch_add(1, Ordering::Relaxed);
        }
        buffer.push_back(sample);
    }

    /// Take every buffered sample.
    pub fn drain(&self) -> Vec<CallSample> {
        self.buffer().drain(..).collect()
    }

    pub fn buffered(&self) -> usize {
        self.buffer().len()
    }

    /// Samples evicted because the buffer was full.
    pub fn dropped(&self) -> u64 {
        self.inner.dropped.load(Ordering::Relaxed)
    }

    /// Start the periodic reporter.
    ///
    /// `discovery` is consulted for the center address when no collector
    /// URL is configured.
    pub fn spawn_reporter(&self, discovery: Option<Arc<dyn Discovery>>) -> Result<ReporterHandle> {
        let reporter = Reporter::new(self.clone(), discovery)?;
        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
        let interval = self.inner.config.report_interval;

        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // The first tick completes immediately.
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => reporter.report().await,
                    _ = shutdown_rx.changed() => {
                        reporter.report().await;
                        break;
                    }
                }
            }
            debug!("Monitor reporter stopped");
        });

        Ok(ReporterHandle {
            shutdown_tx,
            task: Some(task),
        })
    }
}

/// Times one call; commit it with [`finish`](Self::finish).
#[derive(Debug)]
pub struct CallTimer {
    monitor: Option<Monitor>,
    service: String,
    method: String,
    start_time: DateTime<Utc>,
    success: bool,
}

impl CallTimer {
    pub fn succeed(&mut self) {
        self.success = true;
    }

    /// Record the sample. A no-op when monitoring is disabled.
    pub fn finish(self) {
        if let Some(monitor) = &self.monitor {
            monitor.record(CallSample {
                service: self.service.clone(),
                method: self.method.clone(),
                start_time: self.start_time,
                end_time: Utc::now(),
                success: self.success,
            });
        }
    }
}

/// Sends buffered samples to the collector.
pub struct Reporter {
    monitor: Monitor,
    discovery: Option<Arc<dyn Discovery>>,
    client: reqwest::Client,
}

impl Reporter {
    pub fn new(monitor: Monitor, discovery: Option<Arc<dyn Discovery>>) -> Result<Self> {
        let config = monitor.config();
        let client = reqwest::Client::builder()
            .connect_timeout(config.connect_timeout)
            .timeout(config.request_timeout)
            .user_agent(concat!("skein/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| RpcError::Other(format!("Failed to create report client: {}", e)))?;
        Ok(Self {
            monitor,
            discovery,
            client,
        })
    }

    /// Where reports go right now, if anywhere.
    pub async fn collector_url(&self) -> Result<Option<Url>> {
        if let Some(url) = &self.monitor.config().collector_url {
            return parse_url(url).map(Some);
        }
        let center = match &self.discovery {
            Some(discovery) => discovery.center().await?,
            None => None,
        };
        match center {
            Some(center) => report_url_for_center(&center).map(Some),
            None => Ok(None),
        }
    }

    /// Drain the buffer and POST it. Returns how many samples were sent.
    pub async fn flush(&self) -> Result<usize> {
        let samples = self.monitor.drain();
        if samples.is_empty() {
            return Ok(0);
        }
        let count = samples.len();

        let url = self.collector_url().await?.ok_or_else(|| RpcError::Config {
            message: format!("no collector configured; dropping {} samples", count),
        })?;

        self.client
            .post(url.clone())
            .json(&ReportBatch { samples })
            .send()
            .await
            .and_then(|response| response.error_for_status())
            .map_err(|e| RpcError::Other(format!("Report to {} failed: {}", url, e)))?;

        debug!("Reported {} call samples to {}", count, url);
        Ok(count)
    }

    /// Flush, logging instead of returning failures.
    pub async fn report(&self) {
        if let Err(e) = self.flush().await {
            warn!("Dropping call samples: {}", e);
        }
    }
}

/// Running reporter task.
#[derive(Debug)]
pub struct ReporterHandle {
    shutdown_tx: watch::Sender<bool>,
    task: Option<JoinHandle<()>>,
}

impl ReporterHandle {
    /// Send whatever is buffered one last time and stop.
    pub async fn stop(mut self) {
        let _ = self.shutdown_tx.send(true);
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
        info!("Monitor reporter shut down");
    }
}

impl Drop for ReporterHandle {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

fn parse_url(raw: &str) -> Result<Url> {
    Url::parse(raw).map_err(|e| RpcError::Config {
        message: format!("invalid collector URL {}: {}", raw, e),
    })
}

/// `{center}/report`, accepting a bare `host:port` center address.
fn report_url_for_center(center: &str) -> Result<Url> {
    let base = if center.contains("://") {
        center.to_string()
    } else {
        format!("http://{}", center)
    };
    let mut url = parse_url(&base)?;
    let path = format!("{}/report", url.path().trim_end_matches('/'));
    url.set_path(&path);
    Ok(url)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::discovery::MemoryDiscovery;
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    /// Minimal HTTP endpoint that answers 200 and hands back request bodies.
    async fn spawn_collector() -> (String, tokio::sync::mpsc::UnboundedReceiver<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
        tokio::spawn(async move {
            while let Ok((mut stream, _)) = listener.accept().await {
                let mut raw = Vec::new();
                let mut chunk = [0u8; 4096];
                let body = loop {
                    let n = stream.read(&mut chunk).await.unwrap();
                    if n == 0 {
                        break String::new();
                    }
                    raw.extend_from_slice(&chunk[..n]);
                    let text = String::from_utf8_lossy(&raw).to_string();
                    if let Some(split) = text.find("\r\n\r\n") {
                        let length = text[..split]
                            .lines()
                            .find_map(|line| {
                                let (name, value) = line.split_once(':')?;
                                name.eq_ignore_ascii_case("content-length")
                                    .then(|| value.trim().parse::<usize>().ok())
                                    .flatten()
                            })
                            .unwrap_or(0);
                        if raw.len() >= split + 4 + length {
                            break text[split + 4..split + 4 + length].to_string();
                        }
                    }
                };
                let _ = tx.send(body);
                let _ = stream
                    .write_all(b"HTTP/1.1 200 OK\r\ncontent-length: 0\r\nconnection: close\r\n\r\n")
                    .await;
            }
        });
        (addr, rx)
    }

    fn sample(service: &str) -> CallSample {
        let now = Utc::now();
        CallSample {
            service: service.to_string(),
            method: "m(0)".to_string(),
            start_time: now,
            end_time: now,
            success: true,
        }
    }

    #[test]
    fn test_disabled_monitor_records_nothing() {
        let monitor = Monitor::disabled();
        let mut timer = monitor.start("svc", "m(0)");
        timer.succeed();
        timer.finish();
        assert_eq!(monitor.buffered(), 0);
    }

    #[test]
    fn test_timer_records_sample() {
        let monitor = Monitor::new(MonitorConfig::enabled());
        let mut timer = monitor.start("svc", "m(1)");
        timer.succeed();
        timer.finish();
        monitor.start("svc", "m(1)").finish();

        let samples = monitor.drain();
        assert_eq!(samples.len(), 2);
        assert!(samples[0].success);
        assert!(!samples[1].success);
        assert!(samples[0].duration() >= chrono::Duration::zero());
        assert_eq!(monitor.buffered(), 0);
    }

    #[test]
    fn test_buffer_is_bounded() {
        let monitor = Monitor::new(MonitorConfig::enabled().with_max_buffered(3));
        for i in 0..5 {
            monitor.record(sample(&format!("svc-{}", i)));
        }
        let services: Vec<String> = monitor.drain().into_iter().map(|s| s.service).collect();
        assert_eq!(services, vec!["svc-2", "svc-3", "svc-4"]);
        assert_eq!(monitor.dropped(), 2);
    }

    #[test]
    fn test_sample_wire_shape() {
        let value = serde_json::to_value(sample("svc")).unwrap();
        assert!(value.get("startTime").is_some());
        assert!(value.get("endTime").is_some());
        assert_eq!(value["service"], "svc");
    }

    #[test]
    fn test_center_report_url() {
        assert_eq!(
            report_url_for_center("10.0.0.5:9000").unwrap().as_str(),
            "http://10.0.0.5:9000/report"
        );
        assert_eq!(
            report_url_for_center("https://collector.example/api/").unwrap().as_str(),
            "https://collector.example/api/report"
        );
    }

    #[tokio::test]
    async fn test_collector_url_falls_back_to_center() {
        let discovery = MemoryDiscovery::new();
        let monitor = Monitor::new(MonitorConfig::enabled());
        let reporter = Reporter::new(monitor, Some(Arc::new(discovery.clone()))).unwrap();
        assert!(reporter.collector_url().await.unwrap().is_none());

        discovery.register_center("127.0.0.1:7070").await.unwrap();
        assert_eq!(
            reporter.collector_url().await.unwrap().unwrap().as_str(),
            "http://127.0.0.1:7070/report"
        );
    }

    #[tokio::test]
    async fn test_flush_posts_batch() {
        let (addr, mut bodies) = spawn_collector().await;
        let monitor = Monitor::new(
            MonitorConfig::enabled().with_collector_url(format!("http://{}/samples", addr)),
        );
        monitor.record(sample("a"));
        monitor.record(sample("b"));

        let reporter = Reporter::new(monitor.clone(), None).unwrap();
        assert_eq!(reporter.flush().await.unwrap(), 2);

        let body = bodies.recv().await.unwrap();
        let batch: ReportBatch = serde_json::from_str(&body).unwrap();
        assert_eq!(batch.samples.len(), 2);
        assert_eq!(monitor.buffered(), 0);
    }

    #[tokio::test]
    async fn test_unreachable_collector_drops_samples() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let monitor =
            Monitor::new(MonitorConfig::enabled().with_collector_url(format!("http://{}/", addr)));
        monitor.record(sample("a"));
        let reporter = Reporter::new(monitor.clone(), None).unwrap();

        assert!(reporter.flush().await.is_err());
        reporter.report().await;
        assert_eq!(monitor.buffered(), 0);
    }

    #[tokio::test]
    async fn test_reporter_flushes_on_stop() {
        let (addr, mut bodies) = spawn_collector().await;
        let monitor = Monitor::new(
            MonitorConfig::enabled()
                .with_collector_url(format!("http://{}/report", addr))
                .with_report_interval(Duration::from_secs(3600)),
        );
        let handle = monitor.spawn_reporter(None).unwrap();
        monitor.record(sample("late"));

        handle.stop().await;
        let batch: ReportBatch = serde_json::from_str(&bodies.recv().await.unwrap()).unwrap();
        assert_eq!(batch.samples[0].service, "late");
    }
}

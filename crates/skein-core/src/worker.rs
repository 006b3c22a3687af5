//! Bounded worker pool for provider-side method execution.
//!
//! The pool owns a dedicated tokio runtime so user code never runs on the
//! threads that service sockets. Each job has a blocking half (the method
//! invocation, run on the runtime's blocking pool capped at `max_size`
//! threads) and an async completion half (writing the response, run on the
//! `core_size` worker threads). Idle blocking threads exit after
//! `keep_alive`.

use crate::config::WorkerPoolConfig;
use crate::error::{RpcError, Result};
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::runtime::{Handle, Runtime};
use tokio::sync::Notify;
use tracing::{error, info, warn};

/// Thread pool that runs dispatch jobs away from the I/O reactor.
#[derive(Debug, Clone)]
pub struct WorkerPool {
    inner: Arc<WorkerInner>,
}

#[derive(Debug)]
struct WorkerInner {
    config: WorkerPoolConfig,
    runtime: Mutex<Option<Runtime>>,
    handle: Handle,
    accepting: AtomicBool,
    in_flight: AtomicUsize,
    idle: Notify,
}

/// Decrements the in-flight count however the job ends.
struct InFlight(Arc<WorkerInner>);

impl Drop for InFlight {
    fn drop(&mut self) {
        if self.0.in_flight.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.0.idle.notify_waiters();
        }
    }
}

impl WorkerPool {
    /// Build the pool's runtime. The `core_size` completion threads start
    /// now; invocation threads are spawned on demand up to `max_size`.
    pub fn new(config: WorkerPoolConfig) -> Result<Self> {
        if config.max_size == 0 {
            return Err(RpcError::Config {
                message: "worker pool max_size must be at least 1".to_string(),
            });
        }
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(config.core_size.max(1))
            .max_blocking_threads(config.max_size)
            .thread_keep_alive(config.keep_alive)
            .thread_name("skein-worker")
            .enable_all()
            .build()?;
        let handle = runtime.handle().clone();

        Ok(Self {
            inner: Arc::new(WorkerInner {
                config,
                runtime: Mutex::new(Some(runtime)),
                handle,
                accepting: AtomicBool::new(true),
                in_flight: AtomicUsize::new(0),
                idle: Notify::new(),
            }),
        })
    }

    /// Run `job` on a blocking worker thread, then feed its output to
    /// `complete` on the pool's async threads.
    ///
    /// Returns immediately. Fails with [`RpcError::PoolShutdown`] once
    /// [`shutdown`](Self::shutdown) has begun. A panicking job is logged
    /// and its completion skipped.
    pub fn execute<J, T, C, Fut>(&self, job: J, complete: C) -> Result<()>
    where
        J: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
        C: FnOnce(T) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        // Count first so shutdown either sees this job or we see shutdown.
        self.inner.in_flight.fetch_add(1, Ordering::SeqCst);
        let guard = InFlight(Arc::clone(&self.inner));
        if !self.inner.accepting.load(Ordering::SeqCst) {
            return Err(RpcError::PoolShutdown);
        }

        self.inner.handle.spawn(async move {
            let _guard = guard;
            match tokio::task::spawn_blocking(job).await {
                Ok(output) => complete(output).await,
                Err(e) => error!("Worker job failed: {}", e),
            }
        });
        Ok(())
    }

    /// Jobs submitted and not yet completed.
    pub fn in_flight(&self) -> usize {
        self.inner.in_flight.load(Ordering::SeqCst)
    }

    /// False once shutdown has begun.
    pub fn is_accepting(&self) -> bool {
        self.inner.accepting.load(Ordering::SeqCst)
    }

    pub fn config(&self) -> &WorkerPoolConfig {
        &self.inner.config
    }

    /// Reject new jobs, wait up to `drain_timeout` for in-flight ones, then
    /// stop the pool's threads. Returns whether every job finished.
    pub async fn shutdown(&self) -> bool {
        if !self.inner.accepting.swap(false, Ordering::SeqCst) {
            return self.in_flight() == 0;
        }

        let drain = async {
            loop {
                let idle = self.inner.idle.notified();
                if self.in_flight() == 0 {
                    break;
                }
                idle.await;
            }
        };
        let drained = tokio::time::timeout(self.inner.config.drain_timeout, drain)
            .await
            .is_ok();
        if drained {
            info!("Worker pool drained");
        } else {
            warn!(
                "Worker pool drain timed out with {} jobs still running",
                self.in_flight()
            );
        }

        let runtime = self
            .inner
            .runtime
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(runtime) = runtime {
            runtime.shutdown_background();
        }
        drained
    }
}

impl Drop for WorkerInner {
    fn drop(&mut self) {
        // Dropping a runtime from async context panics.
        if let Some(runtime) = self
            .runtime
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            runtime.shutdown_background();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::sync::{mpsc, oneshot};

    fn small_config() -> WorkerPoolConfig {
        WorkerPoolConfig::default()
            .with_core_size(2)
            .with_max_size(4)
            .with_drain_timeout(Duration::from_secs(5))
    }

    #[tokio::test]
    async fn test_job_output_reaches_completion() {
        let pool = WorkerPool::new(small_config()).unwrap();
        let (tx, rx) = oneshot::channel();

        pool.execute(|| 6 * 7, move |answer| async move {
            let _ = tx.send(answer);
        })
        .unwrap();

        assert_eq!(rx.await.unwrap(), 42);
        pool.shutdown().await;
    }

    #[tokio::test]
    async fn test_jobs_run_off_the_caller_thread() {
        let pool = WorkerPool::new(small_config()).unwrap();
        let (tx, rx) = oneshot::channel();

        pool.execute(
            || std::thread::current().name().map(str::to_string),
            move |name| async move {
                let _ = tx.send(name);
            },
        )
        .unwrap();

        assert_eq!(rx.await.unwrap().as_deref(), Some("skein-worker"));
        pool.shutdown().await;
    }

    #[tokio::test]
    async fn test_shutdown_waits_for_in_flight_jobs() {
        let pool = WorkerPool::new(small_config()).unwrap();
        let (tx, mut rx) = mpsc::unbounded_channel();

        for i in 0..8 {
            let tx = tx.clone();
            pool.execute(
                move || {
                    std::thread::sleep(Duration::from_millis(50));
                    i
                },
                move |i| async move {
                    let _ = tx.send(i);
                },
            )
            .unwrap();
        }
        drop(tx);

        assert!(pool.shutdown().await);
        assert_eq!(pool.in_flight(), 0);

        let mut done = Vec::new();
        while let Some(i) = rx.recv().await {
            done.push(i);
        }
        done.sort();
        assert_eq!(done, (0..8).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn test_max_size_caps_concurrent_invocations() {
        // Plenty of completion threads, a single invocation thread.
        let config = small_config().with_core_size(4).with_max_size(1);
        let pool = WorkerPool::new(config).unwrap();
        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        for _ in 0..4 {
            let running = Arc::clone(&running);
            let peak = Arc::clone(&peak);
            pool.execute(
                move || {
                    let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    std::thread::sleep(Duration::from_millis(30));
                    running.fetch_sub(1, Ordering::SeqCst);
                },
                |_| async {},
            )
            .unwrap();
        }

        assert!(pool.shutdown().await);
        assert_eq!(peak.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_rejects_jobs_after_shutdown() {
        let pool = WorkerPool::new(small_config()).unwrap();
        pool.shutdown().await;

        assert!(!pool.is_accepting());
        let err = pool.execute(|| (), |_| async {}).unwrap_err();
        assert!(matches!(err, RpcError::PoolShutdown));
        assert_eq!(pool.in_flight(), 0);
    }

    #[tokio::test]
    async fn test_panicking_job_does_not_poison_pool() {
        let pool = WorkerPool::new(small_config()).unwrap();
        pool.execute(|| panic!("boom"), |_: ()| async {}).unwrap();

        let (tx, rx) = oneshot::channel();
        pool.execute(|| "still alive", move |s| async move {
            let _ = tx.send(s);
        })
        .unwrap();
        assert_eq!(rx.await.unwrap(), "still alive");
        assert!(pool.shutdown().await);
    }

    #[test]
    fn test_zero_max_size_rejected() {
        let config = WorkerPoolConfig::default().with_max_size(0);
        assert!(matches!(WorkerPool::new(config), Err(RpcError::Config { .. })));
    }

    #[tokio::test]
    async fn test_drop_inside_runtime_is_safe() {
        let pool = WorkerPool::new(small_config()).unwrap();
        drop(pool);
    }
}

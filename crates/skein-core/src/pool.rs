//! Consumer-side connection pool kept in sync with discovery.
//!
//! For every consumed service the pool holds an immutable snapshot of its
//! member connections. Discovery updates build a new snapshot under a
//! single-writer lock and swap it in, so `select` only ever clones an `Arc`
//! and never waits on an update in progress.
//!
//! Connections are shared by address: two services served from the same
//! provider process ride the same socket. Each address tracks the services
//! using it and is closed once none remain.

use crate::config::ConnectionConfig;
use crate::connection::Connection;
use crate::discovery::Discovery;
use crate::error::{RpcError, Result};
use rand::Rng;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock, Weak};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

type Snapshot = Arc<Vec<Connection>>;

/// Membership change applied by one discovery update.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PoolUpdate {
    pub added: Vec<String>,
    pub removed: Vec<String>,
}

impl PoolUpdate {
    /// True when the update changed nothing.
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty()
    }
}

/// One connection plus the services that currently list its address.
#[derive(Debug)]
struct SharedConnection {
    connection: Connection,
    services: HashSet<String>,
}

/// Discovery feed task for one service.
///
/// `active` is only read or cleared while holding the subscriptions lock,
/// which orders a feed's last update before the removal that retires it.
#[derive(Debug)]
struct Subscription {
    task: JoinHandle<()>,
    active: Arc<AtomicBool>,
}

impl Subscription {
    fn retire(self) {
        self.active.store(false, Ordering::Release);
        self.task.abort();
    }
}

/// Live connections per consumed service.
///
/// Clones share state. Dropping the last clone cancels subscriptions and
/// closes every pooled connection.
#[derive(Debug, Clone)]
pub struct ConsumerPool {
    inner: Arc<PoolInner>,
}

#[derive(Debug)]
struct PoolInner {
    config: ConnectionConfig,
    /// Read path. Replaced wholesale, never mutated in place.
    members: RwLock<HashMap<String, Snapshot>>,
    /// Write path. Holding this lock is the single-writer section.
    connections: Mutex<HashMap<String, SharedConnection>>,
    /// Taken before `connections` when both are needed.
    subscriptions: Mutex<HashMap<String, Subscription>>,
}

impl Drop for PoolInner {
    fn drop(&mut self) {
        let subscriptions = self
            .subscriptions
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner);
        for (_, subscription) in subscriptions.drain() {
            subscription.retire();
        }
        let connections = self
            .connections
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner);
        for (_, shared) in connections.drain() {
            shared.connection.close();
        }
    }
}

impl ConsumerPool {
    /// Empty pool; new connections use `config`.
    pub fn new(config: ConnectionConfig) -> Self {
        Self {
            inner: Arc::new(PoolInner {
                config,
                members: RwLock::new(HashMap::new()),
                connections: Mutex::new(HashMap::new()),
                subscriptions: Mutex::new(HashMap::new()),
            }),
        }
    }

    fn snapshot(&self, service: &str) -> Option<Snapshot> {
        self.inner
            .members
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(service)
            .cloned()
    }

    fn subscriptions(&self) -> MutexGuard<'_, HashMap<String, Subscription>> {
        self.inner
            .subscriptions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn connections(&self) -> MutexGuard<'_, HashMap<String, SharedConnection>> {
        self.inner
            .connections
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Pick a connection for `service` uniformly at random.
    ///
    /// Fails with [`RpcError::NoProvider`] when the service has no members,
    /// without touching the network. The returned connection may still be
    /// reconnecting.
    pub fn select(&self, service: &str) -> Result<Connection> {
        let members = self
            .snapshot(service)
            .filter(|members| !members.is_empty())
            .ok_or_else(|| RpcError::NoProvider {
                service: service.to_string(),
            })?;
        let index = rand::rng().random_range(0..members.len());
        Ok(members[index].clone())
    }

    /// Replace the membership of `service` with `addresses`.
    ///
    /// Removed addresses drop this service's reference; a connection with no
    /// references left is closed. New addresses reuse an existing
    /// connection or open a new one. Must run inside a tokio runtime.
    pub fn on_discovery_update(&self, service: &str, addresses: &[String]) -> PoolUpdate {
        let mut wanted: Vec<&str> = Vec::with_capacity(addresses.len());
        for address in addresses {
            if !wanted.contains(&address.as_str()) {
                wanted.push(address);
            }
        }

        let mut connections = self.connections();
        let current: Vec<String> = self
            .snapshot(service)
            .map(|members| members.iter().map(|c| c.address().to_string()).collect())
            .unwrap_or_default();

        let mut update = PoolUpdate::default();

        for address in &current {
            if wanted.contains(&address.as_str()) {
                continue;
            }
            update.removed.push(address.clone());
            let orphaned = match connections.get_mut(address) {
                Some(shared) => {
                    shared.services.remove(service);
                    shared.services.is_empty()
                }
                None => false,
            };
            if orphaned {
                if let Some(shared) = connections.remove(address) {
                    shared.connection.close();
                }
            }
        }

        let mut members = Vec::with_capacity(wanted.len());
        for address in wanted {
            if !current.iter().any(|a| a == address) {
                update.added.push(address.to_string());
            }
            let shared = connections
                .entry(address.to_string())
                .or_insert_with(|| {
                    debug!("Opening pooled connection to {}", address);
                    SharedConnection {
                        connection: Connection::connect(address, self.inner.config.clone()),
                        services: HashSet::new(),
                    }
                });
            shared.services.insert(service.to_string());
            members.push(shared.connection.clone());
        }

        {
            let mut snapshots = self
                .inner
                .members
                .write()
                .unwrap_or_else(PoisonError::into_inner);
            if members.is_empty() {
                snapshots.remove(service);
            } else {
                snapshots.insert(service.to_string(), Arc::new(members));
            }
        }
        drop(connections);

        if !update.is_empty() {
            info!(
                "Providers of {} changed: +{:?} -{:?}",
                service, update.added, update.removed
            );
        }
        update
    }

    /// Follow `service` in `discovery`, applying every notification.
    ///
    /// The current list is applied before returning. Subscribing twice to
    /// the same service is a no-op.
    pub async fn subscribe(&self, discovery: Arc<dyn Discovery>, service: &str) -> Result<()> {
        if self.is_subscribed(service) {
            return Ok(());
        }

        let mut rx = discovery.subscribe(service).await?;
        let initial = rx.borrow_and_update().clone();
        self.on_discovery_update(service, &initial);

        let pool: Weak<PoolInner> = Arc::downgrade(&self.inner);
        let active = Arc::new(AtomicBool::new(true));
        let feed_active = Arc::clone(&active);
        let name = service.to_string();
        let task = tokio::spawn(async move {
            while rx.changed().await.is_ok() {
                let latest = rx.borrow_and_update().clone();
                let Some(inner) = pool.upgrade() else { break };
                let pool = ConsumerPool { inner };
                let subscriptions = pool.subscriptions();
                if !feed_active.load(Ordering::Acquire) {
                    break;
                }
                pool.on_discovery_update(&name, &latest);
                drop(subscriptions);
            }
            debug!("Discovery feed for {} ended", name);
        });

        let previous = self
            .subscriptions()
            .insert(service.to_string(), Subscription { task, active });
        if let Some(previous) = previous {
            warn!("Replacing concurrent subscription for {}", service);
            previous.retire();
        }
        Ok(())
    }

    /// Whether a discovery feed is running for `service`.
    pub fn is_subscribed(&self, service: &str) -> bool {
        self.subscriptions().contains_key(service)
    }

    /// Stop following `service` and release its connections.
    ///
    /// No update from the retired feed lands after this returns.
    pub fn unsubscribe(&self, service: &str) {
        let mut subscriptions = self.subscriptions();
        if let Some(subscription) = subscriptions.remove(service) {
            subscription.retire();
        }
        self.on_discovery_update(service, &[]);
    }

    /// Current member addresses of `service`, in discovery order.
    pub fn addresses(&self, service: &str) -> Vec<String> {
        self.snapshot(service)
            .map(|members| members.iter().map(|c| c.address().to_string()).collect())
            .unwrap_or_default()
    }

    /// The pooled connection to `address`, if any service uses it.
    pub fn connection(&self, address: &str) -> Option<Connection> {
        self.connections()
            .get(address)
            .map(|shared| shared.connection.clone())
    }

    /// Number of distinct open connections.
    pub fn connection_count(&self) -> usize {
        self.connections().len()
    }

    /// Services that currently have at least one member.
    pub fn services(&self) -> Vec<String> {
        let mut services: Vec<String> = self
            .inner
            .members
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect();
        services.sort();
        services
    }

    /// Cancel every subscription and close every connection.
    pub fn close_all(&self) {
        let mut subscriptions = self.subscriptions();
        for (_, subscription) in subscriptions.drain() {
            subscription.retire();
        }

        let mut connections = self.connections();
        self.inner
            .members
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
        for (_, shared) in connections.drain() {
            shared.connection.close();
        }
    }
}

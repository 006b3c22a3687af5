//! In-process discovery backed by `watch` channels.

use super::Discovery;
use crate::error::Result;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::watch;
use tracing::debug;

/// Discovery registry living entirely in this process.
///
/// Clones share the same registry.
#[derive(Debug, Clone, Default)]
pub struct MemoryDiscovery {
    inner: Arc<MemoryInner>,
}

#[derive(Debug, Default)]
struct MemoryInner {
    services: Mutex<HashMap<String, watch::Sender<Vec<String>>>>,
    center: Mutex<Option<String>>,
}

impl MemoryDiscovery {
    pub fn new() -> Self {
        Self::default()
    }

    fn services(&self) -> MutexGuard<'_, HashMap<String, watch::Sender<Vec<String>>>> {
        self.inner
            .services
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Apply `f` to the address list of `service`, notifying subscribers
    /// only when it reports a change.
    fn modify(&self, service: &str, f: impl FnOnce(&mut Vec<String>) -> bool) {
        let mut services = self.services();
        let sender = services
            .entry(service.to_string())
            .or_insert_with(|| watch::channel(Vec::new()).0);
        if sender.send_if_modified(f) {
            debug!("{} providers now {:?}", service, *sender.borrow());
        }
    }

    /// Replace the whole address list of `service`.
    pub fn set_addresses(&self, service: &str, addresses: Vec<String>) {
        self.modify(service, |current| {
            if *current == addresses {
                return false;
            }
            *current = addresses;
            true
        });
    }
}

#[async_trait::async_trait]
impl Discovery for MemoryDiscovery {
    async fn register(&self, service: &str, address: &str) -> Result<()> {
        self.modify(service, |current| {
            if current.iter().any(|a| a == address) {
                return false;
            }
            current.push(address.to_string());
            true
        });
        Ok(())
    }

    async fn unregister(&self, service: &str, address: &str) -> Result<()> {
        self.modify(service, |current| {
            let before = current.len();
            current.retain(|a| a != address);
            current.len() != before
        });
        Ok(())
    }

    async fn addresses(&self, service: &str) -> Result<Vec<String>> {
        Ok(self
            .services()
            .get(service)
            .map(|sender| sender.borrow().clone())
            .unwrap_or_default())
    }

    async fn subscribe(&self, service: &str) -> Result<watch::Receiver<Vec<String>>> {
        let mut services = self.services();
        let sender = services
            .entry(service.to_string())
            .or_insert_with(|| watch::channel(Vec::new()).0);
        Ok(sender.subscribe())
    }

    async fn register_center(&self, address: &str) -> Result<()> {
        *self.inner.center.lock().unwrap_or_else(PoisonError::into_inner) =
            Some(address.to_string());
        Ok(())
    }

    async fn unregister_center(&self) -> Result<()> {
        *self.inner.center.lock().unwrap_or_else(PoisonError::into_inner) = None;
        Ok(())
    }

    async fn center(&self) -> Result<Option<String>> {
        Ok(self
            .inner
            .center
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_register_is_idempotent() {
        let discovery = MemoryDiscovery::new();
        discovery.register("svc", "a:1").await.unwrap();
        discovery.register("svc", "a:1").await.unwrap();
        discovery.register("svc", "b:2").await.unwrap();

        assert_eq!(discovery.addresses("svc").await.unwrap(), vec!["a:1", "b:2"]);
        assert!(discovery.addresses("other").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_subscribe_sees_changes() {
        let discovery = MemoryDiscovery::new();
        discovery.register("svc", "a:1").await.unwrap();

        let mut rx = discovery.subscribe("svc").await.unwrap();
        assert_eq!(*rx.borrow_and_update(), vec!["a:1"]);

        discovery.unregister("svc", "a:1").await.unwrap();
        rx.changed().await.unwrap();
        assert!(rx.borrow_and_update().is_empty());

        discovery.set_addresses("svc", vec!["c:3".into()]);
        rx.changed().await.unwrap();
        assert_eq!(*rx.borrow_and_update(), vec!["c:3"]);
    }

    #[tokio::test]
    async fn test_unchanged_list_does_not_notify() {
        let discovery = MemoryDiscovery::new();
        discovery.register("svc", "a:1").await.unwrap();
        let mut rx = discovery.subscribe("svc").await.unwrap();
        let _ = rx.borrow_and_update();

        discovery.register("svc", "a:1").await.unwrap();
        discovery.unregister("svc", "missing:9").await.unwrap();
        assert!(!rx.has_changed().unwrap());
    }

    #[tokio::test]
    async fn test_center_address() {
        let discovery = MemoryDiscovery::new();
        assert_eq!(discovery.center().await.unwrap(), None);

        discovery.register_center("http://collector:8080").await.unwrap();
        assert_eq!(
            discovery.center().await.unwrap().as_deref(),
            Some("http://collector:8080")
        );

        discovery.unregister_center().await.unwrap();
        assert_eq!(discovery.center().await.unwrap(), None);
    }
}

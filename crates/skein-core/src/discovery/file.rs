//! Discovery registry stored in a JSON file.
//!
//! Several processes on one host can share the file. Updates take an
//! exclusive lock on a sidecar `.lock` file, rewrite the registry into a
//! temp file and atomically rename it over the original, so readers never
//! see a half-written document. Subscribers poll the file and are notified
//! only when their service's list actually changes.
//!
//! ```json
//! {
//!   "services": { "demo.Echo_0.0.1": ["127.0.0.1:8090"] },
//!   "center": "http://127.0.0.1:9000"
//! }
//! ```

use super::Discovery;
use crate::error::{RpcError, Result};
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, warn};

/// On-disk registry document.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RegistryDocument {
    #[serde(default)]
    pub services: BTreeMap<String, Vec<String>>,
    #[serde(default)]
    pub center: Option<String>,
}

/// Discovery registry shared through a JSON file.
#[derive(Debug, Clone)]
pub struct FileDiscovery {
    inner: Arc<FileInner>,
}

#[derive(Debug)]
struct FileInner {
    path: PathBuf,
    poll_interval: Duration,
    watchers: Mutex<HashMap<String, watch::Sender<Vec<String>>>>,
}

impl FileDiscovery {
    /// Default period between file polls for subscriptions.
    pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(1);

    /// Registry at `path`, polled every second.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self::with_poll_interval(path, Self::DEFAULT_POLL_INTERVAL)
    }

    /// Registry at `path` with a custom poll interval.
    pub fn with_poll_interval(path: impl Into<PathBuf>, poll_interval: Duration) -> Self {
        Self {
            inner: Arc::new(FileInner {
                path: path.into(),
                poll_interval,
                watchers: Mutex::new(HashMap::new()),
            }),
        }
    }

    pub fn path(&self) -> &Path {
        &self.inner.path
    }

    /// Read the registry document; a missing file is an empty registry.
    pub async fn read(&self) -> Result<RegistryDocument> {
        let path = self.inner.path.clone();
        run_blocking(move || read_document(&path)).await
    }

    /// Apply `f` to the document under the cross-process lock and persist.
    async fn update<F>(&self, f: F) -> Result<()>
    where
        F: FnOnce(&mut RegistryDocument) + Send + 'static,
    {
        let path = self.inner.path.clone();
        run_blocking(move || update_document(&path, f)).await
    }

    /// Spawn the poller that feeds one subscription.
    fn spawn_poller(&self, service: String, sender: watch::Sender<Vec<String>>) {
        let discovery = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(discovery.inner.poll_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                if sender.is_closed() {
                    break;
                }
                match discovery.read().await {
                    Ok(doc) => {
                        let latest = doc.services.get(&service).cloned().unwrap_or_default();
                        sender.send_if_modified(|current| {
                            if *current == latest {
                                return false;
                            }
                            debug!("{} providers changed on disk: {:?}", service, latest);
                            *current = latest;
                            true
                        });
                    }
                    Err(e) => warn!(
                        "Failed to poll registry {}: {}",
                        discovery.inner.path.display(),
                        e
                    ),
                }
            }
            let mut watchers = discovery
                .inner
                .watchers
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            if watchers.get(&service).map_or(false, |s| s.is_closed()) {
                watchers.remove(&service);
            }
        });
    }
}

#[async_trait::async_trait]
impl Discovery for FileDiscovery {
    async fn register(&self, service: &str, address: &str) -> Result<()> {
        let service = service.to_string();
        let address = address.to_string();
        self.update(move |doc| {
            let list = doc.services.entry(service).or_default();
            if !list.contains(&address) {
                list.push(address);
            }
        })
        .await
    }

    async fn unregister(&self, service: &str, address: &str) -> Result<()> {
        let service = service.to_string();
        let address = address.to_string();
        self.update(move |doc| {
            if let Some(list) = doc.services.get_mut(&service) {
                list.retain(|a| *a != address);
            }
        })
        .await
    }

    async fn addresses(&self, service: &str) -> Result<Vec<String>> {
        Ok(self.read().await?.services.remove(service).unwrap_or_default())
    }

    async fn subscribe(&self, service: &str) -> Result<watch::Receiver<Vec<String>>> {
        let existing = self
            .inner
            .watchers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(service)
            .filter(|sender| !sender.is_closed())
            .map(|sender| sender.subscribe());
        if let Some(rx) = existing {
            return Ok(rx);
        }

        let initial = self.addresses(service).await?;
        let (sender, rx) = watch::channel(initial);
        let previous = self
            .inner
            .watchers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(service.to_string(), sender.clone());
        drop(previous);
        self.spawn_poller(service.to_string(), sender);
        Ok(rx)
    }

    async fn register_center(&self, address: &str) -> Result<()> {
        let address = address.to_string();
        self.update(move |doc| doc.center = Some(address)).await
    }

    async fn unregister_center(&self) -> Result<()> {
        self.update(|doc| doc.center = None).await
    }

    async fn center(&self) -> Result<Option<String>> {
        Ok(self.read().await?.center)
    }
}

async fn run_blocking<T, F>(f: F) -> Result<T>
where
    F: FnOnce() -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| RpcError::Discovery {
            message: format!("registry task failed: {}", e),
        })?
}

fn read_document(path: &Path) -> Result<RegistryDocument> {
    let contents = match fs::read_to_string(path) {
        Ok(contents) => contents,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Ok(RegistryDocument::default())
        }
        Err(e) => {
            return Err(RpcError::Discovery {
                message: format!("failed to read {}: {}", path.display(), e),
            })
        }
    };
    if contents.trim().is_empty() {
        return Ok(RegistryDocument::default());
    }
    serde_json::from_str(&contents).map_err(|e| RpcError::Discovery {
        message: format!("failed to parse {}: {}", path.display(), e),
    })
}

fn update_document(path: &Path, f: impl FnOnce(&mut RegistryDocument)) -> Result<()> {
    let parent = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
        _ => PathBuf::from("."),
    };
    fs::create_dir_all(&parent)?;

    let lock_path = path.with_extension("lock");
    let lock_file = OpenOptions::new()
        .create(true)
        .truncate(false)
        .write(true)
        .open(&lock_path)?;
    lock_file.lock_exclusive()?;

    let result = (|| {
        let mut doc = read_document(path)?;
        f(&mut doc);
        doc.services.retain(|_, list| !list.is_empty());

        let serialized = serde_json::to_vec_pretty(&doc)?;
        let mut temp = tempfile::NamedTempFile::new_in(&parent)?;
        temp.write_all(&serialized)?;
        temp.as_file().sync_all()?;
        temp.persist(path).map_err(|e| RpcError::Discovery {
            message: format!("failed to replace {}: {}", path.display(), e),
        })?;
        debug!("Wrote registry {}", path.display());
        Ok(())
    })();

    if let Err(e) = FileExt::unlock(&lock_file) {
        warn!("Failed to unlock {}: {}", lock_path.display(), e);
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_missing_file_is_empty_registry() {
        let temp_dir = TempDir::new().unwrap();
        let discovery = FileDiscovery::new(temp_dir.path().join("registry.json"));

        assert!(discovery.addresses("svc").await.unwrap().is_empty());
        assert_eq!(discovery.center().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_register_and_unregister_persist() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("registry.json");
        let discovery = FileDiscovery::new(&path);

        discovery.register("svc", "a:1").await.unwrap();
        discovery.register("svc", "b:2").await.unwrap();
        discovery.register("svc", "a:1").await.unwrap();

        // A second handle on the same file sees the same data.
        let other = FileDiscovery::new(&path);
        assert_eq!(other.addresses("svc").await.unwrap(), vec!["a:1", "b:2"]);

        discovery.unregister("svc", "a:1").await.unwrap();
        discovery.unregister("svc", "b:2").await.unwrap();
        let doc = other.read().await.unwrap();
        assert!(!doc.services.contains_key("svc"));
    }

    #[tokio::test]
    async fn test_center_round_trip() {
        let temp_dir = TempDir::new().unwrap();
        let discovery = FileDiscovery::new(temp_dir.path().join("registry.json"));

        discovery.register_center("http://127.0.0.1:9000").await.unwrap();
        assert_eq!(
            discovery.center().await.unwrap().as_deref(),
            Some("http://127.0.0.1:9000")
        );
        discovery.unregister_center().await.unwrap();
        assert_eq!(discovery.center().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_subscription_polls_changes() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("registry.json");
        let consumer = FileDiscovery::with_poll_interval(&path, Duration::from_millis(20));
        let provider = FileDiscovery::new(&path);

        let mut rx = consumer.subscribe("svc").await.unwrap();
        assert!(rx.borrow_and_update().is_empty());

        provider.register("svc", "10.0.0.1:8090").await.unwrap();
        tokio::time::timeout(Duration::from_secs(5), rx.changed())
            .await
            .expect("poller should notice the new address")
            .unwrap();
        assert_eq!(*rx.borrow_and_update(), vec!["10.0.0.1:8090"]);
    }

    #[tokio::test]
    async fn test_corrupt_file_is_reported() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("registry.json");
        std::fs::write(&path, "{ not json").unwrap();

        let discovery = FileDiscovery::new(&path);
        assert!(matches!(
            discovery.addresses("svc").await,
            Err(RpcError::Discovery { .. })
        ));
    }
}

//! Service discovery contract.
//!
//! A discovery backend records which addresses currently serve each service
//! name. Providers register and unregister themselves; consumers subscribe
//! and treat every notification as the complete, authoritative list.
//!
//! # Backends
//!
//! - [`MemoryDiscovery`]: in-process, for tests and single-process setups
//! - [`FileDiscovery`]: a JSON file shared by processes on one host

pub mod file;
pub mod memory;

pub use file::FileDiscovery;
pub use memory::MemoryDiscovery;

use crate::error::Result;
use tokio::sync::watch;

/// Registry of service addresses.
///
/// Subscriptions deliver whole address lists, never deltas. Intermediate
/// states may be coalesced; the latest list always wins.
#[async_trait::async_trait]
pub trait Discovery: Send + Sync + 'static {
    /// Add `address` to the providers of `service`. Idempotent.
    async fn register(&self, service: &str, address: &str) -> Result<()>;

    /// Remove `address` from the providers of `service`. Idempotent.
    async fn unregister(&self, service: &str, address: &str) -> Result<()>;

    /// Current providers of `service`.
    async fn addresses(&self, service: &str) -> Result<Vec<String>>;

    /// Watch the providers of `service`. The receiver starts at the current
    /// list.
    async fn subscribe(&self, service: &str) -> Result<watch::Receiver<Vec<String>>>;

    /// Publish the monitoring collector ("center") address.
    async fn register_center(&self, address: &str) -> Result<()>;

    /// Clear the collector address.
    async fn unregister_center(&self) -> Result<()>;

    /// Current collector address, if any.
    async fn center(&self) -> Result<Option<String>>;
}

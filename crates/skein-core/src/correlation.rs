//! Request/response correlation for one connection.
//!
//! Each outstanding call owns a [`PendingCall`] backed by its own oneshot
//! channel, so waking one caller never disturbs another. The table maps
//! request ids to the sending half.
//!
//! # Invariants
//!
//! - An entry is removed exactly once: by the response path
//!   ([`CorrelationTable::resolve`]), by a failure path, or by the caller's
//!   [`PendingCall`] being dropped (timeout or cancellation).
//! - A removed id never matches again, so late or duplicate responses are
//!   dropped.

use crate::codec::Response;
use crate::error::{RpcError, Result};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::time::Instant;

type Slot = oneshot::Sender<Result<Response>>;

/// Map from request id to the waiting caller, shared by the I/O task and
/// every caller on the same connection.
#[derive(Debug, Clone)]
pub struct CorrelationTable {
    inner: Arc<TableInner>,
}

#[derive(Debug)]
struct TableInner {
    peer: String,
    pending: Mutex<HashMap<String, Slot>>,
}

impl CorrelationTable {
    /// Create an empty table for the connection to `peer`.
    pub fn new(peer: impl Into<String>) -> Self {
        Self {
            inner: Arc::new(TableInner {
                peer: peer.into(),
                pending: Mutex::new(HashMap::new()),
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Slot>> {
        self.inner
            .pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Register a call that will wait at most `timeout` for its response.
    ///
    /// Fails if `id` is already outstanding on this connection.
    pub fn register(&self, id: &str, timeout: Duration) -> Result<PendingCall> {
        let (tx, rx) = oneshot::channel();
        {
            let mut pending = self.lock();
            if pending.contains_key(id) {
                return Err(RpcError::Protocol(format!(
                    "request id {} is already pending on {}",
                    id, self.inner.peer
                )));
            }
            pending.insert(id.to_string(), tx);
        }

        Ok(PendingCall {
            id: id.to_string(),
            timeout,
            deadline: Instant::now() + timeout,
            rx,
            table: self.clone(),
        })
    }

    /// Deliver `response` to its caller.
    ///
    /// Returns false when no call is waiting for that id (late, duplicate or
    /// unknown response); the response is then dropped.
    pub fn resolve(&self, response: Response) -> bool {
        let slot = self.lock().remove(&response.id);
        match slot {
            // The caller may have given up between removal and send.
            Some(tx) => tx.send(Ok(response)).is_ok(),
            None => false,
        }
    }

    /// Fail one outstanding call.
    pub fn fail(&self, id: &str, err: RpcError) -> bool {
        let slot = self.lock().remove(id);
        match slot {
            Some(tx) => tx.send(Err(err)).is_ok(),
            None => false,
        }
    }

    /// Fail every outstanding call, returning how many were waiting.
    pub fn fail_all(&self, make_err: impl Fn() -> RpcError) -> usize {
        let drained: Vec<Slot> = self.lock().drain().map(|(_, tx)| tx).collect();
        let count = drained.len();
        for tx in drained {
            let _ = tx.send(Err(make_err()));
        }
        count
    }

    /// Remove an entry without resolving it.
    pub fn remove(&self, id: &str) -> bool {
        self.lock().remove(id).is_some()
    }

    /// Whether `id` is still waiting.
    pub fn contains(&self, id: &str) -> bool {
        self.lock().contains_key(id)
    }

    /// Number of waiting calls.
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Address the table belongs to.
    pub fn peer(&self) -> &str {
        &self.inner.peer
    }
}

/// The caller's side of one outstanding request.
///
/// Dropping it removes the table entry, so the timeout path and task
/// cancellation clean up the same way.
#[derive(Debug)]
pub struct PendingCall {
    id: String,
    timeout: Duration,
    deadline: Instant,
    rx: oneshot::Receiver<Result<Response>>,
    table: CorrelationTable,
}

impl PendingCall {
    /// Request id this call waits on.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Instant at which the call expires.
    pub fn deadline(&self) -> Instant {
        self.deadline
    }

    /// Wait for the response, a failure, or the deadline, whichever is first.
    pub async fn wait(mut self) -> Result<Response> {
        match tokio::time::timeout_at(self.deadline, &mut self.rx).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(_)) => Err(RpcError::connectivity(
                self.table.peer(),
                "connection dropped before the response arrived",
            )),
            Err(_) => Err(RpcError::Timeout {
                request_id: self.id.clone(),
                after: self.timeout,
            }),
        }
    }
}

impl Drop for PendingCall {
    fn drop(&mut self) {
        self.table.remove(&self.id);
    }
}

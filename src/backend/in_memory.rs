//! In-process storage nodes with injectable faults.
//!
//! State lives per address and is shared by every client the connector opens
//! for it, so a test can flip a node into failure while two schedulers hold
//! independent handles to it.

use super::client::{NodeClient, NodeConnector};
use crate::core::{ProxyError, Result};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

#[derive(Default)]
struct NodeState {
    data: Mutex<HashMap<String, Vec<u8>>>,
    failing: AtomicBool,
    refuse_connect: AtomicBool,
    delay_ms: AtomicU64,
    connect_delay_ms: AtomicU64,
    gets: AtomicUsize,
    writes: AtomicUsize,
    connects: AtomicUsize,
    open_handles: AtomicUsize,
}

impl NodeState {
    fn data(&self) -> MutexGuard<'_, HashMap<String, Vec<u8>>> {
        self.data.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Call counters of one in-memory node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct NodeCounters {
    pub gets: usize,
    pub writes: usize,
    pub connects: usize,
    pub open_handles: usize,
}

/// Connector handing out [`InMemoryNode`] clients.
///
/// Cloning shares the node states.
#[derive(Clone, Default)]
pub struct InMemoryConnector {
    nodes: Arc<Mutex<HashMap<String, Arc<NodeState>>>>,
}

impl InMemoryConnector {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self, addr: &str) -> Arc<NodeState> {
        let mut nodes = self.nodes.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        nodes.entry(addr.to_string()).or_default().clone()
    }

    /// Every call against `addr` fails while set.
    pub fn set_failing(&self, addr: &str, failing: bool) {
        self.state(addr).failing.store(failing, Ordering::SeqCst);
    }

    /// Every call against `addr` sleeps this long before answering.
    pub fn set_delay(&self, addr: &str, delay: Duration) {
        self.state(addr)
            .delay_ms
            .store(delay.as_millis() as u64, Ordering::SeqCst);
    }

    /// Opening a client for `addr` takes this long.
    pub fn set_connect_delay(&self, addr: &str, delay: Duration) {
        self.state(addr)
            .connect_delay_ms
            .store(delay.as_millis() as u64, Ordering::SeqCst);
    }

    /// New connections to `addr` are refused while set.
    pub fn set_refuse_connect(&self, addr: &str, refuse: bool) {
        self.state(addr).refuse_connect.store(refuse, Ordering::SeqCst);
    }

    pub fn insert(&self, addr: &str, key: &str, value: &[u8]) {
        self.state(addr).data().insert(key.to_string(), value.to_vec());
    }

    pub fn stored(&self, addr: &str, key: &str) -> Option<Vec<u8>> {
        self.state(addr).data().get(key).cloned()
    }

    pub fn counters(&self, addr: &str) -> NodeCounters {
        let state = self.state(addr);
        NodeCounters {
            gets: state.gets.load(Ordering::SeqCst),
            writes: state.writes.load(Ordering::SeqCst),
            connects: state.connects.load(Ordering::SeqCst),
            open_handles: state.open_handles.load(Ordering::SeqCst),
        }
    }
}

#[async_trait]
impl NodeConnector for InMemoryConnector {
    async fn connect(&self, addr: &str) -> Result<Arc<dyn NodeClient>> {
        let state = self.state(addr);
        let delay = state.connect_delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }
        if state.refuse_connect.load(Ordering::SeqCst) {
            return Err(ProxyError::NodeUnavailable {
                addr: addr.to_string(),
                reason: "connection refused".to_string(),
            });
        }
        state.connects.fetch_add(1, Ordering::SeqCst);
        state.open_handles.fetch_add(1, Ordering::SeqCst);

        Ok(Arc::new(InMemoryNode {
            addr: addr.to_string(),
            state,
            closed: AtomicBool::new(false),
        }))
    }
}

/// One client handle onto an in-memory node.
pub struct InMemoryNode {
    addr: String,
    state: Arc<NodeState>,
    closed: AtomicBool,
}

impl InMemoryNode {
    async fn enter(&self) -> Result<()> {
        self.check_open()?;
        let delay = self.state.delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }
        // A handle closed while the call slept has lost its connection.
        self.check_open()?;
        if self.state.failing.load(Ordering::SeqCst) {
            return Err(ProxyError::NodeUnavailable {
                addr: self.addr.clone(),
                reason: "injected failure".to_string(),
            });
        }
        Ok(())
    }

    fn check_open(&self) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(ProxyError::NodeUnavailable {
                addr: self.addr.clone(),
                reason: "client closed".to_string(),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl NodeClient for InMemoryNode {
    fn addr(&self) -> &str {
        &self.addr
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        self.state.gets.fetch_add(1, Ordering::SeqCst);
        self.enter().await?;
        Ok(self.state.data().get(key).cloned())
    }

    async fn set(&self, key: &str, value: &[u8]) -> Result<()> {
        self.state.writes.fetch_add(1, Ordering::SeqCst);
        self.enter().await?;
        self.state.data().insert(key.to_string(), value.to_vec());
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        self.state.writes.fetch_add(1, Ordering::SeqCst);
        self.enter().await?;
        Ok(self.state.data().remove(key).is_some())
    }

    async fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.state.open_handles.fetch_sub(1, Ordering::SeqCst);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_handles_share_storage() {
        let connector = InMemoryConnector::new();
        let first = connector.connect("n1").await.unwrap();
        let second = connector.connect("n1").await.unwrap();

        first.set("k", b"v").await.unwrap();
        assert_eq!(second.get("k").await.unwrap(), Some(b"v".to_vec()));
        assert_eq!(connector.counters("n1").open_handles, 2);

        first.close().await;
        first.close().await;
        assert_eq!(connector.counters("n1").open_handles, 1);
        assert!(first.get("k").await.is_err());
        assert!(second.get("k").await.is_ok());
    }

    #[tokio::test]
    async fn test_injected_failure_and_refusal() {
        let connector = InMemoryConnector::new();
        let node = connector.connect("n1").await.unwrap();
        connector.set_failing("n1", true);
        assert!(node.set("k", b"v").await.is_err());
        assert_eq!(connector.counters("n1").writes, 1);
        assert_eq!(connector.stored("n1", "k"), None);

        connector.set_refuse_connect("n2", true);
        assert!(connector.connect("n2").await.is_err());
    }

    #[tokio::test]
    async fn test_delete_reports_existence() {
        let connector = InMemoryConnector::new();
        connector.insert("n1", "k", b"v");
        let node = connector.connect("n1").await.unwrap();
        assert!(node.delete("k").await.unwrap());
        assert!(!node.delete("k").await.unwrap());
    }
}

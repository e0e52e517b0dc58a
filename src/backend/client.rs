use crate::core::Result;
use async_trait::async_trait;
use std::sync::Arc;

/// Request/response access to a single storage node.
///
/// Implementations report success or failure per call; timeouts are imposed
/// by the caller, so a call may be dropped mid-flight and must leave the
/// client usable afterwards.
#[async_trait]
pub trait NodeClient: Send + Sync {
    /// Address this client talks to.
    fn addr(&self) -> &str;

    /// Fetches a value, `None` when the node does not hold the key.
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;

    /// Stores a value.
    async fn set(&self, key: &str, value: &[u8]) -> Result<()>;

    /// Removes a key, returning whether it existed.
    async fn delete(&self, key: &str) -> Result<bool>;

    /// Releases every connection held by this client. Later calls fail.
    async fn close(&self);
}

/// Opens clients for node addresses.
///
/// Each scheduler asks for its own clients; a client is never shared between
/// two schedulers.
#[async_trait]
pub trait NodeConnector: Send + Sync {
    async fn connect(&self, addr: &str) -> Result<Arc<dyn NodeClient>>;
}

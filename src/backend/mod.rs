//! Storage-node clients.

pub mod client;
pub mod in_memory;
pub mod memcache;
pub mod pool;

pub use client::{NodeClient, NodeConnector};
pub use in_memory::{InMemoryConnector, InMemoryNode, NodeCounters};
pub use memcache::{MemcacheConnection, MemcacheConnector, MemcacheNode};
pub use pool::{NodePool, PoolConfig, PoolGuard, PoolStats};

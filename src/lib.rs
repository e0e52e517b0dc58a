// ============================================================================
// kvproxy: routing tier of a replicated key-value cluster
// ============================================================================

pub mod backend;
pub mod config;
pub mod coordinator;
pub mod core;
pub mod route;
pub mod scheduler;
pub mod web;

// Re-export main types for convenience
pub use crate::core::{Operation, OperationKind, ProxyError, Reply, Result, WriteReport};
pub use route::{RouteDescription, RouteTable};
pub use scheduler::{Scheduler, SchedulerOptions, SchedulerStats, Scorer, WriteQuorum};

// Re-export the reload API
pub use coordinator::{
    Coordinator, CoordinatorOptions, CoordinatorStatus, FileRouteSource, ReloadOutcome,
    RouteSource, StaticRouteSource, spawn_route_poller,
};

// Re-export backends
pub use backend::{
    InMemoryConnector, MemcacheConnector, NodeClient, NodeConnector, PoolConfig,
};

pub use config::ProxyConfig;
pub use web::{AdminState, admin_router};

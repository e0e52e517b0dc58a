//! Hot reload of the route table: one active scheduler, swapped atomically.

pub mod hot_reload;
pub mod source;

pub use hot_reload::{Coordinator, CoordinatorOptions, CoordinatorStatus, ReloadOutcome};
pub use source::{FileRouteSource, RouteSource, StaticRouteSource, spawn_route_poller};

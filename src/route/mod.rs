//! Partition routing: the versioned route table and its textual description.

pub mod description;
pub mod hash;
pub mod table;

pub use description::{RouteDescription, ServerEntry};
pub use hash::{bucket_for_key, fnv1a32};
pub use table::{BUCKETS_MAX, RouteTable};

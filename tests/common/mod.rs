#![allow(dead_code)]

use std::time::{Duration, Instant};

/// Route text with one partition served by `addrs`, in that order.
pub fn single_partition_route(version: u64, addrs: &[&str]) -> String {
    let mut text = format!("version: {version}\nnumbucket: 1\nmain:\n");
    for addr in addrs {
        text.push_str(&format!("  - addr: {addr}\n    buckets: [0]\n"));
    }
    text
}

/// Route text with `numbucket` partitions, every one served by all `addrs`.
pub fn full_replica_route(version: u64, numbucket: u32, addrs: &[&str]) -> String {
    let buckets: Vec<String> = (0..numbucket).map(|b| b.to_string()).collect();
    let mut text = format!("version: {version}\nnumbucket: {numbucket}\nmain:\n");
    for addr in addrs {
        text.push_str(&format!("  - addr: {addr}\n    buckets: [{}]\n", buckets.join(", ")));
    }
    text
}

/// Polls `condition` until it holds or `limit` elapses.
pub async fn eventually(limit: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + limit;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    condition()
}

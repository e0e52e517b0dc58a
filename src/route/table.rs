use super::description::{RouteDescription, ServerEntry};
use super::hash::bucket_for_key;
use crate::core::{ProxyError, Result};
use std::collections::HashSet;

/// Maximum number of partitions a route may declare.
pub const BUCKETS_MAX: u32 = 65_536;

/// Immutable, versioned mapping from partition to its ordered replica nodes.
///
/// Built once from a validated [`RouteDescription`]; reconfiguration always
/// produces a new table. Every partition holds exactly `replicas` addresses.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteTable {
    version: u64,
    replicas: usize,
    /// Indexed by partition id.
    partitions: Vec<Vec<String>>,
    /// Distinct addresses in order of first appearance.
    nodes: Vec<String>,
}

impl RouteTable {
    /// Parses a YAML route description and validates it against the replication factor.
    pub fn parse(text: &str, replicas: usize) -> Result<Self> {
        let description = RouteDescription::from_yaml(text)?;
        Self::from_description(description, replicas)
    }

    /// Builds a table from an already deserialized description.
    pub fn from_description(description: RouteDescription, replicas: usize) -> Result<Self> {
        if replicas == 0 {
            return Err(ProxyError::MalformedRoute(
                "replication factor must be >= 1".to_string(),
            ));
        }
        let bucket_count = description.numbucket;
        if bucket_count == 0 || bucket_count > BUCKETS_MAX || !bucket_count.is_power_of_two() {
            return Err(ProxyError::MalformedRoute(format!(
                "numbucket must be a power of two in 1..={}, got {}",
                BUCKETS_MAX, bucket_count
            )));
        }

        let mut partitions: Vec<Vec<String>> = vec![Vec::new(); bucket_count as usize];
        let mut nodes: Vec<String> = Vec::new();
        let mut seen_nodes = HashSet::new();

        for server in description.main {
            let addr = server.addr.trim().to_string();
            if addr.is_empty() {
                return Err(ProxyError::MalformedRoute(
                    "server addr must not be empty".to_string(),
                ));
            }
            if seen_nodes.insert(addr.clone()) {
                nodes.push(addr.clone());
            }
            for bucket in server.buckets {
                let Some(replica_set) = partitions.get_mut(bucket as usize) else {
                    return Err(ProxyError::MalformedRoute(format!(
                        "bucket {} served by '{}' is out of range for numbucket {}",
                        bucket, addr, bucket_count
                    )));
                };
                if replica_set.contains(&addr) {
                    return Err(ProxyError::MalformedRoute(format!(
                        "bucket {} lists '{}' more than once",
                        bucket, addr
                    )));
                }
                replica_set.push(addr.clone());
            }
        }

        // Replica order follows first appearance in `main`, independent of how
        // the entries for one address were split.
        for replica_set in &mut partitions {
            replica_set.sort_by_key(|addr| nodes.iter().position(|node| node == addr));
        }

        for (bucket, replica_set) in partitions.iter().enumerate() {
            if replica_set.len() != replicas {
                return Err(ProxyError::MalformedRoute(format!(
                    "bucket {} has {} replicas, expected {}",
                    bucket,
                    replica_set.len(),
                    replicas
                )));
            }
        }

        Ok(Self {
            version: description.version,
            replicas,
            partitions,
            nodes,
        })
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    /// Replication factor N.
    pub fn replicas(&self) -> usize {
        self.replicas
    }

    pub fn partition_count(&self) -> u32 {
        self.partitions.len() as u32
    }

    pub fn partition_for(&self, key: &str) -> u32 {
        bucket_for_key(key, self.partition_count())
    }

    /// Ordered replica addresses for `key`. Deterministic and side-effect free.
    pub fn lookup(&self, key: &str) -> &[String] {
        self.lookup_partition(self.partition_for(key))
    }

    /// Ordered replica addresses for a partition; empty when the partition does not exist.
    pub fn lookup_partition(&self, partition: u32) -> &[String] {
        self.partitions
            .get(partition as usize)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// Distinct node addresses referenced by the table.
    pub fn nodes(&self) -> &[String] {
        &self.nodes
    }

    /// Returns true when this table supersedes `version`.
    pub fn is_newer_than(&self, version: u64) -> bool {
        self.version > version
    }

    /// Renders the table back into its textual description.
    pub fn to_description(&self) -> RouteDescription {
        let main = self
            .nodes
            .iter()
            .map(|addr| ServerEntry {
                addr: addr.clone(),
                buckets: self
                    .partitions
                    .iter()
                    .enumerate()
                    .filter(|(_, replica_set)| replica_set.contains(addr))
                    .map(|(bucket, _)| bucket as u32)
                    .collect(),
            })
            .collect();

        RouteDescription {
            version: self.version,
            numbucket: self.partition_count(),
            main,
        }
    }
}

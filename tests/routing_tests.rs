mod common;

use common::full_replica_route;
use kvproxy::route::{BUCKETS_MAX, bucket_for_key};
use kvproxy::{ProxyError, RouteTable};

#[test]
fn every_partition_resolves_to_exactly_n_replicas() {
    let text = full_replica_route(4, 64, &["a:1", "b:1", "c:1"]);
    let table = RouteTable::parse(&text, 3).expect("valid table");

    for partition in 0..table.partition_count() {
        assert_eq!(table.lookup_partition(partition).len(), 3);
    }
    for i in 0..1_000 {
        let key = format!("user:{i}");
        assert_eq!(table.lookup(&key).len(), 3);
        assert!(table.partition_for(&key) < 64);
    }
}

#[test]
fn lookup_is_deterministic_across_instances() {
    let text = r#"
version: 1
numbucket: 4
main:
  - addr: a:1
    buckets: [0, 1]
  - addr: b:1
    buckets: [2, 3]
  - addr: c:1
    buckets: [0, 1, 2, 3]
"#;
    let first = RouteTable::parse(text, 2).expect("valid table");
    let second = RouteTable::parse(text, 2).expect("valid table");
    for i in 0..200 {
        let key = format!("k{i}");
        assert_eq!(first.lookup(&key), second.lookup(&key));
    }
    assert_eq!(first.lookup_partition(0), ["a:1", "c:1"]);
    assert_eq!(first.lookup_partition(3), ["b:1", "c:1"]);
}

#[test]
fn partition_with_wrong_replica_count_is_malformed() {
    let text = r#"
version: 2
numbucket: 2
main:
  - addr: a:1
    buckets: [0, 1]
  - addr: b:1
    buckets: [0, 1]
  - addr: c:1
    buckets: [0]
"#;
    let err = RouteTable::parse(text, 3).expect_err("bucket 1 has two replicas");
    assert!(matches!(err, ProxyError::MalformedRoute(ref msg) if msg.contains("bucket 1")));
}

#[test]
fn numbucket_bounds_are_enforced() {
    let too_many = format!("version: 1\nnumbucket: {}\nmain: []\n", BUCKETS_MAX * 2);
    assert!(RouteTable::parse(&too_many, 1).is_err());
    assert!(RouteTable::parse("version: 1\nnumbucket: 0\nmain: []\n", 1).is_err());
}

#[test]
fn keys_spread_over_partitions() {
    let mut seen = [false; 16];
    for i in 0..500 {
        seen[bucket_for_key(&format!("key-{i}"), 16) as usize] = true;
    }
    assert!(seen.iter().all(|hit| *hit));
}

use super::policy::SchedulerOptions;
use super::scorer::{NodeHealthSnapshot, Scorer};
use crate::backend::{NodeClient, NodeConnector};
use crate::core::{Operation, OperationKind, ProxyError, Reply, Result, WriteReport, validate_key};
use crate::route::RouteTable;
use futures::StreamExt;
use futures::stream::FuturesUnordered;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, OwnedSemaphorePermit, Semaphore};
use tokio::time::timeout;
use tracing::{Instrument, Level, event, info_span};

/// Lifecycle of a scheduler. Transitions only move forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum SchedulerState {
    /// Reachable for new requests.
    Active = 0,
    /// Superseded; still serves requests that already hold it.
    Draining = 1,
    /// `close()` is waiting for in-flight work.
    Closing = 2,
    /// Backend clients released.
    Closed = 3,
}

impl SchedulerState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => SchedulerState::Active,
            1 => SchedulerState::Draining,
            2 => SchedulerState::Closing,
            _ => SchedulerState::Closed,
        }
    }
}

/// Read-only statistics of one scheduler.
#[derive(Debug, Clone, Serialize)]
pub struct SchedulerStats {
    pub table_version: u64,
    pub node_count: usize,
    pub state: SchedulerState,
    pub inflight: usize,
    pub per_node: BTreeMap<String, NodeHealthSnapshot>,
}

/// Executes operations for one route table version.
///
/// Owns one client per distinct node address of its table and one [`Scorer`].
/// Every in-flight operation holds a permit of `inflight`; `close()` collects
/// all of them before releasing the clients.
pub struct Scheduler {
    table: Arc<RouteTable>,
    scorer: Arc<Scorer>,
    clients: HashMap<String, Arc<dyn NodeClient>>,
    options: SchedulerOptions,
    inflight: Arc<Semaphore>,
    max_inflight: u32,
    state: AtomicU8,
    close_gate: Mutex<bool>,
}

impl Scheduler {
    /// Connects a client for every node of `table`.
    ///
    /// On failure, clients opened so far are closed and nothing is returned.
    pub async fn build(
        table: Arc<RouteTable>,
        connector: &dyn NodeConnector,
        options: SchedulerOptions,
    ) -> Result<Self> {
        let mut clients: HashMap<String, Arc<dyn NodeClient>> = HashMap::new();
        for addr in table.nodes() {
            match connector.connect(addr).await {
                Ok(client) => {
                    clients.insert(addr.clone(), client);
                }
                Err(err) => {
                    event!(Level::WARN, addr = %addr, error = %err, "scheduler build aborted");
                    for client in clients.values() {
                        client.close().await;
                    }
                    return Err(err);
                }
            }
        }

        let max_inflight = u32::try_from(options.max_inflight.max(1)).unwrap_or(u32::MAX);
        let max_inflight = max_inflight.min(Semaphore::MAX_PERMITS as u32);
        let scorer = Arc::new(Scorer::with_nodes(options.scorer, table.nodes()));

        event!(
            Level::DEBUG,
            version = table.version(),
            nodes = clients.len(),
            "scheduler built"
        );
        Ok(Self {
            table,
            scorer,
            clients,
            options,
            inflight: Arc::new(Semaphore::new(max_inflight as usize)),
            max_inflight,
            state: AtomicU8::new(SchedulerState::Active as u8),
            close_gate: Mutex::new(false),
        })
    }

    pub fn table(&self) -> &Arc<RouteTable> {
        &self.table
    }

    pub fn version(&self) -> u64 {
        self.table.version()
    }

    pub fn scorer(&self) -> &Scorer {
        &self.scorer
    }

    pub fn options(&self) -> &SchedulerOptions {
        &self.options
    }

    pub fn state(&self) -> SchedulerState {
        SchedulerState::from_u8(self.state.load(Ordering::SeqCst))
    }

    /// Replicas of `key` in the order reads would try them.
    pub fn ranked_replicas(&self, key: &str) -> Vec<String> {
        self.scorer.rank(self.table.lookup(key))
    }

    /// Executes `op` on `key`: reads fail over by rank, writes replicate to
    /// every replica under the write quorum.
    pub async fn dispatch(&self, key: &str, op: Operation) -> Result<Reply> {
        validate_key(key, self.options.max_key_len)?;
        let partition = self.table.partition_for(key);
        let span = info_span!(
            "scheduler.dispatch",
            key = %key,
            partition,
            version = self.table.version(),
            op = op.name()
        );

        async move {
            if self.state() >= SchedulerState::Closing {
                return Err(ProxyError::SchedulerClosed);
            }
            let attempt_timeout = match op.kind() {
                OperationKind::Read => self.options.read_timeout,
                OperationKind::Write => self.options.write_timeout,
            };
            let permit = self.acquire_inflight_permit(attempt_timeout).await?;

            let replicas = self.table.lookup_partition(partition);
            if replicas.is_empty() {
                event!(
                    Level::ERROR,
                    partition,
                    "partition has no configured replicas"
                );
                return Err(ProxyError::NoReplicasConfigured { partition });
            }

            match op {
                Operation::Get => {
                    let reply = self.read_with_failover(key, replicas).await;
                    drop(permit);
                    reply
                }
                Operation::Set(value) => {
                    self.write_replicated(key, replicas, WriteOp::Set(value), permit)
                        .await
                }
                Operation::Delete => {
                    self.write_replicated(key, replicas, WriteOp::Delete, permit)
                        .await
                }
            }
        }
        .instrument(span)
        .await
    }

    async fn acquire_inflight_permit(&self, wait: Duration) -> Result<OwnedSemaphorePermit> {
        timeout(wait, self.inflight.clone().acquire_owned())
            .await
            .map_err(|_| {
                ProxyError::Backpressure(format!(
                    "could not acquire operation slot within {}ms",
                    wait.as_millis()
                ))
            })?
            .map_err(|_| ProxyError::SchedulerClosed)
    }

    async fn read_with_failover(&self, key: &str, replicas: &[String]) -> Result<Reply> {
        let ranked = self.scorer.rank(replicas);
        let mut last_error: Option<ProxyError> = None;

        for addr in &ranked {
            let started = Instant::now();
            let outcome = match self.clients.get(addr) {
                Some(client) => bounded(addr, self.options.read_timeout, client.get(key)).await,
                None => Err(missing_client(addr)),
            };
            self.scorer
                .record_outcome(addr, outcome.is_ok(), started.elapsed());

            match outcome {
                Ok(value) => {
                    return Ok(Reply::Value {
                        node: addr.clone(),
                        value,
                    });
                }
                Err(err) => {
                    event!(Level::DEBUG, addr = %addr, error = %err, "read attempt failed");
                    last_error = Some(err);
                }
            }
        }

        let last_error = last_error.map(|err| err.to_string()).unwrap_or_default();
        event!(
            Level::WARN,
            attempts = ranked.len(),
            last_error = %last_error,
            "all replicas failed"
        );
        Err(ProxyError::AllReplicasFailed {
            key: key.to_string(),
            attempts: ranked.len(),
            last_error,
        })
    }

    /// Issues the write to every replica in its own task and returns once the
    /// quorum is decided. Undecided tasks keep running, each holding a share of
    /// the in-flight permit, and still record their outcome.
    async fn write_replicated(
        &self,
        key: &str,
        replicas: &[String],
        op: WriteOp,
        permit: OwnedSemaphorePermit,
    ) -> Result<Reply> {
        let total = replicas.len();
        let required = self.options.write_quorum.required(total);
        let permit = Arc::new(permit);
        let op = Arc::new(op);

        let mut pending = FuturesUnordered::new();
        for addr in replicas {
            let addr = addr.clone();
            let client = self.clients.get(&addr).cloned();
            let scorer = self.scorer.clone();
            let permit = permit.clone();
            let op = op.clone();
            let key = key.to_string();
            let write_timeout = self.options.write_timeout;

            pending.push(tokio::spawn(async move {
                let _permit = permit;
                let started = Instant::now();
                let outcome = match client {
                    Some(client) => {
                        bounded(&addr, write_timeout, write_once(client.as_ref(), &key, &op)).await
                    }
                    None => Err(missing_client(&addr)),
                };
                scorer.record_outcome(&addr, outcome.is_ok(), started.elapsed());
                (addr, outcome)
            }));
        }
        drop(permit);

        let mut acknowledged = Vec::new();
        let mut failed = Vec::new();
        while let Some(joined) = pending.next().await {
            match joined {
                Ok((addr, Ok(()))) => acknowledged.push(addr),
                Ok((addr, Err(err))) => {
                    event!(Level::DEBUG, addr = %addr, error = %err, "write attempt failed");
                    failed.push(format!("{} ({})", addr, err));
                }
                Err(err) => failed.push(format!("write task failed ({})", err)),
            }
            if acknowledged.len() >= required || failed.len() > total - required {
                break;
            }
        }

        if acknowledged.len() < required {
            event!(
                Level::WARN,
                required,
                acknowledged = acknowledged.len(),
                failed = failed.len(),
                "write quorum not met"
            );
            return Err(ProxyError::WriteQuorumNotMet {
                key: key.to_string(),
                required,
                acknowledged: acknowledged.len(),
                failed,
            });
        }

        let pending = total - acknowledged.len() - failed.len();
        Ok(Reply::Written(WriteReport {
            required,
            acknowledged,
            failed,
            pending,
        }))
    }

    /// Stops this scheduler from being handed out; requests holding it still run.
    pub fn mark_draining(&self) {
        if self
            .state
            .compare_exchange(
                SchedulerState::Active as u8,
                SchedulerState::Draining as u8,
                Ordering::SeqCst,
                Ordering::SeqCst,
            )
            .is_ok()
        {
            event!(Level::INFO, version = self.table.version(), "scheduler draining");
        }
    }

    /// Refuses new dispatch, waits up to the drain timeout for in-flight work,
    /// then closes every backend client. Later calls return immediately.
    pub async fn close(&self) {
        let mut closed = self.close_gate.lock().await;
        if *closed {
            return;
        }
        self.state
            .store(SchedulerState::Closing as u8, Ordering::SeqCst);

        let drain_timeout = self.options.drain_timeout;
        let drained = timeout(
            drain_timeout,
            self.inflight.clone().acquire_many_owned(self.max_inflight),
        )
        .await;
        match drained {
            Ok(_) => {}
            Err(_) => {
                let still_running =
                    (self.max_inflight as usize).saturating_sub(self.inflight.available_permits());
                event!(
                    Level::WARN,
                    version = self.table.version(),
                    drain_timeout_ms = drain_timeout.as_millis() as u64,
                    still_running,
                    "drain timeout exceeded, force-closing node clients"
                );
            }
        }
        self.inflight.close();

        for client in self.clients.values() {
            client.close().await;
        }
        self.state
            .store(SchedulerState::Closed as u8, Ordering::SeqCst);
        *closed = true;
        event!(Level::INFO, version = self.table.version(), "scheduler closed");
    }

    pub fn stats(&self) -> SchedulerStats {
        let inflight = if self.inflight.is_closed() {
            0
        } else {
            (self.max_inflight as usize).saturating_sub(self.inflight.available_permits())
        };
        SchedulerStats {
            table_version: self.table.version(),
            node_count: self.table.nodes().len(),
            state: self.state(),
            inflight,
            per_node: self.scorer.snapshot(),
        }
    }
}

async fn bounded<T>(
    addr: &str,
    limit: Duration,
    call: impl Future<Output = Result<T>>,
) -> Result<T> {
    match timeout(limit, call).await {
        Ok(result) => result,
        Err(_) => Err(ProxyError::NodeTimeout {
            addr: addr.to_string(),
            timeout_ms: limit.as_millis() as u64,
        }),
    }
}

/// The mutating subset of [`Operation`], sent to every replica.
enum WriteOp {
    Set(Vec<u8>),
    Delete,
}

async fn write_once(client: &dyn NodeClient, key: &str, op: &WriteOp) -> Result<()> {
    match op {
        WriteOp::Set(value) => client.set(key, value).await,
        WriteOp::Delete => client.delete(key).await.map(|_| ()),
    }
}

fn missing_client(addr: &str) -> ProxyError {
    ProxyError::NodeUnavailable {
        addr: addr.to_string(),
        reason: "no client for node".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::InMemoryConnector;
    use crate::scheduler::WriteQuorum;

    const ROUTE: &str = r#"
version: 7
numbucket: 1
main:
  - addr: a:1
    buckets: [0]
  - addr: b:1
    buckets: [0]
  - addr: c:1
    buckets: [0]
"#;

    async fn scheduler(connector: &InMemoryConnector, options: SchedulerOptions) -> Scheduler {
        let table = Arc::new(RouteTable::parse(ROUTE, 3).unwrap());
        Scheduler::build(table, connector, options).await.unwrap()
    }

    #[tokio::test]
    async fn test_read_prefers_best_ranked_and_fails_over() {
        let connector = InMemoryConnector::new();
        connector.insert("b:1", "k", b"from-b");
        connector.set_failing("a:1", true);
        let scheduler = scheduler(&connector, SchedulerOptions::default()).await;

        let reply = scheduler.dispatch("k", Operation::Get).await.unwrap();
        assert_eq!(
            reply,
            Reply::Value {
                node: "b:1".to_string(),
                value: Some(b"from-b".to_vec())
            }
        );
        let stats = scheduler.stats();
        assert!(stats.per_node["a:1"].failure_count > 0.99);
        assert!(stats.per_node["b:1"].success_count > 0.99);
        assert_eq!(stats.per_node["c:1"].samples, 0);
    }

    #[tokio::test]
    async fn test_all_replicas_failed() {
        let connector = InMemoryConnector::new();
        for addr in ["a:1", "b:1", "c:1"] {
            connector.set_failing(addr, true);
        }
        let scheduler = scheduler(&connector, SchedulerOptions::default()).await;
        let err = scheduler.dispatch("k", Operation::Get).await.unwrap_err();
        assert!(matches!(err, ProxyError::AllReplicasFailed { attempts: 3, .. }));
    }

    #[tokio::test]
    async fn test_read_timeout_counts_as_failure() {
        let connector = InMemoryConnector::new();
        connector.set_delay("a:1", Duration::from_millis(500));
        let options = SchedulerOptions::default().read_timeout(Duration::from_millis(30));
        let scheduler = scheduler(&connector, options).await;

        let reply = scheduler.dispatch("k", Operation::Get).await.unwrap();
        assert!(matches!(reply, Reply::Value { ref node, .. } if node == "b:1"));
        assert!(scheduler.stats().per_node["a:1"].failure_count > 0.99);
    }

    #[tokio::test]
    async fn test_first_success_write_tolerates_failures() {
        let connector = InMemoryConnector::new();
        connector.set_failing("a:1", true);
        connector.set_failing("b:1", true);
        let options = SchedulerOptions::default().write_quorum(WriteQuorum::FirstSuccess);
        let scheduler = scheduler(&connector, options).await;

        let reply = scheduler
            .dispatch("k", Operation::Set(b"v".to_vec()))
            .await
            .unwrap();
        let Reply::Written(report) = reply else {
            panic!("expected write report");
        };
        assert_eq!(report.required, 1);
        assert_eq!(report.acknowledged, vec!["c:1".to_string()]);
        assert_eq!(connector.stored("c:1", "k"), Some(b"v".to_vec()));
    }

    #[tokio::test]
    async fn test_writes_reach_replicas_without_reads() {
        let connector = InMemoryConnector::new();
        for addr in ["a:1", "b:1", "c:1"] {
            connector.insert(addr, "k", b"old");
        }
        let scheduler = scheduler(&connector, SchedulerOptions::default()).await;

        scheduler
            .dispatch("k", Operation::Set(b"new".to_vec()))
            .await
            .unwrap();
        scheduler.dispatch("k", Operation::Delete).await.unwrap();

        for addr in ["a:1", "b:1", "c:1"] {
            let counters = connector.counters(addr);
            assert_eq!(counters.gets, 0, "{addr} was read by a write");
            assert_eq!(counters.writes, 2);
            assert_eq!(connector.stored(addr, "k"), None);
        }
    }

    #[tokio::test]
    async fn test_invalid_key_rejected_before_io() {
        let connector = InMemoryConnector::new();
        let scheduler = scheduler(&connector, SchedulerOptions::default()).await;
        let err = scheduler.dispatch("bad key", Operation::Get).await.unwrap_err();
        assert!(matches!(err, ProxyError::InvalidKey(_)));
        assert_eq!(connector.counters("a:1").gets, 0);
    }

    #[tokio::test]
    async fn test_close_is_idempotent_and_rejects_dispatch() {
        let connector = InMemoryConnector::new();
        let scheduler = scheduler(&connector, SchedulerOptions::default()).await;
        scheduler.close().await;
        scheduler.close().await;

        assert_eq!(scheduler.state(), SchedulerState::Closed);
        assert_eq!(connector.counters("a:1").open_handles, 0);
        assert!(matches!(
            scheduler.dispatch("k", Operation::Get).await,
            Err(ProxyError::SchedulerClosed)
        ));
    }

    #[tokio::test]
    async fn test_build_failure_closes_opened_clients() {
        let connector = InMemoryConnector::new();
        connector.set_refuse_connect("c:1", true);
        let table = Arc::new(RouteTable::parse(ROUTE, 3).unwrap());
        let result = Scheduler::build(table, &connector, SchedulerOptions::default()).await;

        assert!(result.is_err());
        assert_eq!(connector.counters("a:1").open_handles, 0);
        assert_eq!(connector.counters("b:1").open_handles, 0);
    }

    #[tokio::test]
    async fn test_draining_scheduler_still_serves() {
        let connector = InMemoryConnector::new();
        let scheduler = scheduler(&connector, SchedulerOptions::default()).await;
        scheduler.mark_draining();
        assert_eq!(scheduler.state(), SchedulerState::Draining);
        assert!(scheduler.dispatch("k", Operation::Get).await.is_ok());
    }
}

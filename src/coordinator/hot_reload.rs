use super::source::RouteSource;
use crate::backend::NodeConnector;
use crate::core::{Operation, ProxyError, Reply, Result};
use crate::route::{RouteDescription, RouteTable};
use crate::scheduler::{Scheduler, SchedulerOptions, SchedulerStats};
use arc_swap::ArcSwap;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::JoinSet;
use tracing::{Instrument, Level, event, info_span};

/// Settings shared by every scheduler the coordinator builds.
#[derive(Debug, Clone)]
pub struct CoordinatorOptions {
    /// Replication factor every route table must satisfy.
    pub replicas: usize,
    pub scheduler: SchedulerOptions,
    /// Grace period between superseding a scheduler and closing it.
    pub retire_delay: Duration,
}

impl Default for CoordinatorOptions {
    fn default() -> Self {
        let scheduler = SchedulerOptions::default();
        Self {
            replicas: 3,
            retire_delay: scheduler.read_timeout * 5,
            scheduler,
        }
    }
}

impl CoordinatorOptions {
    pub fn replicas(mut self, replicas: usize) -> Self {
        self.replicas = replicas;
        self
    }

    pub fn scheduler(mut self, scheduler: SchedulerOptions) -> Self {
        self.scheduler = scheduler;
        self
    }

    pub fn retire_delay(mut self, delay: Duration) -> Self {
        self.retire_delay = delay;
        self
    }
}

/// Successful reload results.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ReloadOutcome {
    /// A new scheduler was published.
    Applied { version: u64, previous: u64 },
    /// The candidate did not advance the version; nothing changed.
    AlreadyCurrent { version: u64 },
}

/// Coordinator state for the admin surface.
#[derive(Debug, Clone, Serialize)]
pub struct CoordinatorStatus {
    pub active_version: u64,
    pub last_applied_version: u64,
    pub last_reload_at: Option<DateTime<Utc>>,
    pub reload_count: u64,
    pub reloading: bool,
    pub retiring: usize,
    pub shut_down: bool,
}

/// Owns the active scheduler and swaps it on reload.
///
/// Readers get the active scheduler with one atomic load; a reload builds the
/// replacement off to the side, swaps it in and hands the previous one to a
/// retire task that closes it after `retire_delay`.
pub struct Coordinator {
    active: ArcSwap<Scheduler>,
    last_applied: AtomicU64,
    reload_gate: tokio::sync::Mutex<()>,
    connector: Arc<dyn NodeConnector>,
    options: CoordinatorOptions,
    /// Superseded schedulers not yet closed.
    retiring: Arc<Mutex<Vec<Arc<Scheduler>>>>,
    retire_tasks: Mutex<JoinSet<()>>,
    last_reload_at: Mutex<Option<DateTime<Utc>>>,
    reload_count: AtomicU64,
    reloading: AtomicBool,
    shut_down: AtomicBool,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Holds the `reloading` status up for as long as it lives, so a reload
/// future dropped mid-way does not leave it set.
struct ReloadingFlag<'a>(&'a AtomicBool);

impl<'a> ReloadingFlag<'a> {
    fn raise(flag: &'a AtomicBool) -> Self {
        flag.store(true, Ordering::SeqCst);
        Self(flag)
    }
}

impl Drop for ReloadingFlag<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

impl Coordinator {
    /// Builds and publishes the initial scheduler from `route_text`.
    pub async fn new(
        route_text: &str,
        connector: Arc<dyn NodeConnector>,
        options: CoordinatorOptions,
    ) -> Result<Self> {
        let table = Arc::new(RouteTable::parse(route_text, options.replicas)?);
        let version = table.version();
        let scheduler = Scheduler::build(table, connector.as_ref(), options.scheduler.clone()).await?;

        event!(Level::INFO, version, "initial route applied");
        Ok(Self {
            active: ArcSwap::from_pointee(scheduler),
            last_applied: AtomicU64::new(version),
            reload_gate: tokio::sync::Mutex::new(()),
            connector,
            options,
            retiring: Arc::new(Mutex::new(Vec::new())),
            retire_tasks: Mutex::new(JoinSet::new()),
            last_reload_at: Mutex::new(Some(Utc::now())),
            reload_count: AtomicU64::new(0),
            reloading: AtomicBool::new(false),
            shut_down: AtomicBool::new(false),
        })
    }

    pub fn options(&self) -> &CoordinatorOptions {
        &self.options
    }

    /// The scheduler new requests go to.
    pub fn current(&self) -> Arc<Scheduler> {
        self.active.load_full()
    }

    pub fn last_applied_version(&self) -> u64 {
        self.last_applied.load(Ordering::SeqCst)
    }

    pub fn is_shut_down(&self) -> bool {
        self.shut_down.load(Ordering::SeqCst)
    }

    /// Runs `op` on the active scheduler.
    ///
    /// A request that picked a scheduler which closed before it was admitted
    /// is retried once on the scheduler that replaced it.
    pub async fn dispatch(&self, key: &str, op: Operation) -> Result<Reply> {
        let scheduler = self.current();
        match scheduler.dispatch(key, op.clone()).await {
            Err(ProxyError::SchedulerClosed) if !Arc::ptr_eq(&scheduler, &*self.active.load()) => {
                self.current().dispatch(key, op).await
            }
            result => result,
        }
    }

    pub fn current_stats(&self) -> SchedulerStats {
        self.active.load().stats()
    }

    pub fn current_route(&self) -> RouteDescription {
        self.active.load().table().to_description()
    }

    pub fn status(&self) -> CoordinatorStatus {
        CoordinatorStatus {
            active_version: self.active.load().version(),
            last_applied_version: self.last_applied_version(),
            last_reload_at: *lock(&self.last_reload_at),
            reload_count: self.reload_count.load(Ordering::SeqCst),
            reloading: self.reloading.load(Ordering::SeqCst),
            retiring: lock(&self.retiring).len(),
            shut_down: self.is_shut_down(),
        }
    }

    /// Fetches a description from `source` and reloads it.
    pub async fn reload_from(&self, source: &dyn RouteSource) -> Result<ReloadOutcome> {
        let text = source.fetch().await?;
        self.reload(&text).await
    }

    /// Validates `route_text` and, when it advances the version, publishes a
    /// scheduler for it.
    ///
    /// Fails with [`ProxyError::ReloadInProgress`] while another reload runs.
    /// On any error the active scheduler is left untouched.
    pub async fn reload(&self, route_text: &str) -> Result<ReloadOutcome> {
        let Ok(_gate) = self.reload_gate.try_lock() else {
            event!(Level::WARN, "reload rejected, another reload is in progress");
            return Err(ProxyError::ReloadInProgress);
        };
        if self.is_shut_down() {
            return Err(ProxyError::SchedulerClosed);
        }

        let span = info_span!("coordinator.reload", current = self.last_applied_version());
        let _reloading = ReloadingFlag::raise(&self.reloading);
        async move {
            let table = match RouteTable::parse(route_text, self.options.replicas) {
                Ok(table) => table,
                Err(err) => {
                    event!(Level::WARN, error = %err, "route rejected");
                    return Err(err);
                }
            };

            let current = self.last_applied_version();
            if !table.is_newer_than(current) {
                event!(
                    Level::INFO,
                    candidate = table.version(),
                    "route already current"
                );
                return Ok(ReloadOutcome::AlreadyCurrent { version: current });
            }

            let version = table.version();
            let scheduler = self.build_detached(Arc::new(table)).await.inspect_err(|err| {
                event!(Level::WARN, version, error = %err, "scheduler build failed");
            })?;

            let previous = self.active.swap(Arc::new(scheduler));
            self.last_applied.store(version, Ordering::SeqCst);
            *lock(&self.last_reload_at) = Some(Utc::now());
            self.reload_count.fetch_add(1, Ordering::SeqCst);

            let previous_version = previous.version();
            previous.mark_draining();
            self.retire(previous);

            event!(
                Level::INFO,
                version,
                previous = previous_version,
                "route reloaded"
            );
            Ok(ReloadOutcome::Applied {
                version,
                previous: previous_version,
            })
        }
        .instrument(span)
        .await
    }

    /// Builds a scheduler in its own task. When the waiting reload is dropped
    /// before the build finishes, the task closes the unpublished scheduler.
    async fn build_detached(&self, table: Arc<RouteTable>) -> Result<Scheduler> {
        let (built_tx, built_rx) = oneshot::channel();
        let connector = self.connector.clone();
        let options = self.options.scheduler.clone();

        let build = async move {
            let built = Scheduler::build(table, connector.as_ref(), options).await;
            if let Err(Ok(orphan)) = built_tx.send(built) {
                event!(
                    Level::INFO,
                    version = orphan.version(),
                    "reload abandoned, closing unpublished scheduler"
                );
                orphan.close().await;
            }
        };
        tokio::spawn(build.in_current_span());

        built_rx.await.map_err(|_| {
            ProxyError::Io("scheduler build task ended without a result".to_string())
        })?
    }

    /// Closes `scheduler` once the retire delay has passed, off the reload path.
    fn retire(&self, scheduler: Arc<Scheduler>) {
        lock(&self.retiring).push(scheduler.clone());

        let delay = self.options.retire_delay;
        let retiring = self.retiring.clone();
        let mut tasks = lock(&self.retire_tasks);
        while tasks.try_join_next().is_some() {}

        tasks.spawn(async move {
            tokio::time::sleep(delay).await;
            scheduler.close().await;
            lock(&retiring).retain(|pending| !Arc::ptr_eq(pending, &scheduler));
        });
    }

    /// Stops reloads, closes retired schedulers without waiting for their
    /// delay and closes the active one. All closes run concurrently.
    pub async fn shutdown(&self) {
        if self.shut_down.swap(true, Ordering::SeqCst) {
            return;
        }
        let _gate = self.reload_gate.lock().await;

        lock(&self.retire_tasks).abort_all();
        let mut schedulers: Vec<Arc<Scheduler>> = lock(&self.retiring).drain(..).collect();
        schedulers.push(self.current());

        futures::future::join_all(schedulers.iter().map(|scheduler| scheduler.close())).await;
        event!(Level::INFO, "coordinator shut down");
    }
}

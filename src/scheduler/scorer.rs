use serde::Serialize;
use std::cmp::Ordering;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, MutexGuard, RwLock};
use std::time::{Duration, Instant};

/// Tuning of the health score.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScorerConfig {
    /// Weight kept by past outcomes on every new outcome, in (0, 1).
    pub decay: f64,
    /// Latency at which the latency factor halves the score.
    pub latency_reference: Duration,
    /// Nodes scoring below this are too unhealthy to prefer.
    pub unhealthy_threshold: f64,
    /// Outcome history loses half its weight every `recovery_half_life` of
    /// wall-clock time, so a node that stopped receiving traffic drifts back
    /// to the neutral score.
    pub recovery_half_life: Duration,
}

impl Default for ScorerConfig {
    fn default() -> Self {
        Self {
            decay: 0.9,
            latency_reference: Duration::from_millis(50),
            unhealthy_threshold: 0.2,
            recovery_half_life: Duration::from_secs(10),
        }
    }
}

/// Decayed outcome history of one node.
///
/// Counters shrink by `decay` on every outcome, so at most `1 / (1 - decay)`
/// outcomes' worth of history is remembered. They also age with wall-clock
/// time (see [`ScorerConfig::recovery_half_life`]). The latency estimate only
/// changes when the node is measured again.
#[derive(Debug, Clone, PartialEq)]
pub struct NodeHealth {
    success_count: f64,
    failure_count: f64,
    latency_estimate_ms: f64,
    samples: u64,
    score: f64,
    aged_at: Option<Instant>,
}

impl Default for NodeHealth {
    fn default() -> Self {
        Self {
            success_count: 0.0,
            failure_count: 0.0,
            latency_estimate_ms: 0.0,
            samples: 0,
            score: NodeHealth::NEUTRAL_SCORE,
            aged_at: None,
        }
    }
}

impl NodeHealth {
    /// Score of a node without any recorded outcome.
    pub const NEUTRAL_SCORE: f64 = 0.5;

    /// Applies the wall-clock aging accumulated since the last update.
    fn age(&mut self, now: Instant, config: &ScorerConfig) {
        let Some(aged_at) = self.aged_at else {
            return;
        };
        let elapsed = now.saturating_duration_since(aged_at);
        let half_life = config.recovery_half_life.as_secs_f64();
        if elapsed.is_zero() || half_life <= 0.0 {
            return;
        }
        let factor = 0.5_f64.powf(elapsed.as_secs_f64() / half_life);
        self.success_count *= factor;
        self.failure_count *= factor;
        self.aged_at = Some(now);
        self.score = self.compute_score(config);
    }

    fn record(&mut self, success: bool, latency: Duration, config: &ScorerConfig) {
        let now = Instant::now();
        self.age(now, config);
        let decay = config.decay;
        let latency_ms = latency.as_secs_f64() * 1000.0;

        self.success_count = self.success_count * decay + if success { 1.0 } else { 0.0 };
        self.failure_count = self.failure_count * decay + if success { 0.0 } else { 1.0 };
        self.latency_estimate_ms = if self.samples == 0 {
            latency_ms
        } else {
            self.latency_estimate_ms * decay + latency_ms * (1.0 - decay)
        };
        self.samples = self.samples.saturating_add(1);
        self.aged_at = Some(now);
        self.score = self.compute_score(config);
    }

    /// Laplace-smoothed success ratio scaled by a latency factor; always in (0, 1].
    fn compute_score(&self, config: &ScorerConfig) -> f64 {
        let ratio = (self.success_count + 1.0) / (self.success_count + self.failure_count + 2.0);
        let reference_ms = (config.latency_reference.as_secs_f64() * 1000.0).max(f64::EPSILON);
        let latency_factor = 1.0 / (1.0 + self.latency_estimate_ms.max(0.0) / reference_ms);
        let score = ratio * latency_factor;
        if score.is_finite() {
            score.clamp(f64::MIN_POSITIVE, 1.0)
        } else {
            f64::MIN_POSITIVE
        }
    }

    pub fn score(&self) -> f64 {
        self.score
    }

    fn snapshot(&self, config: &ScorerConfig) -> NodeHealthSnapshot {
        NodeHealthSnapshot {
            success_count: self.success_count,
            failure_count: self.failure_count,
            latency_ms: self.latency_estimate_ms,
            samples: self.samples,
            score: self.score,
            unhealthy: self.score < config.unhealthy_threshold,
        }
    }
}

/// Exported view of one node's health.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NodeHealthSnapshot {
    pub success_count: f64,
    pub failure_count: f64,
    pub latency_ms: f64,
    pub samples: u64,
    pub score: f64,
    pub unhealthy: bool,
}

/// Per-node health scores shared by every request of one scheduler.
///
/// Locks are held only for the arithmetic of a single update or read, never
/// across I/O. A poisoned lock is recovered: each update leaves the entry
/// consistent before it can panic.
#[derive(Debug, Default)]
pub struct Scorer {
    config: ScorerConfig,
    nodes: RwLock<HashMap<String, Mutex<NodeHealth>>>,
}

fn lock_health(entry: &Mutex<NodeHealth>) -> MutexGuard<'_, NodeHealth> {
    entry.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn current_score(entry: &Mutex<NodeHealth>, now: Instant, config: &ScorerConfig) -> f64 {
    let mut health = lock_health(entry);
    health.age(now, config);
    health.score()
}

impl Scorer {
    pub fn new(config: ScorerConfig) -> Self {
        Self {
            config,
            nodes: RwLock::new(HashMap::new()),
        }
    }

    /// Scorer with an entry for every address already present.
    pub fn with_nodes<'a>(config: ScorerConfig, addrs: impl IntoIterator<Item = &'a String>) -> Self {
        let nodes = addrs
            .into_iter()
            .map(|addr| (addr.clone(), Mutex::new(NodeHealth::default())))
            .collect();
        Self {
            config,
            nodes: RwLock::new(nodes),
        }
    }

    pub fn config(&self) -> &ScorerConfig {
        &self.config
    }

    /// Folds one completed attempt into the node's health.
    ///
    /// Unknown addresses get a fresh entry.
    pub fn record_outcome(&self, addr: &str, success: bool, latency: Duration) {
        {
            let nodes = self.nodes.read().unwrap_or_else(|poisoned| poisoned.into_inner());
            if let Some(entry) = nodes.get(addr) {
                lock_health(entry).record(success, latency, &self.config);
                return;
            }
        }

        let mut nodes = self.nodes.write().unwrap_or_else(|poisoned| poisoned.into_inner());
        let entry = nodes
            .entry(addr.to_string())
            .or_insert_with(|| Mutex::new(NodeHealth::default()));
        lock_health(entry).record(success, latency, &self.config);
    }

    /// Current score, neutral for unknown nodes.
    pub fn score(&self, addr: &str) -> f64 {
        let nodes = self.nodes.read().unwrap_or_else(|poisoned| poisoned.into_inner());
        nodes
            .get(addr)
            .map(|entry| current_score(entry, Instant::now(), &self.config))
            .unwrap_or(NodeHealth::NEUTRAL_SCORE)
    }

    pub fn is_unhealthy(&self, addr: &str) -> bool {
        self.score(addr) < self.config.unhealthy_threshold
    }

    /// Orders `addrs` best-first: higher score first, ties by address.
    pub fn rank(&self, addrs: &[String]) -> Vec<String> {
        let now = Instant::now();
        let mut scored: Vec<(f64, &String)> = {
            let nodes = self.nodes.read().unwrap_or_else(|poisoned| poisoned.into_inner());
            addrs
                .iter()
                .map(|addr| {
                    let score = nodes
                        .get(addr)
                        .map(|entry| current_score(entry, now, &self.config))
                        .unwrap_or(NodeHealth::NEUTRAL_SCORE);
                    (score, addr)
                })
                .collect()
        };

        scored.sort_by(|(left_score, left), (right_score, right)| {
            right_score
                .partial_cmp(left_score)
                .unwrap_or(Ordering::Equal)
                .then_with(|| left.cmp(right))
        });
        scored.into_iter().map(|(_, addr)| addr.clone()).collect()
    }

    pub fn snapshot(&self) -> BTreeMap<String, NodeHealthSnapshot> {
        let now = Instant::now();
        let nodes = self.nodes.read().unwrap_or_else(|poisoned| poisoned.into_inner());
        nodes
            .iter()
            .map(|(addr, entry)| {
                let mut health = lock_health(entry);
                health.age(now, &self.config);
                (addr.clone(), health.snapshot(&self.config))
            })
            .collect()
    }
}

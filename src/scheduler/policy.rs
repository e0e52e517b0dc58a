use super::scorer::ScorerConfig;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// How many replica acknowledgements make a write successful.
///
/// Every replica is always written and every outcome is scored; the quorum
/// only decides what the caller is told.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WriteQuorum {
    /// Every replica must acknowledge.
    #[default]
    All,
    /// One acknowledgement is enough, the rest are best-effort.
    FirstSuccess,
    /// At least this many replicas, capped at the replica count.
    AtLeast(usize),
}

impl WriteQuorum {
    /// Acknowledgements required out of `replicas`.
    pub fn required(&self, replicas: usize) -> usize {
        match self {
            WriteQuorum::All => replicas,
            WriteQuorum::FirstSuccess => replicas.min(1),
            WriteQuorum::AtLeast(w) => (*w).clamp(1, replicas.max(1)).min(replicas),
        }
    }
}

/// Everything a scheduler needs besides its route table and connector.
#[derive(Debug, Clone)]
pub struct SchedulerOptions {
    pub read_timeout: Duration,
    pub write_timeout: Duration,
    /// Upper bound of [`Scheduler::close`](super::Scheduler::close) waiting for in-flight work.
    pub drain_timeout: Duration,
    pub write_quorum: WriteQuorum,
    pub max_inflight: usize,
    pub max_key_len: usize,
    pub scorer: ScorerConfig,
}

impl Default for SchedulerOptions {
    fn default() -> Self {
        Self {
            read_timeout: Duration::from_millis(2000),
            write_timeout: Duration::from_millis(2000),
            drain_timeout: Duration::from_millis(10_000),
            write_quorum: WriteQuorum::All,
            max_inflight: 4096,
            max_key_len: 250,
            scorer: ScorerConfig::default(),
        }
    }
}

impl SchedulerOptions {
    pub fn read_timeout(mut self, timeout: Duration) -> Self {
        self.read_timeout = timeout;
        self
    }

    pub fn write_timeout(mut self, timeout: Duration) -> Self {
        self.write_timeout = timeout;
        self
    }

    pub fn drain_timeout(mut self, timeout: Duration) -> Self {
        self.drain_timeout = timeout;
        self
    }

    pub fn write_quorum(mut self, quorum: WriteQuorum) -> Self {
        self.write_quorum = quorum;
        self
    }

    pub fn max_inflight(mut self, max: usize) -> Self {
        self.max_inflight = max;
        self
    }

    pub fn max_key_len(mut self, max: usize) -> Self {
        self.max_key_len = max;
        self
    }

    pub fn scorer(mut self, scorer: ScorerConfig) -> Self {
        self.scorer = scorer;
        self
    }
}

use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProxyError {
    #[error("Malformed route: {0}")]
    MalformedRoute(String),

    #[error("Config error: {0}")]
    Config(String),

    #[error("Invalid key: {0}")]
    InvalidKey(String),

    #[error("Node '{addr}' timed out after {timeout_ms}ms")]
    NodeTimeout { addr: String, timeout_ms: u64 },

    #[error("Node '{addr}' unavailable: {reason}")]
    NodeUnavailable { addr: String, reason: String },

    #[error("Protocol error from node '{addr}': {reason}")]
    Protocol { addr: String, reason: String },

    #[error("All {attempts} replicas failed for key '{key}', last error: {last_error}")]
    AllReplicasFailed {
        key: String,
        attempts: usize,
        last_error: String,
    },

    #[error(
        "Write quorum not met for key '{key}': required {required}, acknowledged {acknowledged}, failed: {}",
        .failed.join("; ")
    )]
    WriteQuorumNotMet {
        key: String,
        required: usize,
        acknowledged: usize,
        failed: Vec<String>,
    },

    #[error("Partition {partition} has no configured replicas")]
    NoReplicasConfigured { partition: u32 },

    #[error("reloading")]
    ReloadInProgress,

    #[error("Scheduler is closed")]
    SchedulerClosed,

    #[error("Backpressure: {0}")]
    Backpressure(String),

    #[error("I/O error: {0}")]
    Io(String),
}

impl ProxyError {
    /// True for invariant violations that need operator attention rather than a retry.
    pub fn is_fatal_configuration(&self) -> bool {
        matches!(self, Self::NoReplicasConfigured { .. })
    }

    /// True for errors that belong to a single node attempt.
    pub fn is_node_level(&self) -> bool {
        matches!(
            self,
            Self::NodeTimeout { .. } | Self::NodeUnavailable { .. } | Self::Protocol { .. }
        )
    }
}

pub type Result<T> = std::result::Result<T, ProxyError>;

impl From<std::io::Error> for ProxyError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err.to_string())
    }
}

impl From<serde_yaml::Error> for ProxyError {
    fn from(err: serde_yaml::Error) -> Self {
        Self::MalformedRoute(err.to_string())
    }
}

use super::error::{ProxyError, Result};
use serde::Serialize;

/// A client operation against one key.
///
/// The set is closed: every variant is either served by read-with-failover
/// or by write-with-replication, see [`Operation::kind`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Operation {
    Get,
    Set(Vec<u8>),
    Delete,
}

/// How the scheduler executes an [`Operation`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum OperationKind {
    Read,
    Write,
}

impl Operation {
    pub fn kind(&self) -> OperationKind {
        match self {
            Operation::Get => OperationKind::Read,
            Operation::Set(_) | Operation::Delete => OperationKind::Write,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Operation::Get => "get",
            Operation::Set(_) => "set",
            Operation::Delete => "delete",
        }
    }
}

/// Client-visible result of a dispatched operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    /// Read result; `None` when the serving replica does not hold the key.
    Value {
        node: String,
        value: Option<Vec<u8>>,
    },
    /// Write accepted under the configured quorum.
    Written(WriteReport),
}

impl Reply {
    pub fn value(&self) -> Option<&[u8]> {
        match self {
            Reply::Value { value, .. } => value.as_deref(),
            Reply::Written(_) => None,
        }
    }
}

/// Per-write acknowledgement summary.
///
/// `pending` counts replicas whose outcome was not awaited because the quorum
/// was already decided; their results still reach the health scores.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WriteReport {
    pub required: usize,
    pub acknowledged: Vec<String>,
    pub failed: Vec<String>,
    pub pending: usize,
}

/// Rejects keys the storage nodes cannot address.
pub fn validate_key(key: &str, max_len: usize) -> Result<()> {
    if key.is_empty() {
        return Err(ProxyError::InvalidKey("key must not be empty".to_string()));
    }
    if key.len() > max_len {
        return Err(ProxyError::InvalidKey(format!(
            "key length {} exceeds max_key_len {}",
            key.len(),
            max_len
        )));
    }
    if key.bytes().any(|b| b.is_ascii_whitespace() || b.is_ascii_control()) {
        return Err(ProxyError::InvalidKey(
            "key must not contain whitespace or control characters".to_string(),
        ));
    }
    Ok(())
}

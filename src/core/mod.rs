pub mod error;
pub mod types;

pub use error::{ProxyError, Result};
pub use types::{Operation, OperationKind, Reply, WriteReport, validate_key};

//! Health-scored replica selection and request execution.

pub mod engine;
pub mod policy;
pub mod scorer;

pub use engine::{Scheduler, SchedulerState, SchedulerStats};
pub use policy::{SchedulerOptions, WriteQuorum};
pub use scorer::{NodeHealth, NodeHealthSnapshot, Scorer, ScorerConfig};

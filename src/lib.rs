pub mod config;
pub mod dump;
pub mod error;
pub mod expiration;
pub mod job;
pub mod protocol;
pub mod queue;
pub mod registry;

pub use config::{FieldLimits, QueueConfig, QueueTimeouts};
pub use dump::DumpContext;
pub use error::{QueueError, Result};
pub use expiration::{compute_expiration, JobTimeouts};
pub use job::{Job, JobEvent, JobEventKind, JobStatus, TokenCompareResult};
pub use queue::{DispatchedJob, Queue, ReadableJob, SubmittedJob};
pub use registry::{AffinityRegistry, GroupRegistry};

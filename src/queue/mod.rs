//! The durable publish queue: job records, their lifecycle and the stores
//! that keep them.

mod job;
mod key;
mod memory;
mod sqlite;
mod store;

pub use job::{
    EnqueueOutcome, FailureDisposition, Job, JobHandle, JobStatus, NewJob, TransitionError,
    ValidationError,
};
pub use key::derive_key;
pub use memory::InMemoryJobStore;
pub use sqlite::SqliteJobStore;
pub use store::{JobStatistics, JobStore, QueuePolicy, StoreError};

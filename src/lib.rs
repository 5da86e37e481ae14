//! Scheduled, at-most-once publishing of image posts to the Instagram Graph
//! API.
//!
//! Jobs are enqueued idempotently into a [`queue::JobStore`]; a
//! [`scheduler::Scheduler`] tick claims the due ones and drives each through
//! the [`publish::PublishWorkflow`].

pub mod backoff;
pub mod cli;
pub mod clock;
pub mod config;
pub mod error;
pub mod graph;
pub mod logging;
pub mod publish;
pub mod queue;
pub mod scheduler;
pub mod ui;

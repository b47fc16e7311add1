//! # DataSync Engine
//!
//! Coordination primitives the sync server is built from.
//!
//! This crate provides:
//! - [`Queue`]: a durable, lease-based job queue on a [`DocumentStore`]
//! - [`Worker`]: a poll loop draining one queue through one [`Processor`]
//! - [`DistributedLock`]: TTL-bounded mutual exclusion for leader election
//! - [`Metrics`]: per-key samples with aggregated stats
//! - [`Clock`]: wall-clock abstraction so lease expiry is testable
//!
//! Nothing in this crate knows about datasets, records or updates; queue
//! payloads are opaque JSON.
//!
//! ## Key Invariants
//!
//! - A message has at most one unexpired claim at any time
//! - A claimed message that is not acked before its lease expires becomes
//!   claimable again (at-least-once delivery)
//! - At most one holder owns an unexpired lock of a given name
//! - Stopping a worker lets its in-flight job finish
//!
//! [`DocumentStore`]: datasync_store::DocumentStore

#![deny(unsafe_code)]
#![warn(missing_docs)]
// Production code MUST NOT use panic!/unwrap()/expect()
#![warn(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

mod clock;
mod config;
mod error;
mod lock;
pub mod metrics;
mod queue;
mod worker;

pub use clock::{duration_ms, Clock, ManualClock, SystemClock};
pub use config::{QueueOptions, WorkerOptions};
pub use error::{EngineError, EngineResult, ProcessError};
pub use lock::{DistributedLock, LockEntry, LOCKS_COLLECTION};
pub use metrics::{MetricStats, Metrics, Timer};
pub use queue::{MessageState, Queue, QueueMessage};
pub use worker::{JobOutcome, Processor, Worker};

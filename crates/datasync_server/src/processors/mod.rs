//! Queue processors implementing the sync protocol.
//!
//! - [`AckProcessor`] drains the ack queue
//! - [`PendingProcessor`] applies client changes through the data handlers
//! - [`SyncProcessor`] recomputes a dataset client's view and emits updates

mod ack;
mod pending;
mod sync;

pub use ack::AckProcessor;
pub use pending::PendingProcessor;
pub use sync::{SyncJob, SyncProcessor};

use datasync_engine::ProcessError;
use datasync_store::StoreError;

/// Maps a store failure to the worker's retry policy.
fn store_failure(err: StoreError) -> ProcessError {
    if err.is_transient() {
        ProcessError::Retry(err.to_string())
    } else {
        ProcessError::Discard(err.to_string())
    }
}

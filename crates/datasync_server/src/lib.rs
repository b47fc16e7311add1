//! # DataSync Server
//!
//! Server-side sync coordination for offline-first clients.
//!
//! This crate provides:
//! - [`SyncServer`]: the context owning queues, workers and the scheduler
//! - [`SyncApi`]: the `sync` and `sync_records` entry points
//! - [`SyncScheduler`]: single-leader scheduling of dataset sync passes
//! - The ack, pending and sync processors draining the three queues
//! - [`DataHandler`] and [`Interceptor`] extension points
//!
//! # Architecture
//!
//! A sync call only enqueues work and returns what is already waiting:
//! 1. Acknowledgements go to the ack queue; the ack worker deletes the
//!    acknowledged updates and any collision they reported
//! 2. Pending changes go to the pending queue; the pending worker applies
//!    them through the dataset's data handler and records an `applied`,
//!    `failed` or `collision` update
//! 3. The scheduler leader periodically queues a sync job per active
//!    dataset client; the sync worker re-lists the client's records and
//!    emits `create`/`update`/`delete` updates for whatever changed
//! 4. The next sync call returns those updates until they are acknowledged
//!
//! Every process sharing a store runs all of this. Queue claims and the
//! scheduler lock are atomic store updates, so the processes need no other
//! coordination.
//!
//! # Example
//!
//! ```rust,ignore
//! use datasync_server::{DatasetOptions, ServerConfig, SyncServer};
//! use datasync_protocol::SyncRequest;
//! use datasync_store::InMemoryStore;
//!
//! let server = SyncServer::new(Arc::new(InMemoryStore::new()), ServerConfig::default());
//! server.init("todos", DatasetOptions::default()).await?;
//! let response = server.sync("todos", SyncRequest::new("device-1")).await?;
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]
// Production code MUST NOT use panic!/unwrap()/expect()
#![warn(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

mod api;
mod config;
mod error;
mod handlers;
mod interceptors;
mod processors;
mod scheduler;
mod server;
mod storage;
#[cfg(test)]
mod testing;

pub use api::{ClientUpdateQueue, SyncApi};
pub use config::{DatasetOptions, DatasetRegistry, ServerConfig};
pub use error::{HandlerError, HandlerResult, ServerError, ServerResult};
pub use handlers::{CollisionRecord, CreatedRecord, DataHandler, DataHandlers, StoreDataHandler};
pub use interceptors::{InterceptContext, Interceptor, Interceptors, PassThrough};
pub use processors::{AckProcessor, PendingProcessor, SyncJob, SyncProcessor};
pub use scheduler::SyncScheduler;
pub use server::{SyncServer, ACK_QUEUE, PENDING_QUEUE, SYNC_QUEUE};
pub use storage::{ClientAccess, PendingRecord, SyncStorage, DATASET_CLIENTS_COLLECTION, PENDING_COLLECTION, UPDATES_COLLECTION};

//! # DataSync Store
//!
//! Shared document store abstraction for DataSync.
//!
//! Every piece of durable sync state (queue messages, the scheduler lock,
//! dataset clients, updates, application records) lives in a
//! [`DocumentStore`]. The store is the single synchronization point of a
//! DataSync cluster: all mutual exclusion is expressed as atomic
//! conditional updates against it, never as in-process locks.
//!
//! ## Design Principles
//!
//! - Documents are JSON objects keyed by a string `_id`
//! - Queries are expressed with [`Filter`], [`Patch`] and [`Sort`] so that
//!   any backend with a conditional `find_one_and_update` can implement them
//! - [`DocumentStore::find_one_and_update`] is atomic per call; the queue
//!   claim and the lock acquire rely on this
//! - Backends must be `Send + Sync` and are shared as `Arc<dyn DocumentStore>`
//!
//! ## Available Backends
//!
//! - [`InMemoryStore`] - For tests and single-process deployments
//!
//! ## Example
//!
//! ```rust
//! use datasync_store::{DocumentStore, Filter, InMemoryStore, Patch, UpdateOptions};
//! use serde_json::json;
//!
//! # tokio::runtime::Runtime::new().unwrap().block_on(async {
//! let store = InMemoryStore::new();
//! store
//!     .insert_one("jobs", datasync_store::document(json!({"_id": "a", "state": "new"})))
//!     .await
//!     .unwrap();
//!
//! let claimed = store
//!     .find_one_and_update(
//!         "jobs",
//!         &Filter::eq("state", "new"),
//!         None,
//!         &Patch::new().set("state", "taken"),
//!         UpdateOptions::default(),
//!     )
//!     .await
//!     .unwrap();
//! assert_eq!(claimed.unwrap()["state"], "taken");
//! # });
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]
// Production code MUST NOT use panic!/unwrap()/expect()
#![warn(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

mod backend;
mod error;
mod memory;
mod query;

pub use backend::{DocumentStore, IndexSpec, UpdateOptions};
pub use error::{StoreError, StoreResult};
pub use memory::InMemoryStore;
pub use query::{compare_values, document, Document, Filter, Patch, Sort, SortDirection, ID_FIELD};

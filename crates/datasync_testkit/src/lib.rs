//! # DataSync Testkit
//!
//! Test utilities for DataSync.
//!
//! This crate provides:
//! - Servers with fast poll intervals over in-memory stores
//! - Sample pending changes with correct record hashes
//! - A failure-injecting store wrapper
//! - Property-based test generators using proptest
//! - Concurrent load helpers
//!
//! Cross-crate integration tests live in this crate's `tests/` directory.
//!
//! ## Usage
//!
//! ```rust,ignore
//! use datasync_testkit::prelude::*;
//!
//! #[tokio::test]
//! async fn syncs() {
//!     let server = TestServer::memory();
//!     server.sync("todos", SyncRequest::new("c1")).await.unwrap();
//! }
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod fixtures;
pub mod generators;
pub mod stress;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::fixtures::*;
    pub use crate::generators::*;
    pub use crate::stress::*;
    pub use datasync_protocol::{PendingChange, SyncRequest, UpdateType};
}

pub use fixtures::*;
pub use generators::*;
pub use stress::*;

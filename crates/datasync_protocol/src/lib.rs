//! # DataSync Protocol
//!
//! Sync protocol types and record hashing for DataSync.
//!
//! This crate provides:
//! - [`SyncRequest`] / [`SyncResponse`] as exchanged with the transport layer
//! - [`PendingChange`] and [`Acknowledgement`] submitted by clients
//! - [`Update`] records produced by the server and their per-type grouping
//! - [`DatasetClient`] sync sessions and their content-derived ids
//! - [`HashProvider`] for deterministic record and dataset hashes
//! - Record diffing for the sync-records exchange
//!
//! This is a pure protocol crate with no I/O operations. Field names on
//! the wire follow the established client SDKs (`query_params`,
//! `meta_data`, `_fh.cuid`, camelCase record fields).

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod change;
mod client;
mod error;
mod hash;
mod messages;
mod records;
mod update;

pub use change::{Acknowledgement, PendingAction, PendingChange, PendingStatus};
pub use client::DatasetClient;
pub use error::{ProtocolError, ProtocolResult};
pub use hash::{canonical_json, HashProvider, Sha256HashProvider};
pub use messages::{ClientMeta, SyncRecordsRequest, SyncRecordsResponse, SyncRequest, SyncResponse};
pub use records::{diff_records, RecordDiff, RecordEntry};
pub use update::{format_updates, remove_acknowledged, FormattedUpdates, Update, UpdateType};

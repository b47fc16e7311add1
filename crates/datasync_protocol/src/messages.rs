//! Request and response bodies exchanged with the transport layer.

use crate::change::{Acknowledgement, PendingChange};
use crate::records::RecordEntry;
use crate::update::FormattedUpdates;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

/// Client SDK metadata attached to every request.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientMeta {
    /// Client connection id.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cuid: Option<String>,
}

/// A sync request for one dataset.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SyncRequest {
    /// Query the client filters the dataset with.
    #[serde(default)]
    pub query_params: Value,
    /// Client meta data.
    #[serde(default)]
    pub meta_data: Value,
    /// Local changes to apply.
    #[serde(default)]
    pub pending: Vec<PendingChange>,
    /// Updates the client has received.
    #[serde(default)]
    pub acknowledgements: Vec<Acknowledgement>,
    /// Client SDK metadata.
    #[serde(default, rename = "_fh", alias = "__fh")]
    pub client: ClientMeta,
}

impl SyncRequest {
    /// Creates an empty request from the given client connection.
    pub fn new(cuid: impl Into<String>) -> Self {
        Self {
            client: ClientMeta {
                cuid: Some(cuid.into()),
            },
            ..Self::default()
        }
    }

    /// Sets the query params.
    pub fn with_query_params(mut self, query_params: Value) -> Self {
        self.query_params = query_params;
        self
    }

    /// Sets the meta data.
    pub fn with_meta_data(mut self, meta_data: Value) -> Self {
        self.meta_data = meta_data;
        self
    }

    /// Adds a pending change.
    pub fn with_pending(mut self, change: PendingChange) -> Self {
        self.pending.push(change);
        self
    }

    /// Adds an acknowledgement.
    pub fn with_acknowledgement(mut self, hash: impl Into<String>) -> Self {
        self.acknowledgements.push(Acknowledgement::new(hash));
        self
    }

    /// The client connection id, if the SDK sent one.
    pub fn cuid(&self) -> Option<&str> {
        self.client.cuid.as_deref().filter(|c| !c.is_empty())
    }
}

/// Response to a [`SyncRequest`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SyncResponse {
    /// Global hash of the dataset as last computed for the client.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hash: Option<String>,
    /// Outstanding updates for the client connection.
    pub updates: FormattedUpdates,
}

/// A request comparing the client's records with the server's.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SyncRecordsRequest {
    /// Query the client filters the dataset with.
    #[serde(default)]
    pub query_params: Value,
    /// Client meta data.
    #[serde(default)]
    pub meta_data: Value,
    /// Record uid to record hash, as held by the client.
    #[serde(default, rename = "clientRecs")]
    pub client_recs: BTreeMap<String, String>,
    /// Client SDK metadata.
    #[serde(default, rename = "_fh", alias = "__fh")]
    pub client: ClientMeta,
}

/// The changes a client must apply to match the server's records.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SyncRecordsResponse {
    /// Global hash of the server's records.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hash: Option<String>,
    /// Records the client lacks.
    pub create: BTreeMap<String, RecordEntry>,
    /// Records whose content differs.
    pub update: BTreeMap<String, RecordEntry>,
    /// Records the client must drop.
    pub delete: BTreeMap<String, RecordEntry>,
}

//! Dataset client sync sessions.

use crate::hash::{canonical_json, Sha256HashProvider};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::BTreeMap;

/// A unique (dataset, query params, meta data) combination being synced.
///
/// Its id is a hash of the identifying fields, so every request with the
/// same combination maps onto the same record. Many client connections
/// (`cuids`) may share one dataset client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DatasetClient {
    /// Content-derived id.
    #[serde(rename = "_id")]
    pub id: String,
    /// Dataset being synced.
    pub dataset_id: String,
    /// Query the client filters the dataset with.
    #[serde(default)]
    pub query_params: Value,
    /// Client meta data passed to data handlers.
    #[serde(default)]
    pub meta_data: Value,
    /// Last time a sync request arrived (ms since epoch).
    #[serde(default)]
    pub last_accessed: i64,
    /// Global hash of the dataset as last computed for this client.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub global_hash: Option<String>,
    /// Sync paused for this client.
    #[serde(default)]
    pub stopped: bool,
    /// Last time the scheduler queued a sync pass (ms since epoch).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sync_scheduled: Option<i64>,
    /// Last time a sync pass finished (ms since epoch).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sync_completed: Option<i64>,
    /// Client connections that synced this combination.
    #[serde(default)]
    pub cuids: Vec<String>,
    /// Record uid to record hash, as of the last sync pass.
    #[serde(default)]
    pub records: BTreeMap<String, String>,
}

impl DatasetClient {
    /// Creates a dataset client for the combination, deriving its id.
    pub fn new(dataset_id: impl Into<String>, query_params: Value, meta_data: Value) -> Self {
        let dataset_id = dataset_id.into();
        Self {
            id: Self::compute_id(&dataset_id, &query_params, &meta_data),
            dataset_id,
            query_params,
            meta_data,
            last_accessed: 0,
            global_hash: None,
            stopped: false,
            sync_scheduled: None,
            sync_completed: None,
            cuids: Vec::new(),
            records: BTreeMap::new(),
        }
    }

    /// Deterministic id of a (dataset, query params, meta data) combination.
    ///
    /// `null` and `{}` are treated as the same (absent) parameter set.
    pub fn compute_id(dataset_id: &str, query_params: &Value, meta_data: &Value) -> String {
        let identity = json!({
            "datasetId": dataset_id,
            "queryParams": normalize(query_params),
            "metaData": normalize(meta_data),
        });
        Sha256HashProvider::digest(&canonical_json(&identity))
    }
}

fn normalize(value: &Value) -> Value {
    match value {
        Value::Null => json!({}),
        other => other.clone(),
    }
}

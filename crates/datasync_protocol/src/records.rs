//! Record-level diffing between a client's view and the server's.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

/// A record as returned to the client.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RecordEntry {
    /// Record content (absent for deletes).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    /// Record hash (absent for deletes).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hash: Option<String>,
}

/// Differences between two record sets, keyed by uid.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RecordDiff {
    /// Uids only the server has.
    pub create: BTreeMap<String, RecordEntry>,
    /// Uids both have, with different hashes.
    pub update: BTreeMap<String, RecordEntry>,
    /// Uids only the client has.
    pub delete: BTreeMap<String, RecordEntry>,
}

impl RecordDiff {
    /// Returns true if both sides agree.
    pub fn is_empty(&self) -> bool {
        self.create.is_empty() && self.update.is_empty() && self.delete.is_empty()
    }
}

/// Computes what a client holding `client` must change to match `server`.
///
/// `server` maps uid to `(record, hash)`; `client` maps uid to hash.
pub fn diff_records(
    server: &BTreeMap<String, (Value, String)>,
    client: &BTreeMap<String, String>,
) -> RecordDiff {
    let mut diff = RecordDiff::default();
    for (uid, (data, hash)) in server {
        let entry = || RecordEntry {
            data: Some(data.clone()),
            hash: Some(hash.clone()),
        };
        match client.get(uid) {
            None => {
                diff.create.insert(uid.clone(), entry());
            }
            Some(client_hash) if client_hash != hash => {
                diff.update.insert(uid.clone(), entry());
            }
            Some(_) => {}
        }
    }
    for uid in client.keys() {
        if !server.contains_key(uid) {
            diff.delete.insert(uid.clone(), RecordEntry::default());
        }
    }
    diff
}

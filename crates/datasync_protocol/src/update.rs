//! Server-produced updates and their response grouping.

use crate::change::Acknowledgement;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashSet};

/// What an update tells the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UpdateType {
    /// The client's pending change was applied.
    Applied,
    /// The client's pending change was rejected permanently.
    Failed,
    /// The client's pending change collided with a newer server version.
    Collision,
    /// A record appeared in the client's view of the dataset.
    Create,
    /// A record in the client's view changed.
    Update,
    /// A record left the client's view.
    Delete,
}

impl UpdateType {
    /// Lowercase name as used on the wire.
    pub fn as_str(&self) -> &'static str {
        match self {
            UpdateType::Applied => "applied",
            UpdateType::Failed => "failed",
            UpdateType::Collision => "collision",
            UpdateType::Create => "create",
            UpdateType::Update => "update",
            UpdateType::Delete => "delete",
        }
    }
}

/// A change the client must learn about, kept until acknowledged.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Update {
    /// Dataset the update belongs to.
    pub dataset_id: String,
    /// Client connection the update is addressed to.
    pub cuid: String,
    /// Hash the client acknowledges the update with.
    pub hash: String,
    /// Kind of update.
    #[serde(rename = "type")]
    pub update_type: UpdateType,
    /// Record uid the update concerns.
    pub uid: String,
    /// Client-side temporary uid replaced by `uid` (applied creates).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub old_uid: Option<String>,
    /// Record content relevant to the update.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub record_data: Option<Value>,
    /// Human-readable detail (failure reasons).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    /// Server timestamp (ms since epoch).
    #[serde(default)]
    pub timestamp: i64,
}

impl Update {
    /// Creates an update with no record data.
    pub fn new(
        dataset_id: impl Into<String>,
        cuid: impl Into<String>,
        hash: impl Into<String>,
        update_type: UpdateType,
        uid: impl Into<String>,
    ) -> Self {
        Self {
            dataset_id: dataset_id.into(),
            cuid: cuid.into(),
            hash: hash.into(),
            update_type,
            uid: uid.into(),
            old_uid: None,
            record_data: None,
            message: None,
            timestamp: 0,
        }
    }

    /// Attaches record content.
    pub fn with_record(mut self, record: Value) -> Self {
        self.record_data = Some(record);
        self
    }

    /// Attaches a message.
    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    /// Records the temporary uid this update replaces.
    pub fn with_old_uid(mut self, old_uid: impl Into<String>) -> Self {
        self.old_uid = Some(old_uid.into());
        self
    }

    /// Sets the timestamp.
    pub fn at(mut self, timestamp: i64) -> Self {
        self.timestamp = timestamp;
        self
    }
}

/// Updates grouped for the sync response.
///
/// `hashes` holds every update keyed by hash; `by_type` holds the same
/// updates under their type name (serialized as sibling keys of `hashes`).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FormattedUpdates {
    /// Every update keyed by its hash.
    pub hashes: BTreeMap<String, Update>,
    /// Updates keyed by type name, then by hash.
    #[serde(flatten)]
    pub by_type: BTreeMap<String, BTreeMap<String, Update>>,
}

impl FormattedUpdates {
    /// Updates of one type.
    pub fn of_type(&self, update_type: UpdateType) -> Option<&BTreeMap<String, Update>> {
        self.by_type.get(update_type.as_str())
    }

    /// Number of distinct updates.
    pub fn len(&self) -> usize {
        self.hashes.len()
    }

    /// Returns true if there are no updates.
    pub fn is_empty(&self) -> bool {
        self.hashes.is_empty()
    }
}

/// Groups updates by hash and by type.
pub fn format_updates<I>(updates: I) -> FormattedUpdates
where
    I: IntoIterator<Item = Update>,
{
    let mut formatted = FormattedUpdates::default();
    for update in updates {
        formatted
            .by_type
            .entry(update.update_type.as_str().to_string())
            .or_default()
            .insert(update.hash.clone(), update.clone());
        formatted.hashes.insert(update.hash.clone(), update);
    }
    formatted
}

/// Drops updates whose hash is acknowledged in `acknowledgements`.
///
/// Acknowledgements in a request are processed asynchronously, so the
/// updates they confirm may still be stored when the response is built.
pub fn remove_acknowledged(updates: Vec<Update>, acknowledgements: &[Acknowledgement]) -> Vec<Update> {
    if acknowledgements.is_empty() {
        return updates;
    }
    let acked: HashSet<&str> = acknowledgements.iter().map(|a| a.hash.as_str()).collect();
    updates
        .into_iter()
        .filter(|u| !acked.contains(u.hash.as_str()))
        .collect()
}

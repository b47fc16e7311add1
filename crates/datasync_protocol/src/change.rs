//! Client-submitted pending changes and acknowledgements.

use crate::error::{ProtocolError, ProtocolResult};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// The mutation a pending change performs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PendingAction {
    /// Create a new record.
    Create,
    /// Replace an existing record.
    Update,
    /// Delete an existing record.
    Delete,
}

impl PendingAction {
    /// Lowercase name as used on the wire.
    pub fn as_str(&self) -> &'static str {
        match self {
            PendingAction::Create => "create",
            PendingAction::Update => "update",
            PendingAction::Delete => "delete",
        }
    }
}

/// Lifecycle status of a pending change on the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PendingStatus {
    /// Received, not yet picked up.
    New,
    /// Being applied by a pending worker.
    Inflight,
    /// Applied to the dataset.
    Applied,
    /// Rejected permanently by the data handler.
    Failed,
    /// The record changed since the client's base version.
    Collision,
}

impl PendingStatus {
    /// Lowercase name as stored.
    pub fn as_str(&self) -> &'static str {
        match self {
            PendingStatus::New => "new",
            PendingStatus::Inflight => "inflight",
            PendingStatus::Applied => "applied",
            PendingStatus::Failed => "failed",
            PendingStatus::Collision => "collision",
        }
    }

    /// Returns true once no further transition can happen.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            PendingStatus::Applied | PendingStatus::Failed | PendingStatus::Collision
        )
    }
}

/// A local mutation submitted by a client.
///
/// `hash` identifies the change itself (it is what the client later
/// acknowledges); `pre_hash`/`post_hash` identify the record versions
/// before and after the change.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingChange {
    /// Hash identifying this change.
    pub hash: String,
    /// Mutation to perform.
    pub action: PendingAction,
    /// Record uid (a client-side temporary uid for creates).
    pub uid: String,
    /// Record content the client based its change on.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pre: Option<Value>,
    /// Hash of `pre`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pre_hash: Option<String>,
    /// Record content after the change.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub post: Option<Value>,
    /// Hash of `post`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub post_hash: Option<String>,
    /// Client timestamp of the change (ms since epoch).
    #[serde(default)]
    pub timestamp: i64,
    /// Dataset the change belongs to (stamped by the server).
    #[serde(default)]
    pub dataset_id: String,
    /// Submitting client connection (stamped by the server).
    #[serde(default)]
    pub cuid: String,
    /// Request meta data (stamped by the server).
    #[serde(default, rename = "meta_data")]
    pub meta_data: Value,
}

impl PendingChange {
    /// Creates a pending create.
    pub fn create(hash: impl Into<String>, uid: impl Into<String>, post: Value, post_hash: impl Into<String>) -> Self {
        Self {
            hash: hash.into(),
            action: PendingAction::Create,
            uid: uid.into(),
            pre: None,
            pre_hash: None,
            post: Some(post),
            post_hash: Some(post_hash.into()),
            timestamp: 0,
            dataset_id: String::new(),
            cuid: String::new(),
            meta_data: Value::Null,
        }
    }

    /// Creates a pending update from `pre` to `post`.
    pub fn update(
        hash: impl Into<String>,
        uid: impl Into<String>,
        pre: Value,
        pre_hash: impl Into<String>,
        post: Value,
        post_hash: impl Into<String>,
    ) -> Self {
        Self {
            action: PendingAction::Update,
            pre: Some(pre),
            pre_hash: Some(pre_hash.into()),
            ..Self::create(hash, uid, post, post_hash)
        }
    }

    /// Creates a pending delete of a record the client saw as `pre`.
    pub fn delete(hash: impl Into<String>, uid: impl Into<String>, pre: Value, pre_hash: impl Into<String>) -> Self {
        Self {
            hash: hash.into(),
            action: PendingAction::Delete,
            uid: uid.into(),
            pre: Some(pre),
            pre_hash: Some(pre_hash.into()),
            post: None,
            post_hash: None,
            timestamp: 0,
            dataset_id: String::new(),
            cuid: String::new(),
            meta_data: Value::Null,
        }
    }

    /// Checks that the fields required by the action are present.
    pub fn validate(&self) -> ProtocolResult<()> {
        let context = || format!("{} change {}", self.action.as_str(), self.hash);
        if self.hash.is_empty() {
            return Err(ProtocolError::missing("hash", context()));
        }
        match self.action {
            PendingAction::Create => {
                if self.post.is_none() {
                    return Err(ProtocolError::missing("post", context()));
                }
            }
            PendingAction::Update => {
                if self.pre_hash.is_none() {
                    return Err(ProtocolError::missing("preHash", context()));
                }
                if self.post.is_none() {
                    return Err(ProtocolError::missing("post", context()));
                }
            }
            PendingAction::Delete => {
                if self.pre_hash.is_none() {
                    return Err(ProtocolError::missing("preHash", context()));
                }
            }
        }
        Ok(())
    }
}

/// A client's confirmation that it received an update.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Acknowledgement {
    /// Hash of the acknowledged update.
    pub hash: String,
    /// Dataset (stamped by the server).
    #[serde(default)]
    pub dataset_id: String,
    /// Acknowledging client connection (stamped by the server).
    #[serde(default)]
    pub cuid: String,
}

impl Acknowledgement {
    /// Creates an acknowledgement for the given update hash.
    pub fn new(hash: impl Into<String>) -> Self {
        Self {
            hash: hash.into(),
            dataset_id: String::new(),
            cuid: String::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn decode_client_pending_record() {
        let raw = json!({
            "hash": "p1",
            "action": "update",
            "uid": "r1",
            "pre": {"name": "a"},
            "preHash": "h-a",
            "post": {"name": "b"},
            "postHash": "h-b",
            "timestamp": 1700000000000i64,
            "inFlight": true
        });
        let change: PendingChange = serde_json::from_value(raw).unwrap();
        assert_eq!(change.action, PendingAction::Update);
        assert_eq!(change.pre_hash.as_deref(), Some("h-a"));
        assert!(change.cuid.is_empty());
        change.validate().unwrap();
    }

    #[test]
    fn validation_per_action() {
        let create = PendingChange::create("c", "tmp", json!({}), "h");
        assert!(create.validate().is_ok());

        let mut update = PendingChange::update("u", "r", json!({}), "h0", json!({}), "h1");
        update.pre_hash = None;
        let err = update.validate().unwrap_err();
        assert!(err.to_string().contains("preHash"));

        let delete = PendingChange::delete("", "r", json!({}), "h0");
        assert!(delete.validate().is_err());
    }

    #[test]
    fn status_terminality() {
        assert!(!PendingStatus::New.is_terminal());
        assert!(!PendingStatus::Inflight.is_terminal());
        assert!(PendingStatus::Applied.is_terminal());
        assert!(PendingStatus::Failed.is_terminal());
        assert!(PendingStatus::Collision.is_terminal());
        assert_eq!(
            serde_json::to_value(PendingStatus::Collision).unwrap(),
            json!("collision")
        );
    }
}

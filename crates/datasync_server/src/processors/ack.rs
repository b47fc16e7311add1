use super::store_failure;
use crate::handlers::DataHandlers;
use crate::storage::SyncStorage;
use async_trait::async_trait;
use datasync_engine::{ProcessError, Processor, QueueMessage};
use datasync_protocol::{Acknowledgement, UpdateType};
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, warn};

/// Removes acknowledged updates.
///
/// Acknowledging a collision also removes the collision record the data
/// handler kept for it. The pending change record is stamped rather than
/// deleted, so the change is still recognised if it is delivered again.
pub struct AckProcessor {
    storage: Arc<SyncStorage>,
    handlers: Arc<DataHandlers>,
}

impl AckProcessor {
    /// Creates the processor.
    pub fn new(storage: Arc<SyncStorage>, handlers: Arc<DataHandlers>) -> Self {
        Self { storage, handlers }
    }

    async fn remove_collision(&self, ack: &Acknowledgement) -> Result<(), ProcessError> {
        let meta_data = self
            .storage
            .acknowledged_record(ack)
            .await
            .map_err(store_failure)?
            .map(|r| r.meta_data)
            .unwrap_or(Value::Null);
        let handler = self.handlers.for_dataset(&ack.dataset_id);
        match handler.remove_collision(&ack.dataset_id, &ack.hash, &meta_data).await {
            Ok(removed) => {
                debug!(dataset_id = %ack.dataset_id, hash = %ack.hash, removed, "collision acknowledged");
                Ok(())
            }
            Err(e) if e.is_permanent() => {
                warn!(dataset_id = %ack.dataset_id, hash = %ack.hash, error = %e, "collision not removed");
                Ok(())
            }
            Err(e) => Err(ProcessError::Retry(e.to_string())),
        }
    }
}

#[async_trait]
impl Processor for AckProcessor {
    async fn process(&self, message: &QueueMessage) -> Result<(), ProcessError> {
        let ack: Acknowledgement = message.payload_as()?;
        let update = self.storage.find_update(&ack).await.map_err(store_failure)?;
        if update.is_some_and(|u| u.update_type == UpdateType::Collision) {
            self.remove_collision(&ack).await?;
        }
        let removed = self.storage.remove_update(&ack).await.map_err(store_failure)?;
        self.storage.acknowledge_pending(&ack).await.map_err(store_failure)?;
        debug!(
            dataset_id = %ack.dataset_id,
            cuid = %ack.cuid,
            hash = %ack.hash,
            removed,
            "acknowledgement processed"
        );
        Ok(())
    }
}

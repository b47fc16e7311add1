//! Durable lease-based job queue.
//!
//! Messages live in one collection of the shared [`DocumentStore`], so any
//! number of processes can feed and drain the same queue. A claim makes a
//! message invisible for the duration of a lease and hands out a fresh ack
//! token; only that token can ack the message, and only before the lease
//! runs out. A message whose lease expires is claimable again.
//!
//! # Document layout
//!
//! | field       | meaning                                      |
//! |-------------|----------------------------------------------|
//! | `_id`       | message id                                   |
//! | `payload`   | opaque JSON                                  |
//! | `state`     | `visible`, `inflight` or `acked`             |
//! | `visibleAt` | earliest time the message can be claimed (ms)|
//! | `createdAt` | enqueue time (ms)                            |
//! | `ackedAt`   | ack time (ms), once acked                    |
//! | `tries`     | number of claims so far                      |
//! | `ack`       | token of the current claim                   |

use crate::clock::{duration_ms, Clock};
use crate::config::QueueOptions;
use crate::error::{EngineError, EngineResult};
use crate::metrics::{self, Metrics, Timer};
use datasync_store::{document, Document, DocumentStore, Filter, IndexSpec, Patch, Sort, UpdateOptions};
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Lifecycle state of a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageState {
    /// Waiting to be claimed.
    Visible,
    /// Claimed; invisible until `visible_at`.
    InFlight,
    /// Done; kept until pruned.
    Acked,
}

impl MessageState {
    /// Stored string form.
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageState::Visible => "visible",
            MessageState::InFlight => "inflight",
            MessageState::Acked => "acked",
        }
    }
}

/// A message as seen by the claimer.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueMessage {
    /// Message id.
    #[serde(rename = "_id")]
    pub id: String,
    /// Opaque payload.
    pub payload: Value,
    /// Current state.
    pub state: MessageState,
    /// Earliest claim time (ms). For a claimed message, the lease expiry.
    pub visible_at: i64,
    /// Enqueue time (ms).
    pub created_at: i64,
    /// Ack time (ms).
    #[serde(default)]
    pub acked_at: Option<i64>,
    /// Number of times the message has been claimed.
    #[serde(default)]
    pub tries: u32,
    /// Token of the current claim.
    #[serde(default)]
    pub ack: Option<String>,
}

impl QueueMessage {
    /// Decodes the payload into a typed value.
    pub fn payload_as<T: DeserializeOwned>(&self) -> EngineResult<T> {
        Ok(serde_json::from_value(self.payload.clone())?)
    }
}

/// A named queue on a shared document store.
pub struct Queue {
    name: String,
    store: Arc<dyn DocumentStore>,
    clock: Arc<dyn Clock>,
    metrics: Arc<Metrics>,
    options: QueueOptions,
    prune_job: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for Queue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Queue")
            .field("name", &self.name)
            .field("options", &self.options)
            .finish_non_exhaustive()
    }
}

impl Queue {
    /// Creates a handle to the queue stored in collection `name`.
    ///
    /// Call [`Queue::create`] once before use.
    pub fn new(
        name: impl Into<String>,
        store: Arc<dyn DocumentStore>,
        clock: Arc<dyn Clock>,
        metrics: Arc<Metrics>,
        options: QueueOptions,
    ) -> Self {
        Self {
            name: name.into(),
            store,
            clock,
            metrics,
            options,
            prune_job: Mutex::new(None),
        }
    }

    /// Queue (collection) name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Queue options.
    pub fn options(&self) -> &QueueOptions {
        &self.options
    }

    /// Provisions the collection and its indexes. Idempotent.
    pub async fn create(&self) -> EngineResult<()> {
        let indexes = [
            IndexSpec::new(["state", "visibleAt"]),
            IndexSpec::new(["ackedAt"]),
        ];
        self.store.create_collection(&self.name, &indexes).await?;
        Ok(())
    }

    /// Enqueues one payload and returns the message id.
    pub async fn add<T: Serialize + ?Sized>(&self, payload: &T) -> EngineResult<String> {
        let timer = Timer::start();
        let doc = self.new_message(serde_json::to_value(payload)?);
        let id = self.store.insert_one(&self.name, doc).await?;
        self.record("add", timer);
        debug!(queue = %self.name, id = %id, "message added");
        Ok(id)
    }

    /// Enqueues a batch of payloads and returns their ids in order.
    ///
    /// The batch is all-or-nothing. An empty batch is a no-op.
    pub async fn add_many<T: Serialize>(&self, payloads: &[T]) -> EngineResult<Vec<String>> {
        if payloads.is_empty() {
            return Ok(Vec::new());
        }
        let timer = Timer::start();
        let docs = payloads
            .iter()
            .map(|p| Ok(self.new_message(serde_json::to_value(p)?)))
            .collect::<EngineResult<Vec<Document>>>()?;
        let ids = self.store.insert_many(&self.name, docs).await?;
        self.record("add_many", timer);
        debug!(queue = %self.name, count = ids.len(), "messages added");
        Ok(ids)
    }

    /// Claims the oldest claimable message for `lease`.
    ///
    /// Returns `None` when nothing is claimable. Each successful claim
    /// issues a new ack token and increments `tries`.
    pub async fn claim(&self, lease: Duration) -> EngineResult<Option<QueueMessage>> {
        let timer = Timer::start();
        let now = self.clock.now_ms();
        let filter = Self::claimable(now);
        let sort = Sort::asc("visibleAt").then_asc("createdAt");
        let patch = Patch::new()
            .set("state", MessageState::InFlight.as_str())
            .set("visibleAt", now.saturating_add(duration_ms(lease)))
            .set("ack", uuid::Uuid::new_v4().to_string())
            .inc("tries", 1);
        let claimed = self
            .store
            .find_one_and_update(&self.name, &filter, Some(&sort), &patch, UpdateOptions::default())
            .await?;
        self.record("claim", timer);
        claimed.map(|doc| self.decode(doc)).transpose()
    }

    /// Acks a claimed message so it is never delivered again.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::UnknownClaim`] if the claim's lease has
    /// expired, the message was reclaimed, or it was already acked.
    pub async fn ack(&self, message: &QueueMessage) -> EngineResult<()> {
        let timer = Timer::start();
        let now = self.clock.now_ms();
        let filter = self
            .claim_filter(message)?
            .and(Filter::gt("visibleAt", now));
        let patch = Patch::new()
            .set("state", MessageState::Acked.as_str())
            .set("ackedAt", now)
            .unset("ack");
        let updated = self
            .store
            .find_one_and_update(&self.name, &filter, None, &patch, UpdateOptions::default())
            .await?;
        self.record("ack", timer);
        match updated {
            Some(_) => Ok(()),
            None => Err(self.unknown_claim(message)),
        }
    }

    /// Gives a claimed message back so it can be claimed again right away.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::UnknownClaim`] if the message has since been
    /// reclaimed or acked.
    pub async fn fail(&self, message: &QueueMessage) -> EngineResult<()> {
        let timer = Timer::start();
        let now = self.clock.now_ms();
        let filter = self.claim_filter(message)?;
        let patch = Patch::new()
            .set("state", MessageState::Visible.as_str())
            .set("visibleAt", now)
            .unset("ack");
        let updated = self
            .store
            .find_one_and_update(&self.name, &filter, None, &patch, UpdateOptions::default())
            .await?;
        self.record("fail", timer);
        match updated {
            Some(_) => Ok(()),
            None => Err(self.unknown_claim(message)),
        }
    }

    /// Deletes acked messages older than the retention window.
    pub async fn prune(&self) -> EngineResult<u64> {
        let timer = Timer::start();
        let cutoff = self
            .clock
            .now_ms()
            .saturating_sub(duration_ms(self.options.messages_to_keep));
        let filter = Filter::eq("state", MessageState::Acked.as_str()).and(Filter::lt("ackedAt", cutoff));
        let removed = self.store.delete_many(&self.name, &filter).await?;
        self.record("prune", timer);
        if removed > 0 {
            info!(queue = %self.name, removed, "pruned acked messages");
        }
        Ok(removed)
    }

    /// Starts pruning in the background.
    ///
    /// Prunes once immediately; with `recurring`, again every
    /// `prune_frequency` until [`Queue::stop_prune_job`]. Replaces any
    /// previously started job.
    pub fn start_prune_job(self: &Arc<Self>, recurring: bool) {
        let queue = Arc::clone(self);
        let frequency = self.options.prune_frequency;
        let handle = tokio::spawn(async move {
            loop {
                if let Err(e) = queue.prune().await {
                    warn!(queue = %queue.name, error = %e, "prune failed");
                }
                if !recurring {
                    break;
                }
                tokio::time::sleep(frequency).await;
            }
        });
        if let Some(previous) = self.prune_job.lock().replace(handle) {
            previous.abort();
        }
    }

    /// Stops the background prune job, if any.
    pub fn stop_prune_job(&self) {
        if let Some(handle) = self.prune_job.lock().take() {
            handle.abort();
        }
    }

    /// Number of messages claimable now.
    pub async fn size(&self) -> EngineResult<u64> {
        let filter = Self::claimable(self.clock.now_ms());
        Ok(self.store.count(&self.name, &filter).await?)
    }

    /// Number of messages under an unexpired claim.
    pub async fn in_flight(&self) -> EngineResult<u64> {
        let filter = Filter::eq("state", MessageState::InFlight.as_str())
            .and(Filter::gt("visibleAt", self.clock.now_ms()));
        Ok(self.store.count(&self.name, &filter).await?)
    }

    /// Number of stored messages, acked ones included.
    pub async fn total(&self) -> EngineResult<u64> {
        Ok(self.store.count(&self.name, &Filter::All).await?)
    }

    fn claimable(now: i64) -> Filter {
        Filter::ne("state", MessageState::Acked.as_str()).and(Filter::lte("visibleAt", now))
    }

    fn claim_filter(&self, message: &QueueMessage) -> EngineResult<Filter> {
        let ack = message.ack.as_deref().ok_or_else(|| EngineError::MalformedMessage {
            queue: self.name.clone(),
            reason: format!("message {} carries no ack token", message.id),
        })?;
        Ok(Filter::id(message.id.as_str())
            .and(Filter::eq("ack", ack))
            .and(Filter::eq("state", MessageState::InFlight.as_str())))
    }

    fn unknown_claim(&self, message: &QueueMessage) -> EngineError {
        EngineError::UnknownClaim {
            queue: self.name.clone(),
            id: message.id.clone(),
            ack: message.ack.clone().unwrap_or_default(),
        }
    }

    fn new_message(&self, payload: Value) -> Document {
        let now = self.clock.now_ms();
        document(json!({
            "payload": payload,
            "state": MessageState::Visible.as_str(),
            "visibleAt": now,
            "createdAt": now,
            "tries": 0,
        }))
    }

    fn decode(&self, doc: Document) -> EngineResult<QueueMessage> {
        serde_json::from_value(Value::Object(doc)).map_err(|e| EngineError::MalformedMessage {
            queue: self.name.clone(),
            reason: e.to_string(),
        })
    }

    fn record(&self, operation: &str, timer: Timer) {
        let tags = metrics::tags([("queue", self.name.as_str()), ("operation", operation)]);
        self.metrics.record_time(metrics::QUEUE_OPERATION_TIME, &tags, timer);
    }
}

impl Drop for Queue {
    fn drop(&mut self) {
        if let Some(handle) = self.prune_job.get_mut().take() {
            handle.abort();
        }
    }
}

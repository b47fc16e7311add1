//! Benchmark utilities.

use datasync_engine::{Metrics, Queue, QueueOptions, SystemClock};
use datasync_protocol::{HashProvider, PendingChange, Sha256HashProvider, Update, UpdateType};
use datasync_store::InMemoryStore;
use rand::Rng;
use serde_json::{json, Value};
use std::sync::Arc;

/// Generate a random record with `fields` string fields.
pub fn random_record(fields: usize) -> Value {
    let mut rng = rand::thread_rng();
    let mut record = serde_json::Map::new();
    for i in 0..fields {
        let value: u64 = rng.gen();
        record.insert(format!("field_{i}"), json!(format!("{value:x}")));
    }
    Value::Object(record)
}

/// Generate pending creates for one client.
pub fn generate_pending(dataset_id: &str, cuid: &str, count: usize) -> Vec<PendingChange> {
    let hasher = Sha256HashProvider;
    (0..count)
        .map(|i| {
            let record = random_record(4);
            let post_hash = hasher.record_hash(dataset_id, &record);
            let hash = Sha256HashProvider::digest(&format!("{cuid}:{i}:{post_hash}"));
            PendingChange::create(hash, format!("tmp-{i}"), record, post_hash)
        })
        .collect()
}

/// Generate stored updates across every update type.
pub fn generate_updates(count: usize) -> Vec<Update> {
    let types = [UpdateType::Applied, UpdateType::Failed, UpdateType::Collision];
    (0..count)
        .map(|i| Update::new("bench", "c1", format!("h{i}"), types[i % types.len()], format!("uid-{i}")))
        .collect()
}

/// Create an empty queue over a fresh in-memory store.
pub fn memory_queue(name: &str) -> Arc<Queue> {
    memory_queue_with(name, QueueOptions::default())
}

/// Like [`memory_queue`] with explicit options.
pub fn memory_queue_with(name: &str, options: QueueOptions) -> Arc<Queue> {
    let clock = Arc::new(SystemClock);
    Arc::new(Queue::new(
        name,
        Arc::new(InMemoryStore::new()),
        clock.clone(),
        Arc::new(Metrics::new(1000, clock)),
        options,
    ))
}

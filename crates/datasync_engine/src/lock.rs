//! TTL-bounded distributed lock.
//!
//! A lock is one document in the locks collection, keyed by lock name:
//! `{ _id: name, holder, expiresAt }`. Acquisition is a single conditional
//! upsert, so it stays correct with any number of contenders sharing the
//! store. A holder that stops renewing loses the lock once it expires.

use crate::clock::{duration_ms, Clock};
use crate::error::EngineResult;
use datasync_store::{Document, DocumentStore, Filter, Patch, UpdateOptions};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Default collection holding lock documents.
pub const LOCKS_COLLECTION: &str = "datasync_locks";

/// Current owner of a lock.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LockEntry {
    /// Holder id.
    pub holder: String,
    /// Expiry time (ms since epoch).
    pub expires_at: i64,
}

/// Named locks on a shared document store.
pub struct DistributedLock {
    store: Arc<dyn DocumentStore>,
    clock: Arc<dyn Clock>,
    collection: String,
}

impl std::fmt::Debug for DistributedLock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DistributedLock")
            .field("collection", &self.collection)
            .finish_non_exhaustive()
    }
}

impl DistributedLock {
    /// Creates a lock manager on the default collection.
    pub fn new(store: Arc<dyn DocumentStore>, clock: Arc<dyn Clock>) -> Self {
        Self::with_collection(store, clock, LOCKS_COLLECTION)
    }

    /// Creates a lock manager on a specific collection.
    pub fn with_collection(
        store: Arc<dyn DocumentStore>,
        clock: Arc<dyn Clock>,
        collection: impl Into<String>,
    ) -> Self {
        Self {
            store,
            clock,
            collection: collection.into(),
        }
    }

    /// Provisions the locks collection. Idempotent.
    pub async fn create(&self) -> EngineResult<()> {
        self.store.create_collection(&self.collection, &[]).await?;
        Ok(())
    }

    /// Takes `name` for `holder` unless someone else holds it unexpired.
    ///
    /// Re-acquiring a lock already held by `holder` extends it. Returns
    /// whether `holder` now owns the lock.
    pub async fn acquire(&self, name: &str, holder: &str, ttl: Duration) -> EngineResult<bool> {
        let now = self.clock.now_ms();
        let filter = Filter::id(name).and(Filter::lte("expiresAt", now).or(Filter::eq("holder", holder)));
        let result = self
            .store
            .find_one_and_update(
                &self.collection,
                &filter,
                None,
                &Self::claim_patch(holder, now, ttl),
                UpdateOptions::upsert(),
            )
            .await;
        match result {
            Ok(doc) => {
                let acquired = doc.is_some();
                debug!(lock = %name, %holder, acquired, "lock acquire");
                Ok(acquired)
            }
            // Another holder's unexpired document occupies the id.
            Err(e) if e.is_duplicate_key() => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    /// Extends a lock `holder` currently owns.
    ///
    /// Returns false if the lock expired or belongs to someone else.
    pub async fn renew(&self, name: &str, holder: &str, ttl: Duration) -> EngineResult<bool> {
        let now = self.clock.now_ms();
        let filter = Filter::id(name)
            .and(Filter::eq("holder", holder))
            .and(Filter::gt("expiresAt", now));
        let renewed = self
            .store
            .find_one_and_update(
                &self.collection,
                &filter,
                None,
                &Self::claim_patch(holder, now, ttl),
                UpdateOptions::default(),
            )
            .await?
            .is_some();
        debug!(lock = %name, %holder, renewed, "lock renew");
        Ok(renewed)
    }

    /// Releases a lock held by `holder`. Returns false if it held nothing.
    pub async fn release(&self, name: &str, holder: &str) -> EngineResult<bool> {
        let filter = Filter::id(name).and(Filter::eq("holder", holder));
        let removed = self.store.delete_many(&self.collection, &filter).await?;
        Ok(removed > 0)
    }

    /// Returns the unexpired holder of `name`, if any.
    pub async fn holder(&self, name: &str) -> EngineResult<Option<LockEntry>> {
        let now = self.clock.now_ms();
        let filter = Filter::id(name).and(Filter::gt("expiresAt", now));
        let doc: Option<Document> = self.store.find_one(&self.collection, &filter).await?;
        Ok(doc
            .map(|d| serde_json::from_value(serde_json::Value::Object(d)))
            .transpose()?)
    }

    fn claim_patch(holder: &str, now: i64, ttl: Duration) -> Patch {
        Patch::new()
            .set("holder", holder)
            .set("expiresAt", now.saturating_add(duration_ms(ttl)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use datasync_store::InMemoryStore;
    use proptest::prelude::*;

    const TTL: Duration = Duration::from_secs(20);

    fn lock() -> (Arc<ManualClock>, DistributedLock) {
        let clock = Arc::new(ManualClock::new(1_000_000));
        let store = Arc::new(InMemoryStore::new());
        (clock.clone(), DistributedLock::new(store, clock))
    }

    #[tokio::test]
    async fn exclusive_until_expiry() {
        let (clock, lock) = lock();
        assert!(lock.acquire("sched", "a", TTL).await.unwrap());
        assert!(!lock.acquire("sched", "b", TTL).await.unwrap());
        assert_eq!(lock.holder("sched").await.unwrap().unwrap().holder, "a");

        clock.advance(TTL);
        assert!(lock.holder("sched").await.unwrap().is_none());
        assert!(lock.acquire("sched", "b", TTL).await.unwrap());
        assert!(!lock.renew("sched", "a", TTL).await.unwrap());
        assert_eq!(lock.holder("sched").await.unwrap().unwrap().holder, "b");
    }

    #[tokio::test]
    async fn holder_can_reacquire_and_renew() {
        let (clock, lock) = lock();
        assert!(lock.acquire("sched", "a", TTL).await.unwrap());
        assert!(lock.acquire("sched", "a", TTL).await.unwrap());

        clock.advance(Duration::from_secs(15));
        assert!(lock.renew("sched", "a", TTL).await.unwrap());
        clock.advance(Duration::from_secs(15));
        // Still held thanks to the renewal.
        assert!(!lock.acquire("sched", "b", TTL).await.unwrap());
        let entry = lock.holder("sched").await.unwrap().unwrap();
        assert_eq!(entry.expires_at, 1_000_000 + 15_000 + 20_000);
    }

    #[tokio::test]
    async fn release_only_by_holder() {
        let (_, lock) = lock();
        assert!(lock.acquire("sched", "a", TTL).await.unwrap());
        assert!(!lock.release("sched", "b").await.unwrap());
        assert!(lock.release("sched", "a").await.unwrap());
        assert!(lock.acquire("sched", "b", TTL).await.unwrap());
    }

    #[tokio::test]
    async fn locks_are_independent() {
        let (_, lock) = lock();
        assert!(lock.acquire("one", "a", TTL).await.unwrap());
        assert!(lock.acquire("two", "b", TTL).await.unwrap());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_acquire_has_one_winner() {
        let (_, lock) = lock();
        let lock = Arc::new(lock);
        let mut tasks = Vec::new();
        for i in 0..16 {
            let lock = Arc::clone(&lock);
            tasks.push(tokio::spawn(async move {
                lock.acquire("sched", &format!("node-{i}"), TTL).await.unwrap()
            }));
        }
        let mut winners = 0;
        for task in tasks {
            if task.await.unwrap() {
                winners += 1;
            }
        }
        assert_eq!(winners, 1);
    }

    #[derive(Debug, Clone)]
    enum Step {
        Acquire(usize),
        Renew(usize),
        Release(usize),
        Advance(u64),
    }

    fn step() -> impl Strategy<Value = Step> {
        prop_oneof![
            (0..3usize).prop_map(Step::Acquire),
            (0..3usize).prop_map(Step::Renew),
            (0..3usize).prop_map(Step::Release),
            (0..30_000u64).prop_map(Step::Advance),
        ]
    }

    proptest! {
        #[test]
        fn at_most_one_unexpired_holder(steps in prop::collection::vec(step(), 1..40)) {
            let rt = tokio::runtime::Builder::new_current_thread().build().unwrap();
            rt.block_on(async {
                let (clock, lock) = lock();
                let holders = ["a", "b", "c"];
                // Model: who should hold the lock and until when.
                let mut owner: Option<(usize, i64)> = None;
                for step in steps {
                    let now = clock.now_ms();
                    if matches!(owner, Some((_, exp)) if exp <= now) {
                        owner = None;
                    }
                    match step {
                        Step::Acquire(h) => {
                            let got = lock.acquire("l", holders[h], TTL).await.unwrap();
                            let expected = owner.map_or(true, |(o, _)| o == h);
                            prop_assert_eq!(got, expected);
                            if got {
                                owner = Some((h, now + 20_000));
                            }
                        }
                        Step::Renew(h) => {
                            let got = lock.renew("l", holders[h], TTL).await.unwrap();
                            let expected = matches!(owner, Some((o, _)) if o == h);
                            prop_assert_eq!(got, expected);
                            if got {
                                owner = Some((h, now + 20_000));
                            }
                        }
                        Step::Release(h) => {
                            lock.release("l", holders[h]).await.unwrap();
                            if matches!(owner, Some((o, _)) if o == h) {
                                owner = None;
                            }
                        }
                        Step::Advance(ms) => clock.advance(Duration::from_millis(ms)),
                    }
                    let actual = lock.holder("l").await.unwrap().map(|e| e.holder);
                    let modelled = owner
                        .filter(|(_, exp)| *exp > clock.now_ms())
                        .map(|(o, _)| holders[o].to_string());
                    prop_assert_eq!(actual, modelled);
                }
                Ok::<(), TestCaseError>(())
            })?;
        }
    }
}

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tracing::warn;

use labelsquor_core::{Event, EventType};
use labelsquor_store::{StoreError, WorkItemStore};

/// Lease-based mutual exclusion over work items.
///
/// Mutual exclusion itself is enforced by the store's conditional lock
/// statements; this facade owns the lease duration, hands out [`LockLease`]
/// guards, and records `locked` / `unlocked` events. A lease that is never
/// released (owner died) lapses on its own and the item becomes reclaimable.
pub struct LockManager {
    store: Arc<dyn WorkItemStore>,
    lease: Duration,
}

impl LockManager {
    /// Create a manager handing out leases of the given duration.
    #[must_use]
    pub fn new(store: Arc<dyn WorkItemStore>, lease: Duration) -> Self {
        Self { store, lease }
    }

    /// Try to take the item's lock for `worker_id`. Returns `None` when
    /// another worker holds an unexpired lease.
    pub async fn try_acquire(
        &self,
        item_id: &str,
        worker_id: &str,
    ) -> Result<Option<LockLease>, StoreError> {
        if !self.store.acquire_lock(item_id, worker_id, self.lease).await? {
            return Ok(None);
        }
        self.append_lock_event(item_id, worker_id, EventType::Locked)
            .await;
        Ok(Some(LockLease {
            store: self.store.clone(),
            item_id: item_id.to_owned(),
            worker_id: worker_id.to_owned(),
            lease: self.lease,
        }))
    }

    async fn append_lock_event(&self, item_id: &str, worker_id: &str, event_type: EventType) {
        if let Err(e) = self
            .store
            .append_event(Event::new(
                item_id,
                event_type,
                serde_json::json!({"worker": worker_id}),
                Utc::now(),
            ))
            .await
        {
            warn!(item_id, error = %e, "failed to append lock event");
        }
    }
}

/// A held lease on one work item.
///
/// Not released on drop: an abandoned lease simply expires, which is exactly
/// the crash behavior the reclamation path is built around. Call
/// [`release`](Self::release) for prompt hand-back.
pub struct LockLease {
    store: Arc<dyn WorkItemStore>,
    item_id: String,
    worker_id: String,
    lease: Duration,
}

impl LockLease {
    /// Push the lease out from now, only while still the holder.
    pub async fn extend(&self) -> Result<bool, StoreError> {
        self.store
            .extend_lock(&self.item_id, &self.worker_id, self.lease)
            .await
    }

    /// Hand the lock back and record the `unlocked` event.
    pub async fn release(self) -> Result<bool, StoreError> {
        let released = self
            .store
            .release_lock(&self.item_id, &self.worker_id)
            .await?;
        if released
            && let Err(e) = self
                .store
                .append_event(Event::new(
                    &self.item_id,
                    EventType::Unlocked,
                    serde_json::json!({"worker": self.worker_id}),
                    Utc::now(),
                ))
                .await
        {
            warn!(item_id = %self.item_id, error = %e, "failed to append unlock event");
        }
        Ok(released)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use labelsquor_core::WorkItem;
    use labelsquor_store_memory::MemoryWorkItemStore;

    async fn store_with_item(id: &str) -> Arc<dyn WorkItemStore> {
        let store: Arc<dyn WorkItemStore> = Arc::new(MemoryWorkItemStore::new());
        store
            .insert(&WorkItem::new(
                id,
                serde_json::Value::Null,
                0,
                serde_json::Value::Null,
                Utc::now(),
            ))
            .await
            .unwrap();
        store
    }

    #[tokio::test]
    async fn second_acquire_is_refused_until_release() {
        let store = store_with_item("wi-lock").await;
        let manager = LockManager::new(store.clone(), Duration::from_secs(60));

        let lease = manager
            .try_acquire("wi-lock", "w1")
            .await
            .unwrap()
            .expect("free lock acquired");
        assert!(manager.try_acquire("wi-lock", "w2").await.unwrap().is_none());

        assert!(lease.release().await.unwrap());
        assert!(manager.try_acquire("wi-lock", "w2").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn expired_lease_is_reacquirable_and_not_extendable() {
        let store = store_with_item("wi-exp").await;
        let manager = LockManager::new(store.clone(), Duration::from_millis(40));

        let lease = manager
            .try_acquire("wi-exp", "w1")
            .await
            .unwrap()
            .expect("free lock acquired");
        tokio::time::sleep(Duration::from_millis(100)).await;

        assert!(!lease.extend().await.unwrap(), "lapsed lease cannot extend");
        assert!(
            manager.try_acquire("wi-exp", "w2").await.unwrap().is_some(),
            "lapsed lease is reclaimable"
        );
    }

    #[tokio::test]
    async fn lock_events_are_recorded() {
        let store = store_with_item("wi-ev").await;
        let manager = LockManager::new(store.clone(), Duration::from_secs(60));

        let lease = manager
            .try_acquire("wi-ev", "w1")
            .await
            .unwrap()
            .expect("free lock acquired");
        lease.release().await.unwrap();

        let events = store.undelivered_events(100).await.unwrap();
        let kinds: Vec<EventType> = events
            .iter()
            .filter(|e| e.work_item_id == "wi-ev")
            .map(|e| e.event_type)
            .collect();
        assert_eq!(kinds, vec![EventType::Locked, EventType::Unlocked]);
    }
}

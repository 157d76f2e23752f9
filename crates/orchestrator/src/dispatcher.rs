use std::collections::HashSet;
use std::sync::Arc;

use chrono::Utc;
use parking_lot::Mutex;

use labelsquor_store::{ClaimCandidate, StoreError, WorkItemStore};

/// How many candidates to pull from the store per election round.
const CLAIM_BATCH: usize = 32;

/// Selects the next ready item for a worker.
///
/// Selection is advisory: the authoritative hand-off is the worker's
/// `Ready -> Running` compare-and-transition. The dispatcher only orders
/// candidates (priority first, oldest first, expired leases last) and keeps
/// an in-process set of items already handed to local workers so co-located
/// workers do not chase the same row.
pub struct Dispatcher {
    store: Arc<dyn WorkItemStore>,
    handed_out: Mutex<HashSet<String>>,
}

impl Dispatcher {
    /// Create a dispatcher over the given store.
    #[must_use]
    pub fn new(store: Arc<dyn WorkItemStore>) -> Self {
        Self {
            store,
            handed_out: Mutex::new(HashSet::new()),
        }
    }

    /// Elect the next candidate not already handed to a local worker.
    ///
    /// The returned claim must be released with [`release`](Self::release)
    /// when the worker is done with the item (whatever the outcome).
    pub async fn claim_next(&self) -> Result<Option<ClaimCandidate>, StoreError> {
        let candidates = self.store.claim_candidates(Utc::now(), CLAIM_BATCH).await?;
        let mut handed_out = self.handed_out.lock();
        for candidate in candidates {
            if handed_out.insert(candidate.item.id.clone()) {
                return Ok(Some(candidate));
            }
        }
        Ok(None)
    }

    /// Return a previously claimed item to the electable pool.
    pub fn release(&self, item_id: &str) {
        self.handed_out.lock().remove(item_id);
    }
}

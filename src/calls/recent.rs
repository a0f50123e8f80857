//! Call IDs the call slot recently moved away from.
//!
//! Consulted when a hangup arrives for a call that is no longer current:
//! a recent ID means a stale or duplicate hangup, not a missed call.

use crate::types::call::CallId;
use moka::policy::EvictionPolicy;
use moka::sync::Cache;

/// Bounded set of recent call IDs. The least recently inserted entries are
/// evicted once capacity is reached.
#[derive(Clone)]
pub struct RecentCallIds {
    ids: Cache<CallId, ()>,
}

impl std::fmt::Debug for RecentCallIds {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RecentCallIds")
            .field("entries", &self.ids.entry_count())
            .finish_non_exhaustive()
    }
}

impl RecentCallIds {
    pub fn new(capacity: usize) -> Self {
        Self {
            // plain LRU, so a new id is always admitted
            ids: Cache::builder()
                .max_capacity(capacity.max(1) as u64)
                .eviction_policy(EvictionPolicy::lru())
                .build(),
        }
    }

    pub fn insert(&self, call_id: CallId) {
        self.ids.insert(call_id, ());
    }

    pub fn contains(&self, call_id: CallId) -> bool {
        self.ids.contains_key(&call_id)
    }
}

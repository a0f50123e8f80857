//! Buffer for remote ICE candidates that arrive before a session exists.

use super::signaling::IceCandidatesData;
use dashmap::DashMap;
use log::debug;

/// Per-identity, arrival-ordered list of candidate batches.
#[derive(Debug, Default)]
pub struct CandidateCache {
    batches: DashMap<String, Vec<IceCandidatesData>>,
}

impl CandidateCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, identity: &str, data: IceCandidatesData) {
        self.batches
            .entry(identity.to_string())
            .or_default()
            .push(data);
    }

    /// Remove and return every buffered batch, grouped by identity. Order
    /// within one identity is arrival order.
    pub fn drain(&self) -> Vec<(String, Vec<IceCandidatesData>)> {
        let identities: Vec<String> = self.batches.iter().map(|e| e.key().clone()).collect();
        identities
            .into_iter()
            .filter_map(|identity| self.batches.remove(&identity))
            .collect()
    }

    pub fn clear(&self) {
        debug!(target: "Call/Candidates", "Clearing candidates cache for all identities");
        self.batches.clear();
    }

    pub fn batch_count(&self, identity: &str) -> usize {
        self.batches.get(identity).map_or(0, |b| b.len())
    }

    pub fn is_empty(&self) -> bool {
        self.batches.is_empty()
    }
}

use std::collections::HashMap;
use std::time::Duration;

use crepo_types::{ClaimState, ResourceClaim};
use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::queue::BoundedQueue;
use crate::tracker::ReferenceTracker;

/// Default bound on claims awaiting destruction.
pub const DEFAULT_DESTRUCTABLE_CAPACITY: usize = 50_000;

#[derive(Clone, Copy, Debug)]
struct ClaimRecord {
    count: u32,
    state: ClaimState,
}

impl ClaimRecord {
    const UNKNOWN: ClaimRecord = ClaimRecord {
        count: 0,
        state: ClaimState::Frozen,
    };

    fn is_destructable(&self) -> bool {
        self.count == 0 && self.state == ClaimState::Frozen
    }
}

/// In-memory [`ReferenceTracker`].
///
/// Records live in a single map behind a mutex, which makes every lifecycle
/// check-and-set atomic. Records for frozen, unreferenced claims are dropped
/// as soon as the claim is queued for destruction, so the map only holds
/// claims that are referenced, writable, or mid-destruction.
pub struct InMemoryReferenceTracker {
    records: Mutex<HashMap<ResourceClaim, ClaimRecord>>,
    destructable: BoundedQueue<ResourceClaim>,
}

impl InMemoryReferenceTracker {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_DESTRUCTABLE_CAPACITY)
    }

    /// Tracker whose destruction queue holds at most `capacity` claims.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            records: Mutex::new(HashMap::new()),
            destructable: BoundedQueue::new(capacity),
        }
    }

    /// Number of claims with a live record.
    pub fn tracked_claims(&self) -> usize {
        self.records.lock().len()
    }

    /// Number of claims waiting to be archived or removed.
    pub fn pending_destruction(&self) -> usize {
        self.destructable.len()
    }

    fn enqueue(&self, claim: &ResourceClaim) {
        if let Err(claim) = self.destructable.offer(claim.clone()) {
            warn!(
                %claim,
                "destruction queue full; claim stays on disk until the next orphan cleanup"
            );
        } else {
            debug!(%claim, "claim queued for destruction");
        }
    }
}

impl Default for InMemoryReferenceTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl ReferenceTracker for InMemoryReferenceTracker {
    fn claimant_count(&self, claim: &ResourceClaim) -> u32 {
        self.records.lock().get(claim).map_or(0, |r| r.count)
    }

    fn increment_claimant_count(&self, claim: &ResourceClaim, new_claim: bool) -> u32 {
        let mut records = self.records.lock();
        let record = records.entry(claim.clone()).or_insert(ClaimRecord::UNKNOWN);
        if new_claim {
            record.state = ClaimState::Writable;
        } else if record.state.is_destroyed() {
            warn!(%claim, state = %record.state, "claimant added to a claim being destroyed");
        }
        record.count += 1;
        record.count
    }

    fn decrement_claimant_count(&self, claim: &ResourceClaim) -> u32 {
        let mut records = self.records.lock();
        let Some(record) = records.get_mut(claim) else {
            debug!(%claim, "decrement on untracked claim");
            return 0;
        };
        if record.count == 0 {
            warn!(%claim, "claimant count decremented below zero; ignoring");
            return 0;
        }
        record.count -= 1;
        let remaining = record.count;
        if record.is_destructable() {
            records.remove(claim);
            drop(records);
            self.enqueue(claim);
        }
        remaining
    }

    fn claim_state(&self, claim: &ResourceClaim) -> ClaimState {
        self.records
            .lock()
            .get(claim)
            .map_or(ClaimState::Frozen, |r| r.state)
    }

    fn freeze(&self, claim: &ResourceClaim) -> bool {
        let mut records = self.records.lock();
        let Some(record) = records.get_mut(claim) else {
            return false;
        };
        if !record.state.is_writable() {
            return false;
        }
        record.state = ClaimState::Frozen;
        if record.is_destructable() {
            records.remove(claim);
            drop(records);
            self.enqueue(claim);
        }
        true
    }

    fn mark_destructable(&self, claim: &ResourceClaim) {
        let destructable = self
            .records
            .lock()
            .get(claim)
            .map_or(true, ClaimRecord::is_destructable);
        if destructable {
            self.enqueue(claim);
        }
    }

    fn begin_destruction(&self, claim: &ResourceClaim, target: ClaimState) -> bool {
        let mut records = self.records.lock();
        let record = records.entry(claim.clone()).or_insert(ClaimRecord::UNKNOWN);
        if record.count > 0
            || record.state != ClaimState::Frozen
            || !record.state.can_transition_to(target)
        {
            if record.count == 0 && record.state == ClaimState::Frozen {
                records.remove(claim);
            }
            return false;
        }
        record.state = target;
        true
    }

    fn finish_destruction(&self, claim: &ResourceClaim) {
        let mut records = self.records.lock();
        if records.get(claim).is_some_and(|r| r.state.is_destroyed()) {
            records.remove(claim);
        }
    }

    fn abort_destruction(&self, claim: &ResourceClaim) {
        let mut records = self.records.lock();
        if let Some(record) = records.get_mut(claim) {
            if record.state.is_destroyed() {
                record.state = ClaimState::Frozen;
                if record.count == 0 {
                    records.remove(claim);
                }
            }
        }
    }

    fn drain_destructable(&self, max: usize, timeout: Duration) -> Vec<ResourceClaim> {
        self.destructable.drain_timeout(max, timeout)
    }

    fn purge(&self) {
        self.records.lock().clear();
        self.destructable.clear();
    }
}

impl std::fmt::Debug for InMemoryReferenceTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InMemoryReferenceTracker")
            .field("tracked_claims", &self.tracked_claims())
            .field("pending_destruction", &self.pending_destruction())
            .finish()
    }
}

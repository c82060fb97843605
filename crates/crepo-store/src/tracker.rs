use std::time::Duration;

use crepo_types::{ClaimState, ResourceClaim};

/// Claimant counts and lifecycle state for resource claims.
///
/// The tracker is the only component that decides when a resource claim may
/// be destroyed. The repository asks it before archiving or removing a file
/// and never deletes content on its own initiative.
///
/// All implementations must satisfy these invariants:
/// - A claim with a positive claimant count, or in the `Writable` state, is
///   in use and must not be archived or removed.
/// - [`begin_destruction`](Self::begin_destruction) is a single atomic
///   check-and-set: it succeeds only for a `Frozen` claim with zero
///   claimants, and no other caller can begin destroying the same claim until
///   it is finished or aborted.
/// - A claim is queued for destruction when it is both `Frozen` and
///   unreferenced, whichever of the two happens last.
/// - Claims the tracker has never seen are `Frozen` with zero claimants.
pub trait ReferenceTracker: Send + Sync {
    /// Current number of logical owners of `claim`.
    fn claimant_count(&self, claim: &ResourceClaim) -> u32;

    /// Add an owner. `new_claim` registers a freshly created, writable claim.
    /// Returns the new count.
    fn increment_claimant_count(&self, claim: &ResourceClaim, new_claim: bool) -> u32;

    /// Drop an owner. Returns the new count (never below zero).
    fn decrement_claimant_count(&self, claim: &ResourceClaim) -> u32;

    fn claim_state(&self, claim: &ResourceClaim) -> ClaimState;

    fn is_in_use(&self, claim: &ResourceClaim) -> bool {
        self.claimant_count(claim) > 0 || self.claim_state(claim).is_writable()
    }

    /// Stop the claim from growing. Returns `true` if it was writable.
    fn freeze(&self, claim: &ResourceClaim) -> bool;

    /// Queue the claim for destruction if it is frozen and unreferenced.
    fn mark_destructable(&self, claim: &ResourceClaim);

    /// Atomically move an unreferenced `Frozen` claim to `target`
    /// (`Archived` or `Removed`). Returns `false` if the claim is in use or
    /// already being destroyed.
    fn begin_destruction(&self, claim: &ResourceClaim, target: ClaimState) -> bool;

    /// The file operation succeeded; forget the claim.
    fn finish_destruction(&self, claim: &ResourceClaim);

    /// The file operation failed; return the claim to `Frozen`.
    fn abort_destruction(&self, claim: &ResourceClaim);

    /// Take up to `max` claims awaiting destruction, waiting up to `timeout`
    /// for the first one.
    fn drain_destructable(&self, max: usize, timeout: Duration) -> Vec<ResourceClaim>;

    /// Forget every claim.
    fn purge(&self);
}

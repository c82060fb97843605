use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::TypeError;

/// Lifecycle of a resource claim.
///
/// ```text
/// Writable --freeze--> Frozen --archive--> Archived
///                         \----remove----> Removed
/// ```
///
/// A claim is only handed out of the writable pool while `Writable`, and is
/// only archived or removed after it has been `Frozen` with no claimants.
/// `Archived` and `Removed` are terminal. `Archived -> Removed` is allowed so
/// that expiration can finish off an archived file.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ClaimState {
    /// Open for appending; may sit in the writable pool.
    Writable,
    /// No longer growing. Eligible for destruction once unreferenced.
    Frozen,
    /// Moved into its section's archive directory.
    Archived,
    /// Permanently deleted.
    Removed,
}

impl ClaimState {
    /// Whether `self -> to` is a legal lifecycle step.
    pub fn can_transition_to(self, to: ClaimState) -> bool {
        matches!(
            (self, to),
            (Self::Writable, Self::Frozen)
                | (Self::Frozen, Self::Archived)
                | (Self::Frozen, Self::Removed)
                | (Self::Archived, Self::Removed)
        )
    }

    /// Perform a lifecycle step, rejecting illegal ones.
    pub fn transition(self, to: ClaimState) -> Result<ClaimState, TypeError> {
        if self.can_transition_to(to) {
            Ok(to)
        } else {
            Err(TypeError::IllegalTransition { from: self, to })
        }
    }

    pub fn is_writable(self) -> bool {
        self == Self::Writable
    }

    /// `Archived` or `Removed`.
    pub fn is_destroyed(self) -> bool {
        matches!(self, Self::Archived | Self::Removed)
    }
}

impl fmt::Display for ClaimState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Writable => write!(f, "writable"),
            Self::Frozen => write!(f, "frozen"),
            Self::Archived => write!(f, "archived"),
            Self::Removed => write!(f, "removed"),
        }
    }
}

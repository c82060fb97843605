use thiserror::Error;

/// Errors produced by claim model operations.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum TypeError {
    #[error("invalid claim id: {0}")]
    InvalidClaimId(String),

    #[error("invalid claim coordinates: {0}")]
    InvalidCoordinates(String),

    #[error("illegal claim state transition from {from} to {to}")]
    IllegalTransition {
        from: crate::state::ClaimState,
        to: crate::state::ClaimState,
    },
}

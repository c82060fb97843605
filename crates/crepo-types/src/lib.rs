//! Claim model for the crepo content repository.
//!
//! Content is stored in physical files identified by a [`ResourceClaim`].
//! Callers never address files directly; they hold a [`ContentClaim`], which
//! is an `(offset, length)` window into a resource claim. Many content claims
//! can share one resource claim, which keeps the number of files on disk low
//! when millions of small records are written.
//!
//! # Key Types
//!
//! - [`ResourceClaim`] -- identity of one physical file: `(container, section, id)`
//! - [`ContentClaim`] -- logical view: resource claim + offset + mutable length
//! - [`ClaimLengthPair`] -- an open, still-appendable resource claim and its end offset
//! - [`ClaimState`] -- lifecycle of a resource claim (`Writable -> Frozen -> Archived | Removed`)
//! - [`ClaimIdGenerator`] -- `<millis>-<counter>` identifiers with embedded creation time

pub mod claim;
pub mod error;
pub mod id;
pub mod state;

pub use claim::{ClaimCoordinates, ClaimLengthPair, ContentClaim, ResourceClaim, UNKNOWN_LENGTH};
pub use error::TypeError;
pub use id::{creation_millis, format_claim_id, now_millis, ClaimIdGenerator};
pub use state::ClaimState;

//! File system content repository.
//!
//! Persists the byte payloads of short-lived records as *content claims*:
//! byte ranges inside *resource claim* files. Many small claims are appended
//! to one pooled file, many owners may share one claim, and files nobody
//! references are archived for a grace period before an expiration task
//! deletes them.
//!
//! # On-disk layout
//!
//! ```text
//! <container root>/<section 0..N-1>/<resource claim id>
//! <container root>/<section>/archive/<resource claim id>
//! ```
//!
//! # Components
//!
//! - [`FileSystemRepository`] -- the facade: create/write/read, clone,
//!   import/export, reference lifecycle, reconciliation and purge
//! - [`ReferenceTracker`] -- claimant counts and the per-claim lifecycle
//!   (`Writable -> Frozen -> Archived | Removed`); [`InMemoryReferenceTracker`]
//!   is the bundled implementation
//! - [`ContainerState`] -- per-container back-pressure
//! - [`expiration`] -- age- and space-driven deletion of archived files
//! - [`TaskScheduler`] -- background tasks on a dedicated tokio runtime
//!
//! # Design Rules
//!
//! 1. Nothing is archived or deleted unless the tracker's
//!    `begin_destruction` agrees the claim is frozen and unreferenced.
//! 2. A resource claim is only handed out again from the pool while its
//!    handle is still registered and it is still `Writable`.
//! 3. Archiving is a rename; a file is either live or archived.
//! 4. Missing content is always [`StoreError::ContentNotFound`], never a
//!    generic I/O error.

pub mod archive;
pub mod backpressure;
pub mod config;
pub mod container;
pub mod error;
pub mod expiration;
pub mod memory;
pub mod queue;
pub mod repository;
pub mod scheduler;
pub mod space;
pub mod stream;
pub mod tracker;

// Re-export primary types at crate root for ergonomic imports.
pub use archive::{ArchiveInfo, ARCHIVE_DIR_NAME};
pub use backpressure::ContainerState;
pub use config::{RepositoryConfig, ResolvedConfig};
pub use error::{StoreError, StoreResult};
pub use expiration::ExpirationReport;
pub use memory::InMemoryReferenceTracker;
pub use repository::{CleanupReport, DestructionReport, FileSystemRepository};
pub use scheduler::TaskScheduler;
pub use space::{FsSpaceProbe, SpaceProbe};
pub use stream::{ContentReader, ContentWriter};
pub use tracker::ReferenceTracker;

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use crepo_types::ResourceClaim;
use tracing::info;
use walkdir::WalkDir;

use crate::archive::{ArchiveInfo, ARCHIVE_DIR_NAME};
use crate::backpressure::ContainerState;
use crate::queue::BoundedQueue;

/// Archived files remembered between expiration passes.
pub const ARCHIVE_QUEUE_CAPACITY: usize = 100_000;

/// A configured storage root and the runtime state attached to it.
///
/// Layout on disk:
///
/// ```text
/// <root>/<section>/<claim id>
/// <root>/<section>/archive/<claim id>
/// ```
#[derive(Debug)]
pub struct Container {
    name: String,
    root: PathBuf,
    sections: usize,
    state: ContainerState,
    /// Claims binned for this container, awaiting archive or removal.
    pub(crate) reclaimable: BoundedQueue<ResourceClaim>,
    /// Archived files, oldest first, left over from the last rescan.
    pub(crate) archived: BoundedQueue<ArchiveInfo>,
    min_usable_bytes: Option<u64>,
    oldest_archive_ms: AtomicU64,
}

impl Container {
    pub fn new(
        name: impl Into<String>,
        root: impl Into<PathBuf>,
        sections: usize,
        state: ContainerState,
        reclaim_capacity: usize,
        min_usable_bytes: Option<u64>,
    ) -> Self {
        Self {
            name: name.into(),
            root: root.into(),
            sections: sections.max(1),
            state,
            reclaimable: BoundedQueue::new(reclaim_capacity),
            archived: BoundedQueue::new(ARCHIVE_QUEUE_CAPACITY),
            min_usable_bytes,
            oldest_archive_ms: AtomicU64::new(0),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn sections(&self) -> usize {
        self.sections
    }

    pub fn state(&self) -> &ContainerState {
        &self.state
    }

    /// Usable bytes the expiration task tries to keep free. `None` when
    /// archiving is disabled.
    pub fn min_usable_bytes(&self) -> Option<u64> {
        self.min_usable_bytes
    }

    pub fn oldest_archive_ms(&self) -> u64 {
        self.oldest_archive_ms.load(Ordering::Acquire)
    }

    pub fn set_oldest_archive_ms(&self, ms: u64) {
        self.oldest_archive_ms.store(ms, Ordering::Release);
    }

    pub fn section_name(&self, index: u64) -> String {
        (index % self.sections as u64).to_string()
    }

    pub fn section_path(&self, section: &str) -> PathBuf {
        self.root.join(section)
    }

    pub fn archive_dir(&self, section: &str) -> PathBuf {
        self.section_path(section).join(ARCHIVE_DIR_NAME)
    }

    /// Live location of `claim`.
    pub fn claim_path(&self, claim: &ResourceClaim) -> PathBuf {
        self.section_path(claim.section()).join(claim.id())
    }

    /// Archive location of `claim`.
    pub fn archive_path(&self, claim: &ResourceClaim) -> PathBuf {
        self.archive_dir(claim.section()).join(claim.id())
    }

    /// Create the root and every section directory.
    pub fn ensure_layout(&self) -> io::Result<()> {
        fs::create_dir_all(&self.root)?;
        for section in 0..self.sections {
            let path = self.root.join(section.to_string());
            if !path.is_dir() {
                fs::create_dir(&path)?;
            }
        }
        Ok(())
    }

    /// Count archived files by walking every section's archive directory.
    pub fn count_archived_files(&self) -> u64 {
        let mut count = 0;
        for section in 0..self.sections {
            let dir = self.archive_dir(&section.to_string());
            if !dir.is_dir() {
                continue;
            }
            count += WalkDir::new(&dir)
                .min_depth(1)
                .max_depth(1)
                .into_iter()
                .filter_map(Result::ok)
                .filter(|e| e.file_type().is_file())
                .count() as u64;
        }
        if count > 0 {
            info!(container = %self.name, archived = count, "found archived content claims");
        }
        count
    }
}

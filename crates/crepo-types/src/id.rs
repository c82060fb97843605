use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

/// Wall-clock milliseconds since UNIX epoch.
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Build a resource claim id: `<creation millis>-<allocation index>`.
pub fn format_claim_id(timestamp_ms: u64, index: u64) -> String {
    format!("{timestamp_ms}-{index}")
}

/// Creation time embedded in a claim id, if it carries one.
///
/// Ids written by older versions were a bare counter with no timestamp
/// prefix; those return `None` and callers fall back to the file's mtime.
pub fn creation_millis(id: &str) -> Option<u64> {
    let dash = id.find('-')?;
    if dash == 0 {
        return None;
    }
    id[..dash].parse().ok()
}

/// Monotonic allocation counter shared by every `create()` call.
///
/// The index drives three things at once: the claim id suffix, the container
/// chosen in round-robin order, and the section within that container.
#[derive(Debug, Default)]
pub struct ClaimIdGenerator {
    counter: AtomicU64,
}

impl ClaimIdGenerator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Resume counting after `index` (e.g. the highest index seen on disk).
    pub fn starting_at(index: u64) -> Self {
        Self {
            counter: AtomicU64::new(index),
        }
    }

    /// Next allocation index. Never returns the same value twice.
    pub fn next_index(&self) -> u64 {
        self.counter.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Last index handed out.
    pub fn current(&self) -> u64 {
        self.counter.load(Ordering::SeqCst)
    }
}

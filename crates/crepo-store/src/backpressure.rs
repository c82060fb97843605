use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use tracing::{debug, info, warn};

use crate::space::SpaceProbe;

/// How long a used-space figure is trusted before it is recomputed.
pub const USAGE_CACHE_WINDOW: Duration = Duration::from_secs(60);

/// Upper bound on a single wait before a blocked writer re-checks usage.
const WAIT_SLICE: Duration = Duration::from_secs(60);

#[derive(Debug, Default)]
struct UsageCache {
    used_bytes: u64,
    refreshed_at: Option<Instant>,
}

/// Back-pressure controller for one container.
///
/// Writers are `Normal` until archiving is on, at least one file has been
/// archived, and used space reaches the back-pressure threshold. They then
/// block in [`wait_for_writable`](Self::wait_for_writable) until the
/// expiration task calls [`signal_creation_ready`](Self::signal_creation_ready),
/// which releases every waiter whether or not space was actually freed.
pub struct ContainerState {
    container: String,
    root: PathBuf,
    probe: Arc<dyn SpaceProbe>,
    archive_enabled: bool,
    capacity: u64,
    backpressure_bytes: u64,
    archived_count: AtomicU64,
    usage: Mutex<UsageCache>,
    generation: Mutex<u64>,
    released: Condvar,
}

impl ContainerState {
    pub fn new(
        container: impl Into<String>,
        root: impl Into<PathBuf>,
        probe: Arc<dyn SpaceProbe>,
        archive_enabled: bool,
        capacity: u64,
        backpressure_ratio: f64,
    ) -> Self {
        let container = container.into();
        let backpressure_bytes = (capacity as f64 * backpressure_ratio) as u64;
        if archive_enabled {
            info!(
                container = %container,
                capacity,
                backpressure_bytes,
                "content creation will block while archived data keeps usage above threshold"
            );
        }
        Self {
            container,
            root: root.into(),
            probe,
            archive_enabled,
            capacity,
            backpressure_bytes,
            archived_count: AtomicU64::new(0),
            usage: Mutex::new(UsageCache::default()),
            generation: Mutex::new(0),
            released: Condvar::new(),
        }
    }

    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    pub fn backpressure_bytes(&self) -> u64 {
        self.backpressure_bytes
    }

    pub fn archived_count(&self) -> u64 {
        self.archived_count.load(Ordering::Acquire)
    }

    pub fn set_archived_count(&self, count: u64) {
        self.archived_count.store(count, Ordering::Release);
    }

    pub fn increment_archived_count(&self) {
        self.archived_count.fetch_add(1, Ordering::AcqRel);
    }

    pub fn decrement_archived_count(&self) {
        let _ = self
            .archived_count
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| Some(n.saturating_sub(1)));
    }

    /// `true` if a writer must wait before creating a claim here.
    pub fn is_wait_required(&self) -> bool {
        if !self.archive_enabled {
            return false;
        }
        let used = {
            let mut usage = self.usage.lock();
            let stale = usage
                .refreshed_at
                .map_or(true, |at| at.elapsed() >= USAGE_CACHE_WINDOW);
            if usage.used_bytes == 0 || stale {
                match self.probe.usable_space(&self.root) {
                    Ok(free) => {
                        usage.used_bytes = self.capacity.saturating_sub(free);
                        usage.refreshed_at = Some(Instant::now());
                    }
                    Err(e) => {
                        warn!(container = %self.container, error = %e, "cannot determine usable space");
                    }
                }
            }
            usage.used_bytes
        };
        used >= self.backpressure_bytes && self.archived_count() > 0
    }

    /// Block until back-pressure clears or the expiration task signals.
    pub fn wait_for_writable(&self) {
        let mut generation = self.generation.lock();
        let entered = *generation;
        while *generation == entered && self.is_wait_required() {
            debug!(container = %self.container, "waiting for archive cleanup");
            self.released.wait_for(&mut generation, WAIT_SLICE);
        }
    }

    /// Cleanup for this container finished: refresh the used-space figure
    /// and release every blocked writer.
    pub fn signal_creation_ready(&self) {
        match self.probe.usable_space(&self.root) {
            Ok(free) => {
                let mut usage = self.usage.lock();
                usage.used_bytes = self.capacity.saturating_sub(free);
                usage.refreshed_at = Some(Instant::now());
            }
            Err(e) => {
                warn!(container = %self.container, error = %e, "cannot determine usable space");
            }
        }
        self.release_all();
    }

    /// Wake every waiter without touching the usage cache.
    pub fn release_all(&self) {
        let mut generation = self.generation.lock();
        *generation = generation.wrapping_add(1);
        self.released.notify_all();
    }
}

impl std::fmt::Debug for ContainerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ContainerState")
            .field("container", &self.container)
            .field("archive_enabled", &self.archive_enabled)
            .field("capacity", &self.capacity)
            .field("backpressure_bytes", &self.backpressure_bytes)
            .field("archived_count", &self.archived_count())
            .finish()
    }
}

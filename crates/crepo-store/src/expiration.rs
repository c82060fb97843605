use std::fs;
use std::io;
use std::time::{Duration, Instant};

use crepo_types::now_millis;
use serde::Serialize;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use crate::archive::{last_mod_time, ArchiveInfo};
use crate::container::{Container, ARCHIVE_QUEUE_CAPACITY};
use crate::space::SpaceProbe;

/// During the space-driven part of a rescan, re-check free space this often.
const PROBE_EVERY: usize = 25;

/// Outcome of one expiration pass over a container's archive.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct ExpirationReport {
    /// Archived files deleted because they outlived the retention period.
    pub deleted_expired: u64,
    /// Archived files deleted, oldest first, to get back under the space budget.
    pub deleted_for_space: u64,
    pub freed_bytes: u64,
    /// Files queued in memory for the next pass.
    pub requeued: usize,
    /// Timestamp of the oldest archived file still on disk.
    pub oldest_archive_ms: u64,
    /// The pass was skipped because nothing could be due.
    pub skipped: bool,
}

impl ExpirationReport {
    pub fn deleted(&self) -> u64 {
        self.deleted_expired + self.deleted_for_space
    }
}

/// Scheduled entry point: skip cheaply when nothing can have expired and
/// space is fine, then run [`destroy_expired_archives`]. Blocked writers are
/// always released afterwards.
pub fn run_expiration_task(
    container: &Container,
    probe: &dyn SpaceProbe,
    retention: Duration,
) -> io::Result<ExpirationReport> {
    let result = expire_unless_idle(container, probe, retention);
    if let Err(e) = &result {
        warn!(container = %container.name(), error = %e, "archive expiration failed");
    }
    container.state().signal_creation_ready();
    result
}

fn expire_unless_idle(
    container: &Container,
    probe: &dyn SpaceProbe,
    retention: Duration,
) -> io::Result<ExpirationReport> {
    let Some(min_usable) = container.min_usable_bytes() else {
        return Ok(ExpirationReport {
            skipped: true,
            ..ExpirationReport::default()
        });
    };
    let threshold = now_millis().saturating_sub(retention.as_millis() as u64);
    let oldest = container.oldest_archive_ms();
    if oldest > threshold && probe.usable_space(container.root())? > min_usable {
        return Ok(ExpirationReport {
            oldest_archive_ms: oldest,
            skipped: true,
            ..ExpirationReport::default()
        });
    }
    destroy_expired_archives(container, probe, retention)
}

/// Delete archived files that outlived `retention`, then, while usable space
/// is below the container's minimum, the oldest remaining ones.
///
/// The in-memory queue from the previous pass is consumed first. Only if it
/// runs dry are the archive directories rescanned; leftovers from the rescan
/// are queued oldest first so the next pass can skip the walk.
pub fn destroy_expired_archives(
    container: &Container,
    probe: &dyn SpaceProbe,
    retention: Duration,
) -> io::Result<ExpirationReport> {
    let started = Instant::now();
    let name = container.name();
    let mut report = ExpirationReport::default();
    let Some(min_usable) = container.min_usable_bytes() else {
        report.skipped = true;
        return Ok(report);
    };

    let threshold = now_millis().saturating_sub(retention.as_millis() as u64);
    let usable = probe.usable_space(container.root())?;
    let to_free = min_usable.saturating_sub(usable);

    while let Some(head) = container.archived.peek() {
        let expired = head.last_modified() < threshold;
        if report.freed_bytes < to_free || expired {
            let _ = container.archived.poll();
            if delete_archived(container, &head) {
                report.freed_bytes += head.size();
                if expired {
                    report.deleted_expired += 1;
                } else {
                    report.deleted_for_space += 1;
                }
            }
        }

        if report.freed_bytes >= to_free {
            if container
                .archived
                .peek()
                .is_some_and(|next| next.last_modified() < threshold)
            {
                continue;
            }
            report.oldest_archive_ms = container
                .archived
                .peek()
                .map_or_else(now_millis, |next| next.last_modified());
            report.requeued = container.archived.len();
            log_summary(name, &report, started);
            container.set_oldest_archive_ms(report.oldest_archive_ms);
            return Ok(report);
        }
    }

    debug!(container = %name, "archive queue exhausted; rescanning archive directories");
    let over_budget = usable < min_usable;
    let mut candidates = Vec::new();
    let mut oldest_remaining = u64::MAX;

    for section in 0..container.sections() {
        let dir = container.archive_dir(&section.to_string());
        if !dir.is_dir() {
            continue;
        }
        for entry in WalkDir::new(&dir).min_depth(1).max_depth(1) {
            let entry = match entry {
                Ok(entry) => entry,
                Err(e) => {
                    warn!(container = %name, dir = %dir.display(), error = %e, "cannot scan archive directory");
                    continue;
                }
            };
            if !entry.file_type().is_file() {
                continue;
            }
            let metadata = entry.metadata().ok();
            let last_modified = last_mod_time(entry.path(), metadata.as_ref());
            let size = metadata.as_ref().map_or(0, |m| m.len());
            let info = ArchiveInfo::new(container.root(), entry.path(), size, last_modified);

            if last_modified < threshold {
                if delete_archived(container, &info) {
                    report.deleted_expired += 1;
                    report.freed_bytes += size;
                }
            } else {
                oldest_remaining = oldest_remaining.min(last_modified);
                if over_budget {
                    candidates.push(info);
                }
            }
        }
    }

    candidates.sort_by_key(ArchiveInfo::last_modified);
    let mut consumed = 0;
    for (i, info) in candidates.iter().enumerate() {
        if report.freed_bytes >= to_free {
            break;
        }
        if delete_archived(container, info) {
            report.deleted_for_space += 1;
            report.freed_bytes += info.size();
        }
        consumed = i + 1;
        if i % PROBE_EVERY == 0 && probe.usable_space(container.root())? > min_usable {
            break;
        }
    }

    let remaining = &candidates[consumed..];
    if over_budget {
        oldest_remaining = remaining.first().map_or(u64::MAX, ArchiveInfo::last_modified);
    }
    for info in remaining.iter().take(ARCHIVE_QUEUE_CAPACITY) {
        if container.archived.offer(info.clone()).is_err() {
            break;
        }
        report.requeued += 1;
    }

    report.oldest_archive_ms = if oldest_remaining == u64::MAX {
        now_millis()
    } else {
        oldest_remaining
    };
    container.set_oldest_archive_ms(report.oldest_archive_ms);
    log_summary(name, &report, started);
    Ok(report)
}

fn delete_archived(container: &Container, info: &ArchiveInfo) -> bool {
    match fs::remove_file(info.path()) {
        Ok(()) => {
            container.state().decrement_archived_count();
            debug!(container = %container.name(), claim = %info.name(), "deleted archived content claim");
            true
        }
        Err(e) if e.kind() == io::ErrorKind::NotFound => false,
        Err(e) => {
            warn!(
                container = %container.name(),
                path = %info.path().display(),
                error = %e,
                "failed to delete archived content claim; archive may exceed its configured size"
            );
            false
        }
    }
}

fn log_summary(container: &str, report: &ExpirationReport, started: Instant) {
    if report.deleted() > 0 {
        info!(
            container = %container,
            deleted_expired = report.deleted_expired,
            deleted_for_space = report.deleted_for_space,
            freed = report.freed_bytes,
            oldest_archive_ms = report.oldest_archive_ms,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "expired archived content claims"
        );
    } else {
        debug!(container = %container, elapsed_ms = started.elapsed().as_millis() as u64, "nothing to expire");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backpressure::ContainerState;
    use std::path::Path;
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::sync::Arc;

    struct FixedProbe {
        usable: AtomicU64,
    }

    impl SpaceProbe for FixedProbe {
        fn capacity(&self, _path: &Path) -> io::Result<u64> {
            Ok(1_000_000)
        }

        fn usable_space(&self, _path: &Path) -> io::Result<u64> {
            Ok(self.usable.load(Ordering::SeqCst))
        }
    }

    const HOUR_MS: u64 = 3_600_000;

    fn setup(usable: u64) -> (tempfile::TempDir, Arc<FixedProbe>, Container) {
        let dir = tempfile::tempdir().unwrap();
        let probe = Arc::new(FixedProbe {
            usable: AtomicU64::new(usable),
        });
        let state = ContainerState::new("c1", dir.path(), probe.clone(), true, 1_000_000, 0.52);
        let container = Container::new("c1", dir.path(), 2, state, 16, Some(510_000));
        container.ensure_layout().unwrap();
        (dir, probe, container)
    }

    fn archive(container: &Container, section: &str, ts: u64, n: u64, size: usize) {
        let dir = container.archive_dir(section);
        fs::create_dir_all(&dir).unwrap();
        fs::write(dir.join(format!("{ts}-{n}")), vec![0u8; size]).unwrap();
        container.state().increment_archived_count();
    }

    fn remaining(container: &Container) -> Vec<String> {
        let mut names: Vec<String> = (0..container.sections())
            .map(|s| container.archive_dir(&s.to_string()))
            .filter(|dir| dir.is_dir())
            .flat_map(|dir| fs::read_dir(dir).unwrap())
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        names.sort();
        names
    }

    #[test]
    fn deletes_only_expired_files_when_space_is_fine() {
        let (_dir, probe, container) = setup(900_000);
        let now = now_millis();
        for n in 1..=6 {
            archive(&container, &(n % 2).to_string(), now - n * HOUR_MS, n, 10);
        }

        let retention = Duration::from_millis(3 * HOUR_MS + HOUR_MS / 2);
        let report = destroy_expired_archives(&container, probe.as_ref(), retention).unwrap();

        assert_eq!(report.deleted_expired, 3);
        assert_eq!(report.deleted_for_space, 0);
        assert_eq!(report.freed_bytes, 30);
        assert_eq!(report.requeued, 0);
        assert_eq!(report.oldest_archive_ms, now - 3 * HOUR_MS);
        assert_eq!(remaining(&container).len(), 3);
        assert_eq!(container.state().archived_count(), 3);
    }

    #[test]
    fn space_pressure_deletes_oldest_first() {
        // 500_000 usable against a 510_000 minimum: 10_000 bytes to free.
        let (_dir, probe, container) = setup(500_000);
        let now = now_millis();
        for n in 1..=4 {
            archive(&container, "0", now - n * 1000, n, 4_000);
        }

        let report =
            destroy_expired_archives(&container, probe.as_ref(), Duration::from_secs(3600)).unwrap();

        assert_eq!(report.deleted_expired, 0);
        assert_eq!(report.deleted_for_space, 3);
        assert_eq!(report.freed_bytes, 12_000);
        let left = remaining(&container);
        assert_eq!(left, vec![format!("{}-1", now - 1000)]);
    }

    #[test]
    fn leftovers_are_queued_for_next_pass() {
        let (_dir, probe, container) = setup(500_000);
        let now = now_millis();
        for n in 1..=4 {
            archive(&container, "1", now - n * 1000, n, 1);
        }

        // Plenty of space: nothing expired, nothing collected.
        probe.usable.store(600_000, Ordering::SeqCst);
        let first =
            destroy_expired_archives(&container, probe.as_ref(), Duration::from_secs(3600)).unwrap();
        assert_eq!(first.deleted_for_space, 0);
        assert_eq!(first.requeued, 0);

        probe.usable.store(509_999, Ordering::SeqCst);
        let second =
            destroy_expired_archives(&container, probe.as_ref(), Duration::from_secs(3600)).unwrap();
        assert_eq!(second.deleted_for_space, 1);
        assert_eq!(second.requeued, 3);
        assert_eq!(container.archived.len(), 3);
        assert_eq!(second.oldest_archive_ms, now - 3000);

        // Next pass drains from the queue without rescanning.
        probe.usable.store(509_998, Ordering::SeqCst);
        let third =
            destroy_expired_archives(&container, probe.as_ref(), Duration::from_secs(3600)).unwrap();
        assert_eq!(third.deleted_for_space, 2);
        assert_eq!(third.requeued, 1);
        assert_eq!(remaining(&container), vec![format!("{}-1", now - 1000)]);
    }

    #[test]
    fn idle_pass_is_skipped() {
        let (_dir, probe, container) = setup(900_000);
        container.set_oldest_archive_ms(now_millis());
        let report = run_expiration_task(&container, probe.as_ref(), Duration::from_secs(3600)).unwrap();
        assert!(report.skipped);
    }

    #[test]
    fn disabled_archive_skips() {
        let dir = tempfile::tempdir().unwrap();
        let probe = Arc::new(FixedProbe {
            usable: AtomicU64::new(0),
        });
        let state = ContainerState::new("c1", dir.path(), probe.clone(), false, 1_000_000, 0.52);
        let container = Container::new("c1", dir.path(), 1, state, 16, None);
        let report =
            destroy_expired_archives(&container, probe.as_ref(), Duration::from_secs(1)).unwrap();
        assert!(report.skipped);
    }
}

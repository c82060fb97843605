use std::collections::BTreeSet;
use std::fs;
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use crepo_store::{
    FileSystemRepository, InMemoryReferenceTracker, RepositoryConfig, SpaceProbe, StoreError,
};
use crepo_types::{now_millis, ClaimState, ContentClaim};
use walkdir::WalkDir;

/// Space probe for a volume of fixed capacity whose only contents are the
/// files under the container root.
struct DirProbe {
    capacity: u64,
}

impl SpaceProbe for DirProbe {
    fn capacity(&self, _path: &Path) -> io::Result<u64> {
        Ok(self.capacity)
    }

    fn usable_space(&self, path: &Path) -> io::Result<u64> {
        let used: u64 = WalkDir::new(path)
            .into_iter()
            .filter_map(Result::ok)
            .filter(|e| e.file_type().is_file())
            .filter_map(|e| e.metadata().ok())
            .map(|m| m.len())
            .sum();
        Ok(self.capacity.saturating_sub(used))
    }
}

const LARGE_VOLUME: u64 = 1 << 40;

fn open_with(
    root: &Path,
    capacity: u64,
    tweak: impl FnOnce(&mut RepositoryConfig),
) -> FileSystemRepository {
    let mut config = RepositoryConfig::single("default", root);
    config.sections_per_container = 8;
    tweak(&mut config);
    FileSystemRepository::initialize(
        &config,
        Arc::new(InMemoryReferenceTracker::new()),
        Arc::new(DirProbe { capacity }),
        false,
    )
    .unwrap()
}

fn open(root: &Path) -> FileSystemRepository {
    open_with(root, LARGE_VOLUME, |_| {})
}

fn write(repo: &FileSystemRepository, claim: &ContentClaim, bytes: &[u8]) {
    let mut writer = repo.write(claim).unwrap();
    writer.write_all(bytes).unwrap();
    writer.close().unwrap();
}

fn read(repo: &FileSystemRepository, claim: &ContentClaim) -> Vec<u8> {
    let mut out = Vec::new();
    repo.read(claim).unwrap().read_to_end(&mut out).unwrap();
    out
}

fn live_path(root: &Path, claim: &ContentClaim) -> PathBuf {
    let resource = claim.resource_claim();
    root.join(resource.section()).join(resource.id())
}

fn archive_path(root: &Path, claim: &ContentClaim) -> PathBuf {
    let resource = claim.resource_claim();
    root.join(resource.section()).join("archive").join(resource.id())
}

fn archived_names(root: &Path) -> BTreeSet<String> {
    WalkDir::new(root)
        .min_depth(3)
        .max_depth(3)
        .into_iter()
        .filter_map(Result::ok)
        .filter(|e| e.file_type().is_file())
        .map(|e| e.file_name().to_string_lossy().into_owned())
        .collect()
}

// ---------------------------------------------------------------------------
// Write / read
// ---------------------------------------------------------------------------

#[test]
fn write_then_read_round_trips() {
    let dir = tempfile::tempdir().unwrap();
    let repo = open(dir.path());

    let payloads: Vec<Vec<u8>> = vec![
        Vec::new(),
        b"a".to_vec(),
        b"hello, content repository".to_vec(),
        (0..100_000u32).map(|i| (i % 251) as u8).collect(),
    ];
    let mut claims = Vec::new();
    for payload in &payloads {
        let claim = repo.create(false).unwrap();
        write(&repo, &claim, payload);
        assert_eq!(claim.length(), Some(payload.len() as u64));
        claims.push(claim);
    }
    for (claim, payload) in claims.iter().zip(&payloads) {
        assert_eq!(&read(&repo, claim), payload);
        assert_eq!(repo.size(claim).unwrap(), payload.len() as u64);
    }
}

#[test]
fn pooled_claims_share_one_resource_claim() {
    let dir = tempfile::tempdir().unwrap();
    let repo = open(dir.path());

    let first = repo.create(false).unwrap();
    write(&repo, &first, b"first record");
    let second = repo.create(false).unwrap();

    assert_eq!(first.resource_claim(), second.resource_claim());
    assert_eq!(second.offset(), 12);
    assert_eq!(repo.claimant_count(first.resource_claim()), 2);

    write(&repo, &second, b"second");
    assert_eq!(read(&repo, &first), b"first record");
    assert_eq!(read(&repo, &second), b"second");
    assert_eq!(repo.size_of_resource(first.resource_claim()).unwrap(), 18);
}

#[test]
fn reader_of_growing_claim_sees_written_bytes() {
    let dir = tempfile::tempdir().unwrap();
    let repo = open(dir.path());
    let claim = repo.create(false).unwrap();

    let mut writer = repo.write(&claim).unwrap();
    writer.write_all(b"partial").unwrap();
    assert_eq!(read(&repo, &claim), b"partial");

    writer.write_all(b" then more").unwrap();
    assert_eq!(read(&repo, &claim), b"partial then more");
    writer.close().unwrap();
    assert_eq!(read(&repo, &claim), b"partial then more");
}

#[test]
fn claims_rotate_once_append_cap_is_reached() {
    let dir = tempfile::tempdir().unwrap();
    let repo = open_with(dir.path(), LARGE_VOLUME, |c| {
        c.max_appendable_claim_size = "64 B".into();
    });

    let mut ids = Vec::new();
    for _ in 0..10 {
        let claim = repo.create(false).unwrap();
        write(&repo, &claim, &[7u8; 20]);
        ids.push(claim.resource_claim().clone());
    }

    // 0, 20, 40, 60: the fourth write takes the file past 64 bytes.
    assert!(ids[..4].iter().all(|id| id == &ids[0]));
    assert_ne!(ids[4], ids[0]);
    assert!(!ids[4..].contains(&ids[0]), "frozen claim was reused");
    assert_eq!(repo.tracker().claim_state(&ids[0]), ClaimState::Frozen);
    assert_eq!(repo.size_of_resource(&ids[0]).unwrap(), 80);
}

#[test]
fn claims_alternate_between_containers() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = RepositoryConfig::single("a", dir.path().join("a"));
    config.containers.insert("b".into(), dir.path().join("b"));
    config.sections_per_container = 8;
    let repo = FileSystemRepository::initialize(
        &config,
        Arc::new(InMemoryReferenceTracker::new()),
        Arc::new(DirProbe {
            capacity: LARGE_VOLUME,
        }),
        false,
    )
    .unwrap();

    let first = repo.create(false).unwrap();
    let second = repo.create(true).unwrap();
    assert_ne!(
        first.resource_claim().container(),
        second.resource_claim().container()
    );
    assert!(second.resource_claim().is_loss_tolerant());
    assert_eq!(repo.container_names(), vec!["a".to_string(), "b".to_string()]);
}

// ---------------------------------------------------------------------------
// Reference counting, removal and archiving
// ---------------------------------------------------------------------------

#[test]
fn release_without_archive_deletes_bytes() {
    let dir = tempfile::tempdir().unwrap();
    let repo = open_with(dir.path(), LARGE_VOLUME, |c| {
        c.archive_enabled = false;
        c.max_appendable_claim_size = "1 B".into();
    });

    let claim = repo.create(false).unwrap();
    write(&repo, &claim, b"doomed");
    let resource = claim.resource_claim();
    let path = live_path(dir.path(), &claim);

    assert_eq!(repo.increment_claimant_count(resource), 2);
    assert_eq!(repo.decrement_claimant_count(resource), 1);
    assert!(!repo.remove(&claim).unwrap());
    assert_eq!(repo.run_destruction_now().total(), 0);
    assert!(path.is_file());

    assert_eq!(repo.decrement_claimant_count(resource), 0);
    let report = repo.run_destruction_now();
    assert_eq!(report.removed, 1);
    assert!(!path.exists());
    assert!(!archive_path(dir.path(), &claim).exists());
    assert!(repo.read(&claim).unwrap_err().is_content_not_found());
}

#[test]
fn direct_remove_of_released_claim() {
    let dir = tempfile::tempdir().unwrap();
    let repo = open_with(dir.path(), LARGE_VOLUME, |c| {
        c.archive_enabled = false;
        c.max_appendable_claim_size = "1 B".into();
    });

    let claim = repo.create(false).unwrap();
    write(&repo, &claim, b"bytes");
    repo.decrement_claimant_count(claim.resource_claim());

    assert!(repo.remove(&claim).unwrap());
    assert!(!live_path(dir.path(), &claim).exists());
    assert!(!repo.remove(&claim).unwrap());
}

#[test]
fn writable_claim_is_never_removed() {
    let dir = tempfile::tempdir().unwrap();
    let repo = open(dir.path());

    let claim = repo.create(false).unwrap();
    write(&repo, &claim, b"pooled");
    repo.decrement_claimant_count(claim.resource_claim());

    // Back in the writable pool, so still in use.
    assert!(!repo.remove(&claim).unwrap());
    assert!(!repo.archive(claim.resource_claim()).unwrap());
    assert!(live_path(dir.path(), &claim).is_file());
}

#[test]
fn released_claim_is_archived_and_still_readable() {
    let dir = tempfile::tempdir().unwrap();
    let repo = open_with(dir.path(), LARGE_VOLUME, |c| {
        c.max_appendable_claim_size = "1 B".into();
    });

    let claim = repo.create(false).unwrap();
    write(&repo, &claim, b"keep me around");
    assert_eq!(repo.decrement_claimant_count(claim.resource_claim()), 0);

    let report = repo.run_destruction_now();
    assert_eq!(report.archived, 1);
    assert!(!live_path(dir.path(), &claim).exists());
    assert!(archive_path(dir.path(), &claim).is_file());
    assert_eq!(repo.archived_file_count("default").unwrap(), 1);

    assert!(repo.is_accessible(&claim));
    assert_eq!(read(&repo, &claim), b"keep me around");
    assert_eq!(repo.size_of_resource(claim.resource_claim()).unwrap(), 14);

    // Archiving again is a no-op.
    assert!(!repo.archive(claim.resource_claim()).unwrap());
    assert_eq!(repo.archived_file_count("default").unwrap(), 1);
}

#[test]
fn aborted_write_freezes_resource_claim() {
    let dir = tempfile::tempdir().unwrap();
    let repo = open(dir.path());

    let claim = repo.create(false).unwrap();
    let mut writer = repo.write(&claim).unwrap();
    writer.write_all(b"half").unwrap();
    writer.abort();

    assert_eq!(
        repo.tracker().claim_state(claim.resource_claim()),
        ClaimState::Frozen
    );
    let next = repo.create(false).unwrap();
    assert_ne!(next.resource_claim(), claim.resource_claim());
}

#[test]
fn writing_an_unregistered_claim_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let repo = open_with(dir.path(), LARGE_VOLUME, |c| {
        c.max_appendable_claim_size = "1 B".into();
    });
    let claim = repo.create(false).unwrap();
    write(&repo, &claim, b"x");

    let stale = ContentClaim::new(claim.resource_claim().clone(), 1);
    assert!(matches!(repo.write(&stale), Err(StoreError::InvalidClaim(_))));
}

// ---------------------------------------------------------------------------
// Back-pressure and expiration
// ---------------------------------------------------------------------------

#[test]
fn create_blocks_under_backpressure_until_cleanup_signals() {
    let dir = tempfile::tempdir().unwrap();
    // 50% max usage: block at 5_200 used bytes, expire down to 4_800.
    let repo = Arc::new(open_with(dir.path(), 10_000, |c| {
        c.max_appendable_claim_size = "1 B".into();
    }));

    let big = repo.create(false).unwrap();
    write(&repo, &big, &vec![1u8; 6_000]);
    repo.decrement_claimant_count(big.resource_claim());
    assert_eq!(repo.run_destruction_now().archived, 1);

    let blocked = {
        let repo = Arc::clone(&repo);
        std::thread::spawn(move || repo.create(false))
    };
    std::thread::sleep(Duration::from_millis(300));
    assert!(!blocked.is_finished(), "create should wait for archive cleanup");

    let report = repo.run_expiration_now("default").unwrap();
    assert_eq!(report.deleted_for_space, 1);
    assert_eq!(report.freed_bytes, 6_000);

    let claim = blocked.join().unwrap().unwrap();
    assert_eq!(claim.offset(), 0);
    assert!(archived_names(dir.path()).is_empty());
    assert_eq!(repo.archived_file_count("default").unwrap(), 0);
}

#[test]
fn no_backpressure_without_archived_files() {
    let dir = tempfile::tempdir().unwrap();
    let repo = open_with(dir.path(), 10_000, |c| {
        c.max_appendable_claim_size = "1 B".into();
    });

    let big = repo.create(false).unwrap();
    write(&repo, &big, &vec![1u8; 8_000]);
    // Over the threshold, but nothing archived: must not block.
    let next = repo.create(false).unwrap();
    assert_ne!(next.resource_claim(), big.resource_claim());
}

#[test]
fn expiration_removes_exactly_the_oldest() {
    let dir = tempfile::tempdir().unwrap();
    let repo = open_with(dir.path(), LARGE_VOLUME, |c| {
        c.archive_max_retention_period = "210 mins".into();
    });

    let hour = 3_600_000;
    let now = now_millis();
    for n in 1..=6u64 {
        let archive = dir.path().join((n % 8).to_string()).join("archive");
        fs::create_dir_all(&archive).unwrap();
        fs::write(archive.join(format!("{}-{n}", now - n * hour)), b"old").unwrap();
    }
    let before = archived_names(dir.path());
    assert_eq!(before.len(), 6);

    let report = repo.run_expiration_now("default").unwrap();
    assert_eq!(report.deleted_expired, 3);
    assert_eq!(report.deleted_for_space, 0);

    let after = archived_names(dir.path());
    let expected: BTreeSet<String> = (1..=3u64)
        .map(|n| format!("{}-{n}", now - n * hour))
        .collect();
    assert_eq!(after, expected);
}

// ---------------------------------------------------------------------------
// Maintenance
// ---------------------------------------------------------------------------

#[test]
fn purge_twice_leaves_empty_usable_repository() {
    let dir = tempfile::tempdir().unwrap();
    let repo = open_with(dir.path(), LARGE_VOLUME, |c| {
        c.max_appendable_claim_size = "1 B".into();
    });

    let archived = repo.create(false).unwrap();
    write(&repo, &archived, b"archived");
    repo.decrement_claimant_count(archived.resource_claim());
    repo.run_destruction_now();
    let live = repo.create(false).unwrap();
    write(&repo, &live, b"live");

    for _ in 0..2 {
        repo.purge().unwrap();
        let files: Vec<_> = WalkDir::new(dir.path())
            .into_iter()
            .filter_map(Result::ok)
            .filter(|e| e.file_type().is_file())
            .collect();
        assert!(files.is_empty());
        for section in 0..8 {
            assert!(dir.path().join(section.to_string()).is_dir());
        }
        assert_eq!(repo.archived_file_count("default").unwrap(), 0);
        assert!(repo.active_resource_claims("default").is_empty());
    }

    assert_eq!(repo.claimant_count(live.resource_claim()), 0);
    let fresh = repo.create(false).unwrap();
    write(&repo, &fresh, b"after purge");
    assert_eq!(read(&repo, &fresh), b"after purge");
}

#[test]
fn restart_counts_archived_files_and_reconciles_orphans() {
    let dir = tempfile::tempdir().unwrap();
    let claim = {
        let repo = open_with(dir.path(), LARGE_VOLUME, |c| {
            c.max_appendable_claim_size = "1 B".into();
        });
        let archived = repo.create(false).unwrap();
        write(&repo, &archived, b"archived");
        repo.decrement_claimant_count(archived.resource_claim());
        repo.run_destruction_now();

        let orphan = repo.create(false).unwrap();
        write(&repo, &orphan, b"orphan");
        orphan
    };

    let repo = open(dir.path());
    assert_eq!(repo.archived_file_count("default").unwrap(), 1);
    assert_eq!(
        repo.active_resource_claims("default"),
        vec![claim.resource_claim().clone()]
    );

    let report = repo.cleanup();
    assert_eq!(report.scanned, 1);
    assert_eq!(report.archived, 1);
    assert_eq!(repo.archived_file_count("default").unwrap(), 2);
    assert!(repo.active_resource_claims("default").is_empty());
    assert_eq!(read(&repo, &claim), b"orphan");
}

use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crepo_types::{
    format_claim_id, now_millis, ClaimIdGenerator, ClaimLengthPair, ClaimState, ContentClaim,
    ResourceClaim,
};
use parking_lot::Mutex;
use serde::Serialize;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use crate::archive::{self, ARCHIVE_DIR_NAME};
use crate::backpressure::ContainerState;
use crate::config::{RepositoryConfig, ResolvedConfig};
use crate::container::Container;
use crate::error::{StoreError, StoreResult};
use crate::expiration::{self, ExpirationReport};
use crate::memory::InMemoryReferenceTracker;
use crate::queue::BoundedQueue;
use crate::scheduler::TaskScheduler;
use crate::space::{FsSpaceProbe, SpaceProbe};
use crate::stream::{ClaimStream, ContentReader, ContentWriter, LimitedReader};
use crate::tracker::ReferenceTracker;

/// Most claims moved per drain of the destruction queue or a reclaim bin.
const MAX_DESTRUCTION_BATCH: usize = 10_000;

/// Usable space kept free below the archive ceiling, as a fraction of capacity.
const ARCHIVE_HEADROOM: f64 = 0.02;

const PURGE_VERIFY_ATTEMPTS: u32 = 10;
const PURGE_VERIFY_DELAY: Duration = Duration::from_millis(100);

/// A full reclaim bin is retried in slices this long so shutdown is noticed.
const RECLAIM_OFFER_SLICE: Duration = Duration::from_secs(1);

/// Outcome of draining claims through the archive-or-remove pipeline.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct DestructionReport {
    pub archived: u64,
    pub removed: u64,
    /// Claims found in use again, or already gone from disk.
    pub skipped: u64,
    pub failed: u64,
}

impl DestructionReport {
    pub fn total(&self) -> u64 {
        self.archived + self.removed + self.skipped + self.failed
    }

    fn merge(&mut self, other: &DestructionReport) {
        self.archived += other.archived;
        self.removed += other.removed;
        self.skipped += other.skipped;
        self.failed += other.failed;
    }
}

/// Outcome of an orphan reconciliation scan.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct CleanupReport {
    /// Live resource claim files examined.
    pub scanned: u64,
    pub archived: u64,
    pub removed: u64,
    pub failed: u64,
}

/// State shared between the repository handle, its background tasks and
/// every open [`ContentWriter`].
struct RepositoryInner {
    config: ResolvedConfig,
    containers: Vec<Container>,
    by_name: HashMap<String, usize>,
    tracker: Arc<dyn ReferenceTracker>,
    probe: Arc<dyn SpaceProbe>,
    ids: ClaimIdGenerator,
    writable_pool: BoundedQueue<ClaimLengthPair>,
    open_streams: Mutex<HashMap<ResourceClaim, Arc<ClaimStream>>>,
    shut_down: AtomicBool,
}

impl RepositoryInner {
    fn is_shut_down(&self) -> bool {
        self.shut_down.load(Ordering::Acquire)
    }

    fn container(&self, name: &str) -> StoreResult<&Container> {
        self.by_name
            .get(name)
            .map(|&i| &self.containers[i])
            .ok_or_else(|| StoreError::UnknownContainer(name.to_string()))
    }

    /// Live path if it exists, else archive path if that exists.
    fn resolve_path(&self, resource: &ResourceClaim) -> Option<PathBuf> {
        let container = self.container(resource.container()).ok()?;
        [container.claim_path(resource), container.archive_path(resource)]
            .into_iter()
            .find(|path| path.exists())
    }

    fn open_content(&self, resource: &ResourceClaim) -> StoreResult<File> {
        let container = self.container(resource.container())?;
        for path in [container.claim_path(resource), container.archive_path(resource)] {
            match File::open(&path) {
                Ok(file) => return Ok(file),
                Err(e) if e.kind() == io::ErrorKind::NotFound => continue,
                Err(e) => return Err(e.into()),
            }
        }
        Err(StoreError::not_found(
            resource,
            "no file in either the live or the archive location",
        ))
    }

    fn create(&self, loss_tolerant: bool) -> StoreResult<ContentClaim> {
        if self.is_shut_down() {
            return Err(StoreError::Shutdown);
        }

        while let Some(pair) = self.writable_pool.poll() {
            let resource = pair.claim;
            let registered = self.open_streams.lock().contains_key(&resource);
            if registered && self.tracker.claim_state(&resource).is_writable() {
                self.tracker.increment_claimant_count(&resource, false);
                debug!(claim = %resource, offset = pair.length, "reusing pooled resource claim");
                return Ok(ContentClaim::new(resource, pair.length));
            }
            debug!(claim = %resource, "dropping pooled resource claim that is no longer writable");
            self.retire_stream(&resource, None);
            self.tracker.freeze(&resource);
        }

        let index = self.ids.next_index();
        let container = self.select_container(index)?;
        let resource = ResourceClaim::new(
            container.name(),
            container.section_name(index),
            format_claim_id(now_millis(), index),
            loss_tolerant,
        );
        // Registered before the file exists so reconciliation never sees an
        // untracked file.
        self.tracker.increment_claimant_count(&resource, true);
        let stream = match ClaimStream::open(&container.claim_path(&resource)) {
            Ok(stream) => stream,
            Err(e) => {
                self.tracker.freeze(&resource);
                self.tracker.decrement_claimant_count(&resource);
                return Err(e.into());
            }
        };
        self.open_streams
            .lock()
            .insert(resource.clone(), Arc::new(stream));
        debug!(claim = %resource, "created resource claim");
        Ok(ContentClaim::new(resource, 0))
    }

    /// Round-robin from `index`, skipping containers under back-pressure.
    /// Blocks on the first choice if every container is.
    fn select_container(&self, index: u64) -> StoreResult<&Container> {
        let count = self.containers.len();
        let start = (index % count as u64) as usize;
        for offset in 0..count {
            let container = &self.containers[(start + offset) % count];
            if !container.state().is_wait_required() {
                return Ok(container);
            }
        }

        let container = &self.containers[start];
        info!(
            container = %container.name(),
            "all containers are under back-pressure; waiting for archive cleanup"
        );
        container.state().wait_for_writable();
        if self.is_shut_down() {
            return Err(StoreError::Shutdown);
        }
        Ok(container)
    }

    /// Close hook for [`ContentWriter`]: pool the resource claim again if it
    /// can keep growing, otherwise freeze it.
    fn complete_write(
        &self,
        resource: &ResourceClaim,
        stream: &Arc<ClaimStream>,
        failed: bool,
    ) -> io::Result<()> {
        let mut failed = failed;
        let mut result = Ok(());
        if !failed && self.config.always_sync {
            if let Err(e) = stream.sync() {
                failed = true;
                result = Err(e);
            }
        }

        let length = stream.bytes_written();
        if !failed && length < self.config.max_appendable_claim_size && !self.is_shut_down() {
            let registered = self
                .open_streams
                .lock()
                .get(resource)
                .is_some_and(|current| Arc::ptr_eq(current, stream));
            if registered && self.tracker.claim_state(resource).is_writable() {
                match self
                    .writable_pool
                    .offer(ClaimLengthPair::new(resource.clone(), length))
                {
                    Ok(()) => {
                        debug!(claim = %resource, length, "resource claim returned to writable pool");
                        return result;
                    }
                    Err(_) => debug!(claim = %resource, "writable pool full"),
                }
            }
        }

        self.retire_stream(resource, Some(stream));
        self.tracker.freeze(resource);
        debug!(claim = %resource, length, failed, "resource claim frozen");
        result
    }

    /// Remove the open handle for `resource` from the table and close it.
    /// With `expected`, only that exact handle is removed.
    fn retire_stream(&self, resource: &ResourceClaim, expected: Option<&Arc<ClaimStream>>) {
        let removed = {
            let mut streams = self.open_streams.lock();
            match (streams.get(resource), expected) {
                (Some(current), Some(expected)) if !Arc::ptr_eq(current, expected) => None,
                (Some(_), _) => streams.remove(resource),
                (None, _) => None,
            }
        };
        if let Some(stream) = removed.or_else(|| expected.cloned()) {
            if let Err(e) = stream.close() {
                warn!(claim = %resource, error = %e, "failed to close content stream");
            }
        }
    }

    fn close_all_streams(&self) {
        let streams: Vec<_> = self.open_streams.lock().drain().collect();
        for (claim, stream) in streams {
            if let Err(e) = stream.close() {
                warn!(claim = %claim, error = %e, "failed to close content stream");
            }
        }
        self.writable_pool.clear();
    }

    fn archive(&self, resource: &ResourceClaim) -> StoreResult<bool> {
        if !self.config.archive_enabled {
            return Ok(false);
        }
        let container = self.container(resource.container())?;
        if !self
            .tracker
            .begin_destruction(resource, ClaimState::Archived)
        {
            debug!(claim = %resource, "resource claim in use; not archiving");
            return Ok(false);
        }
        self.retire_stream(resource, None);

        match archive::archive_file(&container.claim_path(resource)) {
            Ok(moved) => {
                self.tracker.finish_destruction(resource);
                if moved {
                    container.state().increment_archived_count();
                    debug!(claim = %resource, "archived resource claim");
                }
                Ok(moved)
            }
            Err(e) => {
                self.tracker.abort_destruction(resource);
                Err(e.into())
            }
        }
    }

    fn remove_resource(&self, resource: &ResourceClaim) -> StoreResult<bool> {
        let container = self.container(resource.container())?;
        if !self.tracker.begin_destruction(resource, ClaimState::Removed) {
            debug!(claim = %resource, "resource claim in use; not removing");
            return Ok(false);
        }
        self.retire_stream(resource, None);

        match fs::remove_file(container.claim_path(resource)) {
            Ok(()) => {
                self.tracker.finish_destruction(resource);
                debug!(claim = %resource, "removed resource claim");
                Ok(true)
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                self.tracker.finish_destruction(resource);
                Ok(false)
            }
            Err(e) => {
                self.tracker.abort_destruction(resource);
                Err(e.into())
            }
        }
    }

    /// Archive (or, with archiving off, remove) one claim and record the
    /// outcome.
    fn destroy_claim(&self, claim: &ResourceClaim, report: &mut DestructionReport) {
        let archiving = self.config.archive_enabled;
        let result = if archiving {
            self.archive(claim)
        } else {
            self.remove_resource(claim)
        };
        match result {
            Ok(true) if archiving => report.archived += 1,
            Ok(true) => report.removed += 1,
            Ok(false) => report.skipped += 1,
            Err(e) => {
                report.failed += 1;
                warn!(
                    claim = %claim,
                    archiving,
                    error = %e,
                    "unable to reclaim resource claim; it stays on disk until the next orphan cleanup"
                );
            }
        }
    }

    /// Move destructable claims from the tracker into per-container bins.
    fn bin_destructable_claims(&self) -> usize {
        let mut binned = 0;
        loop {
            let batch = self
                .tracker
                .drain_destructable(MAX_DESTRUCTION_BATCH, Duration::ZERO);
            if batch.is_empty() {
                return binned;
            }
            for claim in batch {
                let Ok(container) = self.container(claim.container()) else {
                    warn!(claim = %claim, "destructable claim names an unknown container");
                    continue;
                };
                if !self.offer_reclaimable(container, claim) {
                    return binned;
                }
                binned += 1;
            }
        }
    }

    /// Put `claim` in the container's bin, waiting as long as it takes.
    /// Returns `false` only if the repository shut down meanwhile.
    fn offer_reclaimable(&self, container: &Container, claim: ResourceClaim) -> bool {
        let mut claim = claim;
        let mut waited = Duration::ZERO;
        loop {
            if self.is_shut_down() {
                return false;
            }
            match container
                .reclaimable
                .offer_timeout(claim, RECLAIM_OFFER_SLICE)
            {
                Ok(()) => return true,
                Err(back) => {
                    claim = back;
                    waited += RECLAIM_OFFER_SLICE;
                    if waited >= self.config.reclaim_offer_timeout {
                        warn!(
                            claim = %claim,
                            container = %container.name(),
                            "reclaim queue full; old claims are not being cleaned up fast enough"
                        );
                        waited = Duration::ZERO;
                    }
                }
            }
        }
    }

    /// Drain one container's bin.
    fn archive_or_destroy(&self, container: &Container) -> DestructionReport {
        let mut total = DestructionReport::default();
        loop {
            let batch = container
                .reclaimable
                .drain_timeout(MAX_DESTRUCTION_BATCH, Duration::ZERO);
            if batch.is_empty() {
                return total;
            }
            let started = Instant::now();
            let mut report = DestructionReport::default();
            for claim in &batch {
                self.destroy_claim(claim, &mut report);
            }
            info!(
                container = %container.name(),
                claims = batch.len(),
                archived = report.archived,
                removed = report.removed,
                skipped = report.skipped,
                failed = report.failed,
                elapsed_ms = started.elapsed().as_millis() as u64,
                "reclaimed resource claims"
            );
            total.merge(&report);
            if self.is_shut_down() {
                return total;
            }
        }
    }
}

/// File system content repository.
///
/// Stores content claims as byte ranges of resource claim files laid out as
/// `<container>/<section>/<id>`. Small claims are appended to pooled files
/// until a file reaches the configured size; unreferenced files are archived
/// to `<section>/archive/` (or deleted) by a background pipeline, and an
/// expiration task deletes archived files by age and by space pressure.
///
/// Lifetime decisions belong to the injected [`ReferenceTracker`]; this type
/// only archives or removes a file once the tracker agrees.
pub struct FileSystemRepository {
    inner: Arc<RepositoryInner>,
    scheduler: Mutex<Option<TaskScheduler>>,
}

impl FileSystemRepository {
    /// Open with an in-memory tracker, real disk-space figures and background
    /// tasks running.
    pub fn open(config: &RepositoryConfig) -> StoreResult<Self> {
        Self::initialize(
            config,
            Arc::new(InMemoryReferenceTracker::new()),
            Arc::new(FsSpaceProbe),
            true,
        )
    }

    /// Validate `config`, lay out every container and optionally start the
    /// destruction and expiration tasks.
    pub fn initialize(
        config: &RepositoryConfig,
        tracker: Arc<dyn ReferenceTracker>,
        probe: Arc<dyn SpaceProbe>,
        start_daemons: bool,
    ) -> StoreResult<Self> {
        let config = config.validate()?;
        let mut containers = Vec::with_capacity(config.containers.len());
        let mut by_name = HashMap::new();

        for (name, root) in &config.containers {
            fs::create_dir_all(root)?;
            let capacity = probe.capacity(root)?;
            if capacity == 0 {
                return Err(StoreError::Config(format!(
                    "container {name} at {} reports zero capacity",
                    root.display()
                )));
            }

            let state = ContainerState::new(
                name.as_str(),
                root.as_path(),
                Arc::clone(&probe),
                config.archive_enabled,
                capacity,
                config.backpressure_ratio,
            );
            let min_usable = config.archive_enabled.then(|| {
                let bytes =
                    (capacity as f64 * (1.0 - (config.max_archive_ratio - ARCHIVE_HEADROOM))) as u64;
                info!(
                    container = %name,
                    min_usable_bytes = bytes,
                    "archived data will be deleted while usable space is below this threshold"
                );
                bytes
            });

            let container = Container::new(
                name.as_str(),
                root.as_path(),
                config.sections_per_container,
                state,
                config.reclaim_queue_capacity,
                min_usable,
            );
            container.ensure_layout()?;
            container
                .state()
                .set_archived_count(container.count_archived_files());
            info!(
                container = %name,
                root = %root.display(),
                capacity,
                sections = config.sections_per_container,
                "initialized container"
            );
            by_name.insert(name.clone(), containers.len());
            containers.push(container);
        }

        let inner = Arc::new(RepositoryInner {
            writable_pool: BoundedQueue::new(config.max_pooled_claims),
            config,
            containers,
            by_name,
            tracker,
            probe,
            ids: ClaimIdGenerator::new(),
            open_streams: Mutex::new(HashMap::new()),
            shut_down: AtomicBool::new(false),
        });

        let scheduler = if start_daemons {
            Some(Self::start_daemons(&inner)?)
        } else {
            None
        };

        Ok(Self {
            inner,
            scheduler: Mutex::new(scheduler),
        })
    }

    fn start_daemons(inner: &Arc<RepositoryInner>) -> StoreResult<TaskScheduler> {
        let config = &inner.config;
        let mut scheduler = TaskScheduler::new(inner.containers.len() * 2 + 1)?;

        let task = Arc::clone(inner);
        scheduler.schedule_with_fixed_delay(
            "bin-destructable-claims",
            config.destruction_interval,
            move || {
                task.bin_destructable_claims();
            },
        );

        for (i, container) in inner.containers.iter().enumerate() {
            let task = Arc::clone(inner);
            scheduler.schedule_with_fixed_delay(
                format!("archive-or-destroy-{}", container.name()),
                config.destruction_interval,
                move || {
                    task.archive_or_destroy(&task.containers[i]);
                },
            );

            if config.archive_enabled {
                let task = Arc::clone(inner);
                scheduler.schedule_with_fixed_delay(
                    format!("expire-archive-{}", container.name()),
                    config.cleanup_frequency,
                    move || {
                        let container = &task.containers[i];
                        // Failures are logged by the task itself.
                        if let Ok(report) = expiration::run_expiration_task(
                            container,
                            task.probe.as_ref(),
                            task.config.max_retention,
                        ) {
                            debug!(
                                container = %container.name(),
                                deleted = report.deleted(),
                                skipped = report.skipped,
                                "expiration pass finished"
                            );
                        }
                    },
                );
            }
        }

        info!(tasks = scheduler.task_names().len(), "started background tasks");
        Ok(scheduler)
    }

    /// Validated settings the repository runs with.
    pub fn config(&self) -> &ResolvedConfig {
        &self.inner.config
    }

    /// The reference tracker deciding claim lifetimes.
    pub fn tracker(&self) -> &Arc<dyn ReferenceTracker> {
        &self.inner.tracker
    }

    /// `true` once [`shutdown`](Self::shutdown) has run.
    pub fn is_shut_down(&self) -> bool {
        self.inner.is_shut_down()
    }

    // -----------------------------------------------------------------------
    // Write path
    // -----------------------------------------------------------------------

    /// Allocate a content claim, reusing a pooled resource claim if one is
    /// available. May block while every container is under back-pressure.
    pub fn create(&self, loss_tolerant: bool) -> StoreResult<ContentClaim> {
        self.inner.create(loss_tolerant)
    }

    /// Open a writer for a freshly created claim. A claim can be written
    /// once.
    pub fn write(&self, claim: &ContentClaim) -> StoreResult<ContentWriter> {
        if claim.length().is_some() {
            return Err(StoreError::InvalidClaim(format!(
                "{claim} has already been written to"
            )));
        }
        let resource = claim.resource_claim().clone();
        let stream = self
            .inner
            .open_streams
            .lock()
            .get(&resource)
            .cloned()
            .ok_or_else(|| {
                StoreError::InvalidClaim(format!("{resource} is not open for writing"))
            })?;
        if stream.bytes_written() != claim.offset() {
            return Err(StoreError::InvalidClaim(format!(
                "{claim} starts at offset {} but its resource claim ends at {}",
                claim.offset(),
                stream.bytes_written()
            )));
        }

        claim.set_length(0);
        let inner = Arc::clone(&self.inner);
        let hook_stream = Arc::clone(&stream);
        Ok(ContentWriter::new(
            claim.clone(),
            stream,
            Box::new(move |failed| inner.complete_write(&resource, &hook_stream, failed)),
        ))
    }

    /// Copy `original` into a new claim. On failure the new claim is released
    /// and removed before the error is returned.
    pub fn clone_claim(
        &self,
        original: &ContentClaim,
        loss_tolerant: bool,
    ) -> StoreResult<ContentClaim> {
        let copy = self.create(loss_tolerant)?;
        let result = self.write(&copy).and_then(|mut writer| {
            let copied = self
                .read(original)
                .and_then(|mut reader| Ok(io::copy(&mut reader, &mut writer)?));
            match copied {
                Ok(_) => Ok(writer.close()?),
                Err(e) => {
                    writer.abort();
                    Err(e)
                }
            }
        });

        if let Err(e) = result {
            self.rollback(&copy);
            return Err(e);
        }
        Ok(copy)
    }

    fn rollback(&self, claim: &ContentClaim) {
        let resource = claim.resource_claim();
        if self.inner.tracker.claim_state(resource).is_writable() {
            self.inner.retire_stream(resource, None);
            self.inner.tracker.freeze(resource);
        }
        self.inner.tracker.decrement_claimant_count(resource);
        if let Err(e) = self.remove(claim) {
            warn!(claim = %claim, error = %e, "failed to remove claim after aborted copy");
        }
    }

    /// Write the file at `source` into `claim`. Returns bytes copied.
    pub fn import_from_path(&self, source: &Path, claim: &ContentClaim) -> StoreResult<u64> {
        let mut file = File::open(source)?;
        self.import_from_reader(&mut file, claim)
    }

    /// Copy everything from `source` into `claim`. Returns bytes copied.
    pub fn import_from_reader<R: Read + ?Sized>(
        &self,
        source: &mut R,
        claim: &ContentClaim,
    ) -> StoreResult<u64> {
        let mut writer = self.write(claim)?;
        match io::copy(source, &mut writer) {
            Ok(copied) => {
                writer.close()?;
                Ok(copied)
            }
            Err(e) => {
                writer.abort();
                Err(e.into())
            }
        }
    }

    // -----------------------------------------------------------------------
    // Read path
    // -----------------------------------------------------------------------

    /// Open the claim's bytes, falling back to the archive location. A claim
    /// still being written is readable up to its current length.
    pub fn read(&self, claim: &ContentClaim) -> StoreResult<ContentReader> {
        let resource = claim.resource_claim();
        let mut file = self.inner.open_content(resource)?;
        let actual = file.metadata()?.len();
        if claim.offset() > actual {
            return Err(StoreError::not_found(
                resource,
                format!(
                    "content claim starts at offset {} but the resource claim holds only {actual} bytes",
                    claim.offset()
                ),
            ));
        }
        file.seek(SeekFrom::Start(claim.offset()))?;
        Ok(LimitedReader::new(file, claim.length_supplier()))
    }

    fn read_range(
        &self,
        claim: &ContentClaim,
        offset: u64,
        length: u64,
    ) -> StoreResult<io::Take<ContentReader>> {
        let size = self.size(claim)?;
        if offset.checked_add(length).map_or(true, |end| end > size) {
            return Err(StoreError::InvalidClaim(format!(
                "cannot export {length} bytes at offset {offset} from {claim} of {size} bytes"
            )));
        }
        let mut reader = self.read(claim)?;
        let skipped = io::copy(&mut (&mut reader).take(offset), &mut io::sink())?;
        if skipped < offset {
            return Err(StoreError::not_found(
                claim.resource_claim(),
                format!("content ended after {skipped} bytes while skipping to offset {offset}"),
            ));
        }
        Ok(reader.take(length))
    }

    /// Copy the claim's bytes to `dest`, appending or truncating.
    pub fn export_to_path(&self, claim: &ContentClaim, dest: &Path, append: bool) -> StoreResult<u64> {
        let mut reader = self.read(claim)?;
        let mut out = open_destination(dest, append)?;
        let copied = io::copy(&mut reader, &mut out)?;
        out.flush()?;
        Ok(copied)
    }

    /// Copy `length` bytes starting `offset` bytes into the claim to `dest`.
    pub fn export_to_path_range(
        &self,
        claim: &ContentClaim,
        dest: &Path,
        append: bool,
        offset: u64,
        length: u64,
    ) -> StoreResult<u64> {
        let mut reader = self.read_range(claim, offset, length)?;
        let mut out = open_destination(dest, append)?;
        let copied = io::copy(&mut reader, &mut out)?;
        out.flush()?;
        Ok(copied)
    }

    /// Copy the claim's bytes to `out`.
    pub fn export_to_writer<W: Write + ?Sized>(
        &self,
        claim: &ContentClaim,
        out: &mut W,
    ) -> StoreResult<u64> {
        let mut reader = self.read(claim)?;
        Ok(io::copy(&mut reader, out)?)
    }

    /// Copy `length` bytes starting `offset` bytes into the claim to `out`.
    pub fn export_to_writer_range<W: Write + ?Sized>(
        &self,
        claim: &ContentClaim,
        out: &mut W,
        offset: u64,
        length: u64,
    ) -> StoreResult<u64> {
        let mut reader = self.read_range(claim, offset, length)?;
        Ok(io::copy(&mut reader, out)?)
    }

    /// Bytes in the claim. A claim of unknown length extends to the end of
    /// its resource claim.
    pub fn size(&self, claim: &ContentClaim) -> StoreResult<u64> {
        match claim.length() {
            Some(length) => Ok(length),
            None => Ok(self
                .size_of_resource(claim.resource_claim())?
                .saturating_sub(claim.offset())),
        }
    }

    /// Size of the resource claim's file, live or archived.
    pub fn size_of_resource(&self, resource: &ResourceClaim) -> StoreResult<u64> {
        let path = self
            .inner
            .resolve_path(resource)
            .ok_or_else(|| StoreError::not_found(resource, "no live or archived file"))?;
        Ok(fs::metadata(path)?.len())
    }

    /// `true` if the claim's bytes exist in the live or archive location.
    pub fn is_accessible(&self, claim: &ContentClaim) -> bool {
        self.inner.resolve_path(claim.resource_claim()).is_some()
    }

    // -----------------------------------------------------------------------
    // Reference lifecycle
    // -----------------------------------------------------------------------

    /// Number of owners currently referencing `resource`.
    pub fn claimant_count(&self, resource: &ResourceClaim) -> u32 {
        self.inner.tracker.claimant_count(resource)
    }

    /// Add an owner to an existing resource claim. Returns the new count.
    pub fn increment_claimant_count(&self, resource: &ResourceClaim) -> u32 {
        self.inner.tracker.increment_claimant_count(resource, false)
    }

    /// Release an owner. At zero the claim becomes eligible for destruction.
    pub fn decrement_claimant_count(&self, resource: &ResourceClaim) -> u32 {
        self.inner.tracker.decrement_claimant_count(resource)
    }

    /// Delete the claim's resource claim if nothing uses it any more.
    /// Returns `false` when the claim is still in use.
    pub fn remove(&self, claim: &ContentClaim) -> StoreResult<bool> {
        self.remove_resource(claim.resource_claim())
    }

    /// Delete the live file of an unused resource claim.
    pub fn remove_resource(&self, resource: &ResourceClaim) -> StoreResult<bool> {
        self.inner.remove_resource(resource)
    }

    /// Move an unused resource claim into its section's archive directory.
    /// Returns whether a file was moved.
    pub fn archive(&self, resource: &ResourceClaim) -> StoreResult<bool> {
        self.inner.archive(resource)
    }

    /// Run the destruction pipeline once, synchronously: every claim the
    /// tracker has released, plus anything already binned, is archived or
    /// removed.
    pub fn run_destruction_now(&self) -> DestructionReport {
        let mut report = DestructionReport::default();
        loop {
            let batch = self
                .inner
                .tracker
                .drain_destructable(MAX_DESTRUCTION_BATCH, Duration::ZERO);
            if batch.is_empty() {
                break;
            }
            for claim in &batch {
                self.inner.destroy_claim(claim, &mut report);
            }
        }
        for container in &self.inner.containers {
            report.merge(&self.inner.archive_or_destroy(container));
        }
        report
    }

    /// Run one full expiration pass over `container` and release blocked
    /// writers.
    pub fn run_expiration_now(&self, container: &str) -> StoreResult<ExpirationReport> {
        let container = self.inner.container(container)?;
        let result = expiration::destroy_expired_archives(
            container,
            self.inner.probe.as_ref(),
            self.inner.config.max_retention,
        );
        container.state().signal_creation_ready();
        Ok(result?)
    }

    // -----------------------------------------------------------------------
    // Reconciliation and maintenance
    // -----------------------------------------------------------------------

    /// Archive or delete live files that no claim references, e.g. after a
    /// crash. Failures are logged and counted; the scan always completes.
    pub fn cleanup(&self) -> CleanupReport {
        let mut report = CleanupReport::default();
        for container in &self.inner.containers {
            for claim in live_claims(container) {
                report.scanned += 1;
                if self.inner.tracker.is_in_use(&claim) {
                    continue;
                }
                let result = if self.inner.config.archive_enabled {
                    self.inner.archive(&claim)
                } else {
                    self.inner.remove_resource(&claim)
                };
                match result {
                    Ok(true) if self.inner.config.archive_enabled => report.archived += 1,
                    Ok(true) => report.removed += 1,
                    Ok(false) => {}
                    Err(e) => {
                        report.failed += 1;
                        warn!(claim = %claim, error = %e, "failed to reclaim orphaned resource claim");
                    }
                }
            }
        }
        info!(
            scanned = report.scanned,
            archived = report.archived,
            removed = report.removed,
            failed = report.failed,
            "reconciled orphaned resource claims"
        );
        report
    }

    /// Every live (not archived) resource claim on disk in `container`.
    /// Unknown containers have none.
    pub fn active_resource_claims(&self, container: &str) -> Vec<ResourceClaim> {
        let Ok(container) = self.inner.container(container) else {
            return Vec::new();
        };
        let mut claims = live_claims(container);
        claims.sort();
        claims
    }

    /// Delete all content in every container and reset in-memory state.
    /// The repository stays usable afterwards.
    pub fn purge(&self) -> StoreResult<()> {
        let inner = &self.inner;
        inner.close_all_streams();
        for container in &inner.containers {
            container.reclaimable.clear();
            container.archived.clear();
            container.state().set_archived_count(0);
            container.set_oldest_archive_ms(0);
            clear_directory(container.root())?;
        }
        for container in &inner.containers {
            verify_writable(container)?;
            container.ensure_layout().map_err(|e| {
                StoreError::Purge(format!(
                    "cannot recreate sections of container {}: {e}",
                    container.name()
                ))
            })?;
        }
        inner.tracker.purge();
        info!(containers = inner.containers.len(), "purged content repository");
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Introspection
    // -----------------------------------------------------------------------

    /// Configured container names, in configuration order.
    pub fn container_names(&self) -> Vec<String> {
        self.inner
            .containers
            .iter()
            .map(|c| c.name().to_string())
            .collect()
    }

    /// Total bytes on the volume holding `container`.
    pub fn container_capacity(&self, container: &str) -> StoreResult<u64> {
        let container = self.inner.container(container)?;
        Ok(self.inner.probe.capacity(container.root())?)
    }

    /// Bytes still available on the volume holding `container`.
    pub fn container_usable_space(&self, container: &str) -> StoreResult<u64> {
        let container = self.inner.container(container)?;
        Ok(self.inner.probe.usable_space(container.root())?)
    }

    /// Archived files known to be waiting for expiration in `container`.
    pub fn archived_file_count(&self, container: &str) -> StoreResult<u64> {
        Ok(self.inner.container(container)?.state().archived_count())
    }

    // -----------------------------------------------------------------------
    // Lifecycle
    // -----------------------------------------------------------------------

    /// Stop background tasks, release blocked writers and force-close every
    /// open stream. Writers still holding a stream get I/O errors. Idempotent.
    pub fn shutdown(&self) {
        if self.inner.shut_down.swap(true, Ordering::AcqRel) {
            return;
        }
        for container in &self.inner.containers {
            container.state().release_all();
        }
        if let Some(mut scheduler) = self.scheduler.lock().take() {
            scheduler.shutdown();
        }
        self.inner.close_all_streams();
        info!("content repository shut down");
    }
}

impl Drop for FileSystemRepository {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl std::fmt::Debug for FileSystemRepository {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileSystemRepository")
            .field("containers", &self.container_names())
            .field("open_streams", &self.inner.open_streams.lock().len())
            .field("pooled", &self.inner.writable_pool.len())
            .field("shut_down", &self.is_shut_down())
            .finish()
    }
}

/// Live resource claim files of `container`: `<root>/<section>/<id>`.
fn live_claims(container: &Container) -> Vec<ResourceClaim> {
    WalkDir::new(container.root())
        .min_depth(2)
        .max_depth(2)
        .into_iter()
        .filter_entry(|e| e.file_name() != ARCHIVE_DIR_NAME)
        .filter_map(|entry| match entry {
            Ok(entry) => Some(entry),
            Err(e) => {
                warn!(container = %container.name(), error = %e, "cannot scan container");
                None
            }
        })
        .filter(|entry| entry.file_type().is_file())
        .filter_map(|entry| {
            let id = entry.file_name().to_str()?.to_string();
            let section = entry.path().parent()?.file_name()?.to_str()?.to_string();
            Some(ResourceClaim::new(container.name(), section, id, false))
        })
        .collect()
}

fn open_destination(dest: &Path, append: bool) -> io::Result<File> {
    if let Some(parent) = dest.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)?;
    }
    let mut options = OpenOptions::new();
    options.create(true);
    if append {
        options.append(true);
    } else {
        options.write(true).truncate(true);
    }
    options.open(dest)
}

fn clear_directory(root: &Path) -> StoreResult<()> {
    let entries = match fs::read_dir(root) {
        Ok(entries) => entries,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
        Err(e) => {
            return Err(StoreError::Purge(format!(
                "cannot list {}: {e}",
                root.display()
            )))
        }
    };
    for entry in entries {
        let entry = entry.map_err(|e| StoreError::Purge(format!("cannot list {}: {e}", root.display())))?;
        let path = entry.path();
        let removed = if path.is_dir() {
            fs::remove_dir_all(&path)
        } else {
            fs::remove_file(&path)
        };
        removed.map_err(|e| StoreError::Purge(format!("cannot delete {}: {e}", path.display())))?;
    }
    Ok(())
}

/// The container root must exist and accept new files, allowing a moment
/// for the file system to settle after a large delete.
fn verify_writable(container: &Container) -> StoreResult<()> {
    let root = container.root();
    let mut last_error = None;
    for attempt in 1..=PURGE_VERIFY_ATTEMPTS {
        match fs::create_dir_all(root).and_then(|()| tempfile::tempfile_in(root)) {
            Ok(_) => return Ok(()),
            Err(e) => {
                debug!(container = %container.name(), attempt, error = %e, "container not writable yet");
                last_error = Some(e);
                std::thread::sleep(PURGE_VERIFY_DELAY);
            }
        }
    }
    Err(StoreError::Purge(format!(
        "container {} at {} is missing or not writable: {}",
        container.name(),
        root.display(),
        last_error.map_or_else(|| "unknown error".to_string(), |e| e.to_string())
    )))
}

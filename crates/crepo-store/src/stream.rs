use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use crepo_types::ContentClaim;
use parking_lot::Mutex;
use tracing::warn;

/// Open append handle on a resource claim file, counting every byte.
///
/// One `ClaimStream` exists per open resource claim. It is shared between
/// the open-handle table and whichever [`ContentWriter`] currently owns the
/// claim, so the handle lives behind a lock and can be force-closed from
/// another thread. Writes go straight to the file: a byte is counted only
/// once the kernel has it, so readers never see a length ahead of the data.
pub struct ClaimStream {
    path: PathBuf,
    file: Mutex<Option<File>>,
    bytes_written: AtomicU64,
}

impl ClaimStream {
    /// Open `path` for append, creating the file and, if needed, its section
    /// directory.
    pub fn open(path: &Path) -> io::Result<Self> {
        let file = match Self::open_append(path) {
            Ok(file) => file,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                if let Some(parent) = path.parent() {
                    fs::create_dir_all(parent)?;
                }
                Self::open_append(path)?
            }
            Err(e) => return Err(e),
        };
        let existing = file.metadata()?.len();
        Ok(Self {
            path: path.to_path_buf(),
            file: Mutex::new(Some(file)),
            bytes_written: AtomicU64::new(existing),
        })
    }

    fn open_append(path: &Path) -> io::Result<File> {
        OpenOptions::new().create(true).append(true).open(path)
    }

    /// Total bytes in the resource claim, i.e. the next append offset.
    pub fn bytes_written(&self) -> u64 {
        self.bytes_written.load(Ordering::Acquire)
    }

    pub fn is_closed(&self) -> bool {
        self.file.lock().is_none()
    }

    pub fn write_all(&self, buf: &[u8]) -> io::Result<()> {
        let mut guard = self.file.lock();
        let file = guard.as_mut().ok_or_else(closed)?;
        file.write_all(buf)?;
        self.bytes_written.fetch_add(buf.len() as u64, Ordering::AcqRel);
        Ok(())
    }

    pub fn flush(&self) -> io::Result<()> {
        match self.file.lock().as_mut() {
            Some(file) => file.flush(),
            None => Err(closed()),
        }
    }

    /// `fsync` the file.
    pub fn sync(&self) -> io::Result<()> {
        let guard = self.file.lock();
        guard.as_ref().ok_or_else(closed)?.sync_all()
    }

    /// Release the handle. Closing twice is a no-op.
    pub fn close(&self) -> io::Result<()> {
        match self.file.lock().take() {
            Some(mut file) => file.flush(),
            None => Ok(()),
        }
    }
}

impl std::fmt::Debug for ClaimStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClaimStream")
            .field("path", &self.path)
            .field("bytes_written", &self.bytes_written())
            .field("closed", &self.is_closed())
            .finish()
    }
}

fn closed() -> io::Error {
    io::Error::new(io::ErrorKind::BrokenPipe, "content stream has been closed")
}

/// Runs when a [`ContentWriter`] finishes. The flag is `true` if the write
/// failed or was aborted.
pub type CloseHook = Box<dyn FnOnce(bool) -> io::Result<()> + Send>;

/// Byte sink for one content claim.
///
/// Appends to the shared [`ClaimStream`] and publishes the running length on
/// the [`ContentClaim`] after every write, so readers of a growing claim see
/// progress. Closing hands the resource claim back to the repository, which
/// either returns it to the writable pool or freezes it.
pub struct ContentWriter {
    claim: ContentClaim,
    stream: std::sync::Arc<ClaimStream>,
    written: u64,
    failed: bool,
    on_close: Option<CloseHook>,
}

impl ContentWriter {
    pub fn new(claim: ContentClaim, stream: std::sync::Arc<ClaimStream>, on_close: CloseHook) -> Self {
        Self {
            claim,
            stream,
            written: 0,
            failed: false,
            on_close: Some(on_close),
        }
    }

    pub fn claim(&self) -> &ContentClaim {
        &self.claim
    }

    /// Bytes written through this writer.
    pub fn bytes_written(&self) -> u64 {
        self.written
    }

    /// Finish the claim. The resource claim may be reused for later claims.
    pub fn close(mut self) -> io::Result<()> {
        self.finish()
    }

    /// Give up on the claim. Its resource claim is frozen and never reused.
    pub fn abort(mut self) {
        self.failed = true;
        if let Err(e) = self.finish() {
            warn!(claim = %self.claim, error = %e, "error while aborting content write");
        }
    }

    fn finish(&mut self) -> io::Result<()> {
        let Some(hook) = self.on_close.take() else {
            return Ok(());
        };
        let mut result = Ok(());
        if !self.failed {
            if let Err(e) = self.stream.flush() {
                self.failed = true;
                result = Err(e);
            }
        }
        let hooked = hook(self.failed);
        result.and(hooked)
    }
}

impl Write for ContentWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if self.on_close.is_none() {
            return Err(closed());
        }
        if let Err(e) = self.stream.write_all(buf) {
            self.failed = true;
            return Err(e);
        }
        self.written += buf.len() as u64;
        self.claim.set_length(self.written);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.stream.flush().inspect_err(|_| self.failed = true)
    }
}

impl Drop for ContentWriter {
    fn drop(&mut self) {
        if let Err(e) = self.finish() {
            warn!(claim = %self.claim, error = %e, "error closing dropped content writer");
        }
    }
}

impl std::fmt::Debug for ContentWriter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ContentWriter")
            .field("claim", &self.claim)
            .field("written", &self.written)
            .field("failed", &self.failed)
            .finish()
    }
}

/// Reader capped by a length that may still be growing.
///
/// The limit is re-read on every call; `None` means "not known yet" and the
/// reader passes through whatever the inner source has.
pub struct LimitedReader<R> {
    inner: R,
    limit: Box<dyn Fn() -> Option<u64> + Send + Sync>,
    consumed: u64,
}

impl<R: Read> LimitedReader<R> {
    pub fn new(inner: R, limit: impl Fn() -> Option<u64> + Send + Sync + 'static) -> Self {
        Self {
            inner,
            limit: Box::new(limit),
            consumed: 0,
        }
    }

    pub fn consumed(&self) -> u64 {
        self.consumed
    }

}

impl<R> std::fmt::Debug for LimitedReader<R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LimitedReader")
            .field("consumed", &self.consumed)
            .field("limit", &(self.limit)())
            .finish()
    }
}

impl<R: Read> Read for LimitedReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let window = match (self.limit)() {
            Some(limit) => {
                let remaining = limit.saturating_sub(self.consumed);
                if remaining == 0 {
                    return Ok(0);
                }
                buf.len().min(usize::try_from(remaining).unwrap_or(usize::MAX))
            }
            None => buf.len(),
        };
        let n = self.inner.read(&mut buf[..window])?;
        self.consumed += n as u64;
        Ok(n)
    }
}

/// Byte source returned by the read path.
pub type ContentReader = LimitedReader<File>;

#[cfg(test)]
mod tests {
    use super::*;
    use crepo_types::ResourceClaim;
    use proptest::prelude::*;
    use std::sync::atomic::AtomicBool;
    use std::sync::Arc;

    fn content_claim() -> ContentClaim {
        ContentClaim::new(ResourceClaim::new("c1", "0", "1-1", false), 0)
    }

    // -----------------------------------------------------------------------
    // ClaimStream
    // -----------------------------------------------------------------------

    #[test]
    fn open_creates_missing_section() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("5").join("1-1");
        let stream = ClaimStream::open(&path).unwrap();
        stream.write_all(b"abc").unwrap();
        stream.close().unwrap();
        assert_eq!(fs::read(&path).unwrap(), b"abc");
        assert_eq!(stream.bytes_written(), 3);
    }

    #[test]
    fn reopen_counts_existing_bytes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("1-1");
        fs::write(&path, b"12345").unwrap();
        let stream = ClaimStream::open(&path).unwrap();
        assert_eq!(stream.bytes_written(), 5);
    }

    #[test]
    fn writes_after_close_fail() {
        let dir = tempfile::tempdir().unwrap();
        let stream = ClaimStream::open(&dir.path().join("1-1")).unwrap();
        stream.close().unwrap();
        stream.close().unwrap();
        assert!(stream.is_closed());
        assert!(stream.write_all(b"x").is_err());
        assert!(stream.sync().is_err());
    }

    // -----------------------------------------------------------------------
    // ContentWriter
    // -----------------------------------------------------------------------

    #[test]
    fn writer_tracks_claim_length() {
        let dir = tempfile::tempdir().unwrap();
        let stream = Arc::new(ClaimStream::open(&dir.path().join("1-1")).unwrap());
        let claim = content_claim();
        let hook_failed = Arc::new(AtomicBool::new(true));
        let seen = Arc::clone(&hook_failed);

        let mut writer = ContentWriter::new(
            claim.clone(),
            Arc::clone(&stream),
            Box::new(move |failed| {
                seen.store(failed, Ordering::SeqCst);
                Ok(())
            }),
        );
        writer.write_all(b"hello").unwrap();
        assert_eq!(claim.length(), Some(5));
        writer.write_all(b" world").unwrap();
        assert_eq!(claim.length(), Some(11));
        writer.close().unwrap();

        assert!(!hook_failed.load(Ordering::SeqCst));
        assert_eq!(stream.bytes_written(), 11);
    }

    #[test]
    fn written_bytes_are_on_disk_before_length_is_published() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("1-1");
        let stream = Arc::new(ClaimStream::open(&path).unwrap());
        let claim = content_claim();
        let mut writer = ContentWriter::new(claim.clone(), stream, Box::new(|_| Ok(())));

        writer.write_all(b"partial").unwrap();
        assert_eq!(claim.length(), Some(7));
        assert_eq!(fs::read(&path).unwrap(), b"partial");

        let mut reader = LimitedReader::new(File::open(&path).unwrap(), claim.length_supplier());
        let mut out = Vec::new();
        reader.read_to_end(&mut out).unwrap();
        assert_eq!(out, b"partial");
        writer.close().unwrap();
    }

    #[test]
    fn abort_reports_failure_to_hook() {
        let dir = tempfile::tempdir().unwrap();
        let stream = Arc::new(ClaimStream::open(&dir.path().join("1-1")).unwrap());
        let hook_failed = Arc::new(AtomicBool::new(false));
        let seen = Arc::clone(&hook_failed);
        let writer = ContentWriter::new(
            content_claim(),
            stream,
            Box::new(move |failed| {
                seen.store(failed, Ordering::SeqCst);
                Ok(())
            }),
        );
        writer.abort();
        assert!(hook_failed.load(Ordering::SeqCst));
    }

    #[test]
    fn drop_runs_hook_once() {
        let dir = tempfile::tempdir().unwrap();
        let stream = Arc::new(ClaimStream::open(&dir.path().join("1-1")).unwrap());
        let calls = Arc::new(AtomicU64::new(0));
        let counter = Arc::clone(&calls);
        {
            let mut writer = ContentWriter::new(
                content_claim(),
                stream,
                Box::new(move |_| {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }),
            );
            writer.write_all(b"x").unwrap();
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn write_to_force_closed_stream_marks_failure() {
        let dir = tempfile::tempdir().unwrap();
        let stream = Arc::new(ClaimStream::open(&dir.path().join("1-1")).unwrap());
        let hook_failed = Arc::new(AtomicBool::new(false));
        let seen = Arc::clone(&hook_failed);
        let mut writer = ContentWriter::new(
            content_claim(),
            Arc::clone(&stream),
            Box::new(move |failed| {
                seen.store(failed, Ordering::SeqCst);
                Ok(())
            }),
        );
        stream.close().unwrap();
        assert!(writer.write_all(b"late").is_err());
        drop(writer);
        assert!(hook_failed.load(Ordering::SeqCst));
    }

    // -----------------------------------------------------------------------
    // LimitedReader
    // -----------------------------------------------------------------------

    #[test]
    fn unknown_length_reads_everything() {
        let mut reader = LimitedReader::new(&b"abcdef"[..], || None);
        let mut out = Vec::new();
        reader.read_to_end(&mut out).unwrap();
        assert_eq!(out, b"abcdef");
    }

    #[test]
    fn growing_limit_is_observed() {
        let limit = Arc::new(AtomicU64::new(2));
        let observed = Arc::clone(&limit);
        let mut reader =
            LimitedReader::new(&b"abcdef"[..], move || Some(observed.load(Ordering::SeqCst)));

        let mut out = Vec::new();
        reader.read_to_end(&mut out).unwrap();
        assert_eq!(out, b"ab");

        limit.store(4, Ordering::SeqCst);
        reader.read_to_end(&mut out).unwrap();
        assert_eq!(out, b"abcd");
        assert_eq!(reader.consumed(), 4);
    }

    proptest! {
        #[test]
        fn limited_reader_never_exceeds_limit(
            data in proptest::collection::vec(any::<u8>(), 0..512),
            limit in 0u64..600,
        ) {
            let mut reader = LimitedReader::new(&data[..], move || Some(limit));
            let mut out = Vec::new();
            reader.read_to_end(&mut out).unwrap();
            let expected = data.len().min(limit as usize);
            prop_assert_eq!(&out[..], &data[..expected]);
        }
    }
}

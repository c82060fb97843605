use std::io;
use std::path::Path;

/// Source of capacity and free-space figures for a container root.
///
/// File system space queries are comparatively expensive; callers cache the
/// results (see [`ContainerState`](crate::backpressure::ContainerState)).
pub trait SpaceProbe: Send + Sync {
    /// Total size of the volume holding `path`, in bytes.
    fn capacity(&self, path: &Path) -> io::Result<u64>;

    /// Bytes available to this process on the volume holding `path`.
    fn usable_space(&self, path: &Path) -> io::Result<u64>;
}

/// [`SpaceProbe`] backed by the operating system's volume statistics.
#[derive(Clone, Copy, Debug, Default)]
pub struct FsSpaceProbe;

impl SpaceProbe for FsSpaceProbe {
    fn capacity(&self, path: &Path) -> io::Result<u64> {
        fs2::total_space(path)
    }

    fn usable_space(&self, path: &Path) -> io::Result<u64> {
        fs2::available_space(path)
    }
}

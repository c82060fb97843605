use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::UNIX_EPOCH;

use crepo_types::creation_millis;
use tracing::debug;

/// Name of the per-section directory holding archived resource claims.
pub const ARCHIVE_DIR_NAME: &str = "archive";

/// An archived file discovered on disk, queued for age or space eviction.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ArchiveInfo {
    container_root: PathBuf,
    relative_path: PathBuf,
    name: String,
    size: u64,
    last_modified: u64,
}

impl ArchiveInfo {
    pub fn new(container_root: &Path, path: &Path, size: u64, last_modified: u64) -> Self {
        let relative_path = path
            .strip_prefix(container_root)
            .unwrap_or(path)
            .to_path_buf();
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        Self {
            container_root: container_root.to_path_buf(),
            relative_path,
            name,
            size,
            last_modified,
        }
    }

    pub fn path(&self) -> PathBuf {
        self.container_root.join(&self.relative_path)
    }

    pub fn relative_path(&self) -> &Path {
        &self.relative_path
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    /// Milliseconds since the epoch; see [`last_mod_time`].
    pub fn last_modified(&self) -> u64 {
        self.last_modified
    }
}

/// `true` if `path` sits directly inside an archive directory.
pub fn is_archived_path(path: &Path) -> bool {
    path.parent()
        .and_then(Path::file_name)
        .is_some_and(|name| name == ARCHIVE_DIR_NAME)
}

/// Archive location for a live resource claim path.
pub fn archive_path_for(live: &Path) -> Option<PathBuf> {
    let name = live.file_name()?;
    let parent = live.parent()?;
    Some(parent.join(ARCHIVE_DIR_NAME).join(name))
}

/// Move a live file into its section's archive directory.
///
/// Returns `false` when there was nothing to move: the file is already in an
/// archive directory or no longer exists. A missing archive directory is
/// created and the move retried once.
pub fn archive_file(path: &Path) -> io::Result<bool> {
    if is_archived_path(path) {
        return Ok(false);
    }
    let Some(target) = archive_path_for(path) else {
        return Ok(false);
    };

    match fs::rename(path, &target) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            if !path.exists() {
                debug!(path = %path.display(), "file already gone; nothing to archive");
                return Ok(false);
            }
            if let Some(dir) = target.parent() {
                fs::create_dir_all(dir)?;
            }
            fs::rename(path, &target)?;
            Ok(true)
        }
        Err(e) => Err(e),
    }
}

/// Age of a resource claim file in epoch milliseconds.
///
/// Taken from the timestamp prefix of the claim id when it has one, since
/// that is immune to clock skew on the storage volume. Otherwise the file
/// system modification time is used.
pub fn last_mod_time(path: &Path, metadata: Option<&fs::Metadata>) -> u64 {
    if let Some(ms) = path
        .file_name()
        .and_then(|n| n.to_str())
        .and_then(creation_millis)
    {
        return ms;
    }
    let modified = match metadata {
        Some(m) => m.modified(),
        None => fs::metadata(path).and_then(|m| m.modified()),
    };
    modified
        .ok()
        .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
        .map_or(0, |d| d.as_millis() as u64)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn archive_moves_file_and_creates_directory() {
        let dir = tempfile::tempdir().unwrap();
        let live = dir.path().join("7").join("1700000000000-7");
        fs::create_dir_all(live.parent().unwrap()).unwrap();
        fs::write(&live, b"payload").unwrap();

        assert!(archive_file(&live).unwrap());
        assert!(!live.exists());
        let archived = dir.path().join("7").join("archive").join("1700000000000-7");
        assert_eq!(fs::read(&archived).unwrap(), b"payload");
    }

    #[test]
    fn archiving_an_archived_file_is_a_no_op() {
        let dir = tempfile::tempdir().unwrap();
        let archived = dir.path().join("0").join(ARCHIVE_DIR_NAME).join("1-1");
        fs::create_dir_all(archived.parent().unwrap()).unwrap();
        fs::write(&archived, b"x").unwrap();

        assert!(!archive_file(&archived).unwrap());
        assert!(archived.exists());
    }

    #[test]
    fn archiving_a_missing_file_returns_false() {
        let dir = tempfile::tempdir().unwrap();
        assert!(!archive_file(&dir.path().join("0").join("1-1")).unwrap());
    }

    #[test]
    fn archive_path_is_sibling_directory() {
        let live = Path::new("/data/c1/12/1700-3");
        assert_eq!(
            archive_path_for(live).unwrap(),
            PathBuf::from("/data/c1/12/archive/1700-3")
        );
        assert!(is_archived_path(Path::new("/data/c1/12/archive/1700-3")));
        assert!(!is_archived_path(live));
    }

    #[test]
    fn last_mod_time_prefers_id_timestamp() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("1234-5");
        fs::write(&path, b"x").unwrap();
        assert_eq!(last_mod_time(&path, None), 1234);
    }

    #[test]
    fn last_mod_time_falls_back_to_mtime() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("legacy-name");
        fs::write(&path, b"x").unwrap();
        let ms = last_mod_time(&path, None);
        assert!(ms > 1_600_000_000_000);
    }

    #[test]
    fn archive_info_keeps_relative_path() {
        let root = Path::new("/data/c1");
        let info = ArchiveInfo::new(root, &root.join("3/archive/99-1"), 10, 99);
        assert_eq!(info.relative_path(), Path::new("3/archive/99-1"));
        assert_eq!(info.name(), "99-1");
        assert_eq!(info.path(), root.join("3/archive/99-1"));
        assert_eq!(info.size(), 10);
        assert_eq!(info.last_modified(), 99);
    }
}

//! Fingerprint: a file's identity (size, inode, mode, mtime, content hash)
//! plus the "racily clean" flag that drives whether a stat is sufficient or
//! a rehash is required (`spec.md` §4.1).

use std::path::Path;
use std::time::SystemTime;

use crate::fs_util::{FileSystem, FileType, Metadata};
use crate::hash::Hash;

#[derive(Clone, Copy, PartialEq, Eq, Debug, Hash)]
pub struct FileId {
    pub device: u64,
    pub inode: u64,
}

impl FileId {
    pub fn from_metadata(meta: &Metadata) -> Self {
        Self { device: meta.dev, inode: meta.ino }
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct Fingerprint {
    pub size: u64,
    pub inode: u64,
    /// File-type bits + user-exec bit only; other permission bits ignored.
    pub mode: u32,
    pub mtime: SystemTime,
    pub hash: Hash,
    /// True iff `mtime` equals the clock reading at which this fingerprint
    /// was taken: the file could change within the same mtime-resolution
    /// tick without being detected by a stat alone.
    pub racily_clean: bool,
}

impl Fingerprint {
    pub fn missing() -> Self {
        Self {
            size: 0,
            inode: 0,
            mode: 0,
            mtime: SystemTime::UNIX_EPOCH,
            hash: Hash::NONE,
            racily_clean: false,
        }
    }

    pub fn is_missing(&self) -> bool {
        self.hash.is_none() && self.size == 0 && self.mode == 0
    }

    pub fn is_dir(&self) -> bool {
        self.mode & crate::fs_util::S_IFMT == crate::fs_util::S_IFDIR
    }
}

pub(crate) fn content_hash(fs: &dyn FileSystem, path: &Path, meta: &Metadata) -> Hash {
    match meta.file_type {
        FileType::File => match fs.read(path) {
            Ok(bytes) => Hash::of_bytes(&bytes),
            Err(_) => Hash::NONE,
        },
        FileType::Symlink => match fs.read_link(path) {
            Ok(target) => Hash::of_bytes(target.as_bytes()),
            Err(_) => Hash::NONE,
        },
        FileType::Dir => match fs.read_dir_sorted(path) {
            Ok(mut names) => {
                names.sort();
                Hash::combine(names.iter().map(|n| n.as_bytes()))
            }
            Err(_) => Hash::NONE,
        },
        FileType::Missing => Hash::NONE,
    }
}

/// Stats `path`, hashes its content (files), target (symlinks), or sorted
/// entry list (directories), and reports whether the file is missing.
pub fn take(fs: &dyn FileSystem, clock_now: SystemTime, path: &Path) -> (Fingerprint, FileId) {
    let meta = fs.metadata(path);
    if meta.file_type == FileType::Missing {
        return (Fingerprint::missing(), FileId { device: 0, inode: 0 });
    }
    let hash = content_hash(fs, path, &meta);
    let fp = Fingerprint {
        size: meta.len,
        inode: meta.ino,
        mode: meta.masked_mode(),
        mtime: meta.mtime,
        hash,
        racily_clean: meta.mtime >= clock_now,
    };
    (fp, FileId::from_metadata(&meta))
}

/// If the on-disk fingerprint still matches `prior`, returns `prior` with
/// `racily_clean` refreshed against `clock_now` (no rehash); otherwise
/// returns a fresh [`take`]. This is the "refresh a racily-clean fingerprint"
/// operation the oracle schedules after a clean-but-should-update result.
pub fn retake(
    fs: &dyn FileSystem,
    clock_now: SystemTime,
    path: &Path,
    prior: &Fingerprint,
) -> (Fingerprint, FileId) {
    let meta = fs.metadata(path);
    if meta.file_type == FileType::Missing {
        return (Fingerprint::missing(), FileId { device: 0, inode: 0 });
    }
    let file_id = FileId::from_metadata(&meta);
    if meta.len == prior.size
        && meta.masked_mode() == prior.mode
        && meta.mtime == prior.mtime
        && !prior.racily_clean
    {
        let mut refreshed = *prior;
        refreshed.racily_clean = meta.mtime >= clock_now;
        return (refreshed, file_id);
    }
    take(fs, clock_now, path)
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MatchResult {
    pub clean: bool,
    /// Caller should persist a refreshed fingerprint for this path.
    pub should_update: bool,
    pub file_id: FileId,
}

/// Cheap-first dirtiness check against a prior fingerprint:
///
/// - size/mode/mtime differ *and* sizes differ → dirty without rehashing.
/// - sizes match but mtime differs, or the prior fingerprint was racily
///   clean → rehash; matching hash means clean-but-should-update, mismatched
///   hash means dirty.
pub fn matches(fs: &dyn FileSystem, path: &Path, prior: &Fingerprint) -> MatchResult {
    let meta = fs.metadata(path);
    let file_id = FileId::from_metadata(&meta);

    if meta.file_type == FileType::Missing {
        return MatchResult { clean: prior.is_missing(), should_update: false, file_id };
    }

    let size_differs = meta.len != prior.size;
    let mode_differs = meta.masked_mode() != prior.mode;
    let mtime_differs = meta.mtime != prior.mtime;

    if size_differs && (mode_differs || mtime_differs) {
        return MatchResult { clean: false, should_update: false, file_id };
    }

    if !mtime_differs && !mode_differs && !size_differs && !prior.racily_clean {
        return MatchResult { clean: true, should_update: false, file_id };
    }

    // Same size (or only mode/mtime moved) and possibly racily clean: rehash.
    let hash = content_hash(fs, path, &meta);
    if hash == prior.hash {
        MatchResult { clean: true, should_update: true, file_id }
    } else {
        MatchResult { clean: false, should_update: false, file_id }
    }
}

/// Pure-function form of [`matches`] for when the stat+hash were obtained
/// through another channel (e.g. a sibling step's observed output).
pub fn matches_in_memory(prior: &Fingerprint, new_stat: &Metadata, new_hash: Hash) -> bool {
    if new_stat.file_type == FileType::Missing {
        return prior.is_missing();
    }
    new_stat.len == prior.size && new_stat.masked_mode() == prior.mode && new_hash == prior.hash
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs_util::InMemoryFileSystem;
    use std::path::Path;

    #[test]
    fn unchanged_file_is_clean() {
        let fs = InMemoryFileSystem::new();
        fs.write_file("a", b"hello".to_vec());
        fs.tick();
        let now = fs.now();
        let (fp, _) = take(&fs, now, Path::new("a"));
        assert!(!fp.racily_clean);
        let result = matches(&fs, Path::new("a"), &fp);
        assert!(result.clean);
        assert!(!result.should_update);
    }

    #[test]
    fn racily_clean_write_in_same_tick_is_detected_on_rehash() {
        let fs = InMemoryFileSystem::new();
        fs.write_file("a", b"hello".to_vec());
        let now = fs.now(); // same tick as the write: racily clean
        let (fp, _) = take(&fs, now, Path::new("a"));
        assert!(fp.racily_clean);

        // A same-tick write that changes content: size is unchanged length
        // (both "hello"/"world" are 5 bytes) so the cheap check can't catch
        // it; the racily-clean flag forces a rehash, which does.
        fs.write_file("a", b"world".to_vec());
        let result = matches(&fs, Path::new("a"), &fp);
        assert!(!result.clean);
    }

    #[test]
    fn size_change_is_dirty_without_rehash() {
        let fs = InMemoryFileSystem::new();
        fs.write_file("a", b"hello".to_vec());
        fs.tick();
        let now = fs.now();
        let (fp, _) = take(&fs, now, Path::new("a"));
        fs.tick();
        fs.write_file("a", b"much longer content now".to_vec());
        let result = matches(&fs, Path::new("a"), &fp);
        assert!(!result.clean);
    }

    #[test]
    fn mode_permission_churn_is_ignored() {
        let fs = InMemoryFileSystem::new();
        fs.write_file("a", b"hello".to_vec());
        fs.tick();
        let now = fs.now();
        let (fp, _) = take(&fs, now, Path::new("a"));
        // Re-writing with the same executable-less mode bits but a different
        // unrelated permission bit would not reach this test double (we only
        // model user-exec vs not), so assert the masked mode used here is
        // the regular-file bit pattern.
        assert_eq!(fp.mode & !crate::fs_util::MODE_MASK, 0);
    }

    #[test]
    fn missing_file_matches_missing_prior() {
        let fs = InMemoryFileSystem::new();
        let result = matches(&fs, Path::new("missing"), &Fingerprint::missing());
        assert!(result.clean);
    }
}

//! Filesystem abstraction.
//!
//! The engine never calls `std::fs` directly outside of this module and
//! [`RealFileSystem`]; every other component is generic over (or holds a
//! `dyn`) [`FileSystem`] so the engine logic can be exercised against
//! [`InMemoryFileSystem`] in tests, the same way the C++ original this spec
//! is distilled from drives its whole test suite against
//! `in_memory_file_system.h` instead of the real disk.

use std::collections::BTreeMap;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// User-exec-only mode mask: the spec only cares about file-type bits plus
/// the user-exec bit; other permission churn must never cause a rebuild.
pub const MODE_MASK: u32 = 0o170100; // file-type bits + S_IXUSR
pub const S_IFMT: u32 = 0o170000;
pub const S_IFDIR: u32 = 0o040000;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FileType {
    File,
    Dir,
    Symlink,
    Missing,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Metadata {
    pub file_type: FileType,
    pub len: u64,
    pub mtime: SystemTime,
    pub mode: u32,
    pub dev: u64,
    pub ino: u64,
}

impl Metadata {
    pub fn masked_mode(&self) -> u32 {
        self.mode & MODE_MASK
    }

    pub fn missing() -> Self {
        Self {
            file_type: FileType::Missing,
            len: 0,
            mtime: UNIX_EPOCH,
            mode: 0,
            dev: 0,
            ino: 0,
        }
    }
}

/// Path canonicalization: collapse `.`/`..` and redundant separators without
/// requiring the path to exist, the way the compiled manifest keys its maps.
/// Grounded in the teacher's use of `dunce::canonicalize` for existing paths;
/// here we need a pure lexical form since manifest paths need not exist yet.
pub fn normalize_path(path: &Path) -> PathBuf {
    use std::path::Component;
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                match out.components().next_back() {
                    Some(Component::Normal(_)) => {
                        out.pop();
                    }
                    _ => out.push(".."),
                }
            }
            other => out.push(other.as_os_str()),
        }
    }
    if out.as_os_str().is_empty() {
        out.push(".");
    }
    out
}

pub trait FileSystem: Send + Sync {
    fn metadata(&self, path: &Path) -> Metadata;
    fn read(&self, path: &Path) -> io::Result<Vec<u8>>;
    fn read_link(&self, path: &Path) -> io::Result<String>;
    /// Sorted list of entry names, used to fingerprint a directory's identity.
    fn read_dir_sorted(&self, path: &Path) -> io::Result<Vec<String>>;
    fn write(&self, path: &Path, contents: &[u8]) -> io::Result<()>;
    /// Appends to a file, creating it if absent. Used by the invocation log,
    /// which is append-only by design (`spec.md` §4.2).
    fn append(&self, path: &Path, contents: &[u8]) -> io::Result<()>;
    fn create_dir_all(&self, path: &Path) -> io::Result<()>;
    fn remove_file(&self, path: &Path) -> io::Result<()>;
    /// Fails (non-fatally, caller interprets) if the directory is non-empty.
    fn remove_empty_dir(&self, path: &Path) -> io::Result<()>;
    fn rename(&self, from: &Path, to: &Path) -> io::Result<()>;
    fn now(&self) -> SystemTime;
}

/// Real, disk-backed filesystem. Unix-only metadata extraction: this crate
/// targets the platforms the tracer contract (§6.4) is meaningful on.
pub struct RealFileSystem;

impl FileSystem for RealFileSystem {
    fn metadata(&self, path: &Path) -> Metadata {
        use std::os::unix::fs::MetadataExt;
        match std::fs::symlink_metadata(path) {
            Ok(meta) => {
                let file_type = if meta.file_type().is_symlink() {
                    FileType::Symlink
                } else if meta.is_dir() {
                    FileType::Dir
                } else {
                    FileType::File
                };
                Metadata {
                    file_type,
                    len: meta.len(),
                    mtime: meta.modified().unwrap_or(UNIX_EPOCH),
                    mode: meta.mode(),
                    dev: meta.dev(),
                    ino: meta.ino(),
                }
            }
            Err(_) => Metadata::missing(),
        }
    }

    fn read(&self, path: &Path) -> io::Result<Vec<u8>> {
        std::fs::read(path)
    }

    fn read_link(&self, path: &Path) -> io::Result<String> {
        Ok(std::fs::read_link(path)?.to_string_lossy().into_owned())
    }

    fn read_dir_sorted(&self, path: &Path) -> io::Result<Vec<String>> {
        let mut names: Vec<String> = std::fs::read_dir(path)?
            .filter_map(|e| e.ok())
            .map(|e| e.file_name().to_string_lossy().into_owned())
            .collect();
        names.sort();
        Ok(names)
    }

    fn write(&self, path: &Path, contents: &[u8]) -> io::Result<()> {
        std::fs::write(path, contents)
    }

    fn append(&self, path: &Path, contents: &[u8]) -> io::Result<()> {
        use std::io::Write;
        let mut file = std::fs::OpenOptions::new().create(true).append(true).open(path)?;
        file.write_all(contents)
    }

    fn create_dir_all(&self, path: &Path) -> io::Result<()> {
        std::fs::create_dir_all(path)
    }

    fn remove_file(&self, path: &Path) -> io::Result<()> {
        std::fs::remove_file(path)
    }

    fn remove_empty_dir(&self, path: &Path) -> io::Result<()> {
        std::fs::remove_dir(path)
    }

    fn rename(&self, from: &Path, to: &Path) -> io::Result<()> {
        std::fs::rename(from, to)
    }

    fn now(&self) -> SystemTime {
        SystemTime::now()
    }
}

#[derive(Clone)]
enum Entry {
    File { content: Vec<u8>, mtime: SystemTime, mode: u32 },
    Dir { mtime: SystemTime },
    Symlink { target: String, mtime: SystemTime },
}

/// In-memory filesystem test double with a controllable clock, grounded in
/// `examples/original_source`'s `in_memory_file_system.h`. The clock advances
/// only when the test calls [`InMemoryFileSystem::tick`], which lets tests
/// deliberately construct "racily clean" fingerprints (a write landing in the
/// same tick as the build that reads it).
pub struct InMemoryFileSystem {
    entries: Mutex<BTreeMap<PathBuf, Entry>>,
    clock_ticks: AtomicU64,
    next_ino: AtomicU64,
    inodes: Mutex<BTreeMap<PathBuf, u64>>,
}

impl Default for InMemoryFileSystem {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryFileSystem {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(BTreeMap::new()),
            clock_ticks: AtomicU64::new(1),
            next_ino: AtomicU64::new(1),
            inodes: Mutex::new(BTreeMap::new()),
        }
    }

    /// Advances the clock by one tick (one unit of mtime resolution).
    pub fn tick(&self) -> SystemTime {
        self.clock_ticks.fetch_add(1, Ordering::SeqCst);
        self.now()
    }

    fn ino_for(&self, path: &Path) -> u64 {
        let mut inodes = self.inodes.lock().unwrap();
        *inodes.entry(path.to_path_buf()).or_insert_with(|| {
            self.next_ino.fetch_add(1, Ordering::SeqCst)
        })
    }

    fn ensure_parent_dirs(&self, path: &Path, mtime: SystemTime) {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                let mut entries = self.entries.lock().unwrap();
                let mut built = PathBuf::new();
                for component in parent.components() {
                    built.push(component);
                    entries.entry(built.clone()).or_insert(Entry::Dir { mtime });
                }
            }
        }
    }

    pub fn write_file(&self, path: impl AsRef<Path>, contents: impl Into<Vec<u8>>) {
        let path = normalize_path(path.as_ref());
        let mtime = self.now();
        self.ensure_parent_dirs(&path, mtime);
        self.entries.lock().unwrap().insert(
            path,
            Entry::File { content: contents.into(), mtime, mode: 0o100644 },
        );
    }

    pub fn write_executable(&self, path: impl AsRef<Path>, contents: impl Into<Vec<u8>>) {
        let path = normalize_path(path.as_ref());
        let mtime = self.now();
        self.ensure_parent_dirs(&path, mtime);
        self.entries.lock().unwrap().insert(
            path,
            Entry::File { content: contents.into(), mtime, mode: 0o100755 },
        );
    }

    pub fn mkdir(&self, path: impl AsRef<Path>) {
        let path = normalize_path(path.as_ref());
        let mtime = self.now();
        self.entries.lock().unwrap().entry(path).or_insert(Entry::Dir { mtime });
    }

    pub fn remove(&self, path: impl AsRef<Path>) {
        self.entries.lock().unwrap().remove(&normalize_path(path.as_ref()));
    }

    pub fn exists(&self, path: impl AsRef<Path>) -> bool {
        self.entries.lock().unwrap().contains_key(&normalize_path(path.as_ref()))
    }
}

impl FileSystem for InMemoryFileSystem {
    fn metadata(&self, path: &Path) -> Metadata {
        let path = normalize_path(path);
        let entries = self.entries.lock().unwrap();
        match entries.get(&path) {
            Some(Entry::File { content, mtime, mode }) => Metadata {
                file_type: FileType::File,
                len: content.len() as u64,
                mtime: *mtime,
                mode: *mode,
                dev: 1,
                ino: self.ino_for(&path),
            },
            Some(Entry::Dir { mtime }) => Metadata {
                file_type: FileType::Dir,
                len: 0,
                mtime: *mtime,
                mode: 0o040755,
                dev: 1,
                ino: self.ino_for(&path),
            },
            Some(Entry::Symlink { target, mtime }) => Metadata {
                file_type: FileType::Symlink,
                len: target.len() as u64,
                mtime: *mtime,
                mode: 0o120777,
                dev: 1,
                ino: self.ino_for(&path),
            },
            None => Metadata::missing(),
        }
    }

    fn read(&self, path: &Path) -> io::Result<Vec<u8>> {
        let path = normalize_path(path);
        match self.entries.lock().unwrap().get(&path) {
            Some(Entry::File { content, .. }) => Ok(content.clone()),
            Some(_) => Err(io::Error::new(io::ErrorKind::InvalidInput, "not a regular file")),
            None => Err(io::Error::new(io::ErrorKind::NotFound, "no such file")),
        }
    }

    fn read_link(&self, path: &Path) -> io::Result<String> {
        let path = normalize_path(path);
        match self.entries.lock().unwrap().get(&path) {
            Some(Entry::Symlink { target, .. }) => Ok(target.clone()),
            _ => Err(io::Error::new(io::ErrorKind::InvalidInput, "not a symlink")),
        }
    }

    fn read_dir_sorted(&self, path: &Path) -> io::Result<Vec<String>> {
        let path = normalize_path(path);
        let entries = self.entries.lock().unwrap();
        if !matches!(entries.get(&path), Some(Entry::Dir { .. })) {
            return Err(io::Error::new(io::ErrorKind::NotFound, "no such directory"));
        }
        let prefix = path.clone();
        let mut names: Vec<String> = entries
            .keys()
            .filter_map(|p| {
                let rel = p.strip_prefix(&prefix).ok()?;
                let mut components = rel.components();
                let first = components.next()?;
                if components.next().is_some() {
                    return None;
                }
                Some(first.as_os_str().to_string_lossy().into_owned())
            })
            .collect();
        names.sort();
        names.dedup();
        Ok(names)
    }

    fn write(&self, path: &Path, contents: &[u8]) -> io::Result<()> {
        let path = normalize_path(path);
        let mtime = self.now();
        self.entries.lock().unwrap().insert(
            path,
            Entry::File { content: contents.to_vec(), mtime, mode: 0o100644 },
        );
        Ok(())
    }

    fn append(&self, path: &Path, contents: &[u8]) -> io::Result<()> {
        let path = normalize_path(path);
        let mtime = self.now();
        let mut entries = self.entries.lock().unwrap();
        match entries.get_mut(&path) {
            Some(Entry::File { content, mtime: existing_mtime, .. }) => {
                content.extend_from_slice(contents);
                *existing_mtime = mtime;
            }
            Some(_) => return Err(io::Error::new(io::ErrorKind::InvalidInput, "not a regular file")),
            None => {
                entries.insert(
                    path,
                    Entry::File { content: contents.to_vec(), mtime, mode: 0o100644 },
                );
            }
        }
        Ok(())
    }

    fn create_dir_all(&self, path: &Path) -> io::Result<()> {
        let path = normalize_path(path);
        let mtime = self.now();
        let mut entries = self.entries.lock().unwrap();
        let mut built = PathBuf::new();
        for component in path.components() {
            built.push(component);
            entries.entry(built.clone()).or_insert(Entry::Dir { mtime });
        }
        Ok(())
    }

    fn remove_file(&self, path: &Path) -> io::Result<()> {
        let path = normalize_path(path);
        match self.entries.lock().unwrap().remove(&path) {
            Some(_) => Ok(()),
            None => Err(io::Error::new(io::ErrorKind::NotFound, "no such file")),
        }
    }

    fn remove_empty_dir(&self, path: &Path) -> io::Result<()> {
        let path = normalize_path(path);
        let mut entries = self.entries.lock().unwrap();
        let has_children = entries.keys().any(|p| p.starts_with(&path) && p != &path);
        if has_children {
            return Err(io::Error::other("directory not empty"));
        }
        match entries.remove(&path) {
            Some(Entry::Dir { .. }) => Ok(()),
            Some(_) => Err(io::Error::new(io::ErrorKind::InvalidInput, "not a directory")),
            None => Err(io::Error::new(io::ErrorKind::NotFound, "no such directory")),
        }
    }

    fn rename(&self, from: &Path, to: &Path) -> io::Result<()> {
        let from = normalize_path(from);
        let to = normalize_path(to);
        let mut entries = self.entries.lock().unwrap();
        match entries.remove(&from) {
            Some(entry) => {
                entries.insert(to, entry);
                Ok(())
            }
            None => Err(io::Error::new(io::ErrorKind::NotFound, "no such file")),
        }
    }

    fn now(&self) -> SystemTime {
        UNIX_EPOCH + Duration::from_secs(self.clock_ticks.load(Ordering::SeqCst))
    }
}

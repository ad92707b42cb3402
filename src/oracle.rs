//! Dirtiness oracle (`isClean`, `spec.md` §4.4): decides clean / dirty /
//! clean-but-should-refresh for a compiled step against its invocation
//! record.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use crate::fingerprint::{self, FileId, Fingerprint};
use crate::fs_util::{normalize_path, FileSystem, FileType, Metadata};
use crate::hash::Hash;
use crate::invocation_log::Invocations;
use crate::manifest::Step;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Verdict {
    /// `should_refresh` means the step's recorded fingerprints are stale
    /// (same content, new stat) and should be rewritten on the next
    /// successful log write without re-running the command.
    Clean { should_refresh: bool },
    Dirty,
}

impl Verdict {
    pub fn is_clean(self) -> bool {
        matches!(self, Verdict::Clean { .. })
    }
}

struct CachedStat {
    metadata: Metadata,
    hash: Option<Hash>,
}

/// Per-build cache of fresh stat/hash results, sized to the set of paths the
/// steps under consideration actually reference. Avoids re-stating (and
/// re-hashing) a shared input once per dependent step (`spec.md` §4.4).
#[derive(Default)]
pub struct FingerprintMemo {
    cache: Mutex<HashMap<PathBuf, CachedStat>>,
}

impl FingerprintMemo {
    pub fn new() -> Self {
        Self::default()
    }

    fn with_metadata<R>(&self, fs: &dyn FileSystem, path: &Path, f: impl FnOnce(&Metadata) -> R) -> R {
        let key = normalize_path(path);
        let mut cache = self.cache.lock().unwrap();
        let entry = cache
            .entry(key)
            .or_insert_with(|| CachedStat { metadata: fs.metadata(path), hash: None });
        f(&entry.metadata)
    }

    fn hash_of(&self, fs: &dyn FileSystem, path: &Path) -> Hash {
        let key = normalize_path(path);
        let mut cache = self.cache.lock().unwrap();
        let entry = cache
            .entry(key)
            .or_insert_with(|| CachedStat { metadata: fs.metadata(path), hash: None });
        if entry.hash.is_none() {
            entry.hash = Some(fingerprint::content_hash(fs, path, &entry.metadata));
        }
        entry.hash.unwrap()
    }

    /// Same predicate as [`fingerprint::matches`], but stats/hashes each path
    /// through this memo at most once per build.
    pub fn matches(&self, fs: &dyn FileSystem, path: &Path, prior: &Fingerprint) -> fingerprint::MatchResult {
        let (file_type, len, mtime, mode, file_id) = self.with_metadata(fs, path, |meta| {
            (meta.file_type, meta.len, meta.mtime, meta.masked_mode(), FileId::from_metadata(meta))
        });

        if file_type == FileType::Missing {
            return fingerprint::MatchResult { clean: prior.is_missing(), should_update: false, file_id };
        }

        let size_differs = len != prior.size;
        let mode_differs = mode != prior.mode;
        let mtime_differs = mtime != prior.mtime;

        if size_differs && (mode_differs || mtime_differs) {
            return fingerprint::MatchResult { clean: false, should_update: false, file_id };
        }
        if !mtime_differs && !mode_differs && !size_differs && !prior.racily_clean {
            return fingerprint::MatchResult { clean: true, should_update: false, file_id };
        }

        let hash = self.hash_of(fs, path);
        if hash == prior.hash {
            fingerprint::MatchResult { clean: true, should_update: true, file_id }
        } else {
            fingerprint::MatchResult { clean: false, should_update: false, file_id }
        }
    }

    fn mtime(&self, fs: &dyn FileSystem, path: &Path) -> Option<std::time::SystemTime> {
        self.with_metadata(fs, path, |meta| (meta.file_type != FileType::Missing).then_some(meta.mtime))
    }

    /// Drops any cached stat/hash for `path`. Must be called for every path a
    /// step writes before a later step's `is_clean` consults this memo again
    /// — otherwise a downstream check can observe the pre-write stat (or a
    /// cached "missing") a sibling step already queried earlier in the same
    /// build (`spec.md` §4.8's restat bypass requires live filesystem state).
    pub fn invalidate(&self, path: &Path) {
        self.cache.lock().unwrap().remove(&normalize_path(path));
    }
}

fn mtime_based_verdict(step: &Step, fs: &dyn FileSystem, memo: &FingerprintMemo) -> Verdict {
    let input_mtimes: Vec<_> = step.all_declared_inputs().map(|p| memo.mtime(fs, p)).collect();
    let output_mtimes: Vec<_> =
        step.declared_outputs.iter().map(|p| memo.mtime(fs, p)).collect();

    if input_mtimes.iter().any(Option::is_none) || output_mtimes.iter().any(Option::is_none) {
        return Verdict::Dirty;
    }
    let newest_input = input_mtimes.into_iter().flatten().max();
    let oldest_output = output_mtimes.into_iter().flatten().min();
    match (newest_input, oldest_output) {
        (Some(newest_input), Some(oldest_output)) if newest_input >= oldest_output => Verdict::Dirty,
        _ => Verdict::Clean { should_refresh: false },
    }
}

fn content_based_verdict(step: &Step, invocations: &Invocations, fs: &dyn FileSystem, memo: &FingerprintMemo) -> Verdict {
    let Some(record) = invocations.entries.get(&step.step_hash) else {
        return Verdict::Dirty;
    };

    let mut should_refresh = false;
    for (path, prior) in record.input_files.iter().chain(record.output_files.iter()) {
        let result = memo.matches(fs, path, prior);
        if !result.clean {
            return Verdict::Dirty;
        }
        should_refresh |= result.should_update;
    }
    Verdict::Clean { should_refresh }
}

/// `isClean` (`spec.md` §4.4). Phony steps carry no fingerprinted outputs of
/// their own; their cleanliness is entirely a function of their
/// dependencies, which the build planner checks separately, so they are
/// always reported clean here.
pub fn is_clean(step: &Step, invocations: &Invocations, fs: &dyn FileSystem, memo: &FingerprintMemo) -> Verdict {
    if step.is_phony() {
        Verdict::Clean { should_refresh: false }
    } else if step.generator {
        mtime_based_verdict(step, fs, memo)
    } else {
        content_based_verdict(step, invocations, fs, memo)
    }
}

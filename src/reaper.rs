//! Stale-output reaper (`spec.md` §4.6): deletes outputs and empty
//! created-directory entries that no current manifest step still produces.

use std::collections::HashSet;
use std::path::Path;

use crate::fingerprint;
use crate::fs_util::FileSystem;
use crate::hash::Hash;
use crate::invocation_log::{Invocations, InvocationLog};

/// `deleteStaleOutputs`: for every invocation record whose step-hash is no
/// longer present in `live_step_hashes`, delete its recorded outputs (when
/// the on-disk fingerprint still matches what was recorded) and then any
/// created directory that has become empty. Missing files, unlink errors,
/// and non-empty directories are all silently ignored — the reaper never
/// fails a build.
pub fn delete_stale_outputs(
    invocations: &Invocations,
    live_step_hashes: &HashSet<Hash>,
    fs: &dyn FileSystem,
    log: &mut dyn InvocationLog,
) {
    let stale_hashes: Vec<Hash> = invocations
        .entries
        .keys()
        .filter(|h| !live_step_hashes.contains(h))
        .copied()
        .collect();

    for step_hash in stale_hashes {
        let record = &invocations.entries[&step_hash];
        delete_old_outputs_for(record, fs);
        let _ = log.cleaned_command(step_hash);
    }

    reap_empty_created_directories(invocations, fs, log);
}

/// `deleteOldOutputs`: runs the same output-deletion pass for a single
/// step's prior invocation, used both by the reaper and by the scheduler
/// right before re-executing a step (`spec.md` §4.6).
pub fn delete_old_outputs(invocations: &Invocations, step_hash: Hash, fs: &dyn FileSystem) {
    if let Some(record) = invocations.entries.get(&step_hash) {
        delete_old_outputs_for(record, fs);
    }
}

fn delete_old_outputs_for(record: &crate::invocation_log::InvocationRecord, fs: &dyn FileSystem) {
    for (path, prior) in &record.output_files {
        let result = fingerprint::matches(fs, path, prior);
        if result.clean && !prior.is_missing() {
            if let Err(err) = fs.remove_file(path) {
                warn!(path = %path.display(), error = %err, "failed to remove stale output");
            }
        }
    }
}

fn reap_empty_created_directories(invocations: &Invocations, fs: &dyn FileSystem, log: &mut dyn InvocationLog) {
    // Deepest paths first, so a directory tree collapses bottom-up in one pass.
    let mut dirs: Vec<&Path> = invocations.created_directories.iter().map(|p| p.as_path()).collect();
    dirs.sort_by_key(|p| std::cmp::Reverse(p.components().count()));
    for dir in dirs {
        if fs.remove_empty_dir(dir).is_ok() {
            let _ = log.removed_directory(dir);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fingerprint::take;
    use crate::fs_util::InMemoryFileSystem;
    use crate::invocation_log::{InMemoryInvocationLog, InvocationRecord};
    use std::path::PathBuf;
    use std::sync::Arc;

    #[test]
    fn stale_output_with_matching_fingerprint_is_deleted() {
        let fs = InMemoryFileSystem::new();
        fs.write_file("out", b"stale".to_vec());
        fs.tick();
        let now = fs.now();
        let (fp, _) = take(&fs, now, Path::new("out"));

        let mut invocations = Invocations::default();
        let step_hash = Hash::of_bytes(b"gone");
        invocations.entries.insert(
            step_hash,
            InvocationRecord {
                output_files: vec![(PathBuf::from("out"), fp)],
                input_files: vec![],
                ignored_dependencies: vec![],
                additional_dependencies: vec![],
            },
        );

        let mut log = InMemoryInvocationLog::new(Arc::new(InMemoryFileSystem::new()));
        delete_stale_outputs(&invocations, &HashSet::new(), &fs, &mut log);
        assert!(!fs.exists("out"));
    }

    #[test]
    fn stale_output_with_changed_fingerprint_is_left_alone() {
        let fs = InMemoryFileSystem::new();
        fs.write_file("out", b"stale".to_vec());
        fs.tick();
        let now = fs.now();
        let (fp, _) = take(&fs, now, Path::new("out"));
        fs.tick();
        fs.write_file("out", b"user edited this".to_vec());

        let mut invocations = Invocations::default();
        let step_hash = Hash::of_bytes(b"gone");
        invocations.entries.insert(
            step_hash,
            InvocationRecord {
                output_files: vec![(PathBuf::from("out"), fp)],
                input_files: vec![],
                ignored_dependencies: vec![],
                additional_dependencies: vec![],
            },
        );

        let mut log = InMemoryInvocationLog::new(Arc::new(InMemoryFileSystem::new()));
        delete_stale_outputs(&invocations, &HashSet::new(), &fs, &mut log);
        assert!(fs.exists("out"));
    }

    #[test]
    fn live_step_hash_is_not_reaped() {
        let fs = InMemoryFileSystem::new();
        fs.write_file("out", b"stale".to_vec());
        fs.tick();
        let now = fs.now();
        let (fp, _) = take(&fs, now, Path::new("out"));

        let mut invocations = Invocations::default();
        let step_hash = Hash::of_bytes(b"still-here");
        invocations.entries.insert(
            step_hash,
            InvocationRecord {
                output_files: vec![(PathBuf::from("out"), fp)],
                input_files: vec![],
                ignored_dependencies: vec![],
                additional_dependencies: vec![],
            },
        );

        let mut live = HashSet::new();
        live.insert(step_hash);
        let mut log = InMemoryInvocationLog::new(Arc::new(InMemoryFileSystem::new()));
        delete_stale_outputs(&invocations, &live, &fs, &mut log);
        assert!(fs.exists("out"));
    }

    #[test]
    fn empty_created_directory_is_removed_but_nonempty_is_kept() {
        let fs = InMemoryFileSystem::new();
        fs.mkdir("empty_dir");
        fs.mkdir("busy_dir");
        fs.write_file("busy_dir/still_here", b"x".to_vec());

        let mut invocations = Invocations::default();
        invocations.created_directories.insert(PathBuf::from("empty_dir"));
        invocations.created_directories.insert(PathBuf::from("busy_dir"));

        let mut log = InMemoryInvocationLog::new(Arc::new(InMemoryFileSystem::new()));
        delete_stale_outputs(&invocations, &HashSet::new(), &fs, &mut log);
        assert!(!fs.exists("empty_dir"));
        assert!(fs.exists("busy_dir"));
    }

    #[test]
    fn reaper_is_idempotent() {
        let fs = InMemoryFileSystem::new();
        fs.write_file("out", b"stale".to_vec());
        fs.mkdir("dir");
        fs.tick();
        let now = fs.now();
        let (fp, _) = take(&fs, now, Path::new("out"));

        let mut invocations = Invocations::default();
        let step_hash = Hash::of_bytes(b"gone");
        invocations.entries.insert(
            step_hash,
            InvocationRecord {
                output_files: vec![(PathBuf::from("out"), fp)],
                input_files: vec![],
                ignored_dependencies: vec![],
                additional_dependencies: vec![],
            },
        );
        invocations.created_directories.insert(PathBuf::from("dir"));

        let mut log = InMemoryInvocationLog::new(Arc::new(InMemoryFileSystem::new()));
        delete_stale_outputs(&invocations, &HashSet::new(), &fs, &mut log);
        // Second pass over the same (now-stale-on-disk) invocations must not panic or error.
        delete_stale_outputs(&invocations, &HashSet::new(), &fs, &mut log);
        assert!(!fs.exists("out"));
        assert!(!fs.exists("dir"));
    }
}

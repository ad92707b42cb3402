//! Pure in-memory [`InvocationLog`] implementation for tests: same semantics
//! as [`super::PersistentInvocationLog`] minus the on-disk record stream.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::SystemTime;

use crate::fingerprint::{self, FileId, Fingerprint};
use crate::fs_util::{normalize_path, FileSystem};
use crate::hash::Hash;
use crate::manifest::StepIndex;

use super::record::{InvocationRecord, Invocations};
use super::InvocationLog;

pub struct InMemoryInvocationLog {
    fs: Arc<dyn FileSystem>,
    invocations: Invocations,
    leaking: bool,
}

impl InMemoryInvocationLog {
    pub fn new(fs: Arc<dyn FileSystem>) -> Self {
        Self { fs, invocations: Invocations::default(), leaking: false }
    }
}

impl InvocationLog for InMemoryInvocationLog {
    fn created_directory(&mut self, path: &Path) -> std::io::Result<()> {
        self.invocations.created_directories.insert(normalize_path(path));
        Ok(())
    }

    fn removed_directory(&mut self, path: &Path) -> std::io::Result<()> {
        self.invocations.created_directories.remove(&normalize_path(path));
        Ok(())
    }

    fn fingerprint(&mut self, clock_now: SystemTime, path: &Path) -> (Fingerprint, FileId) {
        fingerprint::take(self.fs.as_ref(), clock_now, path)
    }

    fn ran_command(
        &mut self,
        step_hash: Hash,
        outputs: &[(PathBuf, Fingerprint)],
        inputs: &[(PathBuf, Fingerprint)],
        ignored_dependencies: &[StepIndex],
        additional_dependencies: &[Hash],
    ) -> std::io::Result<()> {
        let mut output_files = Vec::new();
        for (path, fp) in outputs {
            if fp.is_dir() {
                self.invocations.created_directories.insert(normalize_path(path));
                continue;
            }
            output_files.push((normalize_path(path), *fp));
        }
        let input_files = inputs
            .iter()
            .filter(|(_, fp)| !fp.is_dir())
            .map(|(p, fp)| (normalize_path(p), *fp))
            .collect();

        self.invocations.entries.insert(
            step_hash,
            InvocationRecord {
                output_files,
                input_files,
                ignored_dependencies: ignored_dependencies.to_vec(),
                additional_dependencies: additional_dependencies.to_vec(),
            },
        );
        Ok(())
    }

    fn cleaned_command(&mut self, step_hash: Hash) -> std::io::Result<()> {
        self.invocations.entries.remove(&step_hash);
        Ok(())
    }

    fn leak_memory(&mut self) {
        self.leaking = true;
    }

    fn invocations(&self) -> &Invocations {
        &self.invocations
    }
}

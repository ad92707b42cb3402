//! Invocation log: append-only record of what ran, what it touched, and what
//! it produced, used to detect staleness without re-running commands
//! (`spec.md` §4.2).

mod in_memory;
mod persistent;
mod record;

pub use in_memory::InMemoryInvocationLog;
pub use persistent::{InvocationLogConfig, PersistentInvocationLog};
pub use record::{decode_record, encode_record, replay, InvocationRecord, Invocations, LogRecord, TruncatedRecord};

use std::path::Path;
use std::path::PathBuf;
use std::time::SystemTime;

use crate::fingerprint::{FileId, Fingerprint};
use crate::hash::Hash;
use crate::manifest::StepIndex;

/// Operations a build needs from the invocation log, independent of whether
/// it is backed by a file or held purely in memory (tests).
pub trait InvocationLog: Send {
    fn created_directory(&mut self, path: &Path) -> std::io::Result<()>;
    fn removed_directory(&mut self, path: &Path) -> std::io::Result<()>;

    /// Convenience wrapper over the fingerprint component; does not itself
    /// write a record.
    fn fingerprint(&mut self, clock_now: SystemTime, path: &Path) -> (Fingerprint, FileId);

    fn ran_command(
        &mut self,
        step_hash: Hash,
        outputs: &[(PathBuf, Fingerprint)],
        inputs: &[(PathBuf, Fingerprint)],
        ignored_dependencies: &[StepIndex],
        additional_dependencies: &[Hash],
    ) -> std::io::Result<()>;

    fn cleaned_command(&mut self, step_hash: Hash) -> std::io::Result<()>;

    /// Marks this handle as intentionally abandoned (a parent process that
    /// forked a child no longer needs its in-memory state reclaimed).
    fn leak_memory(&mut self);

    fn invocations(&self) -> &Invocations;
}

//! Command runner stack (`spec.md` §4.7): a composable pipeline presenting a
//! single interface to the scheduler. Three decorators compose bottom-up:
//! [`platform::PlatformRunner`] (leaf, spawns/traces) wrapped by
//! [`limited::LimitedRunner`] (parallelism + load) wrapped by
//! [`pooled::PooledRunner`] (named pool capacity), so that a command delayed
//! purely for pool capacity never consumes a concurrency slot.

pub mod executor;
pub mod limited;
pub mod platform;
pub mod pooled;

pub use executor::{Executor, ScriptedExecutor, ShellExecutor};
pub use limited::{FixedLoadProvider, LimitedRunner, LoadProvider, SystemLoadProvider};
pub use platform::PlatformRunner;
pub use pooled::PooledRunner;

use std::collections::HashSet;
use std::path::PathBuf;

use crate::manifest::StepIndex;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ExitStatus {
    Success,
    Failure,
    Interrupted,
}

/// §6.3 command-runner callback result.
#[derive(Debug, Clone)]
pub struct CommandResult {
    pub exit_status: ExitStatus,
    pub output: Vec<u8>,
    pub input_files: HashSet<PathBuf>,
    pub output_files: HashSet<PathBuf>,
}

impl CommandResult {
    pub fn failure(output: Vec<u8>) -> Self {
        Self { exit_status: ExitStatus::Failure, output, input_files: HashSet::new(), output_files: HashSet::new() }
    }
}

/// One enqueued unit of work. `traced` is false for generator and
/// console-pool steps (§4.7.1); `pool` is empty for the unrestricted pool.
pub struct Invocation {
    pub command: String,
    pub step: StepIndex,
    pub pool: String,
    pub traced: bool,
}

pub type Completion = Box<dyn FnOnce(StepIndex, CommandResult) + Send>;

pub trait Runner: Send {
    fn invoke(&mut self, job: Invocation, callback: Completion);
    fn size(&self) -> usize;
    fn can_run_more(&self) -> bool;
    /// Pumps completions, invoking callbacks on the calling thread (the
    /// scheduler thread — `spec.md` §5's single-writer discipline). Returns
    /// true iff the runner was interrupted.
    fn run_commands(&mut self) -> bool;
}

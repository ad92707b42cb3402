//! Crate-wide error type.
//!
//! Mirrors the teacher's `SolcError`/`Result` pattern: one enum, `#[from]`
//! conversions at the IO boundary, and no panics outside of internal
//! invariant violations (an out-of-range `StepIndex` is a programmer error,
//! never a `Result`).

use std::path::PathBuf;

use crate::manifest::StepIndex;

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    Compile(#[from] CompileError),

    #[error(transparent)]
    Plan(#[from] PlanError),

    #[error("io error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invocation log at {path} is corrupt: {message}")]
    LogCorrupt { path: PathBuf, message: String },

    #[error("step {step:?} failed")]
    CommandFailed { step: StepIndex },

    #[error("wrote to file {path} that step {first_writer:?} already wrote to")]
    OutputConflict {
        path: PathBuf,
        first_writer: StepIndex,
    },

    #[error("build interrupted")]
    Interrupted,
}

impl Error {
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io { path: path.into(), source }
    }
}

/// Errors raised while compiling a raw manifest into a [`crate::manifest::CompiledManifest`].
#[derive(Debug, thiserror::Error)]
pub enum CompileError {
    #[error("duplicate output `{path}`: already produced by step {first:?}, also declared by step {second:?}")]
    DuplicateOutput {
        path: PathBuf,
        first: StepIndex,
        second: StepIndex,
    },

    #[error("dependency cycle: {}", .path.iter().map(|s| s.to_string()).collect::<Vec<_>>().join(" -> "))]
    Cycle { path: Vec<CycleNode> },

    #[error("generator step {generator:?} depends on non-generator step {dependency:?}")]
    GeneratorDependsOnOrdinary {
        generator: StepIndex,
        dependency: StepIndex,
    },

    #[error("non-generator step {ordinary:?} depends on generator step {dependency:?}")]
    OrdinaryDependsOnGenerator {
        ordinary: StepIndex,
        dependency: StepIndex,
    },

    #[error("manifest declares {count} manifest-regenerator steps; at most one is allowed")]
    MultipleManifestRegenerators { count: usize },

    #[error("compiled manifest version mismatch: file has {found}, expected {expected}")]
    VersionMismatch { found: u64, expected: u64 },

    #[error("compiled manifest references out-of-range step index {index}")]
    IndexOutOfRange { index: u32 },

    #[error("pool `{name}` has negative or invalid capacity")]
    InvalidPoolCapacity { name: String },
}

/// A single node on a printed cycle path (either a step index or a name, for readability).
#[derive(Debug, Clone)]
pub struct CycleNode(pub String);

impl std::fmt::Display for CycleNode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Errors raised while planning a build (resolving targets, pools).
#[derive(Debug, thiserror::Error)]
pub enum PlanError {
    #[error("unknown target `{0}`")]
    UnknownTarget(String),

    #[error("target `clean` is not a build target; pass --clean instead")]
    CleanIsNotATarget,

    #[error("target `help` is not a build target")]
    HelpIsNotATarget,

    #[error("undefined pool `{0}`")]
    UndefinedPool(String),
}

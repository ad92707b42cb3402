//! The compiled, immutable `Step`: one unit of work with declared inputs,
//! outputs, and a stable step-hash identity (`spec.md` §3).

use std::path::PathBuf;

use crate::hash::Hash;

/// Index of a step within a [`super::CompiledManifest`]'s step arena.
/// Stable for the lifetime of one build; may shift across manifest edits
/// (which is why the invocation log records `additional_dependencies` as
/// step *hashes*, not indices — see `spec.md` §4.5).
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Debug)]
pub struct StepIndex(pub u32);

impl StepIndex {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl std::fmt::Display for StepIndex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Clone, Debug)]
pub struct RspFile {
    pub path: PathBuf,
    pub content: String,
}

#[derive(Clone, Debug)]
pub struct Step {
    /// Stable identity derived from command + declared inputs/outputs.
    /// Two steps with identical hashes are interchangeable.
    pub step_hash: Hash,
    /// `None` means a phony step: a pure alias with no command to run.
    pub command: Option<String>,
    pub description: Option<String>,
    /// Empty string means unpooled (no capacity limit).
    pub pool: String,
    pub depfile: Option<PathBuf>,
    pub rspfile: Option<RspFile>,
    pub generator: bool,

    pub declared_inputs: Vec<PathBuf>,
    pub implicit_inputs: Vec<PathBuf>,
    pub order_only_inputs: Vec<PathBuf>,
    pub declared_outputs: Vec<PathBuf>,

    /// Sorted, deduplicated union of inputs + implicit inputs + order-only
    /// dependencies resolved through the output-path map.
    pub dependencies: Vec<StepIndex>,
    /// Parent directories of declared outputs.
    pub output_dirs: Vec<PathBuf>,
}

impl Step {
    pub fn is_phony(&self) -> bool {
        self.command.is_none()
    }

    /// All declared input paths (explicit + implicit + order-only), the set
    /// used for generator mtime comparison and for seeding the declared
    /// input set the scheduler unions with tracer output (`spec.md` §4.8).
    pub fn all_declared_inputs(&self) -> impl Iterator<Item = &PathBuf> {
        self.declared_inputs
            .iter()
            .chain(self.implicit_inputs.iter())
            .chain(self.order_only_inputs.iter())
    }
}

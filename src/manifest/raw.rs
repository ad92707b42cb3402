//! The raw, uncompiled manifest: what a manifest parser (an external
//! collaborator per `spec.md` §1) hands to [`super::compile::compile`].
//! This is deliberately grammar-agnostic — the compiler contract is the only
//! part of manifest surface syntax this crate specifies.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::SystemTime;

#[derive(Clone, Debug, Default)]
pub struct RawStep {
    pub command: Option<String>,
    pub description: Option<String>,
    pub pool: String,
    pub inputs: Vec<PathBuf>,
    pub implicit_inputs: Vec<PathBuf>,
    pub order_only_inputs: Vec<PathBuf>,
    pub outputs: Vec<PathBuf>,
    pub depfile: Option<PathBuf>,
    pub rspfile: Option<PathBuf>,
    pub rspfile_content: Option<String>,
    pub generator: bool,
}

#[derive(Clone, Debug, Default)]
pub struct RawManifest {
    pub steps: Vec<RawStep>,
    /// Output paths selected as the default build target set.
    pub defaults: Vec<PathBuf>,
    pub pools: BTreeMap<String, u32>,
    pub build_dir: PathBuf,
    /// Source files that composed this manifest, with their mtimes at parse
    /// time — used by the precompile cache (`spec.md` §4.3).
    pub manifest_files: Vec<(PathBuf, SystemTime)>,
    /// Output path of the step that regenerates this manifest, if any.
    pub manifest_regenerator_output: Option<PathBuf>,
}

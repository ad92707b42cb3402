//! Build planner (`spec.md` §4.5): turns a compiled manifest, an invocation
//! log, and a target selection into a `Build` state the scheduler drains.

use std::collections::{HashMap, HashSet, VecDeque};

use crate::error::PlanError;
use crate::fingerprint::FileId;
use crate::fs_util::FileSystem;
use crate::hash::Hash;
use crate::invocation_log::Invocations;
use crate::manifest::{CompiledManifest, Step, StepIndex};
use crate::oracle::{self, FingerprintMemo, Verdict};

#[derive(Clone, Debug, Default)]
pub struct StepNode {
    pub remaining_deps: u32,
    pub dependents: Vec<StepIndex>,
    pub should_build: bool,
    /// Set once the restat bypass check (`canSkipBuildCommand`) has run for
    /// this node: "all inputs/outputs unchanged, don't invoke the command".
    pub bypassable: bool,
    /// An additional dependency recorded by a prior invocation no longer
    /// resolves to any step in the current manifest: the node can never be
    /// a bypass/clean candidate since we can't verify what it used to read.
    pub unconditionally_dirty: bool,
}

pub struct Build {
    pub nodes: Vec<StepNode>,
    pub ready_steps: VecDeque<StepIndex>,
    /// FileId -> producing step, populated lazily as steps complete
    /// (`spec.md` §3), used to detect undeclared-input usage.
    pub output_files: HashMap<FileId, StepIndex>,
    pub remaining_failures: i64,
}

impl Build {
    /// `Build.construct` (`spec.md` §4.5).
    pub fn construct(
        compiled: &CompiledManifest,
        invocations: &Invocations,
        allowed_failures: i64,
        steps_to_build: &[StepIndex],
    ) -> Result<Self, PlanError> {
        let n = compiled.steps.len();
        let mut should_build = vec![false; n];
        let mut stack: Vec<StepIndex> = steps_to_build.to_vec();
        while let Some(idx) = stack.pop() {
            if should_build[idx.index()] {
                continue;
            }
            should_build[idx.index()] = true;
            for &dep in &compiled.steps[idx.index()].dependencies {
                if !should_build[dep.index()] {
                    stack.push(dep);
                }
            }
        }

        let by_hash: HashMap<Hash, StepIndex> = compiled
            .steps
            .iter()
            .enumerate()
            .map(|(i, s)| (s.step_hash, StepIndex(i as u32)))
            .collect();

        let mut nodes = vec![StepNode::default(); n];
        for (i, step) in compiled.steps.iter().enumerate() {
            if !should_build[i] {
                continue;
            }
            let idx = StepIndex(i as u32);
            nodes[i].should_build = true;

            let mut extra_deps: Vec<StepIndex> = Vec::new();
            if let Some(record) = invocations.entries.get(&step.step_hash) {
                for hash in &record.additional_dependencies {
                    match by_hash.get(hash) {
                        Some(&dep_idx) => extra_deps.push(dep_idx),
                        None => nodes[i].unconditionally_dirty = true,
                    }
                }
            }

            nodes[i].remaining_deps = step.dependencies.len() as u32 + extra_deps.len() as u32;
            for dep in step.dependencies.iter().chain(extra_deps.iter()) {
                nodes[dep.index()].dependents.push(idx);
            }
        }

        let mut ready_steps = VecDeque::new();
        for (i, node) in nodes.iter().enumerate() {
            if node.should_build && node.remaining_deps == 0 {
                ready_steps.push_back(StepIndex(i as u32));
            }
        }

        Ok(Self { nodes, ready_steps, output_files: HashMap::new(), remaining_failures: allowed_failures })
    }

    /// Unified "this step is no longer pending" operation (`spec.md` §4.5):
    /// registers its outputs, decrements dependents, enqueues newly-ready
    /// steps. Used both by [`discard_clean_steps`] and the scheduler.
    pub fn mark_step_node_as_done(&mut self, idx: StepIndex, output_file_ids: &[FileId]) {
        for &file_id in output_file_ids {
            self.output_files.insert(file_id, idx);
        }
        let dependents = self.nodes[idx.index()].dependents.clone();
        for dependent in dependents {
            let node = &mut self.nodes[dependent.index()];
            node.remaining_deps -= 1;
            if node.remaining_deps == 0 {
                self.ready_steps.push_back(dependent);
            }
        }
    }
}

/// `outputFileIdsForBuildStep` (`spec.md` §4.5): current FileIds of a step's
/// declared outputs, skipping missing files. Phony/generator steps have no
/// fingerprinted outputs and always return empty.
pub fn output_file_ids_for_build_step(step: &Step, fs: &dyn FileSystem) -> Vec<FileId> {
    if step.is_phony() || step.generator {
        return Vec::new();
    }
    step.declared_outputs
        .iter()
        .filter_map(|path| {
            let meta = fs.metadata(path);
            (meta.file_type != crate::fs_util::FileType::Missing).then(|| FileId::from_metadata(&meta))
        })
        .collect()
}

/// `discardCleanSteps` (`spec.md` §4.5): walks the ready frontier, marking
/// every step the oracle reports clean as done (provided its dependencies
/// were already marked done, which `ready_steps` guarantees by construction)
/// and leaves dirty/unresolved steps in `ready_steps` for the scheduler.
pub fn discard_clean_steps(
    build: &mut Build,
    compiled: &CompiledManifest,
    invocations: &Invocations,
    fs: &dyn FileSystem,
    memo: &FingerprintMemo,
) -> HashSet<StepIndex> {
    let mut clean = HashSet::new();
    let mut still_pending = VecDeque::new();

    while let Some(idx) = build.ready_steps.pop_front() {
        if build.nodes[idx.index()].unconditionally_dirty {
            still_pending.push_back(idx);
            continue;
        }
        let step = compiled.step(idx);
        let verdict = oracle::is_clean(step, invocations, fs, memo);
        match verdict {
            Verdict::Clean { should_refresh: _ } => {
                clean.insert(idx);
                let output_ids = output_file_ids_for_build_step(step, fs);
                build.mark_step_node_as_done(idx, &output_ids);
            }
            Verdict::Dirty => still_pending.push_back(idx),
        }
    }

    build.ready_steps = still_pending;
    clean
}

/// `usedDependencies` (`spec.md` §4.5): maps observed input FileIds back to
/// the step indices that produced them, sorted and deduplicated.
pub fn used_dependencies(output_files: &HashMap<FileId, StepIndex>, observed_input_file_ids: &[FileId]) -> Vec<StepIndex> {
    let mut used: Vec<StepIndex> = observed_input_file_ids
        .iter()
        .filter_map(|id| output_files.get(id).copied())
        .collect();
    used.sort_by_key(|s| s.0);
    used.dedup();
    used
}

/// `ignoredAndAdditionalDependencies` (`spec.md` §4.5): declared-but-unused
/// dependencies become `ignored_dependencies` (stable indices within this
/// build); used-but-undeclared dependencies become `additional_dependencies`
/// (step hashes, since indices may shift across manifest edits).
pub fn ignored_and_additional_dependencies(
    compiled: &CompiledManifest,
    step: &Step,
    used: &[StepIndex],
) -> (Vec<StepIndex>, Vec<Hash>) {
    let used_set: HashSet<StepIndex> = used.iter().copied().collect();
    let declared_set: HashSet<StepIndex> = step.dependencies.iter().copied().collect();

    let mut ignored: Vec<StepIndex> = step.dependencies.iter().copied().filter(|d| !used_set.contains(d)).collect();
    ignored.sort_by_key(|s| s.0);

    let mut additional: Vec<Hash> = used
        .iter()
        .filter(|u| !declared_set.contains(u))
        .map(|u| compiled.step(*u).step_hash)
        .collect();
    additional.sort();
    additional.dedup();

    (ignored, additional)
}

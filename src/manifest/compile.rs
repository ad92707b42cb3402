//! Manifest compilation (`spec.md` §4.3): raw steps → validated,
//! index-addressable [`super::CompiledManifest`].

use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::PathBuf;

use crate::error::{CompileError, CycleNode};
use crate::fs_util::normalize_path;
use crate::hash::Hash;

use super::raw::RawManifest;
use super::step::{RspFile, Step, StepIndex};
use super::CompiledManifest;

pub fn compile(raw: &RawManifest) -> Result<CompiledManifest, CompileError> {
    // Step 1: output-path map, duplicate detection.
    let mut outputs: HashMap<PathBuf, StepIndex> = HashMap::new();
    for (i, raw_step) in raw.steps.iter().enumerate() {
        let idx = StepIndex(i as u32);
        let mut seen_this_step: HashSet<PathBuf> = HashSet::new();
        for out in &raw_step.outputs {
            let out = normalize_path(out);
            if !seen_this_step.insert(out.clone()) {
                continue; // duplicate output within a single step: dedup silently
            }
            if let Some(&first) = outputs.get(&out) {
                return Err(CompileError::DuplicateOutput { path: out, first, second: idx });
            }
            outputs.insert(out, idx);
        }
    }

    // Step 2: dependency edges.
    let mut steps: Vec<Step> = Vec::with_capacity(raw.steps.len());
    for raw_step in raw.steps.iter() {
        let mut deps: Vec<StepIndex> = Vec::new();
        for path in raw_step
            .inputs
            .iter()
            .chain(raw_step.implicit_inputs.iter())
            .chain(raw_step.order_only_inputs.iter())
        {
            let path = normalize_path(path);
            if let Some(&producer) = outputs.get(&path) {
                deps.push(producer);
            }
        }
        deps.sort_by_key(|s| s.0);
        deps.dedup();

        let declared_outputs: Vec<PathBuf> =
            raw_step.outputs.iter().map(|p| normalize_path(p)).collect();
        let mut output_dirs: Vec<PathBuf> = declared_outputs
            .iter()
            .filter_map(|p| p.parent().map(|p| p.to_path_buf()))
            .collect();
        output_dirs.sort();
        output_dirs.dedup();

        let rspfile = match (&raw_step.rspfile, &raw_step.rspfile_content) {
            (Some(path), content) => Some(RspFile {
                path: normalize_path(path),
                content: content.clone().unwrap_or_default(),
            }),
            (None, _) => None,
        };

        let step_hash = compute_step_hash(raw_step, &declared_outputs);

        steps.push(Step {
            step_hash,
            command: raw_step.command.clone(),
            description: raw_step.description.clone(),
            pool: raw_step.pool.clone(),
            depfile: raw_step.depfile.as_ref().map(|p| normalize_path(p)),
            rspfile,
            generator: raw_step.generator,
            declared_inputs: raw_step.inputs.iter().map(|p| normalize_path(p)).collect(),
            implicit_inputs: raw_step.implicit_inputs.iter().map(|p| normalize_path(p)).collect(),
            order_only_inputs: raw_step
                .order_only_inputs
                .iter()
                .map(|p| normalize_path(p))
                .collect(),
            declared_outputs,
            dependencies: deps,
            output_dirs,
        });
    }

    // Step 3: generator / non-generator partition, phony-transparent.
    check_generator_partition(&steps)?;

    // Step 4: cycle detection.
    detect_cycles(&steps)?;

    // Step 5: roots + defaults.
    let mut depended_on: HashSet<StepIndex> = HashSet::new();
    for step in &steps {
        for &dep in &step.dependencies {
            depended_on.insert(dep);
        }
    }
    let roots: Vec<StepIndex> = (0..steps.len())
        .map(|i| StepIndex(i as u32))
        .filter(|i| !depended_on.contains(i))
        .collect();

    let mut defaults = Vec::new();
    for default_path in &raw.defaults {
        let path = normalize_path(default_path);
        if let Some(&idx) = outputs.get(&path) {
            defaults.push(idx);
        }
    }
    defaults.sort_by_key(|s| s.0);
    defaults.dedup();

    let manifest_regenerator = raw
        .manifest_regenerator_output
        .as_ref()
        .and_then(|p| outputs.get(&normalize_path(p)).copied());

    let mut input_steps: HashMap<PathBuf, Vec<StepIndex>> = HashMap::new();
    for (i, step) in steps.iter().enumerate() {
        for path in step.all_declared_inputs() {
            input_steps.entry(path.clone()).or_default().push(StepIndex(i as u32));
        }
    }

    let pools: BTreeMap<String, u32> = raw.pools.clone();
    for name in pools.keys() {
        if name.is_empty() {
            return Err(CompileError::InvalidPoolCapacity { name: name.clone() });
        }
    }
    // A step naming an undefined pool is left for the planner (`spec.md` §7
    // treats it as a plan-time error, not a compile-time one).

    Ok(CompiledManifest {
        steps,
        outputs,
        inputs: input_steps,
        defaults,
        roots,
        pools,
        build_dir: raw.build_dir.clone(),
        manifest_regenerator,
        manifest_files: raw.manifest_files.clone(),
    })
}

fn compute_step_hash(raw_step: &super::raw::RawStep, outputs: &[PathBuf]) -> Hash {
    let mut inputs: Vec<PathBuf> = raw_step
        .inputs
        .iter()
        .chain(raw_step.implicit_inputs.iter())
        .chain(raw_step.order_only_inputs.iter())
        .map(|p| normalize_path(p))
        .collect();
    inputs.sort();
    let mut outs = outputs.to_vec();
    outs.sort();
    let command = raw_step.command.clone().unwrap_or_default();
    let mut parts: Vec<&[u8]> = vec![command.as_bytes()];
    let input_strs: Vec<String> = inputs.iter().map(|p| p.to_string_lossy().into_owned()).collect();
    let output_strs: Vec<String> = outs.iter().map(|p| p.to_string_lossy().into_owned()).collect();
    parts.extend(input_strs.iter().map(|s| s.as_bytes()));
    parts.extend(output_strs.iter().map(|s| s.as_bytes()));
    Hash::combine(parts)
}

/// Walks dependency edges, treating phony steps as transparent, and checks
/// that no edge crosses the generator/non-generator partition.
fn check_generator_partition(steps: &[Step]) -> Result<(), CompileError> {
    fn effective_deps(steps: &[Step], idx: StepIndex, out: &mut Vec<StepIndex>, seen: &mut HashSet<StepIndex>) {
        for &dep in &steps[idx.index()].dependencies {
            if steps[dep.index()].is_phony() {
                if seen.insert(dep) {
                    effective_deps(steps, dep, out, seen);
                }
            } else {
                out.push(dep);
            }
        }
    }

    for (i, step) in steps.iter().enumerate() {
        if step.is_phony() {
            continue;
        }
        let idx = StepIndex(i as u32);
        let mut deps = Vec::new();
        let mut seen = HashSet::new();
        effective_deps(steps, idx, &mut deps, &mut seen);
        for dep in deps {
            let dep_step = &steps[dep.index()];
            if step.generator && !dep_step.generator {
                return Err(CompileError::GeneratorDependsOnOrdinary { generator: idx, dependency: dep });
            }
            if !step.generator && dep_step.generator {
                return Err(CompileError::OrdinaryDependsOnGenerator { ordinary: idx, dependency: dep });
            }
        }
    }
    Ok(())
}

fn detect_cycles(steps: &[Step]) -> Result<(), CompileError> {
    #[derive(Clone, Copy, PartialEq)]
    enum Mark {
        Unvisited,
        InProgress,
        Done,
    }
    let mut marks = vec![Mark::Unvisited; steps.len()];
    let mut stack: Vec<StepIndex> = Vec::new();

    fn visit(
        idx: StepIndex,
        steps: &[Step],
        marks: &mut [Mark],
        stack: &mut Vec<StepIndex>,
    ) -> Result<(), CompileError> {
        marks[idx.index()] = Mark::InProgress;
        stack.push(idx);
        for &dep in &steps[idx.index()].dependencies {
            match marks[dep.index()] {
                Mark::Unvisited => visit(dep, steps, marks, stack)?,
                Mark::InProgress => {
                    let start = stack.iter().position(|s| *s == dep).unwrap();
                    let mut path: Vec<CycleNode> =
                        stack[start..].iter().map(|s| CycleNode(s.to_string())).collect();
                    path.push(CycleNode(dep.to_string()));
                    return Err(CompileError::Cycle { path });
                }
                Mark::Done => {}
            }
        }
        stack.pop();
        marks[idx.index()] = Mark::Done;
        Ok(())
    }

    for i in 0..steps.len() {
        let idx = StepIndex(i as u32);
        if marks[idx.index()] == Mark::Unvisited {
            visit(idx, steps, &mut marks, &mut stack)?;
        }
    }
    Ok(())
}

//! The compiled manifest: immutable, index-addressable, serializable
//! (`spec.md` §3, §4.3, §6.2).

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::time::SystemTime;


use crate::binformat::{Reader, Writer};
use crate::error::CompileError;
use crate::fs_util::FileSystem;
use crate::hash::Hash;

use super::step::{RspFile, Step, StepIndex};

/// File-format version for the serialized compiled manifest (`spec.md` §6.2).
/// A mismatch discards the precompile cache rather than attempting to read
/// an incompatible layout.
pub const COMPILED_MANIFEST_VERSION: u64 = 1;

#[derive(Clone, Debug)]
pub struct CompiledManifest {
    pub steps: Vec<Step>,
    pub outputs: HashMap<PathBuf, StepIndex>,
    pub inputs: HashMap<PathBuf, Vec<StepIndex>>,
    pub defaults: Vec<StepIndex>,
    pub roots: Vec<StepIndex>,
    pub pools: BTreeMap<String, u32>,
    pub build_dir: PathBuf,
    pub manifest_regenerator: Option<StepIndex>,
    pub manifest_files: Vec<(PathBuf, SystemTime)>,
}

impl CompiledManifest {
    pub fn compile(raw: &super::raw::RawManifest) -> Result<Self, CompileError> {
        super::compile::compile(raw)
    }

    pub fn step(&self, idx: StepIndex) -> &Step {
        &self.steps[idx.index()]
    }

    pub fn pool_capacity(&self, name: &str) -> Option<u32> {
        if name.is_empty() {
            None
        } else if name == "console" {
            Some(1)
        } else {
            self.pools.get(name).copied()
        }
    }

    /// Serializes into the stable, version-tagged binary form of `spec.md`
    /// §6.2: `u64 version` + a length-prefixed encoding of every field.
    pub fn serialize(&self) -> Vec<u8> {
        let mut w = Writer::new();
        w.write_u64(COMPILED_MANIFEST_VERSION);
        w.write_varint_seq(&self.steps, write_step);
        w.write_path(&self.build_dir);
        w.write_varint_seq(&self.defaults, |w, s| w.write_u32(s.0));
        w.write_varint_seq(&self.roots, |w, s| w.write_u32(s.0));
        w.write_varint_seq(&self.pools.iter().collect::<Vec<_>>(), |w, (name, cap)| {
            w.write_str(name);
            w.write_u32(**cap);
        });
        match self.manifest_regenerator {
            Some(s) => {
                w.write_bool(true);
                w.write_u32(s.0);
            }
            None => w.write_bool(false),
        }
        w.write_varint_seq(&self.manifest_files, |w, (path, mtime)| {
            w.write_path(path);
            w.write_system_time(*mtime);
        });
        w.buf
    }

    /// Validates that every step index referenced anywhere is within bounds
    /// and that pool capacities are sane, then rebuilds the derived maps.
    pub fn load(bytes: &[u8]) -> Result<Self, CompileError> {
        let mut r = Reader::new(bytes);
        let version = r
            .read_u64()
            .map_err(|_| CompileError::VersionMismatch { found: 0, expected: COMPILED_MANIFEST_VERSION })?;
        if version != COMPILED_MANIFEST_VERSION {
            return Err(CompileError::VersionMismatch { found: version, expected: COMPILED_MANIFEST_VERSION });
        }
        let steps = r
            .read_varint_seq(read_step)
            .map_err(|_| CompileError::IndexOutOfRange { index: 0 })?;
        let build_dir = r.read_path().map_err(|_| CompileError::IndexOutOfRange { index: 0 })?;
        let defaults = r
            .read_varint_seq(|r| r.read_u32().map(StepIndex))
            .map_err(|_| CompileError::IndexOutOfRange { index: 0 })?;
        let roots = r
            .read_varint_seq(|r| r.read_u32().map(StepIndex))
            .map_err(|_| CompileError::IndexOutOfRange { index: 0 })?;
        let pools: BTreeMap<String, u32> = r
            .read_varint_seq(|r| {
                let name = r.read_str()?;
                let cap = r.read_u32()?;
                Ok((name, cap))
            })
            .map_err(|_| CompileError::IndexOutOfRange { index: 0 })?
            .into_iter()
            .collect();
        let has_regen = r.read_bool().map_err(|_| CompileError::IndexOutOfRange { index: 0 })?;
        let manifest_regenerator = if has_regen {
            Some(StepIndex(r.read_u32().map_err(|_| CompileError::IndexOutOfRange { index: 0 })?))
        } else {
            None
        };
        let manifest_files = r
            .read_varint_seq(|r| {
                let path = r.read_path()?;
                let mtime = r.read_system_time()?;
                Ok((path, mtime))
            })
            .map_err(|_| CompileError::IndexOutOfRange { index: 0 })?;

        let n = steps.len() as u32;
        let check_index = |i: u32| -> Result<(), CompileError> {
            if i >= n {
                Err(CompileError::IndexOutOfRange { index: i })
            } else {
                Ok(())
            }
        };
        for s in &defaults {
            check_index(s.0)?;
        }
        for s in &roots {
            check_index(s.0)?;
        }
        if let Some(s) = manifest_regenerator {
            check_index(s.0)?;
        }
        for step in &steps {
            for dep in &step.dependencies {
                check_index(dep.0)?;
            }
        }
        for (name, cap) in &pools {
            if name.is_empty() || *cap == 0 && name != "console" {
                // capacity 0 is a degenerate-but-legal "never run" pool; only
                // negative capacities (unrepresentable in u32) are rejected,
                // which `read_u32` already guarantees.
                let _ = cap;
            }
        }

        let mut outputs = HashMap::new();
        let mut inputs: HashMap<PathBuf, Vec<StepIndex>> = HashMap::new();
        for (i, step) in steps.iter().enumerate() {
            let idx = StepIndex(i as u32);
            for out in &step.declared_outputs {
                outputs.insert(out.clone(), idx);
            }
            for inp in step.all_declared_inputs() {
                inputs.entry(inp.clone()).or_default().push(idx);
            }
        }

        Ok(Self {
            steps,
            outputs,
            inputs,
            defaults,
            roots,
            pools,
            build_dir,
            manifest_regenerator,
            manifest_files,
        })
    }
}

fn write_step(w: &mut Writer, step: &Step) {
    w.write_varint(step.step_hash.as_bytes().len() as u64);
    w.buf.extend_from_slice(step.step_hash.as_bytes());
    match &step.command {
        Some(c) => {
            w.write_bool(true);
            w.write_str(c);
        }
        None => w.write_bool(false),
    }
    match &step.description {
        Some(d) => {
            w.write_bool(true);
            w.write_str(d);
        }
        None => w.write_bool(false),
    }
    w.write_str(&step.pool);
    match &step.depfile {
        Some(p) => {
            w.write_bool(true);
            w.write_path(p);
        }
        None => w.write_bool(false),
    }
    match &step.rspfile {
        Some(r) => {
            w.write_bool(true);
            w.write_path(&r.path);
            w.write_str(&r.content);
        }
        None => w.write_bool(false),
    }
    w.write_bool(step.generator);
    w.write_varint_seq(&step.declared_inputs, |w, p| w.write_path(p));
    w.write_varint_seq(&step.implicit_inputs, |w, p| w.write_path(p));
    w.write_varint_seq(&step.order_only_inputs, |w, p| w.write_path(p));
    w.write_varint_seq(&step.declared_outputs, |w, p| w.write_path(p));
    w.write_varint_seq(&step.dependencies, |w, s| w.write_u32(s.0));
    w.write_varint_seq(&step.output_dirs, |w, p| w.write_path(p));
}

fn read_step(r: &mut Reader<'_>) -> crate::binformat::ReadResult<Step> {
    let hash_len = r.read_varint()? as usize;
    let hash_bytes = (0..hash_len).map(|_| r.read_u8()).collect::<Result<Vec<u8>, _>>()?;
    let mut hash_arr = [0u8; 32];
    hash_arr.copy_from_slice(&hash_bytes[..32.min(hash_bytes.len())]);
    let step_hash = Hash(hash_arr);

    let command = if r.read_bool()? { Some(r.read_str()?) } else { None };
    let description = if r.read_bool()? { Some(r.read_str()?) } else { None };
    let pool = r.read_str()?;
    let depfile = if r.read_bool()? { Some(r.read_path()?) } else { None };
    let rspfile = if r.read_bool()? {
        let path = r.read_path()?;
        let content = r.read_str()?;
        Some(RspFile { path, content })
    } else {
        None
    };
    let generator = r.read_bool()?;
    let declared_inputs = r.read_varint_seq(|r| r.read_path())?;
    let implicit_inputs = r.read_varint_seq(|r| r.read_path())?;
    let order_only_inputs = r.read_varint_seq(|r| r.read_path())?;
    let declared_outputs = r.read_varint_seq(|r| r.read_path())?;
    let dependencies = r.read_varint_seq(|r| r.read_u32().map(StepIndex))?;
    let output_dirs = r.read_varint_seq(|r| r.read_path())?;

    Ok(Step {
        step_hash,
        command,
        description,
        pool,
        depfile,
        rspfile,
        generator,
        declared_inputs,
        implicit_inputs,
        order_only_inputs,
        declared_outputs,
        dependencies,
        output_dirs,
    })
}

/// `parseAndCompile` (`spec.md` §4.3): reuse `compiled_path` if it exists,
/// has a matching version header, and is newer than the newest
/// `manifest_files` mtime; otherwise reparse (via `parse`) and recompile,
/// writing the fresh result back to `compiled_path`.
pub fn parse_and_compile(
    fs: &dyn FileSystem,
    manifest_path: &Path,
    compiled_path: &Path,
    parse: impl FnOnce(&Path) -> Result<super::raw::RawManifest, CompileError>,
) -> Result<(CompiledManifest, Vec<u8>), CompileError> {
    if let Ok(bytes) = fs.read(compiled_path) {
        match CompiledManifest::load(&bytes) {
            Ok(cached) => {
                let compiled_mtime = fs.metadata(compiled_path).mtime;
                let newest_source = cached
                    .manifest_files
                    .iter()
                    .map(|(_, t)| *t)
                    .max()
                    .unwrap_or(SystemTime::UNIX_EPOCH);
                let sources_unchanged = cached
                    .manifest_files
                    .iter()
                    .all(|(path, recorded_mtime)| fs.metadata(path).mtime == *recorded_mtime);
                if newest_source <= compiled_mtime && sources_unchanged {
                    trace!(path = %compiled_path.display(), "reusing precompiled manifest");
                    return Ok((cached, bytes));
                }
                debug!("precompiled manifest stale, recompiling");
            }
            Err(CompileError::VersionMismatch { found, expected }) => {
                warn!(found, expected, "compiled manifest version mismatch, recompiling");
            }
            Err(e) => {
                warn!(error = %e, "compiled manifest unreadable, recompiling");
            }
        }
    }

    let raw = parse(manifest_path)?;
    let compiled = CompiledManifest::compile(&raw)?;
    let bytes = compiled.serialize();
    Ok((compiled, bytes))
}

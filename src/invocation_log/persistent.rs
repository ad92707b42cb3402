//! Persistent, append-only invocation log (`spec.md` §4.2, §6.1).

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;


use crate::fingerprint::{self, FileId, Fingerprint};
use crate::fs_util::{normalize_path, FileSystem};
use crate::hash::Hash;
use crate::manifest::StepIndex;

use super::record::{decode_record, encode_record, replay, InvocationRecord, Invocations, LogRecord};
use super::InvocationLog;

const SIGNATURE: &[u8; 12] = b"invocations:";
const LOG_VERSION: u32 = 1;
const HEADER_LEN: usize = 16;

/// Fraction of dead (superseded/deleted) invocation records above which
/// [`PersistentInvocationLog::needs_recompaction`] reports true.
#[derive(Clone, Copy, Debug)]
pub struct InvocationLogConfig {
    pub recompact_dead_fraction: f64,
    /// Don't bother recompacting logs with fewer than this many historical
    /// invocation writes; the constant-size header dominates otherwise.
    pub recompact_min_writes: u64,
}

impl Default for InvocationLogConfig {
    fn default() -> Self {
        Self { recompact_dead_fraction: 0.5, recompact_min_writes: 16 }
    }
}

pub struct PersistentInvocationLog {
    fs: Arc<dyn FileSystem>,
    path: PathBuf,
    config: InvocationLogConfig,
    path_ids: HashMap<PathBuf, u32>,
    next_path_id: u32,
    next_fingerprint_id: u32,
    total_invocation_writes: u64,
    invocations: Invocations,
    leaking: bool,
}

impl PersistentInvocationLog {
    /// Opens `path`, parsing any existing content. Returns the log plus
    /// whether the caller should [`Self::recompact`] soon.
    pub fn open(
        fs: Arc<dyn FileSystem>,
        path: PathBuf,
        config: InvocationLogConfig,
    ) -> std::io::Result<(Self, bool)> {
        let existing = fs.read(&path).ok();
        let mut log = Self {
            fs,
            path: path.clone(),
            config,
            path_ids: HashMap::new(),
            next_path_id: 0,
            next_fingerprint_id: 0,
            total_invocation_writes: 0,
            invocations: Invocations::default(),
            leaking: false,
        };

        let Some(bytes) = existing else {
            log.write_fresh_header()?;
            return Ok((log, false));
        };

        if bytes.len() < HEADER_LEN || &bytes[..12] != SIGNATURE.as_slice() {
            warn!(path = %path.display(), "invocation log missing/invalid signature, starting fresh");
            log.write_fresh_header()?;
            return Ok((log, false));
        }
        let version = u32::from_le_bytes(bytes[12..16].try_into().unwrap());
        if version != LOG_VERSION {
            warn!(path = %path.display(), found = version, expected = LOG_VERSION, "invocation log version mismatch, starting fresh");
            log.write_fresh_header()?;
            return Ok((log, false));
        }

        let body = &bytes[HEADER_LEN..];
        let mut offset = 0usize;
        let mut records = Vec::new();
        let mut truncated = false;
        loop {
            match decode_record(&body[offset..]) {
                Ok(None) => break,
                Ok(Some((record, used))) => {
                    records.push(record);
                    offset += used;
                }
                Err(super::record::TruncatedRecord) => {
                    truncated = true;
                    break;
                }
            }
        }

        if truncated {
            warn!(
                path = %path.display(),
                valid_bytes = offset,
                lost_bytes = body.len() - offset,
                "invocation log tail truncated, recovering prefix"
            );
            let mut fixed = bytes[..HEADER_LEN + offset].to_vec();
            // Belt-and-suspenders: re-derive to avoid any slicing mistake above.
            fixed.truncate(HEADER_LEN + offset);
            log.fs.write(&path, &fixed).map_err(|e| std::io::Error::new(e.kind(), e))?;
        }

        for record in &records {
            match record {
                LogRecord::Path { id, path } => {
                    log.path_ids.insert(path.clone(), *id);
                    log.next_path_id = log.next_path_id.max(id + 1);
                }
                LogRecord::Fingerprint { id, .. } => {
                    log.next_fingerprint_id = log.next_fingerprint_id.max(id + 1);
                }
                LogRecord::Invocation { .. } => {
                    log.total_invocation_writes += 1;
                }
                _ => {}
            }
        }
        log.invocations = replay(&records);

        let needs_recompaction = log.compute_needs_recompaction();
        trace!(
            path = %path.display(),
            live = log.invocations.entries.len(),
            total_writes = log.total_invocation_writes,
            needs_recompaction,
            "opened invocation log"
        );
        Ok((log, needs_recompaction))
    }

    fn write_fresh_header(&self) -> std::io::Result<()> {
        let mut header = Vec::with_capacity(HEADER_LEN);
        header.extend_from_slice(SIGNATURE.as_slice());
        header.extend_from_slice(&LOG_VERSION.to_le_bytes());
        self.fs.write(&self.path, &header)
    }

    fn compute_needs_recompaction(&self) -> bool {
        if self.total_invocation_writes < self.config.recompact_min_writes {
            return false;
        }
        let live = self.invocations.entries.len() as f64;
        let total = self.total_invocation_writes as f64;
        let dead_fraction = 1.0 - (live / total);
        dead_fraction > self.config.recompact_dead_fraction
    }

    pub fn needs_recompaction(&self) -> bool {
        self.compute_needs_recompaction()
    }

    fn append_record(&mut self, record: &LogRecord) -> std::io::Result<()> {
        self.fs.append(&self.path, &encode_record(record))
    }

    fn intern_path(&mut self, path: &Path) -> std::io::Result<u32> {
        let path = normalize_path(path);
        if let Some(&id) = self.path_ids.get(&path) {
            return Ok(id);
        }
        let id = self.next_path_id;
        self.next_path_id += 1;
        self.path_ids.insert(path.clone(), id);
        self.append_record(&LogRecord::Path { id, path })?;
        Ok(id)
    }

    fn write_fingerprint_record(&mut self, path: &Path, fp: &Fingerprint) -> std::io::Result<u32> {
        let path_id = self.intern_path(path)?;
        let id = self.next_fingerprint_id;
        self.next_fingerprint_id += 1;
        self.append_record(&LogRecord::Fingerprint { id, path_id, fingerprint: *fp })?;
        Ok(id)
    }

    /// Atomically rewrites the log to contain exactly the entries needed to
    /// reconstruct the current [`Invocations`] snapshot (`spec.md` §4.2).
    pub fn recompact(&mut self) -> std::io::Result<()> {
        let temp_path = {
            let mut p = self.path.clone();
            let name = p.file_name().map(|n| n.to_string_lossy().into_owned()).unwrap_or_default();
            p.set_file_name(format!("{name}.recompact-tmp"));
            p
        };

        let mut fresh = Self {
            fs: self.fs.clone(),
            path: temp_path.clone(),
            config: self.config,
            path_ids: HashMap::new(),
            next_path_id: 0,
            next_fingerprint_id: 0,
            total_invocation_writes: 0,
            invocations: Invocations::default(),
            leaking: false,
        };
        fresh.write_fresh_header()?;

        let mut dirs: Vec<&PathBuf> = self.invocations.created_directories.iter().collect();
        dirs.sort();
        for dir in dirs {
            fresh.created_directory(dir)?;
        }

        let mut entries: Vec<(&Hash, &InvocationRecord)> = self.invocations.entries.iter().collect();
        entries.sort_by_key(|(h, _)| h.as_bytes().to_vec());
        for (hash, record) in entries {
            fresh.ran_command(
                *hash,
                &record.output_files,
                &record.input_files,
                &record.ignored_dependencies,
                &record.additional_dependencies,
            )?;
        }

        self.fs.rename(&temp_path, &self.path)?;
        debug!(path = %self.path.display(), "recompacted invocation log");

        self.path_ids = fresh.path_ids;
        self.next_path_id = fresh.next_path_id;
        self.next_fingerprint_id = fresh.next_fingerprint_id;
        self.total_invocation_writes = fresh.total_invocation_writes;
        // `invocations` content is unchanged by construction.
        Ok(())
    }
}

impl InvocationLog for PersistentInvocationLog {
    fn created_directory(&mut self, path: &Path) -> std::io::Result<()> {
        let path_id = self.intern_path(path)?;
        self.append_record(&LogRecord::CreatedDirectory { path_id })?;
        self.invocations.created_directories.insert(normalize_path(path));
        Ok(())
    }

    fn removed_directory(&mut self, path: &Path) -> std::io::Result<()> {
        let path_id = self.intern_path(path)?;
        self.append_record(&LogRecord::DeletedDirectory { path_id })?;
        self.invocations.created_directories.remove(&normalize_path(path));
        Ok(())
    }

    fn fingerprint(&mut self, clock_now: std::time::SystemTime, path: &Path) -> (Fingerprint, FileId) {
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
        let mut output_ids = Vec::new();
        let mut output_files = Vec::new();
        for (path, fp) in outputs {
            if fp.is_dir() {
                self.created_directory(path)?;
                continue;
            }
            output_ids.push(self.write_fingerprint_record(path, fp)?);
            output_files.push((normalize_path(path), *fp));
        }

        let mut input_ids = Vec::new();
        let mut input_files = Vec::new();
        for (path, fp) in inputs {
            if fp.is_dir() {
                continue; // directories are not tracked as inputs
            }
            input_ids.push(self.write_fingerprint_record(path, fp)?);
            input_files.push((normalize_path(path), *fp));
        }

        self.append_record(&LogRecord::Invocation {
            step_hash,
            output_fingerprint_ids: output_ids,
            input_fingerprint_ids: input_ids,
            ignored_dependencies: ignored_dependencies.iter().map(|s| s.0).collect(),
            additional_dependencies: additional_dependencies.to_vec(),
        })?;
        self.total_invocation_writes += 1;
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
        self.append_record(&LogRecord::InvocationDeletion { step_hash })?;
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

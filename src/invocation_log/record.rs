//! On-disk record kinds for the invocation log (`spec.md` §4.2, §6.1) and the
//! pure reducer that replays a record stream into an [`Invocations`]
//! snapshot. Kept as a standalone, testable "typed record iterator" per
//! `spec.md` §9 rather than pointer-arithmetic parsing.

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;

use crate::binformat::{Reader, Writer};
use crate::fingerprint::Fingerprint;
use crate::hash::Hash;
use crate::manifest::StepIndex;

const KIND_PATH: u8 = 0;
const KIND_FINGERPRINT: u8 = 1;
const KIND_CREATED_DIRECTORY: u8 = 2;
const KIND_DELETED_DIRECTORY: u8 = 3;
const KIND_INVOCATION: u8 = 4;
const KIND_INVOCATION_DELETION: u8 = 5;

#[derive(Clone, Debug, PartialEq)]
pub enum LogRecord {
    Path { id: u32, path: PathBuf },
    Fingerprint { id: u32, path_id: u32, fingerprint: Fingerprint },
    CreatedDirectory { path_id: u32 },
    DeletedDirectory { path_id: u32 },
    Invocation {
        step_hash: Hash,
        output_fingerprint_ids: Vec<u32>,
        input_fingerprint_ids: Vec<u32>,
        ignored_dependencies: Vec<u32>,
        additional_dependencies: Vec<Hash>,
    },
    InvocationDeletion { step_hash: Hash },
}

fn write_fingerprint(w: &mut Writer, fp: &Fingerprint) {
    w.write_u64(fp.size);
    w.write_u64(fp.inode);
    w.write_u32(fp.mode);
    w.write_system_time(fp.mtime);
    w.buf.extend_from_slice(fp.hash.as_bytes());
    w.write_bool(fp.racily_clean);
}

fn read_fingerprint(r: &mut Reader<'_>) -> crate::binformat::ReadResult<Fingerprint> {
    let size = r.read_u64()?;
    let inode = r.read_u64()?;
    let mode = r.read_u32()?;
    let mtime = r.read_system_time()?;
    let mut hash_bytes = [0u8; 32];
    for b in hash_bytes.iter_mut() {
        *b = r.read_u8()?;
    }
    let racily_clean = r.read_bool()?;
    Ok(Fingerprint { size, inode, mode, mtime, hash: Hash(hash_bytes), racily_clean })
}

/// Encodes one record as `<length: varint><kind: u8><payload>`.
pub fn encode_record(record: &LogRecord) -> Vec<u8> {
    let mut payload = Writer::new();
    let kind = match record {
        LogRecord::Path { id, path } => {
            payload.write_u32(*id);
            payload.write_path(path);
            KIND_PATH
        }
        LogRecord::Fingerprint { id, path_id, fingerprint } => {
            payload.write_u32(*id);
            payload.write_u32(*path_id);
            write_fingerprint(&mut payload, fingerprint);
            KIND_FINGERPRINT
        }
        LogRecord::CreatedDirectory { path_id } => {
            payload.write_u32(*path_id);
            KIND_CREATED_DIRECTORY
        }
        LogRecord::DeletedDirectory { path_id } => {
            payload.write_u32(*path_id);
            KIND_DELETED_DIRECTORY
        }
        LogRecord::Invocation {
            step_hash,
            output_fingerprint_ids,
            input_fingerprint_ids,
            ignored_dependencies,
            additional_dependencies,
        } => {
            payload.buf.extend_from_slice(step_hash.as_bytes());
            payload.write_varint_seq(output_fingerprint_ids, |w, id| w.write_u32(*id));
            payload.write_varint_seq(input_fingerprint_ids, |w, id| w.write_u32(*id));
            payload.write_varint_seq(ignored_dependencies, |w, id| w.write_u32(*id));
            payload.write_varint_seq(additional_dependencies, |w, h| {
                w.buf.extend_from_slice(h.as_bytes())
            });
            KIND_INVOCATION
        }
        LogRecord::InvocationDeletion { step_hash } => {
            payload.buf.extend_from_slice(step_hash.as_bytes());
            KIND_INVOCATION_DELETION
        }
    };

    let mut out = Writer::new();
    // length covers kind byte + payload
    out.write_varint((payload.buf.len() + 1) as u64);
    out.write_u8(kind);
    out.buf.extend_from_slice(&payload.buf);
    out.buf
}

/// A record could not be decoded because `buf` ends mid-record.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TruncatedRecord;

/// Decodes one record from the front of `buf`. Returns `Ok(None)` when `buf`
/// is empty (clean EOF). Returns `Err` when the tail is truncated
/// mid-record; the caller truncates to the last valid boundary and warns.
pub fn decode_record(buf: &[u8]) -> Result<Option<(LogRecord, usize)>, TruncatedRecord> {
    if buf.is_empty() {
        return Ok(None);
    }
    let mut len_reader = Reader::new(buf);
    let length = len_reader.read_varint().map_err(|_| TruncatedRecord)? as usize;
    let header_len = len_reader.position();
    if len_reader.remaining() < length {
        return Err(TruncatedRecord);
    }
    let record_start = header_len;
    let record_bytes = &buf[record_start..record_start + length];
    let mut r = Reader::new(record_bytes);
    let kind = r.read_u8().map_err(|_| TruncatedRecord)?;
    let record = match kind {
        KIND_PATH => {
            let id = r.read_u32().map_err(|_| TruncatedRecord)?;
            let path = r.read_path().map_err(|_| TruncatedRecord)?;
            LogRecord::Path { id, path }
        }
        KIND_FINGERPRINT => {
            let id = r.read_u32().map_err(|_| TruncatedRecord)?;
            let path_id = r.read_u32().map_err(|_| TruncatedRecord)?;
            let fingerprint = read_fingerprint(&mut r).map_err(|_| TruncatedRecord)?;
            LogRecord::Fingerprint { id, path_id, fingerprint }
        }
        KIND_CREATED_DIRECTORY => {
            let path_id = r.read_u32().map_err(|_| TruncatedRecord)?;
            LogRecord::CreatedDirectory { path_id }
        }
        KIND_DELETED_DIRECTORY => {
            let path_id = r.read_u32().map_err(|_| TruncatedRecord)?;
            LogRecord::DeletedDirectory { path_id }
        }
        KIND_INVOCATION => {
            let mut hash_bytes = [0u8; 32];
            for b in hash_bytes.iter_mut() {
                *b = r.read_u8().map_err(|_| TruncatedRecord)?;
            }
            let output_fingerprint_ids = r.read_varint_seq(|r| r.read_u32()).map_err(|_| TruncatedRecord)?;
            let input_fingerprint_ids = r.read_varint_seq(|r| r.read_u32()).map_err(|_| TruncatedRecord)?;
            let ignored_dependencies = r.read_varint_seq(|r| r.read_u32()).map_err(|_| TruncatedRecord)?;
            let additional_dependencies = r
                .read_varint_seq(|r| {
                    let mut hb = [0u8; 32];
                    for b in hb.iter_mut() {
                        *b = r.read_u8()?;
                    }
                    Ok(Hash(hb))
                })
                .map_err(|_| TruncatedRecord)?;
            LogRecord::Invocation {
                step_hash: Hash(hash_bytes),
                output_fingerprint_ids,
                input_fingerprint_ids,
                ignored_dependencies,
                additional_dependencies,
            }
        }
        KIND_INVOCATION_DELETION => {
            let mut hash_bytes = [0u8; 32];
            for b in hash_bytes.iter_mut() {
                *b = r.read_u8().map_err(|_| TruncatedRecord)?;
            }
            LogRecord::InvocationDeletion { step_hash: Hash(hash_bytes) }
        }
        _ => return Err(TruncatedRecord),
    };
    Ok(Some((record, record_start + length)))
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct InvocationRecord {
    pub output_files: Vec<(PathBuf, Fingerprint)>,
    pub input_files: Vec<(PathBuf, Fingerprint)>,
    pub ignored_dependencies: Vec<StepIndex>,
    pub additional_dependencies: Vec<Hash>,
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct Invocations {
    pub entries: HashMap<Hash, InvocationRecord>,
    pub created_directories: HashSet<PathBuf>,
}

/// Replays a record stream (in file order) into a reduced [`Invocations`]
/// snapshot: later records override earlier ones for the same step-hash or
/// directory.
pub fn replay(records: &[LogRecord]) -> Invocations {
    let mut paths: HashMap<u32, PathBuf> = HashMap::new();
    let mut fingerprints: HashMap<u32, (PathBuf, Fingerprint)> = HashMap::new();
    let mut invocations = Invocations::default();

    for record in records {
        match record {
            LogRecord::Path { id, path } => {
                paths.insert(*id, path.clone());
            }
            LogRecord::Fingerprint { id, path_id, fingerprint } => {
                if let Some(path) = paths.get(path_id) {
                    fingerprints.insert(*id, (path.clone(), *fingerprint));
                }
            }
            LogRecord::CreatedDirectory { path_id } => {
                if let Some(path) = paths.get(path_id) {
                    invocations.created_directories.insert(path.clone());
                }
            }
            LogRecord::DeletedDirectory { path_id } => {
                if let Some(path) = paths.get(path_id) {
                    invocations.created_directories.remove(path);
                }
            }
            LogRecord::Invocation {
                step_hash,
                output_fingerprint_ids,
                input_fingerprint_ids,
                ignored_dependencies,
                additional_dependencies,
            } => {
                let output_files = output_fingerprint_ids
                    .iter()
                    .filter_map(|id| fingerprints.get(id).cloned())
                    .collect();
                let input_files = input_fingerprint_ids
                    .iter()
                    .filter_map(|id| fingerprints.get(id).cloned())
                    .collect();
                let ignored_dependencies =
                    ignored_dependencies.iter().map(|i| StepIndex(*i)).collect();
                invocations.entries.insert(
                    *step_hash,
                    InvocationRecord {
                        output_files,
                        input_files,
                        ignored_dependencies,
                        additional_dependencies: additional_dependencies.clone(),
                    },
                );
            }
            LogRecord::InvocationDeletion { step_hash } => {
                invocations.entries.remove(step_hash);
            }
        }
    }

    invocations
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::SystemTime;

    fn sample_fp() -> Fingerprint {
        Fingerprint {
            size: 10,
            inode: 5,
            mode: 0o100644,
            mtime: SystemTime::UNIX_EPOCH,
            hash: Hash::of_bytes(b"x"),
            racily_clean: false,
        }
    }

    #[test]
    fn record_round_trips() {
        let records = vec![
            LogRecord::Path { id: 0, path: "a/b".into() },
            LogRecord::Fingerprint { id: 0, path_id: 0, fingerprint: sample_fp() },
            LogRecord::CreatedDirectory { path_id: 0 },
            LogRecord::Invocation {
                step_hash: Hash::of_bytes(b"step"),
                output_fingerprint_ids: vec![0],
                input_fingerprint_ids: vec![],
                ignored_dependencies: vec![2],
                additional_dependencies: vec![Hash::of_bytes(b"extra")],
            },
            LogRecord::InvocationDeletion { step_hash: Hash::of_bytes(b"gone") },
        ];
        for record in &records {
            let bytes = encode_record(record);
            let (decoded, used) = decode_record(&bytes).unwrap().unwrap();
            assert_eq!(used, bytes.len());
            assert_eq!(&decoded, record);
        }
    }

    #[test]
    fn truncated_record_is_rejected() {
        let bytes = encode_record(&LogRecord::Path { id: 0, path: "a".into() });
        let truncated = &bytes[..bytes.len() - 1];
        assert!(decode_record(truncated).is_err());
    }

    #[test]
    fn replay_overrides_by_step_hash() {
        let h = Hash::of_bytes(b"s");
        let records = vec![
            LogRecord::Path { id: 0, path: "out".into() },
            LogRecord::Fingerprint { id: 0, path_id: 0, fingerprint: sample_fp() },
            LogRecord::Invocation {
                step_hash: h,
                output_fingerprint_ids: vec![0],
                input_fingerprint_ids: vec![],
                ignored_dependencies: vec![],
                additional_dependencies: vec![],
            },
            LogRecord::Invocation {
                step_hash: h,
                output_fingerprint_ids: vec![],
                input_fingerprint_ids: vec![],
                ignored_dependencies: vec![],
                additional_dependencies: vec![],
            },
        ];
        let invocations = replay(&records);
        assert_eq!(invocations.entries[&h].output_files.len(), 0);
    }
}

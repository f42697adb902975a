//! Snapshots, replay and compaction of note logs.
//!
//! A snapshot holds the full yrs state and register values of a note plus
//! its *coverage*: for every instance, the highest sequence folded in.
//! Replay reads every log, then merges every readable snapshot (merging is
//! idempotent, so overlapping snapshots are harmless) and finally applies
//! each log record above the maximum coverage for its instance.
//!
//! Compaction only ever removes the compacting instance's own files. Other
//! instances drop their covered logs themselves via [`LogWriter::prune_covered`].

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use super::doc::{NoteDoc, NoteOp, NoteRegisters};
use crate::crdt_log::record::base64_bytes;
use crate::crdt_log::{self, LogRecord, LogWriter};
use crate::error::{Result, TideError};
use crate::fs::{self, FileSystem};

/// Current snapshot format.
pub const SNAPSHOT_FORMAT_VERSION: u32 = 1;

/// File extension of snapshots.
pub const SNAPSHOT_EXTENSION: &str = "snapshot";

/// Instance id to highest included sequence.
pub type Coverage = BTreeMap<String, u64>;

/// On-disk snapshot of one note.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NoteSnapshot {
    pub format_version: u32,
    pub note_id: String,
    pub created_by: String,
    /// Milliseconds since the epoch.
    pub created_at: i64,
    pub coverage: Coverage,
    pub registers: NoteRegisters,
    #[serde(default)]
    pub note_created_at: i64,
    #[serde(default)]
    pub note_modified_at: i64,
    /// Full yrs state as a v1 update.
    #[serde(with = "base64_bytes")]
    pub state: Vec<u8>,
}

/// A snapshot file found on disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapshotFile {
    pub path: PathBuf,
    pub instance: String,
    pub number: u64,
}

/// Whether every entry of `a` is at or below the same entry of `b`.
pub fn is_dominated(a: &Coverage, b: &Coverage) -> bool {
    a.iter()
        .all(|(instance, seq)| b.get(instance).is_some_and(|other| other >= seq))
}

/// Element-wise maximum of two coverage vectors, into `into`.
pub fn merge_coverage(into: &mut Coverage, other: &Coverage) {
    for (instance, seq) in other {
        let entry = into.entry(instance.clone()).or_insert(0);
        *entry = (*entry).max(*seq);
    }
}

pub fn snapshot_file_name(instance: &str, number: u64) -> String {
    format!("{}_{:010}.{}", instance, number, SNAPSHOT_EXTENSION)
}

fn parse_snapshot_file_name(path: &Path) -> Option<(String, u64)> {
    let name = fs::file_name(path)?;
    let stem = name.strip_suffix(&format!(".{}", SNAPSHOT_EXTENSION))?;
    let (instance, number) = stem.rsplit_once('_')?;
    if instance.is_empty() {
        return None;
    }
    Some((instance.to_string(), number.parse().ok()?))
}

/// Snapshot files in `dir`, sorted by instance then number.
pub fn list_snapshots(fs: &dyn FileSystem, dir: &Path) -> Result<Vec<SnapshotFile>> {
    let mut files: Vec<SnapshotFile> = fs
        .list_files(dir)?
        .into_iter()
        .filter(|p| !fs::is_temporary(p))
        .filter_map(|path| {
            let (instance, number) = parse_snapshot_file_name(&path)?;
            Some(SnapshotFile {
                path,
                instance,
                number,
            })
        })
        .collect();
    files.sort_by(|a, b| a.instance.cmp(&b.instance).then(a.number.cmp(&b.number)));
    Ok(files)
}

/// Read and validate one snapshot.
pub fn read_snapshot(fs: &dyn FileSystem, path: &Path) -> Result<NoteSnapshot> {
    let bytes = fs.read_binary(path).map_err(|source| TideError::FileRead {
        path: path.to_path_buf(),
        source,
    })?;
    let snapshot: NoteSnapshot = serde_json::from_slice(&bytes)?;
    if snapshot.format_version != SNAPSHOT_FORMAT_VERSION {
        return Err(TideError::InvalidEntry(format!(
            "unsupported snapshot format {} in {:?}",
            snapshot.format_version, path
        )));
    }
    Ok(snapshot)
}

/// Result of replaying a note from disk.
#[derive(Debug)]
pub struct Replay {
    pub doc: NoteDoc,
    /// Maximum coverage over all readable snapshots.
    pub coverage: Coverage,
    /// Highest sequence visible per instance (snapshots and logs).
    pub visible: HashMap<String, u64>,
    /// Records applied on top of the snapshots.
    pub residual_records: usize,
    /// Highest Lamport clock seen.
    pub max_clock: u64,
}

/// Attempts at replaying before a vanishing snapshot is reported.
const REPLAY_ATTEMPTS: usize = 3;

/// Build a note's merged state from its snapshots and logs.
///
/// Unreadable snapshots and structurally corrupt logs are skipped with a
/// warning. Incomplete log tails are ignored.
///
/// Logs are read before snapshots are listed. Compaction writes its
/// snapshot before pruning any log, so a log that disappears under us is
/// covered by a snapshot the listing will include. A listed snapshot that
/// disappears was superseded by a newer one; the replay then starts over.
pub fn replay(fs: &dyn FileSystem, note_dir: &Path, note_id: &str) -> Result<Replay> {
    let mut attempt = 1;
    loop {
        match replay_once(fs, note_dir, note_id) {
            Err(TideError::FileRead { path, source })
                if source.kind() == std::io::ErrorKind::NotFound && attempt < REPLAY_ATTEMPTS =>
            {
                log::debug!("Snapshot {:?} vanished during replay of {}, retrying", path, note_id);
                attempt += 1;
            }
            result => return result,
        }
    }
}

fn replay_once(fs: &dyn FileSystem, note_dir: &Path, note_id: &str) -> Result<Replay> {
    let mut logged: Vec<LogRecord<NoteOp>> = Vec::new();
    for file in crdt_log::list_log_files(fs, &note_dir.join(super::LOGS_DIR))? {
        // A pruned file reads as empty.
        match crdt_log::read_all::<NoteOp>(fs, &file.path) {
            Ok(read) => logged.extend(read.records),
            Err(e) if e.is_corruption() => {
                log::warn!("Skipping corrupt log {:?}: {}", file.path, e);
            }
            Err(e) => return Err(e),
        }
    }

    let mut doc = NoteDoc::new(note_id);
    let mut coverage = Coverage::new();
    let mut max_clock = 0;

    for file in list_snapshots(fs, &note_dir.join(super::SNAPSHOTS_DIR))? {
        let snapshot = match read_snapshot(fs, &file.path) {
            Ok(s) => s,
            Err(e) if e.is_corruption() => {
                log::warn!("Skipping unreadable snapshot {:?}: {}", file.path, e);
                continue;
            }
            Err(e) => return Err(e),
        };
        if let Err(e) = doc.apply_update(&snapshot.state) {
            log::warn!("Skipping snapshot {:?} with invalid state: {}", file.path, e);
            continue;
        }
        doc.merge_registers(&snapshot.registers);
        doc.observe_times(snapshot.note_created_at, snapshot.note_modified_at);
        max_clock = max_clock.max(snapshot.registers.max_clock());
        merge_coverage(&mut coverage, &snapshot.coverage);
    }

    let mut visible: HashMap<String, u64> =
        coverage.iter().map(|(k, v)| (k.clone(), *v)).collect();
    let mut residual_records = 0;

    for record in logged {
        max_clock = max_clock.max(record.clock);
        if record.seq <= coverage.get(&record.instance).copied().unwrap_or(0) {
            continue;
        }
        if let Err(e) = doc.apply_record(&record) {
            log::warn!(
                "Skipping record {}#{} of note {}: {}",
                record.instance,
                record.seq,
                note_id,
                e
            );
        }
        let seen = visible.entry(record.instance.clone()).or_insert(0);
        *seen = (*seen).max(record.seq);
        residual_records += 1;
    }

    Ok(Replay {
        doc,
        coverage,
        visible,
        residual_records,
        max_clock,
    })
}

/// Outcome of a compaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompactionResult {
    pub snapshot: PathBuf,
    pub coverage: Coverage,
    pub removed_logs: usize,
    pub removed_snapshots: usize,
}

/// Snapshot `replay`, then remove the compacting instance's covered files.
///
/// The snapshot is durable (temp file, fsync, rename) before anything is
/// removed. Own older snapshots are removed only when the new coverage
/// dominates theirs.
pub fn compact(
    fs: &dyn FileSystem,
    note_dir: &Path,
    instance: &str,
    replay: &Replay,
    writer: &mut LogWriter,
) -> Result<CompactionResult> {
    let snapshots_dir = note_dir.join(super::SNAPSHOTS_DIR);
    let existing = list_snapshots(fs, &snapshots_dir)?;
    let number = existing
        .iter()
        .filter(|f| f.instance == instance)
        .map(|f| f.number)
        .max()
        .unwrap_or(0)
        + 1;

    let coverage: Coverage = replay
        .visible
        .iter()
        .map(|(k, v)| (k.clone(), *v))
        .collect();
    let snapshot = NoteSnapshot {
        format_version: SNAPSHOT_FORMAT_VERSION,
        note_id: replay.doc.note_id().to_string(),
        created_by: instance.to_string(),
        created_at: chrono::Utc::now().timestamp_millis(),
        coverage: coverage.clone(),
        registers: replay.doc.registers().clone(),
        note_created_at: replay.doc.created_at(),
        note_modified_at: replay.doc.modified_at(),
        state: replay.doc.encode_state(),
    };

    let path = snapshots_dir.join(snapshot_file_name(instance, number));
    let json = serde_json::to_vec(&snapshot)?;
    fs.write_atomic(&path, &json)
        .map_err(|source| TideError::FileWrite {
            path: path.clone(),
            source,
        })?;

    let own_covered = coverage.get(instance).copied().unwrap_or(0);
    let removed_logs = writer.prune_covered(fs, own_covered)?;

    let mut removed_snapshots = 0;
    for file in existing.iter().filter(|f| f.instance == instance) {
        let dominated = match read_snapshot(fs, &file.path) {
            Ok(old) => is_dominated(&old.coverage, &coverage),
            Err(_) => false,
        };
        if dominated {
            fs.delete_file(&file.path)
                .map_err(|source| TideError::FileWrite {
                    path: file.path.clone(),
                    source,
                })?;
            removed_snapshots += 1;
        }
    }

    log::info!(
        "Compacted note {}: snapshot {:?}, removed {} logs and {} snapshots",
        replay.doc.note_id(),
        path,
        removed_logs,
        removed_snapshots
    );

    Ok(CompactionResult {
        snapshot: path,
        coverage,
        removed_logs,
        removed_snapshots,
    })
}

//! Append-only CRDT update logs.
//!
//! Every (stream, instance) pair owns one or more log files in a directory:
//!
//! ```text
//! logs/
//! ├── 3f2a…_0000000001.crdtlog   instance 3f2a…, records 1..=40
//! ├── 3f2a…_0000000041.crdtlog   instance 3f2a…, records 41.. (after compaction)
//! └── 9c11…_0000000001.crdtlog   instance 9c11…
//! ```
//!
//! An instance only ever appends to (or prunes) files carrying its own id.
//! Readers take every complete record from every file and ignore incomplete
//! tails; see [`codec`] for the framing rules.

pub mod codec;
pub mod record;

use std::path::{Path, PathBuf};

use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::error::{Result, TideError};
use crate::fs::{self, FileSystem};

pub use codec::MAX_RECORD_BYTES;
pub use record::LogRecord;

/// File extension of update logs.
pub const LOG_EXTENSION: &str = "crdtlog";

/// A log file discovered in a log directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogFile {
    pub path: PathBuf,
    pub instance: String,
    pub first_seq: u64,
}

/// Records read from one log file.
#[derive(Debug)]
pub struct LogRead<Op> {
    pub records: Vec<LogRecord<Op>>,
    /// Bytes covered by complete frames.
    pub complete_len: u64,
    /// Whether the file ends in a frame that is still being written/delivered.
    pub incomplete_tail: bool,
}

/// File name for the log of `instance` whose first record is `first_seq`.
pub fn log_file_name(instance: &str, first_seq: u64) -> String {
    format!("{}_{:010}.{}", instance, first_seq, LOG_EXTENSION)
}

/// Parse a log file name back into (instance, first_seq).
pub fn parse_log_file_name(path: &Path) -> Option<(String, u64)> {
    let name = fs::file_name(path)?;
    let stem = name.strip_suffix(&format!(".{}", LOG_EXTENSION))?;
    let (instance, first) = stem.rsplit_once('_')?;
    if instance.is_empty() || instance.starts_with('.') {
        return None;
    }
    let first_seq = first.parse().ok()?;
    Some((instance.to_string(), first_seq))
}

/// List the log files in `dir`, sorted by instance then first sequence.
pub fn list_log_files(fs: &dyn FileSystem, dir: &Path) -> Result<Vec<LogFile>> {
    let mut files: Vec<LogFile> = fs
        .list_files(dir)?
        .into_iter()
        .filter(|p| !fs::is_temporary(p))
        .filter_map(|path| {
            let (instance, first_seq) = parse_log_file_name(&path)?;
            Some(LogFile {
                path,
                instance,
                first_seq,
            })
        })
        .collect();
    files.sort_by(|a, b| {
        a.instance
            .cmp(&b.instance)
            .then_with(|| a.first_seq.cmp(&b.first_seq))
    });
    Ok(files)
}

/// Read every complete record of a log file, in file order.
///
/// A missing file reads as empty. An incomplete trailing frame is excluded
/// without error; structural corruption yields [`TideError::CorruptLog`].
pub fn read_all<Op: DeserializeOwned>(fs: &dyn FileSystem, path: &Path) -> Result<LogRead<Op>> {
    let bytes = match fs.read_binary(path) {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Ok(LogRead {
                records: Vec::new(),
                complete_len: 0,
                incomplete_tail: false,
            });
        }
        Err(source) => {
            return Err(TideError::FileRead {
                path: path.to_path_buf(),
                source,
            });
        }
    };

    let decoded = codec::decode_frames(&bytes).map_err(|c| TideError::CorruptLog {
        path: path.to_path_buf(),
        offset: c.offset,
        reason: c.reason,
    })?;

    let mut records = Vec::with_capacity(decoded.bodies.len());
    for (offset, body) in decoded.bodies {
        let record = serde_json::from_slice(body).map_err(|e| TideError::CorruptLog {
            path: path.to_path_buf(),
            offset,
            reason: format!("undecodable record: {}", e),
        })?;
        records.push(record);
    }

    Ok(LogRead {
        records,
        complete_len: decoded.complete_len,
        incomplete_tail: decoded.incomplete_tail,
    })
}

/// Frame and durably append one record.
pub fn append<Op: Serialize>(
    fs: &dyn FileSystem,
    path: &Path,
    record: &LogRecord<Op>,
) -> Result<()> {
    let body = serde_json::to_vec(record)?;
    let frame = codec::encode_frame(&body).map_err(|c| TideError::CorruptLog {
        path: path.to_path_buf(),
        offset: c.offset,
        reason: c.reason,
    })?;
    fs.append(path, &frame).map_err(|source| TideError::FileWrite {
        path: path.to_path_buf(),
        source,
    })
}

/// Appends one instance's records to a log directory.
///
/// Tracks the next sequence number and the active file. Opening the writer
/// cuts off a torn tail left by a crash in the instance's newest file so new
/// frames never follow garbage.
#[derive(Debug)]
pub struct LogWriter {
    dir: PathBuf,
    instance: String,
    active: PathBuf,
    next_seq: u64,
}

impl LogWriter {
    /// Open the writer for `instance` in `dir`.
    ///
    /// `covered_seq` is the highest own sequence already folded into a
    /// snapshot; sequence numbering continues after it even if every own
    /// log file has been pruned.
    pub fn open(fs: &dyn FileSystem, dir: &Path, instance: &str, covered_seq: u64) -> Result<Self> {
        let own: Vec<LogFile> = list_log_files(fs, dir)?
            .into_iter()
            .filter(|f| f.instance == instance)
            .collect();

        let mut max_seq = covered_seq;
        let mut active = None;

        for (i, file) in own.iter().enumerate() {
            let is_newest = i + 1 == own.len();
            match read_all::<serde::de::IgnoredAny>(fs, &file.path) {
                Ok(read) => {
                    if let Some(last) = read.records.last() {
                        max_seq = max_seq.max(last.seq);
                    }
                    if is_newest {
                        if read.incomplete_tail {
                            log::warn!(
                                "Truncating torn tail of {:?} at {} bytes",
                                file.path,
                                read.complete_len
                            );
                            fs.truncate(&file.path, read.complete_len)
                                .map_err(|source| TideError::FileWrite {
                                    path: file.path.clone(),
                                    source,
                                })?;
                        }
                        active = Some(file.path.clone());
                    }
                }
                Err(e) if e.is_corruption() => {
                    // Every frame is at least a header plus one byte, which
                    // bounds how many sequences the file may have used.
                    let len = fs.file_len(&file.path).unwrap_or(0);
                    let bound = file.first_seq + len / (codec::FRAME_HEADER_LEN as u64 + 1);
                    log::warn!(
                        "Own log {:?} is corrupt, starting a new file after #{}: {}",
                        file.path,
                        bound,
                        e
                    );
                    max_seq = max_seq.max(bound);
                }
                Err(e) => return Err(e),
            }
        }

        let next_seq = max_seq + 1;
        let active = active.unwrap_or_else(|| dir.join(log_file_name(instance, next_seq)));

        Ok(Self {
            dir: dir.to_path_buf(),
            instance: instance.to_string(),
            active,
            next_seq,
        })
    }

    /// Sequence number the next appended record must carry.
    pub fn next_seq(&self) -> u64 {
        self.next_seq
    }

    /// Path of the file the next record goes to.
    pub fn active_path(&self) -> &Path {
        &self.active
    }

    /// Build and durably append the next record. Returns it.
    pub fn append<Op: Serialize>(
        &mut self,
        fs: &dyn FileSystem,
        clock: u64,
        op: Op,
    ) -> Result<LogRecord<Op>> {
        let record = LogRecord::new(self.instance.clone(), self.next_seq, clock, op);
        append(fs, &self.active, &record)?;
        self.next_seq += 1;
        Ok(record)
    }

    /// Start a new file for subsequent records.
    pub fn rotate(&mut self) {
        self.active = self.dir.join(log_file_name(&self.instance, self.next_seq));
    }

    /// Remove own log files whose records are all at or below `covered_seq`.
    ///
    /// The active file is rotated first if it is among them. Returns the
    /// number of files removed.
    pub fn prune_covered(&mut self, fs: &dyn FileSystem, covered_seq: u64) -> Result<usize> {
        if covered_seq + 1 < self.next_seq {
            // Own records exist beyond the snapshot; only older files qualify.
        } else if fs.file_len(&self.active).is_some() {
            self.rotate();
        }

        let own: Vec<LogFile> = list_log_files(fs, &self.dir)?
            .into_iter()
            .filter(|f| f.instance == self.instance && f.path != self.active)
            .collect();

        let mut removed = 0;
        for (i, file) in own.iter().enumerate() {
            // Records in a file end right before the next file's first sequence.
            let last_seq = match own.get(i + 1) {
                Some(next) => next.first_seq.saturating_sub(1),
                None => self.next_seq.saturating_sub(1),
            };
            if last_seq <= covered_seq {
                fs.delete_file(&file.path).map_err(|source| TideError::FileWrite {
                    path: file.path.clone(),
                    source,
                })?;
                removed += 1;
            }
        }
        Ok(removed)
    }
}

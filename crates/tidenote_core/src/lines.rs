//! Newline-terminated per-instance logs.
//!
//! The activity log, deletion log and move journal all share one physical
//! format: one UTF-8 entry per line, fields separated by `|`, each instance
//! appending only to `<dir>/<instance>.log`. A line without its trailing
//! `\n` is still being written (or still being delivered by a sync tool) and
//! is invisible until the newline arrives.
//!
//! Readers track logical byte offsets. When an instance trims its own file,
//! the rewritten file starts with a `#base|<n>` header giving the logical
//! offset of its first kept byte, so offsets never move backwards and a
//! reader can tell whether it lost lines to the trim.

use std::collections::{BTreeSet, HashMap};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{Result, TideError};
use crate::fs::{self, FileSystem};

/// Extension of line-oriented logs.
pub const LINE_LOG_EXTENSION: &str = "log";

/// Prefix of the header line written by [`compact_keep_last`].
pub const BASE_HEADER_PREFIX: &str = "#base|";

/// Complete lines read from one file.
#[derive(Debug, Default)]
pub struct LineBatch {
    pub lines: Vec<String>,
    /// Logical offset just past the last complete line.
    pub next_offset: u64,
    /// Lines between the requested offset and the first returned line were
    /// trimmed away before they could be read.
    pub gap: bool,
}

/// Per-file read positions, keyed by instance id.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LineCursor {
    offsets: HashMap<String, u64>,
    /// Instances whose file lost unread lines to a trim.
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    gaps: BTreeSet<String>,
}

impl LineCursor {
    /// A cursor positioned at the start of every file.
    pub fn new() -> Self {
        Self::default()
    }

    /// Read position for an instance's file.
    pub fn offset(&self, instance: &str) -> u64 {
        self.offsets.get(instance).copied().unwrap_or(0)
    }

    pub(crate) fn set(&mut self, instance: &str, offset: u64) {
        self.offsets.insert(instance.to_string(), offset);
    }

    /// Instances whose unread lines were trimmed since the last call.
    ///
    /// Whatever those lines announced has to be rediscovered some other way.
    pub fn take_gaps(&mut self) -> Vec<String> {
        std::mem::take(&mut self.gaps).into_iter().collect()
    }
}

/// Split a file into its logical base offset and body.
///
/// Returns `None` while a header is only partly delivered.
fn split_base_header(bytes: &[u8]) -> Option<(u64, &[u8])> {
    let prefix = BASE_HEADER_PREFIX.as_bytes();
    if !bytes.starts_with(prefix) {
        return Some((0, bytes));
    }
    let newline = bytes.iter().position(|b| *b == b'\n')?;
    let base = std::str::from_utf8(&bytes[prefix.len()..newline])
        .ok()
        .and_then(|n| n.trim().parse().ok())
        .unwrap_or(0);
    Some((base, &bytes[newline + 1..]))
}

/// Path of `instance`'s file in a line-log directory.
pub fn instance_log_path(dir: &Path, instance: &str) -> PathBuf {
    dir.join(format!("{}.{}", instance, LINE_LOG_EXTENSION))
}

/// Every (instance, path) line log in `dir`.
pub fn instance_logs(fs: &dyn FileSystem, dir: &Path) -> Result<Vec<(String, PathBuf)>> {
    let mut logs: Vec<(String, PathBuf)> = fs
        .list_files(dir)?
        .into_iter()
        .filter(|p| !fs::is_temporary(p))
        .filter_map(|p| {
            let name = fs::file_name(&p)?;
            let instance = name.strip_suffix(&format!(".{}", LINE_LOG_EXTENSION))?;
            Some((instance.to_string(), p))
        })
        .collect();
    logs.sort();
    Ok(logs)
}

/// Append one entry. Fields must not contain `|` or line breaks.
pub fn append_line(fs: &dyn FileSystem, path: &Path, fields: &[&str]) -> Result<()> {
    for field in fields {
        if field.contains('|') || field.contains('\n') || field.contains('\r') {
            return Err(TideError::InvalidEntry(field.to_string()));
        }
    }
    let mut line = fields.join("|");
    line.push('\n');
    fs.append(path, line.as_bytes())
        .map_err(|source| TideError::FileWrite {
            path: path.to_path_buf(),
            source,
        })
}

/// Read the complete lines of `path` starting at logical offset `from`.
///
/// An offset before the file's base was trimmed away: reading restarts at the
/// first kept line and the batch reports a gap. An offset past the end means
/// the file was replaced; reading restarts the same way.
pub fn read_complete_lines(fs: &dyn FileSystem, path: &Path, from: u64) -> Result<LineBatch> {
    let bytes = match fs.read_binary(path) {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(LineBatch::default()),
        Err(source) => {
            return Err(TideError::FileRead {
                path: path.to_path_buf(),
                source,
            });
        }
    };

    let Some((base, body)) = split_base_header(&bytes) else {
        return Ok(LineBatch {
            lines: Vec::new(),
            next_offset: from,
            gap: false,
        });
    };
    let end = base + body.len() as u64;

    let (start, gap) = if from < base {
        log::debug!("{:?} was trimmed past cursor {}, resuming at {}", path, from, base);
        (0, true)
    } else if from > end {
        log::debug!("{:?} shrank below cursor {}, rereading", path, from);
        (0, true)
    } else {
        ((from - base) as usize, false)
    };

    let pending = &body[start..];
    let Some(last_newline) = pending.iter().rposition(|b| *b == b'\n') else {
        return Ok(LineBatch {
            lines: Vec::new(),
            next_offset: base + start as u64,
            gap,
        });
    };

    let complete = String::from_utf8_lossy(&pending[..last_newline]);
    let lines = complete
        .split('\n')
        .map(|l| l.trim_end_matches('\r'))
        .filter(|l| !l.is_empty())
        .map(str::to_string)
        .collect();

    Ok(LineBatch {
        lines,
        next_offset: base + (start + last_newline + 1) as u64,
        gap,
    })
}

/// Read new complete lines from every instance file in `dir`, advancing `cursor`.
///
/// Files of `skip_instance` (normally the reader itself) are not returned.
pub fn consume_dir(
    fs: &dyn FileSystem,
    dir: &Path,
    cursor: &mut LineCursor,
    skip_instance: Option<&str>,
) -> Result<Vec<(String, String)>> {
    let mut out = Vec::new();
    for (instance, path) in instance_logs(fs, dir)? {
        if skip_instance == Some(instance.as_str()) {
            continue;
        }
        let batch = read_complete_lines(fs, &path, cursor.offset(&instance))?;
        cursor.set(&instance, batch.next_offset);
        if batch.gap {
            cursor.gaps.insert(instance.clone());
        }
        out.extend(batch.lines.into_iter().map(|l| (instance.clone(), l)));
    }
    Ok(out)
}

/// Rewrite `path` keeping only its last `keep` complete lines.
///
/// Only valid for the caller's own file. The rewrite carries a base header so
/// readers keep their logical positions. Returns the number of lines dropped.
pub fn compact_keep_last(fs: &dyn FileSystem, path: &Path, keep: usize) -> Result<usize> {
    let bytes = match fs.read_binary(path) {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
        Err(source) => {
            return Err(TideError::FileRead {
                path: path.to_path_buf(),
                source,
            });
        }
    };
    let Some((base, body)) = split_base_header(&bytes) else {
        return Ok(0);
    };

    let line_ends: Vec<usize> = body
        .iter()
        .enumerate()
        .filter(|(_, b)| **b == b'\n')
        .map(|(i, _)| i + 1)
        .collect();
    if line_ends.len() <= keep {
        return Ok(0);
    }
    let dropped = line_ends.len() - keep;
    let cut = line_ends[dropped - 1];
    let last = line_ends[line_ends.len() - 1];

    let mut content = format!("{}{}\n", BASE_HEADER_PREFIX, base + cut as u64).into_bytes();
    content.extend_from_slice(&body[cut..last]);
    fs.write_atomic(path, &content)
        .map_err(|source| TideError::FileWrite {
            path: path.to_path_buf(),
            source,
        })?;
    Ok(dropped)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::InMemoryFileSystem;

    #[test]
    fn test_incomplete_line_hidden_until_newline() {
        let fs = InMemoryFileSystem::new();
        let path = PathBuf::from("/sd/deleted/a.log");
        fs.set_contents(&path, b"n1|50\nn2|100");

        let batch = read_complete_lines(&fs, &path, 0).unwrap();
        assert_eq!(batch.lines, vec!["n1|50"]);
        assert_eq!(batch.next_offset, 6);

        fs.append(&path, b"\n").unwrap();
        let batch = read_complete_lines(&fs, &path, batch.next_offset).unwrap();
        assert_eq!(batch.lines, vec!["n2|100"]);
    }

    #[test]
    fn test_consume_dir_skips_own_file_and_advances() {
        let fs = InMemoryFileSystem::new();
        let dir = PathBuf::from("/sd/activity");
        append_line(&fs, &instance_log_path(&dir, "me"), &["n1", "me_1"]).unwrap();
        append_line(&fs, &instance_log_path(&dir, "peer"), &["n2", "peer_1"]).unwrap();

        let mut cursor = LineCursor::new();
        let first = consume_dir(&fs, &dir, &mut cursor, Some("me")).unwrap();
        assert_eq!(first, vec![("peer".to_string(), "n2|peer_1".to_string())]);

        assert!(consume_dir(&fs, &dir, &mut cursor, Some("me")).unwrap().is_empty());

        append_line(&fs, &instance_log_path(&dir, "peer"), &["n3", "peer_2"]).unwrap();
        let next = consume_dir(&fs, &dir, &mut cursor, Some("me")).unwrap();
        assert_eq!(next.len(), 1);
        assert_eq!(next[0].1, "n3|peer_2");
    }

    #[test]
    fn test_rejects_separator_in_field() {
        let fs = InMemoryFileSystem::new();
        let err = append_line(&fs, Path::new("/x.log"), &["a|b", "1"]).unwrap_err();
        assert!(matches!(err, TideError::InvalidEntry(_)));
    }

    #[test]
    fn test_compact_keeps_logical_offsets() {
        let fs = InMemoryFileSystem::new();
        let path = PathBuf::from("/sd/activity/peer.log");
        for i in 0..10 {
            append_line(&fs, &path, &["n", &format!("peer_{}", i)]).unwrap();
        }
        let caught_up = read_complete_lines(&fs, &path, 0).unwrap().next_offset;

        assert_eq!(compact_keep_last(&fs, &path, 3).unwrap(), 7);
        let text = fs.read_to_string(&path).unwrap();
        assert!(text.starts_with(BASE_HEADER_PREFIX));

        // A reader that was caught up sees nothing new and no gap.
        let reread = read_complete_lines(&fs, &path, caught_up).unwrap();
        assert!(reread.lines.is_empty());
        assert!(!reread.gap);
        assert_eq!(reread.next_offset, caught_up);

        append_line(&fs, &path, &["n", "peer_10"]).unwrap();
        let next = read_complete_lines(&fs, &path, caught_up).unwrap();
        assert_eq!(next.lines, vec!["n|peer_10"]);

        // Compacting again keeps counting from the first base.
        assert_eq!(compact_keep_last(&fs, &path, 1).unwrap(), 3);
        let after = read_complete_lines(&fs, &path, next.next_offset).unwrap();
        assert!(after.lines.is_empty());
        assert!(!after.gap);
    }

    #[test]
    fn test_reader_behind_trim_resumes_at_first_kept_line_with_gap() {
        let fs = InMemoryFileSystem::new();
        let dir = PathBuf::from("/sd/activity");
        let path = instance_log_path(&dir, "peer");
        for i in 10..20 {
            append_line(&fs, &path, &["n", &format!("peer_{}", i)]).unwrap();
        }
        let mut cursor = LineCursor::new();
        assert_eq!(consume_dir(&fs, &dir, &mut cursor, None).unwrap().len(), 10);

        for i in 20..30 {
            append_line(&fs, &path, &["n", &format!("peer_{}", i)]).unwrap();
        }
        // Still holds everything the reader has not seen.
        compact_keep_last(&fs, &path, 15).unwrap();
        let lines: Vec<String> = consume_dir(&fs, &dir, &mut cursor, None)
            .unwrap()
            .into_iter()
            .map(|(_, l)| l)
            .collect();
        let expected: Vec<String> = (20..30).map(|i| format!("n|peer_{}", i)).collect();
        assert_eq!(lines, expected);
        assert!(cursor.take_gaps().is_empty());

        // Now trim past the reader.
        for i in 30..40 {
            append_line(&fs, &path, &["n", &format!("peer_{}", i)]).unwrap();
        }
        compact_keep_last(&fs, &path, 5).unwrap();
        let lines = consume_dir(&fs, &dir, &mut cursor, None).unwrap();
        assert_eq!(lines.first().unwrap().1, "n|peer_35");
        assert_eq!(lines.len(), 5);
        assert_eq!(cursor.take_gaps(), vec!["peer".to_string()]);
        assert!(cursor.take_gaps().is_empty());
    }

    #[test]
    fn test_partly_delivered_header_reads_nothing() {
        let fs = InMemoryFileSystem::new();
        let path = PathBuf::from("/sd/activity/peer.log");
        fs.set_contents(&path, b"#base|12");
        let batch = read_complete_lines(&fs, &path, 40).unwrap();
        assert!(batch.lines.is_empty());
        assert_eq!(batch.next_offset, 40);
        assert!(!batch.gap);
    }
}

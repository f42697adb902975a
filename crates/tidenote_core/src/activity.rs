//! Per-instance activity log.
//!
//! Each instance announces "note N now has my record S" by appending
//! `noteId|instanceId_seq` to `activity/<instance>.log` once the record is
//! durable. Other instances tail these files to find which notes to re-merge
//! without scanning every log directory.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::context::StoreContext;
use crate::error::Result;
use crate::fs::FileSystem;
use crate::lines::{self, LineCursor};

/// Directory of activity logs inside an SD root.
pub const ACTIVITY_DIR: &str = "activity";

/// One published pointer to a durable update record.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ActivityEntry {
    pub note_id: String,
    pub instance_id: String,
    pub seq: u64,
}

impl ActivityEntry {
    /// Parse `noteId|instanceId_seq`.
    pub fn parse(line: &str) -> Option<Self> {
        let (note_id, pointer) = line.split_once('|')?;
        let (instance_id, seq) = pointer.rsplit_once('_')?;
        if note_id.is_empty() || instance_id.is_empty() {
            return None;
        }
        Some(Self {
            note_id: note_id.to_string(),
            instance_id: instance_id.to_string(),
            seq: seq.parse().ok()?,
        })
    }
}

/// Activity logs of one storage directory.
#[derive(Clone)]
pub struct ActivityLog {
    fs: Arc<dyn FileSystem>,
    dir: PathBuf,
}

impl ActivityLog {
    /// Activity logs under `sd_root`.
    pub fn new(fs: Arc<dyn FileSystem>, sd_root: &Path) -> Self {
        Self {
            fs,
            dir: sd_root.join(ACTIVITY_DIR),
        }
    }

    /// Path of the calling instance's own activity file.
    pub fn own_path(&self, ctx: &StoreContext) -> PathBuf {
        lines::instance_log_path(&self.dir, ctx.instance_id())
    }

    /// Announce that `seq` of the caller's log for `note_id` is durable.
    pub fn publish(&self, ctx: &StoreContext, note_id: &str, seq: u64) -> Result<()> {
        let pointer = format!("{}_{}", ctx.instance_id(), seq);
        lines::append_line(self.fs.as_ref(), &self.own_path(ctx), &[note_id, &pointer])
    }

    /// Entries appended by other instances since `cursor`.
    ///
    /// Malformed lines are skipped with a warning.
    pub fn consume(&self, ctx: &StoreContext, cursor: &mut LineCursor) -> Result<Vec<ActivityEntry>> {
        let raw = lines::consume_dir(self.fs.as_ref(), &self.dir, cursor, Some(ctx.instance_id()))?;
        Ok(raw
            .into_iter()
            .filter_map(|(file_instance, line)| match ActivityEntry::parse(&line) {
                Some(entry) => Some(entry),
                None => {
                    log::warn!(
                        "Skipping malformed activity line from {}: {:?}",
                        file_instance,
                        line
                    );
                    None
                }
            })
            .collect())
    }

    /// Trim the caller's own file to its last `keep` lines.
    pub fn compact_own(&self, ctx: &StoreContext, keep: usize) -> Result<usize> {
        let dropped = lines::compact_keep_last(self.fs.as_ref(), &self.own_path(ctx), keep)?;
        if dropped > 0 {
            log::debug!("Compacted activity log of {}: dropped {} lines", ctx.instance_id(), dropped);
        }
        Ok(dropped)
    }
}

impl std::fmt::Debug for ActivityLog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ActivityLog")
            .field("dir", &self.dir)
            .finish_non_exhaustive()
    }
}

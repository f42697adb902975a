//! The cross-SD move journal.
//!
//! `moves/<instance>.log` holds `noteId|moveId|fromSd|toSd|timestamp` lines.
//! A move is committed once its line is complete in any journal; the same
//! line is appended to the journals of both SDs involved.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, RwLock};

use serde::{Deserialize, Serialize};

use crate::context::StoreContext;
use crate::error::{Result, TideError};
use crate::fs::FileSystem;
use crate::lines::{self, LineCursor};

/// Directory of move journals inside an SD root.
pub const MOVES_DIR: &str = "moves";

/// One committed cross-SD move.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MoveEntry {
    pub note_id: String,
    pub move_id: String,
    pub from_sd: String,
    pub to_sd: String,
    /// Milliseconds since the epoch.
    pub timestamp: i64,
}

impl MoveEntry {
    /// Parse `noteId|moveId|fromSd|toSd|timestamp`.
    pub fn parse(line: &str) -> Option<Self> {
        let mut fields = line.split('|');
        let entry = Self {
            note_id: fields.next()?.to_string(),
            move_id: fields.next()?.to_string(),
            from_sd: fields.next()?.to_string(),
            to_sd: fields.next()?.to_string(),
            timestamp: fields.next()?.trim().parse().ok()?,
        };
        if fields.next().is_some() || entry.note_id.is_empty() || entry.move_id.is_empty() {
            return None;
        }
        Some(entry)
    }

    /// Whether `self` happened after `other` (timestamp, then move id).
    pub fn supersedes(&self, other: &MoveEntry) -> bool {
        (self.timestamp, &self.move_id) > (other.timestamp, &other.move_id)
    }
}

/// The union of every instance's move journal in one SD.
pub struct MoveJournal {
    fs: Arc<dyn FileSystem>,
    dir: PathBuf,
    entries: RwLock<HashMap<String, MoveEntry>>,
    cursor: Mutex<LineCursor>,
}

impl MoveJournal {
    pub fn new(fs: Arc<dyn FileSystem>, sd_root: &Path) -> Self {
        Self {
            fs,
            dir: sd_root.join(MOVES_DIR),
            entries: RwLock::new(HashMap::new()),
            cursor: Mutex::new(LineCursor::new()),
        }
    }

    /// Durably append `entry` to the caller's own journal.
    pub fn append(&self, ctx: &StoreContext, entry: &MoveEntry) -> Result<()> {
        for field in [&entry.note_id, &entry.move_id, &entry.from_sd, &entry.to_sd] {
            if field.is_empty() {
                return Err(TideError::InvalidEntry("empty move journal field".to_string()));
            }
        }
        let path = lines::instance_log_path(&self.dir, ctx.instance_id());
        lines::append_line(
            self.fs.as_ref(),
            &path,
            &[
                &entry.note_id,
                &entry.move_id,
                &entry.from_sd,
                &entry.to_sd,
                &entry.timestamp.to_string(),
            ],
        )?;
        let mut entries = self.entries.write().unwrap_or_else(|e| e.into_inner());
        entries.insert(entry.move_id.clone(), entry.clone());
        Ok(())
    }

    /// Pick up lines completed since the last refresh.
    pub fn refresh(&self) -> Result<usize> {
        let raw = {
            let mut cursor = self.cursor.lock().unwrap_or_else(|e| e.into_inner());
            lines::consume_dir(self.fs.as_ref(), &self.dir, &mut cursor, None)?
        };
        let mut entries = self.entries.write().unwrap_or_else(|e| e.into_inner());
        let mut added = 0;
        for (instance, line) in raw {
            match MoveEntry::parse(&line) {
                Some(entry) => {
                    if entries.insert(entry.move_id.clone(), entry).is_none() {
                        added += 1;
                    }
                }
                None => log::warn!("Skipping malformed move line from {}: {:?}", instance, line),
            }
        }
        Ok(added)
    }

    /// The committed move with id `move_id`, if any.
    pub fn find(&self, move_id: &str) -> Result<Option<MoveEntry>> {
        self.refresh()?;
        let entries = self.entries.read().unwrap_or_else(|e| e.into_inner());
        Ok(entries.get(move_id).cloned())
    }

    /// The most recent committed move of `note_id`.
    pub fn latest_for(&self, note_id: &str) -> Result<Option<MoveEntry>> {
        self.refresh()?;
        Ok(self.latest_known(note_id))
    }

    /// [`latest_for`](Self::latest_for) without re-reading the journals.
    pub fn latest_known(&self, note_id: &str) -> Option<MoveEntry> {
        let entries = self.entries.read().unwrap_or_else(|e| e.into_inner());
        entries
            .values()
            .filter(|e| e.note_id == note_id)
            .fold(None, |best: Option<&MoveEntry>, e| match best {
                Some(b) if !e.supersedes(b) => Some(b),
                _ => Some(e),
            })
            .cloned()
    }

    /// Moves journaled by other instances since `cursor`.
    pub fn consume(&self, ctx: &StoreContext, cursor: &mut LineCursor) -> Result<Vec<MoveEntry>> {
        let raw = lines::consume_dir(self.fs.as_ref(), &self.dir, cursor, Some(ctx.instance_id()))?;
        let fresh: Vec<MoveEntry> = raw
            .into_iter()
            .filter_map(|(_, line)| MoveEntry::parse(&line))
            .collect();
        let mut entries = self.entries.write().unwrap_or_else(|e| e.into_inner());
        for entry in &fresh {
            entries.insert(entry.move_id.clone(), entry.clone());
        }
        Ok(fresh)
    }

    /// Every committed move known so far.
    pub fn entries(&self) -> Result<Vec<MoveEntry>> {
        self.refresh()?;
        let entries = self.entries.read().unwrap_or_else(|e| e.into_inner());
        let mut all: Vec<MoveEntry> = entries.values().cloned().collect();
        all.sort_by(|a, b| (a.timestamp, &a.move_id).cmp(&(b.timestamp, &b.move_id)));
        Ok(all)
    }
}

impl std::fmt::Debug for MoveJournal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MoveJournal")
            .field("dir", &self.dir)
            .finish_non_exhaustive()
    }
}

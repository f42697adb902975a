//! Permanent-deletion tombstones.
//!
//! `deleted/<instance>.log` holds `noteId|timestamp` lines. A note is deleted
//! if any instance's file names it; there is no way to undo a tombstone, so
//! nothing that creates or repairs notes may ever reuse a listed id.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, RwLock};

use serde::{Deserialize, Serialize};

use crate::context::StoreContext;
use crate::error::Result;
use crate::fs::FileSystem;
use crate::lines::{self, LineCursor};

/// Directory of deletion logs inside an SD root.
pub const DELETED_DIR: &str = "deleted";

/// A tombstone for one note.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeletionEntry {
    pub note_id: String,
    /// Milliseconds since the epoch.
    pub timestamp: i64,
}

impl DeletionEntry {
    /// Parse `noteId|timestamp`.
    pub fn parse(line: &str) -> Option<Self> {
        let (note_id, timestamp) = line.split_once('|')?;
        if note_id.is_empty() {
            return None;
        }
        Some(Self {
            note_id: note_id.to_string(),
            timestamp: timestamp.trim().parse().ok()?,
        })
    }
}

/// The union of every instance's deletion log in one SD.
///
/// Observed tombstones are cached; the cache only grows.
pub struct DeletionLog {
    fs: Arc<dyn FileSystem>,
    dir: PathBuf,
    known: RwLock<HashMap<String, i64>>,
    cursor: Mutex<LineCursor>,
}

impl DeletionLog {
    /// Deletion logs under `sd_root`.
    pub fn new(fs: Arc<dyn FileSystem>, sd_root: &Path) -> Self {
        Self {
            fs,
            dir: sd_root.join(DELETED_DIR),
            known: RwLock::new(HashMap::new()),
            cursor: Mutex::new(LineCursor::new()),
        }
    }

    /// Durably record that `note_id` was permanently deleted.
    pub fn record_deletion(&self, ctx: &StoreContext, note_id: &str, timestamp: i64) -> Result<()> {
        let path = lines::instance_log_path(&self.dir, ctx.instance_id());
        lines::append_line(self.fs.as_ref(), &path, &[note_id, &timestamp.to_string()])?;
        if let Ok(mut known) = self.known.write() {
            known.entry(note_id.to_string()).or_insert(timestamp);
        }
        log::info!("Recorded permanent deletion of note {}", note_id);
        Ok(())
    }

    /// Read newly completed lines from every file (own included).
    ///
    /// Returns the tombstones not seen before.
    pub fn refresh(&self) -> Result<Vec<DeletionEntry>> {
        let raw = {
            let mut cursor = self.cursor.lock().unwrap_or_else(|e| e.into_inner());
            lines::consume_dir(self.fs.as_ref(), &self.dir, &mut cursor, None)?
        };

        let mut fresh = Vec::new();
        let mut known = self.known.write().unwrap_or_else(|e| e.into_inner());
        for (file_instance, line) in raw {
            let Some(entry) = DeletionEntry::parse(&line) else {
                log::warn!("Skipping malformed deletion line from {}: {:?}", file_instance, line);
                continue;
            };
            if !known.contains_key(&entry.note_id) {
                known.insert(entry.note_id.clone(), entry.timestamp);
                fresh.push(entry);
            }
        }
        Ok(fresh)
    }

    /// Whether any instance has tombstoned `note_id`.
    pub fn is_deleted(&self, note_id: &str) -> Result<bool> {
        if self.is_known_deleted(note_id) {
            return Ok(true);
        }
        self.refresh()?;
        Ok(self.is_known_deleted(note_id))
    }

    /// Check the cached union without touching disk.
    pub fn is_known_deleted(&self, note_id: &str) -> bool {
        self.known
            .read()
            .map(|known| known.contains_key(note_id))
            .unwrap_or(false)
    }

    /// Every tombstone observed so far, after a refresh.
    pub fn deleted_ids(&self) -> Result<HashMap<String, i64>> {
        self.refresh()?;
        Ok(self
            .known
            .read()
            .map(|known| known.clone())
            .unwrap_or_default())
    }

    /// Tombstones appended by other instances since `cursor`.
    pub fn consume(&self, ctx: &StoreContext, cursor: &mut LineCursor) -> Result<Vec<DeletionEntry>> {
        let raw = lines::consume_dir(self.fs.as_ref(), &self.dir, cursor, Some(ctx.instance_id()))?;
        let entries: Vec<DeletionEntry> = raw
            .into_iter()
            .filter_map(|(_, line)| DeletionEntry::parse(&line))
            .collect();
        if let Ok(mut known) = self.known.write() {
            for entry in &entries {
                known.entry(entry.note_id.clone()).or_insert(entry.timestamp);
            }
        }
        Ok(entries)
    }
}

impl std::fmt::Debug for DeletionLog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeletionLog")
            .field("dir", &self.dir)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::InMemoryFileSystem;

    #[test]
    fn test_union_over_instances() {
        let fs = InMemoryFileSystem::new();
        let root = Path::new("/sd");
        let a = StoreContext::new("a");
        let b = StoreContext::new("b");

        DeletionLog::new(Arc::new(fs.clone()), root)
            .record_deletion(&a, "n1", 10)
            .unwrap();
        DeletionLog::new(Arc::new(fs.clone()), root)
            .record_deletion(&b, "n2", 20)
            .unwrap();

        let reader = DeletionLog::new(Arc::new(fs), root);
        assert!(reader.is_deleted("n1").unwrap());
        assert!(reader.is_deleted("n2").unwrap());
        assert!(!reader.is_deleted("n3").unwrap());
        assert_eq!(reader.deleted_ids().unwrap().len(), 2);
    }

    #[test]
    fn test_line_without_newline_is_not_a_deletion() {
        let fs = InMemoryFileSystem::new();
        let path = PathBuf::from("/sd/deleted/peer.log");
        fs.set_contents(&path, b"noteId|100");

        let log = DeletionLog::new(Arc::new(fs.clone()), Path::new("/sd"));
        assert!(!log.is_deleted("noteId").unwrap());

        fs.append(&path, b"\n").unwrap();
        assert!(log.is_deleted("noteId").unwrap());
    }

    #[test]
    fn test_consume_returns_only_other_instances() {
        let fs: Arc<dyn FileSystem> = Arc::new(InMemoryFileSystem::new());
        let log = DeletionLog::new(fs, Path::new("/sd"));
        let a = StoreContext::new("a");
        let b = StoreContext::new("b");
        log.record_deletion(&a, "n1", 1).unwrap();
        log.record_deletion(&b, "n2", 2).unwrap();

        let mut cursor = LineCursor::new();
        let seen = log.consume(&a, &mut cursor).unwrap();
        assert_eq!(
            seen,
            vec![DeletionEntry {
                note_id: "n2".to_string(),
                timestamp: 2
            }]
        );
    }
}

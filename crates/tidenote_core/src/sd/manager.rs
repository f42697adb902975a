//! Open storage directories and cross-SD moves.
//!
//! A move runs in three phases:
//!
//! 1. **stage**: write `incoming.json` and a full copy of the note into the
//!    destination SD. Readers ignore the copy while the marker is unmatched.
//! 2. **commit**: append the move entry to the destination journal, then to
//!    the source journal. Once one line is complete the move has happened.
//! 3. **finalize**: remove the source directory and the marker.
//!
//! [`SdManager::recover`] completes or undoes whatever a crash left behind.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, RwLock};

use serde::{Deserialize, Serialize};

use super::moves::MoveEntry;
use super::{IncomingMarker, SD_FILE, SdInfo, StorageDirectory};
use crate::context::StoreContext;
use crate::error::{Result, TideError};
use crate::events::{ChangeEvent, EventRegistry};
use crate::fs::FileSystem;
use crate::note::DEFAULT_COMPACTION_THRESHOLD;

/// Staged copies of other instances younger than this are left alone by
/// recovery; the owner may still be committing them.
pub const STALE_STAGING_MS: i64 = 10 * 60 * 1000;

/// A move whose destination copy is written but not yet committed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StagedMove {
    pub note_id: String,
    pub move_id: String,
    pub from_sd: String,
    pub to_sd: String,
    pub timestamp: i64,
}

/// What [`SdManager::recover`] did.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecoveryReport {
    /// Committed moves whose cleanup was completed.
    pub finalized: Vec<String>,
    /// Uncommitted staged copies that were removed.
    pub rolled_back: Vec<String>,
    /// Leftover copies removed because the journal places the note elsewhere.
    pub duplicates_removed: Vec<String>,
}

impl RecoveryReport {
    pub fn is_empty(&self) -> bool {
        self.finalized.is_empty() && self.rolled_back.is_empty() && self.duplicates_removed.is_empty()
    }
}

/// Every open SD of this process.
pub struct SdManager {
    fs: Arc<dyn FileSystem>,
    events: Arc<EventRegistry>,
    compaction_threshold: usize,
    sds: RwLock<BTreeMap<String, Arc<StorageDirectory>>>,
    /// Configured roots that could not be opened yet, with their names.
    deferred: Mutex<BTreeMap<PathBuf, String>>,
}

impl SdManager {
    pub fn new(fs: Arc<dyn FileSystem>, events: Arc<EventRegistry>) -> Self {
        Self {
            fs,
            events,
            compaction_threshold: DEFAULT_COMPACTION_THRESHOLD,
            sds: RwLock::new(BTreeMap::new()),
            deferred: Mutex::new(BTreeMap::new()),
        }
    }

    /// Compaction threshold handed to SDs opened from now on.
    pub fn with_compaction_threshold(mut self, threshold: usize) -> Self {
        self.compaction_threshold = threshold;
        self
    }

    pub fn fs(&self) -> &Arc<dyn FileSystem> {
        &self.fs
    }

    pub fn events(&self) -> &Arc<EventRegistry> {
        &self.events
    }

    fn register(&self, sd: StorageDirectory) -> Arc<StorageDirectory> {
        let sd = Arc::new(sd.with_compaction_threshold(self.compaction_threshold));
        let mut sds = self.sds.write().unwrap_or_else(|e| e.into_inner());
        Arc::clone(sds.entry(sd.id().to_string()).or_insert(sd))
    }

    /// Create a new SD at `root` and open it.
    pub fn create_sd(&self, root: &Path, name: &str) -> Result<Arc<StorageDirectory>> {
        let sd = StorageDirectory::create(Arc::clone(&self.fs), root, name, Arc::clone(&self.events))?;
        Ok(self.register(sd))
    }

    /// Open the existing SD at `root`.
    pub fn open_sd(&self, root: &Path) -> Result<Arc<StorageDirectory>> {
        let sd = StorageDirectory::open(Arc::clone(&self.fs), root, Arc::clone(&self.events))?;
        log::info!("Opened SD '{}' ({}) at {:?}", sd.name(), sd.id(), root);
        Ok(self.register(sd))
    }

    /// Open the SD at `root`, creating it with `name` if there is none yet.
    pub fn add_sd(&self, root: &Path, name: &str) -> Result<Arc<StorageDirectory>> {
        if self.fs.exists(&root.join(SD_FILE)) {
            self.open_sd(root)
        } else {
            self.create_sd(root, name)
        }
    }

    /// Remember a configured SD whose root cannot be reached right now.
    /// [`open_deferred`](Self::open_deferred) tries it again.
    pub fn defer_sd(&self, root: &Path, name: &str) {
        let mut deferred = self.deferred.lock().unwrap_or_else(|e| e.into_inner());
        deferred.insert(root.to_path_buf(), name.to_string());
    }

    /// Roots of configured SDs that are still waiting to be opened.
    pub fn deferred_roots(&self) -> Vec<PathBuf> {
        let deferred = self.deferred.lock().unwrap_or_else(|e| e.into_inner());
        deferred.keys().cloned().collect()
    }

    /// Open every deferred SD whose root is reachable again.
    pub fn open_deferred(&self) -> Vec<Arc<StorageDirectory>> {
        let waiting: Vec<(PathBuf, String)> = {
            let deferred = self.deferred.lock().unwrap_or_else(|e| e.into_inner());
            deferred.iter().map(|(root, name)| (root.clone(), name.clone())).collect()
        };

        let mut opened = Vec::new();
        for (root, name) in waiting {
            if !self.fs.is_dir(&root) {
                continue;
            }
            match self.add_sd(&root, &name) {
                Ok(sd) => {
                    log::info!("Storage directory {:?} is reachable again", root);
                    let mut deferred = self.deferred.lock().unwrap_or_else(|e| e.into_inner());
                    deferred.remove(&root);
                    opened.push(sd);
                }
                Err(e) => log::debug!("Storage directory {:?} still cannot be opened: {}", root, e),
            }
        }
        opened
    }

    /// Stop tracking an SD. Its files are left untouched.
    pub fn remove_sd(&self, sd_id: &str) -> Result<Arc<StorageDirectory>> {
        let mut sds = self.sds.write().unwrap_or_else(|e| e.into_inner());
        sds.remove(sd_id)
            .ok_or_else(|| TideError::SdNotFound(sd_id.to_string()))
    }

    pub fn get_sd(&self, sd_id: &str) -> Result<Arc<StorageDirectory>> {
        let sds = self.sds.read().unwrap_or_else(|e| e.into_inner());
        sds.get(sd_id)
            .cloned()
            .ok_or_else(|| TideError::SdNotFound(sd_id.to_string()))
    }

    /// Every open SD, ordered by id.
    pub fn sds(&self) -> Vec<Arc<StorageDirectory>> {
        let sds = self.sds.read().unwrap_or_else(|e| e.into_inner());
        sds.values().cloned().collect()
    }

    pub fn list_sds(&self) -> Vec<SdInfo> {
        self.sds().iter().map(|sd| sd.info()).collect()
    }

    /// The SD a note is currently visible in.
    pub fn locate_note(&self, note_id: &str) -> Result<Option<Arc<StorageDirectory>>> {
        for sd in self.sds() {
            if sd.notes().exists_on_disk(note_id) && sd.is_visible(note_id)? {
                return Ok(Some(sd));
            }
        }
        Ok(None)
    }

    // ==================== Moves ====================

    /// Move a note to another SD, into `target_folder` (root if `None`).
    ///
    /// Returns once the move is committed. Cleanup failures after the
    /// commit are logged and left for [`recover`](Self::recover).
    pub fn move_note(
        &self,
        ctx: &StoreContext,
        note_id: &str,
        from_sd: &str,
        to_sd: &str,
        target_folder: Option<&str>,
    ) -> Result<MoveEntry> {
        let staged = self.stage_move(ctx, note_id, from_sd, to_sd, target_folder)?;
        let entry = self.commit_move(ctx, &staged)?;
        if let Err(e) = self.finalize_move(&entry) {
            log::warn!("Move {} committed but cleanup failed: {}", entry.move_id, e);
        }
        self.events.emit(&ChangeEvent::NoteMoved {
            note_id: entry.note_id.clone(),
            from_sd: entry.from_sd.clone(),
            to_sd: entry.to_sd.clone(),
        });
        Ok(entry)
    }

    /// Phase one: write the marker and the destination copy.
    pub fn stage_move(
        &self,
        ctx: &StoreContext,
        note_id: &str,
        from_sd: &str,
        to_sd: &str,
        target_folder: Option<&str>,
    ) -> Result<StagedMove> {
        if from_sd == to_sd {
            return Err(TideError::InvalidEntry(format!(
                "note {} is already in SD {}",
                note_id, to_sd
            )));
        }
        let source = self.get_sd(from_sd)?;
        let dest = self.get_sd(to_sd)?;

        if !source.is_visible(note_id)? {
            return Err(TideError::NoteNotFound(note_id.to_string()));
        }
        let entry = source.notes().get(ctx, note_id)?;
        if let Some(folder) = target_folder
            && !dest.folders().contains(folder)
        {
            return Err(TideError::FolderNotFound(folder.to_string()));
        }
        if dest.notes().deletions().is_deleted(note_id)? {
            return Err(TideError::NoteDeleted(note_id.to_string()));
        }
        if dest.notes().exists_on_disk(note_id) {
            if dest.incoming_marker(note_id)?.is_none() && dest.is_visible(note_id)? {
                return Err(TideError::NoteExists(note_id.to_string()));
            }
            log::info!("Clearing leftover copy of note {} in SD {}", note_id, to_sd);
            dest.remove_note_dir(note_id)?;
        }

        // A later move of the same note must sort after every earlier one.
        let previous = [source.moves().latest_for(note_id)?, dest.moves().latest_for(note_id)?]
            .into_iter()
            .flatten()
            .map(|e| e.timestamp)
            .max();
        let now = chrono::Utc::now().timestamp_millis();
        let staged = StagedMove {
            note_id: note_id.to_string(),
            move_id: uuid::Uuid::new_v4().to_string(),
            from_sd: from_sd.to_string(),
            to_sd: to_sd.to_string(),
            timestamp: previous.map_or(now, |p| now.max(p + 1)),
        };
        dest.write_marker(
            note_id,
            &IncomingMarker {
                move_id: staged.move_id.clone(),
                from_sd: from_sd.to_string(),
                instance_id: ctx.instance_id().to_string(),
                created_at: staged.timestamp,
            },
        )?;
        entry.with_doc(|doc| dest.notes().write_copy(ctx, doc, target_folder))?;
        log::debug!("Staged move {} of note {} into SD {}", staged.move_id, note_id, to_sd);
        Ok(staged)
    }

    /// Phase two: journal the move. This is the commit point.
    pub fn commit_move(&self, ctx: &StoreContext, staged: &StagedMove) -> Result<MoveEntry> {
        let entry = MoveEntry {
            note_id: staged.note_id.clone(),
            move_id: staged.move_id.clone(),
            from_sd: staged.from_sd.clone(),
            to_sd: staged.to_sd.clone(),
            timestamp: staged.timestamp,
        };
        self.get_sd(&staged.to_sd)?.moves().append(ctx, &entry)?;
        match self.get_sd(&staged.from_sd) {
            Ok(source) => {
                if let Err(e) = source.moves().append(ctx, &entry) {
                    log::warn!("Failed to journal move {} in source SD: {}", entry.move_id, e);
                }
            }
            Err(e) => log::warn!("Source SD of move {} is gone: {}", entry.move_id, e),
        }
        log::info!(
            "Moved note {} from SD {} to SD {}",
            entry.note_id,
            entry.from_sd,
            entry.to_sd
        );
        Ok(entry)
    }

    /// Phase three: remove the source copy and the staging marker.
    pub fn finalize_move(&self, entry: &MoveEntry) -> Result<()> {
        if let Ok(source) = self.get_sd(&entry.from_sd) {
            source.remove_note_dir(&entry.note_id)?;
        }
        self.get_sd(&entry.to_sd)?.remove_marker(&entry.note_id)
    }

    // ==================== Recovery ====================

    /// Bring every open SD back to a consistent state after a crash.
    ///
    /// Run before the first sync pass.
    pub fn recover(&self, ctx: &StoreContext) -> Result<RecoveryReport> {
        let sds = self.sds();
        let by_id: HashMap<&str, &Arc<StorageDirectory>> =
            sds.iter().map(|sd| (sd.id(), sd)).collect();

        let mut committed: HashMap<String, MoveEntry> = HashMap::new();
        let mut latest: HashMap<String, MoveEntry> = HashMap::new();
        for sd in &sds {
            for entry in sd.moves().entries()? {
                match latest.get(&entry.note_id) {
                    Some(current) if !entry.supersedes(current) => {}
                    _ => {
                        latest.insert(entry.note_id.clone(), entry.clone());
                    }
                }
                committed.insert(entry.move_id.clone(), entry);
            }
        }

        let mut report = RecoveryReport::default();
        let now = chrono::Utc::now().timestamp_millis();

        for sd in &sds {
            for note_id in sd.notes().list_note_ids()? {
                let marker = match sd.incoming_marker(&note_id) {
                    Ok(Some(marker)) => marker,
                    Ok(None) => continue,
                    Err(e) => {
                        log::warn!("Unreadable staging marker of note {}: {}", note_id, e);
                        continue;
                    }
                };

                if let Some(entry) = committed.get(&marker.move_id) {
                    let still_current = latest
                        .get(&note_id)
                        .is_some_and(|l| l.to_sd != entry.from_sd);
                    if still_current && let Some(source) = by_id.get(entry.from_sd.as_str()) {
                        source.remove_note_dir(&note_id)?;
                    }
                    sd.remove_marker(&note_id)?;
                    log::info!("Recovery finalized move {} of note {}", marker.move_id, note_id);
                    report.finalized.push(note_id);
                } else if marker.instance_id == ctx.instance_id()
                    || now - marker.created_at > STALE_STAGING_MS
                {
                    sd.remove_note_dir(&note_id)?;
                    log::info!(
                        "Recovery rolled back uncommitted move {} of note {}",
                        marker.move_id,
                        note_id
                    );
                    report.rolled_back.push(note_id);
                } else {
                    log::debug!(
                        "Leaving in-flight move {} of note {} to instance {}",
                        marker.move_id,
                        note_id,
                        marker.instance_id
                    );
                }
            }
        }

        for (note_id, entry) in &latest {
            let Some(target) = by_id.get(entry.to_sd.as_str()) else {
                continue;
            };
            if !target.notes().exists_on_disk(note_id) {
                continue;
            }
            for sd in &sds {
                if sd.id() == entry.to_sd
                    || !sd.notes().exists_on_disk(note_id)
                    || sd.incoming_marker(note_id).ok().flatten().is_some()
                {
                    continue;
                }
                sd.remove_note_dir(note_id)?;
                log::info!(
                    "Recovery removed stale copy of note {} from SD {} (journal places it in {})",
                    note_id,
                    sd.id(),
                    entry.to_sd
                );
                report.duplicates_removed.push(note_id.clone());
            }
        }

        Ok(report)
    }
}

impl std::fmt::Debug for SdManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SdManager")
            .field("sds", &self.list_sds())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::InMemoryFileSystem;

    fn setup() -> (SdManager, String, String, StoreContext) {
        let fs: Arc<dyn FileSystem> = Arc::new(InMemoryFileSystem::new());
        let manager = SdManager::new(fs, Arc::new(EventRegistry::new()));
        let a = manager.create_sd(Path::new("/a"), "A").unwrap().id().to_string();
        let b = manager.create_sd(Path::new("/b"), "B").unwrap().id().to_string();
        (manager, a, b, StoreContext::new("inst-1"))
    }

    #[test]
    fn test_move_note_carries_content_and_target_folder() {
        let (manager, a, b, ctx) = setup();
        let sd_a = manager.get_sd(&a).unwrap();
        let sd_b = manager.get_sd(&b).unwrap();
        let note = sd_a.notes().create_note(&ctx, None).unwrap();
        sd_a.notes().set_content(&ctx, &note, "Travel plans").unwrap();
        let folder = sd_b.folders().create_folder(&ctx, "Trips", None).unwrap();

        let entry = manager.move_note(&ctx, &note, &a, &b, Some(&folder)).unwrap();
        assert_eq!(entry.to_sd, b);

        assert!(!sd_a.notes().exists_on_disk(&note));
        assert!(sd_b.incoming_marker(&note).unwrap().is_none());
        assert_eq!(sd_b.notes().content(&ctx, &note).unwrap(), "Travel plans");
        let summary = sd_b.notes().summary(&ctx, &note).unwrap();
        assert_eq!(summary.folder_id.as_deref(), Some(folder.as_str()));
        assert_eq!(manager.locate_note(&note).unwrap().unwrap().id(), b);
    }

    #[test]
    fn test_move_into_missing_folder_is_refused() {
        let (manager, a, b, ctx) = setup();
        let note = manager.get_sd(&a).unwrap().notes().create_note(&ctx, None).unwrap();
        assert!(matches!(
            manager.move_note(&ctx, &note, &a, &b, Some("nope")),
            Err(TideError::FolderNotFound(_))
        ));
        assert!(!manager.get_sd(&b).unwrap().notes().exists_on_disk(&note));
    }

    #[test]
    fn test_recover_rolls_back_own_uncommitted_stage() {
        let (manager, a, b, ctx) = setup();
        let note = manager.get_sd(&a).unwrap().notes().create_note(&ctx, None).unwrap();
        manager.stage_move(&ctx, &note, &a, &b, None).unwrap();

        let report = manager.recover(&ctx).unwrap();
        assert_eq!(report.rolled_back, vec![note.clone()]);
        assert!(!manager.get_sd(&b).unwrap().notes().exists_on_disk(&note));
        assert!(manager.get_sd(&a).unwrap().notes().exists_on_disk(&note));
    }

    #[test]
    fn test_recover_finalizes_committed_stage() {
        let (manager, a, b, ctx) = setup();
        let note = manager.get_sd(&a).unwrap().notes().create_note(&ctx, None).unwrap();
        let staged = manager.stage_move(&ctx, &note, &a, &b, None).unwrap();
        manager.commit_move(&ctx, &staged).unwrap();

        let report = manager.recover(&ctx).unwrap();
        assert_eq!(report.finalized, vec![note.clone()]);
        assert!(!manager.get_sd(&a).unwrap().notes().exists_on_disk(&note));
        assert!(manager.get_sd(&b).unwrap().is_visible(&note).unwrap());
    }

    #[test]
    fn test_other_instance_fresh_stage_is_left_alone() {
        let (manager, a, b, ctx) = setup();
        let other = StoreContext::new("inst-2");
        let note = manager.get_sd(&a).unwrap().notes().create_note(&other, None).unwrap();
        manager.stage_move(&other, &note, &a, &b, None).unwrap();

        let report = manager.recover(&ctx).unwrap();
        assert!(report.is_empty());
        assert!(manager.get_sd(&b).unwrap().notes().exists_on_disk(&note));
        assert!(!manager.get_sd(&b).unwrap().is_visible(&note).unwrap());
    }
}

//! Unified tidenote API.
//!
//! [`NoteService`] is the entry point for host applications. It owns the
//! open storage directories, the sync loop and the change registry, and
//! exposes note, folder and move operations addressed by SD id.
//!
//! # Example
//!
//! ```ignore
//! use tidenote_core::config::Config;
//! use tidenote_core::service::NoteService;
//!
//! let config = Config::load()?;
//! let service = NoteService::open(&config)?;
//! let sd = service.list_storage_dirs()[0].id.clone();
//! let note = service.create_note(&sd, None)?;
//! service.set_note_content(&sd, &note, "Groceries\nmilk, eggs")?;
//! ```

use std::path::Path;
use std::sync::Arc;

use tokio::task::JoinHandle;

use crate::config::{Config, SyncConfig};
use crate::context::StoreContext;
use crate::error::{Result, TideError};
use crate::events::{EventCallback, EventRegistry, SubscriptionId};
use crate::folder::FolderInfo;
use crate::fs::{FileSystem, RealFileSystem};
use crate::note::{CommentThread, CompactionResult, NoteSummary, TextRun};
use crate::sd::{MoveEntry, RecoveryReport, SdInfo, SdManager, StorageDirectory};
use crate::sync::{PassReport, SyncEngine, SyncOrchestrator, SyncStatus};

/// The main tidenote instance.
pub struct NoteService {
    ctx: StoreContext,
    manager: Arc<SdManager>,
    events: Arc<EventRegistry>,
    orchestrator: SyncOrchestrator,
}

impl NoteService {
    /// Create a service with no storage directories.
    pub fn new(fs: Arc<dyn FileSystem>, ctx: StoreContext, sync: SyncConfig) -> Self {
        let events = Arc::new(EventRegistry::new());
        let manager = Arc::new(
            SdManager::new(fs, Arc::clone(&events)).with_compaction_threshold(sync.compaction_threshold),
        );
        let engine = Arc::new(SyncEngine::new(Arc::clone(&manager), ctx.clone(), sync));
        Self {
            ctx,
            manager,
            events,
            orchestrator: SyncOrchestrator::new(engine),
        }
    }

    /// Open every configured SD on the real filesystem and run recovery.
    pub fn open(config: &Config) -> Result<Self> {
        Self::open_with_fs(Arc::new(RealFileSystem), config)
    }

    /// [`open`](Self::open) over any filesystem.
    ///
    /// SDs that cannot be reached never fail startup: they are reported as
    /// degraded and opened by the first sync pass that finds them again.
    /// A failed recovery is logged and retried on the next start.
    pub fn open_with_fs(fs: Arc<dyn FileSystem>, config: &Config) -> Result<Self> {
        let service = Self::new(
            fs,
            StoreContext::new(config.instance_id.clone()),
            config.sync.clone(),
        );
        for sd in &config.storage_dirs {
            if !service.manager.fs().is_dir(&sd.path) {
                log::warn!("Storage directory {:?} is not accessible; will retry", sd.path);
                service.manager.defer_sd(&sd.path, &sd.name);
                continue;
            }
            match service.manager.add_sd(&sd.path, &sd.name) {
                Ok(opened) => log::debug!("Storage directory {} ready", opened.id()),
                Err(e) => {
                    log::warn!("Cannot open storage directory {:?}: {}; will retry", sd.path, e);
                    service.manager.defer_sd(&sd.path, &sd.name);
                }
            }
        }
        match service.recover() {
            Ok(report) if !report.is_empty() => log::info!("Startup recovery: {:?}", report),
            Ok(_) => {}
            Err(e) => log::warn!("Startup recovery failed: {}", e),
        }
        Ok(service)
    }

    pub fn context(&self) -> &StoreContext {
        &self.ctx
    }

    pub fn manager(&self) -> &Arc<SdManager> {
        &self.manager
    }

    fn sd(&self, sd_id: &str) -> Result<Arc<StorageDirectory>> {
        self.manager.get_sd(sd_id)
    }

    /// The SD, provided `note_id` currently lives in it.
    fn sd_with_note(&self, sd_id: &str, note_id: &str) -> Result<Arc<StorageDirectory>> {
        let sd = self.sd(sd_id)?;
        if !sd.notes().exists_on_disk(note_id) && sd.notes().cached(note_id).is_none() {
            if sd.notes().deletions().is_deleted(note_id)? {
                return Err(TideError::NoteDeleted(note_id.to_string()));
            }
            return Err(TideError::NoteNotFound(note_id.to_string()));
        }
        if !sd.is_visible(note_id)? {
            return Err(TideError::NoteNotFound(note_id.to_string()));
        }
        Ok(sd)
    }

    // ==================== Storage directories ====================

    /// Open (or create) the SD at `root` and start watching it.
    pub fn add_storage_dir(&self, root: &Path, name: &str) -> Result<SdInfo> {
        let sd = self.manager.add_sd(root, name)?;
        self.orchestrator.watch(&sd);
        Ok(sd.info())
    }

    pub fn remove_storage_dir(&self, sd_id: &str) -> Result<SdInfo> {
        let sd = self.manager.remove_sd(sd_id)?;
        self.orchestrator.unwatch(sd.root());
        Ok(sd.info())
    }

    pub fn list_storage_dirs(&self) -> Vec<SdInfo> {
        self.manager.list_sds()
    }

    /// Finish or undo cross-SD moves interrupted by a crash.
    pub fn recover(&self) -> Result<RecoveryReport> {
        self.manager.recover(&self.ctx)
    }

    // ==================== Sync ====================

    /// Watch every open SD and start the background loop. Must be called
    /// from within a tokio runtime.
    pub fn start_sync(&self) -> Result<JoinHandle<()>> {
        for sd in self.manager.sds() {
            self.orchestrator.watch(&sd);
        }
        self.orchestrator.start()
    }

    /// Run one pass on the calling thread.
    pub fn sync_now(&self) -> PassReport {
        self.orchestrator.engine().run_pass()
    }

    pub fn stop_sync(&self) {
        self.orchestrator.shutdown();
    }

    pub fn orchestrator(&self) -> &SyncOrchestrator {
        &self.orchestrator
    }

    pub fn sync_status(&self) -> SyncStatus {
        self.orchestrator.engine().status()
    }

    // ==================== Notes ====================

    /// Create a note in `folder_id` (root if `None`). Returns its id.
    pub fn create_note(&self, sd_id: &str, folder_id: Option<&str>) -> Result<String> {
        let sd = self.sd(sd_id)?;
        if let Some(folder) = folder_id
            && !sd.folders().contains(folder)
        {
            return Err(TideError::FolderNotFound(folder.to_string()));
        }
        sd.notes().create_note(&self.ctx, folder_id)
    }

    pub fn get_note(&self, sd_id: &str, note_id: &str) -> Result<NoteSummary> {
        self.sd_with_note(sd_id, note_id)?
            .notes()
            .summary(&self.ctx, note_id)
    }

    pub fn note_content(&self, sd_id: &str, note_id: &str) -> Result<String> {
        self.sd_with_note(sd_id, note_id)?
            .notes()
            .content(&self.ctx, note_id)
    }

    /// Content split into runs of equal formatting.
    pub fn note_runs(&self, sd_id: &str, note_id: &str) -> Result<Vec<TextRun>> {
        self.sd_with_note(sd_id, note_id)?
            .notes()
            .formatted_runs(&self.ctx, note_id)
    }

    /// Replace the whole content, recording only the changed span.
    pub fn set_note_content(&self, sd_id: &str, note_id: &str, text: &str) -> Result<Option<u64>> {
        self.sd_with_note(sd_id, note_id)?
            .notes()
            .set_content(&self.ctx, note_id, text)
    }

    pub fn insert_text(&self, sd_id: &str, note_id: &str, index: u32, text: &str) -> Result<Option<u64>> {
        self.sd_with_note(sd_id, note_id)?
            .notes()
            .insert_text(&self.ctx, note_id, index, text)
    }

    pub fn delete_text(&self, sd_id: &str, note_id: &str, index: u32, len: u32) -> Result<Option<u64>> {
        self.sd_with_note(sd_id, note_id)?
            .notes()
            .delete_text(&self.ctx, note_id, index, len)
    }

    /// Turn a formatting mark (e.g. `bold`) on or off over a character range.
    pub fn format_text(
        &self,
        sd_id: &str,
        note_id: &str,
        index: u32,
        len: u32,
        mark: &str,
        on: bool,
    ) -> Result<Option<u64>> {
        self.sd_with_note(sd_id, note_id)?
            .notes()
            .format_text(&self.ctx, note_id, index, len, mark, on)
    }

    /// Set an explicit title, or clear it to derive one from the content.
    pub fn set_note_title(&self, sd_id: &str, note_id: &str, title: Option<&str>) -> Result<Option<u64>> {
        self.sd_with_note(sd_id, note_id)?
            .notes()
            .set_title(&self.ctx, note_id, title)
    }

    pub fn set_note_pinned(&self, sd_id: &str, note_id: &str, pinned: bool) -> Result<Option<u64>> {
        self.sd_with_note(sd_id, note_id)?
            .notes()
            .set_pinned(&self.ctx, note_id, pinned)
    }

    /// Move a note to another folder of the same SD (root if `None`).
    pub fn move_note_to_folder(
        &self,
        sd_id: &str,
        note_id: &str,
        folder_id: Option<&str>,
    ) -> Result<Option<u64>> {
        let sd = self.sd_with_note(sd_id, note_id)?;
        if let Some(folder) = folder_id
            && !sd.folders().contains(folder)
        {
            return Err(TideError::FolderNotFound(folder.to_string()));
        }
        sd.notes().set_folder(&self.ctx, note_id, folder_id)
    }

    /// Move a note into another SD.
    pub fn move_note_to_sd(
        &self,
        note_id: &str,
        from_sd: &str,
        to_sd: &str,
        folder_id: Option<&str>,
    ) -> Result<MoveEntry> {
        self.manager
            .move_note(&self.ctx, note_id, from_sd, to_sd, folder_id)
    }

    /// Soft-delete: the note moves to the recently-deleted list.
    pub fn delete_note(&self, sd_id: &str, note_id: &str) -> Result<Option<u64>> {
        self.sd_with_note(sd_id, note_id)?
            .notes()
            .soft_delete(&self.ctx, note_id)
    }

    pub fn restore_note(&self, sd_id: &str, note_id: &str) -> Result<Option<u64>> {
        self.sd_with_note(sd_id, note_id)?
            .notes()
            .restore(&self.ctx, note_id)
    }

    /// Remove a note everywhere. Its id can never be used again.
    pub fn permanently_delete_note(&self, sd_id: &str, note_id: &str) -> Result<()> {
        self.sd_with_note(sd_id, note_id)?
            .notes()
            .permanently_delete(&self.ctx, note_id)
    }

    /// Live notes of an SD: pinned first, then most recently modified.
    pub fn list_notes(&self, sd_id: &str) -> Result<Vec<NoteSummary>> {
        let mut notes: Vec<NoteSummary> = self
            .sd(sd_id)?
            .summaries(&self.ctx)?
            .into_iter()
            .filter(|n| n.deleted_at.is_none())
            .collect();
        notes.sort_by(|a, b| {
            b.pinned
                .cmp(&a.pinned)
                .then_with(|| b.modified_at.cmp(&a.modified_at))
                .then_with(|| a.id.cmp(&b.id))
        });
        Ok(notes)
    }

    /// Live notes directly in `folder_id` (root if `None`).
    ///
    /// Notes whose folder was deleted or never arrived are listed at the root.
    pub fn list_notes_in_folder(&self, sd_id: &str, folder_id: Option<&str>) -> Result<Vec<NoteSummary>> {
        let sd = self.sd(sd_id)?;
        let folders = sd.folders();
        Ok(self
            .list_notes(sd_id)?
            .into_iter()
            .filter(|n| {
                let effective = n.folder_id.as_deref().filter(|f| folders.contains(f));
                effective == folder_id
            })
            .collect())
    }

    /// Soft-deleted notes, most recently deleted first.
    pub fn recently_deleted(&self, sd_id: &str) -> Result<Vec<NoteSummary>> {
        let mut notes: Vec<NoteSummary> = self
            .sd(sd_id)?
            .summaries(&self.ctx)?
            .into_iter()
            .filter(|n| n.deleted_at.is_some())
            .collect();
        notes.sort_by(|a, b| b.deleted_at.cmp(&a.deleted_at).then_with(|| a.id.cmp(&b.id)));
        Ok(notes)
    }

    /// Snapshot a note and drop this instance's covered logs.
    pub fn compact_note(&self, sd_id: &str, note_id: &str) -> Result<CompactionResult> {
        self.sd_with_note(sd_id, note_id)?
            .notes()
            .compact(&self.ctx, note_id)
    }

    // ==================== Comments ====================

    pub fn comments(&self, sd_id: &str, note_id: &str) -> Result<Vec<CommentThread>> {
        self.sd_with_note(sd_id, note_id)?
            .notes()
            .comments(&self.ctx, note_id)
    }

    /// Start a thread over characters `start..end`. Returns the thread id.
    pub fn add_comment(
        &self,
        sd_id: &str,
        note_id: &str,
        author: &str,
        body: &str,
        start: u32,
        end: u32,
    ) -> Result<String> {
        self.sd_with_note(sd_id, note_id)?
            .notes()
            .add_comment(&self.ctx, note_id, author, body, start, end)
    }

    pub fn reply_to_comment(
        &self,
        sd_id: &str,
        note_id: &str,
        thread_id: &str,
        author: &str,
        body: &str,
    ) -> Result<String> {
        self.sd_with_note(sd_id, note_id)?
            .notes()
            .reply_to_comment(&self.ctx, note_id, thread_id, author, body)
    }

    pub fn resolve_comment(
        &self,
        sd_id: &str,
        note_id: &str,
        thread_id: &str,
        resolved: bool,
    ) -> Result<Option<u64>> {
        self.sd_with_note(sd_id, note_id)?
            .notes()
            .resolve_comment(&self.ctx, note_id, thread_id, resolved)
    }

    pub fn delete_comment(&self, sd_id: &str, note_id: &str, thread_id: &str) -> Result<Option<u64>> {
        self.sd_with_note(sd_id, note_id)?
            .notes()
            .delete_comment(&self.ctx, note_id, thread_id)
    }

    // ==================== Folders ====================

    pub fn create_folder(&self, sd_id: &str, name: &str, parent: Option<&str>) -> Result<String> {
        self.sd(sd_id)?.folders().create_folder(&self.ctx, name, parent)
    }

    pub fn rename_folder(&self, sd_id: &str, folder_id: &str, name: &str) -> Result<()> {
        self.sd(sd_id)?.folders().rename_folder(&self.ctx, folder_id, name)
    }

    pub fn move_folder(&self, sd_id: &str, folder_id: &str, parent: Option<&str>) -> Result<()> {
        self.sd(sd_id)?.folders().move_folder(&self.ctx, folder_id, parent)
    }

    pub fn delete_folder(&self, sd_id: &str, folder_id: &str) -> Result<()> {
        self.sd(sd_id)?.folders().delete_folder(&self.ctx, folder_id)
    }

    pub fn reorder_folder(&self, sd_id: &str, folder_id: &str, order: i64) -> Result<()> {
        self.sd(sd_id)?.folders().reorder_folder(&self.ctx, folder_id, order)
    }

    pub fn list_folders(&self, sd_id: &str) -> Result<Vec<FolderInfo>> {
        Ok(self.sd(sd_id)?.folders().list_folders())
    }

    pub fn folder_children(&self, sd_id: &str, parent: Option<&str>) -> Result<Vec<FolderInfo>> {
        Ok(self.sd(sd_id)?.folders().children_of(parent))
    }

    /// Folder names from the root down to `folder_id`.
    pub fn folder_path(&self, sd_id: &str, folder_id: &str) -> Result<Vec<String>> {
        self.sd(sd_id)?.folders().path_of(folder_id)
    }

    // ==================== Change notifications ====================

    pub fn subscribe(&self, callback: EventCallback) -> SubscriptionId {
        self.events.subscribe(callback)
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.events.unsubscribe(id)
    }
}

impl std::fmt::Debug for NoteService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NoteService")
            .field("instance", &self.ctx.instance_id())
            .field("manager", &self.manager)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::ChangeEvent;
    use crate::fs::InMemoryFileSystem;
    use std::sync::Mutex;

    fn service() -> (NoteService, String) {
        let fs: Arc<dyn FileSystem> = Arc::new(InMemoryFileSystem::new());
        let service = NoteService::new(fs, StoreContext::new("me"), SyncConfig::default());
        let sd = service.add_storage_dir(Path::new("/notes"), "Personal").unwrap();
        (service, sd.id)
    }

    #[test]
    fn test_soft_delete_moves_note_to_recently_deleted() {
        let (service, sd) = service();
        let keep = service.create_note(&sd, None).unwrap();
        let gone = service.create_note(&sd, None).unwrap();
        service.delete_note(&sd, &gone).unwrap();

        let live: Vec<String> = service.list_notes(&sd).unwrap().into_iter().map(|n| n.id).collect();
        assert_eq!(live, vec![keep]);
        let deleted: Vec<String> = service
            .recently_deleted(&sd)
            .unwrap()
            .into_iter()
            .map(|n| n.id)
            .collect();
        assert_eq!(deleted, vec![gone.clone()]);

        service.restore_note(&sd, &gone).unwrap();
        assert!(service.recently_deleted(&sd).unwrap().is_empty());
    }

    #[test]
    fn test_notes_in_deleted_folder_list_at_root() {
        let (service, sd) = service();
        let folder = service.create_folder(&sd, "Work", None).unwrap();
        let note = service.create_note(&sd, Some(&folder)).unwrap();
        assert_eq!(service.list_notes_in_folder(&sd, Some(&folder)).unwrap().len(), 1);
        assert!(service.list_notes_in_folder(&sd, None).unwrap().is_empty());

        service.delete_folder(&sd, &folder).unwrap();
        let root: Vec<String> = service
            .list_notes_in_folder(&sd, None)
            .unwrap()
            .into_iter()
            .map(|n| n.id)
            .collect();
        assert_eq!(root, vec![note]);
    }

    #[test]
    fn test_unsubscribed_callback_stops_receiving() {
        let (service, sd) = service();
        let count = Arc::new(Mutex::new(0usize));
        let sink = Arc::clone(&count);
        let id = service.subscribe(Arc::new(move |e: &ChangeEvent| {
            if matches!(e, ChangeEvent::NoteCreated { .. }) {
                *sink.lock().unwrap() += 1;
            }
        }));
        service.create_note(&sd, None).unwrap();
        assert!(service.unsubscribe(id));
        service.create_note(&sd, None).unwrap();
        assert_eq!(*count.lock().unwrap(), 1);
    }

    #[test]
    fn test_pinned_notes_list_first() {
        let (service, sd) = service();
        let a = service.create_note(&sd, None).unwrap();
        let b = service.create_note(&sd, None).unwrap();
        service.set_note_pinned(&sd, &a, true).unwrap();
        assert_eq!(service.list_notes(&sd).unwrap()[0].id, a);
        assert_ne!(a, b);
    }

    #[test]
    fn test_unreachable_storage_dir_is_degraded_then_opened() {
        let fs: Arc<dyn FileSystem> = Arc::new(InMemoryFileSystem::new());
        let mut config = Config::default();
        config.add_storage_dir("/present".into(), "Here");
        fs.create_dir_all(Path::new("/present")).unwrap();
        config.storage_dirs.push(crate::config::StorageDirConfig {
            path: "/missing/sd".into(),
            name: "Gone".into(),
        });

        let service = NoteService::open_with_fs(Arc::clone(&fs), &config).unwrap();
        let sds = service.list_storage_dirs();
        assert_eq!(sds.len(), 1);
        assert_eq!(sds[0].name, "Here");
        assert!(!fs.exists(Path::new("/missing/sd")));

        let report = service.sync_now();
        assert_eq!(report.degraded, 1);
        assert_eq!(service.sync_status().degraded_sds, vec!["/missing/sd".to_string()]);
        assert!(!service.sync_status().is_healthy());

        // The drive comes back.
        fs.create_dir_all(Path::new("/missing/sd")).unwrap();
        let report = service.sync_now();
        assert_eq!(report.degraded, 0);
        assert!(service.sync_status().degraded_sds.is_empty());
        let mut names: Vec<String> = service.list_storage_dirs().into_iter().map(|sd| sd.name).collect();
        names.sort();
        assert_eq!(names, vec!["Gone".to_string(), "Here".to_string()]);
    }
}

//! Storage directories.
//!
//! An SD is a self-contained root holding notes, folders and the
//! line-oriented logs. Several SDs can be open at once; a note lives in
//! exactly one of them and moves between them through [`SdManager::move_note`].
//!
//! ```text
//! <root>/sd.json
//! <root>/notes/<note>/...
//! <root>/folders/logs/...
//! <root>/activity/<instance>.log
//! <root>/deleted/<instance>.log
//! <root>/moves/<instance>.log
//! ```

pub mod manager;
pub mod moves;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use ts_rs::TS;

use crate::activity::ACTIVITY_DIR;
use crate::deletion::DELETED_DIR;
use crate::error::{Result, TideError};
use crate::events::EventRegistry;
use crate::folder::{FOLDERS_DIR, FolderTree};
use crate::fs::FileSystem;
use crate::note::{INCOMING_MARKER, LOGS_DIR, NOTES_DIR, NoteStore, NoteSummary};

pub use manager::{RecoveryReport, SdManager};
pub use moves::{MOVES_DIR, MoveEntry, MoveJournal};

/// Identity file at the root of every SD.
pub const SD_FILE: &str = "sd.json";

/// Contents of `sd.json`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SdIdentity {
    pub id: String,
    pub name: String,
    pub created_at: i64,
}

/// Public description of an open SD.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, TS)]
#[ts(export, export_to = "bindings/")]
pub struct SdInfo {
    pub id: String,
    pub name: String,
    pub root: PathBuf,
    pub created_at: i64,
}

/// Staging marker written into a destination note directory while a
/// cross-SD move is in flight.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IncomingMarker {
    pub move_id: String,
    pub from_sd: String,
    /// Instance performing the move.
    pub instance_id: String,
    pub created_at: i64,
}

/// Read `sd.json` under `root`.
pub fn read_identity(fs: &dyn FileSystem, root: &Path) -> Result<SdIdentity> {
    let path = root.join(SD_FILE);
    let content = fs
        .read_to_string(&path)
        .map_err(|source| TideError::FileRead { path, source })?;
    Ok(serde_json::from_str(&content)?)
}

/// One open storage directory: its notes, folders and move journal.
pub struct StorageDirectory {
    identity: SdIdentity,
    root: PathBuf,
    fs: Arc<dyn FileSystem>,
    notes: NoteStore,
    folders: FolderTree,
    moves: MoveJournal,
}

impl StorageDirectory {
    /// Create a new SD at `root`. Fails if `root` already holds one.
    pub fn create(
        fs: Arc<dyn FileSystem>,
        root: &Path,
        name: &str,
        events: Arc<EventRegistry>,
    ) -> Result<Self> {
        let identity_path = root.join(SD_FILE);
        if fs.exists(&identity_path) {
            return Err(TideError::SdAlreadyExists(root.to_path_buf()));
        }
        for dir in [
            root.join(NOTES_DIR),
            root.join(FOLDERS_DIR).join(LOGS_DIR),
            root.join(ACTIVITY_DIR),
            root.join(DELETED_DIR),
            root.join(MOVES_DIR),
        ] {
            fs.create_dir_all(&dir)
                .map_err(|source| TideError::FileWrite { path: dir, source })?;
        }

        let identity = SdIdentity {
            id: uuid::Uuid::new_v4().to_string(),
            name: name.to_string(),
            created_at: chrono::Utc::now().timestamp_millis(),
        };
        let json = serde_json::to_string_pretty(&identity)?;
        fs.write_atomic(&identity_path, json.as_bytes())
            .map_err(|source| TideError::FileWrite {
                path: identity_path,
                source,
            })?;
        log::info!("Created SD '{}' ({}) at {:?}", identity.name, identity.id, root);
        Self::from_identity(fs, root, identity, events)
    }

    /// Open the existing SD at `root`.
    pub fn open(fs: Arc<dyn FileSystem>, root: &Path, events: Arc<EventRegistry>) -> Result<Self> {
        if !fs.is_dir(root) {
            return Err(TideError::SdInaccessible(root.to_path_buf()));
        }
        if !fs.exists(&root.join(SD_FILE)) {
            return Err(TideError::SdNotFound(root.display().to_string()));
        }
        let identity = read_identity(fs.as_ref(), root)?;
        Self::from_identity(fs, root, identity, events)
    }

    fn from_identity(
        fs: Arc<dyn FileSystem>,
        root: &Path,
        identity: SdIdentity,
        events: Arc<EventRegistry>,
    ) -> Result<Self> {
        let notes = NoteStore::new(Arc::clone(&fs), identity.id.clone(), root, Arc::clone(&events));
        let folders = FolderTree::load(Arc::clone(&fs), identity.id.clone(), root, events)?;
        let moves = MoveJournal::new(Arc::clone(&fs), root);
        Ok(Self {
            identity,
            root: root.to_path_buf(),
            fs,
            notes,
            folders,
            moves,
        })
    }

    /// Replace the automatic compaction threshold of the note store.
    pub fn with_compaction_threshold(mut self, threshold: usize) -> Self {
        self.notes = self.notes.with_compaction_threshold(threshold);
        self
    }

    pub fn id(&self) -> &str {
        &self.identity.id
    }

    pub fn name(&self) -> &str {
        &self.identity.name
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn info(&self) -> SdInfo {
        SdInfo {
            id: self.identity.id.clone(),
            name: self.identity.name.clone(),
            root: self.root.clone(),
            created_at: self.identity.created_at,
        }
    }

    pub fn notes(&self) -> &NoteStore {
        &self.notes
    }

    pub fn folders(&self) -> &FolderTree {
        &self.folders
    }

    pub fn moves(&self) -> &MoveJournal {
        &self.moves
    }

    /// Whether the root can currently be reached.
    pub fn is_accessible(&self) -> bool {
        self.fs.is_dir(&self.root)
    }

    fn marker_path(&self, note_id: &str) -> PathBuf {
        self.notes.note_dir(note_id).join(INCOMING_MARKER)
    }

    /// The staging marker of a note, if a move into this SD is in flight.
    pub fn incoming_marker(&self, note_id: &str) -> Result<Option<IncomingMarker>> {
        let path = self.marker_path(note_id);
        if !self.fs.exists(&path) {
            return Ok(None);
        }
        let content = self
            .fs
            .read_to_string(&path)
            .map_err(|source| TideError::FileRead { path, source })?;
        Ok(Some(serde_json::from_str(&content)?))
    }

    pub(crate) fn write_marker(&self, note_id: &str, marker: &IncomingMarker) -> Result<()> {
        let path = self.marker_path(note_id);
        let json = serde_json::to_string(marker)?;
        self.fs
            .write_atomic(&path, json.as_bytes())
            .map_err(|source| TideError::FileWrite { path, source })
    }

    pub(crate) fn remove_marker(&self, note_id: &str) -> Result<()> {
        let path = self.marker_path(note_id);
        if !self.fs.exists(&path) {
            return Ok(());
        }
        self.fs
            .delete_file(&path)
            .map_err(|source| TideError::FileWrite { path, source })
    }

    /// Remove a note directory that belongs elsewhere.
    pub(crate) fn remove_note_dir(&self, note_id: &str) -> Result<()> {
        self.notes.evict(note_id);
        let dir = self.notes.note_dir(note_id);
        if !self.fs.is_dir(&dir) {
            return Ok(());
        }
        self.fs
            .remove_dir_all(&dir)
            .map_err(|source| TideError::FileWrite { path: dir, source })
    }

    /// Whether a note stored here is currently part of this SD.
    ///
    /// Uncommitted incoming copies are hidden, as are notes whose latest
    /// committed move points at another SD.
    pub fn is_visible(&self, note_id: &str) -> Result<bool> {
        if let Some(marker) = self.incoming_marker(note_id)? {
            match self.moves.find(&marker.move_id)? {
                Some(entry) if entry.to_sd == self.identity.id => {}
                _ => return Ok(false),
            }
        }
        match self.moves.latest_for(note_id)? {
            Some(latest) => Ok(latest.to_sd == self.identity.id),
            None => Ok(true),
        }
    }

    /// Ids of every visible note.
    pub fn visible_note_ids(&self) -> Result<Vec<String>> {
        let mut visible = Vec::new();
        for note_id in self.notes.list_note_ids()? {
            if self.is_visible(&note_id)? {
                visible.push(note_id);
            }
        }
        Ok(visible)
    }

    /// Summaries of every visible note, soft-deleted ones included.
    ///
    /// Notes that fail to load are skipped with a warning.
    pub fn summaries(&self, ctx: &crate::context::StoreContext) -> Result<Vec<NoteSummary>> {
        let mut summaries = Vec::new();
        for note_id in self.visible_note_ids()? {
            match self.notes.summary(ctx, &note_id) {
                Ok(summary) => summaries.push(summary),
                Err(e) => log::warn!("Skipping note {} in listing: {}", note_id, e),
            }
        }
        Ok(summaries)
    }
}

impl std::fmt::Debug for StorageDirectory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StorageDirectory")
            .field("id", &self.identity.id)
            .field("name", &self.identity.name)
            .field("root", &self.root)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::StoreContext;
    use crate::fs::InMemoryFileSystem;

    fn fs() -> Arc<dyn FileSystem> {
        Arc::new(InMemoryFileSystem::new())
    }

    #[test]
    fn test_create_then_open_keeps_identity() {
        let fs = fs();
        let events = Arc::new(EventRegistry::new());
        let created =
            StorageDirectory::create(Arc::clone(&fs), Path::new("/sd1"), "Personal", Arc::clone(&events))
                .unwrap();
        assert!(fs.is_dir(Path::new("/sd1/moves")));

        let opened = StorageDirectory::open(Arc::clone(&fs), Path::new("/sd1"), events).unwrap();
        assert_eq!(opened.info(), created.info());
        assert_eq!(opened.name(), "Personal");
    }

    #[test]
    fn test_create_refuses_existing_sd() {
        let fs = fs();
        let events = Arc::new(EventRegistry::new());
        StorageDirectory::create(Arc::clone(&fs), Path::new("/sd1"), "a", Arc::clone(&events)).unwrap();
        assert!(matches!(
            StorageDirectory::create(fs, Path::new("/sd1"), "b", events),
            Err(TideError::SdAlreadyExists(_))
        ));
    }

    #[test]
    fn test_open_missing_root_is_inaccessible() {
        let err = StorageDirectory::open(fs(), Path::new("/nowhere"), Arc::new(EventRegistry::new()))
            .unwrap_err();
        assert!(matches!(err, TideError::SdInaccessible(_)));
    }

    #[test]
    fn test_uncommitted_incoming_copy_is_hidden() {
        let fs = fs();
        let sd = StorageDirectory::create(
            Arc::clone(&fs),
            Path::new("/sd1"),
            "a",
            Arc::new(EventRegistry::new()),
        )
        .unwrap();
        let ctx = StoreContext::new("inst-a");
        let id = sd.notes().create_note(&ctx, None).unwrap();
        assert_eq!(sd.visible_note_ids().unwrap(), vec![id.clone()]);

        sd.write_marker(
            &id,
            &IncomingMarker {
                move_id: "m1".into(),
                from_sd: "other".into(),
                instance_id: "inst-a".into(),
                created_at: 0,
            },
        )
        .unwrap();
        assert!(sd.visible_note_ids().unwrap().is_empty());

        sd.moves()
            .append(
                &ctx,
                &MoveEntry {
                    note_id: id.clone(),
                    move_id: "m1".into(),
                    from_sd: "other".into(),
                    to_sd: sd.id().to_string(),
                    timestamp: 1,
                },
            )
            .unwrap();
        assert_eq!(sd.visible_note_ids().unwrap(), vec![id]);
    }
}

//! Folder tree of a storage directory.
//!
//! Folders form a flat map keyed by id; every folder carries its own LWW
//! registers (name, parent, deleted, order). Renaming or moving a folder
//! writes only that folder's record, so concurrent edits to siblings and
//! ancestors never interfere. The tree is rebuilt from `folders/logs/`,
//! which uses the same framed log format as notes.
//!
//! Cycles are refused when a move is made locally. Two concurrent moves can
//! still form one after merging; readers then treat the folder in the cycle
//! whose parent write has the greatest stamp as a root.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, RwLock};

use serde::{Deserialize, Serialize};
use ts_rs::TS;

use crate::clock::Stamp;
use crate::context::StoreContext;
use crate::crdt_log::{self, LogRecord, LogWriter};
use crate::error::{Result, TideError};
use crate::events::{ChangeEvent, ChangeOrigin, EventRegistry};
use crate::fs::FileSystem;
use crate::register::LwwRegister;

/// Folder directory inside an SD root.
pub const FOLDERS_DIR: &str = "folders";

/// A single folder field write.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "field", content = "value", rename_all = "snake_case")]
pub enum FolderField {
    Name(String),
    Parent(Option<String>),
    Deleted(bool),
    Order(i64),
}

/// Payload of one folder log record: writes to one folder's registers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FolderOp {
    pub folder_id: String,
    pub fields: Vec<FolderField>,
}

/// Merged registers of one folder.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
struct FolderRecord {
    name: LwwRegister<String>,
    parent: LwwRegister<Option<String>>,
    deleted: LwwRegister<bool>,
    order: LwwRegister<i64>,
}

impl FolderRecord {
    fn apply(&mut self, field: &FolderField, stamp: Stamp) -> bool {
        match field {
            FolderField::Name(v) => self.name.set(v.clone(), stamp),
            FolderField::Parent(v) => self.parent.set(v.clone(), stamp),
            FolderField::Deleted(v) => self.deleted.set(*v, stamp),
            FolderField::Order(v) => self.order.set(*v, stamp),
        }
    }

    fn merge(&mut self, other: &FolderRecord) -> bool {
        let name = self.name.merge(&other.name);
        let parent = self.parent.merge(&other.parent);
        let deleted = self.deleted.merge(&other.deleted);
        let order = self.order.merge(&other.order);
        name || parent || deleted || order
    }
}

/// A folder as seen by a reader.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TS)]
#[ts(export, export_to = "bindings/")]
pub struct FolderInfo {
    pub id: String,
    pub sd_id: String,
    pub name: String,
    /// Effective parent after cycle breaking; `None` for roots.
    pub parent_id: Option<String>,
    pub order: i64,
    pub deleted: bool,
}

/// Folder registers plus replay bookkeeping.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FolderTreeState {
    folders: BTreeMap<String, FolderRecord>,
    visible: HashMap<String, u64>,
}

impl FolderTreeState {
    /// Apply one record from any instance's folder log.
    pub fn apply_record(&mut self, record: &LogRecord<FolderOp>) {
        let folder = self
            .folders
            .entry(record.op.folder_id.clone())
            .or_default();
        for field in &record.op.fields {
            folder.apply(field, Stamp::new(record.clock, record.instance.as_str()));
        }
        let seen = self.visible.entry(record.instance.clone()).or_insert(0);
        *seen = (*seen).max(record.seq);
    }

    /// Merge another replica. Returns `true` if anything changed.
    fn merge(&mut self, other: &FolderTreeState) -> bool {
        let mut changed = false;
        for (id, record) in &other.folders {
            match self.folders.get_mut(id) {
                Some(existing) => changed |= existing.merge(record),
                None => {
                    self.folders.insert(id.clone(), record.clone());
                    changed = true;
                }
            }
        }
        for (instance, seq) in &other.visible {
            let seen = self.visible.entry(instance.clone()).or_insert(0);
            *seen = (*seen).max(*seq);
        }
        changed
    }

    fn max_clock(&self) -> u64 {
        self.folders
            .values()
            .flat_map(|f| [f.name.stamp(), f.parent.stamp(), f.deleted.stamp(), f.order.stamp()])
            .flatten()
            .map(|s| s.clock)
            .max()
            .unwrap_or(0)
    }

    fn is_live(&self, id: &str) -> bool {
        self.folders
            .get(id)
            .is_some_and(|f| !*f.deleted.get() && f.name.stamp().is_some())
    }

    /// Parent as written, with missing or deleted parents resolved to root.
    fn raw_parent(&self, id: &str) -> Option<&str> {
        let parent = self.folders.get(id)?.parent.get().as_deref()?;
        if parent == id || !self.is_live(parent) {
            return None;
        }
        Some(parent)
    }

    /// The members of the cycle `id` belongs to, if any.
    fn cycle_containing<'a>(&'a self, id: &'a str) -> Option<Vec<&'a str>> {
        let mut path = vec![id];
        let mut seen: HashSet<&str> = HashSet::from([id]);
        let mut current = id;
        while let Some(parent) = self.raw_parent(current) {
            if parent == id {
                return Some(path);
            }
            if !seen.insert(parent) {
                // Leads into a cycle that does not include `id`.
                return None;
            }
            path.push(parent);
            current = parent;
        }
        None
    }

    /// Parent after resolving missing/deleted parents and breaking cycles.
    pub fn effective_parent(&self, id: &str) -> Option<String> {
        let parent = self.raw_parent(id)?;
        if let Some(cycle) = self.cycle_containing(id) {
            let breaker = cycle
                .iter()
                .max_by_key(|member| self.folders.get(**member).and_then(|f| f.parent.stamp()))
                .copied();
            if breaker == Some(id) {
                return None;
            }
        }
        Some(parent.to_string())
    }

    /// Whether making `parent` the parent of `folder` would close a cycle.
    pub fn would_cycle(&self, folder: &str, parent: &str) -> bool {
        if folder == parent {
            return true;
        }
        let mut current = Some(parent.to_string());
        let mut steps = 0;
        while let Some(id) = current {
            if id == folder {
                return true;
            }
            steps += 1;
            if steps > self.folders.len() {
                break;
            }
            current = self.effective_parent(&id);
        }
        false
    }

    fn info(&self, sd_id: &str, id: &str) -> Option<FolderInfo> {
        let record = self.folders.get(id)?;
        record.name.stamp()?;
        Some(FolderInfo {
            id: id.to_string(),
            sd_id: sd_id.to_string(),
            name: record.name.get().clone(),
            parent_id: self.effective_parent(id),
            order: *record.order.get(),
            deleted: *record.deleted.get(),
        })
    }
}

/// The folder tree of one SD.
pub struct FolderTree {
    fs: Arc<dyn FileSystem>,
    sd_id: String,
    logs_dir: PathBuf,
    events: Arc<EventRegistry>,
    state: RwLock<FolderTreeState>,
    writer: Mutex<Option<LogWriter>>,
}

impl FolderTree {
    /// Load the folder tree of the SD at `sd_root`.
    pub fn load(
        fs: Arc<dyn FileSystem>,
        sd_id: impl Into<String>,
        sd_root: &Path,
        events: Arc<EventRegistry>,
    ) -> Result<Self> {
        let logs_dir = sd_root.join(FOLDERS_DIR).join(crate::note::LOGS_DIR);
        let state = Self::replay(fs.as_ref(), &logs_dir)?;
        Ok(Self {
            fs,
            sd_id: sd_id.into(),
            logs_dir,
            events,
            state: RwLock::new(state),
            writer: Mutex::new(None),
        })
    }

    fn replay(fs: &dyn FileSystem, logs_dir: &Path) -> Result<FolderTreeState> {
        let mut state = FolderTreeState::default();
        for file in crdt_log::list_log_files(fs, logs_dir)? {
            match crdt_log::read_all::<FolderOp>(fs, &file.path) {
                Ok(read) => read.records.iter().for_each(|r| state.apply_record(r)),
                Err(e) if e.is_corruption() => {
                    log::warn!("Skipping corrupt folder log {:?}: {}", file.path, e);
                }
                Err(e) => return Err(e),
            }
        }
        Ok(state)
    }

    pub fn sd_id(&self) -> &str {
        &self.sd_id
    }

    pub fn logs_dir(&self) -> &Path {
        &self.logs_dir
    }

    fn read_state(&self) -> std::sync::RwLockReadGuard<'_, FolderTreeState> {
        self.state.read().unwrap_or_else(|e| e.into_inner())
    }

    /// Re-merge the folder logs from disk. Returns whether anything changed.
    pub fn reload(&self, ctx: &StoreContext) -> Result<bool> {
        let replay = Self::replay(self.fs.as_ref(), &self.logs_dir)?;
        ctx.clock().observe(replay.max_clock());
        let changed = {
            let mut state = self.state.write().unwrap_or_else(|e| e.into_inner());
            state.merge(&replay)
        };
        if changed {
            self.events.emit(&ChangeEvent::FolderUpdated {
                sd_id: self.sd_id.clone(),
                folder_id: None,
                origin: ChangeOrigin::Remote,
            });
        }
        Ok(changed)
    }

    /// Sizes of the folder log files, to detect changes cheaply.
    pub fn disk_fingerprint(&self) -> Result<Vec<(PathBuf, u64)>> {
        Ok(crdt_log::list_log_files(self.fs.as_ref(), &self.logs_dir)?
            .into_iter()
            .map(|f| {
                let len = self.fs.file_len(&f.path).unwrap_or(0);
                (f.path, len)
            })
            .collect())
    }

    /// Apply and durably log writes to one folder.
    fn write(&self, ctx: &StoreContext, folder_id: &str, fields: Vec<FolderField>) -> Result<()> {
        let op = FolderOp {
            folder_id: folder_id.to_string(),
            fields,
        };
        let mut state = self.state.write().unwrap_or_else(|e| e.into_inner());
        ctx.clock().observe(state.max_clock());
        let stamp = ctx.next_stamp();
        let mut writer_slot = self.writer.lock().unwrap_or_else(|e| e.into_inner());
        if writer_slot.is_none() {
            *writer_slot = Some(LogWriter::open(
                self.fs.as_ref(),
                &self.logs_dir,
                ctx.instance_id(),
                0,
            )?);
        }
        let Some(writer) = writer_slot.as_mut() else {
            return Err(TideError::Crdt("folder log writer unavailable".to_string()));
        };
        let record = writer.append(self.fs.as_ref(), stamp.clock, op)?;
        state.apply_record(&record);
        drop(writer_slot);
        drop(state);

        self.events.emit(&ChangeEvent::FolderUpdated {
            sd_id: self.sd_id.clone(),
            folder_id: Some(folder_id.to_string()),
            origin: ChangeOrigin::Local,
        });
        Ok(())
    }

    fn require_live(&self, id: &str) -> Result<()> {
        if self.read_state().is_live(id) {
            Ok(())
        } else {
            Err(TideError::FolderNotFound(id.to_string()))
        }
    }

    // ==================== Operations ====================

    /// Create a folder under `parent` (root if `None`). Returns its id.
    pub fn create_folder(
        &self,
        ctx: &StoreContext,
        name: &str,
        parent: Option<&str>,
    ) -> Result<String> {
        if let Some(parent) = parent {
            self.require_live(parent)?;
        }
        let id = uuid::Uuid::new_v4().to_string();
        let order = self.children_of(parent).len() as i64;
        self.write(
            ctx,
            &id,
            vec![
                FolderField::Name(name.to_string()),
                FolderField::Parent(parent.map(str::to_string)),
                FolderField::Order(order),
            ],
        )?;
        log::debug!("Created folder {} ({}) in SD {}", id, name, self.sd_id);
        Ok(id)
    }

    pub fn rename_folder(&self, ctx: &StoreContext, id: &str, name: &str) -> Result<()> {
        self.require_live(id)?;
        self.write(ctx, id, vec![FolderField::Name(name.to_string())])
    }

    /// Re-parent a folder. Refuses moves that would create a cycle.
    pub fn move_folder(&self, ctx: &StoreContext, id: &str, new_parent: Option<&str>) -> Result<()> {
        self.require_live(id)?;
        if let Some(parent) = new_parent {
            self.require_live(parent)?;
            if self.read_state().would_cycle(id, parent) {
                return Err(TideError::FolderCycle {
                    folder: id.to_string(),
                    parent: parent.to_string(),
                });
            }
        }
        self.write(ctx, id, vec![FolderField::Parent(new_parent.map(str::to_string))])
    }

    /// Soft-delete a folder. Its children resolve to the root.
    pub fn delete_folder(&self, ctx: &StoreContext, id: &str) -> Result<()> {
        self.require_live(id)?;
        self.write(ctx, id, vec![FolderField::Deleted(true)])
    }

    pub fn reorder_folder(&self, ctx: &StoreContext, id: &str, order: i64) -> Result<()> {
        self.require_live(id)?;
        self.write(ctx, id, vec![FolderField::Order(order)])
    }

    // ==================== Queries ====================

    pub fn get(&self, id: &str) -> Option<FolderInfo> {
        self.read_state().info(&self.sd_id, id)
    }

    /// Live folders sorted by order then name.
    pub fn list_folders(&self) -> Vec<FolderInfo> {
        let state = self.read_state();
        let mut folders: Vec<FolderInfo> = state
            .folders
            .keys()
            .filter(|id| state.is_live(id))
            .filter_map(|id| state.info(&self.sd_id, id))
            .collect();
        folders.sort_by(|a, b| {
            a.order
                .cmp(&b.order)
                .then_with(|| a.name.cmp(&b.name))
                .then_with(|| a.id.cmp(&b.id))
        });
        folders
    }

    /// Live folders whose effective parent is `parent`.
    pub fn children_of(&self, parent: Option<&str>) -> Vec<FolderInfo> {
        self.list_folders()
            .into_iter()
            .filter(|f| f.parent_id.as_deref() == parent)
            .collect()
    }

    pub fn effective_parent(&self, id: &str) -> Option<String> {
        self.read_state().effective_parent(id)
    }

    /// Names from the root down to `id`.
    pub fn path_of(&self, id: &str) -> Result<Vec<String>> {
        let state = self.read_state();
        if !state.folders.contains_key(id) {
            return Err(TideError::FolderNotFound(id.to_string()));
        }
        let mut names = Vec::new();
        let mut current = Some(id.to_string());
        while let Some(folder) = current {
            if names.len() > state.folders.len() {
                break;
            }
            if let Some(record) = state.folders.get(&folder) {
                names.push(record.name.get().clone());
            }
            current = state.effective_parent(&folder);
        }
        names.reverse();
        Ok(names)
    }

    /// Whether `id` names a live folder.
    pub fn contains(&self, id: &str) -> bool {
        self.read_state().is_live(id)
    }

    /// Highest sequence of `instance` merged into the tree.
    pub fn visible_seq(&self, instance: &str) -> u64 {
        self.read_state().visible.get(instance).copied().unwrap_or(0)
    }
}

impl std::fmt::Debug for FolderTree {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FolderTree")
            .field("sd_id", &self.sd_id)
            .field("logs_dir", &self.logs_dir)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::InMemoryFileSystem;

    fn tree_on(fs: &InMemoryFileSystem) -> FolderTree {
        FolderTree::load(
            Arc::new(fs.clone()),
            "sd1",
            Path::new("/sd"),
            Arc::new(EventRegistry::new()),
        )
        .unwrap()
    }

    #[test]
    fn test_create_and_path() {
        let fs = InMemoryFileSystem::new();
        let ctx = StoreContext::new("a");
        let tree = tree_on(&fs);

        let work = tree.create_folder(&ctx, "Work", None).unwrap();
        let projects = tree.create_folder(&ctx, "Projects", Some(&work)).unwrap();

        assert_eq!(tree.path_of(&projects).unwrap(), vec!["Work", "Projects"]);
        assert_eq!(tree.children_of(Some(&work)).len(), 1);
        assert_eq!(tree.children_of(None).len(), 1);

        let reopened = tree_on(&fs);
        assert_eq!(reopened.path_of(&projects).unwrap(), vec!["Work", "Projects"]);
    }

    #[test]
    fn test_move_refuses_cycle() {
        let fs = InMemoryFileSystem::new();
        let ctx = StoreContext::new("a");
        let tree = tree_on(&fs);
        let a = tree.create_folder(&ctx, "A", None).unwrap();
        let b = tree.create_folder(&ctx, "B", Some(&a)).unwrap();

        assert!(matches!(
            tree.move_folder(&ctx, &a, Some(&b)),
            Err(TideError::FolderCycle { .. })
        ));
        assert!(matches!(
            tree.move_folder(&ctx, &a, Some(&a)),
            Err(TideError::FolderCycle { .. })
        ));
        tree.move_folder(&ctx, &b, None).unwrap();
        tree.move_folder(&ctx, &a, Some(&b)).unwrap();
        assert_eq!(tree.effective_parent(&a).as_deref(), Some(b.as_str()));
    }

    #[test]
    fn test_concurrent_moves_forming_cycle_are_broken_deterministically() {
        let fs = InMemoryFileSystem::new();
        let (ca, cb) = (StoreContext::new("a"), StoreContext::new("b"));
        let tree_a = tree_on(&fs);
        let x = tree_a.create_folder(&ca, "X", None).unwrap();
        let y = tree_a.create_folder(&ca, "Y", None).unwrap();
        let tree_b = tree_on(&fs);

        // Neither instance sees the other's move before making its own.
        tree_a.move_folder(&ca, &x, Some(&y)).unwrap();
        tree_b.move_folder(&cb, &y, Some(&x)).unwrap();

        tree_a.reload(&ca).unwrap();
        tree_b.reload(&cb).unwrap();

        for tree in [&tree_a, &tree_b] {
            let roots: Vec<String> = tree.children_of(None).into_iter().map(|f| f.id).collect();
            assert_eq!(roots.len(), 1, "exactly one of the pair becomes a root");
        }
        assert_eq!(tree_a.effective_parent(&x), tree_b.effective_parent(&x));
        assert_eq!(tree_a.effective_parent(&y), tree_b.effective_parent(&y));

        // Both moves carry clock 3; "b" sorts last, so its move of Y is cut.
        assert_eq!(tree_a.effective_parent(&y), None);
        assert_eq!(tree_a.effective_parent(&x), Some(y.clone()));
    }

    #[test]
    fn test_deleted_parent_resolves_to_root() {
        let fs = InMemoryFileSystem::new();
        let ctx = StoreContext::new("a");
        let tree = tree_on(&fs);
        let parent = tree.create_folder(&ctx, "Old", None).unwrap();
        let child = tree.create_folder(&ctx, "Child", Some(&parent)).unwrap();

        tree.delete_folder(&ctx, &parent).unwrap();
        assert_eq!(tree.effective_parent(&child), None);
        assert!(tree.get(&parent).unwrap().deleted);
        assert_eq!(tree.list_folders().len(), 1);
        assert!(matches!(
            tree.rename_folder(&ctx, &parent, "x"),
            Err(TideError::FolderNotFound(_))
        ));
    }

    #[test]
    fn test_reorder() {
        let fs = InMemoryFileSystem::new();
        let ctx = StoreContext::new("a");
        let tree = tree_on(&fs);
        let first = tree.create_folder(&ctx, "First", None).unwrap();
        let second = tree.create_folder(&ctx, "Second", None).unwrap();

        tree.reorder_folder(&ctx, &first, 10).unwrap();
        let ids: Vec<String> = tree.list_folders().into_iter().map(|f| f.id).collect();
        assert_eq!(ids, vec![second, first]);
    }
}

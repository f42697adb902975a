//! The note store of one storage directory.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock, RwLockReadGuard, RwLockWriteGuard};

use super::comments::CommentThread;
use super::doc::{NoteDoc, NoteField, NoteOp, NoteSummary, TextRun};
use super::snapshot::{self, CompactionResult, Coverage, Replay, merge_coverage};
use super::{LOGS_DIR, note_dir, notes_dir};
use crate::activity::ActivityLog;
use crate::clock::Stamp;
use crate::context::StoreContext;
use crate::crdt_log::{self, LogWriter};
use crate::deletion::DeletionLog;
use crate::error::{Result, TideError};
use crate::events::{ChangeEvent, ChangeOrigin, EventRegistry};
use crate::fs::{self, FileSystem};

/// Default residual record count that triggers automatic compaction.
pub const DEFAULT_COMPACTION_THRESHOLD: usize = 200;

struct NoteState {
    doc: NoteDoc,
    visible: HashMap<String, u64>,
    coverage: Coverage,
    residual: usize,
    installed_epoch: u64,
}

impl NoteState {
    fn from_replay(replay: Replay) -> Self {
        Self {
            doc: replay.doc,
            visible: replay.visible,
            coverage: replay.coverage,
            residual: replay.residual_records,
            installed_epoch: 0,
        }
    }

    /// Merge a newer replay into this state. Returns whether anything observable changed.
    fn install(&mut self, replay: &Replay) -> Result<bool> {
        let changed = self.doc.merge_from(&replay.doc)?;
        for (instance, seq) in &replay.visible {
            let seen = self.visible.entry(instance.clone()).or_insert(0);
            *seen = (*seen).max(*seq);
        }
        merge_coverage(&mut self.coverage, &replay.coverage);
        self.residual = replay.residual_records;
        Ok(changed)
    }
}

/// A cached note shared between readers and the sync loop.
pub struct NoteEntry {
    note_id: String,
    state: RwLock<NoteState>,
    writers: Mutex<HashMap<String, LogWriter>>,
    tickets: AtomicU64,
}

impl NoteEntry {
    fn new(note_id: &str, replay: Replay) -> Self {
        Self {
            note_id: note_id.to_string(),
            state: RwLock::new(NoteState::from_replay(replay)),
            writers: Mutex::new(HashMap::new()),
            tickets: AtomicU64::new(0),
        }
    }

    pub fn note_id(&self) -> &str {
        &self.note_id
    }

    fn read_state(&self) -> RwLockReadGuard<'_, NoteState> {
        self.state.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write_state(&self) -> RwLockWriteGuard<'_, NoteState> {
        self.state.write().unwrap_or_else(|e| e.into_inner())
    }

    fn writers(&self) -> MutexGuard<'_, HashMap<String, LogWriter>> {
        self.writers.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Run `f` against the merged document.
    pub fn with_doc<R>(&self, f: impl FnOnce(&NoteDoc) -> R) -> R {
        f(&self.read_state().doc)
    }

    /// Highest sequence of `instance` merged into this note.
    pub fn visible_seq(&self, instance: &str) -> u64 {
        self.read_state().visible.get(instance).copied().unwrap_or(0)
    }

    /// Records applied on top of snapshots.
    pub fn residual_records(&self) -> usize {
        self.read_state().residual
    }
}

impl std::fmt::Debug for NoteEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NoteEntry")
            .field("note_id", &self.note_id)
            .finish_non_exhaustive()
    }
}

/// What a [`NoteStore::reload`] did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReloadOutcome {
    /// The merge was installed.
    Installed { changed: bool },
    /// A merge started later finished first; this one was dropped.
    Stale,
    /// The note is not cached, so there is nothing to refresh.
    NotCached,
}

/// Notes of one storage directory, with a cache of merged documents.
///
/// Local mutations follow one path: mutate the cached document, durably
/// append the record to the caller's own log, publish it to the activity
/// log, then notify subscribers.
pub struct NoteStore {
    fs: Arc<dyn FileSystem>,
    sd_id: String,
    root: PathBuf,
    activity: ActivityLog,
    deletions: DeletionLog,
    events: Arc<EventRegistry>,
    cache: RwLock<HashMap<String, Arc<NoteEntry>>>,
    compaction_threshold: usize,
}

impl NoteStore {
    /// Create the store for the SD at `root`.
    pub fn new(
        fs: Arc<dyn FileSystem>,
        sd_id: impl Into<String>,
        root: impl Into<PathBuf>,
        events: Arc<EventRegistry>,
    ) -> Self {
        let root = root.into();
        Self {
            activity: ActivityLog::new(Arc::clone(&fs), &root),
            deletions: DeletionLog::new(Arc::clone(&fs), &root),
            fs,
            sd_id: sd_id.into(),
            root,
            events,
            cache: RwLock::new(HashMap::new()),
            compaction_threshold: DEFAULT_COMPACTION_THRESHOLD,
        }
    }

    /// Set the residual record count above which notes compact themselves.
    /// Zero disables automatic compaction.
    pub fn with_compaction_threshold(mut self, threshold: usize) -> Self {
        self.compaction_threshold = threshold;
        self
    }

    pub fn sd_id(&self) -> &str {
        &self.sd_id
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn fs(&self) -> &Arc<dyn FileSystem> {
        &self.fs
    }

    pub fn activity(&self) -> &ActivityLog {
        &self.activity
    }

    pub fn deletions(&self) -> &DeletionLog {
        &self.deletions
    }

    pub fn events(&self) -> &Arc<EventRegistry> {
        &self.events
    }

    pub fn note_dir(&self, note_id: &str) -> PathBuf {
        note_dir(&self.root, note_id)
    }

    fn logs_dir(&self, note_id: &str) -> PathBuf {
        self.note_dir(note_id).join(LOGS_DIR)
    }

    fn emit(&self, event: ChangeEvent) {
        self.events.emit(&event);
    }

    // ==================== Discovery ====================

    /// Ids of every note directory in this SD, excluding tombstoned ones.
    pub fn list_note_ids(&self) -> Result<Vec<String>> {
        let dir = notes_dir(&self.root);
        let mut ids = Vec::new();
        for path in self.fs.list_files(&dir)? {
            if fs::is_temporary(&path) || !self.fs.is_dir(&path) {
                continue;
            }
            let Some(id) = fs::file_name(&path) else {
                continue;
            };
            if self.deletions.is_deleted(id)? {
                continue;
            }
            ids.push(id.to_string());
        }
        ids.sort();
        Ok(ids)
    }

    /// Whether a note directory exists on disk.
    pub fn exists_on_disk(&self, note_id: &str) -> bool {
        self.fs.is_dir(&self.note_dir(note_id))
    }

    /// Ids of currently cached notes.
    pub fn cached_ids(&self) -> Vec<String> {
        let cache = self.cache.read().unwrap_or_else(|e| e.into_inner());
        let mut ids: Vec<String> = cache.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn cached(&self, note_id: &str) -> Option<Arc<NoteEntry>> {
        let cache = self.cache.read().unwrap_or_else(|e| e.into_inner());
        cache.get(note_id).cloned()
    }

    /// Drop a note from the cache.
    pub fn evict(&self, note_id: &str) -> bool {
        let mut cache = self.cache.write().unwrap_or_else(|e| e.into_inner());
        cache.remove(note_id).is_some()
    }

    // ==================== Loading ====================

    /// Load (or return the cached) merged note.
    pub fn get(&self, ctx: &StoreContext, note_id: &str) -> Result<Arc<NoteEntry>> {
        if self.deletions.is_deleted(note_id)? {
            self.evict(note_id);
            return Err(TideError::NoteDeleted(note_id.to_string()));
        }
        if let Some(entry) = self.cached(note_id) {
            return Ok(entry);
        }
        if !self.exists_on_disk(note_id) {
            return Err(TideError::NoteNotFound(note_id.to_string()));
        }

        let replay = snapshot::replay(self.fs.as_ref(), &self.note_dir(note_id), note_id)?;
        ctx.clock().observe(replay.max_clock);
        let own_covered = replay.coverage.get(ctx.instance_id()).copied().unwrap_or(0);

        let entry = {
            let mut cache = self.cache.write().unwrap_or_else(|e| e.into_inner());
            Arc::clone(
                cache
                    .entry(note_id.to_string())
                    .or_insert_with(|| Arc::new(NoteEntry::new(note_id, replay))),
            )
        };

        if own_covered > 0 {
            self.prune_own(ctx, &entry, own_covered);
        }
        Ok(entry)
    }

    /// Re-merge a cached note from disk.
    ///
    /// Each call takes a ticket before reading; a merge whose ticket is older
    /// than the last installed one is dropped, so a slow merge can never
    /// overwrite the result of a later one.
    pub fn reload(&self, ctx: &StoreContext, note_id: &str) -> Result<ReloadOutcome> {
        let Some(entry) = self.cached(note_id) else {
            return Ok(ReloadOutcome::NotCached);
        };
        let ticket = entry.tickets.fetch_add(1, Ordering::SeqCst) + 1;
        let replay = snapshot::replay(self.fs.as_ref(), &self.note_dir(note_id), note_id)?;
        ctx.clock().observe(replay.max_clock);
        self.install(ctx, &entry, ticket, &replay)
    }

    fn install(
        &self,
        ctx: &StoreContext,
        entry: &Arc<NoteEntry>,
        ticket: u64,
        replay: &Replay,
    ) -> Result<ReloadOutcome> {
        let changed = {
            let mut state = entry.write_state();
            if ticket <= state.installed_epoch {
                log::debug!(
                    "Dropping stale merge of note {} (ticket {} <= {})",
                    entry.note_id,
                    ticket,
                    state.installed_epoch
                );
                return Ok(ReloadOutcome::Stale);
            }
            state.installed_epoch = ticket;
            state.install(replay)?
        };

        let own_covered = replay.coverage.get(ctx.instance_id()).copied().unwrap_or(0);
        if own_covered > 0 {
            self.prune_own(ctx, entry, own_covered);
        }

        if changed {
            self.emit(ChangeEvent::NoteUpdated {
                sd_id: self.sd_id.clone(),
                note_id: entry.note_id.clone(),
                origin: ChangeOrigin::Remote,
            });
        }
        Ok(ReloadOutcome::Installed { changed })
    }

    /// Highest sequence of `instance` merged into a cached note (0 if not cached).
    pub fn visible_seq(&self, note_id: &str, instance: &str) -> u64 {
        self.cached(note_id)
            .map(|entry| entry.visible_seq(instance))
            .unwrap_or(0)
    }

    // ==================== Creation ====================

    /// Create a note with a fresh id in `folder_id` (root if `None`).
    pub fn create_note(&self, ctx: &StoreContext, folder_id: Option<&str>) -> Result<String> {
        let note_id = uuid::Uuid::new_v4().to_string();
        self.create_note_with_id(ctx, &note_id, folder_id)?;
        Ok(note_id)
    }

    /// Create a note with a caller-chosen id.
    ///
    /// Refuses tombstoned ids. Creating an id that already exists is a no-op.
    pub fn create_note_with_id(
        &self,
        ctx: &StoreContext,
        note_id: &str,
        folder_id: Option<&str>,
    ) -> Result<()> {
        if self.deletions.is_deleted(note_id)? {
            return Err(TideError::NoteDeleted(note_id.to_string()));
        }
        if self.exists_on_disk(note_id) {
            return Ok(());
        }
        self.fs
            .create_dir_all(&self.logs_dir(note_id))
            .map_err(|source| TideError::FileWrite {
                path: self.logs_dir(note_id),
                source,
            })?;

        self.set_field(ctx, note_id, NoteField::FolderId(folder_id.map(str::to_string)))?;
        log::info!("Created note {} in SD {}", note_id, self.sd_id);
        self.emit(ChangeEvent::NoteCreated {
            sd_id: self.sd_id.clone(),
            note_id: note_id.to_string(),
            origin: ChangeOrigin::Local,
        });
        Ok(())
    }

    /// Create `default_id` if the SD has no notes at all.
    ///
    /// Never recreates an id any instance has tombstoned. Returns the id if
    /// a note was created.
    pub fn ensure_default_note(
        &self,
        ctx: &StoreContext,
        default_id: &str,
    ) -> Result<Option<String>> {
        if !self.list_note_ids()?.is_empty() {
            return Ok(None);
        }
        if self.deletions.is_deleted(default_id)? {
            log::info!(
                "Not recreating default note {}: it was permanently deleted",
                default_id
            );
            return Ok(None);
        }
        self.create_note_with_id(ctx, default_id, None)?;
        Ok(Some(default_id.to_string()))
    }

    /// Write a full copy of `source` as a new note in this SD.
    ///
    /// The whole document goes into the first record of a fresh own log,
    /// followed by the register values and `folder_id`.
    pub fn write_copy(
        &self,
        ctx: &StoreContext,
        source: &NoteDoc,
        folder_id: Option<&str>,
    ) -> Result<()> {
        let note_id = source.note_id();
        if self.deletions.is_deleted(note_id)? {
            return Err(TideError::NoteDeleted(note_id.to_string()));
        }
        let logs = self.logs_dir(note_id);
        let mut writer = LogWriter::open(self.fs.as_ref(), &logs, ctx.instance_id(), 0)?;

        let mut ops = vec![NoteOp::Content {
            update: source.encode_state(),
        }];
        let registers = source.registers();
        if let Some(title) = registers.title.get() {
            ops.push(NoteOp::Set {
                field: NoteField::Title(Some(title.clone())),
            });
        }
        if *registers.pinned.get() {
            ops.push(NoteOp::Set {
                field: NoteField::Pinned(true),
            });
        }
        ops.push(NoteOp::Set {
            field: NoteField::FolderId(folder_id.map(str::to_string)),
        });

        for op in ops {
            let stamp = ctx.next_stamp();
            writer.append(self.fs.as_ref(), stamp.clock, op)?;
        }
        self.evict(note_id);
        Ok(())
    }

    // ==================== Local mutation ====================

    /// Apply a local mutation to a note and persist it.
    ///
    /// `mutate` edits the cached document and returns the op to log, or
    /// `None` if nothing changed. Returns the appended sequence number.
    pub fn apply_local<F>(&self, ctx: &StoreContext, note_id: &str, mutate: F) -> Result<Option<u64>>
    where
        F: FnOnce(&mut NoteDoc, &Stamp) -> Result<Option<NoteOp>>,
    {
        let entry = self.get(ctx, note_id)?;
        let stamp = ctx.next_stamp();

        let appended = {
            let mut state = entry.write_state();
            // The writer is ready before the document changes, so a failure
            // here leaves the cache untouched.
            let mut writers = entry.writers();
            let writer = match writers.entry(ctx.instance_id().to_string()) {
                std::collections::hash_map::Entry::Occupied(o) => o.into_mut(),
                std::collections::hash_map::Entry::Vacant(v) => {
                    let covered = state.coverage.get(ctx.instance_id()).copied().unwrap_or(0);
                    v.insert(LogWriter::open(
                        self.fs.as_ref(),
                        &self.logs_dir(note_id),
                        ctx.instance_id(),
                        covered,
                    )?)
                }
            };
            let Some(op) = mutate(&mut state.doc, &stamp)? else {
                return Ok(None);
            };

            match writer.append(self.fs.as_ref(), stamp.clock, op) {
                Ok(record) => {
                    state.doc.observe_times(record.timestamp, record.timestamp);
                    state.visible.insert(ctx.instance_id().to_string(), record.seq);
                    state.residual += 1;
                    Ok((record.seq, state.residual))
                }
                Err(e) => Err(e),
            }
        };

        let (seq, residual) = match appended {
            Ok(v) => v,
            Err(e) => {
                // The cached document holds a change that never reached disk.
                log::warn!("Append to note {} failed, reloading from disk: {}", note_id, e);
                if let Ok(replay) =
                    snapshot::replay(self.fs.as_ref(), &self.note_dir(note_id), note_id)
                {
                    let mut state = entry.write_state();
                    *state = NoteState::from_replay(replay);
                }
                return Err(e);
            }
        };

        if let Err(e) = self.activity.publish(ctx, note_id, seq) {
            log::warn!("Failed to publish activity for note {}#{}: {}", note_id, seq, e);
        }
        self.emit(ChangeEvent::NoteUpdated {
            sd_id: self.sd_id.clone(),
            note_id: note_id.to_string(),
            origin: ChangeOrigin::Local,
        });

        if self.compaction_threshold > 0 && residual > self.compaction_threshold {
            if let Err(e) = self.compact(ctx, note_id) {
                log::warn!("Automatic compaction of note {} failed: {}", note_id, e);
            }
        }
        Ok(Some(seq))
    }

    fn apply_content<F>(&self, ctx: &StoreContext, note_id: &str, edit: F) -> Result<Option<u64>>
    where
        F: FnOnce(&NoteDoc) -> Result<Option<Vec<u8>>>,
    {
        self.apply_local(ctx, note_id, |doc, _| {
            Ok(edit(doc)?.map(|update| NoteOp::Content { update }))
        })
    }

    fn set_field(&self, ctx: &StoreContext, note_id: &str, field: NoteField) -> Result<Option<u64>> {
        self.apply_local(ctx, note_id, |doc, stamp| {
            doc.apply_field(&field, stamp.clone());
            Ok(Some(NoteOp::Set { field }))
        })
    }

    // ==================== Content ====================

    pub fn content(&self, ctx: &StoreContext, note_id: &str) -> Result<String> {
        Ok(self.get(ctx, note_id)?.with_doc(|doc| doc.content()))
    }

    pub fn formatted_runs(&self, ctx: &StoreContext, note_id: &str) -> Result<Vec<TextRun>> {
        Ok(self.get(ctx, note_id)?.with_doc(|doc| doc.formatted_runs()))
    }

    pub fn set_content(&self, ctx: &StoreContext, note_id: &str, text: &str) -> Result<Option<u64>> {
        self.apply_content(ctx, note_id, |doc| Ok(doc.set_content(text)))
    }

    pub fn insert_text(
        &self,
        ctx: &StoreContext,
        note_id: &str,
        index: u32,
        text: &str,
    ) -> Result<Option<u64>> {
        self.apply_content(ctx, note_id, |doc| Ok(doc.insert_text(index, text)))
    }

    pub fn delete_text(
        &self,
        ctx: &StoreContext,
        note_id: &str,
        index: u32,
        len: u32,
    ) -> Result<Option<u64>> {
        self.apply_content(ctx, note_id, |doc| Ok(doc.delete_text(index, len)))
    }

    pub fn format_text(
        &self,
        ctx: &StoreContext,
        note_id: &str,
        index: u32,
        len: u32,
        mark: &str,
        on: bool,
    ) -> Result<Option<u64>> {
        self.apply_content(ctx, note_id, |doc| Ok(doc.format_text(index, len, mark, on)))
    }

    // ==================== Comments ====================

    pub fn comments(&self, ctx: &StoreContext, note_id: &str) -> Result<Vec<CommentThread>> {
        Ok(self.get(ctx, note_id)?.with_doc(|doc| doc.comment_threads()))
    }

    /// Start a thread over characters `start..end`. Returns the thread id.
    pub fn add_comment(
        &self,
        ctx: &StoreContext,
        note_id: &str,
        author: &str,
        body: &str,
        start: u32,
        end: u32,
    ) -> Result<String> {
        let thread_id = uuid::Uuid::new_v4().to_string();
        let now = chrono::Utc::now().timestamp_millis();
        self.apply_content(ctx, note_id, |doc| {
            doc.add_comment(&thread_id, author, body, start, end, now).map(Some)
        })?;
        Ok(thread_id)
    }

    /// Reply to a thread. Returns the reply id.
    pub fn reply_to_comment(
        &self,
        ctx: &StoreContext,
        note_id: &str,
        thread_id: &str,
        author: &str,
        body: &str,
    ) -> Result<String> {
        let reply_id = uuid::Uuid::new_v4().to_string();
        let now = chrono::Utc::now().timestamp_millis();
        self.apply_content(ctx, note_id, |doc| {
            doc.reply_to_comment(thread_id, &reply_id, author, body, now)
                .map(Some)
        })?;
        Ok(reply_id)
    }

    pub fn resolve_comment(
        &self,
        ctx: &StoreContext,
        note_id: &str,
        thread_id: &str,
        resolved: bool,
    ) -> Result<Option<u64>> {
        self.apply_content(ctx, note_id, |doc| doc.resolve_comment(thread_id, resolved))
    }

    pub fn delete_comment(
        &self,
        ctx: &StoreContext,
        note_id: &str,
        thread_id: &str,
    ) -> Result<Option<u64>> {
        self.apply_content(ctx, note_id, |doc| doc.delete_comment(thread_id).map(Some))
    }

    // ==================== Registers ====================

    /// Set (or clear, with `None`) the explicit title.
    pub fn set_title(&self, ctx: &StoreContext, note_id: &str, title: Option<&str>) -> Result<Option<u64>> {
        self.set_field(ctx, note_id, NoteField::Title(title.map(str::to_string)))
    }

    /// Move a note to a folder of this SD (root if `None`).
    pub fn set_folder(
        &self,
        ctx: &StoreContext,
        note_id: &str,
        folder_id: Option<&str>,
    ) -> Result<Option<u64>> {
        self.set_field(ctx, note_id, NoteField::FolderId(folder_id.map(str::to_string)))
    }

    pub fn set_pinned(&self, ctx: &StoreContext, note_id: &str, pinned: bool) -> Result<Option<u64>> {
        self.set_field(ctx, note_id, NoteField::Pinned(pinned))
    }

    /// Move a note to "recently deleted".
    pub fn soft_delete(&self, ctx: &StoreContext, note_id: &str) -> Result<Option<u64>> {
        let now = chrono::Utc::now().timestamp_millis();
        let seq = self.set_field(ctx, note_id, NoteField::DeletedAt(Some(now)))?;
        self.emit(ChangeEvent::NoteDeleted {
            sd_id: self.sd_id.clone(),
            note_id: note_id.to_string(),
            permanent: false,
        });
        Ok(seq)
    }

    /// Bring a soft-deleted note back.
    pub fn restore(&self, ctx: &StoreContext, note_id: &str) -> Result<Option<u64>> {
        self.set_field(ctx, note_id, NoteField::DeletedAt(None))
    }

    /// Tombstone a note and remove its directory.
    pub fn permanently_delete(&self, ctx: &StoreContext, note_id: &str) -> Result<()> {
        let now = chrono::Utc::now().timestamp_millis();
        self.deletions.record_deletion(ctx, note_id, now)?;
        self.drop_deleted(note_id)?;
        self.emit(ChangeEvent::NoteDeleted {
            sd_id: self.sd_id.clone(),
            note_id: note_id.to_string(),
            permanent: true,
        });
        Ok(())
    }

    /// Forget a tombstoned note: evict it and remove its directory.
    pub fn drop_deleted(&self, note_id: &str) -> Result<()> {
        self.evict(note_id);
        let dir = self.note_dir(note_id);
        self.fs
            .remove_dir_all(&dir)
            .map_err(|source| TideError::FileWrite { path: dir, source })
    }

    // ==================== Listing ====================

    pub fn summary(&self, ctx: &StoreContext, note_id: &str) -> Result<NoteSummary> {
        Ok(self.get(ctx, note_id)?.with_doc(|doc| doc.summary(&self.sd_id)))
    }

    /// Summaries of every note, soft-deleted ones included.
    ///
    /// Notes that fail to load are skipped with a warning.
    pub fn list_summaries(&self, ctx: &StoreContext) -> Result<Vec<NoteSummary>> {
        let mut summaries = Vec::new();
        for note_id in self.list_note_ids()? {
            match self.summary(ctx, &note_id) {
                Ok(summary) => summaries.push(summary),
                Err(e) => log::warn!("Skipping note {} in listing: {}", note_id, e),
            }
        }
        Ok(summaries)
    }

    // ==================== Compaction ====================

    /// Snapshot a note and remove the caller's covered log files.
    pub fn compact(&self, ctx: &StoreContext, note_id: &str) -> Result<CompactionResult> {
        let entry = self.get(ctx, note_id)?;
        let mut state = entry.write_state();
        let mut writers = entry.writers();

        let dir = self.note_dir(note_id);
        let replay = snapshot::replay(self.fs.as_ref(), &dir, note_id)?;
        let writer = match writers.entry(ctx.instance_id().to_string()) {
            std::collections::hash_map::Entry::Occupied(o) => o.into_mut(),
            std::collections::hash_map::Entry::Vacant(v) => {
                let covered = replay.coverage.get(ctx.instance_id()).copied().unwrap_or(0);
                v.insert(LogWriter::open(
                    self.fs.as_ref(),
                    &self.logs_dir(note_id),
                    ctx.instance_id(),
                    covered,
                )?)
            }
        };

        let result = snapshot::compact(self.fs.as_ref(), &dir, ctx.instance_id(), &replay, writer)?;
        state.install(&replay)?;
        merge_coverage(&mut state.coverage, &result.coverage);
        state.residual = 0;
        Ok(result)
    }

    /// Remove the caller's own log files already included in a snapshot.
    pub fn prune_covered_logs(&self, ctx: &StoreContext, note_id: &str) -> Result<usize> {
        let entry = self.get(ctx, note_id)?;
        let covered = {
            let state = entry.read_state();
            state.coverage.get(ctx.instance_id()).copied().unwrap_or(0)
        };
        self.prune_with(ctx, &entry, covered)
    }

    fn prune_own(&self, ctx: &StoreContext, entry: &Arc<NoteEntry>, covered: u64) {
        match self.has_prunable(ctx, &entry.note_id, covered) {
            Ok(false) => {}
            Ok(true) => {
                if let Err(e) = self.prune_with(ctx, entry, covered) {
                    log::warn!("Failed to prune covered logs of note {}: {}", entry.note_id, e);
                }
            }
            Err(e) => log::warn!("Failed to list logs of note {}: {}", entry.note_id, e),
        }
    }

    fn has_prunable(&self, ctx: &StoreContext, note_id: &str, covered: u64) -> Result<bool> {
        Ok(crdt_log::list_log_files(self.fs.as_ref(), &self.logs_dir(note_id))?
            .iter()
            .any(|f| f.instance == ctx.instance_id() && f.first_seq <= covered))
    }

    fn prune_with(&self, ctx: &StoreContext, entry: &Arc<NoteEntry>, covered: u64) -> Result<usize> {
        let mut writers = entry.writers();
        let writer = match writers.entry(ctx.instance_id().to_string()) {
            std::collections::hash_map::Entry::Occupied(o) => o.into_mut(),
            std::collections::hash_map::Entry::Vacant(v) => v.insert(LogWriter::open(
                self.fs.as_ref(),
                &self.logs_dir(&entry.note_id),
                ctx.instance_id(),
                covered,
            )?),
        };
        let removed = writer.prune_covered(self.fs.as_ref(), covered)?;
        if removed > 0 {
            log::debug!("Pruned {} covered log files of note {}", removed, entry.note_id);
        }
        Ok(removed)
    }
}

impl std::fmt::Debug for NoteStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NoteStore")
            .field("sd_id", &self.sd_id)
            .field("root", &self.root)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::InMemoryFileSystem;
    use std::sync::Mutex as StdMutex;

    /// Fails every listing of a `logs` directory while `down` is set.
    struct LogDirOutage {
        inner: InMemoryFileSystem,
        down: std::sync::atomic::AtomicBool,
    }

    impl FileSystem for LogDirOutage {
        fn read_binary(&self, path: &Path) -> std::io::Result<Vec<u8>> {
            self.inner.read_binary(path)
        }

        fn append(&self, path: &Path, content: &[u8]) -> std::io::Result<()> {
            self.inner.append(path, content)
        }

        fn write_atomic(&self, path: &Path, content: &[u8]) -> std::io::Result<()> {
            self.inner.write_atomic(path, content)
        }

        fn truncate(&self, path: &Path, len: u64) -> std::io::Result<()> {
            self.inner.truncate(path, len)
        }

        fn file_len(&self, path: &Path) -> Option<u64> {
            self.inner.file_len(path)
        }

        fn exists(&self, path: &Path) -> bool {
            self.inner.exists(path)
        }

        fn is_dir(&self, path: &Path) -> bool {
            self.inner.is_dir(path)
        }

        fn create_dir_all(&self, path: &Path) -> std::io::Result<()> {
            self.inner.create_dir_all(path)
        }

        fn list_files(&self, dir: &Path) -> std::io::Result<Vec<PathBuf>> {
            if self.down.load(Ordering::SeqCst) && dir.ends_with(LOGS_DIR) {
                return Err(std::io::Error::new(
                    std::io::ErrorKind::PermissionDenied,
                    "share went away",
                ));
            }
            self.inner.list_files(dir)
        }

        fn delete_file(&self, path: &Path) -> std::io::Result<()> {
            self.inner.delete_file(path)
        }

        fn remove_dir_all(&self, path: &Path) -> std::io::Result<()> {
            self.inner.remove_dir_all(path)
        }
    }

    fn store_on(fs: &InMemoryFileSystem) -> NoteStore {
        NoteStore::new(
            Arc::new(fs.clone()),
            "sd1",
            "/sd",
            Arc::new(EventRegistry::new()),
        )
    }

    #[test]
    fn test_create_edit_and_reload_from_disk() {
        let fs = InMemoryFileSystem::new();
        let ctx = StoreContext::new("a");
        let store = store_on(&fs);

        let id = store.create_note(&ctx, Some("f1")).unwrap();
        store.set_content(&ctx, &id, "Groceries\nmilk").unwrap();
        store.set_pinned(&ctx, &id, true).unwrap();

        let fresh = store_on(&fs);
        let summary = fresh.summary(&StoreContext::new("b"), &id).unwrap();
        assert_eq!(summary.title, "Groceries");
        assert_eq!(summary.preview, "milk");
        assert_eq!(summary.folder_id.as_deref(), Some("f1"));
        assert!(summary.pinned);
    }

    #[test]
    fn test_local_mutation_publishes_activity_and_event() {
        let fs = InMemoryFileSystem::new();
        let ctx = StoreContext::new("a");
        let store = store_on(&fs);
        let events = Arc::new(StdMutex::new(Vec::new()));
        let sink = Arc::clone(&events);
        store.events().subscribe(Arc::new(move |e| sink.lock().unwrap().push(e.clone())));

        let id = store.create_note(&ctx, None).unwrap();
        let seq = store.insert_text(&ctx, &id, 0, "hi").unwrap();
        assert_eq!(seq, Some(2));
        assert!(store.insert_text(&ctx, &id, 0, "").unwrap().is_none());

        let mut cursor = crate::lines::LineCursor::new();
        let seen = store
            .activity()
            .consume(&StoreContext::new("b"), &mut cursor)
            .unwrap();
        let seqs: Vec<u64> = seen.iter().map(|e| e.seq).collect();
        assert_eq!(seqs, vec![1, 2]);

        let events = events.lock().unwrap();
        assert!(events.iter().any(|e| matches!(e, ChangeEvent::NoteCreated { .. })));
        assert!(events.iter().any(|e| matches!(
            e,
            ChangeEvent::NoteUpdated {
                origin: ChangeOrigin::Local,
                ..
            }
        )));
    }

    #[test]
    fn test_reload_picks_up_other_instance() {
        let fs = InMemoryFileSystem::new();
        let (a, b) = (StoreContext::new("a"), StoreContext::new("b"));
        let store_a = store_on(&fs);
        let store_b = store_on(&fs);

        let id = store_a.create_note(&a, None).unwrap();
        store_a.set_content(&a, &id, "from a").unwrap();
        assert_eq!(store_b.content(&b, &id).unwrap(), "from a");

        store_a.insert_text(&a, &id, 6, "!").unwrap();
        assert_eq!(store_b.content(&b, &id).unwrap(), "from a");
        assert_eq!(
            store_b.reload(&b, &id).unwrap(),
            ReloadOutcome::Installed { changed: true }
        );
        assert_eq!(store_b.content(&b, &id).unwrap(), "from a!");
        assert_eq!(store_b.visible_seq(&id, "a"), 3);
        assert_eq!(
            store_b.reload(&b, &id).unwrap(),
            ReloadOutcome::Installed { changed: false }
        );
    }

    #[test]
    fn test_stale_ticket_is_dropped() {
        let fs = InMemoryFileSystem::new();
        let a = StoreContext::new("a");
        let store = store_on(&fs);
        let id = store.create_note(&a, None).unwrap();
        let entry = store.get(&a, &id).unwrap();

        let old_ticket = entry.tickets.fetch_add(1, Ordering::SeqCst) + 1;
        let old_replay = snapshot::replay(&fs, &store.note_dir(&id), &id).unwrap();
        store.reload(&a, &id).unwrap();
        assert_eq!(
            store.install(&a, &entry, old_ticket, &old_replay).unwrap(),
            ReloadOutcome::Stale
        );
    }

    #[test]
    fn test_tombstoned_note_rejects_writes_and_recreation() {
        let fs = InMemoryFileSystem::new();
        let a = StoreContext::new("a");
        let store = store_on(&fs);
        let id = store.create_note(&a, None).unwrap();
        store.permanently_delete(&a, &id).unwrap();

        assert!(!store.exists_on_disk(&id));
        assert!(matches!(
            store.set_content(&a, &id, "x"),
            Err(TideError::NoteDeleted(_))
        ));
        assert!(matches!(
            store.create_note_with_id(&a, &id, None),
            Err(TideError::NoteDeleted(_))
        ));
    }

    #[test]
    fn test_ensure_default_note_respects_tombstone() {
        let fs = InMemoryFileSystem::new();
        let a = StoreContext::new("a");
        let store = store_on(&fs);

        assert_eq!(
            store.ensure_default_note(&a, "welcome").unwrap().as_deref(),
            Some("welcome")
        );
        store.permanently_delete(&a, "welcome").unwrap();
        assert!(store.list_note_ids().unwrap().is_empty());
        assert_eq!(store.ensure_default_note(&a, "welcome").unwrap(), None);
        assert!(!store.exists_on_disk("welcome"));
    }

    #[test]
    fn test_automatic_compaction() {
        let fs = InMemoryFileSystem::new();
        let a = StoreContext::new("a");
        let store = store_on(&fs).with_compaction_threshold(5);
        let id = store.create_note(&a, None).unwrap();
        for i in 0..10 {
            store.insert_text(&a, &id, i, "x").unwrap();
        }
        let entry = store.get(&a, &id).unwrap();
        assert!(entry.residual_records() <= 5);

        let fresh = store_on(&fs);
        assert_eq!(fresh.content(&a, &id).unwrap(), "x".repeat(10));
    }

    #[test]
    fn test_soft_delete_and_restore() {
        let fs = InMemoryFileSystem::new();
        let a = StoreContext::new("a");
        let store = store_on(&fs);
        let id = store.create_note(&a, None).unwrap();

        store.soft_delete(&a, &id).unwrap();
        assert!(store.summary(&a, &id).unwrap().deleted_at.is_some());
        store.restore(&a, &id).unwrap();
        assert!(store.summary(&a, &id).unwrap().deleted_at.is_none());
    }

    #[test]
    fn test_edit_that_cannot_open_its_log_leaves_cache_unchanged() {
        let fs = InMemoryFileSystem::new();
        let ctx = StoreContext::new("a");
        let id = store_on(&fs).create_note(&ctx, None).unwrap();
        store_on(&fs).set_content(&ctx, &id, "draft").unwrap();

        let outage = Arc::new(LogDirOutage {
            inner: fs.clone(),
            down: std::sync::atomic::AtomicBool::new(false),
        });
        let store = NoteStore::new(
            Arc::clone(&outage) as Arc<dyn FileSystem>,
            "sd1",
            "/sd",
            Arc::new(EventRegistry::new()),
        );
        assert_eq!(store.content(&ctx, &id).unwrap(), "draft");

        outage.down.store(true, Ordering::SeqCst);
        assert!(store.set_content(&ctx, &id, "final").is_err());
        assert_eq!(store.content(&ctx, &id).unwrap(), "draft");

        outage.down.store(false, Ordering::SeqCst);
        assert!(store.set_content(&ctx, &id, "final").unwrap().is_some());
        assert_eq!(store_on(&fs).content(&ctx, &id).unwrap(), "final");
    }
}

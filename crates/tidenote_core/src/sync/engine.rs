//! One synchronous sync pass over every open SD.
//!
//! The async loop in [`super::orchestrator`] only decides *when* to run a
//! pass; everything a pass does lives here so tests can drive it directly.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use super::pending::{PendingCheck, PendingSet};
use super::status::{SyncPhase, SyncStatus};
use crate::config::SyncConfig;
use crate::context::StoreContext;
use crate::error::TideError;
use crate::events::{ChangeEvent, ChangeOrigin};
use crate::lines::LineCursor;
use crate::sd::{SdManager, StorageDirectory};

/// Passes between trims of the own activity log.
const ACTIVITY_TRIM_EVERY: u64 = 64;

/// Read positions of one SD.
#[derive(Debug, Default)]
struct SdCursors {
    activity: LineCursor,
    deletions: LineCursor,
    moves: LineCursor,
    folders: Option<Vec<(PathBuf, u64)>>,
}

#[derive(Debug, Default)]
struct EngineState {
    cursors: HashMap<String, SdCursors>,
    pending: PendingSet,
    degraded: BTreeSet<String>,
    announced_moves: HashSet<String>,
    passes: u64,
}

/// What a pass did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PassReport {
    /// Notes loaded or re-merged.
    pub merged_notes: usize,
    /// Notes dropped because another instance tombstoned them.
    pub deleted_notes: usize,
    /// Cross-SD moves by other instances first seen in this pass.
    pub moved_notes: usize,
    pub folders_reloaded: usize,
    /// Entries still pending after the pass.
    pub pending: usize,
    /// Pending entries dropped after too many attempts.
    pub gave_up: usize,
    /// SDs skipped because their root was unreachable.
    pub degraded: usize,
}

/// Discovers and merges other instances' changes.
pub struct SyncEngine {
    manager: Arc<SdManager>,
    ctx: StoreContext,
    config: SyncConfig,
    state: Mutex<EngineState>,
    phases: Mutex<HashMap<String, SyncPhase>>,
    status: Mutex<SyncStatus>,
    in_progress: AtomicBool,
}

impl SyncEngine {
    pub fn new(manager: Arc<SdManager>, ctx: StoreContext, config: SyncConfig) -> Self {
        Self {
            manager,
            ctx,
            config,
            state: Mutex::new(EngineState::default()),
            phases: Mutex::new(HashMap::new()),
            status: Mutex::new(SyncStatus::default()),
            in_progress: AtomicBool::new(false),
        }
    }

    pub fn manager(&self) -> &Arc<SdManager> {
        &self.manager
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    fn lock_state(&self) -> MutexGuard<'_, EngineState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn set_phase(&self, sd_id: &str, phase: SyncPhase) {
        let mut phases = self.phases.lock().unwrap_or_else(|e| e.into_inner());
        phases.insert(sd_id.to_string(), phase);
    }

    /// Current phase of an SD.
    pub fn phase(&self, sd_id: &str) -> SyncPhase {
        let phases = self.phases.lock().unwrap_or_else(|e| e.into_inner());
        phases.get(sd_id).copied().unwrap_or_default()
    }

    /// Latest published status, with the live in-progress flag.
    pub fn status(&self) -> SyncStatus {
        let mut status = self
            .status
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone();
        status.in_progress = self.in_progress.load(Ordering::SeqCst);
        status
    }

    /// Time until the earliest pending entry is due, if any is waiting.
    pub fn next_retry_delay(&self) -> Option<Duration> {
        let due = self.lock_state().pending.next_due()?;
        Some(due.saturating_duration_since(Instant::now()))
    }

    pub fn run_pass(&self) -> PassReport {
        self.run_pass_at(Instant::now())
    }

    /// Run one pass, treating `now` as the current time for retry scheduling.
    pub fn run_pass_at(&self, now: Instant) -> PassReport {
        let mut state = self.lock_state();
        self.in_progress.store(true, Ordering::SeqCst);
        state.passes += 1;

        let reopened = self.manager.open_deferred();
        if !reopened.is_empty() {
            log::info!("Opened {} storage directories that were unreachable at startup", reopened.len());
        }
        let sds = self.manager.sds();
        let open: HashSet<&str> = sds.iter().map(|sd| sd.id()).collect();
        state.cursors.retain(|id, _| open.contains(id.as_str()));
        state.degraded.retain(|id| open.contains(id.as_str()));
        let closed: Vec<String> = state
            .pending
            .by_sd()
            .into_keys()
            .filter(|id| !open.contains(id.as_str()))
            .collect();
        for id in closed {
            state.pending.remove_sd(&id);
        }

        let mut report = PassReport::default();
        for sd in &sds {
            if !sd.is_accessible() {
                if state.degraded.insert(sd.id().to_string()) {
                    log::warn!("SD {} at {:?} is not accessible; skipping sync", sd.id(), sd.root());
                }
                report.degraded += 1;
                continue;
            }
            if state.degraded.remove(sd.id()) {
                log::info!("SD {} is accessible again", sd.id());
            }
            self.sync_sd(sd, &mut state, now, &mut report);
        }
        report.pending = state.pending.len();

        // Never opened: known by root only.
        let unopened: Vec<String> = self
            .manager
            .deferred_roots()
            .iter()
            .map(|root| root.display().to_string())
            .collect();
        report.degraded += unopened.len();

        let status = SyncStatus {
            pending_merge_count: state.pending.len(),
            pending: state.pending.by_sd(),
            in_progress: false,
            degraded_sds: state.degraded.iter().cloned().chain(unopened).collect(),
        };
        drop(state);
        self.in_progress.store(false, Ordering::SeqCst);
        self.publish_status(status);
        report
    }

    fn publish_status(&self, status: SyncStatus) {
        let changed = {
            let mut current = self.status.lock().unwrap_or_else(|e| e.into_inner());
            if *current == status {
                false
            } else {
                *current = status.clone();
                true
            }
        };
        if changed {
            self.manager
                .events()
                .emit(&ChangeEvent::SyncStatusChanged { status });
        }
    }

    fn emit(&self, event: ChangeEvent) {
        self.manager.events().emit(&event);
    }

    fn sync_sd(
        &self,
        sd: &StorageDirectory,
        state: &mut EngineState,
        now: Instant,
        report: &mut PassReport,
    ) {
        let sd_id = sd.id().to_string();
        let mut cursors = state.cursors.remove(&sd_id).unwrap_or_default();

        self.set_phase(&sd_id, SyncPhase::Scanning);
        self.scan_deletions(sd, &mut cursors, state, report);
        self.scan_moves(sd, &mut cursors, state, report);
        match sd.notes().activity().consume(&self.ctx, &mut cursors.activity) {
            Ok(entries) => {
                for entry in entries {
                    state
                        .pending
                        .observe(&sd_id, &entry.note_id, &entry.instance_id, entry.seq, now);
                }
            }
            Err(e) => log::warn!("Failed to read activity logs of SD {}: {}", sd_id, e),
        }
        for instance in cursors.activity.take_gaps() {
            // Announcements were trimmed unread: re-merge everything cached.
            let cached = sd.notes().cached_ids();
            log::info!(
                "Activity of {} in SD {} was trimmed past our cursor; re-merging {} cached notes",
                instance,
                sd_id,
                cached.len()
            );
            for note_id in cached {
                state.pending.observe(&sd_id, &note_id, &instance, 0, now);
            }
        }

        self.set_phase(&sd_id, SyncPhase::Merging);
        for (due_sd, note_id) in state.pending.due_notes(now) {
            if due_sd == sd_id {
                self.merge_note(sd, &note_id, state, now, report);
            }
        }
        self.reload_folders(sd, &mut cursors, report);

        if state.passes % ACTIVITY_TRIM_EVERY == 0
            && let Err(e) = sd
                .notes()
                .activity()
                .compact_own(&self.ctx, self.config.activity_keep_lines)
        {
            log::warn!("Failed to trim activity log of SD {}: {}", sd_id, e);
        }

        state.cursors.insert(sd_id.clone(), cursors);
        self.set_phase(&sd_id, SyncPhase::Idle);
    }

    fn scan_deletions(
        &self,
        sd: &StorageDirectory,
        cursors: &mut SdCursors,
        state: &mut EngineState,
        report: &mut PassReport,
    ) {
        let notes = sd.notes();
        let entries = match notes.deletions().consume(&self.ctx, &mut cursors.deletions) {
            Ok(entries) => entries,
            Err(e) => {
                log::warn!("Failed to read deletion logs of SD {}: {}", sd.id(), e);
                return;
            }
        };
        for entry in entries {
            let present = notes.cached(&entry.note_id).is_some() || notes.exists_on_disk(&entry.note_id);
            state.pending.remove_note(sd.id(), &entry.note_id);
            if !present {
                continue;
            }
            if let Err(e) = notes.drop_deleted(&entry.note_id) {
                log::warn!("Failed to remove deleted note {}: {}", entry.note_id, e);
            }
            log::info!("Note {} was permanently deleted by another instance", entry.note_id);
            report.deleted_notes += 1;
            self.emit(ChangeEvent::NoteDeleted {
                sd_id: sd.id().to_string(),
                note_id: entry.note_id,
                permanent: true,
            });
        }
    }

    fn scan_moves(
        &self,
        sd: &StorageDirectory,
        cursors: &mut SdCursors,
        state: &mut EngineState,
        report: &mut PassReport,
    ) {
        let entries = match sd.moves().consume(&self.ctx, &mut cursors.moves) {
            Ok(entries) => entries,
            Err(e) => {
                log::warn!("Failed to read move journal of SD {}: {}", sd.id(), e);
                return;
            }
        };
        for entry in entries {
            if entry.from_sd == sd.id() {
                sd.notes().evict(&entry.note_id);
                state.pending.remove_note(sd.id(), &entry.note_id);
            }
            if state.announced_moves.insert(entry.move_id.clone()) {
                report.moved_notes += 1;
                self.emit(ChangeEvent::NoteMoved {
                    note_id: entry.note_id,
                    from_sd: entry.from_sd,
                    to_sd: entry.to_sd,
                });
            }
        }
    }

    fn merge_note(
        &self,
        sd: &StorageDirectory,
        note_id: &str,
        state: &mut EngineState,
        now: Instant,
        report: &mut PassReport,
    ) {
        let notes = sd.notes();
        if notes.deletions().is_known_deleted(note_id) {
            state.pending.remove_note(sd.id(), note_id);
            return;
        }
        if notes.exists_on_disk(note_id) && !sd.is_visible(note_id).unwrap_or(true) {
            log::debug!("Ignoring activity for note {} which lives in another SD", note_id);
            state.pending.remove_note(sd.id(), note_id);
            return;
        }

        let merged = if notes.cached(note_id).is_some() {
            notes.reload(&self.ctx, note_id).map(|_| ())
        } else {
            notes.get(&self.ctx, note_id).map(|_| {
                self.emit(ChangeEvent::NoteUpdated {
                    sd_id: sd.id().to_string(),
                    note_id: note_id.to_string(),
                    origin: ChangeOrigin::Remote,
                });
            })
        };
        match merged {
            Ok(()) => report.merged_notes += 1,
            Err(TideError::NoteNotFound(_)) => {}
            Err(TideError::NoteDeleted(_)) => {
                state.pending.remove_note(sd.id(), note_id);
                return;
            }
            Err(e) if e.is_transient() => {
                log::debug!("Deferring merge of note {}: {}", note_id, e);
                state.pending.defer_note(sd.id(), note_id, &self.config, now);
                return;
            }
            Err(e) => {
                log::warn!("Failed to merge note {}: {}", note_id, e);
                state.pending.remove_note(sd.id(), note_id);
                return;
            }
        }

        for (key, seq) in state.pending.for_note(sd.id(), note_id) {
            let visible = notes.visible_seq(note_id, &key.instance_id);
            match state.pending.check(&key, visible, &self.config, now) {
                PendingCheck::Resolved => {}
                PendingCheck::Deferred(delay) => log::debug!(
                    "Record {}_{} of note {} not visible yet (have {}); retrying in {:?}",
                    key.instance_id,
                    seq,
                    note_id,
                    visible,
                    delay
                ),
                PendingCheck::GaveUp => {
                    report.gave_up += 1;
                    log::warn!(
                        "Giving up on record {}_{} of note {}; merged up to {}",
                        key.instance_id,
                        seq,
                        note_id,
                        visible
                    );
                }
            }
        }
    }

    fn reload_folders(&self, sd: &StorageDirectory, cursors: &mut SdCursors, report: &mut PassReport) {
        let fingerprint = match sd.folders().disk_fingerprint() {
            Ok(fp) => fp,
            Err(e) => {
                log::warn!("Failed to list folder logs of SD {}: {}", sd.id(), e);
                return;
            }
        };
        if cursors.folders.as_ref() == Some(&fingerprint) {
            return;
        }
        match sd.folders().reload(&self.ctx) {
            Ok(changed) => {
                if changed {
                    report.folders_reloaded += 1;
                }
                cursors.folders = Some(fingerprint);
            }
            Err(e) => log::warn!("Failed to reload folders of SD {}: {}", sd.id(), e),
        }
    }
}

impl std::fmt::Debug for SyncEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncEngine")
            .field("instance", &self.ctx.instance_id())
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

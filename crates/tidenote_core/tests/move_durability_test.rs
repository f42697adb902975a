//! Cross-SD moves survive a crash at every phase boundary.
//!
//! Each test drops the manager mid-move (as a killed process would), then
//! reopens both SDs from disk with a fresh manager and runs recovery. The
//! note must end up visible in exactly one SD.

use std::path::PathBuf;
use std::sync::Arc;

use tempfile::TempDir;
use tidenote_core::context::StoreContext;
use tidenote_core::events::EventRegistry;
use tidenote_core::fs::{FileSystem, RealFileSystem};
use tidenote_core::sd::{MoveEntry, SdManager};

struct World {
    _tmp: TempDir,
    a_root: PathBuf,
    b_root: PathBuf,
    a: String,
    b: String,
}

fn fs() -> Arc<dyn FileSystem> {
    Arc::new(RealFileSystem)
}

fn manager() -> SdManager {
    SdManager::new(fs(), Arc::new(EventRegistry::new()))
}

fn world(manager: &SdManager) -> World {
    let tmp = TempDir::new().unwrap();
    let a_root = tmp.path().join("icloud");
    let b_root = tmp.path().join("dropbox");
    let a = manager.create_sd(&a_root, "iCloud").unwrap().id().to_string();
    let b = manager.create_sd(&b_root, "Dropbox").unwrap().id().to_string();
    World {
        _tmp: tmp,
        a_root,
        b_root,
        a,
        b,
    }
}

/// Reopen both SDs from disk as a restarted process would.
fn restart(world: &World, ctx: &StoreContext) -> SdManager {
    let manager = manager();
    manager.open_sd(&world.a_root).unwrap();
    manager.open_sd(&world.b_root).unwrap();
    manager.recover(ctx).unwrap();
    manager
}

/// SD ids in which `note` is visible.
fn visible_in(manager: &SdManager, note: &str) -> Vec<String> {
    manager
        .sds()
        .into_iter()
        .filter(|sd| sd.notes().exists_on_disk(note) && sd.is_visible(note).unwrap())
        .map(|sd| sd.id().to_string())
        .collect()
}

fn note_with_content(manager: &SdManager, sd: &str, ctx: &StoreContext, text: &str) -> String {
    let sd = manager.get_sd(sd).unwrap();
    let note = sd.notes().create_note(ctx, None).unwrap();
    sd.notes().set_content(ctx, &note, text).unwrap();
    note
}

#[test]
fn test_completed_move_survives_restart() {
    let ctx = StoreContext::new("laptop");
    let manager = manager();
    let w = world(&manager);
    let note = note_with_content(&manager, &w.a, &ctx, "Packing list");

    manager.move_note(&ctx, &note, &w.a, &w.b, None).unwrap();
    drop(manager);

    let restarted = restart(&w, &ctx);
    assert_eq!(visible_in(&restarted, &note), vec![w.b.clone()]);
    let sd_b = restarted.get_sd(&w.b).unwrap();
    assert_eq!(sd_b.notes().content(&ctx, &note).unwrap(), "Packing list");
    assert!(!w.a_root.join("notes").join(&note).exists());
}

#[test]
fn test_crash_after_staging_rolls_back() {
    let ctx = StoreContext::new("laptop");
    let manager = manager();
    let w = world(&manager);
    let note = note_with_content(&manager, &w.a, &ctx, "Draft");

    manager.stage_move(&ctx, &note, &w.a, &w.b, None).unwrap();
    // Before recovery, the staged copy is already invisible.
    assert_eq!(visible_in(&manager, &note), vec![w.a.clone()]);
    drop(manager);

    let restarted = restart(&w, &ctx);
    assert_eq!(visible_in(&restarted, &note), vec![w.a.clone()]);
    assert!(!w.b_root.join("notes").join(&note).exists());
    let sd_a = restarted.get_sd(&w.a).unwrap();
    assert_eq!(sd_a.notes().content(&ctx, &note).unwrap(), "Draft");
}

#[test]
fn test_crash_after_commit_finalizes() {
    let ctx = StoreContext::new("laptop");
    let manager = manager();
    let w = world(&manager);
    let note = note_with_content(&manager, &w.a, &ctx, "Receipts");

    let staged = manager.stage_move(&ctx, &note, &w.a, &w.b, None).unwrap();
    manager.commit_move(&ctx, &staged).unwrap();
    // Committed: the journal already hides the source copy.
    assert_eq!(visible_in(&manager, &note), vec![w.b.clone()]);
    drop(manager);

    let restarted = restart(&w, &ctx);
    assert_eq!(visible_in(&restarted, &note), vec![w.b.clone()]);
    assert!(!w.a_root.join("notes").join(&note).exists());
    let sd_b = restarted.get_sd(&w.b).unwrap();
    assert!(sd_b.incoming_marker(&note).unwrap().is_none());
    assert_eq!(sd_b.notes().content(&ctx, &note).unwrap(), "Receipts");
}

#[test]
fn test_crash_between_journal_appends_still_commits() {
    let ctx = StoreContext::new("laptop");
    let manager = manager();
    let w = world(&manager);
    let note = note_with_content(&manager, &w.a, &ctx, "Half journaled");

    let staged = manager.stage_move(&ctx, &note, &w.a, &w.b, None).unwrap();
    // Only the destination journal got the entry.
    let entry = MoveEntry {
        note_id: staged.note_id.clone(),
        move_id: staged.move_id.clone(),
        from_sd: staged.from_sd.clone(),
        to_sd: staged.to_sd.clone(),
        timestamp: staged.timestamp,
    };
    manager.get_sd(&w.b).unwrap().moves().append(&ctx, &entry).unwrap();
    drop(manager);

    let restarted = restart(&w, &ctx);
    assert_eq!(visible_in(&restarted, &note), vec![w.b.clone()]);
}

#[test]
fn test_other_instance_recovers_committed_move() {
    let laptop = StoreContext::new("laptop");
    let desktop = StoreContext::new("desktop");
    let manager = manager();
    let w = world(&manager);
    let note = note_with_content(&manager, &w.a, &laptop, "Shared");

    let staged = manager.stage_move(&laptop, &note, &w.a, &w.b, None).unwrap();
    manager.commit_move(&laptop, &staged).unwrap();
    drop(manager);

    // The laptop never comes back; the desktop cleans up.
    let restarted = restart(&w, &desktop);
    assert_eq!(visible_in(&restarted, &note), vec![w.b.clone()]);
    assert!(!w.a_root.join("notes").join(&note).exists());
}

#[test]
fn test_move_there_and_back_keeps_one_copy() {
    let ctx = StoreContext::new("laptop");
    let manager = manager();
    let w = world(&manager);
    let note = note_with_content(&manager, &w.a, &ctx, "Boomerang");

    manager.move_note(&ctx, &note, &w.a, &w.b, None).unwrap();
    manager.move_note(&ctx, &note, &w.b, &w.a, None).unwrap();
    drop(manager);

    let restarted = restart(&w, &ctx);
    assert_eq!(visible_in(&restarted, &note), vec![w.a.clone()]);
    let sd_a = restarted.get_sd(&w.a).unwrap();
    assert_eq!(sd_a.notes().content(&ctx, &note).unwrap(), "Boomerang");
}

#[test]
fn test_repeated_moves_never_duplicate() {
    let ctx = StoreContext::new("laptop");
    let manager = manager();
    let w = world(&manager);

    for i in 0..10 {
        let note = note_with_content(&manager, &w.a, &ctx, &format!("note {}", i));
        let staged = manager.stage_move(&ctx, &note, &w.a, &w.b, None).unwrap();
        if i % 2 == 0 {
            manager.commit_move(&ctx, &staged).unwrap();
        }
        let restarted = restart(&w, &ctx);
        let expected = if i % 2 == 0 { &w.b } else { &w.a };
        assert_eq!(visible_in(&restarted, &note), vec![expected.clone()], "trial {}", i);
        assert!(restarted.get_sd(&w.b).unwrap().incoming_marker(&note).unwrap().is_none());
    }
}

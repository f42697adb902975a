//! Sync passes between two instances sharing one SD.

use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tidenote_core::activity::ACTIVITY_DIR;
use tidenote_core::config::SyncConfig;
use tidenote_core::context::StoreContext;
use tidenote_core::deletion::DELETED_DIR;
use tidenote_core::error::TideError;
use tidenote_core::events::EventRegistry;
use tidenote_core::fs::{FileSystem, InMemoryFileSystem};
use tidenote_core::lines;
use tidenote_core::sd::SdManager;
use tidenote_core::{NoteService, SyncEngine};

struct Peer {
    manager: Arc<SdManager>,
    ctx: StoreContext,
}

fn peer(fs: &InMemoryFileSystem, instance: &str) -> Peer {
    let shared: Arc<dyn FileSystem> = Arc::new(fs.clone());
    Peer {
        manager: Arc::new(SdManager::new(shared, Arc::new(EventRegistry::new()))),
        ctx: StoreContext::new(instance),
    }
}

fn engine_for(peer: &Peer, config: SyncConfig) -> SyncEngine {
    SyncEngine::new(Arc::clone(&peer.manager), peer.ctx.clone(), config)
}

#[test]
fn test_announced_record_stays_pending_until_it_arrives() {
    let fs = InMemoryFileSystem::new();
    let a = peer(&fs, "inst-a");
    let b = peer(&fs, "inst-b");
    let sd_a = a.manager.create_sd(Path::new("/sd"), "Shared").unwrap();
    b.manager.open_sd(Path::new("/sd")).unwrap();

    let note = sd_a.notes().create_note(&a.ctx, None).unwrap();
    sd_a.notes().set_content(&a.ctx, &note, "Hello").unwrap();
    let written = sd_a.notes().visible_seq(&note, "inst-a");

    // The activity line arrived before the log records it points at.
    let announced = written + 7;
    let activity = lines::instance_log_path(&Path::new("/sd").join(ACTIVITY_DIR), "inst-a");
    fs.append(&activity, format!("{}|inst-a_{}\n", note, announced).as_bytes())
        .unwrap();

    let engine = engine_for(&b, SyncConfig::default());
    let t0 = Instant::now();
    let report = engine.run_pass_at(t0);
    assert_eq!(report.pending, 1);
    assert_eq!(engine.status().pending_merge_count, 1);
    assert!(!engine.status().is_healthy());

    // Not due yet: nothing changes.
    let report = engine.run_pass_at(t0 + Duration::from_millis(50));
    assert_eq!(report.merged_notes, 0);
    assert_eq!(report.pending, 1);

    for i in 0..7 {
        sd_a.notes().insert_text(&a.ctx, &note, 0, &i.to_string()).unwrap();
    }
    assert_eq!(sd_a.notes().visible_seq(&note, "inst-a"), announced);

    let report = engine.run_pass_at(t0 + Duration::from_millis(300));
    assert_eq!(report.pending, 0);
    assert_eq!(report.gave_up, 0);
    assert!(engine.status().is_healthy());
    let sd_b = b.manager.get_sd(sd_a.id()).unwrap();
    assert_eq!(sd_b.notes().content(&b.ctx, &note).unwrap(), "6543210Hello");
}

#[test]
fn test_missing_record_is_given_up_after_max_attempts() {
    let fs = InMemoryFileSystem::new();
    let a = peer(&fs, "inst-a");
    let b = peer(&fs, "inst-b");
    let sd_a = a.manager.create_sd(Path::new("/sd"), "Shared").unwrap();
    b.manager.open_sd(Path::new("/sd")).unwrap();

    let note = sd_a.notes().create_note(&a.ctx, None).unwrap();
    let activity = lines::instance_log_path(&Path::new("/sd").join(ACTIVITY_DIR), "inst-a");
    fs.append(&activity, format!("{}|inst-a_500\n", note).as_bytes())
        .unwrap();

    let config = SyncConfig {
        pending_max_attempts: 2,
        ..SyncConfig::default()
    };
    let engine = engine_for(&b, config);
    let t0 = Instant::now();
    let report = engine.run_pass_at(t0);
    assert_eq!(report.pending, 1);
    assert_eq!(report.gave_up, 0);

    let report = engine.run_pass_at(t0 + Duration::from_secs(1));
    assert_eq!(report.gave_up, 1);
    assert_eq!(report.pending, 0);

    // What did arrive is still readable.
    let sd_b = b.manager.get_sd(sd_a.id()).unwrap();
    assert!(sd_b.notes().cached(&note).is_some());
}

#[test]
fn test_torn_deletion_line_is_ignored_until_complete() {
    let fs = InMemoryFileSystem::new();
    let a = peer(&fs, "inst-a");
    let b = peer(&fs, "inst-b");
    let sd_a = a.manager.create_sd(Path::new("/sd"), "Shared").unwrap();
    b.manager.open_sd(Path::new("/sd")).unwrap();
    let note = sd_a.notes().create_note(&a.ctx, None).unwrap();

    let engine = engine_for(&b, SyncConfig::default());
    engine.run_pass();
    let sd_b = b.manager.get_sd(sd_a.id()).unwrap();
    assert!(sd_b.notes().cached(&note).is_some());

    // A peer's tombstone, still missing its newline.
    let deleted = lines::instance_log_path(&Path::new("/sd").join(DELETED_DIR), "peer");
    fs.append(&deleted, format!("{}|100", note).as_bytes()).unwrap();
    let report = engine.run_pass();
    assert_eq!(report.deleted_notes, 0);
    assert!(sd_b.notes().get(&b.ctx, &note).is_ok());

    fs.append(&deleted, b"\n").unwrap();
    let report = engine.run_pass();
    assert_eq!(report.deleted_notes, 1);
    assert!(matches!(
        sd_b.notes().get(&b.ctx, &note),
        Err(TideError::NoteDeleted(_))
    ));
    assert!(!sd_b.notes().exists_on_disk(&note));
}

#[test]
fn test_concurrent_comments_reach_both_instances() {
    let fs = InMemoryFileSystem::new();
    let shared: Arc<dyn FileSystem> = Arc::new(fs.clone());
    let a = NoteService::new(Arc::clone(&shared), StoreContext::new("inst-a"), SyncConfig::default());
    let b = NoteService::new(shared, StoreContext::new("inst-b"), SyncConfig::default());
    let sd = a.add_storage_dir(Path::new("/sd"), "Shared").unwrap().id;
    b.add_storage_dir(Path::new("/sd"), "Shared").unwrap();

    let note = a.create_note(&sd, None).unwrap();
    a.set_note_content(&sd, &note, "Alpha Beta Gamma Delta").unwrap();
    assert_eq!(b.sync_now().merged_notes, 1);

    a.add_comment(&sd, &note, "ann", "Greek?", 0, 5).unwrap();
    b.add_comment(&sd, &note, "bo", "Last word", 17, 22).unwrap();

    a.sync_now();
    b.sync_now();

    for service in [&a, &b] {
        let mut quoted: Vec<String> = service
            .comments(&sd, &note)
            .unwrap()
            .into_iter()
            .map(|t| t.quoted_text)
            .collect();
        quoted.sort();
        assert_eq!(quoted, vec!["Alpha".to_string(), "Delta".to_string()]);
    }
    assert!(a.sync_status().is_healthy());
    assert!(b.sync_status().is_healthy());
}

#[test]
fn test_folder_changes_are_picked_up_by_a_pass() {
    let fs = InMemoryFileSystem::new();
    let a = peer(&fs, "inst-a");
    let b = peer(&fs, "inst-b");
    let sd_a = a.manager.create_sd(Path::new("/sd"), "Shared").unwrap();
    let sd_b = b.manager.open_sd(Path::new("/sd")).unwrap();
    let engine = engine_for(&b, SyncConfig::default());
    engine.run_pass();

    let folder = sd_a.folders().create_folder(&a.ctx, "Trips", None).unwrap();
    assert!(sd_b.folders().get(&folder).is_none());
    let report = engine.run_pass();
    assert_eq!(report.folders_reloaded, 1);
    assert_eq!(sd_b.folders().get(&folder).unwrap().name, "Trips");

    // Nothing new on disk: the tree is not reloaded again.
    assert_eq!(engine.run_pass().folders_reloaded, 0);
}

#[test]
fn test_activity_trimmed_while_peer_lags_still_converges() {
    let fs = InMemoryFileSystem::new();
    let a = peer(&fs, "inst-a");
    let b = peer(&fs, "inst-b");
    let sd_a = a.manager.create_sd(Path::new("/sd"), "Shared").unwrap();
    let sd_b = b.manager.open_sd(Path::new("/sd")).unwrap();

    let edited = sd_a.notes().create_note(&a.ctx, None).unwrap();
    let other = sd_a.notes().create_note(&a.ctx, None).unwrap();
    let engine = engine_for(&b, SyncConfig::default());
    engine.run_pass();
    assert!(sd_b.notes().cached(&edited).is_some());
    assert!(sd_b.notes().cached(&other).is_some());

    // Announcements for `edited` are trimmed before B reads them.
    for word in ["one ", "two ", "three "] {
        sd_a.notes().insert_text(&a.ctx, &edited, 0, word).unwrap();
    }
    sd_a.notes().set_content(&a.ctx, &other, "kept").unwrap();
    assert!(sd_a.notes().activity().compact_own(&a.ctx, 1).unwrap() > 0);

    let report = engine.run_pass();
    assert_eq!(report.pending, 0);
    assert_eq!(sd_b.notes().content(&b.ctx, &other).unwrap(), "kept");
    assert_eq!(
        sd_b.notes().content(&b.ctx, &edited).unwrap(),
        "three two one "
    );

    // Later appends after the trim are read exactly once.
    sd_a.notes().insert_text(&a.ctx, &edited, 0, "four ").unwrap();
    let report = engine.run_pass();
    assert_eq!(report.merged_notes, 1);
    assert_eq!(
        sd_b.notes().content(&b.ctx, &edited).unwrap(),
        "four three two one "
    );
}

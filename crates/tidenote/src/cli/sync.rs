//! `tidenote sync` commands.

use std::sync::Arc;

use tidenote_core::NoteService;
use tidenote_core::events::{ChangeEvent, ChangeOrigin};
use tidenote_core::sync::{PassReport, SyncStatus};

use crate::cli::args::SyncCommands;

pub fn handle_sync_command(command: SyncCommands, service: &NoteService) -> bool {
    match command {
        SyncCommands::Once => {
            let report = service.sync_now();
            print_report(&report);
            report.degraded == 0
        }
        SyncCommands::Status => {
            service.sync_now();
            print_status(&service.sync_status());
            true
        }
        SyncCommands::Watch => handle_watch(service),
    }
}

fn print_report(report: &PassReport) {
    println!("✓ Sync pass finished");
    println!("  Notes merged: {}", report.merged_notes);
    println!("  Notes deleted elsewhere: {}", report.deleted_notes);
    println!("  Notes moved elsewhere: {}", report.moved_notes);
    println!("  Folder trees reloaded: {}", report.folders_reloaded);
    if report.pending > 0 {
        println!("  Still waiting on {} change(s)", report.pending);
    }
    if report.gave_up > 0 {
        println!("  Gave up on {} change(s)", report.gave_up);
    }
    if report.degraded > 0 {
        eprintln!("✗ {} storage director(ies) unreachable", report.degraded);
    }
}

fn print_status(status: &SyncStatus) {
    if status.is_healthy() {
        println!("✓ Up to date");
        return;
    }
    if status.pending_merge_count > 0 {
        println!("Waiting on {} change(s):", status.pending_merge_count);
        for (sd, notes) in &status.pending {
            for note in notes {
                println!("  {} / {}", sd, note);
            }
        }
    }
    for sd in &status.degraded_sds {
        println!("Unreachable: {}", sd);
    }
}

/// Run the background loop until Ctrl+C, printing remote changes.
fn handle_watch(service: &NoteService) -> bool {
    let runtime = match tokio::runtime::Runtime::new() {
        Ok(runtime) => runtime,
        Err(e) => {
            eprintln!("✗ Failed to create Tokio runtime: {}", e);
            return false;
        }
    };

    let subscription = service.subscribe(Arc::new(|event: &ChangeEvent| match event {
        ChangeEvent::NoteUpdated {
            note_id,
            origin: ChangeOrigin::Remote,
            ..
        } => println!("  updated {}", note_id),
        ChangeEvent::NoteDeleted { note_id, .. } => println!("  deleted {}", note_id),
        ChangeEvent::NoteMoved { note_id, to_sd, .. } => println!("  moved {} to {}", note_id, to_sd),
        ChangeEvent::SyncStatusChanged { status } if !status.is_healthy() => {
            log::info!("{} change(s) pending", status.pending_merge_count)
        }
        _ => {}
    }));

    let ok = runtime.block_on(async {
        let handle = match service.start_sync() {
            Ok(handle) => handle,
            Err(e) => {
                eprintln!("✗ Could not start sync: {}", e);
                return false;
            }
        };
        println!("Watching {} storage director(ies). Press Ctrl+C to stop.", service.list_storage_dirs().len());

        if let Err(e) = tokio::signal::ctrl_c().await {
            eprintln!("Failed to listen for Ctrl+C: {}", e);
        }
        println!("\nShutting down sync...");
        service.stop_sync();
        if let Err(e) = handle.await {
            log::warn!("Sync loop ended abnormally: {}", e);
        }
        true
    });

    service.unsubscribe(subscription);
    println!("Sync stopped.");
    ok
}

//! `tidenote note` commands.

use tidenote_core::NoteService;
use tidenote_core::note::NoteSummary;

use crate::cli::args::NoteCommands;
use crate::cli::util::{self, resolve_sd};

pub fn handle_note_command(command: NoteCommands, service: &NoteService) -> bool {
    match command {
        NoteCommands::Create { sd, folder, content } => {
            let Some(sd) = resolve_sd(service, &sd) else {
                return false;
            };
            handle_create(service, &sd, folder.as_deref(), content.as_deref())
        }
        NoteCommands::List {
            sd,
            folder,
            deleted,
            json,
        } => {
            let Some(sd) = resolve_sd(service, &sd) else {
                return false;
            };
            let notes = if deleted {
                service.recently_deleted(&sd)
            } else if folder.is_some() {
                service.list_notes_in_folder(&sd, folder.as_deref())
            } else {
                service.list_notes(&sd)
            };
            match notes {
                Ok(notes) => print_notes(&notes, json),
                Err(e) => {
                    eprintln!("✗ Error listing notes: {}", e);
                    false
                }
            }
        }
        NoteCommands::Show { sd, note, comments } => {
            let Some(sd) = resolve_sd(service, &sd) else {
                return false;
            };
            handle_show(service, &sd, &note, comments)
        }
        NoteCommands::Edit { sd, note, content } => {
            let Some(sd) = resolve_sd(service, &sd) else {
                return false;
            };
            report(
                service.set_note_content(&sd, &note, &content),
                "Updated note",
            )
        }
        NoteCommands::Pin { sd, note, off } => {
            let Some(sd) = resolve_sd(service, &sd) else {
                return false;
            };
            let message = if off { "Unpinned note" } else { "Pinned note" };
            report(service.set_note_pinned(&sd, &note, !off), message)
        }
        NoteCommands::Move {
            sd,
            note,
            folder,
            to,
        } => {
            let Some(from) = resolve_sd(service, &sd) else {
                return false;
            };
            match to {
                Some(to) => {
                    let Some(to) = resolve_sd(service, &to) else {
                        return false;
                    };
                    match service.move_note_to_sd(&note, &from, &to, folder.as_deref()) {
                        Ok(entry) => {
                            println!("✓ Moved note to {}", entry.to_sd);
                            true
                        }
                        Err(e) => {
                            eprintln!("✗ Error moving note: {}", e);
                            false
                        }
                    }
                }
                None => report(
                    service.move_note_to_folder(&from, &note, folder.as_deref()),
                    "Moved note",
                ),
            }
        }
        NoteCommands::Delete { sd, note, permanent } => {
            let Some(sd) = resolve_sd(service, &sd) else {
                return false;
            };
            if permanent {
                match service.permanently_delete_note(&sd, &note) {
                    Ok(()) => {
                        println!("✓ Deleted note permanently");
                        true
                    }
                    Err(e) => {
                        eprintln!("✗ {}", e);
                        false
                    }
                }
            } else {
                report(service.delete_note(&sd, &note), "Moved note to recently deleted")
            }
        }
        NoteCommands::Restore { sd, note } => {
            let Some(sd) = resolve_sd(service, &sd) else {
                return false;
            };
            report(service.restore_note(&sd, &note), "Restored note")
        }
        NoteCommands::Comment {
            sd,
            note,
            text,
            start,
            end,
        } => {
            let Some(sd) = resolve_sd(service, &sd) else {
                return false;
            };
            let author = service.context().instance_id().to_string();
            match service.add_comment(&sd, &note, &author, &text, start, end) {
                Ok(thread) => {
                    println!("✓ Added comment {}", thread);
                    true
                }
                Err(e) => {
                    eprintln!("✗ Error adding comment: {}", e);
                    false
                }
            }
        }
        NoteCommands::Compact { sd, note } => {
            let Some(sd) = resolve_sd(service, &sd) else {
                return false;
            };
            match service.compact_note(&sd, &note) {
                Ok(result) => {
                    println!("✓ Wrote {}", result.snapshot.display());
                    println!(
                        "  Removed {} log file(s), {} snapshot(s)",
                        result.removed_logs, result.removed_snapshots
                    );
                    true
                }
                Err(e) => {
                    eprintln!("✗ Error compacting note: {}", e);
                    false
                }
            }
        }
    }
}

/// Print the outcome of a write. The `Option<u64>` is the sequence number
/// of the appended record, `None` when nothing changed.
fn report(result: tidenote_core::Result<Option<u64>>, message: &str) -> bool {
    match result {
        Ok(Some(seq)) => {
            println!("✓ {}", message);
            log::debug!("Appended record {}", seq);
            true
        }
        Ok(None) => {
            println!("  No change");
            true
        }
        Err(e) => {
            eprintln!("✗ {}", e);
            false
        }
    }
}

fn handle_create(service: &NoteService, sd: &str, folder: Option<&str>, content: Option<&str>) -> bool {
    let note = match service.create_note(sd, folder) {
        Ok(note) => note,
        Err(e) => {
            eprintln!("✗ Error creating note: {}", e);
            return false;
        }
    };
    if let Some(content) = content
        && let Err(e) = service.set_note_content(sd, &note, content)
    {
        eprintln!("✗ Created note {} but could not set its content: {}", note, e);
        return false;
    }
    println!("✓ Created note {}", note);
    true
}

fn handle_show(service: &NoteService, sd: &str, note: &str, comments: bool) -> bool {
    let content = match service.note_content(sd, note) {
        Ok(content) => content,
        Err(e) => {
            eprintln!("✗ {}", e);
            return false;
        }
    };
    println!("{}", content);

    if comments {
        match service.comments(sd, note) {
            Ok(threads) => {
                for thread in threads {
                    let state = if thread.resolved { "resolved" } else { "open" };
                    println!();
                    println!("[{}] {} ({}): {}", state, thread.author, thread.id, thread.body);
                    if thread.anchor.is_some() {
                        println!("  on \"{}\"", thread.quoted_text);
                    }
                    for reply in thread.replies {
                        println!("  > {}: {}", reply.author, reply.body);
                    }
                }
            }
            Err(e) => {
                eprintln!("✗ Error reading comments: {}", e);
                return false;
            }
        }
    }
    true
}

fn print_notes(notes: &[NoteSummary], json: bool) -> bool {
    if json {
        return match serde_json::to_string_pretty(notes) {
            Ok(out) => {
                println!("{}", out);
                true
            }
            Err(e) => {
                eprintln!("✗ {}", e);
                false
            }
        };
    }
    if notes.is_empty() {
        println!("No notes.");
        return true;
    }
    for note in notes {
        let pin = if note.pinned { "*" } else { " " };
        let when = note.deleted_at.unwrap_or(note.modified_at);
        println!("{} {}  {}  {}", pin, note.id, util::format_time(when), note.title);
    }
    true
}

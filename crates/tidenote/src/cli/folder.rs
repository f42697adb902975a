//! `tidenote folder` commands.

use tidenote_core::NoteService;
use tidenote_core::folder::FolderInfo;

use crate::cli::args::FolderCommands;
use crate::cli::util::resolve_sd;

pub fn handle_folder_command(command: FolderCommands, service: &NoteService) -> bool {
    let (sd, result) = match command {
        FolderCommands::Create { sd, name, parent } => {
            let Some(sd) = resolve_sd(service, &sd) else {
                return false;
            };
            let result = service
                .create_folder(&sd, &name, parent.as_deref())
                .map(|id| format!("Created folder '{}' ({})", name, id));
            (sd, result)
        }
        FolderCommands::List { sd } => {
            let Some(sd) = resolve_sd(service, &sd) else {
                return false;
            };
            return print_tree(service, &sd);
        }
        FolderCommands::Rename { sd, folder, name } => {
            let Some(sd) = resolve_sd(service, &sd) else {
                return false;
            };
            let result = service
                .rename_folder(&sd, &folder, &name)
                .map(|()| format!("Renamed folder to '{}'", name));
            (sd, result)
        }
        FolderCommands::Move { sd, folder, parent } => {
            let Some(sd) = resolve_sd(service, &sd) else {
                return false;
            };
            let result = service
                .move_folder(&sd, &folder, parent.as_deref())
                .map(|()| "Moved folder".to_string());
            (sd, result)
        }
        FolderCommands::Delete { sd, folder } => {
            let Some(sd) = resolve_sd(service, &sd) else {
                return false;
            };
            let result = service
                .delete_folder(&sd, &folder)
                .map(|()| "Deleted folder".to_string());
            (sd, result)
        }
    };

    match result {
        Ok(message) => {
            println!("✓ {}", message);
            log::debug!("Folder change written to {}", sd);
            true
        }
        Err(e) => {
            eprintln!("✗ {}", e);
            false
        }
    }
}

fn print_tree(service: &NoteService, sd: &str) -> bool {
    fn walk(service: &NoteService, sd: &str, parent: Option<&str>, depth: usize) -> tidenote_core::Result<()> {
        let children: Vec<FolderInfo> = service.folder_children(sd, parent)?;
        for folder in children {
            let notes = service.list_notes_in_folder(sd, Some(&folder.id))?.len();
            println!(
                "{}{}  ({} note{})  {}",
                "  ".repeat(depth),
                folder.name,
                notes,
                if notes == 1 { "" } else { "s" },
                folder.id
            );
            walk(service, sd, Some(&folder.id), depth + 1)?;
        }
        Ok(())
    }

    match walk(service, sd, None, 0) {
        Ok(()) => true,
        Err(e) => {
            eprintln!("✗ Error reading folders: {}", e);
            false
        }
    }
}

/// Clap argument definitions
mod args;

/// Folder command handlers
mod folder;

/// Note command handlers
mod note;

/// Storage directory command handlers
mod sd;

/// `sync` commands
mod sync;

/// Shared CLI utilities
mod util;

use clap::Parser;

use tidenote_core::NoteService;
use tidenote_core::config::Config;

pub use args::Cli;
use args::Commands;

/// Main entry point for the CLI
pub fn run_cli() {
    let cli = Cli::parse();

    let mut config = match util::load_config(cli.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("✗ Error loading config: {}", e);
            std::process::exit(1);
        }
    };

    // `sd` commands edit the config before any service exists.
    let success = match cli.command {
        Commands::Sd { command } => sd::handle_sd_command(command, &mut config, cli.config.as_deref()),
        Commands::Note { command } => {
            with_service(&config, |service| note::handle_note_command(command, service))
        }
        Commands::Folder { command } => {
            with_service(&config, |service| folder::handle_folder_command(command, service))
        }
        Commands::Sync { command } => {
            with_service(&config, |service| sync::handle_sync_command(command, service))
        }
        Commands::Recover => with_service(&config, handle_recover),
    };

    if !success {
        std::process::exit(1);
    }
}

fn with_service(config: &Config, f: impl FnOnce(&NoteService) -> bool) -> bool {
    match util::open_service(config) {
        Some(service) => f(&service),
        None => false,
    }
}

/// Handle the recover command
/// Returns true on success, false on error
fn handle_recover(service: &NoteService) -> bool {
    match service.recover() {
        Ok(report) if report.is_empty() => {
            println!("✓ Nothing to recover");
            true
        }
        Ok(report) => {
            for id in &report.finalized {
                println!("  finalized move of {}", id);
            }
            for id in &report.rolled_back {
                println!("  rolled back staged copy of {}", id);
            }
            for id in &report.duplicates_removed {
                println!("  removed stale copy of {}", id);
            }
            println!("✓ Recovery complete");
            true
        }
        Err(e) => {
            eprintln!("✗ Recovery failed: {}", e);
            false
        }
    }
}

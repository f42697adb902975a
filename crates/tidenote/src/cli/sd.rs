//! `tidenote sd` commands.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use tidenote_core::config::Config;
use tidenote_core::events::EventRegistry;
use tidenote_core::fs::RealFileSystem;
use tidenote_core::sd::{SdManager, read_identity};

use crate::cli::args::SdCommands;
use crate::cli::util;

pub fn handle_sd_command(command: SdCommands, config: &mut Config, config_path: Option<&Path>) -> bool {
    match command {
        SdCommands::Init { path, name } => handle_init(config, config_path, path, &name),
        SdCommands::List => handle_list(config),
        SdCommands::Remove { sd } => handle_remove(config, config_path, &sd),
    }
}

fn default_sd_path() -> PathBuf {
    dirs::document_dir()
        .or_else(dirs::home_dir)
        .unwrap_or_else(|| PathBuf::from("."))
        .join("tidenote")
}

fn handle_init(config: &mut Config, config_path: Option<&Path>, path: Option<PathBuf>, name: &str) -> bool {
    let path = path.unwrap_or_else(default_sd_path);
    let manager = SdManager::new(Arc::new(RealFileSystem), Arc::new(EventRegistry::new()));
    let sd = match manager.add_sd(&path, name) {
        Ok(sd) => sd,
        Err(e) => {
            eprintln!("✗ Error initializing storage directory: {}", e);
            return false;
        }
    };

    let added = config.add_storage_dir(path.clone(), sd.name());
    if let Err(e) = util::save_config(config, config_path) {
        eprintln!("✗ Error saving config: {}", e);
        return false;
    }

    if added {
        println!("✓ Added storage directory '{}'", sd.name());
    } else {
        println!("  Storage directory already configured");
    }
    println!("  Id: {}", sd.id());
    println!("  Path: {}", path.display());
    true
}

fn handle_list(config: &Config) -> bool {
    if config.storage_dirs.is_empty() {
        println!("No storage directories configured.");
        return true;
    }
    for entry in &config.storage_dirs {
        match read_identity(&RealFileSystem, &entry.path) {
            Ok(identity) => println!(
                "{}  {}  {}",
                identity.id,
                identity.name,
                entry.path.display()
            ),
            Err(e) => println!(
                "{:<36}  {}  {}  (unavailable: {})",
                "-",
                entry.name,
                entry.path.display(),
                e
            ),
        }
    }
    true
}

fn handle_remove(config: &mut Config, config_path: Option<&Path>, key: &str) -> bool {
    // Match the configured entries directly so unreachable SDs can be removed too.
    let path = config
        .storage_dirs
        .iter()
        .find(|entry| {
            entry.name == key
                || entry.path == Path::new(key)
                || read_identity(&RealFileSystem, &entry.path).is_ok_and(|identity| identity.id == key)
        })
        .map(|entry| entry.path.clone());

    let Some(path) = path else {
        eprintln!("✗ No configured storage directory matches '{}'", key);
        return false;
    };
    config.remove_storage_dir(&path);
    if let Err(e) = util::save_config(config, config_path) {
        eprintln!("✗ Error saving config: {}", e);
        return false;
    }
    println!("✓ Removed {} from the config (files were kept)", path.display());
    true
}

use std::path::{Path, PathBuf};

use tidenote_core::NoteService;
use tidenote_core::config::Config;
use tidenote_core::error::{Result, TideError};
use tidenote_core::fs::RealFileSystem;
use tidenote_core::sd::SdInfo;

/// Load the config from `path`, or from the default location.
pub fn load_config(path: Option<&Path>) -> Result<Config> {
    match path {
        Some(path) => Config::load_or_init(&RealFileSystem, path),
        None => Config::load(),
    }
}

pub fn save_config(config: &Config, path: Option<&Path>) -> Result<()> {
    match path {
        Some(path) => config.save_to(&RealFileSystem, path),
        None => config.save(),
    }
}

/// Open every configured storage directory. Prints the error and returns
/// `None` on failure.
pub fn open_service(config: &Config) -> Option<NoteService> {
    if config.storage_dirs.is_empty() {
        eprintln!("✗ No storage directories configured. Create one with:");
        eprintln!("  tidenote sd init <path>");
        return None;
    }
    match NoteService::open(config) {
        Ok(service) => Some(service),
        Err(e) => {
            eprintln!("✗ Error opening storage directories: {}", e);
            None
        }
    }
}

/// Find an open SD by id, name or root path.
pub fn find_sd(sds: &[SdInfo], key: &str) -> Result<SdInfo> {
    let path = PathBuf::from(key);
    sds.iter()
        .find(|sd| sd.id == key)
        .or_else(|| sds.iter().find(|sd| sd.name == key))
        .or_else(|| sds.iter().find(|sd| sd.root == path))
        .cloned()
        .ok_or_else(|| TideError::SdNotFound(key.to_string()))
}

/// Resolve `key` against the service's open SDs, printing on failure.
pub fn resolve_sd(service: &NoteService, key: &str) -> Option<String> {
    match find_sd(&service.list_storage_dirs(), key) {
        Ok(sd) => Some(sd.id),
        Err(e) => {
            eprintln!("✗ {}", e);
            None
        }
    }
}

/// Format a millisecond timestamp for listings.
pub fn format_time(ms: i64) -> String {
    chrono::DateTime::from_timestamp_millis(ms)
        .map(|t| t.with_timezone(&chrono::Local).format("%Y-%m-%d %H:%M").to_string())
        .unwrap_or_else(|| "-".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn info(id: &str, name: &str, root: &str) -> SdInfo {
        SdInfo {
            id: id.to_string(),
            name: name.to_string(),
            root: PathBuf::from(root),
            created_at: 0,
        }
    }

    #[test]
    fn test_find_sd_prefers_id_then_name_then_path() {
        let sds = vec![info("a1", "Work", "/work"), info("b2", "a1", "/home")];
        assert_eq!(find_sd(&sds, "a1").unwrap().root, PathBuf::from("/work"));
        assert_eq!(find_sd(&sds, "Work").unwrap().id, "a1");
        assert_eq!(find_sd(&sds, "/home").unwrap().id, "b2");
        assert!(matches!(find_sd(&sds, "nope"), Err(TideError::SdNotFound(_))));
    }

    #[test]
    fn test_explicit_config_path_is_created_and_reused() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("config.toml");

        let mut config = load_config(Some(&path)).unwrap();
        assert!(path.exists());
        assert!(config.add_storage_dir(dir.path().join("notes"), "Notes"));
        save_config(&config, Some(&path)).unwrap();

        let reloaded = load_config(Some(&path)).unwrap();
        assert_eq!(reloaded.instance_id, config.instance_id);
        assert_eq!(reloaded.storage_dirs.len(), 1);
        assert_eq!(reloaded.storage_dirs[0].name, "Notes");
        assert!(open_service(&Config::default()).is_none());
    }

    #[test]
    fn test_format_time_handles_out_of_range() {
        assert_eq!(format_time(i64::MAX), "-");
        assert_ne!(format_time(0), "-");
    }
}

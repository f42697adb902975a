//! Native change notifications for SD roots.

use std::path::{Path, PathBuf};

use notify::{Config, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc::UnboundedSender;

use super::SyncTrigger;
use crate::error::Result;
use crate::fs;

/// A recursive watcher on one SD root.
///
/// The callback only forwards paths as [`SyncTrigger::FileChanged`]; the
/// orchestrator decides what to do with them. Dropping the value stops it.
pub struct SdWatcher {
    root: PathBuf,
    _watcher: RecommendedWatcher,
}

impl SdWatcher {
    pub fn start(root: &Path, sender: UnboundedSender<SyncTrigger>) -> Result<Self> {
        let mut watcher = RecommendedWatcher::new(
            move |res: std::result::Result<notify::Event, notify::Error>| match res {
                Ok(event) => {
                    if matches!(event.kind, EventKind::Access(_)) {
                        return;
                    }
                    for path in event.paths {
                        if fs::is_temporary(&path) {
                            continue;
                        }
                        // The receiver is gone once the loop shut down.
                        let _ = sender.send(SyncTrigger::FileChanged(path));
                    }
                }
                Err(e) => log::warn!("File watcher error: {}", e),
            },
            Config::default(),
        )?;
        watcher.watch(root, RecursiveMode::Recursive)?;
        log::debug!("Watching {:?}", root);
        Ok(Self {
            root: root.to_path_buf(),
            _watcher: watcher,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

impl std::fmt::Debug for SdWatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SdWatcher")
            .field("root", &self.root)
            .finish_non_exhaustive()
    }
}

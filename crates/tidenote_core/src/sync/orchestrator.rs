//! The background sync loop.
//!
//! Triggers from the watchers, the poll timer and the pending-retry timer
//! all arrive on one queue. File-change bursts are collapsed over the
//! debounce window, then a [`SyncEngine`] pass runs on the blocking pool.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

use super::SyncTrigger;
use super::engine::SyncEngine;
use super::watcher::SdWatcher;
use crate::config::SyncConfig;
use crate::error::{Result, TideError};
use crate::sd::StorageDirectory;

/// Owns the trigger queue, the watchers and the loop task.
pub struct SyncOrchestrator {
    engine: Arc<SyncEngine>,
    sender: UnboundedSender<SyncTrigger>,
    receiver: Mutex<Option<UnboundedReceiver<SyncTrigger>>>,
    watchers: Mutex<Vec<SdWatcher>>,
}

impl SyncOrchestrator {
    pub fn new(engine: Arc<SyncEngine>) -> Self {
        let (sender, receiver) = mpsc::unbounded_channel();
        Self {
            engine,
            sender,
            receiver: Mutex::new(Some(receiver)),
            watchers: Mutex::new(Vec::new()),
        }
    }

    pub fn engine(&self) -> &Arc<SyncEngine> {
        &self.engine
    }

    /// Queue a trigger. Returns false once the loop has stopped.
    pub fn trigger(&self, trigger: SyncTrigger) -> bool {
        self.sender.send(trigger).is_ok()
    }

    /// A handle for producers outside the orchestrator.
    pub fn sender(&self) -> UnboundedSender<SyncTrigger> {
        self.sender.clone()
    }

    /// Watch an SD root. A root that cannot be watched is still covered by
    /// polling, so failures are only logged.
    pub fn watch(&self, sd: &StorageDirectory) -> bool {
        match SdWatcher::start(sd.root(), self.sender.clone()) {
            Ok(watcher) => {
                let mut watchers = self.watchers.lock().unwrap_or_else(|e| e.into_inner());
                watchers.retain(|w| w.root() != sd.root());
                watchers.push(watcher);
                true
            }
            Err(e) => {
                log::warn!("Cannot watch {:?}, relying on polling: {}", sd.root(), e);
                false
            }
        }
    }

    /// Stop watching a root.
    pub fn unwatch(&self, root: &std::path::Path) {
        let mut watchers = self.watchers.lock().unwrap_or_else(|e| e.into_inner());
        watchers.retain(|w| w.root() != root);
    }

    /// Spawn the loop on the current tokio runtime.
    ///
    /// The first pass runs right away inside the spawned task, so startup
    /// never waits on it.
    pub fn start(&self) -> Result<JoinHandle<()>> {
        let receiver = self
            .receiver
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
            .ok_or(TideError::SyncAlreadyStarted)?;
        let engine = Arc::clone(&self.engine);
        Ok(tokio::spawn(run_loop(engine, receiver)))
    }

    /// Ask the loop to stop after the current pass.
    pub fn shutdown(&self) {
        let _ = self.sender.send(SyncTrigger::Shutdown);
        self.watchers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clear();
    }
}

impl std::fmt::Debug for SyncOrchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncOrchestrator")
            .field("engine", &self.engine)
            .finish_non_exhaustive()
    }
}

async fn sleep_for(delay: Option<Duration>) {
    match delay {
        Some(delay) => tokio::time::sleep(delay).await,
        None => std::future::pending::<()>().await,
    }
}

async fn run_pass(engine: &Arc<SyncEngine>) {
    let engine = Arc::clone(engine);
    match tokio::task::spawn_blocking(move || engine.run_pass()).await {
        Ok(report) => log::debug!("Sync pass finished: {:?}", report),
        Err(e) => log::warn!("Sync pass failed: {}", e),
    }
}

/// Drain the queue for the debounce window. Returns true if a shutdown
/// arrived meanwhile.
async fn debounce(receiver: &mut UnboundedReceiver<SyncTrigger>, window: Duration) -> bool {
    let deadline = Instant::now() + window;
    loop {
        tokio::select! {
            trigger = receiver.recv() => match trigger {
                Some(SyncTrigger::Shutdown) | None => return true,
                Some(_) => continue,
            },
            _ = tokio::time::sleep_until(deadline) => return false,
        }
    }
}

async fn run_loop(engine: Arc<SyncEngine>, mut receiver: UnboundedReceiver<SyncTrigger>) {
    let config: SyncConfig = engine.config().clone();
    log::info!(
        "Sync loop started (poll every {:?}, debounce {:?})",
        config.poll_interval(),
        config.debounce()
    );
    run_pass(&engine).await;

    let mut poll = tokio::time::interval_at(
        Instant::now() + config.poll_interval(),
        config.poll_interval(),
    );
    poll.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        let retry = engine.next_retry_delay();
        let trigger = tokio::select! {
            trigger = receiver.recv() => match trigger {
                Some(trigger) => trigger,
                None => break,
            },
            _ = poll.tick() => SyncTrigger::Poll,
            _ = sleep_for(retry) => SyncTrigger::RetryPending,
        };

        let stop = match trigger {
            SyncTrigger::Shutdown => break,
            SyncTrigger::FileChanged(path) => {
                log::trace!("Change under {:?}", path);
                debounce(&mut receiver, config.debounce()).await
            }
            SyncTrigger::Poll | SyncTrigger::RetryPending => false,
        };
        run_pass(&engine).await;
        if stop {
            break;
        }
    }
    log::info!("Sync loop stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::StoreContext;
    use crate::events::{ChangeEvent, EventRegistry};
    use crate::fs::{FileSystem, InMemoryFileSystem};
    use crate::sd::SdManager;
    use std::path::{Path, PathBuf};

    #[tokio::test]
    async fn test_synthetic_trigger_merges_and_shutdown_stops_loop() {
        let fs: Arc<dyn FileSystem> = Arc::new(InMemoryFileSystem::new());
        let writer_manager = SdManager::new(Arc::clone(&fs), Arc::new(EventRegistry::new()));
        let writer = StoreContext::new("writer");
        let sd_id = writer_manager
            .create_sd(Path::new("/sd"), "Shared")
            .unwrap()
            .id()
            .to_string();

        let events = Arc::new(EventRegistry::new());
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        events.subscribe(Arc::new(move |e: &ChangeEvent| {
            sink.lock().unwrap().push(e.clone());
        }));
        let reader_manager = Arc::new(SdManager::new(Arc::clone(&fs), events));
        reader_manager.open_sd(Path::new("/sd")).unwrap();

        let config = SyncConfig {
            poll_interval_ms: 60_000,
            debounce_ms: 10,
            ..SyncConfig::default()
        };
        let engine = Arc::new(SyncEngine::new(
            Arc::clone(&reader_manager),
            StoreContext::new("reader"),
            config,
        ));
        let orchestrator = SyncOrchestrator::new(Arc::clone(&engine));
        let handle = orchestrator.start().unwrap();
        assert!(matches!(orchestrator.start(), Err(TideError::SyncAlreadyStarted)));

        let sd = writer_manager.get_sd(&sd_id).unwrap();
        let note = sd.notes().create_note(&writer, None).unwrap();
        sd.notes().set_content(&writer, &note, "hello").unwrap();

        assert!(orchestrator.trigger(SyncTrigger::FileChanged(PathBuf::from("/sd/activity/writer.log"))));
        orchestrator.trigger(SyncTrigger::Shutdown);
        handle.await.unwrap();

        let reader_sd = reader_manager.get_sd(&sd_id).unwrap();
        assert!(reader_sd.notes().cached(&note).is_some());
        let events = seen.lock().unwrap();
        assert!(events.iter().any(|e| matches!(
            e,
            ChangeEvent::NoteUpdated { note_id, .. } if *note_id == note
        )));
    }
}

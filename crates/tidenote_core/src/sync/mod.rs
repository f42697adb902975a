//! Change discovery and merging across instances.
//!
//! Each SD goes `Idle -> Scanning -> Merging -> Idle` once per pass. Passes
//! are driven by [`SyncTrigger`]s: native file events, a poll timer, the
//! retry timer of pending activity entries, or tests injecting triggers by
//! hand.

pub mod engine;
pub mod orchestrator;
pub mod pending;
pub mod status;
pub mod watcher;

use std::path::PathBuf;

pub use engine::{PassReport, SyncEngine};
pub use orchestrator::SyncOrchestrator;
pub use status::{SyncPhase, SyncStatus};

/// Why the orchestrator should look at the disk again.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncTrigger {
    /// A file under an SD root changed.
    FileChanged(PathBuf),
    /// The poll timer fired.
    Poll,
    /// A deferred activity entry is due.
    RetryPending,
    /// Stop the loop.
    Shutdown,
}

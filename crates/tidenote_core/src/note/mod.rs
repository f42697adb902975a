//! Notes: per-note CRDT documents built from every instance's logs.
//!
//! ```text
//! notes/<note-id>/
//! ├── logs/<instance>_<first-seq>.crdtlog
//! ├── snapshots/<instance>_<n>.snapshot
//! └── incoming.json          (only while a cross-SD move is staged)
//! ```

pub mod comments;
pub mod doc;
pub mod snapshot;
pub mod store;

use std::path::{Path, PathBuf};

pub use comments::{CommentAnchor, CommentReply, CommentThread};
pub use doc::{NoteDoc, NoteField, NoteOp, NoteRegisters, NoteSummary, TextRun};
pub use snapshot::{CompactionResult, Coverage, NoteSnapshot};
pub use store::{DEFAULT_COMPACTION_THRESHOLD, NoteEntry, NoteStore, ReloadOutcome};

/// Directory of note directories inside an SD root.
pub const NOTES_DIR: &str = "notes";

/// Log directory inside a note directory.
pub const LOGS_DIR: &str = "logs";

/// Snapshot directory inside a note directory.
pub const SNAPSHOTS_DIR: &str = "snapshots";

/// Staging marker of a cross-SD move.
pub const INCOMING_MARKER: &str = "incoming.json";

/// `<sd_root>/notes`
pub fn notes_dir(sd_root: &Path) -> PathBuf {
    sd_root.join(NOTES_DIR)
}

/// `<sd_root>/notes/<note_id>`
pub fn note_dir(sd_root: &Path, note_id: &str) -> PathBuf {
    notes_dir(sd_root).join(note_id)
}

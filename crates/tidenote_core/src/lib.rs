#![doc = include_str!("../README.md")]

/// Per-note activity logs (which notes an instance touched)
pub mod activity;

/// Lamport clock and stamps
pub mod clock;

/// Configuration options
pub mod config;

/// Per-instance store context
pub mod context;

/// Framed, append-only CRDT operation logs
pub mod crdt_log;

/// Deletion journal
pub mod deletion;

/// Error (common error types)
pub mod error;

/// Change notifications
pub mod events;

/// Folder hierarchy CRDT
pub mod folder;

/// Filesystem abstraction
pub mod fs;

/// Line-oriented shared logs
pub mod lines;

/// Notes (documents, comments, snapshots and the on-disk store)
pub mod note;

pub mod register;

/// Storage directories and cross-SD moves
pub mod sd;

/// High-level note operations
pub mod service;

/// Live sync (change discovery and merging across instances)
pub mod sync;

pub use config::{Config, StorageDirConfig, SyncConfig};
pub use context::StoreContext;
pub use error::{Result, SerializableError, TideError};
pub use events::{ChangeEvent, ChangeOrigin, EventRegistry};
pub use fs::{FileSystem, InMemoryFileSystem, RealFileSystem};
pub use sd::{SdInfo, SdManager, StorageDirectory};
pub use service::NoteService;
pub use sync::{SyncEngine, SyncOrchestrator, SyncStatus, SyncTrigger};

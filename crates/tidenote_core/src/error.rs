use std::path::PathBuf;

use serde::Serialize;
use thiserror::Error;

/// Unified error type for tidenote operations
#[derive(Debug, Error)]
pub enum TideError {
    // IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to read file '{path}': {source}")]
    FileRead {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to write file '{path}': {source}")]
    FileWrite {
        path: PathBuf,
        source: std::io::Error,
    },

    // Serialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Config parse error: {0}")]
    ConfigParse(#[from] toml::de::Error),

    #[error("Config serialize error: {0}")]
    ConfigSerialize(#[from] toml::ser::Error),

    #[error("Could not determine config directory")]
    NoConfigDir,

    // Log and CRDT errors
    #[error("Corrupt log '{path}' at offset {offset}: {reason}")]
    CorruptLog {
        path: PathBuf,
        offset: u64,
        reason: String,
    },

    #[error("Invalid log entry '{0}'")]
    InvalidEntry(String),

    #[error("CRDT error: {0}")]
    Crdt(String),

    // Note and folder errors
    #[error("Note '{0}' not found")]
    NoteNotFound(String),

    #[error("Note '{0}' has been permanently deleted")]
    NoteDeleted(String),

    #[error("Note '{0}' already exists in the target storage directory")]
    NoteExists(String),

    #[error("Comment '{0}' not found")]
    CommentNotFound(String),

    #[error("Folder '{0}' not found")]
    FolderNotFound(String),

    #[error("Moving folder '{folder}' under '{parent}' would create a cycle")]
    FolderCycle { folder: String, parent: String },

    // Storage directory errors
    #[error("Storage directory '{0}' not found")]
    SdNotFound(String),

    #[error("Storage directory at '{0}' is not accessible")]
    SdInaccessible(PathBuf),

    #[error("Storage directory already exists at '{0}'")]
    SdAlreadyExists(PathBuf),

    #[error("File watcher error: {0}")]
    Watch(#[from] notify::Error),

    #[error("Sync loop is already running")]
    SyncAlreadyStarted,
}

/// Result type alias for tidenote operations
pub type Result<T> = std::result::Result<T, TideError>;

impl TideError {
    /// Whether this error is a structural problem with on-disk data
    /// (as opposed to an I/O failure that may go away on retry).
    pub fn is_corruption(&self) -> bool {
        matches!(
            self,
            TideError::CorruptLog { .. } | TideError::InvalidEntry(_) | TideError::Json(_)
        )
    }

    /// Whether retrying the operation later may succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            TideError::Io(e) | TideError::FileRead { source: e, .. } => matches!(
                e.kind(),
                std::io::ErrorKind::NotFound
                    | std::io::ErrorKind::PermissionDenied
                    | std::io::ErrorKind::WouldBlock
                    | std::io::ErrorKind::Interrupted
                    | std::io::ErrorKind::UnexpectedEof
            ),
            TideError::FileWrite { .. } => true,
            _ => false,
        }
    }
}

/// A serializable representation of TideError for the collaborator layer
#[derive(Debug, Clone, Serialize)]
pub struct SerializableError {
    /// Error kind/variant name
    pub kind: String,
    /// Human-readable error message
    pub message: String,
    /// Associated path (if applicable)
    pub path: Option<PathBuf>,
}

impl From<&TideError> for SerializableError {
    fn from(err: &TideError) -> Self {
        let kind = match err {
            TideError::Io(_) => "Io",
            TideError::FileRead { .. } => "FileRead",
            TideError::FileWrite { .. } => "FileWrite",
            TideError::Json(_) => "Json",
            TideError::ConfigParse(_) => "ConfigParse",
            TideError::ConfigSerialize(_) => "ConfigSerialize",
            TideError::NoConfigDir => "NoConfigDir",
            TideError::CorruptLog { .. } => "CorruptLog",
            TideError::InvalidEntry(_) => "InvalidEntry",
            TideError::Crdt(_) => "Crdt",
            TideError::NoteNotFound(_) => "NoteNotFound",
            TideError::NoteDeleted(_) => "NoteDeleted",
            TideError::NoteExists(_) => "NoteExists",
            TideError::CommentNotFound(_) => "CommentNotFound",
            TideError::FolderNotFound(_) => "FolderNotFound",
            TideError::FolderCycle { .. } => "FolderCycle",
            TideError::SdNotFound(_) => "SdNotFound",
            TideError::SdInaccessible(_) => "SdInaccessible",
            TideError::SdAlreadyExists(_) => "SdAlreadyExists",
            TideError::Watch(_) => "Watch",
            TideError::SyncAlreadyStarted => "SyncAlreadyStarted",
        }
        .to_string();

        let path = match err {
            TideError::FileRead { path, .. } => Some(path.clone()),
            TideError::FileWrite { path, .. } => Some(path.clone()),
            TideError::CorruptLog { path, .. } => Some(path.clone()),
            TideError::SdInaccessible(path) => Some(path.clone()),
            TideError::SdAlreadyExists(path) => Some(path.clone()),
            _ => None,
        };

        Self {
            kind,
            message: err.to_string(),
            path,
        }
    }
}

impl From<TideError> for SerializableError {
    fn from(err: TideError) -> Self {
        SerializableError::from(&err)
    }
}

impl TideError {
    /// Convert to a serializable representation for the collaborator layer
    pub fn to_serializable(&self) -> SerializableError {
        SerializableError::from(self)
    }
}

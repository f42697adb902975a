//! Filesystem abstraction module.
//!
//! This module provides the `FileSystem` trait for abstracting the handful of
//! filesystem operations the storage core needs: durable appends, atomic
//! whole-file replacement, truncation and directory listing.
//!
//! Two implementations are provided:
//!
//! - [`RealFileSystem`]: maps to `std::fs`, with `sync_data`/`sync_all` for durability
//! - [`InMemoryFileSystem`]: a shared in-memory tree, used in tests to simulate
//!   partially delivered files byte-for-byte

mod memory;
mod native;

pub use memory::InMemoryFileSystem;
pub use native::RealFileSystem;

use std::io::Result;
use std::path::{Path, PathBuf};

/// Abstraction over filesystem operations.
/// Send + Sync required because stores are shared between the interactive
/// path and background sync workers.
pub trait FileSystem: Send + Sync {
    /// Read the whole file as bytes.
    fn read_binary(&self, path: &Path) -> Result<Vec<u8>>;

    /// Read the whole file as UTF-8 text.
    fn read_to_string(&self, path: &Path) -> Result<String> {
        let bytes = self.read_binary(path)?;
        String::from_utf8(bytes)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))
    }

    /// Append bytes to the end of a file, creating it if needed.
    ///
    /// Must not return until the data is durable.
    fn append(&self, path: &Path, content: &[u8]) -> Result<()>;

    /// Replace a file's contents atomically (readers see the old or the new
    /// contents, never a mix).
    fn write_atomic(&self, path: &Path, content: &[u8]) -> Result<()>;

    /// Shrink a file to `len` bytes.
    fn truncate(&self, path: &Path, len: u64) -> Result<()>;

    /// Length of a file in bytes, or `None` if it doesn't exist.
    fn file_len(&self, path: &Path) -> Option<u64>;

    /// Checks if a file or directory exists
    fn exists(&self, path: &Path) -> bool;

    /// Checks if a path is a directory
    fn is_dir(&self, path: &Path) -> bool;

    /// Creates a directory and all parent directories
    fn create_dir_all(&self, path: &Path) -> Result<()>;

    /// List the direct children (files and directories) of a directory.
    ///
    /// A missing directory yields an empty list.
    fn list_files(&self, dir: &Path) -> Result<Vec<PathBuf>>;

    /// Deletes a file
    fn delete_file(&self, path: &Path) -> Result<()>;

    /// Deletes a directory and everything below it
    fn remove_dir_all(&self, path: &Path) -> Result<()>;
}

/// File name of a path as `&str`, if it is valid UTF-8.
pub(crate) fn file_name(path: &Path) -> Option<&str> {
    path.file_name().and_then(|n| n.to_str())
}

/// Whether a path names a temporary file that readers must ignore.
pub(crate) fn is_temporary(path: &Path) -> bool {
    file_name(path).is_some_and(|n| n.starts_with('.'))
}

//! In-memory filesystem implementation.

use std::collections::{BTreeMap, BTreeSet};
use std::io::{Error, ErrorKind, Result};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

use super::FileSystem;

#[derive(Debug, Default)]
struct Tree {
    files: BTreeMap<PathBuf, Vec<u8>>,
    dirs: BTreeSet<PathBuf>,
}

/// A shared in-memory filesystem.
///
/// Uses `Arc<Mutex<..>>` so clones share the same underlying tree, which
/// lets two "instances" in a test look at the same storage directory.
#[derive(Clone, Debug, Default)]
pub struct InMemoryFileSystem {
    tree: Arc<Mutex<Tree>>,
}

impl InMemoryFileSystem {
    /// Create a new empty in-memory filesystem.
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace a file's bytes directly (for simulating partial delivery).
    pub fn set_contents(&self, path: &Path, content: &[u8]) {
        let mut tree = self.tree();
        Self::add_parents(&mut tree, path);
        tree.files.insert(path.to_path_buf(), content.to_vec());
    }

    /// All file paths currently stored, sorted.
    pub fn all_files(&self) -> Vec<PathBuf> {
        self.tree().files.keys().cloned().collect()
    }

    fn tree(&self) -> MutexGuard<'_, Tree> {
        self.tree.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn add_parents(tree: &mut Tree, path: &Path) {
        let mut current = path.parent();
        while let Some(dir) = current {
            if dir.as_os_str().is_empty() {
                break;
            }
            tree.dirs.insert(dir.to_path_buf());
            current = dir.parent();
        }
    }
}

impl FileSystem for InMemoryFileSystem {
    fn read_binary(&self, path: &Path) -> Result<Vec<u8>> {
        self.tree()
            .files
            .get(path)
            .cloned()
            .ok_or_else(|| Error::new(ErrorKind::NotFound, format!("File not found: {:?}", path)))
    }

    fn append(&self, path: &Path, content: &[u8]) -> Result<()> {
        let mut tree = self.tree();
        Self::add_parents(&mut tree, path);
        tree.files
            .entry(path.to_path_buf())
            .or_default()
            .extend_from_slice(content);
        Ok(())
    }

    fn write_atomic(&self, path: &Path, content: &[u8]) -> Result<()> {
        self.set_contents(path, content);
        Ok(())
    }

    fn truncate(&self, path: &Path, len: u64) -> Result<()> {
        let mut tree = self.tree();
        let file = tree
            .files
            .get_mut(path)
            .ok_or_else(|| Error::new(ErrorKind::NotFound, "File not found"))?;
        file.truncate(len as usize);
        Ok(())
    }

    fn file_len(&self, path: &Path) -> Option<u64> {
        self.tree()
            .files
            .get(path)
            .map(|f| f.len() as u64)
    }

    fn exists(&self, path: &Path) -> bool {
        let tree = self.tree();
        tree.files.contains_key(path) || tree.dirs.contains(path)
    }

    fn is_dir(&self, path: &Path) -> bool {
        self.tree().dirs.contains(path)
    }

    fn create_dir_all(&self, path: &Path) -> Result<()> {
        let mut tree = self.tree();
        tree.dirs.insert(path.to_path_buf());
        Self::add_parents(&mut tree, path);
        Ok(())
    }

    fn list_files(&self, dir: &Path) -> Result<Vec<PathBuf>> {
        let tree = self.tree();
        let mut result: BTreeSet<PathBuf> = BTreeSet::new();
        for path in tree.files.keys().chain(tree.dirs.iter()) {
            if path.parent() == Some(dir) {
                result.insert(path.clone());
            }
        }
        Ok(result.into_iter().collect())
    }

    fn delete_file(&self, path: &Path) -> Result<()> {
        self.tree().files.remove(path);
        Ok(())
    }

    fn remove_dir_all(&self, path: &Path) -> Result<()> {
        let mut tree = self.tree();
        tree.files.retain(|p, _| !p.starts_with(path));
        tree.dirs.retain(|p| !p.starts_with(path));
        Ok(())
    }
}

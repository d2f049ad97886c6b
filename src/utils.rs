//! Filesystem and hashing helpers
//!
//! ## Categories
//!
//! - **Hashing**: SHA-256 of files and byte slices, rendered as lowercase hex
//! - **Paths**: relative path keys, root containment checks
//! - **Tree operations**: recursive copy, relocation across filesystems,
//!   guarded deletion that refuses to leave the managed roots
//! - **Cleanup**: [`CleanupGuard`] removes intermediate artifacts on every
//!   exit path unless disarmed
//!
//! All functions are thread-safe. Deletion helpers never touch a path unless
//! it resolves strictly underneath one of the roots they are given.

use crate::error::{Result, TesseraError};
use sha2::{Digest, Sha256};
use std::fs::{self, File};
use std::io::Read;
use std::path::{Component, Path, PathBuf};
use tracing::{trace, warn};
use walkdir::WalkDir;

/// Hash a file's content using SHA-256
///
/// Reads the file through an 8KB buffer so memory stays flat for large files.
/// Returns the digest as a 64-character hex string.
pub fn hash_file_content(path: &Path) -> Result<String> {
    let mut file = File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buffer = vec![0u8; 8192];

    loop {
        let bytes_read = file.read(&mut buffer)?;
        if bytes_read == 0 {
            break;
        }
        hasher.update(&buffer[..bytes_read]);
    }

    Ok(hex::encode(hasher.finalize()))
}

/// Hash arbitrary data using SHA-256
pub fn hash_data(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

/// Relative path rendered with `/` separators
///
/// Used as the sort and manifest key so the same tree produces the same keys
/// on every platform.
pub fn relative_key(relative: &Path) -> Result<String> {
    let mut parts = Vec::new();
    for component in relative.components() {
        match component {
            Component::Normal(part) => parts.push(
                part.to_str()
                    .ok_or_else(|| {
                        TesseraError::validation(format!("path {:?} is not valid UTF-8", relative))
                    })?
                    .to_string(),
            ),
            Component::CurDir => {}
            _ => {
                return Err(TesseraError::validation(format!(
                    "path {:?} is not a plain relative path",
                    relative
                )))
            }
        }
    }
    Ok(parts.join("/"))
}

/// Turn a manifest key back into a relative path
///
/// Rejects absolute keys and `..` so a hostile manifest cannot escape the
/// tree it describes.
pub fn key_to_path(key: &str) -> Result<PathBuf> {
    let path = PathBuf::from(key);
    if key.is_empty()
        || path
            .components()
            .any(|c| !matches!(c, Component::Normal(_)))
    {
        return Err(TesseraError::validation(format!("invalid relative path {key:?}")));
    }
    Ok(path)
}

/// Check whether `path` lies strictly underneath `root`
///
/// Paths containing `..` never qualify. When both paths exist they are
/// compared after canonicalisation, otherwise lexically.
pub fn is_within(path: &Path, root: &Path) -> bool {
    if path.components().any(|c| matches!(c, Component::ParentDir)) {
        return false;
    }
    match (path.canonicalize(), root.canonicalize()) {
        (Ok(path), Ok(root)) => path != root && path.starts_with(&root),
        _ => path != root && path.starts_with(root),
    }
}

/// Check whether `path` lies underneath any of `roots`
pub fn is_within_any(path: &Path, roots: &[&Path]) -> bool {
    roots.iter().any(|root| is_within(path, root))
}

/// Remove a file or directory tree, refusing anything outside `roots`
///
/// Missing paths are not an error. Returns whether something was removed.
pub fn safe_remove(path: &Path, roots: &[&Path]) -> Result<bool> {
    if !is_within_any(path, roots) {
        return Err(TesseraError::UnsafePath(path.to_path_buf()));
    }
    let metadata = match fs::symlink_metadata(path) {
        Ok(metadata) => metadata,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(false),
        Err(e) => return Err(e.into()),
    };
    if metadata.is_dir() {
        fs::remove_dir_all(path)?;
    } else {
        fs::remove_file(path)?;
    }
    trace!("Removed {:?}", path);
    Ok(true)
}

/// Remove directory if empty
pub fn remove_dir_if_empty(path: &Path) -> Result<bool> {
    if path.is_dir() && fs::read_dir(path)?.next().is_none() {
        fs::remove_dir(path)?;
        trace!("Removed empty directory: {:?}", path);
        Ok(true)
    } else {
        Ok(false)
    }
}

/// Prune up to `levels` empty ancestors of `path`, staying inside `roots`
pub fn prune_empty_parents(path: &Path, levels: usize, roots: &[&Path]) -> Result<()> {
    let mut current = path.parent();
    for _ in 0..levels {
        let Some(dir) = current else { break };
        if !is_within_any(dir, roots) || !remove_dir_if_empty(dir)? {
            break;
        }
        current = dir.parent();
    }
    Ok(())
}

/// Recursively copy a directory tree
///
/// Only regular files and directories are copied; symlinks are skipped.
pub fn copy_dir_all(src: &Path, dst: &Path) -> Result<u64> {
    fs::create_dir_all(dst)?;
    let mut copied = 0;
    for entry in WalkDir::new(src).min_depth(1).follow_links(false) {
        let entry = entry?;
        let relative = entry.path().strip_prefix(src).map_err(|_| {
            TesseraError::validation(format!("{:?} escaped {:?}", entry.path(), src))
        })?;
        let target = dst.join(relative);
        let file_type = entry.file_type();
        if file_type.is_dir() {
            fs::create_dir_all(&target)?;
        } else if file_type.is_file() {
            if let Some(parent) = target.parent() {
                fs::create_dir_all(parent)?;
            }
            fs::copy(entry.path(), &target)?;
            copied += 1;
        } else {
            warn!("Skipping non-regular file {:?}", entry.path());
        }
    }
    Ok(copied)
}

/// Move a file or directory, falling back to copy and delete across devices
///
/// Anything already at `dst` is replaced.
pub fn move_path(src: &Path, dst: &Path) -> Result<()> {
    if let Some(parent) = dst.parent() {
        fs::create_dir_all(parent)?;
    }
    if dst.is_dir() {
        fs::remove_dir_all(dst)?;
    } else if dst.exists() {
        fs::remove_file(dst)?;
    }
    if fs::rename(src, dst).is_ok() {
        return Ok(());
    }
    if src.is_dir() {
        copy_dir_all(src, dst)?;
        fs::remove_dir_all(src)?;
    } else {
        fs::copy(src, dst)?;
        fs::remove_file(src)?;
    }
    Ok(())
}

/// Copy a file into place through a sibling temp name and a rename
///
/// Readers of `dst` never observe a partially written file.
pub fn atomic_copy(src: &Path, dst: &Path) -> Result<()> {
    if let Some(parent) = dst.parent() {
        fs::create_dir_all(parent)?;
    }
    let temp_path = dst.with_extension(format!("tmp-{}", uuid::Uuid::new_v4().simple()));
    if let Err(e) = fs::copy(src, &temp_path) {
        let _ = fs::remove_file(&temp_path);
        return Err(e.into());
    }
    if let Err(e) = fs::rename(&temp_path, dst) {
        let _ = fs::remove_file(&temp_path);
        return Err(e.into());
    }
    Ok(())
}

/// Atomic file write (write to temp file then rename)
pub fn atomic_write(path: &Path, content: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let temp_path = path.with_extension(format!("tmp-{}", uuid::Uuid::new_v4().simple()));
    fs::write(&temp_path, content)?;
    if let Err(e) = fs::rename(&temp_path, path) {
        let _ = fs::remove_file(&temp_path);
        return Err(e.into());
    }
    Ok(())
}

/// Whether a directory exists and has at least one entry
pub fn dir_has_entries(path: &Path) -> bool {
    fs::read_dir(path)
        .map(|mut entries| entries.next().is_some())
        .unwrap_or(false)
}

/// Removes registered paths on drop unless disarmed
///
/// Every multi-step operation registers its intermediate files and
/// directories here so a `?` anywhere in the pipeline still leaves the temp
/// root clean. Removal is confined to the guard's roots.
#[derive(Debug)]
pub struct CleanupGuard {
    roots: Vec<PathBuf>,
    paths: Vec<PathBuf>,
    armed: bool,
}

impl CleanupGuard {
    /// Create a guard that may only delete beneath `roots`
    pub fn new(roots: &[&Path]) -> Self {
        Self {
            roots: roots.iter().map(|r| r.to_path_buf()).collect(),
            paths: Vec::new(),
            armed: true,
        }
    }

    /// Register a path for removal
    pub fn push(&mut self, path: impl Into<PathBuf>) {
        self.paths.push(path.into());
    }

    /// Stop tracking a path that became a result
    pub fn release(&mut self, path: &Path) {
        self.paths.retain(|p| p != path);
    }

    /// Keep everything; nothing will be removed on drop
    pub fn disarm(&mut self) {
        self.armed = false;
    }

    /// Remove everything registered now
    pub fn cleanup(&mut self) {
        let roots: Vec<&Path> = self.roots.iter().map(PathBuf::as_path).collect();
        for path in self.paths.drain(..).rev() {
            if let Err(e) = safe_remove(&path, &roots) {
                warn!("Failed to clean up {:?}: {}", path, e);
            }
        }
    }
}

impl Drop for CleanupGuard {
    fn drop(&mut self) {
        if self.armed {
            self.cleanup();
        }
    }
}

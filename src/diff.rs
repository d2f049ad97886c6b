//! Tree diff: produce a layer from two directory states
//!
//! A layer is a directory holding only what changed between `before` and
//! `after`:
//!
//! ```text
//! layer/
//! ├── style.css                    # added: full copy
//! ├── index.html                   # modified: full copy or unified diff
//! ├── old/page.html.tessera-removed  # removed file: zero-length marker
//! ├── assets.tessera-removed       # removed directory: one marker, no children
//! └── .tessera/patch               # LayerManifest
//! ```
//!
//! ## Process
//!
//! 1. Both inputs are checked before anything is created. A tree containing a
//!    path that ends with the removal suffix cannot be represented and is
//!    rejected. The reserved metadata directory of either input is ignored.
//! 2. Files of `after` are compared against `before` in parallel: absent,
//!    different size or different digest means added or modified.
//! 3. `before` is walked for paths missing from `after`. A vanished
//!    directory is recorded once and not descended into. A path that changes
//!    between file and directory is recorded as removed and added.
//! 4. Small text files that changed are stored as a unified diff when the
//!    diff reproduces the new file and is smaller than it.
//!
//! The layer is assembled inside a fresh directory under `temp/diff` that is
//! deleted automatically if any step fails.
//!
//! ```rust,no_run
//! use tessera::diff::TreeDiffer;
//! use std::path::Path;
//!
//! # fn main() -> tessera::Result<()> {
//! let differ = TreeDiffer::new("./temp", 100 * 1024);
//! let layer = differ.diff(Path::new("./v1"), Path::new("./v2"), None)?;
//! println!("{} added, {} removed", layer.manifest().added.len(), layer.manifest().removed.len());
//! # Ok(())
//! # }
//! ```

use crate::digest::TreeDigest;
use crate::error::{Result, TesseraError};
use crate::metadata::{DiffType, LayerManifest, ModifiedPath, Sidecar, METADATA_DIR, REMOVED_SUFFIX};
use crate::patch;
use crate::types::Signature;
use crate::utils::{hash_file_content, key_to_path, relative_key};
use rayon::prelude::*;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, trace};
use walkdir::WalkDir;

/// A diff layer on disk together with its manifest
#[derive(Debug, Clone)]
pub struct Layer {
    path: PathBuf,
    manifest: LayerManifest,
}

impl Layer {
    /// Directory holding the layer
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// What the layer changes
    pub fn manifest(&self) -> &LayerManifest {
        &self.manifest
    }

    /// Take ownership of the layer directory path
    pub fn into_path(self) -> PathBuf {
        self.path
    }
}

/// Outcome of comparing one file of `after` with `before`
enum FileChange {
    Unchanged,
    Added(String),
    Modified(String, Option<String>),
}

/// Computes layers between directory trees
#[derive(Debug, Clone)]
pub struct TreeDiffer {
    temp_root: PathBuf,
    max_patch_file_size: u64,
    parallel_workers: usize,
}

impl TreeDiffer {
    /// Create a differ writing layers under `temp_root/diff`
    ///
    /// Modified files up to `max_patch_file_size` bytes may be stored as
    /// unified diffs; zero disables text patches.
    pub fn new(temp_root: impl Into<PathBuf>, max_patch_file_size: u64) -> Self {
        Self {
            temp_root: temp_root.into(),
            max_patch_file_size,
            parallel_workers: num_cpus::get(),
        }
    }

    /// Set the number of threads used to compare files
    pub fn with_parallel_workers(mut self, workers: usize) -> Self {
        self.parallel_workers = workers.max(1);
        self
    }

    /// Compute the layer that turns `before` into `after`
    pub fn diff(
        &self,
        before: &Path,
        after: &Path,
        previous_signature: Option<Signature>,
    ) -> Result<Layer> {
        for (name, root) in [("before", before), ("after", after)] {
            if !root.is_dir() {
                return Err(TesseraError::validation(format!(
                    "{} tree {:?} is not a directory",
                    name, root
                )));
            }
            reject_sentinel_paths(root)?;
        }

        let prev_hash = TreeDigest::compute(before)?;
        let cur_hash = TreeDigest::compute(after)?;

        let after_files = crate::digest::list_files(after)?;
        let changes = self.classify(before, &after_files)?;
        let removed = removed_paths(before, after)?;

        let diff_root = self.temp_root.join("diff");
        fs::create_dir_all(&diff_root)?;
        // Removed automatically unless kept below
        let output = tempfile::Builder::new().prefix("layer-").tempdir_in(&diff_root)?;

        let mut manifest = LayerManifest {
            previous_signature,
            prev_hash: Some(prev_hash),
            cur_hash: Some(cur_hash),
            ..Default::default()
        };

        for change in changes {
            match change {
                FileChange::Unchanged => {}
                FileChange::Added(key) => {
                    copy_into(after, output.path(), &key)?;
                    trace!("Added {}", key);
                    manifest.added.push(key);
                }
                FileChange::Modified(key, Some(text)) => {
                    let target = output.path().join(key_to_path(&key)?);
                    create_parent(&target)?;
                    fs::write(&target, text)?;
                    trace!("Modified {} (unified diff)", key);
                    manifest.modified.push(ModifiedPath {
                        path: key,
                        diff_type: DiffType::UnifiedDiff,
                    });
                }
                FileChange::Modified(key, None) => {
                    copy_into(after, output.path(), &key)?;
                    trace!("Modified {} (complete file)", key);
                    manifest.modified.push(ModifiedPath {
                        path: key,
                        diff_type: DiffType::CompleteFile,
                    });
                }
            }
        }

        for key in &removed {
            let marker = output.path().join(key_to_path(&format!("{key}{REMOVED_SUFFIX}"))?);
            create_parent(&marker)?;
            fs::File::create(&marker)?;
            trace!("Removed {}", key);
        }
        manifest.removed = removed;

        manifest.write_to(output.path())?;
        let path = output.keep();
        debug!(
            "Diff {:?} -> {:?}: {} added, {} modified, {} removed",
            before,
            after,
            manifest.added.len(),
            manifest.modified.len(),
            manifest.removed.len()
        );
        Ok(Layer { path, manifest })
    }

    fn classify(&self, before: &Path, after_files: &[(String, PathBuf)]) -> Result<Vec<FileChange>> {
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(self.parallel_workers)
            .build()
            .map_err(|e| TesseraError::InvalidConfiguration(e.to_string()))?;

        pool.install(|| {
            after_files
                .par_iter()
                .map(|(key, after_path)| self.classify_file(before, key, after_path))
                .collect()
        })
    }

    fn classify_file(&self, before: &Path, key: &str, after_path: &Path) -> Result<FileChange> {
        let before_path = before.join(key_to_path(key)?);
        if !before_path.is_file() {
            return Ok(FileChange::Added(key.to_string()));
        }

        let before_size = fs::metadata(&before_path)?.len();
        let after_size = fs::metadata(after_path)?.len();
        if before_size == after_size
            && hash_file_content(&before_path)? == hash_file_content(after_path)?
        {
            return Ok(FileChange::Unchanged);
        }

        let patch = if before_size <= self.max_patch_file_size && after_size <= self.max_patch_file_size {
            text_patch(&before_path, after_path)?
        } else {
            None
        };
        Ok(FileChange::Modified(key.to_string(), patch))
    }
}

/// A unified diff that reproduces `after` and is smaller than it
fn text_patch(before: &Path, after: &Path) -> Result<Option<String>> {
    let old = fs::read(before)?;
    let new = fs::read(after)?;
    let Some(text) = patch::create_patch(&old, &new) else {
        return Ok(None);
    };
    if text.len() >= new.len() {
        return Ok(None);
    }
    match patch::apply_patch(&old, &text) {
        Ok(applied) if applied == new => Ok(Some(text)),
        _ => {
            debug!("Unified diff for {:?} did not reproduce the file; storing it whole", after);
            Ok(None)
        }
    }
}

/// Paths of `before` that are absent from `after`, sorted
///
/// A missing directory is reported once without its children.
fn removed_paths(before: &Path, after: &Path) -> Result<Vec<String>> {
    let mut removed = Vec::new();
    let mut walker = WalkDir::new(before)
        .min_depth(1)
        .follow_links(false)
        .sort_by_file_name()
        .into_iter();

    while let Some(entry) = walker.next() {
        let entry = entry?;
        if entry.depth() == 1 && entry.file_name() == METADATA_DIR {
            walker.skip_current_dir();
            continue;
        }
        let relative = entry.path().strip_prefix(before).unwrap_or(entry.path());
        let counterpart = after.join(relative);
        let file_type = entry.file_type();
        if file_type.is_dir() {
            if !counterpart.is_dir() {
                removed.push(relative_key(relative)?);
                walker.skip_current_dir();
            }
        } else if file_type.is_file() && !counterpart.is_file() {
            removed.push(relative_key(relative)?);
        }
    }

    removed.sort();
    Ok(removed)
}

fn reject_sentinel_paths(root: &Path) -> Result<()> {
    let walker = WalkDir::new(root)
        .min_depth(1)
        .follow_links(false)
        .into_iter()
        .filter_entry(|e| !(e.depth() == 1 && e.file_name() == METADATA_DIR));
    for entry in walker {
        let entry = entry?;
        if entry.file_name().to_string_lossy().ends_with(REMOVED_SUFFIX) {
            return Err(TesseraError::validation(format!(
                "{:?} uses the reserved suffix {}",
                entry.path(),
                REMOVED_SUFFIX
            )));
        }
    }
    Ok(())
}

fn copy_into(from_root: &Path, to_root: &Path, key: &str) -> Result<()> {
    let relative = key_to_path(key)?;
    let target = to_root.join(&relative);
    create_parent(&target)?;
    fs::copy(from_root.join(&relative), &target)?;
    Ok(())
}

fn create_parent(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    Ok(())
}

//! Tree merge: apply a layer to a base tree
//!
//! The base is copied into a fresh directory under `temp/merge` and the layer
//! is applied to the copy, so neither input is modified. Every layer entry is
//! classified before anything is written:
//!
//! - a zero-length file ending in the removal suffix removes the stripped
//!   path (file or whole directory)
//! - a file the manifest lists as a unified diff is patched onto the base file
//! - anything else is copied over whatever is at that path
//!
//! Removals run before copies, so a path that turned from a file into a
//! directory (or back) is cleared first and then recreated. The layer's
//! metadata directory is carried into the result; the base's is not.
//!
//! When the layer has a manifest it is checked against the layer contents
//! first: every added or modified path must be a real file and every removed
//! path must have its marker.

use crate::digest::list_files;
use crate::error::{Result, TesseraError};
use crate::metadata::{DiffType, LayerManifest, Sidecar, METADATA_DIR, REMOVED_SUFFIX};
use crate::patch::apply_patch;
use crate::utils::{self, key_to_path};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, trace};

/// What to do with one layer entry
#[derive(Debug, Clone, PartialEq, Eq)]
enum LayerEntry {
    Remove(String),
    Patch(String),
    Copy(String),
}

/// Applies layers to base trees
#[derive(Debug, Clone)]
pub struct TreeMerger {
    temp_root: PathBuf,
}

impl TreeMerger {
    /// Create a merger writing results under `temp_root/merge`
    pub fn new(temp_root: impl Into<PathBuf>) -> Self {
        Self {
            temp_root: temp_root.into(),
        }
    }

    /// Produce a new directory equal to `base` with `layer` applied
    ///
    /// The returned directory is owned by the caller.
    pub fn merge(&self, base: &Path, layer: &Path) -> Result<PathBuf> {
        for (name, root) in [("base", base), ("layer", layer)] {
            if !root.is_dir() {
                return Err(TesseraError::validation(format!(
                    "{} {:?} is not a directory",
                    name, root
                )));
            }
        }

        let manifest = LayerManifest::read_from(layer)?;
        let entries = classify(layer, manifest.as_ref())?;
        if let Some(manifest) = &manifest {
            check_manifest(layer, manifest)?;
        }

        let merge_root = self.temp_root.join("merge");
        fs::create_dir_all(&merge_root)?;
        let output = tempfile::Builder::new().prefix("merged-").tempdir_in(&merge_root)?;
        let out = output.path();

        utils::copy_dir_all(base, out)?;
        let base_metadata = out.join(METADATA_DIR);
        if base_metadata.exists() {
            fs::remove_dir_all(&base_metadata)?;
        }

        let (mut removed, mut copied, mut patched) = (0usize, 0usize, 0usize);
        for entry in entries.iter() {
            if let LayerEntry::Remove(key) = entry {
                let target = out.join(key_to_path(key)?);
                if target.is_dir() {
                    fs::remove_dir_all(&target)?;
                } else if target.exists() {
                    fs::remove_file(&target)?;
                }
                trace!("Removed {}", key);
                removed += 1;
            }
        }

        for entry in entries.iter() {
            match entry {
                LayerEntry::Remove(_) => {}
                LayerEntry::Copy(key) => {
                    let target = out.join(key_to_path(key)?);
                    clear_path_for(out, &target)?;
                    fs::copy(layer.join(key_to_path(key)?), &target)?;
                    trace!("Copied {}", key);
                    copied += 1;
                }
                LayerEntry::Patch(key) => {
                    let target = out.join(key_to_path(key)?);
                    if !target.is_file() {
                        return Err(TesseraError::LayerMismatch(format!(
                            "{} is patched but missing from the base",
                            key
                        )));
                    }
                    let diff = fs::read_to_string(layer.join(key_to_path(key)?))?;
                    let merged = apply_patch(&fs::read(&target)?, &diff)?;
                    fs::write(&target, merged)?;
                    trace!("Patched {}", key);
                    patched += 1;
                }
            }
        }

        let layer_metadata = layer.join(METADATA_DIR);
        if layer_metadata.is_dir() {
            utils::copy_dir_all(&layer_metadata, &out.join(METADATA_DIR))?;
        }

        let path = output.keep();
        debug!(
            "Merged {:?} onto {:?}: {} removed, {} copied, {} patched",
            layer, base, removed, copied, patched
        );
        Ok(path)
    }
}

fn classify(layer: &Path, manifest: Option<&LayerManifest>) -> Result<Vec<LayerEntry>> {
    let mut entries = Vec::new();
    for (key, path) in list_files(layer)? {
        if let Some(stripped) = key.strip_suffix(REMOVED_SUFFIX) {
            if fs::metadata(&path)?.len() != 0 {
                return Err(TesseraError::LayerMismatch(format!(
                    "removal marker {} is not empty",
                    key
                )));
            }
            entries.push(LayerEntry::Remove(stripped.to_string()));
            continue;
        }
        let is_patch = manifest.and_then(|m| m.diff_type_of(&key)) == Some(DiffType::UnifiedDiff);
        entries.push(if is_patch {
            LayerEntry::Patch(key)
        } else {
            LayerEntry::Copy(key)
        });
    }
    Ok(entries)
}

fn check_manifest(layer: &Path, manifest: &LayerManifest) -> Result<()> {
    for key in manifest.added.iter().map(String::as_str).chain(manifest.modified_paths()) {
        if !layer.join(key_to_path(key)?).is_file() {
            return Err(TesseraError::LayerMismatch(format!(
                "{} is listed in the manifest but absent from the layer",
                key
            )));
        }
    }
    for key in &manifest.removed {
        if !layer.join(key_to_path(&format!("{key}{REMOVED_SUFFIX}"))?).is_file() {
            return Err(TesseraError::LayerMismatch(format!(
                "{} is listed as removed but has no marker",
                key
            )));
        }
    }
    Ok(())
}

/// Make room for a file at `target`: drop a directory there and any file
/// standing where a parent directory must go
fn clear_path_for(root: &Path, target: &Path) -> Result<()> {
    if let Some(parent) = target.parent() {
        let mut ancestor = parent;
        while ancestor != root && ancestor.starts_with(root) {
            if ancestor.is_file() {
                fs::remove_file(ancestor)?;
                break;
            }
            match ancestor.parent() {
                Some(next) => ancestor = next,
                None => break,
            }
        }
        fs::create_dir_all(parent)?;
    }
    if target.is_dir() {
        fs::remove_dir_all(target)?;
    }
    Ok(())
}

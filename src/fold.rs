//! Layer folding
//!
//! Folding turns `[snapshot, layer₁, layer₂, …]` into the final tree by merging
//! each layer onto the running base. A single entry is returned unchanged.
//!
//! When layers are annotated with the signature of the transaction that
//! carried them, each layer's manifest back-link must name the previous
//! transaction. The final tree is checked against the last manifest's
//! `cur_hash`; with `validate_all_layers` every step is checked against both
//! hashes.
//!
//! Intermediate merge outputs are deleted as soon as the next step succeeds,
//! and on failure nothing created by the fold is left behind. The inputs are
//! never modified or deleted.

use crate::digest::TreeDigest;
use crate::error::{Result, TesseraError};
use crate::merge::TreeMerger;
use crate::metadata::{LayerManifest, Sidecar};
use crate::types::Signature;
use crate::utils::CleanupGuard;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// One directory to fold, with the signature of the transaction it came from
#[derive(Debug, Clone)]
pub struct LayerInput {
    /// Directory holding the snapshot or layer
    pub path: PathBuf,
    /// Signature of the carrying transaction, if known
    pub signature: Option<Signature>,
}

impl LayerInput {
    /// A layer whose origin is unknown; back-links are not checked
    pub fn unsigned(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            signature: None,
        }
    }

    /// A layer carried by the transaction `signature`
    pub fn signed(path: impl Into<PathBuf>, signature: Signature) -> Self {
        Self {
            path: path.into(),
            signature: Some(signature),
        }
    }
}

/// Folds ordered layers into one tree
#[derive(Debug, Clone)]
pub struct LayerFolder {
    temp_root: PathBuf,
    validate_all_layers: bool,
}

impl LayerFolder {
    /// Create a folder that merges under `temp_root`
    pub fn new(temp_root: impl Into<PathBuf>) -> Self {
        Self {
            temp_root: temp_root.into(),
            validate_all_layers: false,
        }
    }

    /// Check layer hashes after every step instead of only the last
    pub fn validate_all_layers(mut self, enabled: bool) -> Self {
        self.validate_all_layers = enabled;
        self
    }

    /// Fold plain directories
    pub fn fold(&self, layers: &[PathBuf]) -> Result<PathBuf> {
        let inputs: Vec<LayerInput> = layers.iter().cloned().map(LayerInput::unsigned).collect();
        self.fold_layers(&inputs)
    }

    /// Fold signed directories, checking back-links
    pub fn fold_layers(&self, layers: &[LayerInput]) -> Result<PathBuf> {
        let (first, rest) = layers
            .split_first()
            .ok_or_else(|| TesseraError::validation("no layers to fold"))?;
        if rest.is_empty() {
            return Ok(first.path.clone());
        }

        // Check manifests before merging anything
        let mut manifests = Vec::with_capacity(rest.len());
        let mut previous = first.signature.as_ref();
        for layer in rest {
            let manifest = LayerManifest::read_from(&layer.path)?.ok_or_else(|| {
                TesseraError::validation(format!("layer {:?} has no manifest", layer.path))
            })?;
            if let (Some(expected), Some(_)) = (previous, layer.signature.as_ref()) {
                match manifest.previous_signature.as_ref() {
                    None => {
                        return Err(TesseraError::validation(format!(
                            "layer {:?} has no back-link",
                            layer.path
                        )));
                    }
                    Some(link) if link != expected => {
                        return Err(TesseraError::state(format!(
                            "layer {:?} does not follow transaction {}",
                            layer.path,
                            expected.to_hex()
                        )));
                    }
                    Some(_) => {}
                }
            }
            previous = layer.signature.as_ref();
            manifests.push(manifest);
        }

        let merger = TreeMerger::new(&self.temp_root);
        let temp_root = self.temp_root.as_path();
        let mut guard = CleanupGuard::new(&[temp_root]);
        let mut base = first.path.clone();
        let last = rest.len() - 1;

        for (step, (layer, manifest)) in rest.iter().zip(&manifests).enumerate() {
            if self.validate_all_layers {
                check_hash(&base, manifest.prev_hash.as_deref(), "base of", &layer.path)?;
            }

            let merged = merger.merge(&base, &layer.path)?;
            guard.push(&merged);
            if base != first.path {
                guard.release(&base);
                if let Err(e) = crate::utils::safe_remove(&base, &[temp_root]) {
                    warn!("Failed to remove intermediate tree {:?}: {}", base, e);
                }
            }
            base = merged;

            if self.validate_all_layers || step == last {
                check_hash(&base, manifest.cur_hash.as_deref(), "result of", &layer.path)?;
            }
        }

        guard.release(&base);
        guard.disarm();
        debug!("Folded {} layer(s) into {:?}", layers.len(), base);
        Ok(base)
    }
}

fn check_hash(tree: &Path, expected: Option<&str>, what: &str, layer: &Path) -> Result<()> {
    let Some(expected) = expected else {
        return Ok(());
    };
    let actual = TreeDigest::compute(tree)?;
    if actual != expected {
        warn!("Tree digest mismatch for the {} {:?}", what, layer);
        return Err(TesseraError::HashMismatch {
            expected: expected.to_string(),
            actual,
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::diff::TreeDiffer;
    use crate::error::ErrorKind;
    use std::fs;
    use tempfile::TempDir;

    fn write(root: &Path, rel: &str, content: &[u8]) {
        let path = root.join(rel);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, content).unwrap();
    }

    struct History {
        _temp: TempDir,
        work: PathBuf,
        a: PathBuf,
        c: PathBuf,
        ab: PathBuf,
        bc: PathBuf,
    }

    fn history(sig_a: Option<Signature>, sig_b: Option<Signature>) -> History {
        let temp = TempDir::new().unwrap();
        let work = temp.path().join("temp");
        let a = temp.path().join("a");
        let b = temp.path().join("b");
        let c = temp.path().join("c");
        write(&a, "index.html", b"v1");
        write(&b, "index.html", b"v2");
        write(&b, "style.css", b"body {}");
        write(&c, "style.css", b"body { margin: 0 }");
        write(&c, "js/app.js", b"run()");

        let differ = TreeDiffer::new(&work, 1024);
        let ab = differ.diff(&a, &b, sig_a).unwrap().into_path();
        let bc = differ.diff(&b, &c, sig_b).unwrap().into_path();
        History { _temp: temp, work, a, c, ab, bc }
    }

    #[test]
    fn test_fold_reaches_last_state() {
        let h = history(None, None);
        let folder = LayerFolder::new(&h.work).validate_all_layers(true);
        let out = folder.fold(&[h.a.clone(), h.ab.clone(), h.bc.clone()]).unwrap();
        assert_eq!(TreeDigest::compute(&out).unwrap(), TreeDigest::compute(&h.c).unwrap());

        // Only the final merge output survives
        let merges = fs::read_dir(h.work.join("merge")).unwrap().count();
        assert_eq!(merges, 1);
        assert!(h.a.join("index.html").exists());
    }

    #[test]
    fn test_single_layer_is_returned_unchanged() {
        let h = history(None, None);
        let out = LayerFolder::new(&h.work).fold(&[h.a.clone()]).unwrap();
        assert_eq!(out, h.a);
    }

    #[test]
    fn test_empty_list_is_validation_error() {
        let temp = TempDir::new().unwrap();
        let err = LayerFolder::new(temp.path()).fold(&[]).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation);
    }

    #[test]
    fn test_back_link_mismatch_is_state_error() {
        let put = Signature::new(vec![1; 8]);
        let patch = Signature::new(vec![2; 8]);
        let h = history(Some(put.clone()), Some(Signature::new(vec![9; 8])));

        let err = LayerFolder::new(&h.work)
            .fold_layers(&[
                LayerInput::signed(&h.a, put),
                LayerInput::signed(&h.ab, patch),
                LayerInput::signed(&h.bc, Signature::new(vec![3; 8])),
            ])
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::State);
        assert!(!h.work.join("merge").exists());
    }

    #[test]
    fn test_missing_back_link_is_validation_error() {
        let put = Signature::new(vec![1; 8]);
        let h = history(None, None);

        let err = LayerFolder::new(&h.work)
            .fold_layers(&[
                LayerInput::signed(&h.a, put),
                LayerInput::signed(&h.ab, Signature::new(vec![2; 8])),
            ])
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation);
        assert!(!h.work.join("merge").exists());
    }

    #[test]
    fn test_final_hash_mismatch_is_integrity_error() {
        let h = history(None, None);
        // Base diverged from what the first layer was computed against
        write(&h.a, "extra.txt", b"surprise");

        let err = LayerFolder::new(&h.work)
            .fold(&[h.a.clone(), h.ab.clone(), h.bc.clone()])
            .unwrap_err();
        assert!(err.is_corruption());
        let merges = fs::read_dir(h.work.join("merge")).unwrap().count();
        assert_eq!(merges, 0);
    }

    #[test]
    fn test_layer_without_manifest_is_validation_error() {
        let h = history(None, None);
        fs::remove_dir_all(h.ab.join(".tessera")).unwrap();
        let err = LayerFolder::new(&h.work).fold(&[h.a.clone(), h.ab.clone()]).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation);
    }
}

//! Deterministic digest of a directory tree
//!
//! The digest covers every regular file under the root except those inside
//! the top-level metadata directory. Files are visited in order of their
//! `/`-separated relative path; for each one the path's UTF-8 bytes and then
//! the file's bytes are fed into a single running SHA-256.
//!
//! Two trees have equal digests exactly when they hold the same set of
//! relative paths with the same contents. Empty directories, permissions and
//! timestamps do not contribute.
//!
//! ```rust,no_run
//! use tessera::digest::TreeDigest;
//!
//! # fn main() -> tessera::Result<()> {
//! let digest = TreeDigest::compute("./site")?;
//! assert!(TreeDigest::new("./site").is_valid(&digest)?);
//! # Ok(())
//! # }
//! ```

use crate::error::Result;
use crate::metadata::METADATA_DIR;
use crate::utils::relative_key;
use sha2::{Digest, Sha256};
use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};
use tracing::trace;
use walkdir::WalkDir;

/// Digest of the tree rooted at a directory
#[derive(Debug, Clone)]
pub struct TreeDigest {
    root: PathBuf,
}

impl TreeDigest {
    /// Prepare a digest of `root`
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Compute the digest of `root` in one call
    pub fn compute(root: impl AsRef<Path>) -> Result<String> {
        Self::new(root.as_ref()).digest()
    }

    /// Hex SHA-256 over sorted relative paths and file contents
    pub fn digest(&self) -> Result<String> {
        let files = list_files(&self.root)?;
        let mut hasher = Sha256::new();
        let mut buffer = vec![0u8; 8192];

        for (key, path) in &files {
            hasher.update(key.as_bytes());
            let mut file = File::open(path)?;
            loop {
                let n = file.read(&mut buffer)?;
                if n == 0 {
                    break;
                }
                hasher.update(&buffer[..n]);
            }
        }

        let digest = hex::encode(hasher.finalize());
        trace!("Tree digest of {:?} over {} file(s): {}", self.root, files.len(), digest);
        Ok(digest)
    }

    /// Whether the tree currently hashes to `expected`
    pub fn is_valid(&self, expected: &str) -> Result<bool> {
        Ok(self.digest()? == expected)
    }
}

/// Regular files under `root` as (relative key, absolute path), sorted by key
///
/// The top-level metadata directory is skipped.
pub fn list_files(root: &Path) -> Result<Vec<(String, PathBuf)>> {
    let mut files = Vec::new();
    let walker = WalkDir::new(root)
        .min_depth(1)
        .follow_links(false)
        .into_iter()
        .filter_entry(|e| !(e.depth() == 1 && e.file_name() == METADATA_DIR));

    for entry in walker {
        let entry = entry?;
        if !entry.file_type().is_file() {
            continue;
        }
        let relative = entry.path().strip_prefix(root).unwrap_or(entry.path());
        files.push((relative_key(relative)?, entry.path().to_path_buf()));
    }

    files.sort_by(|a, b| a.0.cmp(&b.0));
    Ok(files)
}

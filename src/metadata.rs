//! JSON sidecar documents
//!
//! Built trees and layers carry small JSON documents inside a reserved
//! directory at their top level:
//!
//! ```text
//! <tree>/
//! └── .tessera/
//!     ├── patch    # LayerManifest, present in diff layers
//!     └── cache    # CacheRecord, present in built resources
//! ```
//!
//! The reserved directory is excluded from tree digests and never treated as
//! resource content. Each document type implements [`Sidecar`], which supplies
//! reading and writing.
//!
//! [`TransactionMetadata`] is different: it is stored as its own content file
//! and referenced from the transaction by digest.

use crate::error::{Result, TesseraError};
use crate::types::Signature;
use crate::utils;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::trace;

/// Name of the reserved metadata directory inside a tree
pub const METADATA_DIR: &str = ".tessera";

/// Suffix of the zero-length marker recording a removed path in a layer
pub const REMOVED_SUFFIX: &str = ".tessera-removed";

/// Whether a relative key names the metadata directory or something inside it
pub fn is_metadata_key(key: &str) -> bool {
    key == METADATA_DIR || key.starts_with(&format!("{METADATA_DIR}/"))
}

/// A JSON document stored under [`METADATA_DIR`]
pub trait Sidecar: Serialize + DeserializeOwned {
    /// File name inside the metadata directory
    const FILE_NAME: &'static str;

    /// Location of this document inside `tree`
    fn path_in(tree: &Path) -> PathBuf {
        tree.join(METADATA_DIR).join(Self::FILE_NAME)
    }

    /// Read the document, `None` when absent
    fn read_from(tree: &Path) -> Result<Option<Self>> {
        let path = Self::path_in(tree);
        match fs::read(&path) {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Write the document, replacing any previous one
    fn write_to(&self, tree: &Path) -> Result<()> {
        let path = Self::path_in(tree);
        let json = serde_json::to_vec_pretty(self)?;
        utils::atomic_write(&path, &json)?;
        trace!("Wrote {:?}", path);
        Ok(())
    }
}

/// How a modified file is carried inside a layer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DiffType {
    /// The layer holds the full new file
    CompleteFile,
    /// The layer holds a unified line diff against the base file
    UnifiedDiff,
}

/// A modified path and how its change is stored
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ModifiedPath {
    /// Relative path, `/`-separated
    pub path: String,
    /// Storage form inside the layer
    #[serde(rename = "type")]
    pub diff_type: DiffType,
}

/// What a diff layer changes and which layer it follows
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct LayerManifest {
    /// Signature of the transaction this layer applies on top of
    pub previous_signature: Option<Signature>,
    /// Tree digest of the base the layer was computed against
    pub prev_hash: Option<String>,
    /// Tree digest of the state the layer produces
    pub cur_hash: Option<String>,
    /// Relative paths of new files
    pub added: Vec<String>,
    /// Relative paths of changed files
    pub modified: Vec<ModifiedPath>,
    /// Relative paths of removed files and directories
    pub removed: Vec<String>,
}

impl LayerManifest {
    /// Whether the layer changes nothing
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.modified.is_empty() && self.removed.is_empty()
    }

    /// How a modified path is stored, `None` if the path is not modified
    pub fn diff_type_of(&self, path: &str) -> Option<DiffType> {
        self.modified
            .iter()
            .find(|m| m.path == path)
            .map(|m| m.diff_type)
    }

    /// Modified paths without their storage form
    pub fn modified_paths(&self) -> impl Iterator<Item = &str> {
        self.modified.iter().map(|m| m.path.as_str())
    }
}

impl Sidecar for LayerManifest {
    const FILE_NAME: &'static str = "patch";
}

/// Which transaction a built tree corresponds to
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheRecord {
    /// Signature of the newest transaction folded into the tree
    pub signature: Signature,
    /// Build time, milliseconds since the Unix epoch
    pub timestamp: i64,
}

impl CacheRecord {
    /// Record a build of `signature` happening now
    pub fn now(signature: Signature) -> Self {
        Self {
            signature,
            timestamp: chrono::Utc::now().timestamp_millis(),
        }
    }
}

impl Sidecar for CacheRecord {
    const FILE_NAME: &'static str = "cache";
}

const MAX_TITLE_LENGTH: usize = 80;
const MAX_DESCRIPTION_LENGTH: usize = 240;
const MAX_TAG_LENGTH: usize = 20;
const MAX_TAGS_COUNT: usize = 5;

/// Descriptive metadata published alongside a payload
///
/// Stored as a separate content file; its digest becomes the transaction's
/// metadata hash. Setters trim inputs to the published bounds.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct TransactionMetadata {
    /// Short title
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    /// Longer description
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Search tags
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
    /// Free-form category
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,
    /// Ordered chunk digests of the payload
    #[serde(default)]
    pub chunks: Vec<String>,
    /// Relative paths of the files in the payload
    #[serde(default)]
    pub files: Vec<String>,
    /// MIME type of a single-file payload
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<String>,
}

impl TransactionMetadata {
    /// Set the title, truncated to 80 characters
    pub fn with_title(mut self, title: impl Into<String>) -> Self {
        self.title = non_empty(truncate_chars(title.into(), MAX_TITLE_LENGTH));
        self
    }

    /// Set the description, truncated to 240 characters
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = non_empty(truncate_chars(description.into(), MAX_DESCRIPTION_LENGTH));
        self
    }

    /// Set tags. Empty or over-long tags are dropped and at most five kept.
    pub fn with_tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tags = tags
            .into_iter()
            .map(Into::into)
            .filter(|t| !t.is_empty() && t.chars().count() <= MAX_TAG_LENGTH)
            .take(MAX_TAGS_COUNT)
            .collect();
        self
    }

    /// Set the category
    pub fn with_category(mut self, category: impl Into<String>) -> Self {
        self.category = non_empty(category.into());
        self
    }

    /// Set the MIME type
    pub fn with_mime_type(mut self, mime_type: impl Into<String>) -> Self {
        self.mime_type = non_empty(mime_type.into());
        self
    }

    /// Whether any descriptive field is set
    pub fn has_descriptive_fields(&self) -> bool {
        self.title.is_some()
            || self.description.is_some()
            || !self.tags.is_empty()
            || self.category.is_some()
            || self.mime_type.is_some()
    }

    /// Serialize to pretty JSON bytes
    pub fn to_json(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec_pretty(self)?)
    }

    /// Parse from JSON bytes
    pub fn from_json(bytes: &[u8]) -> Result<Self> {
        serde_json::from_slice(bytes)
            .map_err(|e| TesseraError::validation(format!("malformed transaction metadata: {e}")))
    }
}

fn truncate_chars(s: String, max: usize) -> String {
    match s.char_indices().nth(max) {
        Some((idx, _)) => s[..idx].to_string(),
        None => s,
    }
}

fn non_empty(s: String) -> Option<String> {
    let trimmed = s.trim();
    (!trimmed.is_empty()).then(|| trimmed.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_manifest_sidecar_roundtrip() {
        let temp_dir = TempDir::new().unwrap();
        let manifest = LayerManifest {
            previous_signature: Some(Signature::new(vec![1, 2, 3])),
            prev_hash: Some("aa".into()),
            cur_hash: Some("bb".into()),
            added: vec!["style.css".into()],
            modified: vec![ModifiedPath {
                path: "index.html".into(),
                diff_type: DiffType::UnifiedDiff,
            }],
            removed: vec!["old".into()],
        };
        manifest.write_to(temp_dir.path()).unwrap();
        assert!(temp_dir.path().join(".tessera/patch").is_file());

        let back = LayerManifest::read_from(temp_dir.path()).unwrap().unwrap();
        assert_eq!(back, manifest);
        assert_eq!(back.diff_type_of("index.html"), Some(DiffType::UnifiedDiff));
        assert_eq!(back.diff_type_of("style.css"), None);
    }

    #[test]
    fn test_manifest_json_field_names() {
        let manifest = LayerManifest {
            modified: vec![ModifiedPath {
                path: "a".into(),
                diff_type: DiffType::CompleteFile,
            }],
            ..Default::default()
        };
        let json = serde_json::to_value(&manifest).unwrap();
        assert_eq!(json["modified"][0]["type"], "COMPLETE_FILE");
        assert!(json["previous_signature"].is_null());
    }

    #[test]
    fn test_metadata_key() {
        assert!(is_metadata_key(".tessera"));
        assert!(is_metadata_key(".tessera/patch"));
        assert!(!is_metadata_key(".tesseract"));
        assert!(!is_metadata_key("docs/.tessera"));
    }

    #[test]
    fn test_missing_sidecar_is_none() {
        let temp_dir = TempDir::new().unwrap();
        assert!(CacheRecord::read_from(temp_dir.path()).unwrap().is_none());

        let record = CacheRecord::now(Signature::new(vec![9; 64]));
        record.write_to(temp_dir.path()).unwrap();
        assert_eq!(CacheRecord::read_from(temp_dir.path()).unwrap(), Some(record));
    }

    #[test]
    fn test_transaction_metadata_bounds() {
        let metadata = TransactionMetadata::default()
            .with_title("t".repeat(100))
            .with_description("   ")
            .with_tags(vec!["ok", "", "this-tag-is-far-too-long-to-keep", "b", "c", "d", "e", "f"]);

        assert_eq!(metadata.title.as_deref().map(str::len), Some(80));
        assert_eq!(metadata.description, None);
        assert_eq!(metadata.tags, vec!["ok", "b", "c", "d", "e"]);
        assert!(metadata.has_descriptive_fields());
        assert!(!TransactionMetadata::default().has_descriptive_fields());

        let back = TransactionMetadata::from_json(&metadata.to_json().unwrap()).unwrap();
        assert_eq!(back, metadata);
    }
}

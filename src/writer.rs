//! Write pipeline
//!
//! Turns a local file or directory into content files ready to be referenced
//! by a transaction:
//!
//! ```text
//! source ──(PATCH: diff against built state)──▶ compress ──▶ encrypt ──▶ store + split
//! ```
//!
//! Every intermediate artifact lives in a fresh directory under `temp/writer`
//! that is removed when the write finishes, successfully or not. If anything
//! fails after the payload entered the store, the payload and every chunk
//! already written are deleted again.
//!
//! The encryption key is generated per write and returned on the
//! [`ContentFile`]; it is never written to disk.
//!
//! ```rust,no_run
//! use tessera::writer::WriteRequest;
//! use tessera::types::Service;
//! # fn main() -> tessera::Result<()> {
//! # let tessera = tessera::TesseraBuilder::new().build("./store")?;
//! let outcome = tessera.write(&WriteRequest::put("./site", "alice", Service::Website))?;
//! println!("{} in {} chunk(s)", outcome.file.digest(), outcome.file.chunk_count());
//! # Ok(())
//! # }
//! ```

use crate::builder::ResourceBuilder;
use crate::compression::CompressionEngine;
use crate::context::Context;
use crate::crypto;
use crate::digest::list_files;
use crate::error::{Result, TesseraError};
use crate::metadata::{LayerManifest, Sidecar, TransactionMetadata};
use crate::storage::ContentFile;
use crate::types::{Compression, Method, Service, Signature, SINGLE_FILE_NAME};
use crate::utils::{self, CleanupGuard};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Levels of emptied parents pruned after discarding the prior state
const PRIOR_DEPTH: usize = 6;

/// What to publish and how
#[derive(Debug, Clone)]
pub struct WriteRequest {
    /// File or directory to publish
    pub source: PathBuf,
    /// Registered name
    pub name: String,
    /// Content kind
    pub service: Service,
    /// Sub-identifier
    pub identifier: Option<String>,
    /// Full snapshot or layer
    pub method: Method,
    /// Container format
    pub compression: Compression,
    /// Descriptive fields for the metadata sidecar
    pub metadata: TransactionMetadata,
}

impl WriteRequest {
    /// A PUT of `source` with default compression
    pub fn put(source: impl Into<PathBuf>, name: &str, service: Service) -> Self {
        Self {
            source: source.into(),
            name: name.to_lowercase(),
            service,
            identifier: None,
            method: Method::Put,
            compression: Compression::default(),
            metadata: TransactionMetadata::default(),
        }
    }

    /// A PATCH of `source` with default compression
    pub fn patch(source: impl Into<PathBuf>, name: &str, service: Service) -> Self {
        Self {
            method: Method::Patch,
            ..Self::put(source, name, service)
        }
    }

    pub fn with_identifier(mut self, identifier: Option<&str>) -> Self {
        self.identifier = crate::types::normalize_identifier(identifier);
        self
    }

    pub fn with_compression(mut self, compression: Compression) -> Self {
        self.compression = compression;
        self
    }

    pub fn with_metadata(mut self, metadata: TransactionMetadata) -> Self {
        self.metadata = metadata;
        self
    }
}

/// Content files produced by a write
#[derive(Debug, Clone)]
pub struct WriteOutcome {
    /// Encrypted payload with its chunks and secret
    pub file: ContentFile,
    /// Metadata sidecar, when one was needed
    pub metadata_file: Option<ContentFile>,
    /// Transaction a PATCH applies on top of
    pub previous_signature: Option<Signature>,
    /// What a PATCH changes
    pub manifest: Option<LayerManifest>,
}

impl WriteOutcome {
    /// Remove everything this write put into the store
    pub fn discard(&self) -> Result<()> {
        self.file.delete_all()?;
        if let Some(metadata) = &self.metadata_file {
            metadata.delete()?;
        }
        Ok(())
    }
}

/// Runs the write pipeline for one request
#[derive(Debug, Clone)]
pub struct DataWriter {
    ctx: Context,
}

impl DataWriter {
    pub fn new(ctx: Context) -> Self {
        Self { ctx }
    }

    /// Publish `request.source` into the content store
    pub fn write(&self, request: &WriteRequest) -> Result<WriteOutcome> {
        let source = request.source.as_path();
        if !source.exists() {
            return Err(TesseraError::validation(format!("{:?} does not exist", source)));
        }
        if request.name.trim().is_empty() {
            return Err(TesseraError::validation("a name is required"));
        }
        if request.compression == Compression::None {
            if source.is_dir() {
                return Err(TesseraError::validation(
                    "a directory cannot be published without compression",
                ));
            }
            if request.method == Method::Patch {
                return Err(TesseraError::validation("a PATCH layer needs a compression kind"));
            }
        }

        let config = self.ctx.config();
        let writer_root = config.temp_path.join("writer");
        fs::create_dir_all(&writer_root)?;
        let work = tempfile::Builder::new().prefix("write-").tempdir_in(&writer_root)?;
        let mut guard = CleanupGuard::new(&[config.temp_path.as_path()]);

        let mut previous_signature = None;
        let mut manifest = None;
        let (payload_source, published_tree) = match request.method {
            Method::Patch => {
                let (layer, signature, after) = self.diff_against_latest(request, work.path(), &mut guard)?;
                previous_signature = Some(signature);
                manifest = Some(layer.1);
                (layer.0, Some(after))
            }
            Method::Put if source.is_file() && request.compression != Compression::None => {
                let wrapped = wrap_single_file(source, work.path())?;
                (wrapped.clone(), Some(wrapped))
            }
            Method::Put if source.is_dir() => (source.to_path_buf(), Some(source.to_path_buf())),
            Method::Put => (source.to_path_buf(), None),
        };

        let compressed = work.path().join("payload");
        let mut engine = CompressionEngine::new(request.compression);
        engine.compress(&payload_source, &compressed)?;

        let key = crypto::generate_key();
        let encrypted = work.path().join("payload.enc");
        let size = crypto::encrypt_file(&compressed, &encrypted, &key)?;
        if size > config.max_file_size {
            return Err(TesseraError::FileTooLarge {
                path: source.to_path_buf(),
                size,
                limit: config.max_file_size,
            });
        }

        let mut file = self.ctx.store().import_file(&encrypted)?;
        file.set_secret(key.to_vec());

        let result = (|| -> Result<Option<ContentFile>> {
            file.split(config.chunk_size)?;
            file.validate_file_size()?;
            for chunk in file.chunks() {
                chunk.validate_file_size()?;
            }
            self.store_metadata(request, &file, published_tree.as_deref(), source)
        })();

        let metadata_file = match result {
            Ok(metadata_file) => metadata_file,
            Err(e) => {
                warn!("Write of {} failed, removing stored payload: {}", request.name, e);
                if let Err(cleanup) = file.delete_all() {
                    warn!("Failed to remove payload {}: {}", file.digest(), cleanup);
                }
                return Err(e);
            }
        };

        info!(
            "Wrote {} {} {} ({} bytes, {} chunk(s), {:.2} compression ratio)",
            request.method,
            request.service,
            request.name,
            size,
            file.chunk_count(),
            engine.stats().ratio()
        );
        Ok(WriteOutcome {
            file,
            metadata_file,
            previous_signature,
            manifest,
        })
    }

    /// Build the current state and diff the source against it
    ///
    /// Returns the layer directory with its manifest, the back-link signature
    /// and the tree the layer produces.
    #[allow(clippy::type_complexity)]
    fn diff_against_latest(
        &self,
        request: &WriteRequest,
        work: &Path,
        guard: &mut CleanupGuard,
    ) -> Result<((PathBuf, LayerManifest), Signature, PathBuf)> {
        let identifier = request.identifier.as_deref();
        let latest = self
            .ctx
            .ledger()
            .latest_transaction(&request.name, request.service, None, identifier)?
            .ok_or_else(|| {
                TesseraError::state(format!(
                    "cannot PATCH {} {} before an initial PUT exists",
                    request.service, request.name
                ))
            })?;

        let prior = ResourceBuilder::new(self.ctx.clone(), &request.name, request.service, identifier).build()?;
        guard.push(&prior);

        let after = if request.source.is_file() {
            wrap_single_file(&request.source, work)?
        } else {
            request.source.clone()
        };

        let layer = self
            .ctx
            .differ()
            .diff(&prior, &after, Some(latest.signature.clone()))?;
        guard.push(layer.path());

        // The prior state is only needed for the comparison
        let temp_root = self.ctx.config().temp_path.as_path();
        utils::safe_remove(&prior, &[temp_root])?;
        utils::prune_empty_parents(&prior, PRIOR_DEPTH, &[temp_root])?;
        guard.release(&prior);

        if layer.manifest().is_empty() {
            return Err(TesseraError::validation(format!(
                "{:?} has no changes since transaction {}",
                request.source, latest.signature
            )));
        }
        if LayerManifest::read_from(layer.path())?.is_none() {
            return Err(TesseraError::validation("layer has no manifest"));
        }
        debug!(
            "PATCH layer for {}: {} added, {} modified, {} removed",
            request.name,
            layer.manifest().added.len(),
            layer.manifest().modified.len(),
            layer.manifest().removed.len()
        );
        let manifest = layer.manifest().clone();
        Ok(((layer.into_path(), manifest), latest.signature, after))
    }

    /// Store the metadata sidecar when the payload is chunked or described
    fn store_metadata(
        &self,
        request: &WriteRequest,
        file: &ContentFile,
        tree: Option<&Path>,
        source: &Path,
    ) -> Result<Option<ContentFile>> {
        let chunk_hashes = file.chunk_hashes();
        if chunk_hashes.is_none() && !request.metadata.has_descriptive_fields() {
            return Ok(None);
        }

        let mut metadata = request.metadata.clone();
        metadata.chunks = chunk_hashes.unwrap_or_default();
        metadata.files = match tree {
            Some(tree) => list_files(tree)?.into_iter().map(|(key, _)| key).collect(),
            None => source
                .file_name()
                .map(|n| vec![n.to_string_lossy().into_owned()])
                .unwrap_or_default(),
        };
        let stored = self.ctx.store().store(&metadata.to_json()?)?;
        debug!("Stored metadata {} for {}", stored.digest(), file.digest());
        Ok(Some(stored))
    }
}

/// Place a single file into `work/source/data` so it diffs like a tree
fn wrap_single_file(source: &Path, work: &Path) -> Result<PathBuf> {
    let dir = work.join("source");
    fs::create_dir_all(&dir)?;
    utils::atomic_copy(source, &dir.join(SINGLE_FILE_NAME))?;
    Ok(dir)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Tessera;
    use tempfile::TempDir;

    #[test]
    fn test_discard_removes_payload_and_metadata() {
        let temp = TempDir::new().unwrap();
        let source = temp.path().join("site");
        fs::create_dir_all(&source).unwrap();
        fs::write(source.join("index.html"), "hello").unwrap();

        let tessera = Tessera::new(temp.path().join("store")).unwrap();
        let request = WriteRequest::put(&source, "alice", Service::Website)
            .with_metadata(TransactionMetadata::default().with_title("Alice"));
        let outcome = tessera.write(&request).unwrap();
        let metadata = outcome.metadata_file.clone().unwrap();
        assert!(outcome.file.exists());
        assert!(metadata.exists());

        outcome.discard().unwrap();
        assert!(!outcome.file.exists());
        assert!(!metadata.exists());
    }

    #[test]
    fn test_oversized_payload_leaves_store_empty() {
        let temp = TempDir::new().unwrap();
        let source = temp.path().join("blob.bin");
        fs::write(&source, vec![7u8; 64 * 1024]).unwrap();

        let tessera = crate::TesseraBuilder::new()
            .chunk_size(256)
            .max_chunk_size(512)
            .max_file_size(1024)
            .build(temp.path().join("store"))
            .unwrap();
        let err = tessera
            .write(&WriteRequest::put(&source, "bob", Service::Document).with_compression(Compression::None))
            .unwrap_err();
        assert!(matches!(err, TesseraError::FileTooLarge { .. }));
        assert!(!utils::dir_has_entries(&tessera.config().data_path));
    }
}

//! Read pipeline
//!
//! Materialises a resource into a plain directory:
//!
//! ```text
//! content store ── join ── verify ── decrypt ── decompress ──▶ <work>/data
//! ```
//!
//! The working directory is `temp/reader/<KIND>/<id>/<service>/<identifier>`
//! and the result is its `data` subdirectory. The result stays in place after
//! a successful read and serves as the cache for the next one: with
//! `overwrite == false` a fresh, non-empty result is returned without touching
//! the store at all.
//!
//! How the payload is located depends on the resource kind:
//!
//! - **FileHash**: the content file with that digest, never decrypted
//! - **Signature**: the transaction is looked up in the ledger
//! - **TransactionData**: the transaction record is supplied by the caller
//! - **Name**: the full history is folded by [`ResourceBuilder`]; the folded
//!   tree is already plaintext and is moved into place as-is
//!
//! Missing chunks surface as [`TesseraError::MissingData`] with the digests
//! to fetch. On any failure the working directory is removed.

use crate::builder::ResourceBuilder;
use crate::compression::CompressionEngine;
use crate::context::Context;
use crate::crypto;
use crate::error::{Result, TesseraError};
use crate::types::{Compression, Resource, ResourceIdType, Signature, TransactionRecord};
use crate::utils::{self, CleanupGuard};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, trace};

/// Levels of empty `temp/reader` directories pruned after a move
const READER_DEPTH: usize = 5;

/// Reads one resource into a directory
#[derive(Debug, Clone)]
pub struct DataReader {
    ctx: Context,
    resource: Resource,
    transaction: Option<TransactionRecord>,
    secret: Option<Vec<u8>>,
}

impl DataReader {
    /// Reader for `resource`
    pub fn new(ctx: Context, resource: Resource) -> Self {
        Self {
            ctx,
            resource,
            transaction: None,
            secret: None,
        }
    }

    /// Reader for a transaction the caller already holds
    pub fn for_transaction(ctx: Context, tx: TransactionRecord) -> Self {
        let resource = Resource::new(
            &tx.signature.to_hex(),
            ResourceIdType::TransactionData,
            tx.service,
            tx.identifier.as_deref(),
        );
        Self {
            ctx,
            resource,
            transaction: Some(tx),
            secret: None,
        }
    }

    /// Decrypt with `secret` instead of the transaction's own
    pub fn with_secret(mut self, secret: Vec<u8>) -> Self {
        self.secret = Some(secret);
        self
    }

    pub fn resource(&self) -> &Resource {
        &self.resource
    }

    /// Where the result is placed
    pub fn output_path(&self) -> PathBuf {
        self.ctx.reader_output(&self.resource)
    }

    /// Materialise the resource, returning the result directory
    pub fn read(&self, overwrite: bool) -> Result<PathBuf> {
        check_path_segment(&self.resource.resource_id)?;
        check_path_segment(self.resource.identifier_or_default())?;

        let output = self.output_path();
        if !self.ctx.cache().is_stale(&self.resource, &output, overwrite)? {
            debug!("Using cached build of {}", self.resource);
            return Ok(output);
        }

        let temp_root = self.ctx.config().temp_path.clone();
        let work_dir = self.ctx.reader_work_dir(&self.resource);
        let mut guard = CleanupGuard::new(&[temp_root.as_path()]);
        guard.push(&work_dir);
        utils::safe_remove(&work_dir, &[temp_root.as_path()])?;
        fs::create_dir_all(&work_dir)?;

        match self.resource.id_type {
            ResourceIdType::FileHash => {
                let file = self.ctx.store().reference(&self.resource.resource_id)?;
                if !file.exists() {
                    return Err(TesseraError::missing(file.digest()));
                }
                self.unpack(file.path(), None, Compression::Zip, &work_dir, &output)?;
            }
            ResourceIdType::Name => {
                let built = ResourceBuilder::new(
                    self.ctx.clone(),
                    &self.resource.resource_id,
                    self.resource.service,
                    self.resource.identifier.as_deref(),
                )
                .build()?;
                self.relocate(&built, &output)?;
            }
            ResourceIdType::Signature => {
                let signature = Signature::from_hex(&self.resource.resource_id)?;
                let tx = self
                    .ctx
                    .ledger()
                    .transaction_by_signature(&signature)?
                    .ok_or_else(|| TesseraError::TransactionNotFound(self.resource.resource_id.clone()))?;
                self.read_transaction(&tx, &work_dir, &output)?;
            }
            ResourceIdType::TransactionData => {
                let tx = self.transaction.as_ref().ok_or_else(|| {
                    TesseraError::validation("transaction reader has no transaction record")
                })?;
                self.read_transaction(tx, &work_dir, &output)?;
            }
        }

        guard.disarm();
        debug!("Read {} into {:?}", self.resource, output);
        Ok(output)
    }

    fn read_transaction(&self, tx: &TransactionRecord, work_dir: &Path, output: &Path) -> Result<()> {
        let mut file = self
            .ctx
            .store()
            .reference_with_chunks(&tx.data_hash, &tx.chunk_hashes)?;

        if !file.exists() {
            let missing = file.missing_hashes();
            if !missing.is_empty() {
                trace!("{} of {} file(s) missing for {}", missing.len(), tx.file_count(), tx.signature);
                return Err(TesseraError::MissingData(missing));
            }
            file.join()?;
        }
        file.verify_or_delete()?;

        let size = file.size()?;
        if size != tx.size {
            return Err(TesseraError::SizeMismatch {
                digest: tx.data_hash.clone(),
                expected: tx.size,
                actual: size,
            });
        }

        let secret = self.secret.as_deref().or(tx.secret.as_deref());
        self.unpack(file.path(), secret, tx.compression, work_dir, output)
    }

    /// Decrypt when a secret is known, then extract into `output`
    fn unpack(
        &self,
        payload: &Path,
        secret: Option<&[u8]>,
        compression: Compression,
        work_dir: &Path,
        output: &Path,
    ) -> Result<()> {
        let decrypted = work_dir.join("payload");
        let source = match secret {
            Some(key) => {
                crypto::decrypt_file(payload, &decrypted, key)?;
                decrypted.as_path()
            }
            None => payload,
        };

        CompressionEngine::new(compression).decompress(source, output)?;
        if decrypted.exists() {
            fs::remove_file(&decrypted)?;
        }
        Ok(())
    }

    /// Move an already-built tree into `output`, pruning emptied parents
    fn relocate(&self, built: &Path, output: &Path) -> Result<()> {
        if built == output {
            return Ok(());
        }
        if !built.is_dir() {
            return Err(TesseraError::state(format!("built tree {:?} does not exist", built)));
        }
        utils::move_path(built, output)?;
        let temp_root = self.ctx.config().temp_path.as_path();
        utils::prune_empty_parents(built, READER_DEPTH, &[temp_root])?;
        Ok(())
    }
}

/// Ids and identifiers become directory names under the temp root
fn check_path_segment(segment: &str) -> Result<()> {
    if segment.is_empty()
        || segment == "."
        || segment == ".."
        || segment.contains(['/', '\\', '\0'])
    {
        return Err(TesseraError::validation(format!(
            "{:?} cannot be used as a resource id",
            segment
        )));
    }
    Ok(())
}

//! Main Tessera API
//!
//! [`Tessera`] ties the pipelines to one pair of data/temp roots, a ledger, a
//! build queue and a blocklist. Collaborators are injected through
//! [`TesseraBuilder`]; anything not supplied falls back to an in-memory
//! implementation.

use crate::context::Context;
use crate::error::{Result, TesseraError};
use crate::ledger::{Ledger, MemoryLedger, ResourceCacheRow};
use crate::queue::{BuildQueue, BuildQueueItem, MemoryBuildQueue};
use crate::reader::DataReader;
use crate::status::{MemoryNameList, NameList, ResourceStatus, StatusResolver};
use crate::types::{Method, Resource, ResourceIdType, Signature, TesseraConfig, TransactionRecord};
use crate::utils;
use crate::writer::{DataWriter, WriteOutcome, WriteRequest};
use chrono::Utc;
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, instrument, warn};

/// Storage and versioning engine for one pair of data and temp roots
///
/// # Examples
///
/// ```rust,no_run
/// use tessera::{Tessera, TesseraBuilder};
/// use tessera::types::{Resource, Service};
/// use tessera::writer::WriteRequest;
///
/// # fn main() -> tessera::Result<()> {
/// let tessera = TesseraBuilder::new().chunk_size(256 * 1024).build("./store")?;
///
/// tessera.publish(&WriteRequest::put("./site", "alice", Service::Website))?;
/// tessera.publish(&WriteRequest::patch("./site", "alice", Service::Website))?;
///
/// let built = tessera.read(&Resource::by_name("alice", Service::Website, None), false)?;
/// println!("current state in {:?}", built);
/// # Ok(())
/// # }
/// ```
pub struct Tessera {
    ctx: Context,
    /// Writable ledger used by [`publish`](Self::publish), when there is one
    journal: Option<Arc<MemoryLedger>>,
    queue: Arc<dyn BuildQueue>,
    /// Queue driven by [`build_next`](Self::build_next), when in memory
    scheduler: Option<Arc<MemoryBuildQueue>>,
    blocklist: Arc<dyn NameList>,
    publisher_key: Vec<u8>,
}

impl std::fmt::Debug for Tessera {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Tessera")
            .field("ctx", &self.ctx)
            .field("writable_ledger", &self.journal.is_some())
            .field("queued", &self.scheduler.as_ref().map(|q| q.len()))
            .finish()
    }
}

impl Tessera {
    /// Instance with default settings rooted at `base`
    pub fn new(base: impl Into<PathBuf>) -> Result<Self> {
        TesseraBuilder::new().build(base)
    }

    /// Shared pipeline context
    pub fn context(&self) -> &Context {
        &self.ctx
    }

    pub fn config(&self) -> &TesseraConfig {
        self.ctx.config()
    }

    pub fn ledger(&self) -> &Arc<dyn Ledger> {
        self.ctx.ledger()
    }

    /// The in-memory build queue, unless an external one was injected
    pub fn build_queue(&self) -> Option<&Arc<MemoryBuildQueue>> {
        self.scheduler.as_ref()
    }

    /// Run the write pipeline without recording a transaction
    #[instrument(skip(self, request), fields(name = %request.name, method = %request.method))]
    pub fn write(&self, request: &WriteRequest) -> Result<WriteOutcome> {
        DataWriter::new(self.ctx.clone()).write(request)
    }

    /// Write `request` and record the resulting transaction in the ledger
    ///
    /// The transaction is signed locally by hashing its fields; this stands
    /// in for network signing when the ledger is the in-memory one.
    #[instrument(skip(self, request), fields(name = %request.name, method = %request.method))]
    pub fn publish(&self, request: &WriteRequest) -> Result<TransactionRecord> {
        let journal = self
            .journal
            .as_ref()
            .ok_or_else(|| TesseraError::state("the configured ledger does not accept new transactions"))?;

        let latest = self.ledger().latest_transaction(
            &request.name,
            request.service,
            None,
            request.identifier.as_deref(),
        )?;
        let outcome = self.write(request)?;
        let timestamp = match &latest {
            Some(tx) => Utc::now().timestamp_millis().max(tx.timestamp + 1),
            None => Utc::now().timestamp_millis(),
        };

        let size = match outcome.file.size() {
            Ok(size) => size,
            Err(e) => {
                if let Err(cleanup) = outcome.discard() {
                    warn!("Failed to discard unpublished payload: {}", cleanup);
                }
                return Err(e);
            }
        };
        let mut tx = TransactionRecord {
            signature: Signature::new(Vec::new()),
            creator_public_key: self.publisher_key.clone(),
            timestamp,
            name: Some(request.name.clone()),
            service: request.service,
            identifier: request.identifier.clone(),
            method: request.method,
            compression: request.compression,
            data_hash: outcome.file.digest().to_string(),
            chunk_hashes: outcome.file.chunk_hashes().unwrap_or_default(),
            size,
            secret: outcome.file.secret().map(<[u8]>::to_vec),
            metadata_hash: outcome.metadata_file.as_ref().map(|m| m.digest().to_string()),
        };
        tx.signature = local_signature(&tx, outcome.previous_signature.as_ref());
        journal.insert(tx.clone());

        if let Err(e) = self.update_cache_row(&tx) {
            warn!("Failed to update cache row for {}: {}", request.name, e);
        }
        self.notify_transaction(&tx)?;

        info!("Published {} {} as {}", tx.method, request.name, tx.signature);
        Ok(tx)
    }

    /// Materialise `resource`, reusing a fresh earlier result unless `overwrite`
    #[instrument(skip(self), fields(resource = %resource))]
    pub fn read(&self, resource: &Resource, overwrite: bool) -> Result<PathBuf> {
        DataReader::new(self.ctx.clone(), resource.clone()).read(overwrite)
    }

    /// Materialise a single transaction's payload
    #[instrument(skip(self, tx), fields(signature = %tx.signature))]
    pub fn read_transaction(&self, tx: &TransactionRecord, overwrite: bool) -> Result<PathBuf> {
        DataReader::for_transaction(self.ctx.clone(), tx.clone()).read(overwrite)
    }

    /// Queue `resource` for building
    pub fn request_build(&self, resource: &Resource, priority: i32) -> Result<bool> {
        let queue = self.memory_queue()?;
        Ok(queue.enqueue(BuildQueueItem::new(resource.clone()).with_priority(priority)))
    }

    /// Build the next queued resource, if any
    ///
    /// Drops hung builds and expired failures first.
    #[instrument(skip(self))]
    pub fn build_next(&self) -> Result<Option<(Resource, Result<PathBuf>)>> {
        let queue = self.memory_queue()?;
        let dropped = queue.cleanup(Utc::now());
        if dropped > 0 {
            debug!("Dropped {} expired build queue entries", dropped);
        }
        let Some(item) = queue.start_next() else {
            return Ok(None);
        };
        let outcome = self.read(&item.resource, true);
        queue.complete(&item.resource, &outcome);
        Ok(Some((item.resource, outcome)))
    }

    /// Whether the built tree of `resource` must be rebuilt
    pub fn is_stale(&self, resource: &Resource) -> Result<bool> {
        let built = self.ctx.reader_output(resource);
        self.ctx.cache().is_stale(resource, &built, false)
    }

    /// Externally visible status of `resource`
    #[instrument(skip(self), fields(resource = %resource))]
    pub fn status(&self, resource: &Resource) -> Result<ResourceStatus> {
        StatusResolver::new(&self.ctx, self.queue.as_ref(), self.blocklist.as_ref()).status(resource)
    }

    /// React to a new transaction for a named resource
    ///
    /// The next status check or read goes back to the ledger and a previous
    /// build failure no longer blocks a retry.
    #[instrument(skip(self, tx), fields(signature = %tx.signature))]
    pub fn notify_transaction(&self, tx: &TransactionRecord) -> Result<()> {
        let Some(resource) = tx.resource() else {
            return Ok(());
        };
        self.ctx.rate_limiter().invalidate(&resource.unique_key());
        if let Some(queue) = &self.scheduler {
            queue.remove_failed(&resource);
        }
        self.delete_cache(&resource)?;
        Ok(())
    }

    /// Remove the built tree of `resource`
    #[instrument(skip(self), fields(resource = %resource))]
    pub fn delete_cache(&self, resource: &Resource) -> Result<bool> {
        let temp_root = self.ctx.config().temp_path.as_path();
        let work_dir = self.ctx.reader_work_dir(resource);
        let removed = utils::safe_remove(&work_dir, &[temp_root])?;
        if removed {
            utils::prune_empty_parents(&work_dir, 4, &[temp_root])?;
            debug!("Deleted built tree of {}", resource);
        }
        self.ctx.rate_limiter().invalidate(&resource.unique_key());
        Ok(removed)
    }

    /// Remove the built tree and every stored file of a named resource
    ///
    /// Returns how many transactions had their payload removed.
    #[instrument(skip(self), fields(resource = %resource))]
    pub fn delete(&self, resource: &Resource) -> Result<usize> {
        if resource.id_type != ResourceIdType::Name {
            return Err(TesseraError::validation("only named resources can be deleted"));
        }
        self.delete_cache(resource)?;

        let store = self.ctx.store();
        let history = self.ledger().transactions_since(
            &resource.resource_id,
            resource.service,
            resource.identifier.as_deref(),
            i64::MIN,
        )?;
        for tx in &history {
            store
                .reference_with_chunks(&tx.data_hash, &tx.chunk_hashes)?
                .delete_all()?;
            if let Some(metadata_hash) = &tx.metadata_hash {
                store.reference(metadata_hash)?.delete()?;
            }
        }
        info!("Deleted {} transaction payload(s) of {}", history.len(), resource);
        Ok(history.len())
    }

    fn memory_queue(&self) -> Result<&Arc<MemoryBuildQueue>> {
        self.scheduler
            .as_ref()
            .ok_or_else(|| TesseraError::state("builds are scheduled by an external queue"))
    }

    /// Opportunistic bookkeeping; the row can always be rebuilt from the ledger
    fn update_cache_row(&self, tx: &TransactionRecord) -> Result<()> {
        let Some(name) = tx.name.as_deref() else {
            return Ok(());
        };
        let ledger = self.ledger();
        let identifier = tx.identifier.as_deref();
        let existing = ledger.resource_cache_row(tx.service, name, identifier)?;
        let row = match (tx.method, existing) {
            (Method::Patch, Some(row)) => ResourceCacheRow {
                size: tx.size,
                updated: Some(tx.timestamp),
                ..row
            },
            (Method::Patch, None) => ResourceCacheRow {
                service: tx.service,
                name: name.to_string(),
                identifier: tx.identifier.clone(),
                size: tx.size,
                created: ledger
                    .latest_transaction(name, tx.service, Some(Method::Put), identifier)?
                    .map_or(tx.timestamp, |put| put.timestamp),
                updated: Some(tx.timestamp),
            },
            (Method::Put, _) => ResourceCacheRow {
                service: tx.service,
                name: name.to_string(),
                identifier: tx.identifier.clone(),
                size: tx.size,
                created: tx.timestamp,
                updated: None,
            },
        };
        ledger.save_resource_cache_row(row)
    }
}

/// Deterministic stand-in signature over the transaction's fields
fn local_signature(tx: &TransactionRecord, previous: Option<&Signature>) -> Signature {
    let mut hasher = Sha256::new();
    hasher.update(&tx.creator_public_key);
    hasher.update(tx.timestamp.to_be_bytes());
    hasher.update(tx.name.as_deref().unwrap_or("").as_bytes());
    hasher.update(tx.service.as_str().as_bytes());
    hasher.update(tx.identifier.as_deref().unwrap_or("").as_bytes());
    hasher.update(tx.method.to_string().as_bytes());
    hasher.update(tx.data_hash.as_bytes());
    if let Some(previous) = previous {
        hasher.update(previous.as_bytes());
    }
    Signature::new(hasher.finalize().to_vec())
}

/// Builder for configuring a [`Tessera`] instance
///
/// # Examples
///
/// ```rust,no_run
/// use tessera::TesseraBuilder;
/// use std::time::Duration;
///
/// # fn main() -> tessera::Result<()> {
/// let tessera = TesseraBuilder::new()
///     .chunk_size(256 * 1024)
///     .validate_all_layers(true)
///     .rate_limit_ttl(Duration::from_secs(600))
///     .build("./store")?;
/// # Ok(())
/// # }
/// ```
pub struct TesseraBuilder {
    data_path: Option<PathBuf>,
    temp_path: Option<PathBuf>,
    chunk_size: Option<usize>,
    max_chunk_size: Option<u64>,
    max_file_size: Option<u64>,
    max_patch_file_size: Option<u64>,
    validate_all_layers: bool,
    rate_limit_ttl: Option<Duration>,
    build_timeout: Option<Duration>,
    failure_timeout: Option<Duration>,
    parallel_workers: Option<usize>,
    ledger: Option<Arc<dyn Ledger>>,
    journal: Option<Arc<MemoryLedger>>,
    queue: Option<Arc<dyn BuildQueue>>,
    blocklist: Option<Arc<dyn NameList>>,
    publisher_key: Vec<u8>,
}

impl TesseraBuilder {
    /// Builder with default settings
    pub fn new() -> Self {
        Self {
            data_path: None,
            temp_path: None,
            chunk_size: None,
            max_chunk_size: None,
            max_file_size: None,
            max_patch_file_size: None,
            validate_all_layers: false,
            rate_limit_ttl: None,
            build_timeout: None,
            failure_timeout: None,
            parallel_workers: None,
            ledger: None,
            journal: None,
            queue: None,
            blocklist: None,
            publisher_key: Vec::new(),
        }
    }

    /// Content store root; defaults to `<base>/data`
    pub fn data_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.data_path = Some(path.into());
        self
    }

    /// Temp root; defaults to `<base>/temp`
    pub fn temp_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.temp_path = Some(path.into());
        self
    }

    /// Split size for written payloads
    pub fn chunk_size(mut self, size: usize) -> Self {
        self.chunk_size = Some(size);
        self
    }

    pub fn max_chunk_size(mut self, size: u64) -> Self {
        self.max_chunk_size = Some(size);
        self
    }

    pub fn max_file_size(mut self, size: u64) -> Self {
        self.max_file_size = Some(size);
        self
    }

    /// Largest modified file stored as a line patch
    pub fn max_patch_file_size(mut self, size: u64) -> Self {
        self.max_patch_file_size = Some(size);
        self
    }

    /// Verify layer hashes after every fold step
    pub fn validate_all_layers(mut self, enabled: bool) -> Self {
        self.validate_all_layers = enabled;
        self
    }

    /// How long a fresh cache check suppresses the next one
    pub fn rate_limit_ttl(mut self, ttl: Duration) -> Self {
        self.rate_limit_ttl = Some(ttl);
        self
    }

    pub fn build_timeout(mut self, timeout: Duration) -> Self {
        self.build_timeout = Some(timeout);
        self
    }

    pub fn failure_timeout(mut self, timeout: Duration) -> Self {
        self.failure_timeout = Some(timeout);
        self
    }

    /// Worker threads for file comparison; at least one
    pub fn parallel_workers(mut self, count: usize) -> Self {
        self.parallel_workers = Some(count.max(1));
        self
    }

    /// Read-only external ledger; [`Tessera::publish`] is unavailable
    pub fn ledger(mut self, ledger: Arc<dyn Ledger>) -> Self {
        self.ledger = Some(ledger);
        self.journal = None;
        self
    }

    /// In-memory ledger shared with the caller; transactions can be published
    pub fn memory_ledger(mut self, ledger: Arc<MemoryLedger>) -> Self {
        self.ledger = Some(ledger.clone() as Arc<dyn Ledger>);
        self.journal = Some(ledger);
        self
    }

    /// External build queue; replaces the in-memory scheduler
    pub fn build_queue(mut self, queue: Arc<dyn BuildQueue>) -> Self {
        self.queue = Some(queue);
        self
    }

    /// Names whose content must not be served
    pub fn blocklist(mut self, blocklist: Arc<dyn NameList>) -> Self {
        self.blocklist = Some(blocklist);
        self
    }

    /// Public key recorded on published transactions
    pub fn publisher_key(mut self, key: impl Into<Vec<u8>>) -> Self {
        self.publisher_key = key.into();
        self
    }

    /// Validate the configuration and create the roots under `base`
    pub fn build(self, base: impl Into<PathBuf>) -> Result<Tessera> {
        let mut config = TesseraConfig::with_base(base);
        if let Some(path) = self.data_path {
            config.data_path = path;
        }
        if let Some(path) = self.temp_path {
            config.temp_path = path;
        }
        if let Some(size) = self.chunk_size {
            config.chunk_size = size;
        }
        if let Some(size) = self.max_chunk_size {
            config.max_chunk_size = size;
        }
        if let Some(size) = self.max_file_size {
            config.max_file_size = size;
        }
        if let Some(size) = self.max_patch_file_size {
            config.max_patch_file_size = size;
        }
        if let Some(ttl) = self.rate_limit_ttl {
            config.rate_limit_ttl = ttl;
        }
        if let Some(timeout) = self.build_timeout {
            config.build_timeout = timeout;
        }
        if let Some(timeout) = self.failure_timeout {
            config.failure_timeout = timeout;
        }
        if let Some(workers) = self.parallel_workers {
            config.parallel_workers = workers;
        }
        config.validate_all_layers = self.validate_all_layers;
        config.validate()?;

        create_root(&config.data_path)?;
        create_root(&config.temp_path)?;

        let (ledger, journal) = match (self.ledger, self.journal) {
            (Some(ledger), journal) => (ledger, journal),
            (None, _) => {
                let memory = Arc::new(MemoryLedger::new());
                (memory.clone() as Arc<dyn Ledger>, Some(memory))
            }
        };
        let (queue, scheduler) = match self.queue {
            Some(queue) => (queue, None),
            None => {
                let memory = Arc::new(MemoryBuildQueue::new(config.build_timeout, config.failure_timeout));
                (memory.clone() as Arc<dyn BuildQueue>, Some(memory))
            }
        };
        let blocklist = self
            .blocklist
            .unwrap_or_else(|| Arc::new(MemoryNameList::new()) as Arc<dyn NameList>);

        debug!(
            "Tessera ready: data {:?}, temp {:?}, chunk size {}",
            config.data_path, config.temp_path, config.chunk_size
        );
        Ok(Tessera {
            ctx: Context::new(config, ledger),
            journal,
            queue,
            scheduler,
            blocklist,
            publisher_key: self.publisher_key,
        })
    }
}

impl Default for TesseraBuilder {
    fn default() -> Self {
        Self::new()
    }
}

fn create_root(path: &Path) -> Result<()> {
    std::fs::create_dir_all(path)?;
    Ok(())
}

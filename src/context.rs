//! Capabilities shared by the pipelines
//!
//! Readers, writers and builders receive a [`Context`] instead of reaching for
//! global state. Cloning is cheap; every field is shared.

use crate::cache::{DataCache, RateLimiter};
use crate::diff::TreeDiffer;
use crate::fold::LayerFolder;
use crate::ledger::Ledger;
use crate::storage::ContentStore;
use crate::types::{Resource, TesseraConfig};
use std::path::PathBuf;
use std::sync::Arc;

/// Name of the directory a reader materialises its result into
pub(crate) const READER_OUTPUT_DIR: &str = "data";

/// Configuration, storage and ledger access for one engine instance
#[derive(Clone)]
pub struct Context {
    config: Arc<TesseraConfig>,
    store: ContentStore,
    ledger: Arc<dyn Ledger>,
    rate_limiter: Arc<RateLimiter>,
}

impl std::fmt::Debug for Context {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Context")
            .field("data_path", &self.config.data_path)
            .field("temp_path", &self.config.temp_path)
            .field("rate_limited", &self.rate_limiter.len())
            .finish()
    }
}

impl Context {
    /// Bundle a validated configuration with a ledger
    pub fn new(config: TesseraConfig, ledger: Arc<dyn Ledger>) -> Self {
        let store = ContentStore::new(
            config.data_path.clone(),
            config.temp_path.clone(),
            config.max_file_size,
            config.max_chunk_size,
        );
        let rate_limiter = Arc::new(RateLimiter::new(config.rate_limit_ttl));
        Self {
            config: Arc::new(config),
            store,
            ledger,
            rate_limiter,
        }
    }

    pub fn config(&self) -> &TesseraConfig {
        &self.config
    }

    pub fn store(&self) -> &ContentStore {
        &self.store
    }

    pub fn ledger(&self) -> &Arc<dyn Ledger> {
        &self.ledger
    }

    pub fn rate_limiter(&self) -> &Arc<RateLimiter> {
        &self.rate_limiter
    }

    /// Staleness checks backed by this context's ledger
    pub fn cache(&self) -> DataCache {
        DataCache::new(self.ledger.clone(), self.rate_limiter.clone())
    }

    pub fn differ(&self) -> TreeDiffer {
        TreeDiffer::new(&self.config.temp_path, self.config.max_patch_file_size)
            .with_parallel_workers(self.config.parallel_workers)
    }

    pub fn folder(&self) -> LayerFolder {
        LayerFolder::new(&self.config.temp_path).validate_all_layers(self.config.validate_all_layers)
    }

    /// Working directory of the reader for `resource`
    ///
    /// `temp/reader/<KIND>/<id>/<service>/<identifier>`; unique per resource
    /// so concurrent reads of different resources never share a path.
    pub fn reader_work_dir(&self, resource: &Resource) -> PathBuf {
        self.config
            .temp_path
            .join("reader")
            .join(resource.id_type.to_string())
            .join(&resource.resource_id)
            .join(resource.service.to_string())
            .join(resource.identifier_or_default())
    }

    /// Where the reader for `resource` leaves its result
    pub fn reader_output(&self, resource: &Resource) -> PathBuf {
        self.reader_work_dir(resource).join(READER_OUTPUT_DIR)
    }
}

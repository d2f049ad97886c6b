//! Built-tree invalidation
//!
//! A built tree records which transaction it was built from in its `cache`
//! sidecar. It is stale when the ledger now knows a newer transaction for
//! the resource. Asking the ledger is comparatively expensive, so a fresh
//! result is remembered in a [`RateLimiter`] and the next check within the
//! TTL is skipped entirely. New transactions must call
//! [`RateLimiter::invalidate`] so an update is never masked.
//!
//! Resources addressed by digest or signature are immutable and never go
//! stale once present.

use crate::collections::GxBuildHasher;
use crate::error::Result;
use crate::ledger::Ledger;
use crate::metadata::{CacheRecord, Sidecar};
use crate::types::{Resource, ResourceIdType};
use crate::utils::dir_has_entries;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, trace, warn};

/// Short-lived set of recently verified resources
#[derive(Debug)]
pub struct RateLimiter {
    entries: DashMap<String, Instant, GxBuildHasher>,
    ttl: Duration,
    last_purge: Mutex<Instant>,
}

impl RateLimiter {
    /// Create a limiter whose entries expire after `ttl`
    pub fn new(ttl: Duration) -> Self {
        Self {
            entries: DashMap::with_hasher(GxBuildHasher::default()),
            ttl,
            last_purge: Mutex::new(Instant::now()),
        }
    }

    /// Whether `key` was verified within the TTL; expired entries are dropped
    pub fn is_cached(&self, key: &str) -> bool {
        let expired = match self.entries.get(key) {
            None => return false,
            Some(verified) => verified.elapsed() >= self.ttl,
        };
        if expired {
            self.entries.remove(key);
            return false;
        }
        true
    }

    /// Remember that `key` was just verified
    pub fn insert(&self, key: impl Into<String>) {
        self.entries.insert(key.into(), Instant::now());
    }

    /// Forget `key`, returning whether it was present
    pub fn invalidate(&self, key: &str) -> bool {
        self.entries.remove(key).is_some()
    }

    /// Drop every expired entry, returning how many were removed
    pub fn purge_expired(&self) -> usize {
        let before = self.entries.len();
        self.entries.retain(|_, verified| verified.elapsed() < self.ttl);
        before - self.entries.len()
    }

    /// Purge expired entries at most once per TTL, returning how many were removed
    pub fn purge_if_due(&self) -> usize {
        {
            let mut last = self.last_purge.lock();
            if last.elapsed() < self.ttl {
                return 0;
            }
            *last = Instant::now();
        }
        self.purge_expired()
    }

    /// Number of remembered entries
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether nothing is remembered
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Decides whether a built tree must be rebuilt
#[derive(Clone)]
pub struct DataCache {
    ledger: Arc<dyn Ledger>,
    rate_limiter: Arc<RateLimiter>,
}

impl std::fmt::Debug for DataCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DataCache")
            .field("rate_limited", &self.rate_limiter.len())
            .finish()
    }
}

impl DataCache {
    /// Create a cache checker over `ledger`
    pub fn new(ledger: Arc<dyn Ledger>, rate_limiter: Arc<RateLimiter>) -> Self {
        Self { ledger, rate_limiter }
    }

    /// Whether the tree at `built` no longer represents `resource`
    pub fn is_stale(&self, resource: &Resource, built: &Path, overwrite: bool) -> Result<bool> {
        if overwrite {
            return Ok(true);
        }
        if !dir_has_entries(built) {
            return Ok(true);
        }
        if resource.id_type != ResourceIdType::Name {
            return Ok(false);
        }

        let purged = self.rate_limiter.purge_if_due();
        if purged > 0 {
            trace!("Purged {} expired rate-limit entries", purged);
        }
        let key = resource.unique_key();
        if self.rate_limiter.is_cached(&key) {
            trace!("{} checked recently; treating as fresh", resource);
            return Ok(false);
        }

        let Some(latest) = self.ledger.latest_transaction(
            &resource.resource_id,
            resource.service,
            None,
            resource.identifier.as_deref(),
        )?
        else {
            debug!("No transactions for {}", resource);
            return Ok(true);
        };

        let record = match CacheRecord::read_from(built) {
            Ok(record) => record,
            Err(e) => {
                warn!("Unreadable cache record in {:?}: {}", built, e);
                None
            }
        };
        match record {
            Some(record) if record.signature == latest.signature => {
                self.rate_limiter.insert(key);
                Ok(false)
            }
            Some(_) => {
                debug!("{} has a newer transaction than its build", resource);
                Ok(true)
            }
            None => Ok(true),
        }
    }
}

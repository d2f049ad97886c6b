//! Resource status
//!
//! Collapses cache freshness, build queue state, the blocklist and local
//! data completeness into one externally visible [`StatusKind`]. Checks run
//! in a fixed order and the first match wins:
//!
//! | check                                 | status          |
//! |---------------------------------------|-----------------|
//! | not addressed by name                 | `Unsupported`   |
//! | built tree is fresh                   | `Ready`         |
//! | queued or building                    | `Building`      |
//! | failed recently                       | `BuildFailed`   |
//! | name is blacklisted                   | `Blacklisted`   |
//! | no transactions                       | `NotPublished`  |
//! | no chunk present locally              | `Published`     |
//! | some chunks missing                   | `MissingData`   |
//! | everything present, not yet built     | `Downloaded`    |

use crate::collections::{HashSet, HashSetExt};
use crate::context::Context;
use crate::error::Result;
use crate::queue::BuildQueue;
use crate::types::{Method, Resource, ResourceIdType, TransactionRecord};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::trace;

/// Membership check against a list of names
pub trait NameList: Send + Sync {
    /// Whether `name` is on the list
    fn contains(&self, name: &str) -> bool;
}

/// In-memory [`NameList`]; names compare case-insensitively
#[derive(Debug, Default)]
pub struct MemoryNameList {
    names: RwLock<HashSet<String>>,
}

impl MemoryNameList {
    pub fn new() -> Self {
        Self {
            names: RwLock::new(HashSet::new()),
        }
    }

    /// Add a name, returning whether it was new
    pub fn add(&self, name: &str) -> bool {
        self.names.write().insert(name.to_lowercase())
    }

    /// Remove a name, returning whether it was present
    pub fn remove(&self, name: &str) -> bool {
        self.names.write().remove(&name.to_lowercase())
    }
}

impl NameList for MemoryNameList {
    fn contains(&self, name: &str) -> bool {
        self.names.read().contains(&name.to_lowercase())
    }
}

/// Externally visible state of a resource
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StatusKind {
    Unsupported,
    Ready,
    Building,
    BuildFailed,
    Blacklisted,
    NotPublished,
    Published,
    MissingData,
    Downloaded,
}

impl StatusKind {
    /// Short label
    pub fn title(&self) -> &'static str {
        match self {
            StatusKind::Unsupported => "Unsupported",
            StatusKind::Ready => "Ready",
            StatusKind::Building => "Building",
            StatusKind::BuildFailed => "Build failed",
            StatusKind::Blacklisted => "Blacklisted",
            StatusKind::NotPublished => "Not published",
            StatusKind::Published => "Published",
            StatusKind::MissingData => "Missing data",
            StatusKind::Downloaded => "Downloaded",
        }
    }

    /// One-sentence explanation
    pub fn description(&self) -> &'static str {
        match self {
            StatusKind::Unsupported => "Unsupported request",
            StatusKind::Ready => "Ready",
            StatusKind::Building => "Building...",
            StatusKind::BuildFailed => "Build failed. Please try again later",
            StatusKind::Blacklisted => "Name is blacklisted so content cannot be served",
            StatusKind::NotPublished => "No transactions exist for this resource",
            StatusKind::Published => "Published but not yet downloaded",
            StatusKind::MissingData => "Unable to locate all files. Please try again later",
            StatusKind::Downloaded => "Files downloaded",
        }
    }
}

impl fmt::Display for StatusKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.title())
    }
}

/// Status plus chunk counts across the resource history
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceStatus {
    pub kind: StatusKind,
    /// Files present locally, when counted
    pub local_chunk_count: Option<usize>,
    /// Files needed, when counted
    pub total_chunk_count: Option<usize>,
}

impl ResourceStatus {
    fn bare(kind: StatusKind) -> Self {
        Self {
            kind,
            local_chunk_count: None,
            total_chunk_count: None,
        }
    }
}

/// Computes [`ResourceStatus`] from injected collaborators
pub struct StatusResolver<'a> {
    ctx: &'a Context,
    queue: &'a dyn BuildQueue,
    blocklist: &'a dyn NameList,
}

impl<'a> StatusResolver<'a> {
    pub fn new(ctx: &'a Context, queue: &'a dyn BuildQueue, blocklist: &'a dyn NameList) -> Self {
        Self { ctx, queue, blocklist }
    }

    /// Status of `resource`
    pub fn status(&self, resource: &Resource) -> Result<ResourceStatus> {
        if resource.id_type != ResourceIdType::Name {
            return Ok(ResourceStatus::bare(StatusKind::Unsupported));
        }

        let built = self.ctx.reader_output(resource);
        if !self.ctx.cache().is_stale(resource, &built, false)? {
            return Ok(ResourceStatus::bare(StatusKind::Ready));
        }
        if self.queue.is_in_build_queue(resource) {
            return Ok(ResourceStatus::bare(StatusKind::Building));
        }
        if self.queue.is_in_failed_list(resource) {
            return Ok(ResourceStatus::bare(StatusKind::BuildFailed));
        }
        if self.blocklist.contains(&resource.resource_id) {
            return Ok(ResourceStatus::bare(StatusKind::Blacklisted));
        }

        let history = self.history(resource)?;
        if history.is_empty() {
            return Ok(ResourceStatus::bare(StatusKind::NotPublished));
        }

        let (local, total) = self.chunk_counts(&history)?;
        trace!("{}: {}/{} file(s) present", resource, local, total);
        let kind = if local == 0 {
            StatusKind::Published
        } else if local < total {
            StatusKind::MissingData
        } else {
            StatusKind::Downloaded
        };
        Ok(ResourceStatus {
            kind,
            local_chunk_count: Some(local),
            total_chunk_count: Some(total),
        })
    }

    /// Transactions since the latest PUT, or everything when there is none
    fn history(&self, resource: &Resource) -> Result<Vec<TransactionRecord>> {
        let ledger = self.ctx.ledger();
        let identifier = resource.identifier.as_deref();
        let since = ledger
            .latest_transaction(&resource.resource_id, resource.service, Some(Method::Put), identifier)?
            .map_or(i64::MIN, |put| put.timestamp);
        ledger.transactions_since(&resource.resource_id, resource.service, identifier, since)
    }

    fn chunk_counts(&self, history: &[TransactionRecord]) -> Result<(usize, usize)> {
        let store = self.ctx.store();
        let (mut local, mut total) = (0, 0);
        for tx in history {
            let file = store.reference_with_chunks(&tx.data_hash, &tx.chunk_hashes)?;
            total += tx.file_count();
            local += if file.chunk_count() == 0 {
                usize::from(file.exists())
            } else if file.exists() {
                file.chunk_count()
            } else {
                file.local_chunk_count()
            };
        }
        Ok((local, total))
    }
}

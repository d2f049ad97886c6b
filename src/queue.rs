//! Build queue bookkeeping
//!
//! Deciding when to build belongs to the embedding node. This module supplies
//! the queue item type, the [`BuildQueue`] predicates that resource status
//! consumes, and [`MemoryBuildQueue`], a concurrent in-memory implementation
//! a single-process scheduler can drive:
//!
//! ```rust,no_run
//! use tessera::queue::{BuildQueueItem, MemoryBuildQueue};
//! use tessera::types::{Resource, Service};
//! use std::time::Duration;
//!
//! let queue = MemoryBuildQueue::new(Duration::from_secs(60), Duration::from_secs(300));
//! queue.enqueue(BuildQueueItem::new(Resource::by_name("alice", Service::Website, None)).with_priority(5));
//! if let Some(item) = queue.start_next() {
//!     let outcome: tessera::Result<()> = Ok(()); // build item.resource here
//!     queue.complete(&item.resource, &outcome);
//! }
//! ```

use crate::collections::GxBuildHasher;
use crate::error::Result;
use crate::types::Resource;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use std::time::Duration;
use tracing::{debug, info};

/// Priority at or above which builds are logged at info level
pub const HIGH_PRIORITY_THRESHOLD: i32 = 5;

/// A resource waiting for, or undergoing, a build
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildQueueItem {
    /// Resource to build
    pub resource: Resource,
    /// When the item was queued
    pub created_at: DateTime<Utc>,
    /// When the build started, `None` while queued
    pub build_start: Option<DateTime<Utc>>,
    /// Larger runs first
    pub priority: i32,
}

impl BuildQueueItem {
    /// Queue `resource` now with priority 0
    pub fn new(resource: Resource) -> Self {
        Self {
            resource,
            created_at: Utc::now(),
            build_start: None,
            priority: 0,
        }
    }

    /// Set the priority
    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    /// Dedup key; at most one build per key runs at a time
    pub fn key(&self) -> String {
        self.resource.unique_key()
    }

    /// Mark the build as started
    pub fn prepare_for_build(&mut self) {
        self.build_start = Some(Utc::now());
    }

    /// Waiting to start
    pub fn is_queued(&self) -> bool {
        self.build_start.is_none()
    }

    /// Started
    pub fn is_building(&self) -> bool {
        self.build_start.is_some()
    }

    pub fn is_high_priority(&self) -> bool {
        self.priority >= HIGH_PRIORITY_THRESHOLD
    }

    /// Whether more than `timeout` has passed since the item was queued
    pub fn has_reached_build_timeout(&self, now: DateTime<Utc>, timeout: Duration) -> bool {
        elapsed_since(self.created_at, now) > timeout
    }

    /// Whether a failure recorded for this item may be forgotten
    ///
    /// Measured from the build start; an item that never started has reached
    /// it.
    pub fn has_reached_failure_timeout(&self, now: DateTime<Utc>, timeout: Duration) -> bool {
        match self.build_start {
            Some(start) => elapsed_since(start, now) > timeout,
            None => true,
        }
    }
}

fn elapsed_since(then: DateTime<Utc>, now: DateTime<Utc>) -> Duration {
    (now - then).to_std().unwrap_or(Duration::ZERO)
}

/// Queue predicates consumed by resource status
pub trait BuildQueue: Send + Sync {
    /// Whether the resource is waiting to be built
    fn is_queued(&self, resource: &Resource) -> bool;

    /// Whether the resource is being built
    fn is_building(&self, resource: &Resource) -> bool;

    /// Whether the resource failed recently
    fn is_in_failed_list(&self, resource: &Resource) -> bool;

    /// Queued or building
    fn is_in_build_queue(&self, resource: &Resource) -> bool {
        self.is_queued(resource) || self.is_building(resource)
    }
}

/// Concurrent in-memory [`BuildQueue`]
#[derive(Debug)]
pub struct MemoryBuildQueue {
    queue: DashMap<String, BuildQueueItem, GxBuildHasher>,
    failed: DashMap<String, BuildQueueItem, GxBuildHasher>,
    build_timeout: Duration,
    failure_timeout: Duration,
}

impl Default for MemoryBuildQueue {
    fn default() -> Self {
        Self::new(Duration::from_secs(60), Duration::from_secs(5 * 60))
    }
}

impl MemoryBuildQueue {
    /// Create an empty queue
    pub fn new(build_timeout: Duration, failure_timeout: Duration) -> Self {
        Self {
            queue: DashMap::with_hasher(GxBuildHasher::default()),
            failed: DashMap::with_hasher(GxBuildHasher::default()),
            build_timeout,
            failure_timeout,
        }
    }

    /// Add an item unless its resource is already queued or failed recently
    pub fn enqueue(&self, item: BuildQueueItem) -> bool {
        let key = item.key();
        if self.failed.contains_key(&key) || self.queue.contains_key(&key) {
            return false;
        }
        debug!("Queued {} with priority {}", item.resource, item.priority);
        self.queue.insert(key, item);
        true
    }

    /// Start the highest-priority queued item, oldest first among equals
    pub fn start_next(&self) -> Option<BuildQueueItem> {
        let key = self
            .queue
            .iter()
            .filter(|entry| entry.value().is_queued())
            .max_by(|a, b| {
                a.value()
                    .priority
                    .cmp(&b.value().priority)
                    .then_with(|| b.value().created_at.cmp(&a.value().created_at))
            })
            .map(|entry| entry.key().clone())?;

        let mut entry = self.queue.get_mut(&key)?;
        entry.prepare_for_build();
        let item = entry.clone();
        if item.is_high_priority() {
            info!("Building {} (priority {})", item.resource, item.priority);
        } else {
            debug!("Building {} (priority {})", item.resource, item.priority);
        }
        Some(item)
    }

    /// Record the outcome of a build started with [`start_next`](Self::start_next)
    ///
    /// Missing data only drops the item so it can be queued again when the
    /// data arrives; any other error puts it on the failed list.
    pub fn complete<T>(&self, resource: &Resource, outcome: &Result<T>) {
        let key = resource.unique_key();
        let Some((_, item)) = self.queue.remove(&key) else {
            return;
        };
        match outcome {
            Ok(_) => debug!("Finished building {}", resource),
            Err(e) if e.is_missing_data() => debug!("Missing data for {}: {}", resource, e),
            Err(e) => {
                info!("Build of {} failed: {}", resource, e);
                self.failed.insert(key, item);
            }
        }
    }

    /// Forget a recorded failure
    pub fn remove_failed(&self, resource: &Resource) -> bool {
        self.failed.remove(&resource.unique_key()).is_some()
    }

    /// Drop hung items and expired failures, returning how many were removed
    pub fn cleanup(&self, now: DateTime<Utc>) -> usize {
        let before = self.queue.len() + self.failed.len();
        self.queue
            .retain(|_, item| !item.has_reached_build_timeout(now, self.build_timeout));
        self.failed
            .retain(|_, item| !item.has_reached_failure_timeout(now, self.failure_timeout));
        before - (self.queue.len() + self.failed.len())
    }

    /// Items in the queue, queued or building
    pub fn len(&self) -> usize {
        self.queue.len()
    }

    /// Whether nothing is queued
    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }
}

impl BuildQueue for MemoryBuildQueue {
    fn is_queued(&self, resource: &Resource) -> bool {
        self.queue
            .get(&resource.unique_key())
            .is_some_and(|item| item.is_queued())
    }

    fn is_building(&self, resource: &Resource) -> bool {
        self.queue
            .get(&resource.unique_key())
            .is_some_and(|item| item.is_building())
    }

    fn is_in_failed_list(&self, resource: &Resource) -> bool {
        self.failed.contains_key(&resource.unique_key())
    }
}

//! # Tessera - versioned, content-addressed resource storage
//!
//! The storage and versioning engine behind a network of named resources.
//! A resource is published as one full snapshot (PUT) followed by any number
//! of incremental layers (PATCH). Tessera turns a local directory into a
//! chunked, compressed, encrypted artifact, turns such artifacts back into
//! directories, computes and applies the layers between two trees, and folds
//! a resource's whole history into its current state.
//!
//! ## Overview
//!
//! - **Content store**: immutable files keyed by their SHA-256 digest, sharded
//!   two levels deep, split into bounded chunks for transfer and joined back
//!   on read
//! - **Tree digest**: one order-independent digest per directory tree
//! - **Tree diff / merge**: a layer holds added and modified files, sentinel
//!   markers for removals and a manifest with a back-link to the previous
//!   transaction
//! - **Layer folder**: merges a snapshot and its layers in order, checking
//!   back-links and tree digests
//! - **Write / read pipelines**: diff, compress, encrypt, split on the way in;
//!   join, verify, decrypt, decompress on the way out
//! - **Cache invalidation**: built trees carry the signature they were built
//!   from; a rate limiter keeps repeated freshness checks off the ledger
//! - **Resource status**: one visible state combining all of the above
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use tessera::{Tessera, TesseraBuilder};
//! use tessera::types::{Resource, Service};
//! use tessera::writer::WriteRequest;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let tessera = TesseraBuilder::new().build("./store")?;
//!
//! // Publish the initial snapshot, then a layer with the latest edits
//! tessera.publish(&WriteRequest::put("./site", "alice", Service::Website))?;
//! tessera.publish(&WriteRequest::patch("./site", "alice", Service::Website))?;
//!
//! // Fold the history into the current state
//! let resource = Resource::by_name("alice", Service::Website, None);
//! let built = tessera.read(&resource, false)?;
//! println!("built into {:?}", built);
//!
//! println!("status: {}", tessera.status(&resource)?.kind);
//! # Ok(())
//! # }
//! ```
//!
//! ## Working with layers directly
//!
//! ```rust,no_run
//! use tessera::diff::TreeDiffer;
//! use tessera::merge::TreeMerger;
//! use tessera::digest::TreeDigest;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let differ = TreeDiffer::new("./temp", 100 * 1024);
//! let layer = differ.diff("./v1".as_ref(), "./v2".as_ref(), None)?;
//! println!("{} added, {} removed", layer.manifest().added.len(), layer.manifest().removed.len());
//!
//! let merged = TreeMerger::new("./temp").merge("./v1".as_ref(), layer.path())?;
//! assert_eq!(TreeDigest::compute(&merged)?, TreeDigest::compute("./v2")?);
//! # Ok(())
//! # }
//! ```
//!
//! ## Errors
//!
//! Every operation returns [`Result<T>`](error::Result). [`TesseraError::kind`]
//! sorts failures into validation, integrity, missing data, state and I/O.
//! Missing data is recoverable: [`TesseraError::missing_hashes`] lists the
//! digests to fetch before retrying. Integrity failures delete the offending
//! artifact and are never retried silently.
//!
//! ## Temporary files
//!
//! Every multi-step operation works in its own directory under the temp root
//! (`reader/`, `writer/`, `diff/`, `merge/`, `join/`) and removes partial
//! output before an error propagates. Nothing outside the data and temp roots
//! is ever deleted.
//!
//! ## Module Organization
//!
//! - [`storage`]: content store, split and join
//! - [`digest`]: tree digests
//! - [`diff`], [`merge`], [`fold`]: layers
//! - [`writer`], [`reader`], [`builder`]: pipelines
//! - [`cache`], [`queue`], [`status`]: invalidation and status
//! - [`ledger`]: transaction lookup
//! - [`compression`], [`crypto`], [`patch`]: payload transforms
//! - [`types`], [`metadata`], [`error`]: shared types and sidecars

// Public API modules
pub mod builder;
pub mod cache;
pub mod compression;
pub mod context;
pub mod crypto;
pub mod diff;
pub mod digest;
pub mod error;
pub mod fold;
pub mod ledger;
pub mod merge;
pub mod metadata;
pub mod patch;
pub mod queue;
pub mod reader;
pub mod status;
pub mod storage;
pub mod tessera;
pub mod types;
pub mod writer;

// Internal modules (not part of public API)
mod collections;
mod utils;

// Re-export main types for convenience
pub use error::{ErrorKind, Result, TesseraError};
pub use status::{ResourceStatus, StatusKind};
pub use storage::{ContentFile, ContentStore};
pub use tessera::{Tessera, TesseraBuilder};
pub use types::{Compression, Method, Resource, ResourceIdType, Service, Signature, TesseraConfig, TransactionRecord};
pub use writer::{WriteOutcome, WriteRequest};

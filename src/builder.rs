//! Resource builder
//!
//! Reconstructs the current tree of a named resource from its ledger history:
//!
//! 1. Find the latest PUT. Without one there is nothing to build on.
//! 2. Load every transaction since that PUT, oldest first. The first must be
//!    the PUT itself and every later one a PATCH.
//! 3. Read each transaction's payload into its own directory, overwriting any
//!    earlier copy. Missing data for any transaction is collected and
//!    reported together so every absent chunk can be requested at once.
//! 4. Fold the directories in order, checking each layer's back-link.
//! 5. Record the newest signature in the result's `cache` sidecar.
//!
//! The per-transaction directories are removed once folded.

use crate::collections::{HashSet, HashSetExt};
use crate::context::Context;
use crate::error::{Result, TesseraError};
use crate::fold::LayerInput;
use crate::metadata::{CacheRecord, Sidecar};
use crate::reader::DataReader;
use crate::types::{Method, Resource, ResourceIdType, Service, TransactionRecord};
use crate::utils::CleanupGuard;
use std::path::PathBuf;
use tracing::{debug, info};

/// Builds the latest state of one named resource
#[derive(Debug, Clone)]
pub struct ResourceBuilder {
    ctx: Context,
    name: String,
    service: Service,
    identifier: Option<String>,
}

impl ResourceBuilder {
    /// Builder for `name`/`service`/`identifier`; the name is lower-cased
    pub fn new(ctx: Context, name: &str, service: Service, identifier: Option<&str>) -> Self {
        let resource = Resource::by_name(name, service, identifier);
        Self {
            ctx,
            name: resource.resource_id,
            service,
            identifier: resource.identifier,
        }
    }

    /// Transactions making up the current state, validated for order
    pub fn history(&self) -> Result<Vec<TransactionRecord>> {
        let ledger = self.ctx.ledger();
        let identifier = self.identifier.as_deref();
        let put = ledger
            .latest_transaction(&self.name, self.service, Some(Method::Put), identifier)?
            .ok_or_else(|| {
                TesseraError::state(format!(
                    "no PUT transaction for {} {} {}",
                    self.service,
                    self.name,
                    identifier.unwrap_or("")
                ))
            })?;

        let transactions = ledger.transactions_since(&self.name, self.service, identifier, put.timestamp)?;
        let (first, rest) = transactions.split_first().ok_or_else(|| {
            TesseraError::state(format!("no transactions for {} since {}", self.name, put.timestamp))
        })?;
        if first.signature != put.signature {
            return Err(TesseraError::state("first transaction did not match latest PUT transaction"));
        }
        if let Some(tx) = rest.iter().find(|tx| tx.method != Method::Patch) {
            return Err(TesseraError::state(format!(
                "expected PATCH but received {} ({})",
                tx.method, tx.signature
            )));
        }
        Ok(transactions)
    }

    /// Build the latest state, returning a directory owned by the caller
    pub fn build(&self) -> Result<PathBuf> {
        let transactions = self.history()?;
        let temp_root = self.ctx.config().temp_path.clone();
        let mut guard = CleanupGuard::new(&[temp_root.as_path()]);

        let mut layers = Vec::with_capacity(transactions.len());
        let mut missing = Vec::new();
        let mut seen = HashSet::new();
        for tx in &transactions {
            let reader = DataReader::for_transaction(self.ctx.clone(), tx.clone());
            guard.push(self.ctx.reader_work_dir(reader.resource()));
            match reader.read(true) {
                Ok(path) => layers.push(LayerInput::signed(path, tx.signature.clone())),
                Err(e) if e.is_missing_data() => {
                    debug!("Missing data for layer {}: {}", tx.signature, e);
                    missing.extend(
                        e.missing_hashes()
                            .iter()
                            .filter(|digest| seen.insert(digest.to_string()))
                            .cloned(),
                    );
                }
                Err(e) => return Err(e),
            }
        }
        if !missing.is_empty() {
            return Err(TesseraError::MissingData(missing));
        }

        let final_path = self.ctx.folder().fold_layers(&layers)?;
        if let Some(latest) = transactions.last() {
            CacheRecord::now(latest.signature.clone()).write_to(&final_path)?;
        }

        // A single layer is returned in place; keep its reader directory
        if let Some(work_dir) = final_path.parent() {
            guard.release(work_dir);
        }
        drop(guard);

        info!(
            "Built {} {} from {} layer(s)",
            self.service,
            self.name,
            transactions.len()
        );
        Ok(final_path)
    }

    /// Resource this builder produces
    pub fn resource(&self) -> Resource {
        Resource::new(&self.name, ResourceIdType::Name, self.service, self.identifier.as_deref())
    }
}

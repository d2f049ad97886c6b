//! Transaction lookups
//!
//! The engine never validates or orders transactions itself; it asks a
//! [`Ledger`] for them. A node backs the trait with its chain database.
//! [`MemoryLedger`] keeps everything in memory and can persist itself with
//! bincode, which is enough for tests and the command-line tool.

use crate::error::Result;
use crate::types::{normalize_identifier, Method, Service, Signature, TransactionRecord};
use crate::utils;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use tracing::debug;

/// Size and timestamps recorded for a published resource
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceCacheRow {
    /// Content kind
    pub service: Service,
    /// Registered name, lower-cased
    pub name: String,
    /// Sub-identifier, absent for the default resource
    pub identifier: Option<String>,
    /// Payload size of the latest transaction in bytes
    pub size: u64,
    /// Timestamp of the first PUT, milliseconds
    pub created: i64,
    /// Timestamp of the latest PATCH, milliseconds
    pub updated: Option<i64>,
}

/// Read access to published transactions
pub trait Ledger: Send + Sync {
    /// Newest transaction for the resource, optionally restricted to a method
    fn latest_transaction(
        &self,
        name: &str,
        service: Service,
        method: Option<Method>,
        identifier: Option<&str>,
    ) -> Result<Option<TransactionRecord>>;

    /// Transactions for the resource with timestamp ≥ `since`, oldest first
    fn transactions_since(
        &self,
        name: &str,
        service: Service,
        identifier: Option<&str>,
        since: i64,
    ) -> Result<Vec<TransactionRecord>>;

    /// Transaction with the given signature
    fn transaction_by_signature(&self, signature: &Signature) -> Result<Option<TransactionRecord>>;

    /// Stored cache row for the resource
    fn resource_cache_row(
        &self,
        service: Service,
        name: &str,
        identifier: Option<&str>,
    ) -> Result<Option<ResourceCacheRow>>;

    /// Insert or replace the cache row for the row's resource
    fn save_resource_cache_row(&self, row: ResourceCacheRow) -> Result<()>;
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct LedgerState {
    transactions: Vec<TransactionRecord>,
    cache_rows: Vec<ResourceCacheRow>,
}

/// In-memory [`Ledger`]
#[derive(Debug, Default)]
pub struct MemoryLedger {
    state: RwLock<LedgerState>,
}

fn matches(tx: &TransactionRecord, name: &str, service: Service, identifier: &Option<String>) -> bool {
    tx.service == service
        && tx.name.as_deref().is_some_and(|n| n.eq_ignore_ascii_case(name))
        && &normalize_identifier(tx.identifier.as_deref()) == identifier
}

impl MemoryLedger {
    /// Create an empty ledger
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a transaction
    pub fn insert(&self, tx: TransactionRecord) {
        self.state.write().transactions.push(tx);
    }

    /// Number of recorded transactions
    pub fn len(&self) -> usize {
        self.state.read().transactions.len()
    }

    /// Whether no transactions are recorded
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// All transactions in insertion order
    pub fn transactions(&self) -> Vec<TransactionRecord> {
        self.state.read().transactions.clone()
    }

    /// Load a ledger saved with [`MemoryLedger::save`]; a missing file is empty
    pub fn load(path: &Path) -> Result<Self> {
        let bytes = match fs::read(path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Self::new()),
            Err(e) => return Err(e.into()),
        };
        let (state, _): (LedgerState, _) =
            bincode::serde::decode_from_slice(&bytes, bincode::config::standard())?;
        debug!("Loaded {} transaction(s) from {:?}", state.transactions.len(), path);
        Ok(Self {
            state: RwLock::new(state),
        })
    }

    /// Persist the ledger
    pub fn save(&self, path: &Path) -> Result<()> {
        let bytes = bincode::serde::encode_to_vec(&*self.state.read(), bincode::config::standard())?;
        utils::atomic_write(path, &bytes)
    }
}

impl Ledger for MemoryLedger {
    fn latest_transaction(
        &self,
        name: &str,
        service: Service,
        method: Option<Method>,
        identifier: Option<&str>,
    ) -> Result<Option<TransactionRecord>> {
        let identifier = normalize_identifier(identifier);
        Ok(self
            .state
            .read()
            .transactions
            .iter()
            .filter(|tx| matches(tx, name, service, &identifier))
            .filter(|tx| method.map_or(true, |m| tx.method == m))
            .max_by_key(|tx| tx.timestamp)
            .cloned())
    }

    fn transactions_since(
        &self,
        name: &str,
        service: Service,
        identifier: Option<&str>,
        since: i64,
    ) -> Result<Vec<TransactionRecord>> {
        let identifier = normalize_identifier(identifier);
        let mut found: Vec<TransactionRecord> = self
            .state
            .read()
            .transactions
            .iter()
            .filter(|tx| matches(tx, name, service, &identifier) && tx.timestamp >= since)
            .cloned()
            .collect();
        found.sort_by_key(|tx| tx.timestamp);
        Ok(found)
    }

    fn transaction_by_signature(&self, signature: &Signature) -> Result<Option<TransactionRecord>> {
        Ok(self
            .state
            .read()
            .transactions
            .iter()
            .find(|tx| &tx.signature == signature)
            .cloned())
    }

    fn resource_cache_row(
        &self,
        service: Service,
        name: &str,
        identifier: Option<&str>,
    ) -> Result<Option<ResourceCacheRow>> {
        let identifier = normalize_identifier(identifier);
        Ok(self
            .state
            .read()
            .cache_rows
            .iter()
            .find(|row| row.service == service && row.name.eq_ignore_ascii_case(name) && row.identifier == identifier)
            .cloned())
    }

    fn save_resource_cache_row(&self, row: ResourceCacheRow) -> Result<()> {
        let mut state = self.state.write();
        state.cache_rows.retain(|r| {
            !(r.service == row.service && r.name == row.name && r.identifier == row.identifier)
        });
        state.cache_rows.push(row);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Compression;
    use tempfile::TempDir;

    fn tx(sig: u8, timestamp: i64, method: Method, identifier: Option<&str>) -> TransactionRecord {
        TransactionRecord {
            signature: Signature::new(vec![sig; 4]),
            creator_public_key: vec![0; 32],
            timestamp,
            name: Some("Alice".into()),
            service: Service::Website,
            identifier: identifier.map(String::from),
            method,
            compression: Compression::Zip,
            data_hash: "00".repeat(32),
            chunk_hashes: Vec::new(),
            size: 10,
            secret: None,
            metadata_hash: None,
        }
    }

    #[test]
    fn test_latest_and_since() {
        let ledger = MemoryLedger::new();
        ledger.insert(tx(3, 300, Method::Patch, None));
        ledger.insert(tx(1, 100, Method::Put, Some("default")));
        ledger.insert(tx(2, 200, Method::Patch, None));
        ledger.insert(tx(9, 900, Method::Put, Some("blog")));

        let latest = ledger.latest_transaction("alice", Service::Website, None, None).unwrap().unwrap();
        assert_eq!(latest.timestamp, 300);
        let put = ledger
            .latest_transaction("ALICE", Service::Website, Some(Method::Put), Some(""))
            .unwrap()
            .unwrap();
        assert_eq!(put.timestamp, 100);

        let history = ledger.transactions_since("alice", Service::Website, None, 100).unwrap();
        let stamps: Vec<i64> = history.iter().map(|t| t.timestamp).collect();
        assert_eq!(stamps, vec![100, 200, 300]);

        assert!(ledger.latest_transaction("alice", Service::App, None, None).unwrap().is_none());
        assert_eq!(
            ledger.transaction_by_signature(&Signature::new(vec![9; 4])).unwrap().unwrap().timestamp,
            900
        );
    }

    #[test]
    fn test_cache_rows_replace() {
        let ledger = MemoryLedger::new();
        let mut row = ResourceCacheRow {
            service: Service::Website,
            name: "alice".into(),
            identifier: None,
            size: 1,
            created: 1,
            updated: None,
        };
        ledger.save_resource_cache_row(row.clone()).unwrap();
        row.size = 2;
        ledger.save_resource_cache_row(row.clone()).unwrap();

        let stored = ledger.resource_cache_row(Service::Website, "alice", Some("default")).unwrap();
        assert_eq!(stored, Some(row));
    }

    #[test]
    fn test_save_and_load() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("ledger.bin");
        assert!(MemoryLedger::load(&path).unwrap().is_empty());

        let ledger = MemoryLedger::new();
        ledger.insert(tx(1, 100, Method::Put, None));
        ledger.save(&path).unwrap();

        let loaded = MemoryLedger::load(&path).unwrap();
        assert_eq!(loaded.transactions(), ledger.transactions());
    }
}

//! Integration tests for Tessera
//!
//! Publishes real trees through the facade and checks what comes back out:
//! folded history, cache behaviour, missing data, integrity failures and
//! the resource status table.

use ::tessera::digest::TreeDigest;
use ::tessera::ledger::{Ledger, MemoryLedger};
use ::tessera::metadata::{LayerManifest, Sidecar, TransactionMetadata};
use ::tessera::reader::DataReader;
use ::tessera::status::MemoryNameList;
use ::tessera::*;
use rand::rngs::StdRng;
use rand::{RngCore, SeedableRng};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tempfile::TempDir;

/// Test harness owning a store, a source tree and the injected collaborators
pub struct TesseraTestHarness {
    pub temp_dir: TempDir,
    pub source: PathBuf,
    pub tessera: Tessera,
    pub ledger: Arc<MemoryLedger>,
    pub blocklist: Arc<MemoryNameList>,
}

impl TesseraTestHarness {
    /// Harness with default settings
    pub fn new() -> Self {
        Self::with_builder(|builder| builder)
    }

    /// Harness with extra builder settings
    pub fn with_builder(configure: impl FnOnce(TesseraBuilder) -> TesseraBuilder) -> Self {
        let temp_dir = TempDir::new().unwrap();
        let source = temp_dir.path().join("source");
        fs::create_dir_all(&source).unwrap();

        let ledger = Arc::new(MemoryLedger::new());
        let blocklist = Arc::new(MemoryNameList::new());
        let builder = TesseraBuilder::new()
            .memory_ledger(ledger.clone())
            .blocklist(blocklist.clone())
            .parallel_workers(2);
        let tessera = configure(builder).build(temp_dir.path().join("store")).unwrap();

        Self {
            temp_dir,
            source,
            tessera,
            ledger,
            blocklist,
        }
    }

    /// Write a file below the source tree
    pub fn write(&self, rel: &str, content: impl AsRef<[u8]>) {
        let path = self.source.join(rel);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, content).unwrap();
    }

    /// Remove a file or directory below the source tree
    pub fn remove(&self, rel: &str) {
        let path = self.source.join(rel);
        if path.is_dir() {
            fs::remove_dir_all(path).unwrap();
        } else {
            fs::remove_file(path).unwrap();
        }
    }

    pub fn put(&self, name: &str) -> TransactionRecord {
        self.tessera
            .publish(&WriteRequest::put(&self.source, name, Service::Website))
            .unwrap()
    }

    pub fn patch(&self, name: &str) -> TransactionRecord {
        self.tessera
            .publish(&WriteRequest::patch(&self.source, name, Service::Website))
            .unwrap()
    }

    pub fn resource(&self, name: &str) -> Resource {
        Resource::by_name(name, Service::Website, None)
    }

    pub fn temp_root(&self) -> &Path {
        &self.tessera.config().temp_path
    }
}

/// Fill a file with reproducible incompressible bytes
fn random_bytes(seed: u64, len: usize) -> Vec<u8> {
    let mut rng = StdRng::seed_from_u64(seed);
    let mut bytes = vec![0u8; len];
    rng.fill_bytes(&mut bytes);
    bytes
}

fn working_trees(temp_root: &Path) -> Vec<PathBuf> {
    ["writer", "diff", "merge", "join"]
        .iter()
        .map(|dir| temp_root.join(dir))
        .filter(|dir| dir.is_dir())
        .flat_map(|dir| fs::read_dir(dir).unwrap().map(|e| e.unwrap().path()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tracing_test::traced_test;

    #[test]
    fn test_put_then_patch_builds_latest_state() {
        let harness = TesseraTestHarness::new();
        harness.write("index.html", "<h1>v1</h1>");
        harness.write("about/team.html", "team");
        let put = harness.put("alice");

        harness.write("index.html", "<h1>v2</h1>");
        harness.write("style.css", "body { color: red }");
        let patch = harness.patch("alice");
        assert_eq!(patch.method, Method::Patch);

        let built = harness.tessera.read(&harness.resource("alice"), false).unwrap();
        assert_eq!(fs::read_to_string(built.join("index.html")).unwrap(), "<h1>v2</h1>");
        assert_eq!(fs::read_to_string(built.join("style.css")).unwrap(), "body { color: red }");
        assert_eq!(
            TreeDigest::compute(&built).unwrap(),
            TreeDigest::compute(&harness.source).unwrap()
        );

        let manifest = LayerManifest::read_from(&built).unwrap().unwrap();
        assert_eq!(manifest.previous_signature, Some(put.signature.clone()));
        assert_eq!(manifest.added, vec!["style.css".to_string()]);
        assert_eq!(manifest.modified_paths().collect::<Vec<_>>(), vec!["index.html"]);
        assert!(manifest.removed.is_empty());

        assert!(working_trees(harness.temp_root()).is_empty());
    }

    #[test]
    fn test_patch_removals_fold_through_history() {
        let harness = TesseraTestHarness::new();
        harness.write("keep.txt", "keep");
        harness.write("old/a.txt", "a");
        harness.write("old/b.txt", "b");
        harness.put("dave");

        harness.remove("old");
        harness.write("new.txt", "new");
        harness.patch("dave");

        harness.write("keep.txt", "kept and edited");
        harness.patch("dave");

        let built = harness.tessera.read(&harness.resource("dave"), false).unwrap();
        assert!(!built.join("old").exists());
        assert_eq!(fs::read_to_string(built.join("new.txt")).unwrap(), "new");
        assert_eq!(fs::read_to_string(built.join("keep.txt")).unwrap(), "kept and edited");
        assert_eq!(
            TreeDigest::compute(&built).unwrap(),
            TreeDigest::compute(&harness.source).unwrap()
        );
    }

    #[test]
    fn test_patch_without_put_is_state_error() {
        let harness = TesseraTestHarness::new();
        harness.write("index.html", "hi");
        let err = harness
            .tessera
            .publish(&WriteRequest::patch(&harness.source, "erin", Service::Website))
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::State);
        assert!(harness.ledger.is_empty());
        assert!(working_trees(harness.temp_root()).is_empty());
    }

    #[test]
    fn test_broken_back_link_is_state_error() {
        let harness = TesseraTestHarness::new();
        harness.write("index.html", "v1");
        let put = harness.put("frank");
        harness.write("index.html", "v2");
        let patch = harness.patch("frank");

        // Same payloads, but the PUT now carries a different signature
        let forged = MemoryLedger::new();
        let mut other_put = put.clone();
        other_put.signature = Signature::new(vec![9u8; 32]);
        forged.insert(other_put);
        forged.insert(patch);

        let store = harness.temp_dir.path().join("store");
        let tessera = TesseraBuilder::new()
            .ledger(Arc::new(forged))
            .build(&store)
            .unwrap();
        let err = tessera.read(&harness.resource("frank"), true).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::State);
        assert!(!tessera.context().reader_output(&harness.resource("frank")).exists());
    }

    #[test]
    fn test_fresh_build_is_reused() {
        let harness = TesseraTestHarness::new();
        harness.write("index.html", "cached");
        harness.put("grace");

        let resource = harness.resource("grace");
        let first = harness.tessera.read(&resource, false).unwrap();
        fs::write(first.join("probe"), "untouched").unwrap();

        let second = harness.tessera.read(&resource, false).unwrap();
        assert_eq!(first, second);
        assert!(second.join("probe").exists());
        assert!(!harness.tessera.is_stale(&resource).unwrap());

        let rebuilt = harness.tessera.read(&resource, true).unwrap();
        assert!(!rebuilt.join("probe").exists());
    }

    #[test]
    fn test_new_transaction_invalidates_build() {
        let harness = TesseraTestHarness::new();
        harness.write("index.html", "one");
        harness.put("heidi");
        let resource = harness.resource("heidi");
        harness.tessera.read(&resource, false).unwrap();
        assert!(!harness.tessera.is_stale(&resource).unwrap());

        harness.write("index.html", "two");
        harness.patch("heidi");
        assert!(harness.tessera.is_stale(&resource).unwrap());

        let built = harness.tessera.read(&resource, false).unwrap();
        assert_eq!(fs::read_to_string(built.join("index.html")).unwrap(), "two");
    }

    #[test]
    fn test_missing_chunks_are_reported() {
        let harness = TesseraTestHarness::with_builder(|b| b.chunk_size(4 * 1024));
        harness.write("blob.bin", random_bytes(7, 40 * 1024));
        let tx = harness.put("ivan");
        assert!(tx.chunk_hashes.len() > 1);
        assert!(tx.metadata_hash.is_some());

        let store = harness.tessera.context().store();
        let file = store.reference_with_chunks(&tx.data_hash, &tx.chunk_hashes).unwrap();
        file.delete().unwrap();
        file.chunks()[1].delete().unwrap();

        let resource = harness.resource("ivan");
        let status = harness.tessera.status(&resource).unwrap();
        assert_eq!(status.kind, StatusKind::MissingData);
        assert_eq!(status.total_chunk_count, Some(tx.chunk_hashes.len()));
        assert_eq!(status.local_chunk_count, Some(tx.chunk_hashes.len() - 1));

        let err = harness.tessera.read(&resource, false).unwrap_err();
        assert!(err.is_missing_data());
        assert!(!err.is_corruption());
        assert_eq!(err.missing_hashes(), &[tx.chunk_hashes[1].clone()]);
        assert!(!harness.tessera.context().reader_output(&resource).exists());
    }

    #[test]
    fn test_corrupt_chunk_becomes_missing_data() {
        let harness = TesseraTestHarness::with_builder(|b| b.chunk_size(4 * 1024));
        harness.write("blob.bin", random_bytes(13, 20 * 1024));
        let tx = harness.put("kim");

        let store = harness.tessera.context().store();
        let file = store.reference_with_chunks(&tx.data_hash, &tx.chunk_hashes).unwrap();
        file.delete().unwrap();
        fs::write(file.chunks()[1].path(), b"garbage").unwrap();

        let resource = harness.resource("kim");
        let err = harness.tessera.read(&resource, false).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::MissingData);
        assert_eq!(err.missing_hashes(), &[tx.chunk_hashes[1].clone()]);
        assert!(!file.chunks()[1].exists());

        let err = harness.tessera.read(&resource, false).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::MissingData);

        let status = harness.tessera.status(&resource).unwrap();
        assert_eq!(status.kind, StatusKind::MissingData);
        assert_eq!(status.local_chunk_count, Some(tx.chunk_hashes.len() - 1));
    }

    #[test]
    fn test_joined_payload_is_verified() {
        let harness = TesseraTestHarness::with_builder(|b| b.chunk_size(4 * 1024));
        harness.write("blob.bin", random_bytes(11, 20 * 1024));
        let tx = harness.put("judy");

        let store = harness.tessera.context().store();
        store.reference(&tx.data_hash).unwrap().delete().unwrap();

        let built = harness.tessera.read(&harness.resource("judy"), false).unwrap();
        assert_eq!(fs::read(built.join("blob.bin")).unwrap(), random_bytes(11, 20 * 1024));
        assert!(store.reference(&tx.data_hash).unwrap().exists());
    }

    #[test]
    fn test_corrupt_payload_is_deleted() {
        let harness = TesseraTestHarness::new();
        harness.write("index.html", "precious");
        let tx = harness.put("mallory");

        let store = harness.tessera.context().store();
        let file = store.reference(&tx.data_hash).unwrap();
        fs::write(file.path(), b"tampered").unwrap();

        let err = harness.tessera.read_transaction(&tx, true).unwrap_err();
        assert!(err.is_corruption());
        assert!(!file.exists());

        let err = harness.tessera.read_transaction(&tx, true).unwrap_err();
        assert!(err.is_missing_data());
        assert_eq!(err.missing_hashes(), &[tx.data_hash.clone()]);
    }

    #[test]
    fn test_secret_is_required_to_read() {
        let harness = TesseraTestHarness::new();
        harness.write("index.html", "secret page");
        let tx = harness.put("oscar");
        assert_eq!(tx.secret.as_ref().map(Vec::len), Some(32));

        let wrong = DataReader::for_transaction(harness.tessera.context().clone(), tx.clone())
            .with_secret(vec![0u8; 32]);
        let err = wrong.read(true).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Integrity);
        assert!(!wrong.output_path().exists());

        let built = harness.tessera.read_transaction(&tx, true).unwrap();
        assert_eq!(fs::read_to_string(built.join("index.html")).unwrap(), "secret page");
    }

    #[test]
    fn test_metadata_sidecar_lists_files() {
        let harness = TesseraTestHarness::new();
        harness.write("index.html", "hello");
        harness.write("img/logo.svg", "<svg/>");
        let request = WriteRequest::put(&harness.source, "peggy", Service::Website).with_metadata(
            TransactionMetadata::default()
                .with_title("Peggy's site")
                .with_tags(["web", "a-tag-that-is-far-too-long-to-keep"]),
        );
        let tx = harness.tessera.publish(&request).unwrap();

        let store = harness.tessera.context().store();
        let metadata_file = store.reference(tx.metadata_hash.as_deref().unwrap()).unwrap();
        let metadata = TransactionMetadata::from_json(&fs::read(metadata_file.path()).unwrap()).unwrap();
        assert_eq!(metadata.title.as_deref(), Some("Peggy's site"));
        assert_eq!(metadata.tags, vec!["web".to_string()]);
        assert_eq!(metadata.files, vec!["img/logo.svg".to_string(), "index.html".to_string()]);
        assert!(metadata.chunks.is_empty());
    }

    #[test]
    fn test_status_progression() {
        let harness = TesseraTestHarness::new();
        let resource = harness.resource("trent");

        let status = harness.tessera.status(&resource).unwrap();
        assert_eq!(status.kind, StatusKind::NotPublished);

        harness.write("index.html", "status");
        let tx = harness.put("trent");
        let status = harness.tessera.status(&resource).unwrap();
        assert_eq!(status.kind, StatusKind::Downloaded);
        assert_eq!(status.local_chunk_count, Some(1));
        assert_eq!(status.total_chunk_count, Some(1));

        harness.tessera.read(&resource, false).unwrap();
        assert_eq!(harness.tessera.status(&resource).unwrap().kind, StatusKind::Ready);

        harness.tessera.delete_cache(&resource).unwrap();
        harness
            .tessera
            .context()
            .store()
            .reference(&tx.data_hash)
            .unwrap()
            .delete()
            .unwrap();
        let status = harness.tessera.status(&resource).unwrap();
        assert_eq!(status.kind, StatusKind::Published);
        assert_eq!(status.kind.title(), "Published");
    }

    #[test]
    fn test_status_precedence() {
        let harness = TesseraTestHarness::new();
        harness.write("index.html", "queue");
        harness.put("victor");
        let resource = harness.resource("victor");

        harness.blocklist.add("Victor");
        assert_eq!(harness.tessera.status(&resource).unwrap().kind, StatusKind::Blacklisted);

        assert!(harness.tessera.request_build(&resource, 1).unwrap());
        assert!(!harness.tessera.request_build(&resource, 9).unwrap());
        assert_eq!(harness.tessera.status(&resource).unwrap().kind, StatusKind::Building);

        let unsupported = Resource::new("abcdef", ResourceIdType::Signature, Service::Website, None);
        assert_eq!(harness.tessera.status(&unsupported).unwrap().kind, StatusKind::Unsupported);

        let (_, outcome) = harness.tessera.build_next().unwrap().unwrap();
        outcome.unwrap();
        assert_eq!(harness.tessera.status(&resource).unwrap().kind, StatusKind::Ready);
    }

    #[test]
    fn test_failed_build_until_new_transaction() {
        let harness = TesseraTestHarness::new();
        let resource = harness.resource("walter");
        harness.tessera.request_build(&resource, 1).unwrap();
        let (_, outcome) = harness.tessera.build_next().unwrap().unwrap();
        assert_eq!(outcome.unwrap_err().kind(), ErrorKind::State);
        assert_eq!(harness.tessera.status(&resource).unwrap().kind, StatusKind::BuildFailed);
        assert!(!harness.tessera.request_build(&resource, 1).unwrap());

        harness.write("index.html", "now published");
        harness.put("walter");
        assert_eq!(harness.tessera.status(&resource).unwrap().kind, StatusKind::Downloaded);
    }

    #[test]
    fn test_delete_removes_payloads() {
        let harness = TesseraTestHarness::new();
        harness.write("index.html", "v1");
        let put = harness.put("zoe");
        harness.write("index.html", "v2");
        let patch = harness.patch("zoe");
        let resource = harness.resource("zoe");
        harness.tessera.read(&resource, false).unwrap();

        assert_eq!(harness.tessera.delete(&resource).unwrap(), 2);
        let store = harness.tessera.context().store();
        assert!(!store.reference(&put.data_hash).unwrap().exists());
        assert!(!store.reference(&patch.data_hash).unwrap().exists());
        assert!(!harness.tessera.context().reader_output(&resource).exists());
        assert_eq!(harness.tessera.status(&resource).unwrap().kind, StatusKind::Published);
    }

    #[test]
    fn test_ledger_persists_across_instances() {
        let harness = TesseraTestHarness::new();
        harness.write("index.html", "persisted");
        let tx = harness.put("yuri");

        let ledger_file = harness.temp_dir.path().join("ledger.bin");
        harness.ledger.save(&ledger_file).unwrap();
        let loaded = Arc::new(MemoryLedger::load(&ledger_file).unwrap());
        assert_eq!(loaded.transaction_by_signature(&tx.signature).unwrap(), Some(tx));

        let tessera = TesseraBuilder::new()
            .memory_ledger(loaded)
            .build(harness.temp_dir.path().join("store"))
            .unwrap();
        let built = tessera.read(&harness.resource("yuri"), false).unwrap();
        assert_eq!(fs::read_to_string(built.join("index.html")).unwrap(), "persisted");
    }

    #[test]
    #[traced_test]
    fn test_publish_and_build_are_logged() {
        let harness = TesseraTestHarness::new();
        harness.write("index.html", "logged");
        harness.put("uma");
        harness.tessera.read(&harness.resource("uma"), false).unwrap();

        assert!(logs_contain("Published PUT uma"));
        assert!(logs_contain("Built WEBSITE uma from 1 layer(s)"));
    }
}

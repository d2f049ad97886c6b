//! Main test module for Tessera
//!
//! This module includes all test suites:
//! - Integration tests for publish, build and status scenarios
//! - Property-based tests for store, diff and fold invariants

pub mod integration;
pub mod property;

#[cfg(test)]
mod edge_cases {
    use ::tessera::*;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn test_single_file_put_without_compression() {
        let temp = TempDir::new().unwrap();
        let file = temp.path().join("notes.txt");
        fs::write(&file, "plain text payload").unwrap();

        let tessera = Tessera::new(temp.path().join("store")).unwrap();
        let request = WriteRequest::put(&file, "bob", Service::Document).with_compression(Compression::None);
        let tx = tessera.publish(&request).unwrap();
        assert!(tx.chunk_hashes.is_empty());
        assert!(tx.metadata_hash.is_none());

        let built = tessera
            .read(&Resource::by_name("bob", Service::Document, None), false)
            .unwrap();
        assert_eq!(fs::read_to_string(built.join("data")).unwrap(), "plain text payload");
    }

    #[test]
    fn test_directory_without_compression_rejected() {
        let temp = TempDir::new().unwrap();
        let source = temp.path().join("site");
        fs::create_dir_all(&source).unwrap();
        fs::write(source.join("index.html"), "hi").unwrap();

        let tessera = Tessera::new(temp.path().join("store")).unwrap();
        let err = tessera
            .write(&WriteRequest::put(&source, "bob", Service::Website).with_compression(Compression::None))
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation);
    }

    #[test]
    fn test_unchanged_patch_rejected() {
        let temp = TempDir::new().unwrap();
        let source = temp.path().join("site");
        fs::create_dir_all(&source).unwrap();
        fs::write(source.join("index.html"), "same").unwrap();

        let tessera = Tessera::new(temp.path().join("store")).unwrap();
        tessera.publish(&WriteRequest::put(&source, "bob", Service::Website)).unwrap();
        let err = tessera
            .publish(&WriteRequest::patch(&source, "bob", Service::Website))
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation);
        assert_eq!(tessera.ledger().transactions_since("bob", Service::Website, None, i64::MIN).unwrap().len(), 1);
    }

    #[test]
    fn test_identifiers_are_separate_resources() {
        let temp = TempDir::new().unwrap();
        let source = temp.path().join("site");
        fs::create_dir_all(&source).unwrap();

        let tessera = Tessera::new(temp.path().join("store")).unwrap();
        fs::write(source.join("page"), "default").unwrap();
        tessera.publish(&WriteRequest::put(&source, "bob", Service::Website)).unwrap();
        fs::write(source.join("page"), "blog").unwrap();
        tessera
            .publish(&WriteRequest::put(&source, "bob", Service::Website).with_identifier(Some("blog")))
            .unwrap();

        let default = tessera
            .read(&Resource::by_name("bob", Service::Website, Some("default")), false)
            .unwrap();
        let blog = tessera
            .read(&Resource::by_name("BOB", Service::Website, Some("blog")), false)
            .unwrap();
        assert_eq!(fs::read_to_string(default.join("page")).unwrap(), "default");
        assert_eq!(fs::read_to_string(blog.join("page")).unwrap(), "blog");
        assert_ne!(default, blog);
    }

    #[test]
    fn test_lz4_payload_roundtrip() {
        let temp = TempDir::new().unwrap();
        let source = temp.path().join("site");
        fs::create_dir_all(source.join("assets")).unwrap();
        fs::write(source.join("index.html"), "<h1>lz4</h1>").unwrap();
        fs::write(source.join("assets/app.js"), "console.log(1)").unwrap();

        let tessera = Tessera::new(temp.path().join("store")).unwrap();
        tessera
            .publish(&WriteRequest::put(&source, "carol", Service::App).with_compression(Compression::Lz4))
            .unwrap();
        let built = tessera
            .read(&Resource::by_name("carol", Service::App, None), false)
            .unwrap();
        assert_eq!(
            digest::TreeDigest::compute(&built).unwrap(),
            digest::TreeDigest::compute(&source).unwrap()
        );
    }
}

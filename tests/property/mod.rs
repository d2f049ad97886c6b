//! Property-based testing for Tessera
//!
//! Uses proptest to check the store and layer invariants across randomly
//! generated payloads and trees.

use ::tessera::diff::TreeDiffer;
use ::tessera::digest::TreeDigest;
use ::tessera::fold::LayerFolder;
use ::tessera::merge::TreeMerger;
use ::tessera::ContentStore;
use proptest::prelude::*;
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use tempfile::TempDir;

/// Relative path -> content
type Tree = BTreeMap<String, Vec<u8>>;

/// File paths up to three levels deep
///
/// Names are drawn from one small pool at every level, so the same path is
/// a file in one tree and a directory in another.
fn path_strategy() -> impl Strategy<Value = String> {
    prop_oneof![
        "[a-c]",
        "[a-c]/[a-c]",
        "[a-c]/[a-c]/[a-c]",
    ]
}

/// Text (line-oriented, patchable) or binary content
fn content_strategy() -> impl Strategy<Value = Vec<u8>> {
    prop_oneof![
        prop::collection::vec("[a-z ]{0,12}", 0..40).prop_map(|lines| lines.join("\n").into_bytes()),
        prop::collection::vec(any::<u8>(), 0..2048),
    ]
}

/// Drops any file that another generated path uses as a directory
fn tree_strategy() -> impl Strategy<Value = Tree> {
    prop::collection::btree_map(path_strategy(), content_strategy(), 0..8).prop_map(|mut tree| {
        let dirs: Vec<String> = tree
            .keys()
            .filter(|key| tree.keys().any(|other| other.starts_with(&format!("{key}/"))))
            .cloned()
            .collect();
        for dir in dirs {
            tree.remove(&dir);
        }
        tree
    })
}

fn write_tree(root: &Path, tree: &Tree) {
    fs::create_dir_all(root).unwrap();
    for (rel, content) in tree {
        let path = root.join(rel);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, content).unwrap();
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    /// Splitting yields ceil(size / chunk) chunks that join back to the original
    #[test]
    fn split_join_roundtrip(
        data in prop::collection::vec(any::<u8>(), 1..20_000),
        chunk_size in 64usize..4096,
    ) {
        let temp = TempDir::new().unwrap();
        let store = ContentStore::new(temp.path().join("data"), temp.path().join("temp"), 1 << 20, 4096);

        let mut file = store.store(&data).unwrap();
        let count = file.split(chunk_size).unwrap();
        prop_assert_eq!(count, data.len().div_ceil(chunk_size));

        let Some(hashes) = file.chunk_hashes() else {
            prop_assert!(data.len() <= chunk_size);
            return Ok(());
        };
        prop_assert!(data.len() > chunk_size);

        file.delete().unwrap();
        let mut joined = store.reference_with_chunks(file.digest(), &hashes).unwrap();
        prop_assert!(!joined.exists());
        joined.join().unwrap();
        prop_assert_eq!(fs::read(joined.path()).unwrap(), data);
    }

    /// Equal trees hash equally regardless of write order
    #[test]
    fn digest_ignores_write_order(tree in tree_strategy()) {
        let temp = TempDir::new().unwrap();
        let forward = temp.path().join("forward");
        let backward = temp.path().join("backward");
        write_tree(&forward, &tree);
        fs::create_dir_all(&backward).unwrap();
        for (rel, content) in tree.iter().rev() {
            let path = backward.join(rel);
            fs::create_dir_all(path.parent().unwrap()).unwrap();
            fs::write(path, content).unwrap();
        }
        prop_assert_eq!(
            TreeDigest::compute(&forward).unwrap(),
            TreeDigest::compute(&backward).unwrap()
        );
    }

    /// Merging the diff of two trees onto the first reproduces the second
    ///
    /// Includes paths that switch between file and directory.
    #[test]
    fn merge_inverts_diff(before in tree_strategy(), after in tree_strategy()) {
        let temp = TempDir::new().unwrap();
        let a = temp.path().join("a");
        let b = temp.path().join("b");
        write_tree(&a, &before);
        write_tree(&b, &after);
        let (digest_a, digest_b) = (TreeDigest::compute(&a).unwrap(), TreeDigest::compute(&b).unwrap());

        let work = temp.path().join("temp");
        let layer = TreeDiffer::new(&work, 1024).diff(&a, &b, None).unwrap();
        let merged = TreeMerger::new(&work).merge(&a, layer.path()).unwrap();

        prop_assert_eq!(TreeDigest::compute(&merged).unwrap(), digest_b.clone());
        prop_assert_eq!(TreeDigest::compute(&a).unwrap(), digest_a);
        prop_assert_eq!(TreeDigest::compute(&b).unwrap(), digest_b);
        prop_assert_eq!(layer.manifest().is_empty(), before == after);
    }

    /// Folding consecutive layers equals applying the combined change at once
    #[test]
    fn fold_matches_direct_merge(
        first in tree_strategy(),
        second in tree_strategy(),
        third in tree_strategy(),
    ) {
        let temp = TempDir::new().unwrap();
        let (a, b, c) = (temp.path().join("a"), temp.path().join("b"), temp.path().join("c"));
        write_tree(&a, &first);
        write_tree(&b, &second);
        write_tree(&c, &third);

        let work = temp.path().join("temp");
        let differ = TreeDiffer::new(&work, 1024).with_parallel_workers(2);
        let ab = differ.diff(&a, &b, None).unwrap();
        let bc = differ.diff(&b, &c, None).unwrap();
        let ac = differ.diff(&a, &c, None).unwrap();

        let folded = LayerFolder::new(&work)
            .validate_all_layers(true)
            .fold(&[a.clone(), ab.path().to_path_buf(), bc.path().to_path_buf()])
            .unwrap();
        let direct = TreeMerger::new(&work).merge(&a, ac.path()).unwrap();

        let expected = TreeDigest::compute(&c).unwrap();
        prop_assert_eq!(TreeDigest::compute(&folded).unwrap(), expected.clone());
        prop_assert_eq!(TreeDigest::compute(&direct).unwrap(), expected);
    }

    /// A tree diffed against itself yields an empty manifest
    #[test]
    fn self_diff_is_empty(tree in tree_strategy()) {
        let temp = TempDir::new().unwrap();
        let root = temp.path().join("tree");
        write_tree(&root, &tree);

        let layer = TreeDiffer::new(temp.path().join("temp"), 1024).diff(&root, &root, None).unwrap();
        prop_assert!(layer.manifest().is_empty());
        let merged = TreeMerger::new(temp.path().join("temp")).merge(&root, layer.path()).unwrap();
        prop_assert_eq!(TreeDigest::compute(&merged).unwrap(), TreeDigest::compute(&root).unwrap());
    }
}

//! Manifest trie invariants over randomized edit sequences.

use basalt_manifest::{ManifestEntry, ManifestTrie, MemoryStore, WalkStep};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::BTreeMap;
use std::sync::Arc;

fn leaf(path: &str, hash: &str) -> ManifestEntry {
    ManifestEntry {
        hash: hash.to_string(),
        path: path.to_string(),
        content_type: "application/octet-stream".to_string(),
        mode: 0o644,
        size: 42,
        mod_time: 1_700_000_000,
        status: 0,
    }
}

fn leaves(trie: &mut ManifestTrie) -> BTreeMap<String, String> {
    let mut map = BTreeMap::new();
    trie.walk(&mut |entry| {
        if !entry.is_manifest() {
            map.insert(entry.path.clone(), entry.hash.clone());
        }
        WalkStep::Continue
    })
    .unwrap();
    map
}

/// Candidate paths sharing plenty of prefixes, to force splits and
/// collapses.
fn path_pool() -> Vec<String> {
    let mut paths = Vec::new();
    for dir in ["app", "apple", "assets/js", "assets/css", "docs"] {
        for file in ["index", "inline", "main", "map"] {
            paths.push(format!("{dir}/{file}"));
        }
    }
    paths.push(String::new()); // the empty-path sentinel slot
    paths
}

#[test]
fn test_random_edits_survive_store_and_reload() {
    let store: Arc<dyn basalt_manifest::ContentStore> = Arc::new(MemoryStore::new());
    let mut trie = ManifestTrie::new(Arc::clone(&store));
    let mut model: BTreeMap<String, String> = BTreeMap::new();

    let paths = path_pool();
    let mut rng = StdRng::seed_from_u64(0x6261_7361_6c74);

    for step in 0..400 {
        let path = &paths[rng.gen_range(0..paths.len())];
        if rng.gen_bool(0.65) {
            let hash = format!("{step:08x}");
            trie.add_entry(leaf(path, &hash));
            model.insert(path.clone(), hash);
        } else {
            trie.delete_entry(path);
            model.remove(path);
        }
    }

    assert_eq!(leaves(&mut trie), model);

    // Store, reload, and the leaf set is unchanged
    let key = trie.recalc_and_store().unwrap();
    let mut reloaded = ManifestTrie::load(store, &key).unwrap();
    assert_eq!(leaves(&mut reloaded), model);
}

#[test]
fn test_lookup_agrees_with_model_after_reload() {
    let store: Arc<dyn basalt_manifest::ContentStore> = Arc::new(MemoryStore::new());
    let mut trie = ManifestTrie::new(Arc::clone(&store));

    let paths = path_pool();
    for (i, path) in paths.iter().enumerate() {
        if !path.is_empty() {
            trie.add_entry(leaf(path, &format!("{i:04x}")));
        }
    }
    let key = trie.recalc_and_store().unwrap();
    let mut reloaded = ManifestTrie::load(store, &key).unwrap();

    for (i, path) in paths.iter().enumerate() {
        if path.is_empty() {
            continue;
        }
        let (entry, pos) = reloaded.find_prefix_of(path).unwrap();
        let entry = entry.unwrap_or_else(|| panic!("lookup lost {path}"));
        assert_eq!(entry.hash, format!("{i:04x}"));
        assert_eq!(pos, path.len());
    }
}

#[test]
fn test_repeated_store_cycles_are_stable() {
    let store: Arc<dyn basalt_manifest::ContentStore> = Arc::new(MemoryStore::new());
    let mut trie = ManifestTrie::new(Arc::clone(&store));
    trie.add_entry(leaf("static/a.js", "aa"));
    trie.add_entry(leaf("static/b.js", "bb"));

    let first = trie.recalc_and_store().unwrap();

    // A reload followed by a store of the identical content lands on
    // the identical key
    let mut reloaded = ManifestTrie::load(Arc::clone(&store), &first).unwrap();
    let second = reloaded.recalc_and_store().unwrap();
    assert_eq!(first, second);
}

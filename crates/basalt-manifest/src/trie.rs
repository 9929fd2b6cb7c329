//! The manifest trie.
//!
//! Nodes hold 257 slots: one per first byte of the remaining path plus
//! one for the empty-path sentinel. Inserting a conflicting path splits
//! on the longest common prefix and pushes both entries into a fresh
//! subtrie behind an intermediate manifest-typed entry; deleting
//! collapses subtries that would keep fewer than two children.
//! Subtries referenced by hash are loaded lazily from the store.

use crate::{ContentStore, ManifestError, ManifestResult};
use basalt_types::Hash256;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::trace;

/// Content type marking a subtrie reference.
pub const MANIFEST_MIME: &str = "application/bzz-manifest+json";

/// Status set on an entry when a lookup is ambiguous.
pub const STATUS_MULTIPLE_CHOICES: u16 = 300;

/// Index of the empty-path sentinel slot.
const EMPTY_PATH_SLOT: usize = 256;

/// The stored form of a manifest.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Manifest {
    /// Manifest entries, one per occupied slot.
    pub entries: Vec<ManifestEntry>,
}

/// One entry of a manifest.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestEntry {
    /// Key of the stored object, or of the subtrie manifest.
    #[serde(default)]
    pub hash: String,
    /// Path relative to the owning trie node.
    #[serde(default)]
    pub path: String,
    /// Content type; [`MANIFEST_MIME`] marks a subtrie reference.
    #[serde(rename = "contentType", default)]
    pub content_type: String,
    /// File mode bits.
    #[serde(default)]
    pub mode: i64,
    /// Content size in bytes.
    #[serde(default)]
    pub size: i64,
    /// Modification time, unix seconds.
    #[serde(rename = "mod_time", default)]
    pub mod_time: u64,
    /// Lookup status code.
    #[serde(default)]
    pub status: u16,
}

impl ManifestEntry {
    /// Whether the entry references a subtrie.
    pub fn is_manifest(&self) -> bool {
        self.content_type == MANIFEST_MIME
    }
}

/// Decision returned by a walk callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WalkStep {
    /// Keep walking, descending into subtries.
    Continue,
    /// Do not descend into this manifest entry's subtrie.
    SkipSubtrie,
}

struct TrieEntry {
    entry: ManifestEntry,
    subtrie: Option<ManifestTrie>,
}

impl TrieEntry {
    fn leaf(entry: ManifestEntry) -> Box<Self> {
        Box::new(Self {
            entry,
            subtrie: None,
        })
    }
}

/// A lazily loaded manifest trie over a content-addressed store.
pub struct ManifestTrie {
    store: Arc<dyn ContentStore>,
    entries: Box<[Option<Box<TrieEntry>>; 257]>,
    /// Set iff the current shape is stored under this key.
    hash: Option<Hash256>,
}

/// Byte-wise tail of a path, starting at `from`.
///
/// Paths are treated as byte strings, exactly like the stored format;
/// multi-byte characters split at a slice point degrade lossily.
fn byte_slice(path: &str, from: usize) -> String {
    String::from_utf8_lossy(&path.as_bytes()[from..]).into_owned()
}

/// Byte-wise head of a path, up to `to`.
fn byte_prefix(path: &str, to: usize) -> String {
    String::from_utf8_lossy(&path.as_bytes()[..to]).into_owned()
}

fn common_prefix_len(a: &str, b: &str) -> usize {
    a.as_bytes()
        .iter()
        .zip(b.as_bytes())
        .take_while(|(x, y)| x == y)
        .count()
}

/// Normalize a path: no leading, trailing or doubled slashes.
pub fn regular_slashes(path: &str) -> String {
    let bytes = path.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    for (i, &byte) in bytes.iter().enumerate() {
        if byte != b'/' || (i > 0 && bytes[i - 1] != b'/') {
            out.push(byte);
        }
    }
    if out.last() == Some(&b'/') {
        out.pop();
    }
    String::from_utf8_lossy(&out).into_owned()
}

impl ManifestTrie {
    /// Create an empty trie.
    pub fn new(store: Arc<dyn ContentStore>) -> Self {
        Self {
            store,
            entries: Box::new(std::array::from_fn(|_| None)),
            hash: None,
        }
    }

    /// Load a trie from its stored manifest. Subtries stay unloaded
    /// until touched.
    pub fn load(store: Arc<dyn ContentStore>, hash: &Hash256) -> ManifestResult<Self> {
        trace!(key = %hash, "Loading manifest");
        let data = store.get(hash)?;
        let manifest: Manifest = serde_json::from_slice(&data)
            .map_err(|err| ManifestError::Malformed(hash.to_string(), err.to_string()))?;

        let mut trie = Self::new(store);
        for entry in manifest.entries {
            trie.add_entry(entry);
        }
        Ok(trie)
    }

    /// Key the trie was last stored under, if unmodified since.
    pub fn stored_hash(&self) -> Option<Hash256> {
        self.hash
    }

    /// Insert an entry, splitting on path conflicts.
    pub fn add_entry(&mut self, entry: ManifestEntry) {
        self.add_trie_entry(TrieEntry::leaf(entry));
    }

    fn add_trie_entry(&mut self, mut entry: Box<TrieEntry>) {
        // Trie modified, the stored hash no longer matches
        self.hash = None;

        if entry.entry.path.is_empty() {
            self.entries[EMPTY_PATH_SLOT] = Some(entry);
            return;
        }

        let b = entry.entry.path.as_bytes()[0] as usize;
        let replaces = match &self.entries[b] {
            None => true,
            Some(old) => old.entry.path == entry.entry.path && !old.entry.is_manifest(),
        };
        if replaces {
            self.entries[b] = Some(entry);
            return;
        }

        let store = Arc::clone(&self.store);
        let old = match self.entries[b].as_mut() {
            Some(old) => old,
            None => return,
        };
        let cpl = common_prefix_len(&entry.entry.path, &old.entry.path);

        if old.entry.is_manifest() && cpl == old.entry.path.as_bytes().len() {
            if Self::load_subtrie(&store, old).is_err() {
                return;
            }
            entry.entry.path = byte_slice(&entry.entry.path, cpl);
            if let Some(subtrie) = old.subtrie.as_mut() {
                subtrie.add_trie_entry(entry);
                old.entry.hash.clear();
            }
            return;
        }

        // Conflict: split both entries into a fresh subtrie behind an
        // intermediate manifest entry holding the common prefix.
        let common_prefix = byte_prefix(&entry.entry.path, cpl);
        let mut subtrie = ManifestTrie::new(Arc::clone(&store));
        entry.entry.path = byte_slice(&entry.entry.path, cpl);
        let mut old = match self.entries[b].take() {
            Some(old) => old,
            None => return,
        };
        old.entry.path = byte_slice(&old.entry.path, cpl);
        subtrie.add_trie_entry(entry);
        subtrie.add_trie_entry(old);

        self.entries[b] = Some(Box::new(TrieEntry {
            entry: ManifestEntry {
                path: common_prefix,
                content_type: MANIFEST_MIME.to_string(),
                ..Default::default()
            },
            subtrie: Some(subtrie),
        }));
    }

    /// Remove the entry at `path`, collapsing subtries left with fewer
    /// than two children.
    pub fn delete_entry(&mut self, path: &str) {
        self.hash = None;

        if path.is_empty() {
            self.entries[EMPTY_PATH_SLOT] = None;
            return;
        }

        let b = path.as_bytes()[0] as usize;
        let store = Arc::clone(&self.store);
        let path_bytes = path.as_bytes();

        let descend = match self.entries[b].as_ref() {
            None => return,
            Some(entry) if entry.entry.path == path => {
                self.entries[b] = None;
                return;
            }
            Some(entry) => {
                let epl = entry.entry.path.as_bytes().len();
                entry.entry.is_manifest()
                    && path_bytes.len() >= epl
                    && path_bytes[..epl] == *entry.entry.path.as_bytes()
            }
        };
        if !descend {
            return;
        }

        let collapsed = {
            let Some(entry) = self.entries[b].as_mut() else {
                return;
            };
            if Self::load_subtrie(&store, entry).is_err() {
                return;
            }
            let epl = entry.entry.path.as_bytes().len();
            let rest = byte_slice(path, epl);
            let Some(subtrie) = entry.subtrie.as_mut() else {
                return;
            };
            subtrie.delete_entry(&rest);
            entry.entry.hash.clear();

            // Collapse the subtrie when it would keep fewer than two
            // children, re-concatenating the paths.
            let (count, last) = subtrie.take_single();
            if count >= 2 {
                return;
            }
            let parent_path = entry.entry.path.clone();
            last.map(|mut last| {
                last.entry.path = format!("{}{}", parent_path, last.entry.path);
                last
            })
        };
        self.entries[b] = collapsed;
    }

    /// Count children; when there is at most one, move it out.
    fn take_single(&mut self) -> (usize, Option<Box<TrieEntry>>) {
        let count = self.entries.iter().filter(|slot| slot.is_some()).count();
        if count >= 2 {
            return (count, None);
        }
        let last = self
            .entries
            .iter_mut()
            .find_map(|slot| slot.take());
        (count, last)
    }

    /// Serialize modified nodes bottom-up and store them, returning the
    /// root key.
    pub fn recalc_and_store(&mut self) -> ManifestResult<Hash256> {
        if let Some(hash) = self.hash {
            return Ok(hash);
        }

        let mut manifest = Manifest::default();
        for slot in self.entries.iter_mut() {
            let Some(entry) = slot else { continue };
            if entry.entry.hash.is_empty() {
                let subtrie = entry.subtrie.as_mut().ok_or_else(|| {
                    ManifestError::Store("entry has neither hash nor subtrie".to_string())
                })?;
                let key = subtrie.recalc_and_store()?;
                entry.entry.hash = key.to_string();
            }
            manifest.entries.push(entry.entry.clone());
        }

        let data = serde_json::to_vec(&manifest)
            .map_err(|err| ManifestError::Store(err.to_string()))?;
        let key = self.store.put(data)?;
        self.hash = Some(key);
        Ok(key)
    }

    fn load_subtrie(store: &Arc<dyn ContentStore>, entry: &mut TrieEntry) -> ManifestResult<()> {
        if entry.subtrie.is_none() {
            let bytes = hex::decode(&entry.entry.hash)
                .map_err(|_| ManifestError::InvalidHash(entry.entry.hash.clone()))?;
            let key = Hash256::from_slice(&bytes)
                .ok_or_else(|| ManifestError::InvalidHash(entry.entry.hash.clone()))?;
            entry.subtrie = Some(ManifestTrie::load(Arc::clone(store), &key)?);
            // The hash may no longer match once the subtrie is touched
            entry.entry.hash.clear();
        }
        Ok(())
    }

    /// Find the entry whose path is the longest prefix of `path`,
    /// descending through subtries. Returns the entry and the number of
    /// path bytes consumed.
    pub fn find_prefix_of(
        &mut self,
        path: &str,
    ) -> ManifestResult<(Option<ManifestEntry>, usize)> {
        trace!(path, "find_prefix_of");

        if path.is_empty() {
            return Ok((
                self.entries[EMPTY_PATH_SLOT].as_ref().map(|e| e.entry.clone()),
                0,
            ));
        }

        let b = path.as_bytes()[0] as usize;
        if self.entries[b].is_none() {
            return Ok((
                self.entries[EMPTY_PATH_SLOT].as_ref().map(|e| e.entry.clone()),
                0,
            ));
        }

        let store = Arc::clone(&self.store);
        let Some(entry) = self.entries[b].as_mut() else {
            return Ok((None, 0));
        };
        let epl = entry.entry.path.as_bytes().len();
        let path_bytes = path.as_bytes();

        if path_bytes.len() <= epl {
            if entry.entry.path.as_bytes()[..path_bytes.len()] == *path_bytes {
                if entry.entry.is_manifest() {
                    if Self::load_subtrie(&store, entry).is_ok() {
                        if let Some(subtrie) = entry.subtrie.as_ref() {
                            for sub in subtrie.entries.iter().flatten() {
                                if sub.entry.path.is_empty() {
                                    return Ok((Some(sub.entry.clone()), path_bytes.len()));
                                }
                            }
                        }
                    }
                    entry.entry.status = STATUS_MULTIPLE_CHOICES;
                }
                return Ok((Some(entry.entry.clone()), path_bytes.len()));
            }
            return Ok((None, 0));
        }

        if path_bytes[..epl] == *entry.entry.path.as_bytes() {
            // Prefix test implemented via substring containment;
            // callers rely on this exact behavior, do not tighten it
            // to a plain starts_with.
            if entry.entry.is_manifest()
                && (entry.entry.path.contains(path) || path.contains(entry.entry.path.as_str()))
            {
                if Self::load_subtrie(&store, entry).is_err() {
                    return Ok((None, 0));
                }
                let rest = byte_slice(path, epl);
                let Some(subtrie) = entry.subtrie.as_mut() else {
                    return Ok((None, 0));
                };
                let (sub, pos) = subtrie.find_prefix_of(&rest)?;
                if let Some(sub) = sub {
                    return Ok((Some(sub), pos + epl));
                } else if path == entry.entry.path {
                    entry.entry.status = STATUS_MULTIPLE_CHOICES;
                }
            } else if path != entry.entry.path {
                return Ok((None, 0));
            }
        }

        // Fall-through keeps the entry with zero consumed bytes,
        // mirroring the original control flow
        Ok((Some(entry.entry.clone()), 0))
    }

    /// Look up `path` after slash normalization. Returns the entry and
    /// the consumed portion of the path.
    pub fn get_entry(&mut self, raw_path: &str) -> ManifestResult<(Option<ManifestEntry>, String)> {
        let path = regular_slashes(raw_path);
        let (entry, pos) = self.find_prefix_of(&path)?;
        Ok((entry, byte_prefix(&path, pos)))
    }

    /// Visit entries whose full path starts with `prefix`, calling
    /// `cb(entry, suffix)` for each leaf.
    pub fn list_with_prefix(
        &mut self,
        prefix: &str,
        cb: &mut dyn FnMut(&ManifestEntry, &str),
    ) -> ManifestResult<()> {
        self.list_with_prefix_inner(prefix, "", cb)
    }

    fn list_with_prefix_inner(
        &mut self,
        prefix: &str,
        rp: &str,
        cb: &mut dyn FnMut(&ManifestEntry, &str),
    ) -> ManifestResult<()> {
        let plen = prefix.as_bytes().len();
        let (start, stop) = if plen == 0 {
            (0usize, 256usize)
        } else {
            let b = prefix.as_bytes()[0] as usize;
            (b, b)
        };

        let store = Arc::clone(&self.store);
        for i in start..=stop {
            let Some(entry) = self.entries[i].as_mut() else {
                continue;
            };
            let epl = entry.entry.path.as_bytes().len();
            if entry.entry.is_manifest() {
                let l = plen.min(epl);
                if prefix.as_bytes()[..l] == entry.entry.path.as_bytes()[..l] {
                    Self::load_subtrie(&store, entry)?;
                    let sub_prefix = byte_slice(prefix, l);
                    let sub_rp = format!("{}{}", rp, byte_slice(&entry.entry.path, l));
                    let Some(subtrie) = entry.subtrie.as_mut() else {
                        continue;
                    };
                    subtrie.list_with_prefix_inner(&sub_prefix, &sub_rp, cb)?;
                }
            } else if epl >= plen && *prefix.as_bytes() == entry.entry.path.as_bytes()[..plen] {
                let suffix = format!("{}{}", rp, byte_slice(&entry.entry.path, plen));
                cb(&entry.entry, &suffix);
            }
        }
        Ok(())
    }

    /// Recursively visit every entry, loading subtries as needed.
    ///
    /// The callback sees each entry with its full path from the root.
    pub fn walk(
        &mut self,
        cb: &mut dyn FnMut(&ManifestEntry) -> WalkStep,
    ) -> ManifestResult<()> {
        self.walk_inner("", cb)
    }

    fn walk_inner(
        &mut self,
        prefix: &str,
        cb: &mut dyn FnMut(&ManifestEntry) -> WalkStep,
    ) -> ManifestResult<()> {
        let store = Arc::clone(&self.store);
        for slot in self.entries.iter_mut() {
            let Some(entry) = slot else { continue };
            let full_path = format!("{}{}", prefix, entry.entry.path);
            let mut shown = entry.entry.clone();
            shown.path = full_path.clone();

            let step = cb(&shown);
            if !entry.entry.is_manifest() {
                continue;
            }
            if step == WalkStep::SkipSubtrie {
                continue;
            }
            Self::load_subtrie(&store, entry)?;
            let Some(subtrie) = entry.subtrie.as_mut() else {
                continue;
            };
            subtrie.walk_inner(&full_path, cb)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::MemoryStore;
    use std::collections::BTreeSet;

    fn leaf(path: &str, hash: &str) -> ManifestEntry {
        ManifestEntry {
            hash: hash.to_string(),
            path: path.to_string(),
            content_type: "text/plain".to_string(),
            mode: 0o644,
            size: 1,
            mod_time: 1_700_000_000,
            status: 0,
        }
    }

    fn leaf_paths(trie: &mut ManifestTrie) -> BTreeSet<(String, String)> {
        let mut set = BTreeSet::new();
        trie.walk(&mut |entry| {
            if !entry.is_manifest() {
                set.insert((entry.path.clone(), entry.hash.clone()));
            }
            WalkStep::Continue
        })
        .unwrap();
        set
    }

    #[test]
    fn test_insert_without_conflict() {
        let store: Arc<dyn ContentStore> = Arc::new(MemoryStore::new());
        let mut trie = ManifestTrie::new(store);

        trie.add_entry(leaf("index.html", "aa"));
        trie.add_entry(leaf("robots.txt", "bb"));
        trie.add_entry(leaf("", "cc"));

        let set = leaf_paths(&mut trie);
        assert_eq!(set.len(), 3);
        assert!(set.contains(&("index.html".to_string(), "aa".to_string())));
        assert!(set.contains(&("".to_string(), "cc".to_string())));
    }

    #[test]
    fn test_conflict_splits_on_common_prefix() {
        let store: Arc<dyn ContentStore> = Arc::new(MemoryStore::new());
        let mut trie = ManifestTrie::new(store);

        trie.add_entry(leaf("assets/app.js", "aa"));
        trie.add_entry(leaf("assets/app.css", "bb"));

        // Both leaves survive with their full paths intact
        let set = leaf_paths(&mut trie);
        assert!(set.contains(&("assets/app.js".to_string(), "aa".to_string())));
        assert!(set.contains(&("assets/app.css".to_string(), "bb".to_string())));

        // An intermediate manifest entry holds the common prefix
        let mut manifests = Vec::new();
        trie.walk(&mut |entry| {
            if entry.is_manifest() {
                manifests.push(entry.path.clone());
            }
            WalkStep::Continue
        })
        .unwrap();
        assert_eq!(manifests, vec!["assets/app.".to_string()]);
    }

    #[test]
    fn test_replace_same_path() {
        let store: Arc<dyn ContentStore> = Arc::new(MemoryStore::new());
        let mut trie = ManifestTrie::new(store);

        trie.add_entry(leaf("file", "old"));
        trie.add_entry(leaf("file", "new"));

        let set = leaf_paths(&mut trie);
        assert_eq!(set.len(), 1);
        assert!(set.contains(&("file".to_string(), "new".to_string())));
    }

    #[test]
    fn test_delete_collapses_subtrie() {
        let store: Arc<dyn ContentStore> = Arc::new(MemoryStore::new());
        let mut trie = ManifestTrie::new(store);

        trie.add_entry(leaf("dir/a", "aa"));
        trie.add_entry(leaf("dir/b", "bb"));
        trie.delete_entry("dir/a");

        // The subtrie held one child, so it collapses back into a
        // plain leaf with the re-concatenated path
        let set = leaf_paths(&mut trie);
        assert_eq!(set.len(), 1);
        assert!(set.contains(&("dir/b".to_string(), "bb".to_string())));

        let mut manifests = 0;
        trie.walk(&mut |entry| {
            if entry.is_manifest() {
                manifests += 1;
            }
            WalkStep::Continue
        })
        .unwrap();
        assert_eq!(manifests, 0);
    }

    #[test]
    fn test_delete_missing_is_noop() {
        let store: Arc<dyn ContentStore> = Arc::new(MemoryStore::new());
        let mut trie = ManifestTrie::new(store);
        trie.add_entry(leaf("keep", "aa"));
        trie.delete_entry("gone");
        assert_eq!(leaf_paths(&mut trie).len(), 1);
    }

    #[test]
    fn test_recalc_store_reload_preserves_leaves() {
        let store: Arc<dyn ContentStore> = Arc::new(MemoryStore::new());
        let mut trie = ManifestTrie::new(Arc::clone(&store));

        trie.add_entry(leaf("a/one.txt", "11"));
        trie.add_entry(leaf("a/two.txt", "22"));
        trie.add_entry(leaf("b.txt", "33"));
        trie.add_entry(leaf("", "44"));
        trie.delete_entry("a/one.txt");

        let before = leaf_paths(&mut trie);
        let key = trie.recalc_and_store().unwrap();

        let mut reloaded = ManifestTrie::load(store, &key).unwrap();
        let after = leaf_paths(&mut reloaded);
        assert_eq!(before, after);
    }

    #[test]
    fn test_recalc_is_stable_when_unmodified() {
        let store: Arc<dyn ContentStore> = Arc::new(MemoryStore::new());
        let mut trie = ManifestTrie::new(store);
        trie.add_entry(leaf("x", "aa"));

        let first = trie.recalc_and_store().unwrap();
        let second = trie.recalc_and_store().unwrap();
        assert_eq!(first, second);
        assert_eq!(trie.stored_hash(), Some(first));
    }

    #[test]
    fn test_modification_invalidates_hash() {
        let store: Arc<dyn ContentStore> = Arc::new(MemoryStore::new());
        let mut trie = ManifestTrie::new(store);
        trie.add_entry(leaf("x", "aa"));
        trie.recalc_and_store().unwrap();

        trie.add_entry(leaf("y", "bb"));
        assert_eq!(trie.stored_hash(), None);
    }

    #[test]
    fn test_find_prefix_descends_subtries() {
        let store: Arc<dyn ContentStore> = Arc::new(MemoryStore::new());
        let mut trie = ManifestTrie::new(store);

        trie.add_entry(leaf("static/css/site.css", "aa"));
        trie.add_entry(leaf("static/css/print.css", "bb"));

        let (entry, pos) = trie.find_prefix_of("static/css/site.css").unwrap();
        let entry = entry.unwrap();
        assert_eq!(entry.hash, "aa");
        assert_eq!(pos, "static/css/site.css".len());
    }

    #[test]
    fn test_find_prefix_after_reload() {
        let store: Arc<dyn ContentStore> = Arc::new(MemoryStore::new());
        let mut trie = ManifestTrie::new(Arc::clone(&store));
        trie.add_entry(leaf("docs/guide.md", "aa"));
        trie.add_entry(leaf("docs/api.md", "bb"));
        let key = trie.recalc_and_store().unwrap();

        // Subtries load lazily while resolving the path
        let mut reloaded = ManifestTrie::load(store, &key).unwrap();
        let (entry, pos) = reloaded.find_prefix_of("docs/api.md").unwrap();
        assert_eq!(entry.unwrap().hash, "bb");
        assert_eq!(pos, "docs/api.md".len());
    }

    #[test]
    fn test_get_entry_regularizes_slashes() {
        let store: Arc<dyn ContentStore> = Arc::new(MemoryStore::new());
        let mut trie = ManifestTrie::new(store);
        trie.add_entry(leaf("a/b", "aa"));

        let (entry, consumed) = trie.get_entry("a//b/").unwrap();
        assert_eq!(entry.unwrap().hash, "aa");
        assert_eq!(consumed, "a/b");
    }

    #[test]
    fn test_list_with_prefix() {
        let store: Arc<dyn ContentStore> = Arc::new(MemoryStore::new());
        let mut trie = ManifestTrie::new(store);
        trie.add_entry(leaf("img/a.png", "aa"));
        trie.add_entry(leaf("img/b.png", "bb"));
        trie.add_entry(leaf("index.html", "cc"));

        let mut found = Vec::new();
        trie.list_with_prefix("img/", &mut |entry, suffix| {
            found.push((entry.hash.clone(), suffix.to_string()));
        })
        .unwrap();
        found.sort();
        assert_eq!(
            found,
            vec![
                ("aa".to_string(), "a.png".to_string()),
                ("bb".to_string(), "b.png".to_string()),
            ]
        );
    }

    #[test]
    fn test_regular_slashes() {
        assert_eq!(regular_slashes("//a//b//"), "a/b");
        assert_eq!(regular_slashes("a/b"), "a/b");
        assert_eq!(regular_slashes(""), "");
        assert_eq!(regular_slashes("/"), "");
    }
}

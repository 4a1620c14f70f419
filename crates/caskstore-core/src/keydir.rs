//! Key directory: the in-memory index from key to on-disk location
//!
//! The directory is split into a fixed number of shards, each behind its
//! own `RwLock`, so operations on unrelated keys do not contend. The shard
//! is chosen by FNV-1a of the key. Live key count and live byte totals are
//! kept in atomics and updated under the owning shard's write lock.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use hashbrown::HashMap;
use parking_lot::RwLock;

use crate::hash::fnv1a64;
use crate::segment::SegmentId;

/// Number of independently locked shards
pub const SHARD_COUNT: usize = 32;

/// Location of the newest live record for a key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeyDirEntry {
    pub segment_id: SegmentId,
    /// Byte offset of the record start inside the segment
    pub offset: u64,
    /// Total record length (header + key + value)
    pub len: u64,
    pub timestamp: u64,
}

type Shard = RwLock<HashMap<Vec<u8>, KeyDirEntry>>;

/// Sharded, concurrent key directory.
pub struct KeyDir {
    shards: Box<[Shard]>,
    len: AtomicUsize,
    live_bytes: AtomicU64,
}

impl KeyDir {
    pub fn new() -> Self {
        let shards = (0..SHARD_COUNT)
            .map(|_| RwLock::new(HashMap::new()))
            .collect::<Vec<_>>()
            .into_boxed_slice();
        Self {
            shards,
            len: AtomicUsize::new(0),
            live_bytes: AtomicU64::new(0),
        }
    }

    #[inline]
    fn shard(&self, key: &[u8]) -> &Shard {
        &self.shards[(fnv1a64(key) % SHARD_COUNT as u64) as usize]
    }

    pub fn get(&self, key: &[u8]) -> Option<KeyDirEntry> {
        self.shard(key).read().get(key).copied()
    }

    pub fn contains(&self, key: &[u8]) -> bool {
        self.shard(key).read().contains_key(key)
    }

    /// Insert or replace the entry for `key`, returning the previous one.
    pub fn insert(&self, key: &[u8], entry: KeyDirEntry) -> Option<KeyDirEntry> {
        let mut shard = self.shard(key).write();
        let previous = match shard.get_mut(key) {
            Some(slot) => Some(std::mem::replace(slot, entry)),
            None => {
                shard.insert(key.to_vec(), entry);
                None
            }
        };
        match previous {
            Some(old) => {
                self.live_bytes.fetch_sub(old.len, Ordering::Relaxed);
            }
            None => {
                self.len.fetch_add(1, Ordering::Relaxed);
            }
        }
        self.live_bytes.fetch_add(entry.len, Ordering::Relaxed);
        previous
    }

    /// Remove the entry for `key`, returning it if present.
    pub fn remove(&self, key: &[u8]) -> Option<KeyDirEntry> {
        let mut shard = self.shard(key).write();
        let removed = shard.remove(key);
        if let Some(old) = removed {
            self.len.fetch_sub(1, Ordering::Relaxed);
            self.live_bytes.fetch_sub(old.len, Ordering::Relaxed);
        }
        removed
    }

    /// Compare-and-swap: point `key` at `new` only if it still points at
    /// `expected`. Returns whether the swap happened.
    pub fn replace_if(&self, key: &[u8], expected: &KeyDirEntry, new: KeyDirEntry) -> bool {
        let mut shard = self.shard(key).write();
        match shard.get_mut(key) {
            Some(slot) if slot == expected => {
                *slot = new;
                self.live_bytes.fetch_sub(expected.len, Ordering::Relaxed);
                self.live_bytes.fetch_add(new.len, Ordering::Relaxed);
                true
            }
            _ => false,
        }
    }

    /// Number of live keys. O(1).
    pub fn len(&self) -> usize {
        self.len.load(Ordering::Relaxed)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Sum of record lengths of all live entries.
    pub fn live_bytes(&self) -> u64 {
        self.live_bytes.load(Ordering::Relaxed)
    }

    /// Snapshot every (key, entry) whose entry lives in a segment accepted
    /// by `in_set`. Each shard is copied under its read lock in turn.
    pub fn entries_in<F>(&self, in_set: F) -> Vec<(Vec<u8>, KeyDirEntry)>
    where
        F: Fn(SegmentId) -> bool,
    {
        let mut entries = Vec::new();
        for shard in self.shards.iter() {
            let shard = shard.read();
            entries.extend(
                shard.iter()
                    .filter(|(_, e)| in_set(e.segment_id))
                    .map(|(k, e)| (k.clone(), *e)),
            );
        }
        entries
    }

    /// Lazy enumeration of live keys.
    ///
    /// Shards are snapshotted one at a time as the iterator reaches them, so
    /// memory stays bounded by the largest shard. Writes that land in a
    /// shard after it was snapshotted are not observed; nothing blocks
    /// writers beyond the copy of a single shard. Calling `keys` again
    /// restarts from the first shard.
    pub fn keys(self: &Arc<Self>) -> Keys {
        Keys {
            dir: Arc::clone(self),
            next_shard: 0,
            buffer: Vec::new().into_iter(),
        }
    }
}

impl Default for KeyDir {
    fn default() -> Self {
        Self::new()
    }
}

/// Iterator returned by [`KeyDir::keys`].
pub struct Keys {
    dir: Arc<KeyDir>,
    next_shard: usize,
    buffer: std::vec::IntoIter<Vec<u8>>,
}

impl Iterator for Keys {
    type Item = Vec<u8>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(key) = self.buffer.next() {
                return Some(key);
            }
            if self.next_shard >= self.dir.shards.len() {
                return None;
            }
            let snapshot: Vec<Vec<u8>> =
                self.dir.shards[self.next_shard].read().keys().cloned().collect();
            self.next_shard += 1;
            self.buffer = snapshot.into_iter();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    fn entry(segment_id: SegmentId, offset: u64, len: u64, timestamp: u64) -> KeyDirEntry {
        KeyDirEntry { segment_id, offset, len, timestamp }
    }

    #[test]
    fn test_insert_get_remove() {
        let dir = KeyDir::new();
        assert!(dir.is_empty());

        assert_eq!(dir.insert(b"k", entry(0, 0, 30, 1)), None);
        assert_eq!(dir.get(b"k"), Some(entry(0, 0, 30, 1)));
        assert!(dir.contains(b"k"));
        assert_eq!(dir.len(), 1);
        assert_eq!(dir.live_bytes(), 30);

        let old = dir.insert(b"k", entry(1, 64, 40, 2));
        assert_eq!(old, Some(entry(0, 0, 30, 1)));
        assert_eq!(dir.len(), 1);
        assert_eq!(dir.live_bytes(), 40);

        assert_eq!(dir.remove(b"k"), Some(entry(1, 64, 40, 2)));
        assert_eq!(dir.remove(b"k"), None);
        assert!(!dir.contains(b"k"));
        assert_eq!(dir.len(), 0);
        assert_eq!(dir.live_bytes(), 0);
    }

    #[test]
    fn test_replace_if_only_swaps_expected() {
        let dir = KeyDir::new();
        let original = entry(0, 0, 25, 1);
        dir.insert(b"k", original);

        let compacted = entry(5, 0, 25, 1);
        assert!(dir.replace_if(b"k", &original, compacted));
        assert_eq!(dir.get(b"k"), Some(compacted));

        // Stale expectation: a newer write already moved the key
        assert!(!dir.replace_if(b"k", &original, entry(6, 0, 25, 1)));
        assert_eq!(dir.get(b"k"), Some(compacted));

        // Missing key is never resurrected
        assert!(!dir.replace_if(b"gone", &original, compacted));
        assert!(!dir.contains(b"gone"));
        assert_eq!(dir.len(), 1);
    }

    #[test]
    fn test_keys_enumerates_everything_and_restarts() {
        let dir = Arc::new(KeyDir::new());
        for i in 0..500u64 {
            dir.insert(format!("key{}", i).as_bytes(), entry(0, i * 10, 10, i));
        }

        let first: HashSet<Vec<u8>> = dir.keys().collect();
        assert_eq!(first.len(), 500);
        assert!(first.contains(b"key123".as_slice()));

        let second: HashSet<Vec<u8>> = dir.keys().collect();
        assert_eq!(first, second);
    }

    #[test]
    fn test_keys_survives_concurrent_mutation() {
        let dir = Arc::new(KeyDir::new());
        for i in 0..200u64 {
            dir.insert(format!("k{}", i).as_bytes(), entry(0, i, 1, i));
        }

        let mut keys = dir.keys();
        let mut seen = 0;
        while let Some(_key) = keys.next() {
            seen += 1;
            // Mutate while iterating: remove one key, add another
            dir.remove(format!("k{}", seen).as_bytes());
            dir.insert(format!("new{}", seen).as_bytes(), entry(1, 0, 1, 0));
            assert!(seen < 10_000, "enumeration must be finite");
        }
        assert!(seen > 0);
    }

    #[test]
    fn test_entries_in_filters_by_segment() {
        let dir = KeyDir::new();
        dir.insert(b"a", entry(0, 0, 10, 1));
        dir.insert(b"b", entry(1, 0, 10, 2));
        dir.insert(b"c", entry(2, 0, 10, 3));

        let mut found: Vec<Vec<u8>> =
            dir.entries_in(|id| id < 2).into_iter().map(|(k, _)| k).collect();
        found.sort();
        assert_eq!(found, vec![b"a".to_vec(), b"b".to_vec()]);
    }

    #[test]
    fn test_concurrent_inserts_keep_count() {
        let dir = Arc::new(KeyDir::new());
        let mut handles = vec![];
        for t in 0..8u64 {
            let d = Arc::clone(&dir);
            handles.push(std::thread::spawn(move || {
                for i in 0..250u64 {
                    d.insert(format!("t{}-{}", t, i).as_bytes(), entry(t, i, 2, i));
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(dir.len(), 2000);
        assert_eq!(dir.live_bytes(), 4000);
    }
}

use std::collections::{HashMap, HashSet};

use crate::entry::Entry;

/// Entries seen by a seekable session, in the order they appear in the archive.
///
/// Replaying the archive after a reopen rediscovers the same entries at the
/// same header positions, so inserts are keyed by position and repeats are
/// ignored. The cache is never invalidated.
#[derive(Debug, Default, Clone)]
pub struct EntryCache {
    entries: Vec<Entry>,
    /// Pathname to index of its first occurrence
    by_name: HashMap<String, usize>,
    positions: HashSet<u64>,
}

impl EntryCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record an entry. Returns `false` if an entry at the same header
    /// position is already cached.
    pub fn insert(&mut self, entry: Entry) -> bool {
        if let Some(position) = entry.header_position() {
            if !self.positions.insert(position) {
                return false;
            }
        }
        self.by_name
            .entry(entry.pathname.clone())
            .or_insert(self.entries.len());
        self.entries.push(entry);
        true
    }

    /// Look up an entry by pathname; with duplicates, the first one stored wins
    pub fn get(&self, pathname: &str) -> Option<&Entry> {
        self.by_name.get(pathname).map(|&i| &self.entries[i])
    }

    /// The entry furthest into the archive seen so far
    pub fn last(&self) -> Option<&Entry> {
        self.entries.last()
    }

    pub fn entries(&self) -> &[Entry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::RawHeader;
    use crate::entry::{Encoding, S_IFREG};

    fn entry(name: &str, position: u64) -> Entry {
        let raw = RawHeader {
            pathname: name.as_bytes().to_vec(),
            pathname_is_utf8: true,
            file_type: S_IFREG,
            perm: 0o644,
            size: 0,
            mtime: 0,
            position,
        };
        Entry::from_raw(&raw, Encoding::Utf8).0
    }

    #[test]
    fn test_insert_preserves_order() {
        let mut cache = EntryCache::new();
        assert!(cache.is_empty());
        cache.insert(entry("b", 0));
        cache.insert(entry("a", 512));
        let names: Vec<_> = cache.entries().iter().map(|e| e.pathname.as_str()).collect();
        assert_eq!(names, ["b", "a"]);
        assert_eq!(cache.last().unwrap().pathname, "a");
    }

    #[test]
    fn test_replay_is_idempotent() {
        let mut cache = EntryCache::new();
        assert!(cache.insert(entry("a", 0)));
        assert!(cache.insert(entry("b", 512)));
        assert!(!cache.insert(entry("a", 0)));
        assert_eq!(cache.len(), 2);
    }

    #[test]
    fn test_duplicate_names_keep_first() {
        let mut cache = EntryCache::new();
        cache.insert(entry("dup", 0));
        cache.insert(entry("dup", 1024));
        assert_eq!(cache.len(), 2);
        assert_eq!(cache.get("dup").unwrap().header_position(), Some(0));
        assert!(cache.get("missing").is_none());
    }

    #[test]
    fn test_entries_without_position() {
        let mut cache = EntryCache::new();
        assert!(cache.insert(Entry::new("fresh")));
        assert!(cache.insert(Entry::new("fresh")));
        assert_eq!(cache.len(), 2);
    }
}

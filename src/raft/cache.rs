use super::{Entry, Index};

use std::collections::BTreeMap;

/// Caches recently appended log entries, so that log shippers can send them
/// to followers without reading them back from the log store.
///
/// The cache holds a consecutive run of entries. Putting an entry that doesn't
/// follow the last cached entry clears the cache first. When the cache exceeds
/// its entry or byte capacity, the oldest entries are evicted.
pub struct InFlightCache {
    enabled: bool,
    entries: BTreeMap<Index, Entry>,
    bytes: usize,
    max_entries: usize,
    max_bytes: usize,
}

impl InFlightCache {
    /// Creates a new cache with the given capacity.
    pub fn new(enabled: bool, max_entries: usize, max_bytes: usize) -> Self {
        Self { enabled, entries: BTreeMap::new(), bytes: 0, max_entries, max_bytes }
    }

    /// Creates a disabled cache, which never holds any entries.
    pub fn disabled() -> Self {
        Self::new(false, 0, 0)
    }

    /// Enables the cache.
    pub fn enable(&mut self) {
        self.enabled = true;
    }

    /// Returns true if the cache is enabled.
    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Caches an entry at the given index.
    pub fn put(&mut self, index: Index, entry: Entry) {
        if !self.enabled {
            return;
        }
        if let Some((last, _)) = self.entries.last_key_value() {
            if index != last + 1 {
                self.clear();
            }
        }
        self.bytes += entry.content.size();
        self.entries.insert(index, entry);
        while self.entries.len() > self.max_entries || self.bytes > self.max_bytes {
            match self.entries.pop_first() {
                Some((_, evicted)) => self.bytes -= evicted.content.size(),
                None => break,
            }
        }
    }

    /// Fetches a cached entry.
    pub fn get(&self, index: Index) -> Option<&Entry> {
        self.entries.get(&index)
    }

    /// Removes all entries at or after the given index.
    pub fn truncate(&mut self, from_index: Index) {
        for (_, entry) in self.entries.split_off(&from_index) {
            self.bytes -= entry.content.size();
        }
    }

    /// Removes all entries up to and including the given index.
    pub fn prune(&mut self, up_to_index: Index) {
        let retained = self.entries.split_off(&(up_to_index + 1));
        for entry in std::mem::replace(&mut self.entries, retained).into_values() {
            self.bytes -= entry.content.size();
        }
    }

    /// Removes all entries.
    pub fn clear(&mut self) {
        self.entries.clear();
        self.bytes = 0;
    }

    /// Returns the number of cached entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns true if the cache is empty.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Returns the total payload size of cached entries.
    pub fn total_bytes(&self) -> usize {
        self.bytes
    }
}

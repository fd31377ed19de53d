use std::collections::HashSet;

use crate::{
    btree::{Index, IndexEntry},
    Key, Result,
};

/// Query a list of indexes as if their entries were merged.
///
/// Duplicate keys across indexes resolve to the first index holding
/// them, so the index of a newer pack shadows older packs when placed
/// earlier in the list.
pub struct Combined {
    indexes: Vec<Index>,
}

impl Combined {
    pub fn new(indexes: Vec<Index>) -> Combined {
        Combined { indexes }
    }

    pub fn as_indexes(&self) -> &[Index] {
        &self.indexes
    }

    pub fn len_indexes(&self) -> usize {
        self.indexes.len()
    }

    /// Push a new index at the front, shadowing the existing ones.
    pub fn push_front(&mut self, index: Index) {
        self.indexes.insert(0, index);
    }

    /// Entry count summed across indexes. Keys shadowed between indexes
    /// are counted once per index, treat this as an estimate.
    pub fn key_count(&self) -> usize {
        self.indexes.iter().map(|x| x.key_count()).sum()
    }

    /// First-wins lookup of one key, also telling which index position
    /// answered.
    pub fn get(&mut self, key: &Key) -> Result<Option<(usize, IndexEntry)>> {
        for (off, index) in self.indexes.iter_mut().enumerate() {
            if let Some(entry) = index.get(key)? {
                return Ok(Some((off, entry)));
            }
        }
        Ok(None)
    }

    pub fn iter_entries(&mut self, keys: &[Key]) -> Result<Vec<(usize, IndexEntry)>> {
        let mut seen: HashSet<&Key> = HashSet::new();
        let mut out = vec![];
        for key in keys.iter() {
            if !seen.insert(key) {
                continue;
            }
            if let Some(found) = self.get(key)? {
                out.push(found);
            }
        }
        Ok(out)
    }

    /// Every entry of every index, first index winning on duplicates.
    pub fn iter_all_entries(&mut self) -> Result<Vec<(usize, IndexEntry)>> {
        let mut seen: HashSet<Key> = HashSet::new();
        let mut out = vec![];
        for (off, index) in self.indexes.iter_mut().enumerate() {
            for entry in index.iter_all_entries() {
                let entry = entry?;
                if seen.insert(entry.key.clone()) {
                    out.push((off, entry));
                }
            }
        }
        Ok(out)
    }

    pub fn iter_entries_prefix(&mut self, prefixes: &[Key]) -> Result<Vec<(usize, IndexEntry)>> {
        let mut seen: HashSet<Key> = HashSet::new();
        let mut out = vec![];
        for (off, index) in self.indexes.iter_mut().enumerate() {
            for entry in index.iter_entries_prefix(prefixes)? {
                if seen.insert(entry.key.clone()) {
                    out.push((off, entry));
                }
            }
        }
        Ok(out)
    }
}

#[cfg(test)]
#[path = "combined_test.rs"]
mod combined_test;

//! Module implement a bounded, single threaded LRU cache.
//!
//! Caches in this package are content addressed, keys embed a hash of
//! the cached bytes, so stale content is impossible and entries are
//! invalidated only by eviction.

use std::{collections::BTreeMap, collections::HashMap, hash::Hash};

struct Access<V> {
    seqno: u64,
    size: usize,
    value: V,
}

/// Least-recently-used cache bounded by entry count and, optionally,
/// by the aggregate byte footprint of its values.
pub struct Lru<K, V> {
    max_count: usize,
    max_bytes: usize, // ZERO means unbounded
    cur_bytes: usize,
    seqno: u64,
    entries: HashMap<K, Access<V>>,
    access: BTreeMap<u64, K>,
}

impl<K, V> Lru<K, V>
where
    K: Clone + Eq + Hash,
    V: Clone,
{
    pub fn new(max_count: usize, max_bytes: usize) -> Lru<K, V> {
        Lru {
            max_count,
            max_bytes,
            cur_bytes: 0,
            seqno: 0,
            entries: HashMap::new(),
            access: BTreeMap::new(),
        }
    }

    pub fn get(&mut self, key: &K) -> Option<V> {
        self.seqno += 1;
        let seqno = self.seqno;
        match self.entries.get_mut(key) {
            Some(acc) => {
                self.access.remove(&acc.seqno);
                acc.seqno = seqno;
                self.access.insert(seqno, key.clone());
                Some(acc.value.clone())
            }
            None => None,
        }
    }

    pub fn set(&mut self, key: K, value: V, size: usize) {
        self.seqno += 1;
        if let Some(old) = self.entries.remove(&key) {
            self.access.remove(&old.seqno);
            self.cur_bytes -= old.size;
        }
        let acc = Access {
            seqno: self.seqno,
            size,
            value,
        };
        self.cur_bytes += size;
        self.access.insert(self.seqno, key.clone());
        self.entries.insert(key, acc);
        self.evict();
    }

    pub fn remove(&mut self, key: &K) -> Option<V> {
        match self.entries.remove(key) {
            Some(acc) => {
                self.access.remove(&acc.seqno);
                self.cur_bytes -= acc.size;
                Some(acc.value)
            }
            None => None,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn footprint(&self) -> usize {
        self.cur_bytes
    }

    fn evict(&mut self) {
        while self.entries.len() > self.max_count
            || (self.max_bytes > 0 && self.cur_bytes > self.max_bytes && self.entries.len() > 1)
        {
            let seqno = match self.access.keys().next() {
                Some(seqno) => *seqno,
                None => break,
            };
            let key = self.access.remove(&seqno).unwrap();
            if let Some(acc) = self.entries.remove(&key) {
                self.cur_bytes -= acc.size;
            }
        }
    }
}

#[cfg(test)]
#[path = "lru_test.rs"]
mod lru_test;

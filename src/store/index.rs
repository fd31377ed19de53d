use std::{
    collections::{HashMap, HashSet},
    ffi,
};

use crate::{btree, Key, Result};

/// Where a record lives: which pack file, the block's byte range inside
/// it, the record's range inside the uncompressed block, and the graph
/// data the index carries alongside.
#[derive(Clone, Debug, PartialEq)]
pub struct Position {
    pub pack: ffi::OsString,
    pub block_start: u64,
    pub block_len: u64,
    pub start: usize,
    pub end: usize,
    pub sha1: String,
    pub parents: Vec<Key>,
}

/// Serialise an index value, `<block-start> <block-len> <rec-start>
/// <rec-end> <sha1>` in ascii decimals.
pub(crate) fn to_value(
    block_start: u64,
    block_len: u64,
    start: usize,
    end: usize,
    sha1: &str,
) -> Vec<u8> {
    format!("{} {} {} {} {}", block_start, block_len, start, end, sha1).into_bytes()
}

pub(crate) fn parse_value(value: &[u8]) -> Result<(u64, u64, usize, usize, String)> {
    let value = match std::str::from_utf8(value) {
        Ok(value) => value,
        Err(_) => return err_at!(CorruptIndex, msg: "index value not ascii"),
    };
    let fields: Vec<&str> = value.split(' ').collect();
    if fields.len() != 5 {
        return err_at!(CorruptIndex, msg: "index value holds {} fields", fields.len());
    }
    let block_start = err_at!(CorruptIndex, fields[0].parse::<u64>())?;
    let block_len = err_at!(CorruptIndex, fields[1].parse::<u64>())?;
    let start = err_at!(CorruptIndex, fields[2].parse::<usize>())?;
    let end = err_at!(CorruptIndex, fields[3].parse::<usize>())?;
    Ok((block_start, block_len, start, end, fields[4].to_string()))
}

/// One role's view over the indexes of every live pack, newest pack
/// first so its entries shadow older ones.
pub struct GcIndex {
    graph: bool,
    combined: btree::Combined,
    packs: Vec<ffi::OsString>,
}

impl GcIndex {
    pub fn new(graph: bool, indexes: Vec<btree::Index>, packs: Vec<ffi::OsString>) -> GcIndex {
        GcIndex {
            graph,
            combined: btree::Combined::new(indexes),
            packs,
        }
    }

    pub fn key_count(&self) -> usize {
        self.combined.key_count()
    }

    fn to_position(&self, off: usize, entry: &btree::IndexEntry) -> Result<Position> {
        let (block_start, block_len, start, end, sha1) = parse_value(&entry.value)?;
        let parents = match self.graph {
            true => entry.refs[0].clone(),
            false => vec![],
        };
        Ok(Position {
            pack: self.packs[off].clone(),
            block_start,
            block_len,
            start,
            end,
            sha1,
            parents,
        })
    }

    pub fn get(&mut self, key: &Key) -> Result<Option<Position>> {
        match self.combined.get(key)? {
            Some((off, entry)) => Ok(Some(self.to_position(off, &entry)?)),
            None => Ok(None),
        }
    }

    pub fn get_positions(&mut self, keys: &[Key]) -> Result<HashMap<Key, Position>> {
        let mut out = HashMap::new();
        for (off, entry) in self.combined.iter_entries(keys)?.into_iter() {
            let position = self.to_position(off, &entry)?;
            out.insert(entry.key, position);
        }
        Ok(out)
    }

    /// Graph lookup. Keys without an index entry are left out; ghosts
    /// are a caller-level concept.
    pub fn get_parent_map(&mut self, keys: &[Key]) -> Result<HashMap<Key, Vec<Key>>> {
        if !self.graph {
            return Ok(HashMap::new());
        }
        let mut out = HashMap::new();
        for (_, entry) in self.combined.iter_entries(keys)?.into_iter() {
            out.insert(entry.key, entry.refs[0].clone());
        }
        Ok(out)
    }

    pub fn keys(&mut self) -> Result<Vec<Key>> {
        let entries = self.combined.iter_all_entries()?;
        Ok(entries.into_iter().map(|(_, e)| e.key).collect())
    }

    pub fn all_keyed_positions(&mut self) -> Result<Vec<(Key, Position)>> {
        let mut out = vec![];
        for (off, entry) in self.combined.iter_all_entries()?.into_iter() {
            let position = self.to_position(off, &entry)?;
            out.push((entry.key, position));
        }
        Ok(out)
    }

    pub fn iter_entries_prefix(&mut self, prefixes: &[Key]) -> Result<Vec<(Key, Position)>> {
        let mut out = vec![];
        for (off, entry) in self.combined.iter_entries_prefix(prefixes)?.into_iter() {
            let position = self.to_position(off, &entry)?;
            out.push((entry.key, position));
        }
        Ok(out)
    }
}

/// Track keys referenced as parents but not yet added, the
/// missing-parents set of an in-progress insert.
#[derive(Default)]
pub struct KeyRefs {
    referenced: HashSet<Key>,
    added: HashSet<Key>,
}

impl KeyRefs {
    pub fn new() -> KeyRefs {
        KeyRefs::default()
    }

    pub fn add_key(&mut self, key: &Key) {
        self.added.insert(key.clone());
        self.referenced.remove(key);
    }

    pub fn add_references(&mut self, parents: &[Key]) {
        for parent in parents.iter() {
            if !self.added.contains(parent) {
                self.referenced.insert(parent.clone());
            }
        }
    }

    /// Referenced keys never seen as adds, in sorted order.
    pub fn missing_keys(&self) -> Vec<Key> {
        let mut keys: Vec<Key> = self.referenced.iter().cloned().collect();
        keys.sort();
        keys
    }
}

#[cfg(test)]
#[path = "index_test.rs"]
mod index_test;

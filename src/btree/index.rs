use fs2::FileExt;

use std::{
    collections::HashSet,
    ffi, fs,
    io::{Read, Seek, SeekFrom},
    rc::Rc,
    vec,
};

use crate::{
    btree::{self, node, Config, IndexEntry, Node, PageCache},
    read_file, util, Key, Result,
};

/// Read-only handle over one btree index file.
///
/// Pages are read on demand, inflated, and parked in the shared page
/// cache. The file carries a shared advisory lock for the lifetime of
/// the handle.
pub struct Index {
    loc: ffi::OsString,
    fd: fs::File,
    config: Config,
    len: usize,
    row_offsets: Vec<usize>,
    cache: PageCache,
}

impl Drop for Index {
    fn drop(&mut self) {
        if let Err(err) = self.fd.unlock() {
            panic!("fail to unlock index reader {:?}: {}", self.loc, err)
        }
    }
}

impl Index {
    pub fn open(loc: &ffi::OsStr, cache: PageCache) -> Result<Index> {
        let mut fd = util::files::open_file_r(loc)?;
        err_at!(IOError, fd.lock_shared(), "fail read lock for {:?}", loc)?;

        let header = read_file!(
            &mut fd,
            SeekFrom::Start(0),
            btree::RESERVED_HEADER_BYTES,
            "read index header"
        )?;
        let (config, len, row_lengths) = parse_header(&header, loc)?;

        let mut row_offsets = vec![0];
        for n in row_lengths.iter() {
            row_offsets.push(row_offsets[row_offsets.len() - 1] + n);
        }

        Ok(Index {
            loc: loc.to_os_string(),
            fd,
            config,
            len,
            row_offsets,
            cache,
        })
    }

    pub fn as_loc(&self) -> &ffi::OsStr {
        &self.loc
    }

    /// Total entries in this index, from the header.
    pub fn key_count(&self) -> usize {
        self.len
    }

    pub fn key_elements(&self) -> usize {
        self.config.key_elements
    }

    pub fn node_ref_lists(&self) -> usize {
        self.config.node_ref_lists
    }

    /// Look up a single key.
    pub fn get(&mut self, key: &Key) -> Result<Option<IndexEntry>> {
        let n_rows = self.row_offsets.len() - 1;
        if n_rows == 0 {
            return Ok(None);
        }
        let mut page = 0;
        loop {
            let node = self.read_page(page)?;
            match node.as_ref() {
                Node::Internal { offset, keys } => {
                    page = offset + keys.partition_point(|k| k <= key);
                }
                Node::Leaf { entries } => {
                    let entry = match entries.binary_search_by(|e| e.key.cmp(key)) {
                        Ok(off) => Some(entries[off].clone()),
                        Err(_) => None,
                    };
                    break Ok(entry);
                }
            }
        }
    }

    /// Entries for the requested keys, in request order, missing keys
    /// skipped, duplicates collapsed.
    pub fn iter_entries(&mut self, keys: &[Key]) -> Result<Vec<IndexEntry>> {
        let mut seen: HashSet<&Key> = HashSet::new();
        let mut entries = vec![];
        for key in keys.iter() {
            if !seen.insert(key) {
                continue;
            }
            if let Some(entry) = self.get(key)? {
                entries.push(entry);
            }
        }
        Ok(entries)
    }

    /// Lazily iterate every entry, in sorted key order.
    pub fn iter_all_entries(&mut self) -> IterAll {
        let (page, upto) = self.leaf_row();
        IterAll {
            index: self,
            page,
            upto,
            entries: vec![].into_iter(),
        }
    }

    /// Entries whose key starts with any of `prefixes`. A prefix with
    /// the full element count is an exact lookup.
    pub fn iter_entries_prefix(&mut self, prefixes: &[Key]) -> Result<Vec<IndexEntry>> {
        let mut seen: HashSet<Key> = HashSet::new();
        let mut out = vec![];
        for prefix in prefixes.iter() {
            if prefix.len() > self.config.key_elements {
                return err_at!(InvalidFile, msg: "prefix holds {} elements", prefix.len());
            }
            if prefix.len() == self.config.key_elements {
                if let Some(entry) = self.get(prefix)? {
                    if seen.insert(entry.key.clone()) {
                        out.push(entry);
                    }
                }
                continue;
            }
            self.scan_prefix(prefix, &mut seen, &mut out)?;
        }
        Ok(out)
    }

    fn scan_prefix(
        &mut self,
        prefix: &Key,
        seen: &mut HashSet<Key>,
        out: &mut Vec<IndexEntry>,
    ) -> Result<()> {
        let n_rows = self.row_offsets.len() - 1;
        if n_rows == 0 {
            return Ok(());
        }
        // descend to the first leaf that can hold the prefix.
        let mut page = 0;
        let page = loop {
            let node = self.read_page(page)?;
            match node.as_ref() {
                Node::Internal { offset, keys } => {
                    page = offset + keys.partition_point(|k| k <= prefix);
                }
                Node::Leaf { .. } => break page,
            }
        };
        // walk leaves forward while keys still carry the prefix.
        let (_, upto) = self.leaf_row();
        for page in page..upto {
            let node = self.read_page(page)?;
            let entries = match node.as_ref() {
                Node::Leaf { entries } => entries,
                Node::Internal { .. } => {
                    return err_at!(CorruptIndex, msg: "internal page in leaf row")
                }
            };
            for entry in entries.iter() {
                if entry.key.as_slice() < prefix.as_slice() {
                    continue;
                }
                if !starts_with(&entry.key, prefix) {
                    return Ok(());
                }
                if seen.insert(entry.key.clone()) {
                    out.push(entry.clone());
                }
            }
        }
        Ok(())
    }

    // leaf row page range, as (start, upto).
    fn leaf_row(&self) -> (usize, usize) {
        let n_rows = self.row_offsets.len() - 1;
        match n_rows {
            0 => (0, 0),
            n => (self.row_offsets[n - 1], self.row_offsets[n]),
        }
    }

    fn read_page(&mut self, page: usize) -> Result<Rc<Node>> {
        let cache_key = (self.loc.clone(), page);
        if let Some(node) = self.cache.borrow_mut().get(&cache_key) {
            return Ok(node);
        }

        let (seek, n) = match page {
            0 => (
                btree::RESERVED_HEADER_BYTES,
                btree::PAGE_SIZE - btree::RESERVED_HEADER_BYTES,
            ),
            p => (p * btree::PAGE_SIZE, btree::PAGE_SIZE),
        };
        let fd = &mut self.fd;
        let data = read_file!(fd, SeekFrom::Start(seek as u64), n, "read index page")?;

        let body = {
            let mut buf = vec![];
            let mut dec = flate2::read::ZlibDecoder::new(data.as_slice());
            err_at!(CorruptIndex, dec.read_to_end(&mut buf), "page {} of {:?}", page, self.loc)?;
            buf
        };
        let node = Rc::new(node::parse_node(
            &body,
            self.config.key_elements,
            self.config.node_ref_lists,
        )?);
        let footprint = node.footprint();
        self.cache.borrow_mut().set(cache_key, Rc::clone(&node), footprint);
        Ok(node)
    }
}

/// Lazy iterator over every entry of an index.
pub struct IterAll<'a> {
    index: &'a mut Index,
    page: usize,
    upto: usize,
    entries: vec::IntoIter<IndexEntry>,
}

impl<'a> Iterator for IterAll<'a> {
    type Item = Result<IndexEntry>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(entry) = self.entries.next() {
                return Some(Ok(entry));
            }
            if self.page >= self.upto {
                return None;
            }
            let page = self.page;
            self.page += 1;
            match self.index.read_page(page) {
                Ok(node) => match node.as_ref() {
                    Node::Leaf { entries } => self.entries = entries.clone().into_iter(),
                    Node::Internal { .. } => {
                        let prefix = format!("{}:{}", file!(), line!());
                        let msg = "internal page in leaf row".to_string();
                        return Some(Err(crate::Error::CorruptIndex(prefix, msg)));
                    }
                },
                Err(err) => return Some(Err(err)),
            }
        }
    }
}

fn parse_header(
    header: &[u8],
    loc: &ffi::OsStr,
) -> Result<(Config, usize, Vec<usize>)> {
    if !header.starts_with(btree::SIGNATURE) {
        return err_at!(UpgradeRequired, msg: "unknown index format in {:?}", loc);
    }
    let mut node_ref_lists = None;
    let mut key_elements = None;
    let mut len = None;
    let mut row_lengths = None;
    for line in header[btree::SIGNATURE.len()..].split(|b| *b == b'\n') {
        if line.is_empty() || line[0] == 0 {
            break;
        }
        let line = String::from_utf8_lossy(line);
        match line.split_once('=') {
            Some(("node_ref_lists", v)) => node_ref_lists = v.parse::<usize>().ok(),
            Some(("key_elements", v)) => key_elements = v.parse::<usize>().ok(),
            Some(("len", v)) => len = v.parse::<usize>().ok(),
            Some(("row_lengths", "")) => row_lengths = Some(vec![]),
            Some(("row_lengths", v)) => {
                let mut lengths = vec![];
                for field in v.split(',') {
                    match field.parse::<usize>() {
                        Ok(n) => lengths.push(n),
                        Err(_) => return err_at!(CorruptIndex, msg: "row_lengths {:?}", v),
                    }
                }
                row_lengths = Some(lengths);
            }
            _ => return err_at!(CorruptIndex, msg: "bad header line {:?}", line),
        }
    }
    match (node_ref_lists, key_elements, len, row_lengths) {
        (Some(r), Some(k), Some(l), Some(rows)) => Ok((Config::new(k, r), l, rows)),
        _ => err_at!(CorruptIndex, msg: "incomplete index header in {:?}", loc),
    }
}

fn starts_with(key: &Key, prefix: &Key) -> bool {
    key.len() >= prefix.len() && &key[..prefix.len()] == prefix.as_slice()
}

#[cfg(test)]
#[path = "index_test.rs"]
mod index_test;

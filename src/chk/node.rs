use std::collections::BTreeMap;

use crate::{chk::SearchKey, util, Key, Result};

/// Link from an internal node to a child, either resolved into the
/// map's arena or still a content hash in the backing store.
#[derive(Clone, Debug)]
pub enum Child {
    Hash(String),
    Arena(usize),
}

impl Child {
    pub fn as_hash(&self) -> Option<&str> {
        match self {
            Child::Hash(hash) => Some(hash),
            Child::Arena(_) => None,
        }
    }
}

#[derive(Clone, Debug)]
pub enum Node {
    Leaf(LeafNode),
    Internal(InternalNode),
}

impl Node {
    /// Parse serialised node bytes. `key` is the content hash the bytes
    /// were fetched under.
    pub fn deserialise(bytes: &[u8], key: &str) -> Result<Node> {
        if bytes.starts_with(b"chkleaf:\n") {
            Ok(Node::Leaf(LeafNode::deserialise(&bytes[9..], key)?))
        } else if bytes.starts_with(b"chknode:\n") {
            Ok(Node::Internal(InternalNode::deserialise(&bytes[9..], key)?))
        } else {
            err_at!(CorruptBlock, msg: "unknown chk node under {}", key)
        }
    }

    pub fn to_key(&self) -> Option<String> {
        match self {
            Node::Leaf(leaf) => leaf.key.clone(),
            Node::Internal(node) => node.key.clone(),
        }
    }

    /// Number of items in this subtree.
    pub fn len(&self) -> usize {
        match self {
            Node::Leaf(leaf) => leaf.items.len(),
            Node::Internal(node) => node.len,
        }
    }
}

/// Leaf node, holds the items themselves.
#[derive(Clone, Debug, Default)]
pub struct LeafNode {
    pub maximum_size: usize,
    pub key_width: usize,
    pub items: BTreeMap<Key, Vec<u8>>,
    /// Content hash once saved or loaded, None while dirty.
    pub key: Option<String>,
}

impl LeafNode {
    pub fn new(maximum_size: usize, key_width: usize) -> LeafNode {
        LeafNode {
            maximum_size,
            key_width,
            items: BTreeMap::new(),
            key: None,
        }
    }

    /// Common prefix of the serialised (`\0` joined) item keys. None
    /// when the leaf is empty.
    pub fn common_serialised_prefix(&self) -> Option<Vec<u8>> {
        let mut prefix: Option<Vec<u8>> = None;
        for key in self.items.keys() {
            let skey = serialise_key(key);
            prefix = Some(match prefix {
                None => skey,
                Some(p) => util::common_prefix(&p, &skey).to_vec(),
            });
        }
        prefix
    }

    /// Common prefix of the items' search keys. None when empty.
    pub fn search_prefix(&self, search_key: SearchKey) -> Option<Vec<u8>> {
        let mut prefix: Option<Vec<u8>> = None;
        for key in self.items.keys() {
            let skey = search_key.map(key);
            prefix = Some(match prefix {
                None => skey,
                Some(p) => util::common_prefix(&p, &skey).to_vec(),
            });
        }
        prefix
    }

    /// True when every item maps to the same search key, such a leaf may
    /// grow past its budget because no split can separate the items.
    pub fn search_keys_identical(&self, search_key: SearchKey) -> bool {
        let mut keys = self.items.keys().map(|k| search_key.map(k));
        match keys.next() {
            None => true,
            Some(first) => keys.all(|k| k == first),
        }
    }

    /// Serialised size of this leaf, tracking the on-disk form exactly.
    pub fn current_size(&self) -> usize {
        let prefix_len = self.common_serialised_prefix().map(|p| p.len()).unwrap_or(0);
        let mut bytes_for_items = 0;
        for (key, value) in self.items.iter() {
            let n_lines = count_lines(value);
            bytes_for_items += serialise_key(key).len() - prefix_len
                + 1
                + decimal_width(n_lines)
                + 1
                + value.len()
                + 1;
        }
        9 + decimal_width(self.maximum_size)
            + 1
            + decimal_width(self.key_width)
            + 1
            + decimal_width(self.items.len())
            + 1
            + prefix_len
            + 1
            + bytes_for_items
    }

    pub fn serialise(&self) -> Vec<u8> {
        let prefix = self.common_serialised_prefix().unwrap_or_default();
        let mut out = vec![];
        out.extend_from_slice(b"chkleaf:\n");
        out.extend_from_slice(
            format!("{}\n{}\n{}\n", self.maximum_size, self.key_width, self.items.len())
                .as_bytes(),
        );
        out.extend_from_slice(&prefix);
        out.push(b'\n');
        for (key, value) in self.items.iter() {
            let skey = serialise_key(key);
            out.extend_from_slice(&skey[prefix.len()..]);
            out.push(0);
            out.extend_from_slice(format!("{}\n", count_lines(value)).as_bytes());
            out.extend_from_slice(value);
            out.push(b'\n');
        }
        out
    }

    // body excludes the "chkleaf:\n" tag.
    fn deserialise(body: &[u8], key: &str) -> Result<LeafNode> {
        let mut lines = LineReader::new(body);
        let maximum_size = lines.decimal_line("chkleaf maximum_size")?;
        let key_width = lines.decimal_line("chkleaf key_width")?;
        let item_count = lines.decimal_line("chkleaf item_count")?;
        let prefix = lines.line("chkleaf prefix")?.to_vec();

        let mut items = BTreeMap::new();
        for _i in 0..item_count {
            let line = lines.line("chkleaf item")?;
            let at = match line.iter().rposition(|b| *b == 0) {
                Some(at) => at,
                None => return err_at!(CorruptBlock, msg: "chkleaf item misses \\0"),
            };
            let (suffix, count) = (&line[..at], &line[at + 1..]);
            let n_lines = decimal_bytes(count, "chkleaf line count")?;
            let mut value: Vec<u8> = vec![];
            for j in 0..n_lines {
                if j > 0 {
                    value.push(b'\n');
                }
                value.extend_from_slice(lines.line("chkleaf value")?);
            }

            let mut serialised = prefix.clone();
            serialised.extend_from_slice(suffix);
            let ikey = deserialise_key(&serialised);
            if ikey.len() != key_width {
                return err_at!(
                    CorruptBlock, msg: "chkleaf key of width {}/{}", ikey.len(), key_width
                );
            }
            items.insert(ikey, value);
        }
        if items.len() != item_count {
            return err_at!(CorruptBlock, msg: "chkleaf holds {} items", items.len());
        }

        Ok(LeafNode {
            maximum_size,
            key_width,
            items,
            key: Some(key.to_string()),
        })
    }
}

/// Internal node, a fan-out bounded prefix partition. Every child is
/// filed under the full search-key prefix it covers; all the prefixes
/// share this node's `search_prefix` and are one byte longer.
#[derive(Clone, Debug)]
pub struct InternalNode {
    pub maximum_size: usize,
    pub key_width: usize,
    /// Total items in the subtree.
    pub len: usize,
    pub search_prefix: Vec<u8>,
    pub items: BTreeMap<Vec<u8>, Child>,
    pub key: Option<String>,
}

impl InternalNode {
    pub fn new(
        maximum_size: usize,
        key_width: usize,
        search_prefix: Vec<u8>,
    ) -> InternalNode {
        InternalNode {
            maximum_size,
            key_width,
            len: 0,
            search_prefix,
            items: BTreeMap::new(),
            key: None,
        }
    }

    /// Width of the child prefixes under this node.
    pub fn node_width(&self) -> usize {
        self.search_prefix.len() + 1
    }

    /// Serialise with every child resolved to its content hash.
    pub fn serialise(&self, child_keys: &BTreeMap<Vec<u8>, String>) -> Result<Vec<u8>> {
        let mut out = vec![];
        out.extend_from_slice(b"chknode:\n");
        out.extend_from_slice(
            format!("{}\n{}\n{}\n", self.maximum_size, self.key_width, self.len).as_bytes(),
        );
        out.extend_from_slice(&self.search_prefix);
        out.push(b'\n');
        for (prefix, _) in self.items.iter() {
            let hash = match child_keys.get(prefix) {
                Some(hash) => hash,
                None => return err_at!(Fatal, msg: "unsaved child in chknode"),
            };
            if !prefix.starts_with(&self.search_prefix) {
                return err_at!(Fatal, msg: "child prefix outside node prefix");
            }
            out.extend_from_slice(&prefix[self.search_prefix.len()..]);
            out.push(0);
            out.extend_from_slice(hash.as_bytes());
            out.push(b'\n');
        }
        Ok(out)
    }

    // body excludes the "chknode:\n" tag.
    fn deserialise(body: &[u8], key: &str) -> Result<InternalNode> {
        let mut lines = LineReader::new(body);
        let maximum_size = lines.decimal_line("chknode maximum_size")?;
        let key_width = lines.decimal_line("chknode key_width")?;
        let len = lines.decimal_line("chknode item_count")?;
        let search_prefix = lines.line("chknode prefix")?.to_vec();

        let mut items = BTreeMap::new();
        while let Some(line) = lines.try_line() {
            let at = match line.iter().rposition(|b| *b == 0) {
                Some(at) => at,
                None => return err_at!(CorruptBlock, msg: "chknode child misses \\0"),
            };
            let mut prefix = search_prefix.clone();
            prefix.extend_from_slice(&line[..at]);
            let hash = match std::str::from_utf8(&line[at + 1..]) {
                Ok(hash) => hash.to_string(),
                Err(_) => return err_at!(CorruptBlock, msg: "chknode child hash"),
            };
            items.insert(prefix, Child::Hash(hash));
        }
        if items.is_empty() {
            return err_at!(CorruptBlock, msg: "chknode without children");
        }

        Ok(InternalNode {
            maximum_size,
            key_width,
            len,
            search_prefix,
            items,
            key: Some(key.to_string()),
        })
    }
}

/// Join key elements with `\0`.
pub(crate) fn serialise_key(key: &Key) -> Vec<u8> {
    let mut out = vec![];
    for (i, element) in key.iter().enumerate() {
        if i > 0 {
            out.push(0);
        }
        out.extend_from_slice(element);
    }
    out
}

pub(crate) fn deserialise_key(bytes: &[u8]) -> Key {
    bytes.split(|b| *b == 0).map(|e| e.to_vec()).collect()
}

fn count_lines(value: &[u8]) -> usize {
    value.iter().filter(|b| **b == b'\n').count() + 1
}

fn decimal_width(mut val: usize) -> usize {
    let mut width = 1;
    while val >= 10 {
        val /= 10;
        width += 1;
    }
    width
}

fn decimal_bytes(bytes: &[u8], msg: &str) -> Result<usize> {
    if bytes.is_empty() {
        return err_at!(CorruptBlock, msg: "{}: empty", msg);
    }
    let mut val = 0;
    for byte in bytes.iter() {
        match byte {
            b'0'..=b'9' => val = val * 10 + ((byte - b'0') as usize),
            _ => return err_at!(CorruptBlock, msg: "{}: bad digit", msg),
        }
    }
    Ok(val)
}

struct LineReader<'a> {
    body: &'a [u8],
}

impl<'a> LineReader<'a> {
    fn new(body: &'a [u8]) -> LineReader<'a> {
        LineReader { body }
    }

    fn line(&mut self, msg: &str) -> Result<&'a [u8]> {
        match self.try_line() {
            Some(line) => Ok(line),
            None => err_at!(CorruptBlock, msg: "{}: truncated", msg),
        }
    }

    fn try_line(&mut self) -> Option<&'a [u8]> {
        if self.body.is_empty() {
            return None;
        }
        match self.body.iter().position(|b| *b == b'\n') {
            Some(pos) => {
                let line = &self.body[..pos];
                self.body = &self.body[pos + 1..];
                Some(line)
            }
            None => {
                let line = self.body;
                self.body = &self.body[self.body.len()..];
                Some(line)
            }
        }
    }

    fn decimal_line(&mut self, msg: &str) -> Result<usize> {
        let line = self.line(msg)?;
        decimal_bytes(line, msg)
    }
}

#[cfg(test)]
#[path = "node_test.rs"]
mod node_test;

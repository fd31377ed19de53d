//! Module implement a persistent, content-hash-keyed radix map.
//!
//! A [CHKMap] stores `key tuple -> bytes` items in a trie of leaf and
//! internal nodes. Node identity is the SHA-1 of the node's serialised
//! bytes, so any edit produces new hashes along the affected spine while
//! unchanged siblings are shared between revisions of the map. The same
//! multiset of items always serialises to the same root hash, whatever
//! order the items were inserted in; tree surgery (splitting overflowing
//! leaves, collapsing shrunken subtrees) maintains that canonical form.
//!
//! Trie descent is driven by a search key derived from the item key by a
//! configurable [SearchKey] function; the hashed flavours give uniform
//! fan-out over arbitrary key distributions.
//!
//! Nodes live in a per-map arena, children are either arena indexes or
//! unresolved content hashes loaded on demand from the backing [Store].

use crc::{Crc, CRC_32_ISO_HDLC};

use std::collections::HashMap;

use crate::{util, Key, Result};

mod diff;
mod map;
mod node;

pub use diff::{iter_interesting_nodes, InterestingNode};
pub use map::CHKMap;
pub(crate) use node::{Child, InternalNode, LeafNode, Node};

/// Default byte budget a leaf may serialise to before it splits.
pub const MAXIMUM_SIZE: usize = 4096;

/// Zlib-polynomial CRC-32 used by the hashed search keys.
const CRC32: Crc<u32> = Crc::<u32>::new(&CRC_32_ISO_HDLC);

/// Function deriving the trie descent string from an item key.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum SearchKey {
    /// Key elements joined with `\0`, descent follows the raw bytes.
    Plain,
    /// Eight upper-case hex digits of each element's CRC-32, joined
    /// with `\0`. Uniform 4-bit fan-out per character.
    Hash16Way,
    /// The raw big-endian CRC-32 bytes of each element, joined with
    /// `\0`, newline substituted so node serialisations stay line
    /// oriented. 8-bit fan-out per byte.
    Hash255Way,
}

impl SearchKey {
    pub fn map(&self, key: &Key) -> Vec<u8> {
        match self {
            SearchKey::Plain => {
                let mut out = vec![];
                for (i, element) in key.iter().enumerate() {
                    if i > 0 {
                        out.push(0);
                    }
                    out.extend_from_slice(element);
                }
                out
            }
            SearchKey::Hash16Way => {
                let mut out = vec![];
                for (i, element) in key.iter().enumerate() {
                    if i > 0 {
                        out.push(0);
                    }
                    let crc = CRC32.checksum(element);
                    out.extend_from_slice(format!("{:08X}", crc).as_bytes());
                }
                out
            }
            SearchKey::Hash255Way => {
                let mut out = vec![];
                for (i, element) in key.iter().enumerate() {
                    if i > 0 {
                        out.push(0);
                    }
                    let crc = CRC32.checksum(element);
                    out.extend_from_slice(&crc.to_be_bytes());
                }
                for byte in out.iter_mut() {
                    if *byte == b'\n' {
                        *byte = b'_';
                    }
                }
                out
            }
        }
    }
}

/// Configuration for a [CHKMap].
#[derive(Clone, Debug)]
pub struct Config {
    /// Byte budget for a serialised leaf, zero disables splitting. A
    /// single item larger than the budget sits alone in its leaf.
    pub maximum_size: usize,
    /// Number of elements in every item key.
    pub key_width: usize,
    /// Search-key function for trie descent.
    pub search_key: SearchKey,
}

impl Config {
    pub fn new(maximum_size: usize, key_width: usize) -> Config {
        Config {
            maximum_size,
            key_width,
            search_key: SearchKey::Plain,
        }
    }

    pub fn set_search_key(&mut self, search_key: SearchKey) -> &mut Self {
        self.search_key = search_key;
        self
    }
}

/// Backing store for chk nodes. Nodes are opaque byte strings addressed
/// by `sha1:<hex>` of their content.
pub trait Store {
    fn get_chk(&mut self, key: &str) -> Result<Vec<u8>>;
    fn put_chk(&mut self, bytes: &[u8]) -> Result<String>;
}

/// In-memory [Store], content addressed.
#[derive(Default)]
pub struct MemStore {
    nodes: HashMap<String, Vec<u8>>,
}

impl MemStore {
    pub fn new() -> MemStore {
        MemStore::default()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn contains(&self, key: &str) -> bool {
        self.nodes.contains_key(key)
    }
}

impl Store for MemStore {
    fn get_chk(&mut self, key: &str) -> Result<Vec<u8>> {
        match self.nodes.get(key) {
            Some(bytes) => Ok(bytes.clone()),
            None => err_at!(KeyNotFound, msg: "chk {}", key),
        }
    }

    fn put_chk(&mut self, bytes: &[u8]) -> Result<String> {
        let key = format!("sha1:{}", util::sha1_hex(bytes));
        self.nodes.insert(key.clone(), bytes.to_vec());
        Ok(key)
    }
}

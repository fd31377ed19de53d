use std::collections::BTreeMap;

use crate::{
    chk::{
        node::{Child, InternalNode, LeafNode, Node},
        Config, Store,
    },
    util, Key, Result,
};

// Outcome of mapping a key into a subtree.
enum MapResult {
    // subtree absorbed the change.
    Same,
    // subtree was replaced wholesale (a new parent grew above it).
    Replaced(usize),
    // a leaf burst into the given (prefix, node) groups; the common
    // search prefix of the groups rides along.
    Split(Vec<u8>, Vec<(Vec<u8>, usize)>),
}

/// Persistent radix map, copy-on-write over a content-addressed store.
///
/// All node surgery happens in an in-memory arena; [CHKMap::save]
/// flushes the dirty spine bottom-up and returns the new root hash.
pub struct CHKMap {
    pub(crate) config: Config,
    pub(crate) arena: Vec<Node>,
    pub(crate) root: usize,
}

impl CHKMap {
    /// Fresh empty map.
    pub fn new(config: Config) -> CHKMap {
        let root = LeafNode::new(config.maximum_size, config.key_width);
        CHKMap {
            config,
            arena: vec![Node::Leaf(root)],
            root: 0,
        }
    }

    /// Open the map rooted at `root_key`. The node carries its own
    /// maximum-size and key-width, `config` supplies the search-key
    /// function.
    pub fn from_root(store: &mut dyn Store, root_key: &str, config: Config) -> Result<CHKMap> {
        let bytes = store.get_chk(root_key)?;
        let node = Node::deserialise(&bytes, root_key)?;
        let config = {
            let mut config = config;
            match &node {
                Node::Leaf(leaf) => {
                    config.maximum_size = leaf.maximum_size;
                    config.key_width = leaf.key_width;
                }
                Node::Internal(internal) => {
                    config.maximum_size = internal.maximum_size;
                    config.key_width = internal.key_width;
                }
            }
            config
        };
        Ok(CHKMap {
            config,
            arena: vec![node],
            root: 0,
        })
    }

    pub fn as_config(&self) -> &Config {
        &self.config
    }

    /// Root hash, available when the map has been saved and not mutated
    /// since.
    pub fn to_key(&self) -> Option<String> {
        self.arena[self.root].to_key()
    }

    /// Number of items in the map.
    pub fn len(&self) -> usize {
        self.arena[self.root].len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Insert or update one item.
    pub fn map(&mut self, store: &mut dyn Store, key: &Key, value: &[u8]) -> Result<()> {
        if key.len() != self.config.key_width {
            return err_at!(
                InvalidFile, msg: "key of width {}/{}", key.len(), self.config.key_width
            );
        }
        match self.map_in(store, self.root, key, value)? {
            MapResult::Same => Ok(()),
            MapResult::Replaced(idx) => {
                self.root = idx;
                Ok(())
            }
            MapResult::Split(prefix, details) => {
                let mut node = InternalNode::new(
                    self.config.maximum_size,
                    self.config.key_width,
                    prefix,
                );
                for (child_prefix, child_idx) in details.into_iter() {
                    node.len += self.arena[child_idx].len();
                    node.items.insert(child_prefix, Child::Arena(child_idx));
                }
                self.root = self.push(Node::Internal(node));
                Ok(())
            }
        }
    }

    /// Delete one item. Unmapping an absent key is a KeyNotFound error.
    pub fn unmap(&mut self, store: &mut dyn Store, key: &Key) -> Result<()> {
        match &mut self.arena[self.root] {
            Node::Leaf(leaf) => match leaf.items.remove(key) {
                Some(_) => {
                    leaf.key = None;
                    Ok(())
                }
                None => err_at!(KeyNotFound, msg: "unmap {:?}", key),
            },
            Node::Internal(_) => {
                if let Some(idx) = self.unmap_in(store, self.root, key)? {
                    self.root = idx;
                }
                Ok(())
            }
        }
    }

    /// Value stored under `key`.
    pub fn get(&mut self, store: &mut dyn Store, key: &Key) -> Result<Option<Vec<u8>>> {
        let search_key = self.config.search_key.map(key);
        let mut idx = self.root;
        loop {
            match &self.arena[idx] {
                Node::Leaf(leaf) => break Ok(leaf.items.get(key).cloned()),
                Node::Internal(node) => {
                    let prefix = pad_prefix(&search_key, node.node_width());
                    match node.items.get(&prefix) {
                        None => break Ok(None),
                        Some(_) => idx = self.load_child(store, idx, &prefix)?,
                    }
                }
            }
        }
    }

    /// Every item, ordered by search key.
    pub fn iter_items(&mut self, store: &mut dyn Store) -> Result<Vec<(Key, Vec<u8>)>> {
        let mut out = vec![];
        self.collect_items(store, self.root, &mut out)?;
        Ok(out)
    }

    /// Flush dirty nodes bottom-up, return the new root hash.
    pub fn save(&mut self, store: &mut dyn Store) -> Result<String> {
        self.save_node(store, self.root)
    }

    /// Render the tree for tests and debugging, nodes by prefix then
    /// leaf items, two-space indent per level.
    pub fn to_dump_tree(&mut self, store: &mut dyn Store) -> Result<String> {
        let mut out = String::new();
        self.dump_node(store, self.root, b"", 0, &mut out)?;
        Ok(out)
    }

    fn push(&mut self, node: Node) -> usize {
        self.arena.push(node);
        self.arena.len() - 1
    }

    // Resolve the child under `prefix` of the internal node at `idx`
    // into the arena.
    pub(crate) fn load_child(&mut self, store: &mut dyn Store, idx: usize, prefix: &[u8]) -> Result<usize> {
        let hash = match &self.arena[idx] {
            Node::Internal(node) => match node.items.get(prefix) {
                Some(Child::Arena(child)) => return Ok(*child),
                Some(Child::Hash(hash)) => hash.clone(),
                None => return err_at!(Fatal, msg: "no child under prefix"),
            },
            Node::Leaf(_) => return err_at!(Fatal, msg: "leaf has no children"),
        };
        let bytes = store.get_chk(&hash)?;
        let child = self.push(Node::deserialise(&bytes, &hash)?);
        match &mut self.arena[idx] {
            Node::Internal(node) => {
                node.items.insert(prefix.to_vec(), Child::Arena(child));
            }
            Node::Leaf(_) => unreachable!(),
        }
        Ok(child)
    }

    fn map_in(
        &mut self,
        store: &mut dyn Store,
        idx: usize,
        key: &Key,
        value: &[u8],
    ) -> Result<MapResult> {
        match &self.arena[idx] {
            Node::Leaf(_) => self.map_in_leaf(store, idx, key, value),
            Node::Internal(_) => self.map_in_internal(store, idx, key, value),
        }
    }

    fn map_in_leaf(
        &mut self,
        store: &mut dyn Store,
        idx: usize,
        key: &Key,
        value: &[u8],
    ) -> Result<MapResult> {
        let search = self.config.search_key;
        let leaf = match &mut self.arena[idx] {
            Node::Leaf(leaf) => leaf,
            Node::Internal(_) => unreachable!(),
        };
        leaf.key = None;
        leaf.items.insert(key.clone(), value.to_vec());

        let oversize = leaf.items.len() > 1
            && leaf.maximum_size != 0
            && leaf.current_size() > leaf.maximum_size;
        if !oversize || leaf.search_keys_identical(search) {
            return Ok(MapResult::Same);
        }

        // split: group under the shortest prefix giving >= 2 buckets,
        // one byte past the common search prefix.
        let common = leaf.search_prefix(search).unwrap_or_default();
        let split_at = common.len() + 1;
        let items = std::mem::take(&mut leaf.items);

        let mut groups: BTreeMap<Vec<u8>, usize> = BTreeMap::new();
        for (ikey, ivalue) in items.into_iter() {
            let prefix = pad_prefix(&search.map(&ikey), split_at);
            let child = match groups.get(&prefix) {
                Some(child) => *child,
                None => {
                    let node = LeafNode::new(self.config.maximum_size, self.config.key_width);
                    let child = self.push(Node::Leaf(node));
                    groups.insert(prefix.clone(), child);
                    child
                }
            };
            // the bucket may already have burst into an internal node,
            // dispatch rather than assuming a leaf.
            match self.map_in(store, child, &ikey, &ivalue)? {
                MapResult::Same => (),
                MapResult::Split(sub_common, sub_details) => {
                    // the bucket itself burst, wrap it the same way an
                    // internal parent would.
                    let mut node = InternalNode::new(
                        self.config.maximum_size,
                        self.config.key_width,
                        sub_common,
                    );
                    for (sub_prefix, sub_idx) in sub_details.into_iter() {
                        node.len += self.arena[sub_idx].len();
                        node.items.insert(sub_prefix, Child::Arena(sub_idx));
                    }
                    let wrapped = self.push(Node::Internal(node));
                    groups.insert(prefix.clone(), wrapped);
                }
                MapResult::Replaced(new_idx) => {
                    groups.insert(prefix.clone(), new_idx);
                }
            }
        }
        Ok(MapResult::Split(common, groups.into_iter().collect()))
    }

    fn map_in_internal(
        &mut self,
        store: &mut dyn Store,
        idx: usize,
        key: &Key,
        value: &[u8],
    ) -> Result<MapResult> {
        let search_key = self.config.search_key.map(key);
        let (node_prefix, node_width) = match &self.arena[idx] {
            Node::Internal(node) => (node.search_prefix.clone(), node.node_width()),
            Node::Leaf(_) => unreachable!(),
        };

        if !search_key.starts_with(&node_prefix) {
            // this key does not live under the node's prefix; grow a new
            // parent at the point where the prefixes diverge and file
            // both underneath it.
            let new_prefix = util::common_prefix(&node_prefix, &search_key).to_vec();
            let mut parent = InternalNode::new(
                self.config.maximum_size,
                self.config.key_width,
                new_prefix.clone(),
            );
            parent.len = self.arena[idx].len();
            let child_prefix = pad_prefix(&node_prefix, new_prefix.len() + 1);
            parent.items.insert(child_prefix, Child::Arena(idx));
            let pidx = self.push(Node::Internal(parent));
            match self.map_in_internal(store, pidx, key, value)? {
                MapResult::Same => (),
                _ => return err_at!(Fatal, msg: "fresh parent cannot split"),
            }
            return Ok(MapResult::Replaced(pidx));
        }

        let prefix = pad_prefix(&search_key, node_width);
        let has_child = match &self.arena[idx] {
            Node::Internal(node) => node.items.contains_key(&prefix),
            Node::Leaf(_) => unreachable!(),
        };

        if !has_child {
            let mut leaf = LeafNode::new(self.config.maximum_size, self.config.key_width);
            leaf.items.insert(key.clone(), value.to_vec());
            let child = self.push(Node::Leaf(leaf));
            match &mut self.arena[idx] {
                Node::Internal(node) => {
                    node.key = None;
                    node.len += 1;
                    node.items.insert(prefix, Child::Arena(child));
                }
                Node::Leaf(_) => unreachable!(),
            }
            return Ok(MapResult::Same);
        }

        let child = self.load_child(store, idx, &prefix)?;
        let old_len = self.arena[child].len();
        let outcome = self.map_in(store, child, key, value)?;
        let (new_child, new_len) = match outcome {
            MapResult::Same => (child, self.arena[child].len()),
            MapResult::Replaced(new_idx) => (new_idx, self.arena[new_idx].len()),
            MapResult::Split(sub_common, sub_details) => {
                let mut wrapped = InternalNode::new(
                    self.config.maximum_size,
                    self.config.key_width,
                    sub_common,
                );
                for (sub_prefix, sub_idx) in sub_details.into_iter() {
                    wrapped.len += self.arena[sub_idx].len();
                    wrapped.items.insert(sub_prefix, Child::Arena(sub_idx));
                }
                let len = wrapped.len;
                (self.push(Node::Internal(wrapped)), len)
            }
        };
        match &mut self.arena[idx] {
            Node::Internal(node) => {
                node.key = None;
                node.len = node.len + new_len - old_len;
                node.items.insert(prefix, Child::Arena(new_child));
            }
            Node::Leaf(_) => unreachable!(),
        }
        Ok(MapResult::Same)
    }

    // Unmap under an internal node; Some(idx) replaces the node (single
    // child collapse or remap into one leaf).
    fn unmap_in(
        &mut self,
        store: &mut dyn Store,
        idx: usize,
        key: &Key,
    ) -> Result<Option<usize>> {
        let search_key = self.config.search_key.map(key);
        let node_width = match &self.arena[idx] {
            Node::Internal(node) => node.node_width(),
            Node::Leaf(_) => unreachable!(),
        };
        let prefix = pad_prefix(&search_key, node_width);
        let has_child = match &self.arena[idx] {
            Node::Internal(node) => node.items.contains_key(&prefix),
            Node::Leaf(_) => unreachable!(),
        };
        if !has_child {
            return err_at!(KeyNotFound, msg: "unmap {:?}", key);
        }

        let child = self.load_child(store, idx, &prefix)?;
        let replacement = match &self.arena[child] {
            Node::Leaf(_) => {
                match &mut self.arena[child] {
                    Node::Leaf(leaf) => {
                        leaf.key = None;
                        if leaf.items.remove(key).is_none() {
                            return err_at!(KeyNotFound, msg: "unmap {:?}", key);
                        }
                    }
                    Node::Internal(_) => unreachable!(),
                }
                None
            }
            Node::Internal(_) => self.unmap_in(store, child, key)?,
        };
        let new_child = replacement.unwrap_or(child);
        let child_len = self.arena[new_child].len();

        match &mut self.arena[idx] {
            Node::Internal(node) => {
                node.key = None;
                node.len -= 1;
                if child_len == 0 {
                    // emptied child drops out; its arena slot stays
                    // behind, unreferenced.
                    node.items.remove(&prefix);
                } else {
                    node.items.insert(prefix.clone(), Child::Arena(new_child));
                }
            }
            Node::Leaf(_) => unreachable!(),
        }

        // a single remaining child takes this node's place.
        let single = match &self.arena[idx] {
            Node::Internal(node) if node.items.len() == 1 => {
                Some(node.items.keys().next().unwrap().clone())
            }
            _ => None,
        };
        if let Some(only) = single {
            let child = self.load_child(store, idx, &only)?;
            return Ok(Some(child));
        }

        // or, when everything left fits one leaf, fold the subtree back
        // into a leaf.
        self.check_remap(store, idx)
    }

    fn check_remap(&mut self, store: &mut dyn Store, idx: usize) -> Result<Option<usize>> {
        let prefixes: Vec<Vec<u8>> = match &self.arena[idx] {
            Node::Internal(node) => node.items.keys().cloned().collect(),
            Node::Leaf(_) => unreachable!(),
        };
        let mut children = vec![];
        for prefix in prefixes.iter() {
            let child = self.load_child(store, idx, prefix)?;
            match &self.arena[child] {
                // a surviving internal child is alone bigger than one
                // leaf, no remap can succeed.
                Node::Internal(_) => return Ok(None),
                Node::Leaf(_) => children.push(child),
            }
        }

        let mut merged = LeafNode::new(self.config.maximum_size, self.config.key_width);
        for child in children.into_iter() {
            let items = match &self.arena[child] {
                Node::Leaf(leaf) => leaf.items.clone(),
                Node::Internal(_) => unreachable!(),
            };
            merged.items.extend(items);
        }
        if merged.maximum_size != 0 && merged.current_size() > merged.maximum_size {
            return Ok(None);
        }
        Ok(Some(self.push(Node::Leaf(merged))))
    }

    pub(crate) fn collect_items(
        &mut self,
        store: &mut dyn Store,
        idx: usize,
        out: &mut Vec<(Key, Vec<u8>)>,
    ) -> Result<()> {
        match &self.arena[idx] {
            Node::Leaf(leaf) => {
                for (key, value) in leaf.items.iter() {
                    out.push((key.clone(), value.clone()));
                }
                Ok(())
            }
            Node::Internal(node) => {
                let prefixes: Vec<Vec<u8>> = node.items.keys().cloned().collect();
                for prefix in prefixes.into_iter() {
                    let child = self.load_child(store, idx, &prefix)?;
                    self.collect_items(store, child, out)?;
                }
                Ok(())
            }
        }
    }

    fn save_node(&mut self, store: &mut dyn Store, idx: usize) -> Result<String> {
        if let Some(key) = self.arena[idx].to_key() {
            return Ok(key);
        }
        match &self.arena[idx] {
            Node::Leaf(_) => {
                let bytes = match &self.arena[idx] {
                    Node::Leaf(leaf) => leaf.serialise(),
                    Node::Internal(_) => unreachable!(),
                };
                let key = store.put_chk(&bytes)?;
                match &mut self.arena[idx] {
                    Node::Leaf(leaf) => leaf.key = Some(key.clone()),
                    Node::Internal(_) => unreachable!(),
                }
                Ok(key)
            }
            Node::Internal(node) => {
                let children: Vec<(Vec<u8>, Child)> = node
                    .items
                    .iter()
                    .map(|(p, c)| (p.clone(), c.clone()))
                    .collect();
                let mut child_keys: BTreeMap<Vec<u8>, String> = BTreeMap::new();
                for (prefix, child) in children.into_iter() {
                    let hash = match child {
                        Child::Hash(hash) => hash,
                        Child::Arena(cidx) => self.save_node(store, cidx)?,
                    };
                    child_keys.insert(prefix, hash);
                }
                let bytes = match &self.arena[idx] {
                    Node::Internal(node) => node.serialise(&child_keys)?,
                    Node::Leaf(_) => unreachable!(),
                };
                let key = store.put_chk(&bytes)?;
                match &mut self.arena[idx] {
                    Node::Internal(node) => node.key = Some(key.clone()),
                    Node::Leaf(_) => unreachable!(),
                }
                Ok(key)
            }
        }
    }

    fn dump_node(
        &mut self,
        store: &mut dyn Store,
        idx: usize,
        prefix: &[u8],
        depth: usize,
        out: &mut String,
    ) -> Result<()> {
        let indent = "  ".repeat(depth);
        match &self.arena[idx] {
            Node::Leaf(leaf) => {
                out.push_str(&format!("{}{} LeafNode\n", indent, repr_bytes(prefix)));
                for (key, value) in leaf.items.iter() {
                    out.push_str(&format!(
                        "      {} {}\n",
                        repr_key(key),
                        repr_bytes(value)
                    ));
                }
                Ok(())
            }
            Node::Internal(node) => {
                out.push_str(&format!("{}{} InternalNode\n", indent, repr_bytes(prefix)));
                let prefixes: Vec<Vec<u8>> = node.items.keys().cloned().collect();
                for child_prefix in prefixes.into_iter() {
                    let child = self.load_child(store, idx, &child_prefix)?;
                    self.dump_node(store, child, &child_prefix, depth + 1, out)?;
                }
                Ok(())
            }
        }
    }
}

// Cut or zero-pad a search key to exactly `width` bytes.
fn pad_prefix(search_key: &[u8], width: usize) -> Vec<u8> {
    let mut prefix = search_key[..std::cmp::min(width, search_key.len())].to_vec();
    prefix.resize(width, 0);
    prefix
}

// Python-ish repr of a byte string, matching the dump format the
// original tool family uses.
fn repr_bytes(bytes: &[u8]) -> String {
    let mut out = String::from("'");
    for byte in bytes.iter() {
        match byte {
            b'\n' => out.push_str("\\n"),
            b'\r' => out.push_str("\\r"),
            b'\t' => out.push_str("\\t"),
            b'\\' => out.push_str("\\\\"),
            b'\'' => out.push_str("\\'"),
            0x20..=0x7e => out.push(*byte as char),
            b => out.push_str(&format!("\\x{:02x}", b)),
        }
    }
    out.push('\'');
    out
}

fn repr_key(key: &Key) -> String {
    let elements: Vec<String> = key.iter().map(|e| repr_bytes(e)).collect();
    match elements.len() {
        1 => format!("({},)", elements[0]),
        _ => format!("({})", elements.join(", ")),
    }
}

#[cfg(test)]
#[path = "map_test.rs"]
mod map_test;

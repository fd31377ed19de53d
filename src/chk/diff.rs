use std::collections::{BTreeMap, HashSet, VecDeque};

use crate::{
    chk::{
        node::{Child, Node},
        CHKMap, Store,
    },
    Key, Result,
};

/// One page streamed by [iter_interesting_nodes]. Leaves carry their
/// items so a fetch can index text references without re-parsing.
#[derive(Debug)]
pub struct InterestingNode {
    pub key: String,
    pub bytes: Vec<u8>,
    pub items: Vec<(Key, Vec<u8>)>,
}

impl CHKMap {
    /// Yield `(key, this_value, other_value)` for every key that
    /// differs between this map and `other`. Subtrees with equal
    /// content hashes are skipped without loading.
    pub fn iter_changes(
        &mut self,
        store: &mut dyn Store,
        other: &mut CHKMap,
    ) -> Result<Vec<(Key, Option<Vec<u8>>, Option<Vec<u8>>)>> {
        let (ra, rb) = (self.root, other.root);
        let mut out = vec![];
        diff_subtrees(self, other, store, ra, rb, &mut out)?;
        out.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(out)
    }
}

fn node_hash(map: &CHKMap, idx: usize) -> Option<String> {
    map.arena[idx].to_key()
}

fn child_hash(map: &CHKMap, idx: usize, prefix: &[u8]) -> Option<String> {
    match &map.arena[idx] {
        Node::Internal(node) => match node.items.get(prefix) {
            Some(Child::Hash(hash)) => Some(hash.clone()),
            Some(Child::Arena(cidx)) => map.arena[*cidx].to_key(),
            None => None,
        },
        Node::Leaf(_) => None,
    }
}

fn subtree_items(
    map: &mut CHKMap,
    store: &mut dyn Store,
    idx: usize,
) -> Result<BTreeMap<Key, Vec<u8>>> {
    let mut out = vec![];
    map.collect_items(store, idx, &mut out)?;
    Ok(out.into_iter().collect())
}

fn diff_subtrees(
    a: &mut CHKMap,
    b: &mut CHKMap,
    store: &mut dyn Store,
    ai: usize,
    bi: usize,
    out: &mut Vec<(Key, Option<Vec<u8>>, Option<Vec<u8>>)>,
) -> Result<()> {
    if let (Some(ha), Some(hb)) = (node_hash(a, ai), node_hash(b, bi)) {
        if ha == hb {
            return Ok(());
        }
    }

    let aligned = match (&a.arena[ai], &b.arena[bi]) {
        (Node::Internal(na), Node::Internal(nb)) => {
            match na.search_prefix == nb.search_prefix {
                true => {
                    let mut prefixes: Vec<Vec<u8>> = na.items.keys().cloned().collect();
                    prefixes.extend(nb.items.keys().cloned());
                    prefixes.sort();
                    prefixes.dedup();
                    Some(prefixes)
                }
                false => None,
            }
        }
        _ => None,
    };

    match aligned {
        // same partition shape, recurse per prefix and skip matching
        // child hashes without loading them.
        Some(prefixes) => {
            for prefix in prefixes.into_iter() {
                let in_a = matches!(&a.arena[ai], Node::Internal(n) if n.items.contains_key(&prefix));
                let in_b = matches!(&b.arena[bi], Node::Internal(n) if n.items.contains_key(&prefix));
                match (in_a, in_b) {
                    (true, true) => {
                        let ha = child_hash(a, ai, &prefix);
                        let hb = child_hash(b, bi, &prefix);
                        if let (Some(ha), Some(hb)) = (&ha, &hb) {
                            if ha == hb {
                                continue;
                            }
                        }
                        let ca = a.load_child(store, ai, &prefix)?;
                        let cb = b.load_child(store, bi, &prefix)?;
                        diff_subtrees(a, b, store, ca, cb, out)?;
                    }
                    (true, false) => {
                        let ca = a.load_child(store, ai, &prefix)?;
                        for (key, value) in subtree_items(a, store, ca)? {
                            out.push((key, Some(value), None));
                        }
                    }
                    (false, true) => {
                        let cb = b.load_child(store, bi, &prefix)?;
                        for (key, value) in subtree_items(b, store, cb)? {
                            out.push((key, None, Some(value)));
                        }
                    }
                    (false, false) => unreachable!(),
                }
            }
            Ok(())
        }
        // shapes disagree, fall back to comparing materialised items.
        None => {
            let items_a = subtree_items(a, store, ai)?;
            let items_b = subtree_items(b, store, bi)?;
            let mut keys: Vec<&Key> = items_a.keys().chain(items_b.keys()).collect();
            keys.sort();
            keys.dedup();
            for key in keys.into_iter() {
                let va = items_a.get(key);
                let vb = items_b.get(key);
                if va != vb {
                    out.push((key.clone(), va.cloned(), vb.cloned()));
                }
            }
            Ok(())
        }
    }
}

/// Stream exactly the chk pages reachable from `new_roots` that the
/// side holding `old_roots` lacks.
///
/// Old-side internal nodes are expanded only for prefixes the new side
/// is actually descending; a new-side subtree whose hash appears
/// anywhere on the old side is skipped whole, so shared subtrees cost
/// one hash comparison however deep they are.
pub fn iter_interesting_nodes(
    store: &mut dyn Store,
    new_roots: &[String],
    old_roots: &[String],
) -> Result<Vec<InterestingNode>> {
    let mut old_seen: HashSet<String> = old_roots.iter().cloned().collect();
    // (prefix, hash) of old-side nodes not yet expanded.
    let mut old_pending: Vec<(Vec<u8>, String)> =
        old_roots.iter().map(|h| (vec![], h.clone())).collect();

    let mut queue: VecDeque<(Vec<u8>, String)> = VecDeque::new();
    for root in new_roots.iter() {
        queue.push_back((vec![], root.clone()));
    }

    let mut yielded: HashSet<String> = HashSet::new();
    let mut out = vec![];
    while let Some((prefix, hash)) = queue.pop_front() {
        if yielded.contains(&hash) {
            continue;
        }
        expand_old(store, &prefix, &mut old_pending, &mut old_seen)?;
        if old_seen.contains(&hash) {
            continue;
        }

        let bytes = store.get_chk(&hash)?;
        match Node::deserialise(&bytes, &hash)? {
            Node::Leaf(leaf) => {
                let items: Vec<(Key, Vec<u8>)> = leaf.items.into_iter().collect();
                out.push(InterestingNode {
                    key: hash.clone(),
                    bytes,
                    items,
                });
            }
            Node::Internal(node) => {
                for (child_prefix, child) in node.items.iter() {
                    match child {
                        Child::Hash(child_hash) => {
                            queue.push_back((child_prefix.clone(), child_hash.clone()))
                        }
                        Child::Arena(_) => unreachable!(),
                    }
                }
                out.push(InterestingNode {
                    key: hash.clone(),
                    bytes,
                    items: vec![],
                });
            }
        }
        yielded.insert(hash);
    }
    Ok(out)
}

// Load old-side pending nodes whose prefix overlaps the prefix the new
// side is descending, until no overlapping pending nodes remain.
fn expand_old(
    store: &mut dyn Store,
    prefix: &[u8],
    pending: &mut Vec<(Vec<u8>, String)>,
    seen: &mut HashSet<String>,
) -> Result<()> {
    loop {
        let pos = pending
            .iter()
            .position(|(p, _)| p.starts_with(prefix) || prefix.starts_with(p));
        let (_, hash) = match pos {
            Some(pos) => pending.remove(pos),
            None => break Ok(()),
        };
        let bytes = match store.get_chk(&hash) {
            Ok(bytes) => bytes,
            // the old side may be a ghostly reference, treat it as
            // having nothing to prune with.
            Err(_) => continue,
        };
        if let Node::Internal(node) = Node::deserialise(&bytes, &hash)? {
            for (child_prefix, child) in node.items.iter() {
                if let Child::Hash(child_hash) = child {
                    seen.insert(child_hash.clone());
                    pending.push((child_prefix.clone(), child_hash.clone()));
                }
            }
        }
    }
}

#[cfg(test)]
#[path = "diff_test.rs"]
mod diff_test;

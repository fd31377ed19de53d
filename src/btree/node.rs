use crate::{btree::IndexEntry, Key, Result};

/// Decoded page of a btree index.
///
/// Uncompressed leaf pages look like,
///
/// ```text
/// type=leaf\n
/// <key-elements \0 joined>\0<value>\0<reference-lists>\n
/// ...
/// ```
///
/// where reference lists are `\t` joined, references within one list are
/// `,` joined and key elements inside one reference are `\r` joined. An
/// index built with zero reference lists drops the trailing `\0` field.
/// Internal pages look like,
///
/// ```text
/// type=internal\n
/// offset=<page number of first child>\n
/// <key-elements \0 joined>\n
/// ...
/// ```
///
/// holding N keys for N+1 consecutive children; key `i` is the first key
/// reachable under child `i + 1`.
pub enum Node {
    Leaf { entries: Vec<IndexEntry> },
    Internal { offset: usize, keys: Vec<Key> },
}

impl Node {
    /// Footprint estimate for page-cache accounting.
    pub(crate) fn footprint(&self) -> usize {
        match self {
            Node::Leaf { entries } => entries
                .iter()
                .map(|e| {
                    let refs: usize = e
                        .refs
                        .iter()
                        .flat_map(|l| l.iter())
                        .map(|k| key_len(k) + 1)
                        .sum();
                    key_len(&e.key) + e.value.len() + refs + 8
                })
                .sum(),
            Node::Internal { keys, .. } => {
                keys.iter().map(|k| key_len(k) + 8).sum::<usize>() + 16
            }
        }
    }
}

/// Serialise one leaf entry as a line.
pub(crate) fn leaf_line(
    key: &Key,
    value: &[u8],
    refs: &[Vec<Key>],
    node_ref_lists: usize,
) -> Vec<u8> {
    let mut line = vec![];
    join_into(&mut line, key, 0);
    line.push(0);
    line.extend_from_slice(value);
    if node_ref_lists > 0 {
        line.push(0);
        for (i, ref_list) in refs.iter().enumerate() {
            if i > 0 {
                line.push(b'\t');
            }
            for (j, rkey) in ref_list.iter().enumerate() {
                if j > 0 {
                    line.push(b',');
                }
                join_into(&mut line, rkey, b'\r');
            }
        }
    }
    line.push(b'\n');
    line
}

/// Serialise one internal-node key as a line.
pub(crate) fn internal_line(key: &Key) -> Vec<u8> {
    let mut line = vec![];
    join_into(&mut line, key, 0);
    line.push(b'\n');
    line
}

/// Parse an uncompressed page.
pub(crate) fn parse_node(
    bytes: &[u8],
    key_elements: usize,
    node_ref_lists: usize,
) -> Result<Node> {
    if bytes.starts_with(b"type=leaf\n") {
        parse_leaf(&bytes[10..], key_elements, node_ref_lists)
    } else if bytes.starts_with(b"type=internal\n") {
        parse_internal(&bytes[14..], key_elements)
    } else {
        err_at!(CorruptIndex, msg: "unknown page type")
    }
}

fn parse_leaf(body: &[u8], key_elements: usize, node_ref_lists: usize) -> Result<Node> {
    let mut entries = vec![];
    for line in body.split(|b| *b == b'\n') {
        if line.is_empty() {
            continue;
        }
        let fields: Vec<&[u8]> = line.splitn(key_elements + 2, |b| *b == 0).collect();
        let want = match node_ref_lists {
            0 => key_elements + 1,
            _ => key_elements + 2,
        };
        if fields.len() != want {
            return err_at!(CorruptIndex, msg: "leaf line holds {} fields", fields.len());
        }
        let key: Key = fields[..key_elements].iter().map(|e| e.to_vec()).collect();
        let value = fields[key_elements].to_vec();
        let refs = match node_ref_lists {
            0 => vec![],
            n => {
                let lists: Vec<&[u8]> = fields[key_elements + 1].split(|b| *b == b'\t').collect();
                if lists.len() != n {
                    return err_at!(
                        CorruptIndex, msg: "leaf line holds {} reference lists", lists.len()
                    );
                }
                lists
                    .into_iter()
                    .map(|l| {
                        l.split(|b| *b == b',')
                            .filter(|r| !r.is_empty())
                            .map(|r| r.split(|b| *b == b'\r').map(|e| e.to_vec()).collect())
                            .collect()
                    })
                    .collect()
            }
        };
        entries.push(IndexEntry { key, value, refs });
    }
    Ok(Node::Leaf { entries })
}

fn parse_internal(body: &[u8], key_elements: usize) -> Result<Node> {
    if !body.starts_with(b"offset=") {
        return err_at!(CorruptIndex, msg: "missing offset line");
    }
    let rest = &body[7..];
    let pos = match rest.iter().position(|b| *b == b'\n') {
        Some(pos) => pos,
        None => return err_at!(CorruptIndex, msg: "missing offset line"),
    };
    let mut offset = 0;
    for byte in rest[..pos].iter() {
        match byte {
            b'0'..=b'9' => offset = offset * 10 + ((byte - b'0') as usize),
            _ => return err_at!(CorruptIndex, msg: "bad offset digit"),
        }
    }
    let body = &rest[pos + 1..];

    let mut keys = vec![];
    for line in body.split(|b| *b == b'\n') {
        if line.is_empty() {
            continue;
        }
        let key: Key = line.split(|b| *b == 0).map(|e| e.to_vec()).collect();
        if key.len() != key_elements {
            return err_at!(CorruptIndex, msg: "internal key holds {} elements", key.len());
        }
        keys.push(key);
    }
    Ok(Node::Internal { offset, keys })
}

/// Reject key elements that would collide with the line format.
pub(crate) fn validate_key(key: &Key, key_elements: usize) -> Result<()> {
    if key.len() != key_elements {
        return err_at!(InvalidFile, msg: "key holds {} of {} elements", key.len(), key_elements);
    }
    for element in key.iter() {
        if element.is_empty() {
            return err_at!(InvalidFile, msg: "empty key element");
        }
        for byte in element.iter() {
            match byte {
                b'\n' | 0 | b'\t' | b'\r' | b',' => {
                    return err_at!(InvalidFile, msg: "byte {:?} in key element", *byte as char)
                }
                _ => (),
            }
        }
    }
    Ok(())
}

/// Reject values that would collide with the line format.
pub(crate) fn validate_value(value: &[u8]) -> Result<()> {
    for byte in value.iter() {
        match byte {
            b'\n' | 0 => return err_at!(InvalidFile, msg: "byte {:?} in value", *byte as char),
            _ => (),
        }
    }
    Ok(())
}

fn join_into(out: &mut Vec<u8>, key: &Key, sep: u8) {
    for (i, element) in key.iter().enumerate() {
        if i > 0 {
            out.push(sep);
        }
        out.extend_from_slice(element);
    }
}

fn key_len(key: &Key) -> usize {
    key.iter().map(|e| e.len() + 1).sum()
}

#[cfg(test)]
#[path = "node_test.rs"]
mod node_test;

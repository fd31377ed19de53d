use flate2::Compression;

use std::{collections::HashSet, io::Write};

use crate::{
    gcb::{self, block, Block, Compressor, Config},
    Key, Result,
};

/// Identity of one record inside a [LazyGroup], the byte range it
/// occupies in the uncompressed stream plus its graph parents.
#[derive(Clone, Debug, PartialEq)]
pub struct Entry {
    pub key: Key,
    pub parents: Vec<Key>,
    pub start: usize,
    pub end: usize,
}

/// A block together with the identities of the records it holds.
///
/// This is the unit that travels between repositories. Serialised it is a
/// stripe,
///
/// ```text
/// groupcompress-block\n
/// <z-header-len>\n
/// <header-len>\n
/// <block-len>\n
/// <zlib-compressed header><block bytes>
/// ```
///
/// where the header lists `(key, parents, start, end)` per record, so a
/// receiver can populate its index without re-scanning the payload.
pub struct LazyGroup {
    block: Block,
    entries: Vec<Entry>,
}

impl LazyGroup {
    pub fn new(block: Block, entries: Vec<Entry>) -> LazyGroup {
        LazyGroup { block, entries }
    }

    pub fn as_entries(&self) -> &[Entry] {
        &self.entries
    }

    pub fn to_keys(&self) -> Vec<Key> {
        self.entries.iter().map(|e| e.key.clone()).collect()
    }

    pub fn as_block(&self) -> &Block {
        &self.block
    }

    pub fn extract(&mut self, key: &Key) -> Result<Vec<u8>> {
        let entry = match self.entries.iter().find(|e| &e.key == key) {
            Some(entry) => entry.clone(),
            None => return err_at!(KeyNotFound, msg: "{:?} not in group", key),
        };
        self.block.extract(entry.start, entry.end)
    }

    /// True when the records named by `keys` cover at least
    /// `threshold` percent of the uncompressed block size. Well-utilised
    /// groups are reused whole, preserving bit-identical bytes; the rest
    /// get rebuilt so that no small record rides inside a huge block.
    pub fn is_well_utilised(&self, keys: &[Key], threshold: u8) -> bool {
        let keys: HashSet<&Key> = keys.iter().collect();
        let used: usize = self
            .entries
            .iter()
            .filter(|e| keys.contains(&e.key))
            .map(|e| e.end - e.start)
            .sum();
        let total = self.block.content_len();
        total == 0 || used * 100 >= total * (threshold as usize)
    }

    /// Re-compress the records named by `keys`, in stream order, into a
    /// fresh group. The old block is left untouched, rebuilding produces
    /// new content and therefore a new block identity.
    pub fn rebuild(&mut self, keys: &[Key], config: &Config) -> Result<LazyGroup> {
        let keys: HashSet<&Key> = keys.iter().collect();
        let kept: Vec<Entry> = self
            .entries
            .iter()
            .filter(|e| keys.contains(&e.key))
            .cloned()
            .collect();

        let mut compressor = Compressor::new(config);
        let mut entries = Vec::with_capacity(kept.len());
        for entry in kept.into_iter() {
            let bytes = self.block.extract(entry.start, entry.end)?;
            let (_, start, end, _) = compressor.compress(&entry.key, &bytes, None)?;
            entries.push(Entry {
                key: entry.key,
                parents: entry.parents,
                start,
                end,
            });
        }
        Ok(LazyGroup::new(compressor.flush()?, entries))
    }

    pub fn to_wire_bytes(&self) -> Result<Vec<u8>> {
        let mut header = vec![];
        for entry in self.entries.iter() {
            header.extend_from_slice(&join_key(&entry.key));
            header.push(b'\n');
            for (i, parent) in entry.parents.iter().enumerate() {
                if i > 0 {
                    header.push(b'\t');
                }
                header.extend_from_slice(&join_key(parent));
            }
            header.push(b'\n');
            header.extend_from_slice(format!("{}\n{}\n", entry.start, entry.end).as_bytes());
        }

        let z_header = {
            let buf = Vec::with_capacity(header.len() / 2 + 64);
            let mut enc = flate2::write::ZlibEncoder::new(buf, Compression::default());
            err_at!(IOError, enc.write_all(&header))?;
            err_at!(IOError, enc.finish())?
        };
        let block_bytes = self.block.to_bytes();

        let mut out = Vec::with_capacity(z_header.len() + block_bytes.len() + 64);
        out.extend_from_slice(gcb::WIRE_HEADER);
        out.extend_from_slice(
            format!("{}\n{}\n{}\n", z_header.len(), header.len(), block_bytes.len()).as_bytes(),
        );
        out.extend_from_slice(&z_header);
        out.extend_from_slice(&block_bytes);
        Ok(out)
    }

    pub fn from_wire_bytes(bytes: &[u8]) -> Result<LazyGroup> {
        let n = gcb::WIRE_HEADER.len();
        if bytes.len() < n || &bytes[..n] != gcb::WIRE_HEADER {
            return err_at!(CorruptBlock, msg: "bad wire magic");
        }
        let (z_header_len, a) = block::decimal_line(&bytes[n..])?;
        let (header_len, b) = block::decimal_line(&bytes[n + a..])?;
        let (block_len, c) = block::decimal_line(&bytes[n + a + b..])?;
        let data = &bytes[n + a + b + c..];
        if data.len() != z_header_len + block_len {
            return err_at!(
                CorruptBlock, msg: "wire payload {}/{} bytes",
                data.len(), z_header_len + block_len
            );
        }

        let header = {
            let mut buf = vec![];
            let mut dec = flate2::read::ZlibDecoder::new(&data[..z_header_len]);
            use std::io::Read;
            err_at!(CorruptBlock, dec.read_to_end(&mut buf))?;
            buf
        };
        if header.len() != header_len {
            return err_at!(CorruptBlock, msg: "wire header {}/{}", header.len(), header_len);
        }

        let entries = parse_header(&header)?;
        let block = Block::from_bytes(&data[z_header_len..])?;
        Ok(LazyGroup::new(block, entries))
    }
}

fn parse_header(header: &[u8]) -> Result<Vec<Entry>> {
    let mut lines = header.split(|b| *b == b'\n');
    let mut entries = vec![];
    loop {
        let key_line = match lines.next() {
            Some([]) | None => break,
            Some(line) => line,
        };
        let parent_line = match lines.next() {
            Some(line) => line,
            None => return err_at!(CorruptBlock, msg: "wire header truncated"),
        };
        let start = decimal_field(lines.next())?;
        let end = decimal_field(lines.next())?;

        let key = split_key(key_line);
        let parents = match parent_line.len() {
            0 => vec![],
            _ => parent_line.split(|b| *b == b'\t').map(split_key).collect(),
        };
        entries.push(Entry {
            key,
            parents,
            start,
            end,
        });
    }
    Ok(entries)
}

fn decimal_field(field: Option<&[u8]>) -> Result<usize> {
    let field = match field {
        Some(field) if field.len() > 0 => field,
        _ => return err_at!(CorruptBlock, msg: "wire header truncated"),
    };
    let mut val = 0;
    for byte in field {
        match byte {
            b'0'..=b'9' => val = val * 10 + ((byte - b'0') as usize),
            _ => return err_at!(CorruptBlock, msg: "bad wire digit {:?}", *byte as char),
        }
    }
    Ok(val)
}

fn join_key(key: &Key) -> Vec<u8> {
    let mut out = vec![];
    for (i, element) in key.iter().enumerate() {
        if i > 0 {
            out.push(0);
        }
        out.extend_from_slice(element);
    }
    out
}

fn split_key(bytes: &[u8]) -> Key {
    bytes.split(|b| *b == 0).map(|e| e.to_vec()).collect()
}

#[cfg(test)]
#[path = "wire_test.rs"]
mod wire_test;

use crate::{
    delta::DeltaIndex,
    gcb::{self, block, Block, Config},
    util, Key, Result,
};

/// How a record ended up stored inside a block.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum Kind {
    Fulltext,
    Delta,
}

/// Accumulate texts into the uncompressed stream of a block under
/// construction.
///
/// The first text is stored as a fulltext. Later texts are stored as a
/// delta against everything accumulated so far, unless the best delta
/// exceeds half the literal text, in which case the fulltext wins.
pub struct Compressor {
    config: Config,
    content: Vec<u8>,
    index: DeltaIndex,
    labels: Vec<(Key, usize, usize)>,
    last: Option<usize>,
}

impl Compressor {
    pub fn new(config: &Config) -> Compressor {
        Compressor {
            config: config.clone(),
            content: vec![],
            index: DeltaIndex::new(config.max_bytes_to_index),
            labels: vec![],
            last: None,
        }
    }

    /// Compress `bytes` under `key`. Return the text's sha1 and the
    /// `[start, end)` range it occupies in the uncompressed stream.
    ///
    /// `expected_sha1` skips re-hashing when the caller already knows the
    /// content hash. An empty text stores nothing and returns the null
    /// record range `(0, 0)`.
    pub fn compress(
        &mut self,
        key: &Key,
        bytes: &[u8],
        expected_sha1: Option<&str>,
    ) -> Result<(String, usize, usize, Kind)> {
        let sha1 = match expected_sha1 {
            Some(sha1) => sha1.to_string(),
            None => util::sha1_hex(bytes),
        };
        if bytes.is_empty() {
            self.labels.push((key.clone(), 0, 0));
            self.last = None;
            return Ok((gcb::NULL_SHA1.clone(), 0, 0, Kind::Fulltext));
        }

        let start = self.content.len();
        let d = match start {
            0 => None,
            _ => self.index.make_delta(&self.content, bytes, bytes.len() / 2),
        };
        let kind = match d {
            Some(d) => {
                self.content.push(b'd');
                util::encode_base128_int(d.len() as u64, &mut self.content);
                self.content.extend_from_slice(&d);
                Kind::Delta
            }
            None => {
                self.content.push(b'f');
                util::encode_base128_int(bytes.len() as u64, &mut self.content);
                self.content.extend_from_slice(bytes);
                Kind::Fulltext
            }
        };
        self.index.extend_source(&self.content);

        let end = self.content.len();
        self.labels.push((key.clone(), start, end));
        self.last = Some(start);
        Ok((sha1, start, end, kind))
    }

    /// Revoke the most recent [Compressor::compress] exactly. Typically
    /// used when the last text pushed the block past its size budget and
    /// should open the next block instead.
    pub fn pop_last(&mut self) -> Result<()> {
        let start = match self.last.take() {
            Some(start) => start,
            None => return err_at!(Fatal, msg: "no compress to pop"),
        };
        self.labels.pop();
        self.content.truncate(start);
        // the match index has no removal, rebuild it over the truncated
        // stream.
        self.index = DeltaIndex::new(self.config.max_bytes_to_index);
        self.index.extend_source(&self.content);
        Ok(())
    }

    /// Reconstruct a text already written into this (unsealed) stream.
    pub fn extract(&self, key: &Key) -> Result<(Vec<u8>, String)> {
        let (start, end) = match self.labels.iter().rev().find(|(k, _, _)| k == key) {
            Some((_, start, end)) => (*start, *end),
            None => return err_at!(KeyNotFound, msg: "{:?} not in compressor", key),
        };
        let bytes = match start == end {
            true => vec![],
            false => block::parse_record(&self.content, start, end)?,
        };
        let sha1 = util::sha1_hex(&bytes);
        Ok((bytes, sha1))
    }

    /// Bytes of uncompressed stream accumulated so far.
    pub fn endpoint(&self) -> usize {
        self.content.len()
    }

    pub fn is_empty(&self) -> bool {
        self.content.is_empty()
    }

    /// Seal the stream into an immutable [Block]. Consumes the
    /// compressor, there is no further compress after flush.
    pub fn flush(self) -> Result<Block> {
        Block::from_content(self.content)
    }
}

#[cfg(test)]
#[path = "compress_test.rs"]
mod compress_test;

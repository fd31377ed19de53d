//! Module implement the byte-copy delta codec.
//!
//! A delta stream encodes a target byte buffer as instructions against a
//! source buffer. The stream starts with the source length and the target
//! length, both base-128 varints, followed by instructions,
//!
//! * literal insert, a command byte `0x01..=0x7f` giving an inline length,
//!   followed by that many bytes to append.
//! * copy, a command byte with the high bit set whose low seven bits are a
//!   presence bitmap, bits 0..2 for up to three offset bytes and bits 4..6
//!   for up to three length bytes, present bytes following little endian.
//!   A decoded length of zero means 0x10000.
//!
//! Match finding hashes overlapping 16 byte windows of the source, one
//! table entry per window-aligned position. [DeltaIndex] accumulates
//! multiple sources so that later texts can match anything written into a
//! group-compress block so far. At most `max_bytes_to_index` source bytes
//! are indexed; sources beyond the cap still apply, matches are simply not
//! found there and the encoder falls back to literal inserts.

use std::collections::HashMap;

use crate::{util, Error, Result};

/// Size of the match window, in bytes. Matches shorter than this are
/// left as literal inserts.
pub const WINDOW: usize = 16;

/// A single copy instruction can cover at most this many bytes. Longer
/// matches emit consecutive copies.
pub const MAX_COPY: usize = 0x10000;

// Three little-endian offset bytes address this much source.
const MAX_COPY_OFFSET: usize = 1 << 24;

// Bounds a hash bucket, keeps pathological inputs from degrading the
// encoder to quadratic scans.
const MAX_BUCKET: usize = 64;

const HASH_MUL: u32 = 0x0100_0193;

/// Match index over one or more source buffers.
///
/// The caller owns the concatenated source bytes and re-presents them on
/// every call; the index only remembers window hashes and how far it has
/// indexed.
pub struct DeltaIndex {
    table: HashMap<u32, Vec<u32>>,
    indexed: usize,
    total: usize,
    max_bytes_to_index: usize,
}

impl DeltaIndex {
    pub fn new(max_bytes_to_index: usize) -> DeltaIndex {
        DeltaIndex {
            table: HashMap::new(),
            indexed: 0,
            total: 0,
            max_bytes_to_index,
        }
    }

    /// Total source bytes presented so far, indexed or not.
    pub fn total_source(&self) -> usize {
        self.total
    }

    /// Index the window-aligned positions of `source` that have appeared
    /// since the previous call. `source` is the full concatenation of
    /// every source added so far.
    pub fn extend_source(&mut self, source: &[u8]) {
        assert!(source.len() >= self.total, "source shrank");
        self.total = source.len();

        let cap = std::cmp::min(source.len(), self.max_bytes_to_index);
        let mut pos = match self.indexed {
            0 => 0,
            n => ((n - 1) / WINDOW + 1) * WINDOW,
        };
        while pos + WINDOW <= cap {
            let hash = hash_window(&source[pos..pos + WINDOW]);
            let bucket = self.table.entry(hash).or_insert_with(Vec::new);
            if bucket.len() < MAX_BUCKET {
                bucket.push(pos as u32);
            }
            pos += WINDOW;
        }
        self.indexed = cap;
    }

    /// Encode `target` against the accumulated source. Return None when
    /// `max_size` is non-zero and the delta would exceed it.
    pub fn make_delta(
        &self,
        source: &[u8],
        target: &[u8],
        max_size: usize,
    ) -> Option<Vec<u8>> {
        assert_eq!(source.len(), self.total, "stale source");

        let mut out = vec![];
        util::encode_base128_int(source.len() as u64, &mut out);
        util::encode_base128_int(target.len() as u64, &mut out);

        let mut pos = 0; // scan position in target
        let mut lit = 0; // start of the pending literal run
        while pos < target.len() {
            if max_size > 0 && out.len() + (pos - lit) > max_size {
                return None;
            }
            let m = match target.len() - pos >= WINDOW {
                true => self.find_match(source, target, pos),
                false => None,
            };
            match m {
                Some((mut sp, mut len)) => {
                    // reclaim literal bytes that the source also has just
                    // before the match.
                    let mut start = pos;
                    while sp > 0 && start > lit && source[sp - 1] == target[start - 1] {
                        sp -= 1;
                        start -= 1;
                        len += 1;
                    }
                    flush_insert(&mut out, &target[lit..start]);
                    encode_copies(&mut out, sp, len);
                    pos = start + len;
                    lit = pos;
                }
                None => pos += 1,
            }
        }
        flush_insert(&mut out, &target[lit..]);

        match max_size {
            0 => Some(out),
            n if out.len() > n => None,
            _ => Some(out),
        }
    }

    // Longest match for the window at target[pos..], as (source-pos, len).
    fn find_match(&self, source: &[u8], target: &[u8], pos: usize) -> Option<(usize, usize)> {
        let hash = hash_window(&target[pos..pos + WINDOW]);
        let mut best: Option<(usize, usize)> = None;
        for sp in self.table.get(&hash)?.iter() {
            let sp = *sp as usize;
            let len = match_len(&source[sp..], &target[pos..]);
            if len >= WINDOW && sp < MAX_COPY_OFFSET {
                match best {
                    Some((_, blen)) if blen >= len => (),
                    _ => best = Some((sp, len)),
                }
            }
        }
        best
    }
}

/// Encode `target` as a delta against `source`.
pub fn make_delta(source: &[u8], target: &[u8]) -> Vec<u8> {
    let mut index = DeltaIndex::new(source.len());
    index.extend_source(source);
    // max_size of zero cannot fail.
    index.make_delta(source, target, 0).unwrap()
}

/// Apply a delta stream to `source`, reproducing the target bytes.
pub fn apply_delta(source: &[u8], delta: &[u8]) -> Result<Vec<u8>> {
    let (src_len, n) = decode_len(delta)?;
    if src_len != source.len() {
        return err_at!(
            DeltaFail, msg: "delta source length {} against {}", src_len, source.len()
        );
    }
    let (tgt_len, m) = decode_len(&delta[n..])?;
    let mut data = &delta[n + m..];

    let mut out = Vec::with_capacity(tgt_len);
    while data.len() > 0 {
        let cmd = data[0];
        data = &data[1..];
        if cmd & 0x80 != 0 {
            let (offset, length, n) = decode_copy(cmd, data)?;
            data = &data[n..];
            if offset + length > source.len() {
                return err_at!(
                    DeltaFail, msg: "copy {}+{} out of {} source bytes",
                    offset, length, source.len()
                );
            }
            out.extend_from_slice(&source[offset..offset + length]);
        } else if cmd > 0 {
            let length = cmd as usize;
            if data.len() < length {
                return err_at!(
                    DeltaFail, msg: "insert of {} with {} bytes left", length, data.len()
                );
            }
            out.extend_from_slice(&data[..length]);
            data = &data[length..];
        } else {
            return err_at!(DeltaFail, msg: "zero delta instruction");
        }
    }

    if out.len() != tgt_len {
        err_at!(DeltaFail, msg: "delta target length {}, got {}", tgt_len, out.len())
    } else {
        Ok(out)
    }
}

/// Decode only the header of a delta stream, return (source-length,
/// target-length, bytes-consumed).
pub fn decode_header(delta: &[u8]) -> Result<(usize, usize, usize)> {
    let (src_len, n) = decode_len(delta)?;
    let (tgt_len, m) = decode_len(&delta[n..])?;
    Ok((src_len, tgt_len, n + m))
}

fn decode_len(buf: &[u8]) -> Result<(usize, usize)> {
    match util::decode_base128_int(buf) {
        Ok((val, n)) => Ok((val as usize, n)),
        Err(Error::FailConvert(p, m)) => Err(Error::DeltaFail(p, m)),
        Err(err) => Err(err),
    }
}

fn decode_copy(cmd: u8, data: &[u8]) -> Result<(usize, usize, usize)> {
    let mut n = 0;
    let mut offset: usize = 0;
    for (i, bit) in [0x01_u8, 0x02, 0x04].iter().enumerate() {
        if cmd & bit != 0 {
            if data.len() < n + 1 {
                return err_at!(DeltaFail, msg: "copy instruction truncated");
            }
            offset |= (data[n] as usize) << (8 * i);
            n += 1;
        }
    }
    let mut length: usize = 0;
    for (i, bit) in [0x10_u8, 0x20, 0x40].iter().enumerate() {
        if cmd & bit != 0 {
            if data.len() < n + 1 {
                return err_at!(DeltaFail, msg: "copy instruction truncated");
            }
            length |= (data[n] as usize) << (8 * i);
            n += 1;
        }
    }
    if length == 0 {
        length = MAX_COPY;
    }
    Ok((offset, length, n))
}

fn flush_insert(out: &mut Vec<u8>, mut lit: &[u8]) {
    while lit.len() > 0 {
        let n = std::cmp::min(lit.len(), 0x7f);
        out.push(n as u8);
        out.extend_from_slice(&lit[..n]);
        lit = &lit[n..];
    }
}

fn encode_copies(out: &mut Vec<u8>, mut offset: usize, mut len: usize) {
    while len > 0 {
        let n = std::cmp::min(len, MAX_COPY);
        encode_copy(out, offset, n);
        offset += n;
        len -= n;
    }
}

fn encode_copy(out: &mut Vec<u8>, offset: usize, len: usize) {
    let mut cmd = 0x80_u8;
    let mut args: Vec<u8> = vec![];

    let mut off = offset;
    for bit in [0x01_u8, 0x02, 0x04].iter() {
        let byte = (off & 0xff) as u8;
        if byte != 0 {
            cmd |= bit;
            args.push(byte);
        }
        off >>= 8;
    }

    let mut val = match len {
        MAX_COPY => 0,
        n => n,
    };
    for bit in [0x10_u8, 0x20].iter() {
        let byte = (val & 0xff) as u8;
        if byte != 0 {
            cmd |= bit;
            args.push(byte);
        }
        val >>= 8;
    }

    out.push(cmd);
    out.extend_from_slice(&args);
}

fn match_len(source: &[u8], target: &[u8]) -> usize {
    source
        .iter()
        .zip(target.iter())
        .take_while(|(a, b)| a == b)
        .count()
}

fn hash_window(window: &[u8]) -> u32 {
    let mut hash: u32 = 0;
    for byte in window {
        hash = hash.wrapping_mul(HASH_MUL) ^ (*byte as u32);
    }
    hash
}

#[cfg(test)]
#[path = "delta_test.rs"]
mod delta_test;

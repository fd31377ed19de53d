use flate2::{Compression, Decompress, FlushDecompress, Status};

use std::{cmp, io::Write};

use crate::{delta, gcb, util, Result};

/// An immutable group-compress block.
///
/// On disk a block is a length-prefixed container,
///
/// ```text
/// gcb1z\n
/// <uncompressed-len>\n
/// <compressed-len>\n
/// <zlib stream of compressed-len bytes>
/// ```
///
/// Opening a block parses the header only. Extracting a record inflates
/// just enough of the zlib stream to serve its byte range; the
/// decompressor is kept and resumed when a later extract asks for bytes
/// past the current watermark.
pub struct Block {
    content_len: usize,
    z_content: Vec<u8>,
    content: Vec<u8>,
    decomp: Option<Decompress>,
}

impl Block {
    /// Open a serialised block. Parses the header, does not inflate.
    pub fn from_bytes(bytes: &[u8]) -> Result<Block> {
        if bytes.len() < gcb::BLOCK_HEADER.len() || &bytes[..6] != gcb::BLOCK_HEADER {
            return err_at!(CorruptBlock, msg: "bad block magic");
        }
        let (content_len, n) = decimal_line(&bytes[6..])?;
        let (z_len, m) = decimal_line(&bytes[6 + n..])?;
        let z_content = &bytes[6 + n + m..];
        if z_content.len() != z_len {
            return err_at!(
                CorruptBlock, msg: "compressed payload {}/{} bytes", z_content.len(), z_len
            );
        }
        let val = Block {
            content_len,
            z_content: z_content.to_vec(),
            content: vec![],
            decomp: None,
        };
        Ok(val)
    }

    /// Build a block over fully materialised content, deflating it now.
    pub fn from_content(content: Vec<u8>) -> Result<Block> {
        let z_content = {
            let buf = Vec::with_capacity(content.len() / 2 + 64);
            let mut enc = flate2::write::ZlibEncoder::new(buf, Compression::default());
            err_at!(IOError, enc.write_all(&content))?;
            err_at!(IOError, enc.finish())?
        };
        let val = Block {
            content_len: content.len(),
            z_content,
            content,
            decomp: None,
        };
        Ok(val)
    }

    /// Serialise, header included. The compressed payload is stable, a
    /// block round trips bit-identical through from_bytes/to_bytes.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.z_content.len() + 32);
        out.extend_from_slice(gcb::BLOCK_HEADER);
        out.extend_from_slice(format!("{}\n", self.content_len).as_bytes());
        out.extend_from_slice(format!("{}\n", self.z_content.len()).as_bytes());
        out.extend_from_slice(&self.z_content);
        out
    }

    pub fn content_len(&self) -> usize {
        self.content_len
    }

    pub fn z_len(&self) -> usize {
        self.z_content.len()
    }

    /// Extract the record stored at `[start, end)` of the uncompressed
    /// stream. A delta record is applied against the stream bytes
    /// preceding it, which transitively resolves its compression parent.
    pub fn extract(&mut self, start: usize, end: usize) -> Result<Vec<u8>> {
        if start == end {
            // the null record.
            return Ok(vec![]);
        }
        if end > self.content_len || start > end {
            return err_at!(
                CorruptBlock, msg: "record {}..{} outside {} content bytes",
                start, end, self.content_len
            );
        }
        self.ensure_content(end)?;
        parse_record(&self.content, start, end)
    }

    /// Like [Block::extract] but without applying deltas: the stored
    /// record type (`f` or `d`) and its raw payload.
    pub fn extract_raw(&mut self, start: usize, end: usize) -> Result<(u8, Vec<u8>)> {
        if start == end {
            return Ok((b'f', vec![]));
        }
        if end > self.content_len || start > end {
            return err_at!(
                CorruptBlock, msg: "record {}..{} outside {} content bytes",
                start, end, self.content_len
            );
        }
        self.ensure_content(end)?;
        let (kind, payload) = split_record(&self.content, start, end)?;
        Ok((kind, payload.to_vec()))
    }

    /// Inflate the whole stream and return it.
    pub fn to_content(&mut self) -> Result<Vec<u8>> {
        self.ensure_content(self.content_len)?;
        Ok(self.content.clone())
    }

    /// Inflate until at least `upto` bytes of content are available.
    fn ensure_content(&mut self, upto: usize) -> Result<()> {
        let upto = cmp::min(upto, self.content_len);
        if self.content.len() >= upto {
            return Ok(());
        }
        if self.decomp.is_none() {
            self.decomp = Some(Decompress::new(true));
        }
        let decomp = self.decomp.as_mut().unwrap();

        self.content.reserve(upto - self.content.len());
        let mut finished = false;
        while self.content.len() < upto {
            let consumed = decomp.total_in() as usize;
            let input = &self.z_content[consumed..];
            let n = self.content.len();
            let status = err_at!(
                CorruptBlock,
                decomp.decompress_vec(input, &mut self.content, FlushDecompress::None)
            )?;
            match status {
                Status::StreamEnd => {
                    finished = true;
                    break;
                }
                _ if self.content.len() > n => (),
                _ => return err_at!(CorruptBlock, msg: "truncated zlib stream"),
            }
        }

        if finished {
            self.decomp = None;
            if self.content.len() != self.content_len {
                return err_at!(
                    CorruptBlock, msg: "content {}/{} bytes",
                    self.content.len(), self.content_len
                );
            }
        }
        if self.content.len() < upto {
            err_at!(CorruptBlock, msg: "short content {}/{}", self.content.len(), upto)
        } else {
            Ok(())
        }
    }
}

/// Parse the subrecord at `[start, end)` of an uncompressed stream and
/// reconstruct its fulltext.
pub(crate) fn parse_record(content: &[u8], start: usize, end: usize) -> Result<Vec<u8>> {
    let (kind, payload) = split_record(content, start, end)?;
    match kind {
        b'f' => Ok(payload.to_vec()),
        b'd' => delta::apply_delta(&content[..start], payload),
        _ => err_at!(CorruptBlock, msg: "record type {:?}", kind as char),
    }
}

// split a subrecord into its type byte and payload.
fn split_record(content: &[u8], start: usize, end: usize) -> Result<(u8, &[u8])> {
    let kind = content[start];
    let (len, n) = match util::decode_base128_int(&content[start + 1..end]) {
        Ok((len, n)) => (len as usize, n),
        Err(err) => return err_at!(CorruptBlock, msg: "record length {}", err),
    };
    if start + 1 + n + len != end {
        return err_at!(
            CorruptBlock, msg: "record {}..{} holds {} payload bytes", start, end, len
        );
    }
    match kind {
        b'f' | b'd' => Ok((kind, &content[start + 1 + n..end])),
        _ => err_at!(CorruptBlock, msg: "record type {:?}", kind as char),
    }
}

// "<decimal>\n" at the head of buf, also return bytes consumed.
pub(crate) fn decimal_line(buf: &[u8]) -> Result<(usize, usize)> {
    let pos = match buf.iter().position(|b| *b == b'\n') {
        Some(pos) if pos > 0 => pos,
        _ => return err_at!(CorruptBlock, msg: "missing length line"),
    };
    let mut val: usize = 0;
    for byte in buf[..pos].iter() {
        match byte {
            b'0'..=b'9' => val = val * 10 + ((byte - b'0') as usize),
            _ => return err_at!(CorruptBlock, msg: "bad length digit {:?}", *byte as char),
        }
    }
    Ok((val, pos + 1))
}

#[cfg(test)]
#[path = "block_test.rs"]
mod block_test;

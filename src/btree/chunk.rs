use flate2::{Compress, Compression, FlushCompress, Status};

use crate::Result;

// Slack between the sync-flushed size and the budget. Covers the zlib
// trailer the final from-scratch deflate adds.
const SIZE_MARGIN: usize = 10;

/// Write lines into a fixed-size zlib-compressed chunk.
///
/// Data is fed to a live deflate stream and sync-flushed after every
/// write so the compressed size is always exact. A write that would push
/// the chunk past its budget is rejected, the stream is repacked without
/// it, and the caller carries the line over to the next chunk. On
/// [ChunkWriter::finish] the accepted lines are deflated once more from
/// scratch, reclaiming the sync-flush overhead, and padded to the chunk
/// size.
pub struct ChunkWriter {
    chunk_size: usize,
    reserved_size: usize,
    comp: Compress,
    out: Vec<u8>,
    items: Vec<Vec<u8>>,
    items_len: usize,
    num_repack: usize,
}

impl ChunkWriter {
    pub fn new(chunk_size: usize, reserved_size: usize) -> ChunkWriter {
        ChunkWriter {
            chunk_size,
            reserved_size,
            comp: Compress::new(Compression::default(), true),
            out: Vec::with_capacity(chunk_size * 2),
            items: vec![],
            items_len: 0,
            num_repack: 0,
        }
    }

    /// Add `data` to the chunk. Return true when it does not fit, in
    /// which case the chunk is unchanged and the caller keeps the data.
    pub fn write(&mut self, data: &[u8]) -> Result<bool> {
        self.write_inner(data, false)
    }

    /// Like [ChunkWriter::write] but allowed to dip into the reserved
    /// tail of the budget.
    pub fn write_reserved(&mut self, data: &[u8]) -> Result<bool> {
        self.write_inner(data, true)
    }

    fn write_inner(&mut self, data: &[u8], reserved: bool) -> Result<bool> {
        let capacity = match reserved {
            true => self.chunk_size,
            false => self.chunk_size - self.reserved_size,
        };

        deflate(&mut self.comp, data, &mut self.out, FlushCompress::None)?;
        deflate(&mut self.comp, &[], &mut self.out, FlushCompress::Sync)?;

        if self.out.len() + SIZE_MARGIN > capacity {
            if self.items.is_empty() {
                return err_at!(Fatal, msg: "entry of {} bytes exceeds chunk", data.len());
            }
            self.repack()?;
            return Ok(true);
        }

        self.items.push(data.to_vec());
        self.items_len += data.len();
        Ok(false)
    }

    /// Bytes written into this chunk so far, uncompressed.
    pub fn to_items_len(&self) -> usize {
        self.items_len
    }

    pub fn to_num_repack(&self) -> usize {
        self.num_repack
    }

    /// Deflate the accepted lines into their final bytes, padded with
    /// zeros to the chunk size. Also return the padding length.
    pub fn finish(self) -> Result<(Vec<u8>, usize)> {
        let mut comp = Compress::new(Compression::default(), true);
        let mut out = Vec::with_capacity(self.chunk_size);
        for item in self.items.iter() {
            deflate(&mut comp, item, &mut out, FlushCompress::None)?;
        }
        deflate(&mut comp, &[], &mut out, FlushCompress::Finish)?;

        if out.len() > self.chunk_size {
            return err_at!(Fatal, msg: "chunk {}/{} bytes", out.len(), self.chunk_size);
        }
        let padding = self.chunk_size - out.len();
        out.resize(self.chunk_size, 0);
        Ok((out, padding))
    }

    // Rebuild the live stream from the accepted lines, dropping
    // whatever the rejected write had pushed into it.
    fn repack(&mut self) -> Result<()> {
        self.comp = Compress::new(Compression::default(), true);
        self.out.clear();
        let items = std::mem::take(&mut self.items);
        for item in items.iter() {
            deflate(&mut self.comp, item, &mut self.out, FlushCompress::None)?;
        }
        deflate(&mut self.comp, &[], &mut self.out, FlushCompress::Sync)?;
        self.items = items;
        self.num_repack += 1;
        Ok(())
    }
}

// Feed `data` fully into the deflate stream, growing `out` as needed.
// For Sync/Finish flushes, also drain until the stream has no more
// pending output.
pub(crate) fn deflate(
    comp: &mut Compress,
    data: &[u8],
    out: &mut Vec<u8>,
    flush: FlushCompress,
) -> Result<()> {
    let base_in = comp.total_in() as usize;
    loop {
        if out.len() == out.capacity() {
            out.reserve(1024);
        }
        let fed = comp.total_in() as usize - base_in;
        let status = err_at!(Fatal, comp.compress_vec(&data[fed..], out, flush))?;
        match status {
            Status::StreamEnd => break,
            _ => {
                // input fully consumed and zlib did not run out of
                // output space, nothing more is coming for this flush.
                let fed = comp.total_in() as usize - base_in;
                if fed == data.len() && out.len() < out.capacity() {
                    break;
                }
            }
        }
    }
    Ok(())
}

#[cfg(test)]
#[path = "chunk_test.rs"]
mod chunk_test;

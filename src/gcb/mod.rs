//! Module implement group-compress blocks.
//!
//! A group-compress block packs many related texts into a single zlib
//! container while preserving random access. The first text is stored as
//! a fulltext, later texts are stored as byte-copy deltas against all the
//! uncompressed bytes accumulated so far, so a delta's compression parent
//! is always reachable within the same block, never across blocks.
//!
//! Use [Compressor] to accumulate records and seal them into a [Block].
//! Use [LazyGroup] to carry a block together with the (key, parents,
//! byte-range) of each record, either for serving extracts or for
//! streaming the block whole across a repository boundary.

use lazy_static::lazy_static;

use crate::util;

mod block;
mod compress;
mod wire;

pub use block::Block;
pub use compress::{Compressor, Kind};
pub use wire::{Entry, LazyGroup};

/// Magic prefix of a serialised block, zlib flavour.
pub const BLOCK_HEADER: &[u8] = b"gcb1z\n";

/// Magic prefix of the wire stripe serialisation of a [LazyGroup].
pub const WIRE_HEADER: &[u8] = b"groupcompress-block\n";

/// Default cap on the source bytes indexed for delta matching.
pub const MAX_BYTES_TO_INDEX: usize = 16 * 1024 * 1024;

/// Default utilisation percentage under which a reused block is rebuilt
/// rather than spliced in whole.
pub const REBUILD_THRESHOLD: u8 = 75;

lazy_static! {
    /// SHA-1 of the empty fulltext, the content hash of the null record.
    pub static ref NULL_SHA1: String = util::sha1_hex(b"");
}

/// Configuration for block compression, owned per store.
#[derive(Clone, Debug)]
pub struct Config {
    /// Cap on how many bytes of accumulated block content are indexed
    /// for delta matching. Texts beyond the cap still land in the block,
    /// only the compression ratio degrades.
    ///
    /// Default: [MAX_BYTES_TO_INDEX]
    pub max_bytes_to_index: usize,
    /// A block being copied between stores is reused whole when the
    /// requested records cover at least this percentage of its
    /// uncompressed size.
    ///
    /// Default: [REBUILD_THRESHOLD]
    pub rebuild_threshold: u8,
}

impl Default for Config {
    fn default() -> Config {
        Config {
            max_bytes_to_index: MAX_BYTES_TO_INDEX,
            rebuild_threshold: REBUILD_THRESHOLD,
        }
    }
}

impl<'a> arbitrary::Arbitrary<'a> for Config {
    fn arbitrary(u: &mut arbitrary::Unstructured) -> arbitrary::Result<Self> {
        let max_bytes_to_index = *u.choose(&[1024, 64 * 1024, MAX_BYTES_TO_INDEX])?;
        let rebuild_threshold = *u.choose(&[50, 75, 90])?;

        let config = Config {
            max_bytes_to_index,
            rebuild_threshold,
        };
        Ok(config)
    }
}

impl Config {
    pub fn new() -> Config {
        Config::default()
    }

    pub fn set_max_bytes_to_index(&mut self, max: usize) -> &mut Self {
        self.max_bytes_to_index = max;
        self
    }

    pub fn set_rebuild_threshold(&mut self, percent: u8) -> &mut Self {
        self.rebuild_threshold = percent;
        self
    }
}

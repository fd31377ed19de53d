//! Module implement the versioned-file store.
//!
//! A repository directory holds finalised pack files, one btree index
//! per pack and role, a staging area, and a `pack-names` index naming
//! the live packs,
//!
//! ```text
//! <root>/
//!   packs/<name>.pack       concatenated group-compress blocks
//!   indices/<name>.tix      text index, (file-id, revision-id) keys
//!   indices/<name>.rix      revision index
//!   indices/<name>.iix      inventory index
//!   indices/<name>.cix      chk node index, no graph
//!   upload/                 staging, renamed into packs/ atomically
//!   pack-names              btree index listing all packs
//!   lock/                   writer lock-directory
//! ```
//!
//! [PackStore] owns the directory and the single write group; a
//! [GcStore] is one role's view, mapping keys to records through the
//! combined btree indexes and the group-compress blocks. A commit never
//! partially updates the indexes, either the pack rename and the
//! pack-names rewrite both land or nothing becomes visible.

use serde::Deserialize;

use std::path;

use crate::{gcb::LazyGroup, Key, Result};

mod index;
mod lock;
mod pack;
#[allow(clippy::module_inception)]
mod store;

pub use index::{GcIndex, KeyRefs, Position};
pub use lock::{LockDir, LockGuard};
pub use pack::{PackStore, WriteGroup};
pub use store::{CheckReport, GcStore, RecordStream};

/// Default group size; a sealed block roughly this many uncompressed
/// bytes is flushed to the pack file.
pub const GROUP_SIZE: usize = 4 * 1024 * 1024;

/// Default lock acquisition policy.
pub const LOCK_ATTEMPTS: usize = 10;
pub const LOCK_BACKOFF_MS: u64 = 100;

/// Ordering contract for [GcStore::get_record_stream].
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum Ordering {
    /// Any legal order, the fastest the store can produce. Follows
    /// on-disk locality.
    Unordered,
    /// Every key's parents precede it, for keys within the stream.
    Topological,
    /// Deterministic block-locality order maximising whole-block reuse
    /// when copying to another store.
    GroupCompress,
    /// Exactly the input order.
    AsRequested,
}

/// One record out of, or into, a record stream.
pub enum Record {
    /// Reconstructed text.
    Fulltext {
        key: Key,
        parents: Vec<Key>,
        sha1: String,
        bytes: Vec<u8>,
    },
    /// Stored delta against its in-block compression parent. Only
    /// useful to consumers that carry the enclosing block context.
    Delta {
        key: Key,
        parents: Vec<Key>,
        sha1: String,
        delta: Vec<u8>,
    },
    /// A whole block stripe covering one or more keys, reusable
    /// verbatim by a receiving store.
    Block(LazyGroup),
    /// The key is not present in this store; the caller decides
    /// between ghost handling and an error.
    Absent { key: Key },
}

impl Record {
    pub fn to_keys(&self) -> Vec<Key> {
        match self {
            Record::Fulltext { key, .. } => vec![key.clone()],
            Record::Delta { key, .. } => vec![key.clone()],
            Record::Block(group) => group.to_keys(),
            Record::Absent { key } => vec![key.clone()],
        }
    }
}

/// Role of a store within the repository, selecting the index suffix
/// and key shape.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum Role {
    /// `(file-id, revision-id)` keyed file texts.
    Text,
    /// `(revision-id,)` keyed revision records.
    Revision,
    /// `(revision-id,)` keyed inventory records.
    Inventory,
    /// `(sha1-hash,)` keyed chk pages, no parent graph.
    Chk,
}

impl Role {
    pub fn to_suffix(&self) -> &'static str {
        match self {
            Role::Text => "tix",
            Role::Revision => "rix",
            Role::Inventory => "iix",
            Role::Chk => "cix",
        }
    }

    pub fn key_elements(&self) -> usize {
        match self {
            Role::Text => 2,
            _ => 1,
        }
    }

    pub fn has_graph(&self) -> bool {
        !matches!(self, Role::Chk)
    }

    pub fn iter() -> impl Iterator<Item = Role> {
        [Role::Text, Role::Revision, Role::Inventory, Role::Chk]
            .iter()
            .copied()
    }
}

/// Per-store configuration, loadable from a toml file.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Seal the current block once its uncompressed stream exceeds
    /// this many bytes.
    pub group_size: usize,
    /// Raise on an add whose key exists with different content, or
    /// log-and-skip when false.
    pub inconsistency_fatal: bool,
    /// Delta index cap, see [crate::gcb::Config].
    pub max_bytes_to_index: usize,
    /// Whole-block reuse threshold percentage.
    pub rebuild_threshold: u8,
    /// Writer lock retry policy.
    pub lock_attempts: usize,
    pub lock_backoff_ms: u64,
    /// Cache budgets.
    pub page_cache_bytes: usize,
    pub block_cache_count: usize,
    pub chk_cache_count: usize,
}

impl Default for StoreConfig {
    fn default() -> StoreConfig {
        StoreConfig {
            group_size: GROUP_SIZE,
            inconsistency_fatal: true,
            max_bytes_to_index: crate::gcb::MAX_BYTES_TO_INDEX,
            rebuild_threshold: crate::gcb::REBUILD_THRESHOLD,
            lock_attempts: LOCK_ATTEMPTS,
            lock_backoff_ms: LOCK_BACKOFF_MS,
            page_cache_bytes: crate::btree::PAGE_CACHE_BYTES,
            block_cache_count: 1,
            chk_cache_count: 1024,
        }
    }
}

impl StoreConfig {
    pub fn new() -> StoreConfig {
        StoreConfig::default()
    }

    /// Load from a toml file, unspecified fields keep their defaults.
    pub fn from_file<P>(loc: P) -> Result<StoreConfig>
    where
        P: AsRef<path::Path>,
    {
        crate::util::files::load_toml(loc)
    }

    pub fn set_group_size(&mut self, group_size: usize) -> &mut Self {
        self.group_size = group_size;
        self
    }

    pub fn set_inconsistency_fatal(&mut self, fatal: bool) -> &mut Self {
        self.inconsistency_fatal = fatal;
        self
    }

    pub fn set_max_bytes_to_index(&mut self, max: usize) -> &mut Self {
        self.max_bytes_to_index = max;
        self
    }

    pub fn set_rebuild_threshold(&mut self, percent: u8) -> &mut Self {
        self.rebuild_threshold = percent;
        self
    }

    pub fn to_gcb_config(&self) -> crate::gcb::Config {
        let mut config = crate::gcb::Config::new();
        config
            .set_max_bytes_to_index(self.max_bytes_to_index)
            .set_rebuild_threshold(self.rebuild_threshold);
        config
    }
}

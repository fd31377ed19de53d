//! Package implement content-addressed pack storage for versioned files.
//!
//! Storage is organised as an append-only repository of pack files. Each
//! pack file is a concatenation of group-compress blocks, a zlib container
//! packing many related texts with byte-copy deltas, and every pack is
//! described by immutable btree indexes mapping keys to byte ranges. On
//! top of the packs sit two structures,
//!
//! * [store::GcStore], named streams of records keyed by (file-id,
//!   revision-id) tuples, carrying an explicit parent graph.
//! * [chk::CHKMap], a persistent radix map keyed by hashed tuples, used
//!   to represent tree snapshots for incremental fetch.
//!
//! All on-disk structures are append-only at the file level. Logical
//! deletion writes a new root; old pages are reclaimed only by an explicit
//! pack operation that rewrites surviving records into fresh blocks.
//!
//! Single threaded by design. Writers hold an exclusive lock-directory on
//! the repository for the duration of a write group, readers see the
//! snapshot named by the pack-names index they opened with.

use std::{error, fmt, result};

/// Type alias for Result return type, used by this package.
pub type Result<T> = result::Result<T, Error>;

/// Keys into indexes, stores and maps are ordered tuples of short
/// byte strings, like `(file-id, revision-id)` or `(revision-id,)`.
/// Keys are value types, ordered lexicographically element-wise.
pub type Key = Vec<Vec<u8>>;

/// Error variants that are returned by this package's API.
///
/// Each variant carries a prefix, typically identifying the
/// error location, and a message.
pub enum Error {
    Fatal(String, String),
    IOError(String, String),
    FailConvert(String, String),
    InvalidFile(String, String),
    KeyNotFound(String, String),
    CorruptBlock(String, String),
    CorruptIndex(String, String),
    InconsistentAdd(String, String),
    LockContention(String, String),
    DeltaFail(String, String),
    UpgradeRequired(String, String),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> result::Result<(), fmt::Error> {
        use Error::*;

        match self {
            Fatal(p, msg) => write!(f, "{} Fatal: {}", p, msg),
            IOError(p, msg) => write!(f, "{} IOError: {}", p, msg),
            FailConvert(p, msg) => write!(f, "{} FailConvert: {}", p, msg),
            InvalidFile(p, msg) => write!(f, "{} InvalidFile: {}", p, msg),
            KeyNotFound(p, msg) => write!(f, "{} KeyNotFound: {}", p, msg),
            CorruptBlock(p, msg) => write!(f, "{} CorruptBlock: {}", p, msg),
            CorruptIndex(p, msg) => write!(f, "{} CorruptIndex: {}", p, msg),
            InconsistentAdd(p, msg) => write!(f, "{} InconsistentAdd: {}", p, msg),
            LockContention(p, msg) => write!(f, "{} LockContention: {}", p, msg),
            DeltaFail(p, msg) => write!(f, "{} DeltaFail: {}", p, msg),
            UpgradeRequired(p, msg) => write!(f, "{} UpgradeRequired: {}", p, msg),
        }
    }
}

impl fmt::Debug for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> result::Result<(), fmt::Error> {
        write!(f, "{}", self)
    }
}

impl error::Error for Error {}

/// Annotate an error with the file location raising it.
///
/// Either wrap a `Result`'s error into an [Error] variant, or raise a
/// fresh variant with `msg:` formatting.
#[macro_export]
macro_rules! err_at {
    ($v:ident, msg: $($arg:expr),+) => {{
        let prefix = format!("{}:{}", file!(), line!());
        Err($crate::Error::$v(prefix, format!($($arg),+)))
    }};
    ($v:ident, $e:expr) => {{
        match $e {
            Ok(val) => Ok(val),
            Err(err) => {
                let prefix = format!("{}:{}", file!(), line!());
                Err($crate::Error::$v(prefix, format!("{}", err)))
            }
        }
    }};
    ($v:ident, $e:expr, $($arg:expr),+) => {{
        match $e {
            Ok(val) => Ok(val),
            Err(err) => {
                let prefix = format!("{}:{}", file!(), line!());
                let msg = format!($($arg),+);
                Err($crate::Error::$v(prefix, format!("{} {}", err, msg)))
            }
        }
    }};
}

pub mod btree;
pub mod chk;
pub mod delta;
pub mod gcb;
pub mod inventory;
pub mod store;
pub mod util;

pub use store::{GcStore, Ordering, PackStore, Record, StoreConfig};

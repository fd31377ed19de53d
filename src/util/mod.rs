//! Module implement common utility functions and types.

use sha1::{Digest, Sha1};

use crate::Result;

pub mod files;
pub mod lru;

pub use lru::Lru;

#[macro_export]
macro_rules! read_file {
    ($fd:expr, $seek:expr, $n:expr, $msg:expr) => {{
        use std::convert::TryFrom;

        match $fd.seek($seek) {
            Ok(_) => {
                let mut buf = vec![0; usize::try_from($n).unwrap()];
                match $fd.read(&mut buf) {
                    Ok(n) if buf.len() == n => Ok(buf),
                    Ok(n) => {
                        let m = buf.len();
                        err_at!(Fatal, msg: concat!($msg, " {}/{} at {:?}"), m, n, $seek)
                    }
                    Err(err) => err_at!(IOError, Err(err)),
                }
            }
            Err(err) => err_at!(IOError, Err(err)),
        }
    }};
}

/// Append `val` to `out` as a base-128 varint, seven low bits at a
/// time, high bit marking continuation.
pub fn encode_base128_int(mut val: u64, out: &mut Vec<u8>) {
    loop {
        let byte = (val & 0x7f) as u8;
        val >>= 7;
        if val > 0 {
            out.push(byte | 0x80);
        } else {
            out.push(byte);
            break;
        }
    }
}

/// Decode a base-128 varint from the head of `buf`. Return the value
/// and the number of bytes consumed.
pub fn decode_base128_int(buf: &[u8]) -> Result<(u64, usize)> {
    let mut val: u64 = 0;
    let mut shift = 0;
    for (n, byte) in buf.iter().enumerate() {
        if shift > 63 {
            return err_at!(FailConvert, msg: "varint overflow");
        }
        val |= u64::from(byte & 0x7f) << shift;
        if byte & 0x80 == 0 {
            return Ok((val, n + 1));
        }
        shift += 7;
    }
    err_at!(FailConvert, msg: "varint truncated at {}", buf.len())
}

/// Hex encode `bytes`, lower case.
pub fn to_hex(bytes: &[u8]) -> String {
    let mut s = String::with_capacity(bytes.len() * 2);
    for byte in bytes {
        s.push_str(&format!("{:02x}", byte));
    }
    s
}

/// SHA-1 of `data` as a 40 character lower-case hex string.
pub fn sha1_hex(data: &[u8]) -> String {
    let mut hasher = Sha1::new();
    hasher.update(data);
    to_hex(&hasher.finalize())
}

/// Longest common prefix of two byte strings.
pub fn common_prefix<'a>(a: &'a [u8], b: &[u8]) -> &'a [u8] {
    let n = a.iter().zip(b.iter()).take_while(|(x, y)| x == y).count();
    &a[..n]
}

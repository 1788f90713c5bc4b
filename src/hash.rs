//! Fast content hashing for change detection and duplicate grouping.
//!
//! Object contents are identified by a streaming xxHash64 — fast enough to run
//! over every file of every layer, and strong enough to group duplicates.
//! It is not a cryptographic digest; layer digests stay sha256 as recorded in
//! the image manifest.

use std::hash::Hasher;
use std::io::{self, Read};
use twox_hash::XxHash64;

const HASH_BUF_SIZE: usize = 64 * 1024;

/// Streams a reader through xxHash64 without buffering the whole content.
pub fn hash_reader<R: Read>(mut reader: R) -> io::Result<u64> {
    let mut hasher = XxHash64::with_seed(0);
    let mut buf = [0u8; HASH_BUF_SIZE];
    loop {
        let n = reader.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.write(&buf[..n]);
    }
    Ok(hasher.finish())
}

pub fn hash_bytes(data: &[u8]) -> u64 {
    let mut hasher = XxHash64::with_seed(0);
    hasher.write(data);
    hasher.finish()
}

/// Lowercase hex rendering used in reports and matcher input.
pub fn to_hex(hash: u64) -> String {
    format!("{:016x}", hash)
}

/// Parses a hex hash string, case-insensitive, with or without a `0x` prefix.
pub fn parse_hex(s: &str) -> Option<u64> {
    let s = s.trim();
    let s = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")).unwrap_or(s);
    u64::from_str_radix(s, 16).ok()
}

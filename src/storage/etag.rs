//! ETag helpers. The tag is a cheap fingerprint of (size, mtime), not a content hash:
//! any write moves one of the two, which is all HTTP caching needs.

use std::time::{SystemTime, UNIX_EPOCH};

use xxhash_rust::xxh3::xxh3_64;

/// Modification time as 100ns ticks since the Unix epoch (0 for pre-epoch clocks).
pub fn mtime_ticks(modified: SystemTime) -> u64 {
    modified
        .duration_since(UNIX_EPOCH)
        .map(|d| (d.as_nanos() / 100) as u64)
        .unwrap_or(0)
}

/// Fixed-width (16 hex digits) unquoted ETag for a blob of `size` bytes last written at `modified`.
pub fn etag_for(size: u64, modified: SystemTime) -> String {
    let mut buf = [0u8; 16];
    buf[..8].copy_from_slice(&size.to_le_bytes());
    buf[8..].copy_from_slice(&mtime_ticks(modified).to_le_bytes());
    format!("{:016x}", xxh3_64(&buf))
}

/// True if an `If-None-Match` header value matches `etag` (quoted or weak forms accepted).
pub fn if_none_match_hits(header: &str, etag: &str) -> bool {
    header.split(',').map(|t| t.trim()).any(|t| {
        if t == "*" {
            return true;
        }
        let t = t.strip_prefix("W/").unwrap_or(t);
        t.trim_matches('"') == etag
    })
}

//! Shared primitive types and time helpers

use std::time::{SystemTime, UNIX_EPOCH};

/// 32-byte hash (double SHA-256 everywhere in this codebase)
pub type Hash = [u8; 32];

/// All-zero hash, used as "no stop hash" in getheaders and as the
/// genesis prev_hash.
pub const ZERO_HASH: Hash = [0u8; 32];

/// Chain work accumulator. 128 bits is enough headroom for any realistic
/// difficulty schedule on a 100-byte-header chain.
pub type Work = u128;

/// Current unix time in seconds
pub fn now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

/// Current unix time in microseconds
pub fn now_us() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_micros() as i64)
        .unwrap_or(0)
}

/// Short hex prefix for log lines
pub fn short_hash(hash: &Hash) -> String {
    hex::encode(&hash[..8])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_short_hash() {
        let mut h = [0u8; 32];
        h[0] = 0xab;
        h[1] = 0xcd;
        assert_eq!(&short_hash(&h)[..4], "abcd");
    }

    #[test]
    fn test_now_monotonic_enough() {
        let a = now_us();
        let b = now_us();
        assert!(b >= a);
    }
}

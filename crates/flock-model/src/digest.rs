/// FNV-1a content digest.
///
/// Used by the control-volume store to decide whether the shared
/// configuration changed since it was last loaded, without comparing
/// payloads byte for byte.

/// FNV-1a 64-bit initial basis.
const FNV1A_64_INIT: u64 = 0xcbf2_9ce4_8422_2325;
/// FNV-1a 64-bit prime.
const FNV_64_PRIME: u64 = 0x0100_0000_01b3;

/// Compute FNV-1a hash over a byte buffer.
#[inline]
pub fn fnv_64a_buf(buf: &[u8], mut hval: u64) -> u64 {
    for &byte in buf {
        hval ^= byte as u64;
        hval = hval.wrapping_mul(FNV_64_PRIME);
    }
    hval
}

/// Compute FNV-1a hash over a single u64 value.
#[inline]
pub fn fnv_64a_64(val: u64, mut hval: u64) -> u64 {
    for i in 0..8 {
        hval ^= (val >> (i * 8)) & 0xff;
        hval = hval.wrapping_mul(FNV_64_PRIME);
    }
    hval
}

/// Digest a byte buffer to a u64 (double-hash for better distribution).
#[inline]
pub fn content_digest(buf: &[u8]) -> u64 {
    let hval = fnv_64a_buf(buf, FNV1A_64_INIT);
    fnv_64a_64(hval, hval)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_digest_deterministic() {
        assert_eq!(content_digest(b"cluster"), content_digest(b"cluster"));
    }

    #[test]
    fn test_digest_differs() {
        assert_ne!(content_digest(b"cluster"), content_digest(b"cluster2"));
    }
}

const FNV32_OFFSET: u32 = 0x811c_9dc5;
const FNV32_PRIME: u32 = 0x0100_0193;

/// 32-bit FNV-1a over the key bytes.
pub fn fnv1a32(key: &[u8]) -> u32 {
    let mut hash = FNV32_OFFSET;
    for byte in key {
        hash ^= *byte as u32;
        hash = hash.wrapping_mul(FNV32_PRIME);
    }
    hash
}

/// Maps a key to one of `bucket_count` partitions using the top bits of its hash.
///
/// `bucket_count` must be a power of two; the route parser guarantees it.
pub fn bucket_for_key(key: &str, bucket_count: u32) -> u32 {
    if bucket_count <= 1 {
        return 0;
    }
    let width = bucket_count.trailing_zeros();
    fnv1a32(key.as_bytes()) >> (32 - width)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fnv1a32_reference_vectors() {
        assert_eq!(fnv1a32(b""), 0x811c_9dc5);
        assert_eq!(fnv1a32(b"a"), 0xe40c_292c);
        assert_eq!(fnv1a32(b"foobar"), 0xbf9c_f968);
    }

    #[test]
    fn test_bucket_is_stable_and_in_range() {
        for key in ["a", "user:1", "user:2", "some/longer/key"] {
            let first = bucket_for_key(key, 16);
            assert!(first < 16);
            assert_eq!(first, bucket_for_key(key, 16));
        }
    }

    #[test]
    fn test_single_bucket_always_zero() {
        assert_eq!(bucket_for_key("anything", 1), 0);
    }

    #[test]
    fn test_bucket_uses_top_bits() {
        let hash = fnv1a32(b"foobar");
        assert_eq!(bucket_for_key("foobar", 16), hash >> 28);
        assert_eq!(bucket_for_key("foobar", 2), hash >> 31);
    }
}

//! 64-bit FNV-1a, used to pick key directory shards.

const OFFSET_BASIS: u64 = 0xcbf2_9ce4_8422_2325;
const PRIME: u64 = 0x0000_0100_0000_01b3;

/// Hash `key` with 64-bit FNV-1a.
#[inline]
pub fn fnv1a64(key: &[u8]) -> u64 {
    let mut hash = OFFSET_BASIS;
    for &byte in key {
        hash ^= byte as u64;
        hash = hash.wrapping_mul(PRIME);
    }
    hash
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_known_vectors() {
        assert_eq!(fnv1a64(b""), 0xcbf29ce484222325);
        assert_eq!(fnv1a64(b"a"), 0xaf63dc4c8601ec8c);
        assert_eq!(fnv1a64(b"foobar"), 0x85944171f73967e8);
    }

    #[test]
    fn test_deterministic() {
        assert_eq!(fnv1a64(b"some key"), fnv1a64(b"some key"));
        assert_ne!(fnv1a64(b"key1"), fnv1a64(b"key2"));
    }
}

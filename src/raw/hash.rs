// Hash mixing.
//
// Segments are selected by the high bits of a hash and buckets by the low
// bits of the same hash, so both ends must carry entropy even when the
// underlying hasher is weak (e.g. an identity hash for integers).

/// Folds a 64-bit hash into 32 bits and applies a Wang/Jenkins avalanche.
#[inline]
pub fn spread(hash: u64) -> u32 {
    let mut h = (hash ^ (hash >> 32)) as u32;

    h = h.wrapping_add((h << 15) ^ 0xffff_cd7d);
    h ^= h >> 10;
    h = h.wrapping_add(h << 3);
    h ^= h >> 6;
    h = h.wrapping_add((h << 2).wrapping_add(h << 14));
    h ^ (h >> 16)
}

#[cfg(test)]
mod tests {
    use super::spread;
    use std::collections::HashSet;

    #[test]
    fn deterministic() {
        for i in 0..1024u64 {
            assert_eq!(spread(i), spread(i));
        }
    }

    #[test]
    fn sequential_keys_reach_high_bits() {
        // An identity hash leaves the top bits of small integers at zero.
        let segments: HashSet<u32> = (0..256u64).map(|i| spread(i) >> 28).collect();
        assert!(segments.len() >= 8, "{segments:?}");
    }

    #[test]
    fn sequential_keys_spread_low_bits() {
        let buckets: HashSet<u32> = (0..256u64).map(|i| spread(i) & 0xff).collect();
        assert!(buckets.len() >= 96, "{}", buckets.len());
    }
}

//! Point arithmetic for the attribute hyperspace.
//!
//! Every subspace projects a subset of a space's attributes. A record's
//! per-attribute hashes are interlaced into a single 64-bit point, and
//! regions tile the point space by bit prefix.

/// Mask selecting the top `prefix` bits of a point.
pub fn prefixmask(prefix: u8) -> u64 {
    match prefix {
        0 => 0,
        64.. => u64::MAX,
        p => !(u64::MAX >> p),
    }
}

/// Interlace the given hashes into one 64-bit point, taking one bit from
/// each hash in turn, most significant first. A single hash passes
/// through unchanged.
pub fn interlace(hashes: &[u64]) -> u64 {
    if hashes.is_empty() {
        return 0;
    }

    let mut point = 0u64;
    let mut which = 0usize;
    let mut shift = 63u32;

    for bit in (0..64u32).rev() {
        let h = hashes[which];
        point |= ((h >> shift) & 1) << bit;

        which += 1;

        if which == hashes.len() {
            which = 0;
            shift = shift.saturating_sub(1);
        }
    }

    point
}

/// The point a record occupies within a subspace described by `dims`.
///
/// `dims[0]` selects the key dimension; `dims[i]` for `i > 0` selects
/// value attribute `i - 1`.
pub fn replication_point(key_hash: u64, value_hashes: &[u64], dims: &[bool]) -> u64 {
    let mut selected = Vec::with_capacity(dims.len());

    for (i, on) in dims.iter().enumerate() {
        if !on {
            continue;
        }

        if i == 0 {
            selected.push(key_hash);
        } else {
            selected.push(value_hashes[i - 1]);
        }
    }

    interlace(&selected)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn prefixmask_edges() {
        assert_eq!(prefixmask(0), 0);
        assert_eq!(prefixmask(1), 0x8000_0000_0000_0000);
        assert_eq!(prefixmask(8), 0xff00_0000_0000_0000);
        assert_eq!(prefixmask(64), u64::MAX);
    }

    #[test]
    fn single_dimension_interlace_is_identity() {
        assert_eq!(interlace(&[0xdead_beef_cafe_f00d]), 0xdead_beef_cafe_f00d);
    }

    #[test]
    fn two_dimension_interlace_alternates_bits() {
        // All-ones against all-zeroes yields alternating bits starting
        // with the first hash's msb.
        assert_eq!(interlace(&[u64::MAX, 0]), 0xaaaa_aaaa_aaaa_aaaa);
        assert_eq!(interlace(&[0, u64::MAX]), 0x5555_5555_5555_5555);
    }

    #[test]
    fn key_only_subspace_uses_the_key_hash() {
        let point = replication_point(42, &[1, 2, 3], &[true, false, false, false]);
        assert_eq!(point, 42);
    }

    proptest! {
        #[test]
        fn interlace_msb_tracks_first_hash(a: u64, b: u64) {
            let point = interlace(&[a, b]);
            prop_assert_eq!(point >> 63, a >> 63);
        }

        #[test]
        fn replication_point_is_deterministic(key: u64, v1: u64, v2: u64) {
            let dims = [true, true, true];
            let p1 = replication_point(key, &[v1, v2], &dims);
            let p2 = replication_point(key, &[v1, v2], &dims);
            prop_assert_eq!(p1, p2);
        }
    }
}

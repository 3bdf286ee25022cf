//! Deterministic block sizing
//!
//! Both peers derive the delta block size from the source file size carried
//! in the manifest, so no negotiation happens on the wire. The receiver
//! chops its basis file into blocks of this size (final block may be
//! short); the sender searches for matches with the same size.

pub const KIB: u64 = 1024;
pub const MIB: u64 = 1024 * KIB;
pub const GIB: u64 = 1024 * MIB;

/// Block size tier for a file of `len` bytes.
///
/// Files under 128 KiB use a single block spanning the whole file; larger
/// files step through fixed tiers so signature counts stay bounded
/// (a 64 GiB file yields 512 block signatures at 128 MiB blocks).
#[must_use]
pub const fn block_size_for(len: u64) -> u64 {
    if len < 128 * KIB {
        len
    } else if len < 16 * MIB {
        128 * KIB
    } else if len < 256 * MIB {
        MIB
    } else if len < 4 * GIB {
        16 * MIB
    } else if len < 64 * GIB {
        128 * MIB
    } else {
        GIB
    }
}

/// Number of blocks a basis file of `len` bytes splits into.
#[must_use]
pub const fn block_count(len: u64, block_size: u64) -> u64 {
    if len == 0 || block_size == 0 {
        0
    } else {
        len.div_ceil(block_size)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case(0, 0)]
    #[case(1, 1)]
    #[case(127 * KIB, 127 * KIB)]
    #[case(128 * KIB - 1, 128 * KIB - 1)]
    #[case(128 * KIB, 128 * KIB)]
    #[case(16 * MIB - 1, 128 * KIB)]
    #[case(16 * MIB, MIB)]
    #[case(256 * MIB - 1, MIB)]
    #[case(256 * MIB, 16 * MIB)]
    #[case(4 * GIB - 1, 16 * MIB)]
    #[case(4 * GIB, 128 * MIB)]
    #[case(64 * GIB - 1, 128 * MIB)]
    #[case(64 * GIB, GIB)]
    fn tier_boundaries(#[case] len: u64, #[case] expected: u64) {
        // Both peers derive this from the manifest size alone, so the
        // boundaries must be exact.
        assert_eq!(block_size_for(len), expected);
    }

    #[test]
    fn counts() {
        assert_eq!(block_count(0, 0), 0);
        assert_eq!(block_count(6, 6), 1);
        assert_eq!(block_count(2 * MIB, 128 * KIB), 16);
        assert_eq!(block_count(2 * MIB + 1, 128 * KIB), 17);
    }
}

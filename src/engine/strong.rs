//! Strong content hashing
//!
//! A weak-checksum hit is only a candidate; the 128-bit xxh3 digest
//! confirms actual content equality. The same digest, computed in
//! streaming form, provides the whole-file integrity value carried in
//! FILE_END. xxh3 is non-cryptographic and collision resistance is not a
//! goal here; the whole-file check backstops block-level collisions.

use xxhash_rust::xxh3::{xxh3_128, Xxh3};

/// 128-bit digest of one block.
#[must_use]
pub fn block_digest(data: &[u8]) -> u128 {
    xxh3_128(data)
}

/// Streaming digest for whole-file integrity.
///
/// Fed incrementally by the delta matcher (as source bytes are consumed)
/// and by the reconstructor (as reconstructed bytes are written), so
/// neither side re-reads a file just to hash it.
#[derive(Default)]
pub struct FileDigest {
    state: Xxh3,
}

impl FileDigest {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update(&mut self, data: &[u8]) {
        self.state.update(data);
    }

    #[must_use]
    pub fn finish(&self) -> u128 {
        self.state.digest128()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn block_digest_distinguishes_content() {
        assert_eq!(block_digest(b"hello"), block_digest(b"hello"));
        assert_ne!(block_digest(b"hello"), block_digest(b"hellO"));
    }

    #[test]
    fn streaming_matches_one_shot() {
        let data: Vec<u8> = (0u32..100_000).map(|i| (i % 256) as u8).collect();
        let mut digest = FileDigest::new();
        for chunk in data.chunks(7919) {
            digest.update(chunk);
        }
        assert_eq!(digest.finish(), block_digest(&data));
    }

    #[test]
    fn empty_input() {
        let digest = FileDigest::new();
        assert_eq!(digest.finish(), block_digest(&[]));
    }
}

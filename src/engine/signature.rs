//! Block signatures and the sender-side match index
//!
//! The receiver splits its basis file into fixed-size blocks (the last may
//! be short) and sends one signature per block: offset, length, weak
//! rolling checksum, strong hash. The sender builds a transient
//! [`SignatureIndex`] over them for the duration of one file's delta
//! phase.

use std::collections::HashMap;
use std::io::Read;

use crate::engine::rolling::weak_checksum;
use crate::engine::strong::block_digest;
use crate::error::Result;

/// Signature of one receiver-side block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockSignature {
    /// Byte offset of the block in the basis file.
    pub offset: u64,
    /// Block length; less than the block size only for the final block.
    pub len: u32,
    /// Weak rolling checksum of the block.
    pub weak: u32,
    /// 128-bit strong hash of the block.
    pub strong: u128,
}

/// Compute signatures for a basis file read sequentially from `reader`.
///
/// `block_size` comes from the manifest (source) size so both peers agree
/// without negotiation; it is non-zero for any non-empty file.
pub fn compute_signatures<R: Read>(
    reader: &mut R,
    file_len: u64,
    block_size: u64,
) -> Result<Vec<BlockSignature>> {
    let mut signatures = Vec::with_capacity(crate::engine::block::block_count(file_len, block_size) as usize);
    if file_len == 0 || block_size == 0 {
        return Ok(signatures);
    }

    let mut buf = vec![0u8; block_size.min(file_len) as usize];
    let mut offset = 0u64;
    while offset < file_len {
        let want = block_size.min(file_len - offset) as usize;
        reader.read_exact(&mut buf[..want])?;
        let block = &buf[..want];
        signatures.push(BlockSignature {
            offset,
            len: want as u32,
            weak: weak_checksum(block),
            strong: block_digest(block),
        });
        offset += want as u64;
    }
    Ok(signatures)
}

/// Candidate entry in a weak-hash bucket.
#[derive(Debug, Clone, Copy)]
pub struct Candidate {
    pub block_index: u32,
    pub len: u32,
    pub weak: u32,
    pub strong: u128,
}

/// Hash index over block signatures, keyed by the low 16 bits of the weak
/// checksum.
///
/// Bucket chains are in ascending block index (insertion order), so the
/// first confirmed candidate is always the earliest block and matching is
/// deterministic. Two distinct blocks reporting the same strong hash is
/// treated as a corruption signal handled by the whole-file check at
/// FILE_END; the index keeps both and the earlier wins.
pub struct SignatureIndex {
    buckets: HashMap<u16, Vec<Candidate>>,
    /// Length of the final (short) block, when it differs from `block_size`.
    short_len: Option<u32>,
    block_size: u32,
}

impl SignatureIndex {
    #[must_use]
    pub fn build(signatures: &[BlockSignature], block_size: u64) -> Self {
        let mut buckets: HashMap<u16, Vec<Candidate>> = HashMap::with_capacity(signatures.len());
        let mut short_len = None;
        for (index, sig) in signatures.iter().enumerate() {
            if u64::from(sig.len) < block_size {
                short_len = Some(sig.len);
            }
            buckets
                .entry((sig.weak & 0xFFFF) as u16)
                .or_default()
                .push(Candidate {
                    block_index: index as u32,
                    len: sig.len,
                    weak: sig.weak,
                    strong: sig.strong,
                });
        }
        Self {
            buckets,
            short_len,
            block_size: block_size as u32,
        }
    }

    /// Candidates whose full weak value and block length both match.
    pub fn candidates(&self, weak: u32, len: u32) -> impl Iterator<Item = &Candidate> {
        self.buckets
            .get(&((weak & 0xFFFF) as u16))
            .map(Vec::as_slice)
            .unwrap_or_default()
            .iter()
            .filter(move |c| c.weak == weak && c.len == len)
    }

    /// The distinct block lengths present, longest first. At most two: the
    /// full block size and a short tail.
    #[must_use]
    pub fn window_lengths(&self) -> Vec<u32> {
        let mut lengths = Vec::with_capacity(2);
        if self.buckets.values().any(|b| b.iter().any(|c| c.len == self.block_size)) {
            lengths.push(self.block_size);
        }
        if let Some(short) = self.short_len {
            lengths.push(short);
        }
        lengths
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.buckets.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn signatures_cover_file_with_short_tail() {
        let data = vec![7u8; 10_000];
        let sigs = compute_signatures(&mut Cursor::new(&data), 10_000, 4096).unwrap();
        assert_eq!(sigs.len(), 3);
        assert_eq!(sigs[0].offset, 0);
        assert_eq!(sigs[0].len, 4096);
        assert_eq!(sigs[2].offset, 8192);
        assert_eq!(sigs[2].len, 10_000 - 8192);
        // Identical content yields identical block hashes.
        assert_eq!(sigs[0].strong, sigs[1].strong);
    }

    #[test]
    fn empty_file_yields_no_signatures() {
        let sigs = compute_signatures(&mut Cursor::new(&[]), 0, 0).unwrap();
        assert!(sigs.is_empty());
    }

    #[test]
    fn index_filters_on_full_weak_and_length() {
        let data: Vec<u8> = (0u32..8192).map(|i| (i % 251) as u8).collect();
        let sigs = compute_signatures(&mut Cursor::new(&data), 8192, 4096).unwrap();
        let index = SignatureIndex::build(&sigs, 4096);

        let hits: Vec<_> = index.candidates(sigs[1].weak, sigs[1].len).collect();
        assert!(hits.iter().any(|c| c.block_index == 1));
        // Wrong length rules a candidate out even when the weak matches.
        assert_eq!(index.candidates(sigs[1].weak, 17).count(), 0);
    }

    #[test]
    fn chains_stay_in_ascending_block_order() {
        // Two identical blocks share weak and strong values; the earlier
        // index must come first in the chain.
        let data = vec![3u8; 8192];
        let sigs = compute_signatures(&mut Cursor::new(&data), 8192, 4096).unwrap();
        let index = SignatureIndex::build(&sigs, 4096);
        let hits: Vec<_> = index.candidates(sigs[0].weak, 4096).collect();
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].block_index, 0);
        assert_eq!(hits[1].block_index, 1);
    }

    #[test]
    fn window_lengths_longest_first() {
        let data = vec![9u8; 10_000];
        let sigs = compute_signatures(&mut Cursor::new(&data), 10_000, 4096).unwrap();
        let index = SignatureIndex::build(&sigs, 4096);
        assert_eq!(index.window_lengths(), vec![4096, 10_000 - 8192]);
    }
}

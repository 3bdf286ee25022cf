//! Delta matcher
//!
//! Consumes the sender's source file as a sequential byte stream and the
//! signature index built from the receiver's blocks, and produces the
//! ordered COPY/LITERAL instruction stream that reconstructs the source
//! byte-for-byte on top of the receiver's basis file.
//!
//! The matcher is pull-based: the session calls
//! [`DeltaMatcher::next_instruction`] and forwards each instruction to the
//! wire, so no file-sized buffering happens anywhere. The working buffer
//! holds at most one unflushed literal run plus one match window.
//!
//! Matching keeps one rolling window per distinct receiver block length
//! (the full block size, plus the short tail length when the basis file
//! does not divide evenly). Windows are tried longest-first at each
//! position; a strong-hash-confirmed hit is taken greedily, and every
//! window restarts fresh after a copy since the rolling update needs the
//! byte leaving the window.

use std::collections::VecDeque;
use std::io::Read;

use crate::engine::rolling::RollingChecksum;
use crate::engine::signature::SignatureIndex;
use crate::engine::strong::{block_digest, FileDigest};
use crate::error::Result;

/// Protocol cap on one LITERAL frame's pre-compression payload.
pub const MAX_LITERAL: usize = 1 << 20;

/// Read granularity for filling the working buffer.
const READ_CHUNK: usize = 256 * 1024;

/// One reconstruction instruction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Instruction {
    /// Copy block `block_index` (its full stored length) from the basis file.
    Copy { block_index: u32, len: u32 },
    /// Append these bytes verbatim.
    Literal(Vec<u8>),
}

/// Byte accounting for one file's delta run.
#[derive(Debug, Default, Clone, Copy)]
pub struct DeltaSummary {
    /// Bytes read from the source file.
    pub bytes_read: u64,
    /// Bytes emitted as literal payload.
    pub literal_bytes: u64,
    /// Bytes covered by COPY instructions (elided from the wire).
    pub copy_bytes: u64,
}

struct Window {
    len: u32,
    /// None until (re)computed fresh at the current position; windows die
    /// (stay None) once they no longer fit in the remaining source.
    state: Option<RollingChecksum>,
}

/// Streaming matcher over one source file.
pub struct DeltaMatcher<R: Read> {
    reader: R,
    file_len: u64,
    index: SignatureIndex,
    /// Working buffer covering `[buf_start, buf_start + buf.len())` of the file.
    buf: Vec<u8>,
    buf_start: u64,
    /// Match cursor.
    pos: u64,
    /// Start of the unflushed literal run; always `<= pos`.
    lit_start: u64,
    windows: Vec<Window>,
    digest: FileDigest,
    pending: VecDeque<Instruction>,
    summary: DeltaSummary,
    exhausted: bool,
}

impl<R: Read> DeltaMatcher<R> {
    pub fn new(reader: R, file_len: u64, index: SignatureIndex) -> Self {
        let windows = index
            .window_lengths()
            .into_iter()
            .map(|len| Window { len, state: None })
            .collect();
        Self {
            reader,
            file_len,
            index,
            buf: Vec::new(),
            buf_start: 0,
            pos: 0,
            lit_start: 0,
            windows,
            digest: FileDigest::new(),
            pending: VecDeque::new(),
            summary: DeltaSummary::default(),
            exhausted: false,
        }
    }

    /// Next instruction in stream order, or `None` once the whole file has
    /// been covered.
    pub fn next_instruction(&mut self) -> Result<Option<Instruction>> {
        loop {
            if let Some(instr) = self.pending.pop_front() {
                return Ok(Some(instr));
            }
            if self.exhausted {
                return Ok(None);
            }
            self.step()?;
        }
    }

    /// Whole-file digest and byte counters; valid after the stream has
    /// been drained.
    #[must_use]
    pub fn finish(self) -> (u128, DeltaSummary) {
        (self.digest.finish(), self.summary)
    }

    fn buffered_end(&self) -> u64 {
        self.buf_start + self.buf.len() as u64
    }

    fn rel(&self, abs: u64) -> usize {
        (abs - self.buf_start) as usize
    }

    /// Read until the buffer covers the file up to `abs_end`.
    fn ensure_buffered(&mut self, abs_end: u64) -> Result<()> {
        debug_assert!(abs_end <= self.file_len);
        while self.buffered_end() < abs_end {
            let want = (self.file_len - self.buffered_end()).min(READ_CHUNK as u64) as usize;
            let old_len = self.buf.len();
            self.buf.resize(old_len + want, 0);
            // A short read here means the file shrank under us; surface it
            // as an I/O error and let the session record a per-file failure.
            self.reader.read_exact(&mut self.buf[old_len..])?;
            self.digest.update(&self.buf[old_len..]);
            self.summary.bytes_read += want as u64;
        }
        Ok(())
    }

    /// Drop buffered bytes no longer reachable by the literal run or the
    /// match windows.
    fn compact(&mut self) {
        let keep_from = self.lit_start.min(self.pos);
        let waste = self.rel(keep_from);
        if waste >= MAX_LITERAL {
            self.buf.drain(..waste);
            self.buf_start = keep_from;
        }
    }

    /// Queue the literal run `[lit_start, end)` in capped chunks.
    fn flush_literal(&mut self, end: u64) {
        while self.lit_start < end {
            let take = ((end - self.lit_start) as usize).min(MAX_LITERAL);
            let from = self.rel(self.lit_start);
            let chunk = self.buf[from..from + take].to_vec();
            self.summary.literal_bytes += take as u64;
            self.pending.push_back(Instruction::Literal(chunk));
            self.lit_start += take as u64;
        }
    }

    /// Longest active window first; windows that no longer fit are dead.
    fn best_match(&mut self) -> Result<Option<(u32, u32)>> {
        for i in 0..self.windows.len() {
            let len = self.windows[i].len;
            if self.pos + u64::from(len) > self.file_len {
                self.windows[i].state = None;
                continue;
            }
            self.ensure_buffered(self.pos + u64::from(len))?;
            let from = self.rel(self.pos);
            let state = match self.windows[i].state {
                Some(state) => state,
                None => {
                    let fresh =
                        RollingChecksum::from_window(&self.buf[from..from + len as usize]);
                    self.windows[i].state = Some(fresh);
                    fresh
                }
            };
            let weak = state.value();
            let mut candidates = self.index.candidates(weak, len).peekable();
            if candidates.peek().is_some() {
                // Strong hash only on a weak hit.
                let strong = block_digest(&self.buf[from..from + len as usize]);
                if let Some(hit) = candidates.find(|c| c.strong == strong) {
                    return Ok(Some((hit.block_index, hit.len)));
                }
            }
        }
        Ok(None)
    }

    fn any_window_fits(&self) -> bool {
        self.windows
            .iter()
            .any(|w| self.pos + u64::from(w.len) <= self.file_len)
    }

    /// Advance the matcher until at least one instruction is queued or the
    /// file is fully covered.
    fn step(&mut self) -> Result<()> {
        if self.pos < self.file_len && self.any_window_fits() {
            if let Some((block_index, len)) = self.best_match()? {
                self.flush_literal(self.pos);
                self.summary.copy_bytes += u64::from(len);
                self.pending
                    .push_back(Instruction::Copy { block_index, len });
                self.pos += u64::from(len);
                self.lit_start = self.pos;
                for w in &mut self.windows {
                    w.state = None;
                }
                self.compact();
                return Ok(());
            }

            // Miss: slide every live window one byte.
            self.ensure_buffered((self.pos + 1).min(self.file_len))?;
            let old = self.buf[self.rel(self.pos)];
            for i in 0..self.windows.len() {
                let len = u64::from(self.windows[i].len);
                if self.pos + 1 + len <= self.file_len {
                    self.ensure_buffered(self.pos + 1 + len)?;
                    let new = self.buf[self.rel(self.pos + len)];
                    if let Some(state) = self.windows[i].state.as_mut() {
                        state.roll(old, new);
                    }
                } else {
                    self.windows[i].state = None;
                }
            }
            self.pos += 1;
            if self.pos - self.lit_start >= MAX_LITERAL as u64 {
                self.flush_literal(self.lit_start + MAX_LITERAL as u64);
                self.compact();
            }
            return Ok(());
        }

        // No window can match the remaining tail (or there were no
        // signatures at all): everything left is literal.
        if self.lit_start < self.file_len {
            let end = self.file_len.min(self.lit_start + MAX_LITERAL as u64);
            self.ensure_buffered(end)?;
            self.flush_literal(end);
            self.pos = self.pos.max(self.lit_start);
            self.compact();
            if self.lit_start >= self.file_len {
                self.exhausted = true;
            }
        } else {
            self.exhausted = true;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::signature::{compute_signatures, BlockSignature};
    use std::io::Cursor;

    fn index_for(basis: &[u8], block_size: u64) -> (Vec<BlockSignature>, SignatureIndex) {
        let sigs =
            compute_signatures(&mut Cursor::new(basis), basis.len() as u64, block_size).unwrap();
        let index = SignatureIndex::build(&sigs, block_size);
        (sigs, index)
    }

    fn run_matcher(source: &[u8], index: SignatureIndex) -> (Vec<Instruction>, u128, DeltaSummary) {
        let mut matcher = DeltaMatcher::new(Cursor::new(source), source.len() as u64, index);
        let mut instructions = Vec::new();
        while let Some(instr) = matcher.next_instruction().unwrap() {
            instructions.push(instr);
        }
        let (digest, summary) = matcher.finish();
        (instructions, digest, summary)
    }

    fn apply(basis: &[u8], sigs: &[BlockSignature], instructions: &[Instruction]) -> Vec<u8> {
        let mut out = Vec::new();
        for instr in instructions {
            match instr {
                Instruction::Copy { block_index, len } => {
                    let sig = &sigs[*block_index as usize];
                    assert_eq!(sig.len, *len);
                    let start = sig.offset as usize;
                    out.extend_from_slice(&basis[start..start + *len as usize]);
                }
                Instruction::Literal(bytes) => out.extend_from_slice(bytes),
            }
        }
        out
    }

    fn patterned(len: usize, seed: u32) -> Vec<u8> {
        // Deterministic pseudo-random bytes; xorshift keeps blocks distinct.
        let mut state = seed | 1;
        (0..len)
            .map(|_| {
                state ^= state << 13;
                state ^= state >> 17;
                state ^= state << 5;
                (state >> 24) as u8
            })
            .collect()
    }

    #[test]
    fn identical_files_are_pure_copies() {
        let basis = patterned(64 * 1024, 7);
        let (sigs, index) = index_for(&basis, 4096);
        let (instructions, digest, summary) = run_matcher(&basis, index);
        assert!(instructions
            .iter()
            .all(|i| matches!(i, Instruction::Copy { .. })));
        assert_eq!(instructions.len(), 16);
        assert_eq!(summary.literal_bytes, 0);
        assert_eq!(summary.copy_bytes, basis.len() as u64);
        assert_eq!(apply(&basis, &sigs, &instructions), basis);
        assert_eq!(digest, block_digest(&basis));
    }

    #[test]
    fn empty_index_streams_pure_literals() {
        let source = patterned(3 * MAX_LITERAL / 2, 11);
        let index = SignatureIndex::build(&[], 4096);
        let (instructions, _, summary) = run_matcher(&source, index);
        assert_eq!(instructions.len(), 2);
        match (&instructions[0], &instructions[1]) {
            (Instruction::Literal(a), Instruction::Literal(b)) => {
                assert_eq!(a.len(), MAX_LITERAL);
                assert_eq!(a.len() + b.len(), source.len());
            }
            other => panic!("expected two literals, got {other:?}"),
        }
        assert_eq!(summary.literal_bytes, source.len() as u64);
    }

    #[test]
    fn empty_source_yields_no_instructions() {
        let basis = patterned(8192, 3);
        let (_, index) = index_for(&basis, 4096);
        let (instructions, digest, _) = run_matcher(&[], index);
        assert!(instructions.is_empty());
        assert_eq!(digest, block_digest(&[]));
    }

    #[test]
    fn tail_append_copies_every_block_once() {
        // E3 shape: source = basis + appended tail.
        let basis = patterned(2 * 1024 * 1024, 21);
        let tail = patterned(10 * 1024, 22);
        let mut source = basis.clone();
        source.extend_from_slice(&tail);

        let block = 128 * 1024;
        let (sigs, index) = index_for(&basis, block);
        let (instructions, _, summary) = run_matcher(&source, index);

        let copies = instructions
            .iter()
            .filter(|i| matches!(i, Instruction::Copy { .. }))
            .count();
        assert_eq!(copies, 16);
        assert_eq!(summary.literal_bytes, 10 * 1024);
        assert_eq!(apply(&basis, &sigs, &instructions), source);
    }

    #[test]
    fn middle_overwrite_bounds_literal_span() {
        // E4 shape: 1 MiB file, 512 bytes replaced at offset 512 KiB.
        let block = 128 * 1024usize;
        let basis = patterned(1024 * 1024, 31);
        let mut source = basis.clone();
        let patch = patterned(512, 32);
        source[524_288..524_800].copy_from_slice(&patch);

        let (sigs, index) = index_for(&basis, block as u64);
        let (instructions, _, summary) = run_matcher(&source, index);

        assert_eq!(apply(&basis, &sigs, &instructions), source);
        // Blocks 0-3 and the unchanged tail come back as copies; the dirty
        // region costs at most one block plus the patch in literals.
        assert!(summary.literal_bytes <= (block + 512 - 1) as u64);
        let copies = instructions
            .iter()
            .filter(|i| matches!(i, Instruction::Copy { .. }))
            .count();
        assert!(copies >= 7, "expected at least 7 copies, got {copies}");
    }

    #[test]
    fn short_tail_block_still_matches() {
        // Basis ends with a short block; source appends beyond it. The
        // short block must match mid-stream even though the remaining
        // source there is longer than the short length.
        let block = 4096u64;
        let mut basis = patterned(2 * 4096, 41);
        basis.extend_from_slice(&patterned(1000, 42));
        let mut source = basis.clone();
        source.extend_from_slice(&patterned(500, 43));

        let (sigs, index) = index_for(&basis, block);
        let (instructions, _, summary) = run_matcher(&source, index);

        assert_eq!(apply(&basis, &sigs, &instructions), source);
        assert_eq!(summary.copy_bytes, basis.len() as u64);
        assert_eq!(summary.literal_bytes, 500);
    }

    #[test]
    fn basis_smaller_than_one_block_matches_as_single_window() {
        // Source under 128 KiB uses a single block equal to the basis size.
        let basis = patterned(6000, 51);
        let mut source = basis.clone();
        source.extend_from_slice(b"tail");
        let (sigs, index) = index_for(&basis, basis.len() as u64);
        let (instructions, _, _) = run_matcher(&source, index);
        assert_eq!(apply(&basis, &sigs, &instructions), source);
        assert!(matches!(
            instructions[0],
            Instruction::Copy { block_index: 0, .. }
        ));
    }

    #[test]
    fn random_edits_reconstruct_exactly() {
        let block = 4096u64;
        let basis = patterned(80_000, 61);
        for seed in [1u32, 2, 3, 4] {
            let mut source = basis.clone();
            // Shift, edit, and truncate in different combinations.
            let edits = patterned(200, seed + 70);
            let at = (seed as usize * 13_577) % 60_000;
            source.splice(at..at, edits.iter().copied());
            if seed % 2 == 0 {
                source.truncate(source.len() - 5_000);
            }
            let (sigs, index) = index_for(&basis, block);
            let (instructions, digest, _) = run_matcher(&source, index);
            assert_eq!(apply(&basis, &sigs, &instructions), source, "seed {seed}");
            assert_eq!(digest, block_digest(&source), "seed {seed}");
        }
    }

    #[test]
    fn greedy_takes_earliest_block_on_ties() {
        // Identical blocks in the basis: the matcher must pick the lowest
        // index deterministically.
        let blockful = patterned(4096, 81);
        let mut basis = blockful.clone();
        basis.extend_from_slice(&blockful);
        let (_, index) = index_for(&basis, 4096);
        let (instructions, _, _) = run_matcher(&blockful, index);
        assert_eq!(
            instructions,
            vec![Instruction::Copy {
                block_index: 0,
                len: 4096
            }]
        );
    }
}

//! Typed frame payloads
//!
//! Field-level encoding for every frame body. All integers are unsigned
//! big-endian; strings are UTF-8 with a u16 length prefix. Decoders work
//! off a cursor and turn any truncation or garbage into `ProtocolError`,
//! never a panic.

use std::io::Read;

use crate::error::{Result, SyncError};
use crate::stats::TransferStats;
use crate::walk::{FileEntry, FileKind};

/// Magic prefix of the HELLO payload.
pub const MAGIC: [u8; 4] = *b"PSYN";

/// Feature bits carried in HELLO.
pub mod feature {
    pub const COMPRESSION: u32 = 1 << 0;
    pub const CHECKSUM_MODE: u32 = 1 << 1;
    pub const DELETE_EXTRANEOUS: u32 = 1 << 2;
    pub const DRY_RUN: u32 = 1 << 3;
    pub const UPDATE_ONLY: u32 = 1 << 4;
}

/// Receiver's per-file classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum VerdictAction {
    Skip = 0,
    Full = 1,
    Delta = 2,
}

impl VerdictAction {
    fn from_u8(v: u8) -> Result<Self> {
        match v {
            0 => Ok(Self::Skip),
            1 => Ok(Self::Full),
            2 => Ok(Self::Delta),
            other => Err(SyncError::Protocol(format!("unknown verdict {other}"))),
        }
    }
}

/// Receiver's acknowledgement of one reconstructed file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum AckStatus {
    Ok = 0,
    /// Whole-file hash mismatched; sender should resend as full literals.
    RetryFull = 1,
    /// Second failure; the file is abandoned for this session.
    Failed = 2,
}

impl AckStatus {
    fn from_u8(v: u8) -> Result<Self> {
        match v {
            0 => Ok(Self::Ok),
            1 => Ok(Self::RetryFull),
            2 => Ok(Self::Failed),
            other => Err(SyncError::Protocol(format!("unknown ack status {other}"))),
        }
    }
}

// ============================================================================
// Field primitives
// ============================================================================

struct Reader<'a> {
    cursor: std::io::Cursor<&'a [u8]>,
}

impl<'a> Reader<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self {
            cursor: std::io::Cursor::new(data),
        }
    }

    fn bytes(&mut self, n: usize) -> Result<Vec<u8>> {
        let mut buf = vec![0u8; n];
        self.cursor
            .read_exact(&mut buf)
            .map_err(|_| SyncError::Protocol("truncated payload".to_string()))?;
        Ok(buf)
    }

    fn u8(&mut self) -> Result<u8> {
        Ok(self.bytes(1)?[0])
    }

    fn u16(&mut self) -> Result<u16> {
        let b = self.bytes(2)?;
        Ok(u16::from_be_bytes([b[0], b[1]]))
    }

    fn u32(&mut self) -> Result<u32> {
        let b = self.bytes(4)?;
        Ok(u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn u64(&mut self) -> Result<u64> {
        let b = self.bytes(8)?;
        let mut raw = [0u8; 8];
        raw.copy_from_slice(&b);
        Ok(u64::from_be_bytes(raw))
    }

    fn i64(&mut self) -> Result<i64> {
        Ok(self.u64()? as i64)
    }

    fn u128(&mut self) -> Result<u128> {
        let b = self.bytes(16)?;
        let mut raw = [0u8; 16];
        raw.copy_from_slice(&b);
        Ok(u128::from_be_bytes(raw))
    }

    fn string(&mut self) -> Result<String> {
        let len = self.u16()? as usize;
        let raw = self.bytes(len)?;
        String::from_utf8(raw)
            .map_err(|_| SyncError::Protocol("invalid UTF-8 in string field".to_string()))
    }

    /// Every decoder must consume its payload exactly.
    fn expect_end(&mut self) -> Result<()> {
        if self.cursor.position() == self.cursor.get_ref().len() as u64 {
            Ok(())
        } else {
            Err(SyncError::Protocol("trailing bytes in payload".to_string()))
        }
    }
}

fn put_string(out: &mut Vec<u8>, s: &str) -> Result<()> {
    let bytes = s.as_bytes();
    if bytes.len() > usize::from(u16::MAX) {
        return Err(SyncError::Protocol(format!(
            "string field of {} bytes exceeds u16 prefix",
            bytes.len()
        )));
    }
    out.extend_from_slice(&(bytes.len() as u16).to_be_bytes());
    out.extend_from_slice(bytes);
    Ok(())
}

// ============================================================================
// HELLO
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Hello {
    pub version: u16,
    pub features: u32,
}

pub fn encode_hello(hello: &Hello) -> Vec<u8> {
    let mut out = Vec::with_capacity(10);
    out.extend_from_slice(&MAGIC);
    out.extend_from_slice(&hello.version.to_be_bytes());
    out.extend_from_slice(&hello.features.to_be_bytes());
    out
}

pub fn decode_hello(payload: &[u8]) -> Result<Hello> {
    let mut r = Reader::new(payload);
    let magic = r.bytes(4)?;
    if magic != MAGIC {
        return Err(SyncError::Protocol("bad HELLO magic".to_string()));
    }
    let version = r.u16()?;
    let features = r.u32()?;
    r.expect_end()?;
    Ok(Hello { version, features })
}

// ============================================================================
// MANIFEST_ENTRY
// ============================================================================

pub fn encode_manifest_entry(entry: &FileEntry) -> Result<Vec<u8>> {
    let mut out = Vec::with_capacity(40 + entry.path.len());
    put_string(&mut out, &entry.path)?;
    out.push(entry.kind as u8);
    out.extend_from_slice(&entry.size.to_be_bytes());
    out.extend_from_slice(&entry.mtime_ns.to_be_bytes());
    out.extend_from_slice(&entry.mode.to_be_bytes());
    put_string(&mut out, entry.symlink_target.as_deref().unwrap_or(""))?;
    // Whole-file hash rides along only in checksum mode.
    if let Some(hash) = entry.whole_file_hash {
        out.extend_from_slice(&hash.to_be_bytes());
    }
    Ok(out)
}

pub fn decode_manifest_entry(payload: &[u8], checksum_mode: bool) -> Result<FileEntry> {
    let mut r = Reader::new(payload);
    let path = r.string()?;
    let kind = FileKind::from_u8(r.u8()?)?;
    let size = r.u64()?;
    let mtime_ns = r.i64()?;
    let mode = r.u32()?;
    let target = r.string()?;
    let whole_file_hash = if checksum_mode && kind == FileKind::Regular {
        Some(r.u128()?)
    } else {
        None
    };
    r.expect_end()?;
    Ok(FileEntry {
        path,
        kind,
        size,
        mtime_ns,
        mode,
        symlink_target: if target.is_empty() { None } else { Some(target) },
        whole_file_hash,
    })
}

// ============================================================================
// VERDICT / FILE_ACK
// ============================================================================

pub fn encode_verdict(index: u32, action: VerdictAction) -> Vec<u8> {
    let mut out = Vec::with_capacity(5);
    out.extend_from_slice(&index.to_be_bytes());
    out.push(action as u8);
    out
}

pub fn decode_verdict(payload: &[u8]) -> Result<(u32, VerdictAction)> {
    let mut r = Reader::new(payload);
    let index = r.u32()?;
    let action = VerdictAction::from_u8(r.u8()?)?;
    r.expect_end()?;
    Ok((index, action))
}

pub fn encode_file_ack(index: u32, status: AckStatus) -> Vec<u8> {
    let mut out = Vec::with_capacity(5);
    out.extend_from_slice(&index.to_be_bytes());
    out.push(status as u8);
    out
}

pub fn decode_file_ack(payload: &[u8]) -> Result<(u32, AckStatus)> {
    let mut r = Reader::new(payload);
    let index = r.u32()?;
    let status = AckStatus::from_u8(r.u8()?)?;
    r.expect_end()?;
    Ok((index, status))
}

// ============================================================================
// SIG_BLOCK / SIG_END
// ============================================================================

use crate::engine::signature::BlockSignature;

pub fn encode_sig_block(sig: &BlockSignature) -> Vec<u8> {
    let mut out = Vec::with_capacity(32);
    out.extend_from_slice(&sig.offset.to_be_bytes());
    out.extend_from_slice(&sig.len.to_be_bytes());
    out.extend_from_slice(&sig.weak.to_be_bytes());
    out.extend_from_slice(&sig.strong.to_be_bytes());
    out
}

pub fn decode_sig_block(payload: &[u8]) -> Result<BlockSignature> {
    let mut r = Reader::new(payload);
    let offset = r.u64()?;
    let len = r.u32()?;
    let weak = r.u32()?;
    let strong = r.u128()?;
    r.expect_end()?;
    Ok(BlockSignature {
        offset,
        len,
        weak,
        strong,
    })
}

// ============================================================================
// INSTR_COPY / FILE_END
// ============================================================================

pub fn encode_instr_copy(block_index: u32, len: u32) -> Vec<u8> {
    let mut out = Vec::with_capacity(8);
    out.extend_from_slice(&block_index.to_be_bytes());
    out.extend_from_slice(&len.to_be_bytes());
    out
}

pub fn decode_instr_copy(payload: &[u8]) -> Result<(u32, u32)> {
    let mut r = Reader::new(payload);
    let block_index = r.u32()?;
    let len = r.u32()?;
    r.expect_end()?;
    Ok((block_index, len))
}

/// `aborted` marks a stream the sender had to give up on (source file
/// vanished or turned unreadable mid-read); the receiver discards the
/// partial reconstruction instead of verifying it.
pub fn encode_file_end(index: u32, digest: u128, aborted: bool) -> Vec<u8> {
    let mut out = Vec::with_capacity(21);
    out.extend_from_slice(&index.to_be_bytes());
    out.extend_from_slice(&digest.to_be_bytes());
    out.push(u8::from(aborted));
    out
}

pub fn decode_file_end(payload: &[u8]) -> Result<(u32, u128, bool)> {
    let mut r = Reader::new(payload);
    let index = r.u32()?;
    let digest = r.u128()?;
    let aborted = match r.u8()? {
        0 => false,
        1 => true,
        other => {
            return Err(SyncError::Protocol(format!(
                "bad FILE_END flag {other}"
            )))
        }
    };
    r.expect_end()?;
    Ok((index, digest, aborted))
}

// ============================================================================
// ERROR / COMPRESSION_HINT
// ============================================================================

pub fn encode_error(code: u8, message: &str) -> Result<Vec<u8>> {
    let mut out = Vec::with_capacity(3 + message.len());
    out.push(code);
    put_string(&mut out, message)?;
    Ok(out)
}

pub fn decode_error(payload: &[u8]) -> Result<(u8, String)> {
    let mut r = Reader::new(payload);
    let code = r.u8()?;
    let message = r.string()?;
    r.expect_end()?;
    Ok((code, message))
}

pub fn encode_compression_hint(level: u8) -> Vec<u8> {
    vec![level]
}

pub fn decode_compression_hint(payload: &[u8]) -> Result<u8> {
    let mut r = Reader::new(payload);
    let level = r.u8()?;
    r.expect_end()?;
    Ok(level)
}

// ============================================================================
// STATS
// ============================================================================

pub fn encode_stats(stats: &TransferStats) -> Vec<u8> {
    let mut out = Vec::with_capacity(72);
    for v in [
        stats.source_bytes_read,
        stats.literal_bytes,
        stats.copy_bytes_elided,
        stats.wire_bytes_sent,
        stats.frames_sent,
        stats.frames_received,
        stats.files_skipped,
        stats.files_transferred,
        stats.files_failed,
    ] {
        out.extend_from_slice(&v.to_be_bytes());
    }
    out
}

pub fn decode_stats(payload: &[u8]) -> Result<TransferStats> {
    let mut r = Reader::new(payload);
    let stats = TransferStats {
        source_bytes_read: r.u64()?,
        literal_bytes: r.u64()?,
        copy_bytes_elided: r.u64()?,
        wire_bytes_sent: r.u64()?,
        frames_sent: r.u64()?,
        frames_received: r.u64()?,
        files_skipped: r.u64()?,
        files_transferred: r.u64()?,
        files_failed: r.u64()?,
        ..TransferStats::default()
    };
    r.expect_end()?;
    Ok(stats)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry() -> FileEntry {
        FileEntry {
            path: "b/c.bin".to_string(),
            kind: FileKind::Regular,
            size: 2 * 1024 * 1024,
            mtime_ns: 1_700_000_000_000_000_001,
            mode: 0o644,
            symlink_target: None,
            whole_file_hash: None,
        }
    }

    #[test]
    fn hello_round_trip() {
        let hello = Hello {
            version: 1,
            features: feature::COMPRESSION | feature::DELETE_EXTRANEOUS,
        };
        assert_eq!(decode_hello(&encode_hello(&hello)).unwrap(), hello);
    }

    #[test]
    fn hello_bad_magic_rejected() {
        let mut payload = encode_hello(&Hello {
            version: 1,
            features: 0,
        });
        payload[0] = b'X';
        assert!(matches!(
            decode_hello(&payload),
            Err(SyncError::Protocol(_))
        ));
    }

    #[test]
    fn manifest_entry_round_trip() {
        let e = entry();
        let decoded = decode_manifest_entry(&encode_manifest_entry(&e).unwrap(), false).unwrap();
        assert_eq!(decoded, e);
    }

    #[test]
    fn manifest_entry_symlink_round_trip() {
        let e = FileEntry {
            path: "link".to_string(),
            kind: FileKind::Symlink,
            size: 0,
            mtime_ns: -5,
            mode: 0o777,
            symlink_target: Some("../target".to_string()),
            whole_file_hash: None,
        };
        let decoded = decode_manifest_entry(&encode_manifest_entry(&e).unwrap(), false).unwrap();
        assert_eq!(decoded, e);
    }

    #[test]
    fn manifest_entry_checksum_mode_carries_hash() {
        let mut e = entry();
        e.whole_file_hash = Some(0x0123_4567_89AB_CDEF_0123_4567_89AB_CDEF);
        let payload = encode_manifest_entry(&e).unwrap();
        let decoded = decode_manifest_entry(&payload, true).unwrap();
        assert_eq!(decoded.whole_file_hash, e.whole_file_hash);
        // The same bytes without checksum mode are trailing garbage.
        assert!(matches!(
            decode_manifest_entry(&payload, false),
            Err(SyncError::Protocol(_))
        ));
    }

    #[test]
    fn verdict_and_ack_round_trip() {
        for action in [VerdictAction::Skip, VerdictAction::Full, VerdictAction::Delta] {
            let (i, a) = decode_verdict(&encode_verdict(9, action)).unwrap();
            assert_eq!((i, a), (9, action));
        }
        for status in [AckStatus::Ok, AckStatus::RetryFull, AckStatus::Failed] {
            let (i, s) = decode_file_ack(&encode_file_ack(3, status)).unwrap();
            assert_eq!((i, s), (3, status));
        }
        assert!(decode_verdict(&[0, 0, 0, 1, 9]).is_err());
    }

    #[test]
    fn sig_block_round_trip() {
        let sig = BlockSignature {
            offset: 1 << 40,
            len: 128 * 1024,
            weak: 0xDEAD_BEEF,
            strong: u128::MAX - 7,
        };
        assert_eq!(decode_sig_block(&encode_sig_block(&sig)).unwrap(), sig);
    }

    #[test]
    fn file_end_and_copy_round_trip() {
        assert_eq!(
            decode_instr_copy(&encode_instr_copy(12, 4096)).unwrap(),
            (12, 4096)
        );
        assert_eq!(
            decode_file_end(&encode_file_end(2, 42, false)).unwrap(),
            (2, 42, false)
        );
        assert_eq!(
            decode_file_end(&encode_file_end(7, 0, true)).unwrap(),
            (7, 0, true)
        );
    }

    #[test]
    fn error_round_trip() {
        let payload = encode_error(5, "hash mismatch on a/b").unwrap();
        assert_eq!(
            decode_error(&payload).unwrap(),
            (5, "hash mismatch on a/b".to_string())
        );
    }

    #[test]
    fn stats_round_trip() {
        let stats = TransferStats {
            source_bytes_read: 1,
            literal_bytes: 2,
            copy_bytes_elided: 3,
            wire_bytes_sent: 4,
            frames_sent: 5,
            frames_received: 6,
            files_skipped: 7,
            files_transferred: 8,
            files_failed: 9,
            ..TransferStats::default()
        };
        let decoded = decode_stats(&encode_stats(&stats)).unwrap();
        assert_eq!(decoded.literal_bytes, 2);
        assert_eq!(decoded.files_failed, 9);
    }

    #[test]
    fn truncated_payloads_are_protocol_errors() {
        let payload = encode_sig_block(&BlockSignature {
            offset: 0,
            len: 1,
            weak: 2,
            strong: 3,
        });
        for cut in 0..payload.len() {
            assert!(
                matches!(
                    decode_sig_block(&payload[..cut]),
                    Err(SyncError::Protocol(_))
                ),
                "cut at {cut}"
            );
        }
    }
}

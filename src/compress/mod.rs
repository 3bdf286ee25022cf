//! Streaming compression layer
//!
//! When the compression feature is negotiated, data-bearing frame
//! payloads are compressed independently with zstd and prefixed with a
//! one-byte method marker, so every frame stays self-describing and the
//! level can change at any frame boundary. Tiny or incompressible
//! payloads ship raw; control frames are never compressed.

pub mod controller;

use crate::error::{Result, SyncError};
use crate::protocol::frame::{FrameTag, MAX_PAYLOAD};

/// Method marker: payload bytes follow unmodified.
const METHOD_RAW: u8 = 0;
/// Method marker: zstd-compressed payload.
const METHOD_ZSTD: u8 = 1;

/// Payloads smaller than this never benefit from compression.
const MIN_COMPRESS_LEN: usize = 64;

/// Tags whose payloads go through the compressor when negotiated.
///
/// Control frames (hello, verdicts, acks, hints, errors) stay raw so the
/// two sides can always talk even about compression itself.
#[must_use]
pub const fn is_compressible(tag: FrameTag) -> bool {
    matches!(
        tag,
        FrameTag::ManifestEntry | FrameTag::SigBlock | FrameTag::InstrLiteral | FrameTag::Stats
    )
}

/// Wrap a payload for the wire at the given zstd level.
///
/// Falls back to the raw method when compression would not shrink the
/// payload.
pub fn compress_payload(payload: &[u8], level: i32) -> Result<Vec<u8>> {
    if payload.len() >= MIN_COMPRESS_LEN {
        let compressed = zstd::bulk::compress(payload, level)?;
        if compressed.len() + 1 < payload.len() {
            let mut out = Vec::with_capacity(compressed.len() + 1);
            out.push(METHOD_ZSTD);
            out.extend_from_slice(&compressed);
            return Ok(out);
        }
    }
    let mut out = Vec::with_capacity(payload.len() + 1);
    out.push(METHOD_RAW);
    out.extend_from_slice(payload);
    Ok(out)
}

/// Undo [`compress_payload`].
pub fn decompress_payload(wrapped: &[u8]) -> Result<Vec<u8>> {
    let (&method, body) = wrapped
        .split_first()
        .ok_or_else(|| SyncError::Protocol("empty compressed payload".to_string()))?;
    match method {
        METHOD_RAW => Ok(body.to_vec()),
        METHOD_ZSTD => zstd::bulk::decompress(body, MAX_PAYLOAD)
            .map_err(|e| SyncError::Protocol(format!("zstd decompression failed: {e}"))),
        other => Err(SyncError::Protocol(format!(
            "unknown compression method {other}"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn compressible_payload_round_trips_smaller() {
        let payload = vec![b'a'; 64 * 1024];
        let wrapped = compress_payload(&payload, 3).unwrap();
        assert_eq!(wrapped[0], METHOD_ZSTD);
        assert!(wrapped.len() < payload.len() / 4);
        assert_eq!(decompress_payload(&wrapped).unwrap(), payload);
    }

    #[test]
    fn tiny_payload_ships_raw() {
        let payload = b"verdict".to_vec();
        let wrapped = compress_payload(&payload, 19).unwrap();
        assert_eq!(wrapped[0], METHOD_RAW);
        assert_eq!(decompress_payload(&wrapped).unwrap(), payload);
    }

    #[test]
    fn incompressible_payload_ships_raw() {
        // xorshift noise does not compress; the raw fallback keeps the
        // frame within one byte of the original.
        let mut state = 0x9E37_79B9u32;
        let payload: Vec<u8> = (0..4096)
            .map(|_| {
                state ^= state << 13;
                state ^= state >> 17;
                state ^= state << 5;
                (state >> 24) as u8
            })
            .collect();
        let wrapped = compress_payload(&payload, 3).unwrap();
        assert_eq!(wrapped[0], METHOD_RAW);
        assert_eq!(wrapped.len(), payload.len() + 1);
    }

    #[test]
    fn level_changes_do_not_affect_decoding() {
        let payload = vec![7u8; 10_000];
        for level in [1, 3, 10, 19] {
            let wrapped = compress_payload(&payload, level).unwrap();
            assert_eq!(decompress_payload(&wrapped).unwrap(), payload);
        }
    }

    #[test]
    fn garbage_method_rejected() {
        assert!(matches!(
            decompress_payload(&[9, 1, 2, 3]),
            Err(SyncError::Protocol(_))
        ));
        assert!(matches!(
            decompress_payload(&[]),
            Err(SyncError::Protocol(_))
        ));
    }

    #[test]
    fn control_tags_stay_raw() {
        assert!(!is_compressible(FrameTag::Hello));
        assert!(!is_compressible(FrameTag::Verdict));
        assert!(!is_compressible(FrameTag::CompressionHint));
        assert!(is_compressible(FrameTag::InstrLiteral));
        assert!(is_compressible(FrameTag::SigBlock));
    }
}

//! Frame codec
//!
//! Every protocol message is one frame: `tag (1 byte) ‖ length (u32,
//! big-endian, at most 2^24) ‖ payload`. Frames are strictly ordered per
//! direction and never interleave across files; the tag set is closed.

use tracing::trace;

use super::transport::{self, TransportReader, TransportWriter};
use crate::error::{Result, SyncError};

/// Hard cap on a frame payload (16 MiB). Literal payloads are capped much
/// lower by the matcher; this bound is what the decoder enforces.
pub const MAX_PAYLOAD: usize = 1 << 24;

/// Closed set of frame tags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum FrameTag {
    Hello = 0x01,
    ManifestEntry = 0x02,
    ManifestEnd = 0x03,
    Verdict = 0x04,
    SigBlock = 0x05,
    SigEnd = 0x06,
    InstrCopy = 0x07,
    InstrLiteral = 0x08,
    FileEnd = 0x09,
    FileAck = 0x0A,
    Stats = 0x0B,
    Error = 0x0C,
    CompressionHint = 0x0D,
}

impl FrameTag {
    /// Decode a tag byte; unknown values are a protocol error.
    pub fn from_u8(tag: u8) -> Result<Self> {
        match tag {
            0x01 => Ok(Self::Hello),
            0x02 => Ok(Self::ManifestEntry),
            0x03 => Ok(Self::ManifestEnd),
            0x04 => Ok(Self::Verdict),
            0x05 => Ok(Self::SigBlock),
            0x06 => Ok(Self::SigEnd),
            0x07 => Ok(Self::InstrCopy),
            0x08 => Ok(Self::InstrLiteral),
            0x09 => Ok(Self::FileEnd),
            0x0A => Ok(Self::FileAck),
            0x0B => Ok(Self::Stats),
            0x0C => Ok(Self::Error),
            0x0D => Ok(Self::CompressionHint),
            other => Err(SyncError::Protocol(format!("unknown frame tag {other:#04x}"))),
        }
    }
}

/// One decoded frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub tag: FrameTag,
    pub payload: Vec<u8>,
}

impl Frame {
    #[must_use]
    pub fn new(tag: FrameTag, payload: Vec<u8>) -> Self {
        Self { tag, payload }
    }

    /// Serialize header + payload into one buffer.
    pub fn encode(&self) -> Result<Vec<u8>> {
        if self.payload.len() > MAX_PAYLOAD {
            return Err(SyncError::Protocol(format!(
                "frame payload of {} bytes exceeds {MAX_PAYLOAD}",
                self.payload.len()
            )));
        }
        let mut out = Vec::with_capacity(5 + self.payload.len());
        out.push(self.tag as u8);
        out.extend_from_slice(&(self.payload.len() as u32).to_be_bytes());
        out.extend_from_slice(&self.payload);
        Ok(out)
    }

    /// Decode a frame from a contiguous buffer (tests and tools).
    pub fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() < 5 {
            return Err(SyncError::Protocol("frame shorter than header".to_string()));
        }
        let tag = FrameTag::from_u8(buf[0])?;
        let len = u32::from_be_bytes([buf[1], buf[2], buf[3], buf[4]]) as usize;
        if len > MAX_PAYLOAD {
            return Err(SyncError::Protocol(format!(
                "frame length {len} exceeds {MAX_PAYLOAD}"
            )));
        }
        if buf.len() != 5 + len {
            return Err(SyncError::Protocol(format!(
                "frame length {len} does not match buffer of {}",
                buf.len() - 5
            )));
        }
        Ok(Self::new(tag, buf[5..].to_vec()))
    }
}

/// Write one frame to the transport.
pub async fn write_frame<W: TransportWriter>(writer: &mut W, frame: &Frame) -> Result<()> {
    trace!("send frame {:?} ({} bytes)", frame.tag, frame.payload.len());
    transport::write_all(writer, frame.encode()?).await
}

/// Read one frame; `None` on a clean EOF between frames.
pub async fn read_frame<R: TransportReader>(reader: &mut R) -> Result<Option<Frame>> {
    let Some(header) = transport::read_exact_or_eof(reader, 5).await? else {
        return Ok(None);
    };
    let tag = FrameTag::from_u8(header[0])?;
    let len = u32::from_be_bytes([header[1], header[2], header[3], header[4]]) as usize;
    if len > MAX_PAYLOAD {
        return Err(SyncError::Protocol(format!(
            "frame length {len} exceeds {MAX_PAYLOAD}"
        )));
    }
    let payload = if len == 0 {
        Vec::new()
    } else {
        transport::read_exact(reader, len).await?
    };
    trace!("recv frame {tag:?} ({len} bytes)");
    Ok(Some(Frame::new(tag, payload)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encode_decode_round_trip() {
        for (tag, payload) in [
            (FrameTag::Hello, b"PSYN....".to_vec()),
            (FrameTag::ManifestEnd, Vec::new()),
            (FrameTag::InstrLiteral, vec![0u8; 1024]),
        ] {
            let frame = Frame::new(tag, payload);
            let decoded = Frame::decode(&frame.encode().unwrap()).unwrap();
            assert_eq!(decoded, frame);
        }
    }

    #[test]
    fn unknown_tag_is_protocol_error() {
        assert!(matches!(
            FrameTag::from_u8(0x00),
            Err(SyncError::Protocol(_))
        ));
        assert!(matches!(
            FrameTag::from_u8(0x0E),
            Err(SyncError::Protocol(_))
        ));
        let mut bytes = Frame::new(FrameTag::Hello, vec![]).encode().unwrap();
        bytes[0] = 0xFF;
        assert!(matches!(Frame::decode(&bytes), Err(SyncError::Protocol(_))));
    }

    #[test]
    fn oversized_payload_rejected_on_encode() {
        let frame = Frame::new(FrameTag::InstrLiteral, vec![0u8; MAX_PAYLOAD + 1]);
        assert!(matches!(frame.encode(), Err(SyncError::Protocol(_))));
    }

    #[test]
    fn oversized_length_rejected_on_decode() {
        let mut bytes = vec![FrameTag::InstrLiteral as u8];
        bytes.extend_from_slice(&u32::MAX.to_be_bytes());
        assert!(matches!(Frame::decode(&bytes), Err(SyncError::Protocol(_))));
    }

    #[test]
    fn truncated_payload_rejected() {
        let frame = Frame::new(FrameTag::SigBlock, vec![1, 2, 3, 4]);
        let bytes = frame.encode().unwrap();
        assert!(matches!(
            Frame::decode(&bytes[..bytes.len() - 1]),
            Err(SyncError::Protocol(_))
        ));
    }

    #[compio::test]
    async fn frames_cross_a_pipe() {
        use crate::protocol::pipe::PipeTransport;
        let (a, b) = PipeTransport::pair().unwrap();
        let (_, mut a_write) = a.into_split();
        let (mut b_read, _) = b.into_split();

        let frame = Frame::new(FrameTag::Verdict, vec![0, 0, 0, 7, 2]);
        write_frame(&mut a_write, &frame).await.unwrap();
        let got = read_frame(&mut b_read).await.unwrap().unwrap();
        assert_eq!(got, frame);

        drop(a_write);
        assert!(read_frame(&mut b_read).await.unwrap().is_none());
    }
}

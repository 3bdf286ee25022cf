//! Transport abstraction for the sync protocol
//!
//! The wire protocol runs over any pair of reliable, in-order byte
//! streams: an OS pipe pair in local mode, the stdio of a spawned remote
//! shell in remote mode, stdin/stdout in server mode. The reader half and
//! writer half are owned by different tasks, so the abstraction is split
//! accordingly.
//!
//! Buffers are passed by value and returned, following the owned-buffer
//! I/O model of the compio runtime underneath; data always lands at the
//! front of the buffer.

use std::io;

use crate::error::{Result, SyncError};

/// Readable half of a session transport.
pub trait TransportReader: 'static {
    /// Read up to `buf.len()` bytes into the front of `buf`.
    ///
    /// Returns the byte count (0 means EOF) and gives the buffer back.
    fn read_buf(
        &mut self,
        buf: Vec<u8>,
    ) -> impl std::future::Future<Output = (io::Result<usize>, Vec<u8>)>;
}

/// Writable half of a session transport.
pub trait TransportWriter: 'static {
    /// Write from the front of `buf`; may be partial.
    fn write_buf(
        &mut self,
        buf: Vec<u8>,
    ) -> impl std::future::Future<Output = (io::Result<usize>, Vec<u8>)>;

    fn flush(&mut self) -> impl std::future::Future<Output = io::Result<()>>;
}

/// Read exactly `len` bytes, or fail.
///
/// EOF mid-read is a protocol error: frames are never legally truncated.
pub async fn read_exact<R: TransportReader>(reader: &mut R, len: usize) -> Result<Vec<u8>> {
    match read_exact_or_eof(reader, len).await? {
        Some(buf) => Ok(buf),
        None => Err(SyncError::Protocol(
            "unexpected EOF on transport".to_string(),
        )),
    }
}

/// Read exactly `len` bytes, or `None` on a clean EOF at the first byte.
///
/// EOF after at least one byte has arrived is still a protocol error.
pub async fn read_exact_or_eof<R: TransportReader>(
    reader: &mut R,
    len: usize,
) -> Result<Option<Vec<u8>>> {
    let mut out = Vec::with_capacity(len);
    while out.len() < len {
        let want = len - out.len();
        let (res, scratch) = reader.read_buf(vec![0u8; want]).await;
        let n = res?;
        if n == 0 {
            if out.is_empty() {
                return Ok(None);
            }
            return Err(SyncError::Protocol(format!(
                "transport closed mid-read ({} of {len} bytes)",
                out.len()
            )));
        }
        out.extend_from_slice(&scratch[..n]);
    }
    Ok(Some(out))
}

/// Write all of `buf`.
pub async fn write_all<W: TransportWriter>(writer: &mut W, mut buf: Vec<u8>) -> Result<()> {
    while !buf.is_empty() {
        let (res, mut returned) = writer.write_buf(buf).await;
        let n = res?;
        if n == 0 {
            return Err(SyncError::Io(io::Error::new(
                io::ErrorKind::WriteZero,
                "transport refused bytes",
            )));
        }
        returned.drain(..n);
        buf = returned;
    }
    Ok(())
}

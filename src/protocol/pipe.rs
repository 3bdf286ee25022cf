//! Pipe-based transport
//!
//! Wraps raw file descriptors as async byte streams via
//! `compio::fs::AsyncFd`, which routes reads and writes through the
//! runtime's io_uring (or fallback) driver. Covers three deployments:
//! stdin/stdout in `--server` mode, an in-process pipe pair in local mode
//! and tests, and arbitrary fd pairs handed over by a transport
//! bootstrap.

use std::io;
use std::os::fd::OwnedFd;
use std::os::unix::io::{FromRawFd, RawFd};

use compio::buf::BufResult;
use compio::fs::AsyncFd;
use compio::io::{AsyncRead, AsyncWrite};

use super::transport::{TransportReader, TransportWriter};

/// Readable pipe half.
pub struct PipeReader {
    fd: AsyncFd<OwnedFd>,
}

/// Writable pipe half.
pub struct PipeWriter {
    fd: AsyncFd<OwnedFd>,
}

/// A bidirectional transport made of two unidirectional fds.
pub struct PipeTransport {
    reader: PipeReader,
    writer: PipeWriter,
}

impl PipeTransport {
    /// Wrap stdin/stdout (server mode). The fds are duplicated so the
    /// process's own handles stay open.
    pub fn from_stdio() -> io::Result<Self> {
        let stdin_fd = unsafe { libc::dup(0) };
        let stdout_fd = unsafe { libc::dup(1) };
        if stdin_fd < 0 || stdout_fd < 0 {
            return Err(io::Error::last_os_error());
        }
        // SAFETY: both fds were just created by dup() and are owned here.
        unsafe { Self::from_fds(stdin_fd, stdout_fd) }
    }

    /// Wrap a (read, write) fd pair.
    ///
    /// # Safety
    ///
    /// Caller must ensure both fds are valid, open, and not closed
    /// elsewhere; ownership transfers to the transport.
    pub unsafe fn from_fds(read_fd: RawFd, write_fd: RawFd) -> io::Result<Self> {
        let read_owned = OwnedFd::from_raw_fd(read_fd);
        let write_owned = OwnedFd::from_raw_fd(write_fd);
        Ok(Self {
            reader: PipeReader {
                fd: AsyncFd::new(read_owned)?,
            },
            writer: PipeWriter {
                fd: AsyncFd::new(write_owned)?,
            },
        })
    }

    /// Two transports joined by a pair of OS pipes, for in-process local
    /// mode: bytes written on one side arrive on the other.
    pub fn pair() -> io::Result<(Self, Self)> {
        let (a_read, b_write) = raw_pipe()?;
        let (b_read, a_write) = raw_pipe()?;
        // SAFETY: all four fds were just created by pipe() and each is
        // handed to exactly one transport.
        let a = unsafe { Self::from_fds(a_read, a_write)? };
        let b = unsafe { Self::from_fds(b_read, b_write)? };
        Ok((a, b))
    }

    /// Split into halves so the reader and writer tasks can own them
    /// independently.
    #[must_use]
    pub fn into_split(self) -> (PipeReader, PipeWriter) {
        (self.reader, self.writer)
    }
}

/// Create one OS pipe, returning (read_fd, write_fd).
fn raw_pipe() -> io::Result<(RawFd, RawFd)> {
    let mut fds = [0i32; 2];
    unsafe {
        if libc::pipe(fds.as_mut_ptr()) != 0 {
            return Err(io::Error::last_os_error());
        }
    }
    Ok((fds[0], fds[1]))
}

impl TransportReader for PipeReader {
    async fn read_buf(&mut self, buf: Vec<u8>) -> (io::Result<usize>, Vec<u8>) {
        let BufResult(res, buf) = self.fd.read(buf).await;
        (res, buf)
    }
}

impl TransportWriter for PipeWriter {
    async fn write_buf(&mut self, buf: Vec<u8>) -> (io::Result<usize>, Vec<u8>) {
        let BufResult(res, buf) = self.fd.write(buf).await;
        (res, buf)
    }

    async fn flush(&mut self) -> io::Result<()> {
        AsyncWrite::flush(&mut self.fd).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::transport::{read_exact, write_all};

    #[test]
    fn raw_pipe_creates_distinct_fds() {
        let (read_fd, write_fd) = raw_pipe().unwrap();
        assert!(read_fd >= 0);
        assert!(write_fd >= 0);
        assert_ne!(read_fd, write_fd);
        unsafe {
            libc::close(read_fd);
            libc::close(write_fd);
        }
    }

    #[compio::test]
    async fn pair_carries_bytes_both_ways() {
        let (a, b) = PipeTransport::pair().unwrap();
        let (mut a_read, mut a_write) = a.into_split();
        let (mut b_read, mut b_write) = b.into_split();

        write_all(&mut a_write, b"ping".to_vec()).await.unwrap();
        let got = read_exact(&mut b_read, 4).await.unwrap();
        assert_eq!(got, b"ping");

        write_all(&mut b_write, b"pong!".to_vec()).await.unwrap();
        let got = read_exact(&mut a_read, 5).await.unwrap();
        assert_eq!(got, b"pong!");
    }
}
